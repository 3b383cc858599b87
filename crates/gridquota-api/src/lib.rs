//! gridquota-api: REST API for GridQuota.
//!
//! Provides axum route handlers for quota ledgers (group resource
//! placements), resource pools, resource descriptions, host inventory and
//! capacity-source reports.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/placements` | List ledgers (`?pool=` filters by pool) |
//! | POST | `/api/v1/placements` | Create a ledger |
//! | GET | `/api/v1/placements/{link}` | Get a ledger (`?expand=true` embeds its pool) |
//! | PUT | `/api/v1/placements/{link}` | Replace a ledger's declared fields |
//! | PATCH | `/api/v1/placements/{link}` | Reserve or release instances |
//! | DELETE | `/api/v1/placements/{link}` | Delete an idle ledger |
//! | GET, POST | `/api/v1/pools` | List / create resource pools |
//! | GET, PUT, DELETE | `/api/v1/pools/{link}` | Get / replace / delete a pool |
//! | GET, POST | `/api/v1/descriptions` | List / register resource descriptions |
//! | GET | `/api/v1/descriptions/{link}` | Get a resource description |
//! | GET, POST | `/api/v1/hosts` | List / register host inventory |
//! | DELETE | `/api/v1/hosts/{id}` | Remove a host |
//! | POST | `/api/v1/capacity` | Capacity-source report for a pool |
//!
//! Links may contain `/`; the link routes capture the rest of the path.

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use gridquota_capacity::CapacityHandle;
use gridquota_ledger::LedgerService;
use gridquota_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub ledger: Arc<LedgerService>,
    /// Feeds the capacity monitor; without it capacity work runs inline.
    pub capacity: Option<CapacityHandle>,
}

impl ApiState {
    pub fn new(ledger: Arc<LedgerService>, capacity: Option<CapacityHandle>) -> Self {
        Self {
            store: ledger.store().clone(),
            ledger,
            capacity,
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/placements",
            get(handlers::list_placements).post(handlers::create_placement),
        )
        .route(
            "/placements/{*link}",
            get(handlers::get_placement)
                .put(handlers::update_placement)
                .patch(handlers::reserve_placement)
                .delete(handlers::delete_placement),
        )
        .route("/pools", get(handlers::list_pools).post(handlers::create_pool))
        .route(
            "/pools/{*link}",
            get(handlers::get_pool)
                .put(handlers::replace_pool)
                .delete(handlers::delete_pool),
        )
        .route(
            "/descriptions",
            get(handlers::list_descriptions).post(handlers::register_description),
        )
        .route("/descriptions/{*link}", get(handlers::get_description))
        .route("/hosts", get(handlers::list_hosts).post(handlers::register_host))
        .route("/hosts/{id}", axum::routing::delete(handlers::delete_host))
        .route("/capacity", post(handlers::report_capacity))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
