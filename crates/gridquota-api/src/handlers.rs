//! REST API handlers.
//!
//! Ledger operations go through `LedgerService`; pools, descriptions and
//! hosts are read and written on the `StateStore` directly. Every response
//! uses the same JSON envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::warn;

use gridquota_capacity::{CapacityError, CapacityReport, apply_report, refresh_from_hosts};
use gridquota_fairshare::Redistributor;
use gridquota_ledger::{LedgerError, ReservationRequest};
use gridquota_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        })
    }
}

fn error_response(msg: &str, code: &'static str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            code: Some(code),
        }),
    )
        .into_response()
}

fn storage_error(e: &StateError) -> Response {
    error_response(&e.to_string(), "storage", StatusCode::INTERNAL_SERVER_ERROR)
}

fn ledger_error(e: LedgerError) -> Response {
    let status = match &e {
        LedgerError::Validation(_) | LedgerError::ImmutableFieldChanged(_) => {
            StatusCode::BAD_REQUEST
        }
        LedgerError::NotFound(_) | LedgerError::PoolNotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::InsufficientInstances { .. }
        | LedgerError::InsufficientMemory { .. }
        | LedgerError::LedgerInUse(_)
        | LedgerError::AlreadyExists(_)
        | LedgerError::PoolInUse(_)
        | LedgerError::ConcurrentModification { .. } => StatusCode::CONFLICT,
        LedgerError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), e.kind(), status)
}

fn not_found(what: &str, link: &str) -> Response {
    error_response(&format!("{what} not found: {link}"), "not_found", StatusCode::NOT_FOUND)
}

fn bad_request(msg: &str) -> Response {
    error_response(msg, "validation", StatusCode::BAD_REQUEST)
}

/// Rebalance a pool on the monitor, or inline when no monitor runs.
fn rebalance(state: &ApiState, resource_pool_link: &str) {
    match &state.capacity {
        Some(handle) => handle.rebalance(resource_pool_link),
        None => {
            if let Err(e) = Redistributor::new(state.store.clone()).rebalance(resource_pool_link) {
                warn!(pool = resource_pool_link, error = %e, "inline rebalance failed");
            }
        }
    }
}

// ── Placements ─────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub pool: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExpandQuery {
    #[serde(default)]
    pub expand: bool,
}

/// GET /api/v1/placements
pub async fn list_placements(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Response {
    match state.ledger.list(query.pool.as_deref()) {
        Ok(placements) => ApiResponse::ok(placements).into_response(),
        Err(e) => ledger_error(e),
    }
}

/// POST /api/v1/placements
pub async fn create_placement(
    State(state): State<ApiState>,
    Json(placement): Json<GroupResourcePlacement>,
) -> Response {
    match state.ledger.create(placement) {
        Ok(created) => (StatusCode::CREATED, ApiResponse::ok(created)).into_response(),
        Err(e) => ledger_error(e),
    }
}

/// GET /api/v1/placements/{link}
pub async fn get_placement(
    State(state): State<ApiState>,
    Path(link): Path<String>,
    Query(query): Query<ExpandQuery>,
) -> Response {
    if query.expand {
        match state.ledger.get_expanded(&link) {
            Ok(expanded) => ApiResponse::ok(expanded).into_response(),
            Err(e) => ledger_error(e),
        }
    } else {
        match state.ledger.get(&link) {
            Ok(placement) => ApiResponse::ok(placement).into_response(),
            Err(e) => ledger_error(e),
        }
    }
}

/// PUT /api/v1/placements/{link}
pub async fn update_placement(
    State(state): State<ApiState>,
    Path(link): Path<String>,
    Json(placement): Json<GroupResourcePlacement>,
) -> Response {
    match state.ledger.update(&link, &placement) {
        Ok(updated) => ApiResponse::ok(updated).into_response(),
        Err(e) => ledger_error(e),
    }
}

/// PATCH /api/v1/placements/{link}
pub async fn reserve_placement(
    State(state): State<ApiState>,
    Path(link): Path<String>,
    Json(request): Json<ReservationRequest>,
) -> Response {
    match state.ledger.reserve(&link, &request) {
        Ok(updated) => ApiResponse::ok(updated).into_response(),
        Err(e) => ledger_error(e),
    }
}

/// DELETE /api/v1/placements/{link}
pub async fn delete_placement(State(state): State<ApiState>, Path(link): Path<String>) -> Response {
    match state.ledger.delete(&link) {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => ledger_error(e),
    }
}

// ── Resource pools ─────────────────────────────────────────────

/// GET /api/v1/pools
pub async fn list_pools(State(state): State<ApiState>) -> Response {
    match state.store.list_pools() {
        Ok(pools) => ApiResponse::ok(pools).into_response(),
        Err(e) => storage_error(&e),
    }
}

fn validate_pool(pool: &ResourcePool) -> Result<(), Response> {
    if pool.self_link.trim().is_empty() {
        return Err(bad_request("self_link is required"));
    }
    if pool.name.trim().is_empty() {
        return Err(bad_request("name is required"));
    }
    let bounds = [
        pool.max_memory_bytes,
        pool.min_memory_bytes,
        pool.max_storage_bytes,
        pool.min_storage_bytes,
        pool.max_cpu_count,
        pool.min_cpu_count,
    ];
    if bounds.iter().any(|v| *v < 0) {
        return Err(bad_request("pool bounds must not be negative"));
    }
    Ok(())
}

/// POST /api/v1/pools
pub async fn create_pool(
    State(state): State<ApiState>,
    Json(pool): Json<ResourcePool>,
) -> Response {
    if let Err(resp) = validate_pool(&pool) {
        return resp;
    }
    match state.store.insert_pool_if_absent(&pool) {
        Ok(true) => (StatusCode::CREATED, ApiResponse::ok(pool)).into_response(),
        Ok(false) => error_response(
            &format!("resource pool already exists: {}", pool.self_link),
            "already_exists",
            StatusCode::CONFLICT,
        ),
        Err(e) => storage_error(&e),
    }
}

/// GET /api/v1/pools/{link}
pub async fn get_pool(State(state): State<ApiState>, Path(link): Path<String>) -> Response {
    match state.store.get_pool(&link) {
        Ok(Some(pool)) => ApiResponse::ok(pool).into_response(),
        Ok(None) => not_found("resource pool", &link),
        Err(e) => storage_error(&e),
    }
}

/// PUT /api/v1/pools/{link}
pub async fn replace_pool(
    State(state): State<ApiState>,
    Path(link): Path<String>,
    Json(mut pool): Json<ResourcePool>,
) -> Response {
    pool.self_link = link.clone();
    if let Err(resp) = validate_pool(&pool) {
        return resp;
    }
    match state.store.update_pool(&link, |stored| *stored = pool.clone()) {
        Ok(Some(())) => {
            rebalance(&state, &link);
            ApiResponse::ok(pool).into_response()
        }
        Ok(None) => not_found("resource pool", &link),
        Err(e) => storage_error(&e),
    }
}

/// DELETE /api/v1/pools/{link}
pub async fn delete_pool(State(state): State<ApiState>, Path(link): Path<String>) -> Response {
    match state.ledger.delete_pool(&link) {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => ledger_error(e),
    }
}

// ── Resource descriptions ──────────────────────────────────────

/// GET /api/v1/descriptions
pub async fn list_descriptions(State(state): State<ApiState>) -> Response {
    match state.store.list_descriptions() {
        Ok(descs) => ApiResponse::ok(descs).into_response(),
        Err(e) => storage_error(&e),
    }
}

/// POST /api/v1/descriptions
pub async fn register_description(
    State(state): State<ApiState>,
    Json(desc): Json<ResourceDescription>,
) -> Response {
    if desc.self_link.trim().is_empty() {
        return bad_request("self_link is required");
    }
    if desc.memory_limit.is_some_and(|m| m < 0) {
        return bad_request("memory_limit must not be negative");
    }
    match state.store.put_description(&desc) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(desc)).into_response(),
        Err(e) => storage_error(&e),
    }
}

/// GET /api/v1/descriptions/{link}
pub async fn get_description(State(state): State<ApiState>, Path(link): Path<String>) -> Response {
    match state.store.get_description(&link) {
        Ok(Some(desc)) => ApiResponse::ok(desc).into_response(),
        Ok(None) => not_found("resource description", &link),
        Err(e) => storage_error(&e),
    }
}

// ── Hosts ──────────────────────────────────────────────────────

/// GET /api/v1/hosts
pub async fn list_hosts(State(state): State<ApiState>) -> Response {
    match state.store.list_hosts() {
        Ok(hosts) => ApiResponse::ok(hosts).into_response(),
        Err(e) => storage_error(&e),
    }
}

/// POST /api/v1/hosts
pub async fn register_host(
    State(state): State<ApiState>,
    Json(host): Json<HostInventory>,
) -> Response {
    if host.id.trim().is_empty() || host.resource_pool_link.trim().is_empty() {
        return bad_request("id and resource_pool_link are required");
    }
    match state.store.get_pool(&host.resource_pool_link) {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("resource pool", &host.resource_pool_link),
        Err(e) => return storage_error(&e),
    }
    // A host moving pools changes both.
    let previous_pool = match state.store.get_host(&host.id) {
        Ok(previous) => previous.map(|h| h.resource_pool_link),
        Err(e) => return storage_error(&e),
    };
    match state.store.put_host(&host) {
        Ok(()) => {
            hosts_changed(&state, &host.resource_pool_link);
            if let Some(previous) = previous_pool.filter(|p| *p != host.resource_pool_link) {
                hosts_changed(&state, &previous);
            }
            (StatusCode::CREATED, ApiResponse::ok(host)).into_response()
        }
        Err(e) => storage_error(&e),
    }
}

/// DELETE /api/v1/hosts/{id}
pub async fn delete_host(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let host = match state.store.get_host(&id) {
        Ok(Some(host)) => host,
        Ok(None) => return not_found("host", &id),
        Err(e) => return storage_error(&e),
    };
    match state.store.delete_host(&id) {
        Ok(_) => {
            hosts_changed(&state, &host.resource_pool_link);
            ApiResponse::ok("deleted").into_response()
        }
        Err(e) => storage_error(&e),
    }
}

/// Refresh a pool from its hosts on the monitor, or inline when no monitor runs.
fn hosts_changed(state: &ApiState, resource_pool_link: &str) {
    match &state.capacity {
        Some(handle) => handle.hosts_changed(resource_pool_link),
        None => match refresh_from_hosts(&state.store, resource_pool_link) {
            Ok(true) => rebalance(state, resource_pool_link),
            Ok(false) => {}
            Err(e) => warn!(pool = resource_pool_link, error = %e, "inline capacity refresh failed"),
        },
    }
}

// ── Capacity source ────────────────────────────────────────────

/// POST /api/v1/capacity
pub async fn report_capacity(
    State(state): State<ApiState>,
    Json(report): Json<CapacityReport>,
) -> Response {
    if report.max_memory_bytes < 0 {
        return bad_request("max_memory_bytes must not be negative");
    }
    match &state.capacity {
        Some(handle) => match handle.report(report.clone()).await {
            Ok(()) => (StatusCode::ACCEPTED, ApiResponse::ok(report)).into_response(),
            Err(e) => error_response(
                &e.to_string(),
                "unavailable",
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        },
        None => match apply_report(&state.store, &report) {
            Ok(changed) => {
                if changed {
                    rebalance(&state, &report.resource_pool_link);
                }
                ApiResponse::ok(report).into_response()
            }
            Err(CapacityError::PoolNotFound(link)) => not_found("resource pool", &link),
            Err(e) => error_response(&e.to_string(), "storage", StatusCode::INTERNAL_SERVER_ERROR),
        },
    }
}
