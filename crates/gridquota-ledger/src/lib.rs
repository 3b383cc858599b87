//! GridQuota quota ledger: per-group, per-pool reservation accounting.
//!
//! A ledger (`GroupResourcePlacement`) turns a slice of pool capacity into
//! reservable instance slots and memory. Provisioning workflows reserve
//! units before creating resources and release them on completion or
//! failure.
//!
//! # Components
//!
//! - **`reservation`**: Pure reserve/release arithmetic over one ledger
//! - **`validation`**: Ordered validator pipelines for create, update and delete
//! - **`service`**: `LedgerService`: persisted operations with bounded
//!   optimistic-concurrency retry

pub mod error;
pub mod reservation;
pub mod service;
pub mod validation;

pub use error::{LedgerError, LedgerResult};
pub use reservation::{ReservationOutcome, ReservationRequest, apply_reservation};
pub use service::{LedgerService, PlacementWithPool, PoolChangeCallback};
pub use validation::ValidationContext;
