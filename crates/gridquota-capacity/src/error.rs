//! Capacity source error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("resource pool not found: {0}")]
    PoolNotFound(String),

    #[error("capacity monitor is not running")]
    MonitorStopped,

    #[error("redistribution failed: {0}")]
    FairShare(#[from] gridquota_fairshare::FairShareError),

    #[error("state store error: {0}")]
    State(#[from] gridquota_state::StateError),
}

pub type CapacityResult<T> = Result<T, CapacityError>;
