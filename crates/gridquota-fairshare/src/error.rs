//! Redistributor error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FairShareError {
    #[error("resource pool not found: {0}")]
    PoolNotFound(String),

    #[error("pool {pool} ledgers modified concurrently, gave up after {attempts} attempts")]
    ConcurrentModification { pool: String, attempts: u32 },

    #[error("state store error: {0}")]
    State(#[from] gridquota_state::StateError),
}

pub type FairShareResult<T> = Result<T, FairShareError>;
