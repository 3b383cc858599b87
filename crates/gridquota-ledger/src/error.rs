//! Ledger error types.

use gridquota_state::StateError;
use thiserror::Error;

/// Errors returned by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("placement {placement}: requested {requested} instances, only {available} available")]
    InsufficientInstances {
        placement: String,
        requested: i64,
        available: i64,
    },

    #[error("placement {placement}: requested {requested} bytes of memory, only {available} available")]
    InsufficientMemory {
        placement: String,
        requested: i64,
        available: i64,
    },

    #[error("immutable field changed: {0}")]
    ImmutableFieldChanged(String),

    #[error("placement {0} has active reservations")]
    LedgerInUse(String),

    #[error("placement {placement} modified concurrently, gave up after {attempts} attempts")]
    ConcurrentModification { placement: String, attempts: u32 },

    #[error("placement not found: {0}")]
    NotFound(String),

    #[error("placement already exists: {0}")]
    AlreadyExists(String),

    #[error("resource pool not found: {0}")]
    PoolNotFound(String),

    #[error("resource pool {0} is referenced by placements")]
    PoolInUse(String),

    #[error("state store error: {0}")]
    State(StateError),
}

impl From<StateError> for LedgerError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::PoolCapacityExceeded { .. } => Self::Validation(e.to_string()),
            StateError::PoolNotFound(link) => Self::PoolNotFound(link),
            other => Self::State(other),
        }
    }
}

impl LedgerError {
    /// Stable machine-readable code for API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InsufficientInstances { .. } => "insufficient_instances",
            Self::InsufficientMemory { .. } => "insufficient_memory",
            Self::ImmutableFieldChanged(_) => "immutable_field_changed",
            Self::LedgerInUse(_) => "ledger_in_use",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::PoolNotFound(_) => "pool_not_found",
            Self::PoolInUse(_) => "pool_in_use",
            Self::State(_) => "storage",
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
