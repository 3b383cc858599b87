//! gridquota-core: constants and configuration shared by every GridQuota crate.

pub mod config;
pub mod limits;

pub use config::GridQuotaConfig;
pub use limits::*;
