//! gridquota-state: embedded state store for GridQuota.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for group resource placements (ledgers), resource pools,
//! resource descriptions, and host inventory.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by their self link (hosts by host id).
//!
//! Ledgers carry a monotonically increasing `version`. Every ledger mutation
//! goes through a conditional write (`put_placement_if_version`,
//! `put_placements_if_version`, `delete_placement_if_version`) that fails
//! with [`StateError::VersionConflict`] when the stored version moved on, so
//! callers can re-read and re-apply their delta.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
