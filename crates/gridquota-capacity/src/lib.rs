//! GridQuota capacity source: keeps pool capacity in step with host inventory.
//!
//! Hosts registered with a pool report memory, storage and CPU figures.
//! The capacity monitor folds them into the pool record and, whenever a
//! pool's capacity or ledger population changes, asks the fair-share
//! redistributor to rebalance that pool.
//!
//! # Components
//!
//! - **`aggregate`**: Pure aggregation of host inventory into pool capacity
//! - **`monitor`**: `CapacityMonitor`: single task that serializes capacity
//!   updates and rebalances, plus the `CapacityHandle` used to feed it

pub mod aggregate;
pub mod error;
pub mod monitor;

pub use aggregate::{CapacityReport, PoolCapacity, aggregate_hosts, apply_report, refresh_from_hosts};
pub use error::{CapacityError, CapacityResult};
pub use monitor::{CapacityEvent, CapacityHandle, CapacityMonitor};
