//! GridQuota fair-share redistributor.
//!
//! When the ledgers of a pool promise more memory than the pool currently
//! has, the redistributor lowers memory limits until the promises fit
//! again. It takes from uncommitted headroom only, least important ledgers
//! first, and never lowers a ledger below the memory already reserved
//! against it.
//!
//! # Components
//!
//! - **`planner`**: Pure computation of the limit adjustments for one pool
//! - **`redistributor`**: Applies a plan as one versioned batch write,
//!   re-planning on conflict

pub mod error;
pub mod planner;
pub mod redistributor;

pub use error::{FairShareError, FairShareResult};
pub use planner::{LimitAdjustment, RedistributionPlan, plan_pool};
pub use redistributor::{RebalanceReport, Redistributor};
