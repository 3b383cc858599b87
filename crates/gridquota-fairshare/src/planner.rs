//! Redistribution planner: decides which memory limits to lower.
//!
//! Given a pool's capacity and its ledgers, the planner:
//! 1. Skips unbounded pools and memory-unbounded ledgers
//! 2. Computes the excess of promised memory over capacity
//! 3. Ranks ledgers by normalized priority within their fairness group
//! 4. Takes the excess from uncommitted headroom, least important first
//!
//! A bounded ledger is never lowered below its committed memory, nor below
//! [`MIN_MEMORY_LIMIT`], since a limit of 0 would make it unbounded.
//!
//! Normalized priority is `priority / sum(priority)` over the pool's bounded
//! ledgers sharing a fairness key (0 when that sum is 0). A larger value
//! means less important, so those ledgers give up memory first.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use gridquota_core::{MIN_MEMORY_LIMIT, UNBOUNDED_CAPACITY};
use gridquota_state::GroupResourcePlacement;

/// A memory limit change for one ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitAdjustment {
    pub self_link: String,
    pub previous_limit: i64,
    pub target_limit: i64,
}

impl LimitAdjustment {
    pub fn reclaimed(&self) -> i64 {
        self.previous_limit - self.target_limit
    }
}

/// Adjustments that bring one pool's promises back within capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedistributionPlan {
    pub resource_pool_link: String,
    pub capacity: i64,
    /// Sum of bounded memory limits before the plan is applied.
    pub promised: i64,
    pub adjustments: Vec<LimitAdjustment>,
    /// Excess left over because every remaining byte is committed.
    pub unresolved_excess: i64,
}

impl RedistributionPlan {
    fn unchanged(resource_pool_link: &str, capacity: i64, promised: i64) -> Self {
        Self {
            resource_pool_link: resource_pool_link.to_string(),
            capacity,
            promised,
            adjustments: Vec::new(),
            unresolved_excess: 0,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.adjustments.is_empty()
    }
}

/// Compute the limit adjustments for one pool.
pub fn plan_pool(
    resource_pool_link: &str,
    capacity: i64,
    placements: &[GroupResourcePlacement],
) -> RedistributionPlan {
    let bounded: Vec<&GroupResourcePlacement> = placements
        .iter()
        .filter(|p| p.is_memory_bounded())
        .collect();
    let promised = bounded
        .iter()
        .fold(0i64, |sum, p| sum.saturating_add(p.memory_limit));

    if capacity == UNBOUNDED_CAPACITY || promised <= capacity {
        return RedistributionPlan::unchanged(resource_pool_link, capacity, promised);
    }

    let mut excess = promised - capacity.max(0);
    let group_sums = priority_sums(&bounded);
    let mut ranked: Vec<(&GroupResourcePlacement, f64)> = bounded
        .iter()
        .map(|p| (*p, normalized_priority(p, &group_sums)))
        .collect();
    ranked.sort_by(|(a, wa), (b, wb)| {
        wb.partial_cmp(wa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.self_link.cmp(&b.self_link))
    });

    let mut adjustments = Vec::new();
    for (placement, weight) in ranked {
        if excess == 0 {
            break;
        }
        let floor = placement.committed_memory().max(MIN_MEMORY_LIMIT);
        let headroom = (placement.memory_limit - floor).max(0);
        let take = headroom.min(excess);
        if take == 0 {
            continue;
        }
        excess -= take;
        debug!(
            placement = %placement.self_link,
            weight,
            reclaimed = take,
            "reclaiming uncommitted memory"
        );
        adjustments.push(LimitAdjustment {
            self_link: placement.self_link.clone(),
            previous_limit: placement.memory_limit,
            target_limit: placement.memory_limit - take,
        });
    }

    if excess > 0 {
        warn!(
            pool = resource_pool_link,
            capacity,
            promised,
            unresolved = excess,
            "pool over-committed beyond reserved memory"
        );
    }

    RedistributionPlan {
        resource_pool_link: resource_pool_link.to_string(),
        capacity,
        promised,
        adjustments,
        unresolved_excess: excess,
    }
}

/// Sum of priorities per fairness key.
fn priority_sums<'a>(bounded: &[&'a GroupResourcePlacement]) -> HashMap<&'a str, i64> {
    let mut sums = HashMap::new();
    for p in bounded {
        *sums.entry(p.fairness_key()).or_insert(0i64) += p.priority.max(0);
    }
    sums
}

/// `priority / sum(priority)` over the ledgers sharing `placement`'s fairness key.
fn normalized_priority(placement: &GroupResourcePlacement, group_sums: &HashMap<&str, i64>) -> f64 {
    match group_sums.get(placement.fairness_key()) {
        Some(&sum) if sum > 0 => placement.priority.max(0) as f64 / sum as f64,
        _ => 0.0,
    }
}
