//! Redistributor: applies redistribution plans to the state store.
//!
//! A rebalance reads the pool and its ledgers, plans, and writes every
//! adjusted ledger in a single batch guarded by the versions it read. If a
//! reservation lands on any of those ledgers in between, the batch fails as
//! a whole and the pool is re-read and re-planned. Only `memory_limit` and
//! `available_memory` are changed; reservation counters are carried over
//! from the fresh read.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info, warn};

use gridquota_state::{GroupResourcePlacement, StateError, StateStore};

use crate::error::{FairShareError, FairShareResult};
use crate::planner::{LimitAdjustment, plan_pool};

pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 8;

/// Outcome of one pool rebalance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebalanceReport {
    pub resource_pool_link: String,
    pub capacity: i64,
    pub promised: i64,
    pub adjusted: Vec<LimitAdjustment>,
    pub unresolved_excess: i64,
    /// Planning attempts, including ones lost to concurrent writes.
    pub attempts: u32,
}

pub struct Redistributor {
    store: StateStore,
    max_conflict_retries: u32,
}

impl Redistributor {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Bring the ledgers of one pool back within its current capacity.
    pub fn rebalance(&self, resource_pool_link: &str) -> FairShareResult<RebalanceReport> {
        self.rebalance_with(resource_pool_link, || self.read_pool(resource_pool_link))
    }

    /// Pool capacity and the ledgers drawing from it.
    fn read_pool(
        &self,
        resource_pool_link: &str,
    ) -> FairShareResult<(i64, Vec<GroupResourcePlacement>)> {
        let pool = self
            .store
            .get_pool(resource_pool_link)?
            .ok_or_else(|| FairShareError::PoolNotFound(resource_pool_link.to_string()))?;
        let placements = self.store.list_placements_in_pool(resource_pool_link)?;
        Ok((pool.max_memory_bytes, placements))
    }

    fn rebalance_with(
        &self,
        resource_pool_link: &str,
        mut read: impl FnMut() -> FairShareResult<(i64, Vec<GroupResourcePlacement>)>,
    ) -> FairShareResult<RebalanceReport> {
        let max_attempts = self.max_conflict_retries.saturating_add(1);
        for attempt in 1..=max_attempts {
            let (capacity, placements) = read()?;
            let plan = plan_pool(resource_pool_link, capacity, &placements);

            let report = RebalanceReport {
                resource_pool_link: resource_pool_link.to_string(),
                capacity: plan.capacity,
                promised: plan.promised,
                adjusted: plan.adjustments.clone(),
                unresolved_excess: plan.unresolved_excess,
                attempts: attempt,
            };
            if plan.is_noop() {
                debug!(pool = resource_pool_link, promised = plan.promised, "pool within capacity");
                return Ok(report);
            }

            let batch = build_batch(&placements, &plan.adjustments);
            match self.store.put_placements_if_version(&batch) {
                Ok(written) => {
                    info!(
                        pool = resource_pool_link,
                        capacity = plan.capacity,
                        promised = plan.promised,
                        adjusted = written.len(),
                        unresolved = plan.unresolved_excess,
                        "pool memory redistributed"
                    );
                    return Ok(report);
                }
                Err(StateError::VersionConflict { key, .. }) | Err(StateError::NotFound(key)) => {
                    warn!(
                        pool = resource_pool_link,
                        placement = %key,
                        attempt,
                        "ledger changed during rebalance, re-planning"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(FairShareError::ConcurrentModification {
            pool: resource_pool_link.to_string(),
            attempts: max_attempts,
        })
    }
}

/// Pair each adjusted ledger with the version it was read at.
fn build_batch(
    placements: &[GroupResourcePlacement],
    adjustments: &[LimitAdjustment],
) -> Vec<(GroupResourcePlacement, u64)> {
    let now = epoch_secs();
    adjustments
        .iter()
        .filter_map(|adj| {
            let current = placements.iter().find(|p| p.self_link == adj.self_link)?;
            let mut next = current.clone();
            next.memory_limit = adj.target_limit;
            next.available_memory = adj.target_limit - next.committed_memory();
            next.updated_at = now;
            Some((next, current.version))
        })
        .collect()
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridquota_state::ResourcePool;

    const MIB: i64 = 1024 * 1024;

    fn setup(capacity: i64) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        let mut pool = ResourcePool::new("pool-a", "A");
        pool.max_memory_bytes = capacity;
        store.put_pool(&pool).unwrap();
        store
    }

    fn seed(store: &StateStore, link: &str, priority: i64, limit: i64, committed: i64) {
        let mut p = GroupResourcePlacement::new(link, link, "pool-a");
        p.tenant_group = vec!["tenant".to_string()];
        p.priority = priority;
        p.memory_limit = limit;
        p.available_memory = limit - committed;
        if committed > 0 {
            p.allocated_instances_count = 1;
            p.resource_quota_per_resource_desc.insert("D".to_string(), 1);
            p.memory_quota_per_resource_desc.insert("D".to_string(), committed);
        }
        store.create_placement(&p).unwrap();
    }

    fn shrink_pool(store: &StateStore, capacity: i64) {
        let mut pool = store.get_pool("pool-a").unwrap().unwrap();
        pool.max_memory_bytes = capacity;
        store.put_pool(&pool).unwrap();
    }

    #[test]
    fn rebalance_within_capacity_writes_nothing() {
        let store = setup(100 * MIB);
        seed(&store, "a", 1, 50 * MIB, 0);
        let report = Redistributor::new(store.clone()).rebalance("pool-a").unwrap();
        assert!(report.adjusted.is_empty());
        assert_eq!(store.get_placement("a").unwrap().unwrap().version, 1);
    }

    #[test]
    fn rebalance_after_capacity_drop() {
        let store = setup(100 * MIB);
        seed(&store, "gold", 1, 50 * MIB, 0);
        seed(&store, "bronze", 9, 50 * MIB, 20 * MIB);
        shrink_pool(&store, 70 * MIB);

        let report = Redistributor::new(store.clone()).rebalance("pool-a").unwrap();
        assert_eq!(report.adjusted.len(), 1);
        assert_eq!(report.unresolved_excess, 0);

        let bronze = store.get_placement("bronze").unwrap().unwrap();
        assert_eq!(bronze.memory_limit, 20 * MIB);
        assert_eq!(bronze.available_memory, 0);
        assert_eq!(bronze.allocated_instances_count, 1);
        assert_eq!(bronze.version, 2);
        assert_eq!(store.get_placement("gold").unwrap().unwrap().memory_limit, 50 * MIB);
    }

    #[test]
    fn rebalance_never_goes_below_committed() {
        let store = setup(100 * MIB);
        seed(&store, "a", 1, 50 * MIB, 40 * MIB);
        seed(&store, "b", 2, 50 * MIB, 45 * MIB);
        shrink_pool(&store, 10 * MIB);

        let report = Redistributor::new(store.clone()).rebalance("pool-a").unwrap();
        assert_eq!(report.unresolved_excess, 75 * MIB);
        assert_eq!(store.get_placement("a").unwrap().unwrap().memory_limit, 40 * MIB);
        assert_eq!(store.get_placement("b").unwrap().unwrap().memory_limit, 45 * MIB);
    }

    #[test]
    fn unknown_pool_is_an_error() {
        let store = StateStore::open_in_memory().unwrap();
        let err = Redistributor::new(store).rebalance("pool-z").unwrap_err();
        assert!(matches!(err, FairShareError::PoolNotFound(_)));
    }

    /// Reads the pool, then lets a reservation land on every ledger before
    /// the batch is written, for the first `stale_reads` reads.
    fn racing_read<'a>(
        redistributor: &'a Redistributor,
        store: &'a StateStore,
        stale_reads: u32,
    ) -> impl FnMut() -> FairShareResult<(i64, Vec<GroupResourcePlacement>)> + 'a {
        let mut reads = 0;
        move || {
            let snapshot = redistributor.read_pool("pool-a")?;
            reads += 1;
            if reads <= stale_reads {
                for p in &snapshot.1 {
                    store.put_placement_if_version(p, p.version).unwrap();
                }
            }
            Ok(snapshot)
        }
    }

    #[test]
    fn conflicts_beyond_retry_budget_are_reported() {
        let store = setup(100 * MIB);
        seed(&store, "a", 1, 50 * MIB, 0);
        seed(&store, "b", 9, 50 * MIB, 0);
        shrink_pool(&store, 60 * MIB);

        let redistributor = Redistributor::new(store.clone()).with_max_conflict_retries(0);
        let err = redistributor
            .rebalance_with("pool-a", racing_read(&redistributor, &store, u32::MAX))
            .unwrap_err();
        assert!(matches!(
            err,
            FairShareError::ConcurrentModification { attempts: 1, .. }
        ));

        let redistributor = Redistributor::new(store.clone()).with_max_conflict_retries(2);
        let err = redistributor
            .rebalance_with("pool-a", racing_read(&redistributor, &store, u32::MAX))
            .unwrap_err();
        assert!(matches!(
            err,
            FairShareError::ConcurrentModification { attempts: 3, .. }
        ));
        // Nothing was reclaimed by the failed attempts.
        assert_eq!(store.get_placement("b").unwrap().unwrap().memory_limit, 50 * MIB);
    }

    #[test]
    fn conflict_within_retry_budget_replans() {
        let store = setup(100 * MIB);
        seed(&store, "a", 1, 50 * MIB, 0);
        seed(&store, "b", 9, 50 * MIB, 0);
        shrink_pool(&store, 60 * MIB);

        let redistributor = Redistributor::new(store.clone()).with_max_conflict_retries(1);
        let report = redistributor
            .rebalance_with("pool-a", racing_read(&redistributor, &store, 1))
            .unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(store.get_placement("b").unwrap().unwrap().memory_limit, 10 * MIB);
    }

    #[test]
    fn batch_keeps_reservation_counters_from_read() {
        let mut current = GroupResourcePlacement::new("a", "a", "pool-a");
        current.memory_limit = 64 * MIB;
        current.memory_quota_per_resource_desc.insert("D".to_string(), 8 * MIB);
        current.version = 7;
        let adjustments = vec![LimitAdjustment {
            self_link: "a".to_string(),
            previous_limit: 64 * MIB,
            target_limit: 32 * MIB,
        }];

        let batch = build_batch(&[current], &adjustments);
        assert_eq!(batch.len(), 1);
        let (next, expected) = &batch[0];
        assert_eq!(*expected, 7);
        assert_eq!(next.available_memory, 24 * MIB);
        assert_eq!(next.memory_quota_per_resource_desc["D"], 8 * MIB);
    }
}
