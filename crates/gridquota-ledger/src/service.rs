//! LedgerService: persisted ledger operations.
//!
//! Every mutation reads the ledger, computes the next state and writes it
//! back conditionally on the version it read. A lost race re-reads and
//! re-applies the same delta, up to `max_conflict_retries` times, before
//! surfacing [`LedgerError::ConcurrentModification`].
//!
//! Operations that add a ledger to a pool, remove one, or change how much
//! memory a pool has promised invoke the pool-change callback so the
//! redistributor can re-examine that pool.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use gridquota_core::{
    DEFAULT_PLACEMENT_LINK, DEFAULT_PLACEMENT_MAX_INSTANCES, DEFAULT_PLACEMENT_PRIORITY,
    DEFAULT_POOL_MAX_CPU_COUNT, DEFAULT_POOL_MAX_MEMORY_BYTES, DEFAULT_POOL_MIN_CPU_COUNT,
    DEFAULT_POOL_MIN_MEMORY_BYTES, DEFAULT_POOL_STORAGE_BYTES, DEFAULT_RESOURCE_POOL_LINK,
};
use gridquota_state::{GroupResourcePlacement, ResourcePool, StateError, StateStore};

use crate::error::{LedgerError, LedgerResult};
use crate::reservation::{ReservationRequest, apply_reservation};
use crate::validation::{self, CREATE_PIPELINE, UPDATE_PIPELINE, ValidationContext};

/// Called with a pool link whenever that pool's ledger population or
/// promised memory changes.
pub type PoolChangeCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 8;

/// A ledger with the pool it references embedded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementWithPool {
    #[serde(flatten)]
    pub placement: GroupResourcePlacement,
    pub resource_pool: Option<ResourcePool>,
}

pub struct LedgerService {
    store: StateStore,
    max_conflict_retries: u32,
    on_pool_change: Option<PoolChangeCallback>,
}

impl LedgerService {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            on_pool_change: None,
        }
    }

    /// Retries after the first attempt before giving up on a conflicted write.
    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn with_pool_change_callback(mut self, callback: PoolChangeCallback) -> Self {
        self.on_pool_change = Some(callback);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get(&self, self_link: &str) -> LedgerResult<GroupResourcePlacement> {
        self.store
            .get_placement(self_link)?
            .ok_or_else(|| LedgerError::NotFound(self_link.to_string()))
    }

    /// Read a ledger with its resource pool resolved.
    pub fn get_expanded(&self, self_link: &str) -> LedgerResult<PlacementWithPool> {
        let placement = self.get(self_link)?;
        let resource_pool = self.store.get_pool(&placement.resource_pool_link)?;
        Ok(PlacementWithPool {
            placement,
            resource_pool,
        })
    }

    /// List ledgers, optionally only those drawing from one pool.
    pub fn list(&self, resource_pool_link: Option<&str>) -> LedgerResult<Vec<GroupResourcePlacement>> {
        let placements = match resource_pool_link {
            Some(pool) => self.store.list_placements_in_pool(pool)?,
            None => self.store.list_placements()?,
        };
        Ok(placements)
    }

    // ── Create / update / delete ───────────────────────────────────

    /// Create a ledger. Counters are initialized from the declared limits;
    /// any counters in `request` are ignored.
    pub fn create(&self, request: GroupResourcePlacement) -> LedgerResult<GroupResourcePlacement> {
        let mut placement = request;
        placement.name = placement.name.trim().to_string();
        if placement.self_link.trim().is_empty() {
            placement.self_link = derive_self_link(&placement.name);
        }

        let pool = self.store.get_pool(&placement.resource_pool_link)?;
        let others_memory = self.promised_memory(&placement.resource_pool_link, None)?;
        let ctx = ValidationContext {
            current: None,
            pool: pool.as_ref(),
            others_memory,
        };
        validation::run(CREATE_PIPELINE, &ctx, &placement)?;
        if placement.self_link.is_empty() {
            return Err(LedgerError::Validation(format!(
                "cannot derive a self link from name {:?}",
                placement.name
            )));
        }

        let now = epoch_secs();
        placement.allocated_instances_count = 0;
        placement.available_instances_count = if placement.is_instance_bounded() {
            placement.max_number_instances
        } else {
            0
        };
        placement.available_memory = placement.memory_limit;
        placement.resource_quota_per_resource_desc.clear();
        placement.memory_quota_per_resource_desc.clear();
        placement.created_at = now;
        placement.updated_at = now;

        let stored = self
            .store
            .create_placement_within_pool_capacity(&placement)
            .map_err(|e| match e {
                StateError::AlreadyExists(link) => LedgerError::AlreadyExists(link),
                other => other.into(),
            })?;
        info!(
            placement = %stored.self_link,
            pool = %stored.resource_pool_link,
            max_instances = stored.max_number_instances,
            memory_limit = stored.memory_limit,
            "placement created"
        );
        self.notify(&stored.resource_pool_link);
        Ok(stored)
    }

    /// Full-state replace of a ledger's declared fields.
    ///
    /// Reservation counters are carried over from the stored ledger and the
    /// available counts recomputed against the new limits.
    pub fn update(
        &self,
        self_link: &str,
        request: &GroupResourcePlacement,
    ) -> LedgerResult<GroupResourcePlacement> {
        let (previous, stored) = self.retry_on_conflict(self_link, || {
            let current = self.get(self_link)?;
            let pool = self.store.get_pool(&request.resource_pool_link)?;
            let others_memory =
                self.promised_memory(&request.resource_pool_link, Some(self_link))?;
            let ctx = ValidationContext {
                current: Some(&current),
                pool: pool.as_ref(),
                others_memory,
            };
            validation::run(UPDATE_PIPELINE, &ctx, request)?;

            let next = merge_update(&current, request);
            // Headroom checked above may be gone by commit; re-check inside the write.
            let stored = if validation::claims_pool_headroom(Some(&current), &next) {
                self.store
                    .put_placement_if_version_within_pool_capacity(&next, current.version)?
            } else {
                self.store.put_placement_if_version(&next, current.version)?
            };
            Ok((current, stored))
        })?;

        debug!(placement = %self_link, version = stored.version, "placement updated");
        if previous.resource_pool_link != stored.resource_pool_link {
            self.notify(&previous.resource_pool_link);
            self.notify(&stored.resource_pool_link);
        } else if previous.memory_limit != stored.memory_limit {
            self.notify(&stored.resource_pool_link);
        }
        Ok(stored)
    }

    /// Reserve (positive count) or release (negative count) instances of a
    /// resource description against a ledger.
    pub fn reserve(
        &self,
        self_link: &str,
        request: &ReservationRequest,
    ) -> LedgerResult<GroupResourcePlacement> {
        request.validate()?;
        let desc_link = request.resource_description_link.as_str();
        let unit_memory = match self.store.get_description(desc_link)? {
            Some(desc) => desc.unit_memory(),
            None => {
                warn!(
                    placement = %self_link,
                    desc = %desc_link,
                    "resource description not found, reserving without memory"
                );
                0
            }
        };

        self.retry_on_conflict(self_link, || {
            let current = self.get(self_link)?;
            let mut next = current.clone();
            let outcome = apply_reservation(&mut next, desc_link, request.resource_count, unit_memory)?;
            if outcome.is_noop() {
                return Ok(current);
            }
            next.updated_at = epoch_secs();
            let stored = self.store.put_placement_if_version(&next, current.version)?;
            debug!(
                placement = %self_link,
                desc = %desc_link,
                instances = outcome.applied_instances,
                memory = outcome.applied_memory,
                allocated = stored.allocated_instances_count,
                "reservation applied"
            );
            Ok(stored)
        })
    }

    /// Delete a ledger that has no active reservations.
    pub fn delete(&self, self_link: &str) -> LedgerResult<()> {
        let removed = self.retry_on_conflict(self_link, || {
            let current = self.get(self_link)?;
            validation::validate_delete(&current)?;
            self.store
                .delete_placement_if_version(self_link, current.version)?;
            Ok(current)
        })?;
        info!(placement = %self_link, pool = %removed.resource_pool_link, "placement deleted");
        self.notify(&removed.resource_pool_link);
        Ok(())
    }

    // ── Pools ──────────────────────────────────────────────────────

    /// Delete a resource pool no ledger references.
    pub fn delete_pool(&self, resource_pool_link: &str) -> LedgerResult<()> {
        if !self.store.list_placements_in_pool(resource_pool_link)?.is_empty() {
            return Err(LedgerError::PoolInUse(resource_pool_link.to_string()));
        }
        if !self.store.delete_pool(resource_pool_link)? {
            return Err(LedgerError::PoolNotFound(resource_pool_link.to_string()));
        }
        info!(pool = %resource_pool_link, "resource pool deleted");
        Ok(())
    }

    /// Create the default pool and the global default placement if absent.
    pub fn ensure_defaults(&self) -> LedgerResult<()> {
        let mut pool = ResourcePool::new(DEFAULT_RESOURCE_POOL_LINK, "Default Placement Zone");
        pool.min_memory_bytes = DEFAULT_POOL_MIN_MEMORY_BYTES;
        pool.max_memory_bytes = DEFAULT_POOL_MAX_MEMORY_BYTES;
        pool.min_storage_bytes = DEFAULT_POOL_STORAGE_BYTES;
        pool.max_storage_bytes = DEFAULT_POOL_STORAGE_BYTES;
        pool.min_cpu_count = DEFAULT_POOL_MIN_CPU_COUNT;
        pool.max_cpu_count = DEFAULT_POOL_MAX_CPU_COUNT;
        pool.updated_at = epoch_secs();
        if self.store.insert_pool_if_absent(&pool)? {
            info!(pool = DEFAULT_RESOURCE_POOL_LINK, "default resource pool created");
        }

        if self.store.get_placement(DEFAULT_PLACEMENT_LINK)?.is_some() {
            return Ok(());
        }
        let mut placement = GroupResourcePlacement::new(
            DEFAULT_PLACEMENT_LINK,
            "Default Resource Placement",
            DEFAULT_RESOURCE_POOL_LINK,
        );
        placement.max_number_instances = DEFAULT_PLACEMENT_MAX_INSTANCES;
        placement.priority = DEFAULT_PLACEMENT_PRIORITY;
        match self.create(placement) {
            Ok(_) | Err(LedgerError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Sum of declared memory limits in a pool, skipping `exclude`.
    fn promised_memory(&self, resource_pool_link: &str, exclude: Option<&str>) -> LedgerResult<i64> {
        let total = self
            .store
            .list_placements_in_pool(resource_pool_link)?
            .iter()
            .filter(|p| Some(p.self_link.as_str()) != exclude)
            .fold(0i64, |sum, p| sum.saturating_add(p.memory_limit));
        Ok(total)
    }

    fn retry_on_conflict<T>(
        &self,
        self_link: &str,
        mut op: impl FnMut() -> LedgerResult<T>,
    ) -> LedgerResult<T> {
        let attempts = self.max_conflict_retries.saturating_add(1);
        for attempt in 1..=attempts {
            match op() {
                Err(LedgerError::State(StateError::VersionConflict {
                    expected, found, ..
                })) => {
                    warn!(
                        placement = %self_link,
                        attempt,
                        expected,
                        found,
                        "version conflict, retrying"
                    );
                }
                Err(LedgerError::State(StateError::NotFound(link))) => {
                    return Err(LedgerError::NotFound(link));
                }
                other => return other,
            }
        }
        Err(LedgerError::ConcurrentModification {
            placement: self_link.to_string(),
            attempts,
        })
    }

    fn notify(&self, resource_pool_link: &str) {
        if let Some(callback) = &self.on_pool_change {
            callback(resource_pool_link);
        }
    }
}

/// Apply the declared fields of `request` on top of `current`.
fn merge_update(
    current: &GroupResourcePlacement,
    request: &GroupResourcePlacement,
) -> GroupResourcePlacement {
    let mut next = current.clone();
    next.name = request.name.trim().to_string();
    next.tenant_group = request.tenant_group.clone();
    next.resource_type = request.resource_type;
    next.priority = request.priority;
    next.deployment_policy_link = request.deployment_policy_link.clone();
    next.resource_pool_link = request.resource_pool_link.clone();
    next.storage_limit = request.storage_limit;
    next.cpu_shares = request.cpu_shares;

    next.max_number_instances = request.max_number_instances;
    next.available_instances_count = if next.is_instance_bounded() {
        next.max_number_instances - next.allocated_instances_count
    } else {
        0
    };

    next.memory_limit = request.memory_limit;
    next.available_memory = if next.is_memory_bounded() {
        next.memory_limit - next.committed_memory()
    } else {
        0
    };
    next.updated_at = epoch_secs();
    next
}

/// Lowercase slug of a display name.
fn derive_self_link(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    slug.trim_matches('-').to_string()
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
    use std::sync::Mutex;

    use gridquota_state::{ResourceDescription, ResourceType};

    const MIB: i64 = 1024 * 1024;
    const UNIT: i64 = 64 * MIB;

    fn setup() -> LedgerService {
        let store = StateStore::open_in_memory().unwrap();
        let mut pool = ResourcePool::new("pool-a", "A");
        pool.max_memory_bytes = 1024 * MIB;
        store.put_pool(&pool).unwrap();
        let mut pool_b = ResourcePool::new("pool-b", "B");
        pool_b.max_memory_bytes = 1024 * MIB;
        store.put_pool(&pool_b).unwrap();
        store
            .put_description(&ResourceDescription {
                self_link: "desc/web".to_string(),
                name: "web".to_string(),
                resource_type: ResourceType::Container,
                memory_limit: Some(UNIT),
            })
            .unwrap();
        LedgerService::new(store)
    }

    fn request(link: &str, max_instances: i64, memory_limit: i64) -> GroupResourcePlacement {
        let mut p = GroupResourcePlacement::new(link, "team-a", "pool-a");
        p.tenant_group = vec!["tenant-a".to_string()];
        p.max_number_instances = max_instances;
        p.memory_limit = memory_limit;
        p
    }

    // ── Create ─────────────────────────────────────────────────────

    #[test]
    fn create_initializes_counters() {
        let svc = setup();
        let mut req = request("p1", 10, 256 * MIB);
        req.available_instances_count = 999;
        req.allocated_instances_count = 5;

        let created = svc.create(req).unwrap();
        assert_eq!(created.available_instances_count, 10);
        assert_eq!(created.allocated_instances_count, 0);
        assert_eq!(created.available_memory, 256 * MIB);
        assert_eq!(created.version, 1);
        assert!(created.created_at > 0);
    }

    #[test]
    fn create_derives_self_link_from_name() {
        let svc = setup();
        let mut req = request("", 0, 0);
        req.name = "  Team Alpha ".to_string();
        let created = svc.create(req).unwrap();
        assert_eq!(created.self_link, "team-alpha");
        assert_eq!(created.name, "Team Alpha");
    }

    #[test]
    fn create_rejects_duplicates_and_unknown_pools() {
        let svc = setup();
        svc.create(request("p1", 10, 0)).unwrap();
        assert!(matches!(
            svc.create(request("p1", 10, 0)).unwrap_err(),
            LedgerError::AlreadyExists(_)
        ));

        let mut orphan = request("p2", 10, 0);
        orphan.resource_pool_link = "pool-z".to_string();
        assert!(matches!(
            svc.create(orphan).unwrap_err(),
            LedgerError::PoolNotFound(_)
        ));
    }

    #[test]
    fn create_enforces_pool_capacity() {
        let svc = setup();
        svc.create(request("p1", 0, 800 * MIB)).unwrap();
        let err = svc.create(request("p2", 0, 300 * MIB)).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        // An unbounded ledger still fits.
        svc.create(request("p3", 0, 0)).unwrap();
    }

    fn pool(svc: &LedgerService, link: &str, max_memory: i64) {
        let mut pool = ResourcePool::new(link, link);
        pool.max_memory_bytes = max_memory;
        svc.store().put_pool(&pool).unwrap();
    }

    #[test]
    fn concurrent_creates_never_overcommit_pool() {
        let svc = Arc::new(setup());
        for round in 0..20 {
            let pool_link = format!("tight-{round}");
            pool(&svc, &pool_link, 100 * MIB);
            let barrier = Arc::new(std::sync::Barrier::new(4));

            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let svc = svc.clone();
                    let barrier = barrier.clone();
                    let pool_link = pool_link.clone();
                    std::thread::spawn(move || {
                        let mut req = request(&format!("{pool_link}-{i}"), 0, 60 * MIB);
                        req.resource_pool_link = pool_link;
                        barrier.wait();
                        svc.create(req)
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "round {round}");
            for err in results.into_iter().filter_map(Result::err) {
                assert!(matches!(err, LedgerError::Validation(_)), "round {round}: {err}");
            }
            let promised: i64 = svc
                .list(Some(&pool_link))
                .unwrap()
                .iter()
                .map(|p| p.memory_limit)
                .sum();
            assert!(promised <= 100 * MIB, "round {round}: {promised}");
        }
    }

    #[test]
    fn concurrent_limit_raises_never_overcommit_pool() {
        let svc = Arc::new(setup());
        for round in 0..20 {
            let pool_link = format!("tight-{round}");
            pool(&svc, &pool_link, 100 * MIB);
            let links: Vec<String> = (0..2).map(|i| format!("{pool_link}-{i}")).collect();
            for link in &links {
                let mut req = request(link, 0, 10 * MIB);
                req.resource_pool_link = pool_link.clone();
                svc.create(req).unwrap();
            }
            let barrier = Arc::new(std::sync::Barrier::new(links.len()));

            let handles: Vec<_> = links
                .iter()
                .map(|link| {
                    let svc = svc.clone();
                    let barrier = barrier.clone();
                    let link = link.clone();
                    std::thread::spawn(move || {
                        let mut raised = svc.get(&link).unwrap();
                        raised.memory_limit = 60 * MIB;
                        barrier.wait();
                        svc.update(&link, &raised)
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "round {round}");
            let promised: i64 = svc
                .list(Some(&pool_link))
                .unwrap()
                .iter()
                .map(|p| p.memory_limit)
                .sum();
            assert_eq!(promised, 70 * MIB, "round {round}");
        }
    }

    #[test]
    fn create_notifies_pool_change() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let svc = setup().with_pool_change_callback(Arc::new(move |pool: &str| {
            sink.lock().unwrap().push(pool.to_string());
        }));

        svc.create(request("p1", 10, 0)).unwrap();
        svc.delete("p1").unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["pool-a", "pool-a"]);
    }

    // ── Reserve / release ──────────────────────────────────────────

    #[test]
    fn reserve_charges_description_memory() {
        let svc = setup();
        svc.create(request("p1", 10, 8 * UNIT + UNIT / 2)).unwrap();

        let p = svc.reserve("p1", &ReservationRequest::reserve("desc/web", 8)).unwrap();
        assert_eq!(p.allocated_instances_count, 8);
        assert_eq!(p.available_memory, UNIT / 2);
        assert_eq!(p.memory_quota_per_resource_desc["desc/web"], 8 * UNIT);

        let err = svc
            .reserve("p1", &ReservationRequest::reserve("desc/web", 1))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientMemory { .. }));
        assert_eq!(svc.get("p1").unwrap(), p);
    }

    #[test]
    fn reserve_with_unknown_description_costs_no_memory() {
        let svc = setup();
        svc.create(request("p1", 10, 8 * MIB)).unwrap();
        let p = svc.reserve("p1", &ReservationRequest::reserve("desc/gone", 3)).unwrap();
        assert_eq!(p.allocated_instances_count, 3);
        assert_eq!(p.available_memory, 8 * MIB);
    }

    #[test]
    fn release_round_trip_restores_counters() {
        let svc = setup();
        let created = svc.create(request("p1", 10, 16 * UNIT)).unwrap();
        svc.reserve("p1", &ReservationRequest::reserve("desc/web", 4)).unwrap();
        let p = svc.reserve("p1", &ReservationRequest::release("desc/web", 4)).unwrap();

        assert_eq!(p.allocated_instances_count, created.allocated_instances_count);
        assert_eq!(p.available_instances_count, created.available_instances_count);
        assert_eq!(p.available_memory, created.available_memory);
        assert!(p.resource_quota_per_resource_desc.is_empty());
        assert_eq!(p.version, 3);
    }

    #[test]
    fn noop_release_does_not_write() {
        let svc = setup();
        svc.create(request("p1", 10, 0)).unwrap();
        let p = svc.reserve("p1", &ReservationRequest::release("desc/web", 2)).unwrap();
        assert_eq!(p.version, 1);
    }

    #[test]
    fn reserve_rejects_bad_requests() {
        let svc = setup();
        svc.create(request("p1", 10, 0)).unwrap();
        assert!(matches!(
            svc.reserve("p1", &ReservationRequest::reserve("", 1)).unwrap_err(),
            LedgerError::Validation(_)
        ));
        assert!(matches!(
            svc.reserve("ghost", &ReservationRequest::reserve("desc/web", 1)).unwrap_err(),
            LedgerError::NotFound(_)
        ));
    }

    #[test]
    fn concurrent_reservations_do_not_lose_updates() {
        let svc = Arc::new(setup().with_max_conflict_retries(64));
        svc.create(request("p1", 100, 0)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let svc = svc.clone();
                std::thread::spawn(move || {
                    let desc = format!("desc/{}", i % 2);
                    for _ in 0..5 {
                        svc.reserve("p1", &ReservationRequest::reserve(&desc, 1)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let p = svc.get("p1").unwrap();
        assert_eq!(p.allocated_instances_count, 40);
        assert_eq!(p.available_instances_count, 60);
        assert_eq!(p.reserved_instances(), 40);
    }

    /// Runs a reservation attempt, but lets another writer bump the ledger
    /// between the read and the conditional write.
    fn reserve_against_racing_writer(svc: &LedgerService) -> LedgerResult<GroupResourcePlacement> {
        svc.retry_on_conflict("p1", || {
            let current = svc.get("p1")?;
            let mut next = current.clone();
            apply_reservation(&mut next, "desc/web", 1, UNIT)?;
            svc.store().put_placement_if_version(&current, current.version)?;
            Ok(svc.store().put_placement_if_version(&next, current.version)?)
        })
    }

    #[test]
    fn conflicts_beyond_retry_budget_are_reported() {
        let svc = setup().with_max_conflict_retries(0);
        svc.create(request("p1", 10, 0)).unwrap();
        let err = reserve_against_racing_writer(&svc).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::ConcurrentModification { ref placement, attempts: 1 } if placement == "p1"
        ));
        assert_eq!(err.kind(), "concurrent_modification");

        let svc = setup().with_max_conflict_retries(2);
        svc.create(request("p1", 10, 0)).unwrap();
        assert!(matches!(
            reserve_against_racing_writer(&svc).unwrap_err(),
            LedgerError::ConcurrentModification { attempts: 3, .. }
        ));
        let p = svc.get("p1").unwrap();
        assert_eq!(p.allocated_instances_count, 0);
        assert_eq!(p.version, 4);
    }

    // ── Update ─────────────────────────────────────────────────────

    #[test]
    fn update_rejects_pool_change_while_reserved() {
        let svc = setup();
        svc.create(request("p1", 10, 0)).unwrap();
        let reserved = svc.reserve("p1", &ReservationRequest::reserve("desc/web", 2)).unwrap();

        let mut moved = reserved.clone();
        moved.resource_pool_link = "pool-b".to_string();
        let err = svc.update("p1", &moved).unwrap_err();
        assert!(matches!(err, LedgerError::ImmutableFieldChanged(_)));
        assert_eq!(svc.get("p1").unwrap(), reserved);
    }

    #[test]
    fn update_recomputes_available_counts() {
        let svc = setup();
        svc.create(request("p1", 10, 16 * UNIT)).unwrap();
        svc.reserve("p1", &ReservationRequest::reserve("desc/web", 3)).unwrap();

        let mut req = request("p1", 20, 8 * UNIT);
        req.priority = 5;
        // Counters supplied by the client are ignored.
        req.allocated_instances_count = 0;
        let p = svc.update("p1", &req).unwrap();

        assert_eq!(p.priority, 5);
        assert_eq!(p.allocated_instances_count, 3);
        assert_eq!(p.available_instances_count, 17);
        assert_eq!(p.available_memory, 5 * UNIT);
        assert_eq!(p.resource_quota_per_resource_desc["desc/web"], 3);
    }

    #[test]
    fn update_moves_idle_ledger_between_pools() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let svc = setup().with_pool_change_callback(Arc::new(move |pool: &str| {
            sink.lock().unwrap().push(pool.to_string());
        }));
        svc.create(request("p1", 10, 0)).unwrap();

        let mut moved = request("p1", 10, 0);
        moved.resource_pool_link = "pool-b".to_string();
        let p = svc.update("p1", &moved).unwrap();
        assert_eq!(p.resource_pool_link, "pool-b");
        assert_eq!(*seen.lock().unwrap(), vec!["pool-a", "pool-a", "pool-b"]);
    }

    // ── Delete ─────────────────────────────────────────────────────

    #[test]
    fn delete_idle_ledger() {
        let svc = setup();
        svc.create(request("p1", 10, 0)).unwrap();
        svc.delete("p1").unwrap();
        assert!(matches!(svc.get("p1").unwrap_err(), LedgerError::NotFound(_)));
        assert!(matches!(svc.delete("p1").unwrap_err(), LedgerError::NotFound(_)));
    }

    #[test]
    fn delete_rejects_ledger_in_use() {
        let svc = setup();
        svc.create(request("p1", 10, 0)).unwrap();
        svc.reserve("p1", &ReservationRequest::reserve("desc/web", 1)).unwrap();
        assert!(matches!(svc.delete("p1").unwrap_err(), LedgerError::LedgerInUse(_)));
        assert!(svc.get("p1").is_ok());
    }

    // ── Reads, pools, bootstrap ────────────────────────────────────

    #[test]
    fn expanded_read_embeds_pool() {
        let svc = setup();
        svc.create(request("p1", 10, 0)).unwrap();
        let expanded = svc.get_expanded("p1").unwrap();
        assert_eq!(expanded.resource_pool.unwrap().self_link, "pool-a");

        let json = serde_json::to_value(svc.get_expanded("p1").unwrap()).unwrap();
        assert_eq!(json["self_link"], "p1");
        assert_eq!(json["resource_pool"]["name"], "A");
    }

    #[test]
    fn list_filters_by_pool() {
        let svc = setup();
        svc.create(request("p1", 10, 0)).unwrap();
        let mut other = request("p2", 10, 0);
        other.resource_pool_link = "pool-b".to_string();
        svc.create(other).unwrap();

        assert_eq!(svc.list(None).unwrap().len(), 2);
        assert_eq!(svc.list(Some("pool-b")).unwrap().len(), 1);
    }

    #[test]
    fn pool_delete_requires_no_ledgers() {
        let svc = setup();
        svc.create(request("p1", 10, 0)).unwrap();
        assert!(matches!(svc.delete_pool("pool-a").unwrap_err(), LedgerError::PoolInUse(_)));
        svc.delete_pool("pool-b").unwrap();
        assert!(matches!(svc.delete_pool("pool-b").unwrap_err(), LedgerError::PoolNotFound(_)));
    }

    #[test]
    fn ensure_defaults_is_idempotent() {
        let svc = LedgerService::new(StateStore::open_in_memory().unwrap());
        svc.ensure_defaults().unwrap();
        svc.ensure_defaults().unwrap();

        let pool = svc.store().get_pool(DEFAULT_RESOURCE_POOL_LINK).unwrap().unwrap();
        assert_eq!(pool.max_memory_bytes, DEFAULT_POOL_MAX_MEMORY_BYTES);
        let placement = svc.get(DEFAULT_PLACEMENT_LINK).unwrap();
        assert!(placement.tenant_group.is_empty());
        assert_eq!(placement.available_instances_count, DEFAULT_PLACEMENT_MAX_INSTANCES);
        assert_eq!(placement.priority, DEFAULT_PLACEMENT_PRIORITY);
        assert!(!placement.is_memory_bounded());
    }
}
