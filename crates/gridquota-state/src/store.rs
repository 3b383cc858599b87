//! StateStore: redb-backed state persistence for GridQuota.
//!
//! Provides typed CRUD operations over placements, resource pools,
//! resource descriptions and hosts. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! Placement writes are conditional on the stored `version`; the check and
//! the write happen inside one redb write transaction. Writes that claim
//! more of a pool's memory also re-sum the pool's promised memory inside
//! that transaction, so concurrent claims cannot overshoot the pool.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(PLACEMENTS).map_err(map_err!(Table))?;
        txn.open_table(RESOURCE_POOLS).map_err(map_err!(Table))?;
        txn.open_table(RESOURCE_DESCRIPTIONS).map_err(map_err!(Table))?;
        txn.open_table(HOSTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON access ────────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert only when the key is absent. Returns true if inserted.
    fn insert_json_if_absent<T: Serialize>(
        &self,
        def: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<bool> {
        let value = encode(value)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let inserted;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let exists = table.get(key).map_err(map_err!(Read))?.is_some();
            inserted = !exists;
            if inserted {
                table
                    .insert(key, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(inserted)
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let value = match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        Ok(value)
    }

    fn list_json<T: DeserializeOwned>(
        &self,
        def: JsonTable,
        keep: impl Fn(&T) -> bool,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item: T = decode(value.value())?;
            if keep(&item) {
                results.push(item);
            }
        }
        Ok(results)
    }

    fn delete_key(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Placements ─────────────────────────────────────────────────

    /// Insert a new placement at version 1. Fails if the self link is taken.
    pub fn create_placement(
        &self,
        placement: &GroupResourcePlacement,
    ) -> StateResult<GroupResourcePlacement> {
        self.write_placement(placement, None, false)
    }

    /// Insert a new placement at version 1 if its memory limit fits in the
    /// pool's unreserved memory at commit time.
    pub fn create_placement_within_pool_capacity(
        &self,
        placement: &GroupResourcePlacement,
    ) -> StateResult<GroupResourcePlacement> {
        self.write_placement(placement, None, true)
    }

    /// Get a placement by self link.
    pub fn get_placement(&self, self_link: &str) -> StateResult<Option<GroupResourcePlacement>> {
        self.get_json(PLACEMENTS, self_link)
    }

    /// List all placements.
    pub fn list_placements(&self) -> StateResult<Vec<GroupResourcePlacement>> {
        self.list_json(PLACEMENTS, |_: &GroupResourcePlacement| true)
    }

    /// List the placements drawing from one resource pool.
    pub fn list_placements_in_pool(
        &self,
        resource_pool_link: &str,
    ) -> StateResult<Vec<GroupResourcePlacement>> {
        self.list_json(PLACEMENTS, |p: &GroupResourcePlacement| {
            p.resource_pool_link == resource_pool_link
        })
    }

    /// Replace a placement if its stored version still equals `expected`.
    ///
    /// Returns the stored record (version bumped to `expected + 1`).
    pub fn put_placement_if_version(
        &self,
        placement: &GroupResourcePlacement,
        expected: u64,
    ) -> StateResult<GroupResourcePlacement> {
        let mut stored = self.put_placements_if_version(&[(placement.clone(), expected)])?;
        stored.pop().ok_or_else(|| StateError::NotFound(placement.self_link.clone()))
    }

    /// Replace a placement if its stored version still equals `expected` and
    /// its memory limit fits in the pool's unreserved memory at commit time.
    pub fn put_placement_if_version_within_pool_capacity(
        &self,
        placement: &GroupResourcePlacement,
        expected: u64,
    ) -> StateResult<GroupResourcePlacement> {
        self.write_placement(placement, Some(expected), true)
    }

    /// Single-placement write: insert when `expected` is `None`, otherwise a
    /// version-guarded replace. Optionally guarded by pool headroom.
    fn write_placement(
        &self,
        placement: &GroupResourcePlacement,
        expected: Option<u64>,
        within_pool_capacity: bool,
    ) -> StateResult<GroupResourcePlacement> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        match write_placement_in(&txn, placement, expected, within_pool_capacity) {
            Ok(stored) => {
                txn.commit().map_err(map_err!(Transaction))?;
                debug!(placement = %stored.self_link, version = stored.version, "placement written");
                Ok(stored)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    /// Replace several placements atomically, each guarded by its expected
    /// version. Nothing is written if any guard fails.
    pub fn put_placements_if_version(
        &self,
        batch: &[(GroupResourcePlacement, u64)],
    ) -> StateResult<Vec<GroupResourcePlacement>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let written = {
            let mut table = txn.open_table(PLACEMENTS).map_err(map_err!(Table))?;
            batch
                .iter()
                .map(|(placement, expected)| swap_versioned(&mut table, placement, *expected))
                .collect::<StateResult<Vec<_>>>()
        };
        match written {
            Ok(stored) => {
                txn.commit().map_err(map_err!(Transaction))?;
                debug!(count = stored.len(), "placements written");
                Ok(stored)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    /// Delete a placement if its stored version still equals `expected`.
    pub fn delete_placement_if_version(&self, self_link: &str, expected: u64) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(PLACEMENTS).map_err(map_err!(Table))?;
            match check_version(&table, self_link, expected) {
                Ok(()) => table.remove(self_link).map(|_| ()).map_err(map_err!(Write)),
                Err(e) => Err(e),
            }
        };
        match removed {
            Ok(()) => {
                txn.commit().map_err(map_err!(Transaction))?;
                debug!(placement = %self_link, "placement deleted");
                Ok(())
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    // ── Resource pools ─────────────────────────────────────────────

    /// Insert or update a resource pool.
    pub fn put_pool(&self, pool: &ResourcePool) -> StateResult<()> {
        self.put_json(RESOURCE_POOLS, &pool.self_link, pool)?;
        debug!(pool = %pool.self_link, "resource pool stored");
        Ok(())
    }

    /// Read-modify-write a resource pool inside one write transaction.
    ///
    /// Returns `None`, writing nothing, when the pool does not exist. The
    /// pool's link is kept even if `apply` changes it.
    pub fn update_pool<R>(
        &self,
        self_link: &str,
        apply: impl FnOnce(&mut ResourcePool) -> R,
    ) -> StateResult<Option<R>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(RESOURCE_POOLS).map_err(map_err!(Table))?;
            let current: Option<ResourcePool> = match table.get(self_link).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            match current {
                Some(mut pool) => {
                    let result = apply(&mut pool);
                    pool.self_link = self_link.to_string();
                    let value = encode(&pool)?;
                    table
                        .insert(self_link, value.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(result)
                }
                None => None,
            }
        };
        if outcome.is_none() {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(None);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(pool = %self_link, "resource pool updated");
        Ok(outcome)
    }

    /// Insert a resource pool unless one with the same link exists.
    pub fn insert_pool_if_absent(&self, pool: &ResourcePool) -> StateResult<bool> {
        self.insert_json_if_absent(RESOURCE_POOLS, &pool.self_link, pool)
    }

    pub fn get_pool(&self, self_link: &str) -> StateResult<Option<ResourcePool>> {
        self.get_json(RESOURCE_POOLS, self_link)
    }

    pub fn list_pools(&self) -> StateResult<Vec<ResourcePool>> {
        self.list_json(RESOURCE_POOLS, |_: &ResourcePool| true)
    }

    /// Delete a resource pool. Returns true if it existed.
    pub fn delete_pool(&self, self_link: &str) -> StateResult<bool> {
        self.delete_key(RESOURCE_POOLS, self_link)
    }

    // ── Resource descriptions ──────────────────────────────────────

    pub fn put_description(&self, desc: &ResourceDescription) -> StateResult<()> {
        self.put_json(RESOURCE_DESCRIPTIONS, &desc.self_link, desc)
    }

    pub fn get_description(&self, self_link: &str) -> StateResult<Option<ResourceDescription>> {
        self.get_json(RESOURCE_DESCRIPTIONS, self_link)
    }

    pub fn list_descriptions(&self) -> StateResult<Vec<ResourceDescription>> {
        self.list_json(RESOURCE_DESCRIPTIONS, |_: &ResourceDescription| true)
    }

    pub fn delete_description(&self, self_link: &str) -> StateResult<bool> {
        self.delete_key(RESOURCE_DESCRIPTIONS, self_link)
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Insert or update a host's inventory figures.
    pub fn put_host(&self, host: &HostInventory) -> StateResult<()> {
        self.put_json(HOSTS, &host.id, host)
    }

    pub fn get_host(&self, host_id: &str) -> StateResult<Option<HostInventory>> {
        self.get_json(HOSTS, host_id)
    }

    pub fn list_hosts(&self) -> StateResult<Vec<HostInventory>> {
        self.list_json(HOSTS, |_: &HostInventory| true)
    }

    pub fn list_hosts_in_pool(&self, resource_pool_link: &str) -> StateResult<Vec<HostInventory>> {
        self.list_json(HOSTS, |h: &HostInventory| {
            h.resource_pool_link == resource_pool_link
        })
    }

    /// Delete a host. Returns true if it existed.
    pub fn delete_host(&self, host_id: &str) -> StateResult<bool> {
        self.delete_key(HOSTS, host_id)
    }
}

/// Fail with `NotFound` / `VersionConflict` unless the stored placement is at `expected`.
fn check_version(
    table: &Table<'_, &'static str, &'static [u8]>,
    self_link: &str,
    expected: u64,
) -> StateResult<()> {
    let found = match table.get(self_link).map_err(map_err!(Read))? {
        Some(guard) => decode::<GroupResourcePlacement>(guard.value())?.version,
        None => return Err(StateError::NotFound(self_link.to_string())),
    };
    if found != expected {
        return Err(StateError::VersionConflict {
            key: self_link.to_string(),
            expected,
            found,
        });
    }
    Ok(())
}

fn write_placement_in(
    txn: &WriteTransaction,
    placement: &GroupResourcePlacement,
    expected: Option<u64>,
    within_pool_capacity: bool,
) -> StateResult<GroupResourcePlacement> {
    let mut table = txn.open_table(PLACEMENTS).map_err(map_err!(Table))?;
    if within_pool_capacity {
        let pools = txn.open_table(RESOURCE_POOLS).map_err(map_err!(Table))?;
        check_pool_headroom(&table, &pools, placement)?;
    }
    match expected {
        Some(expected) => swap_versioned(&mut table, placement, expected),
        None => {
            if table.get(placement.self_link.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(placement.self_link.clone()));
            }
            let mut stored = placement.clone();
            stored.version = 1;
            let value = encode(&stored)?;
            table
                .insert(stored.self_link.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            Ok(stored)
        }
    }
}

/// Fail unless `placement`'s memory limit fits in its pool next to the
/// limits of every other placement drawing from that pool.
///
/// Memory-unbounded placements and unbounded pools always fit.
fn check_pool_headroom(
    placements: &Table<'_, &'static str, &'static [u8]>,
    pools: &Table<'_, &'static str, &'static [u8]>,
    placement: &GroupResourcePlacement,
) -> StateResult<()> {
    if !placement.is_memory_bounded() {
        return Ok(());
    }
    let pool_link = placement.resource_pool_link.as_str();
    let pool: ResourcePool = match pools.get(pool_link).map_err(map_err!(Read))? {
        Some(guard) => decode(guard.value())?,
        None => return Err(StateError::PoolNotFound(pool_link.to_string())),
    };
    if pool.is_unbounded() {
        return Ok(());
    }

    let mut others: i64 = 0;
    for entry in placements.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value() == placement.self_link {
            continue;
        }
        let sibling: GroupResourcePlacement = decode(value.value())?;
        if sibling.resource_pool_link == pool_link {
            others = others.saturating_add(sibling.memory_limit);
        }
    }

    let headroom = pool.max_memory_bytes.saturating_sub(others).max(0);
    if placement.memory_limit > headroom {
        return Err(StateError::PoolCapacityExceeded {
            pool: pool_link.to_string(),
            requested: placement.memory_limit,
            headroom,
        });
    }
    Ok(())
}

fn swap_versioned(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    placement: &GroupResourcePlacement,
    expected: u64,
) -> StateResult<GroupResourcePlacement> {
    check_version(table, &placement.self_link, expected)?;
    let mut next = placement.clone();
    next.version = expected + 1;
    let value = encode(&next)?;
    table
        .insert(next.self_link.as_str(), value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(next)
}
