//! Host inventory aggregation.

use serde::{Deserialize, Serialize};
use tracing::debug;

use gridquota_core::UNBOUNDED_CAPACITY;
use gridquota_state::{HostInventory, ResourcePool, StateStore};

use crate::error::{CapacityError, CapacityResult};

/// Capacity snapshot delivered by a discovery cycle for one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityReport {
    pub resource_pool_link: String,
    pub max_memory_bytes: i64,
    #[serde(default)]
    pub max_storage_bytes: i64,
    #[serde(default)]
    pub max_cpu_count: i64,
}

/// Aggregate figures over all hosts of a pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolCapacity {
    /// [`UNBOUNDED_CAPACITY`] when any host's total memory is unknown.
    pub max_memory_bytes: i64,
    pub available_memory_bytes: i64,
    pub max_storage_bytes: i64,
    pub max_cpu_count: i64,
    /// Average CPU usage weighted by core count.
    pub cpu_usage: f64,
    pub host_count: usize,
}

impl PoolCapacity {
    pub fn to_report(&self, resource_pool_link: &str) -> CapacityReport {
        CapacityReport {
            resource_pool_link: resource_pool_link.to_string(),
            max_memory_bytes: self.max_memory_bytes,
            max_storage_bytes: self.max_storage_bytes,
            max_cpu_count: self.max_cpu_count,
        }
    }
}

/// Fold host inventory into pool capacity.
///
/// A host that does not report available memory is counted as fully free.
pub fn aggregate_hosts(hosts: &[HostInventory]) -> PoolCapacity {
    let mut memory_known = true;
    let mut max_memory: i64 = 0;
    let mut available: i64 = 0;
    let mut storage: i64 = 0;
    let mut cores: i64 = 0;
    let mut usage_sum = 0.0;

    for host in hosts {
        match host.total_memory_bytes {
            Some(total) => max_memory = max_memory.saturating_add(total.max(0)),
            None => memory_known = false,
        }
        let free = host.available_memory_bytes.or(host.total_memory_bytes).unwrap_or(0);
        available = available.saturating_add(free.max(0));
        storage = storage.saturating_add(host.storage_bytes.max(0));
        cores = cores.saturating_add(host.cpu_core_count.max(0));
        usage_sum += host.cpu_core_count.max(0) as f64 * host.cpu_usage;
    }

    PoolCapacity {
        max_memory_bytes: if memory_known { max_memory } else { UNBOUNDED_CAPACITY },
        available_memory_bytes: available,
        max_storage_bytes: storage,
        max_cpu_count: cores,
        cpu_usage: if cores > 0 { usage_sum / cores as f64 } else { 0.0 },
        host_count: hosts.len(),
    }
}

/// Copy reported capacity onto a pool record. Returns true when the
/// memory capacity changed.
fn set_capacity(pool: &mut ResourcePool, report: &CapacityReport) -> bool {
    let changed = pool.max_memory_bytes != report.max_memory_bytes;
    pool.max_memory_bytes = report.max_memory_bytes;
    pool.max_storage_bytes = report.max_storage_bytes;
    pool.max_cpu_count = report.max_cpu_count;
    pool.updated_at = crate::monitor::epoch_secs();
    changed
}

/// Write a capacity report into its pool. Returns true when the pool's
/// memory capacity changed.
pub fn apply_report(store: &StateStore, report: &CapacityReport) -> CapacityResult<bool> {
    let changed = store
        .update_pool(&report.resource_pool_link, |pool| set_capacity(pool, report))?
        .ok_or_else(|| CapacityError::PoolNotFound(report.resource_pool_link.clone()))?;
    debug!(
        pool = %report.resource_pool_link,
        max_memory = report.max_memory_bytes,
        changed,
        "capacity report applied"
    );
    Ok(changed)
}

/// Fold a pool's hosts into its record in a single write. A pool without
/// hosts keeps its declared capacity. Returns true when the memory capacity
/// changed.
pub fn refresh_from_hosts(store: &StateStore, resource_pool_link: &str) -> CapacityResult<bool> {
    let hosts = store.list_hosts_in_pool(resource_pool_link)?;
    if hosts.is_empty() {
        return Ok(false);
    }
    let capacity = aggregate_hosts(&hosts);
    let report = capacity.to_report(resource_pool_link);
    let changed = store
        .update_pool(resource_pool_link, |pool| {
            pool.available_memory_bytes = capacity.available_memory_bytes;
            pool.cpu_usage = capacity.cpu_usage;
            set_capacity(pool, &report)
        })?
        .ok_or_else(|| CapacityError::PoolNotFound(resource_pool_link.to_string()))?;
    debug!(
        pool = resource_pool_link,
        hosts = capacity.host_count,
        max_memory = capacity.max_memory_bytes,
        cpu_usage = capacity.cpu_usage,
        changed,
        "pool capacity refreshed from hosts"
    );
    Ok(changed)
}
