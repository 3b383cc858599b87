//! Domain types for the GridQuota state store.
//!
//! These types represent the persisted state of group resource placements
//! (quota ledgers), resource pools, resource descriptions and host
//! inventory. All types are serializable to/from JSON for storage in redb
//! tables and for the REST API.

use std::collections::BTreeMap;

use gridquota_core::{UNBOUNDED_CAPACITY, is_unbounded};
use serde::{Deserialize, Serialize};

/// Identity of a ledger, pool or description.
pub type SelfLink = String;

/// Unique identifier for a host in the inventory.
pub type HostId = String;

/// Kind of resource a placement reserves capacity for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    #[default]
    Container,
    Compute,
}

// ── Group resource placement ────────────────────────────────────────

/// Per-tenant-group, per-pool quota ledger.
///
/// Counter fields (`available_*`, `allocated_instances_count`, the quota
/// maps and `version`) are owned by the ledger service; values supplied by
/// clients on create/update are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupResourcePlacement {
    pub self_link: SelfLink,
    pub name: String,
    /// Scope path (tenant first, then business group). The first element is
    /// the fairness-grouping key.
    #[serde(default)]
    pub tenant_group: Vec<String>,
    pub resource_pool_link: SelfLink,
    #[serde(default)]
    pub resource_type: ResourceType,
    /// Lower value = higher precedence.
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub deployment_policy_link: Option<String>,
    /// 0 = unbounded.
    #[serde(default)]
    pub max_number_instances: i64,
    #[serde(default)]
    pub available_instances_count: i64,
    #[serde(default)]
    pub allocated_instances_count: i64,
    /// Memory limit in bytes, 0 = unbounded.
    #[serde(default)]
    pub memory_limit: i64,
    #[serde(default)]
    pub available_memory: i64,
    #[serde(default)]
    pub storage_limit: i64,
    #[serde(default)]
    pub cpu_shares: i64,
    /// Reserved instance count per resource description.
    #[serde(default)]
    pub resource_quota_per_resource_desc: BTreeMap<SelfLink, i64>,
    /// Reserved memory bytes per resource description.
    #[serde(default)]
    pub memory_quota_per_resource_desc: BTreeMap<SelfLink, i64>,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl GroupResourcePlacement {
    /// A fresh, fully unbounded ledger with no reservations.
    pub fn new(self_link: &str, name: &str, resource_pool_link: &str) -> Self {
        Self {
            self_link: self_link.to_string(),
            name: name.to_string(),
            tenant_group: Vec::new(),
            resource_pool_link: resource_pool_link.to_string(),
            resource_type: ResourceType::Container,
            priority: 0,
            deployment_policy_link: None,
            max_number_instances: 0,
            available_instances_count: 0,
            allocated_instances_count: 0,
            memory_limit: 0,
            available_memory: 0,
            storage_limit: 0,
            cpu_shares: 0,
            resource_quota_per_resource_desc: BTreeMap::new(),
            memory_quota_per_resource_desc: BTreeMap::new(),
            version: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub fn is_instance_bounded(&self) -> bool {
        !is_unbounded(self.max_number_instances)
    }

    pub fn is_memory_bounded(&self) -> bool {
        !is_unbounded(self.memory_limit)
    }

    /// Memory committed to live reservations.
    pub fn committed_memory(&self) -> i64 {
        self.memory_quota_per_resource_desc.values().sum()
    }

    /// Sum of the per-description instance reservations.
    pub fn reserved_instances(&self) -> i64 {
        self.resource_quota_per_resource_desc.values().sum()
    }

    /// Whether any reservation is outstanding.
    pub fn has_active_reservations(&self) -> bool {
        self.allocated_instances_count > 0
            || !self.resource_quota_per_resource_desc.is_empty()
            || !self.memory_quota_per_resource_desc.is_empty()
    }

    /// First element of the tenant group, or the empty (global) key.
    pub fn fairness_key(&self) -> &str {
        self.tenant_group.first().map(String::as_str).unwrap_or("")
    }
}

// ── Resource pool ───────────────────────────────────────────────────

/// A capacity domain (a set of hosts).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourcePool {
    pub self_link: SelfLink,
    pub name: String,
    /// Aggregate memory; [`UNBOUNDED_CAPACITY`] when any host's memory is unknown.
    #[serde(default)]
    pub max_memory_bytes: i64,
    #[serde(default)]
    pub min_memory_bytes: i64,
    #[serde(default)]
    pub max_storage_bytes: i64,
    #[serde(default)]
    pub min_storage_bytes: i64,
    #[serde(default)]
    pub max_cpu_count: i64,
    #[serde(default)]
    pub min_cpu_count: i64,
    /// Free memory reported by the hosts at the last capacity update.
    #[serde(default)]
    pub available_memory_bytes: i64,
    /// Core-weighted average CPU usage (0.0–100.0) at the last capacity update.
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub updated_at: u64,
}

impl ResourcePool {
    pub fn new(self_link: &str, name: &str) -> Self {
        Self {
            self_link: self_link.to_string(),
            name: name.to_string(),
            max_memory_bytes: 0,
            min_memory_bytes: 0,
            max_storage_bytes: 0,
            min_storage_bytes: 0,
            max_cpu_count: 0,
            min_cpu_count: 0,
            available_memory_bytes: 0,
            cpu_usage: 0.0,
            updated_at: 0,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_memory_bytes == UNBOUNDED_CAPACITY
    }
}

// ── Resource description ────────────────────────────────────────────

/// Template whose instances consume ledger capacity when reserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDescription {
    pub self_link: SelfLink,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resource_type: ResourceType,
    /// Memory per instance in bytes; `None` means no declared limit.
    #[serde(default)]
    pub memory_limit: Option<i64>,
}

impl ResourceDescription {
    /// Per-instance memory cost charged against a ledger.
    pub fn unit_memory(&self) -> i64 {
        self.memory_limit.unwrap_or(0).max(0)
    }
}

// ── Host inventory ──────────────────────────────────────────────────

/// Latest inventory figures for one host in a pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostInventory {
    pub id: HostId,
    pub resource_pool_link: SelfLink,
    /// Total memory; `None` when discovery could not determine it.
    #[serde(default)]
    pub total_memory_bytes: Option<i64>,
    #[serde(default)]
    pub available_memory_bytes: Option<i64>,
    #[serde(default)]
    pub storage_bytes: i64,
    #[serde(default)]
    pub cpu_core_count: i64,
    /// CPU usage percentage (0.0–100.0).
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub updated_at: u64,
}
