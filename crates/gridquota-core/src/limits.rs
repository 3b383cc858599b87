//! Limit conventions shared by the ledger, the redistributor and the
//! capacity source.

/// A `maxNumberInstances` of zero means the ledger has no instance cap.
pub const UNBOUNDED_INSTANCES: i64 = 0;

/// A `memoryLimit` of zero means the ledger has no memory cap.
pub const UNBOUNDED_MEMORY: i64 = 0;

/// Pool capacity reported when at least one host has unknown memory.
pub const UNBOUNDED_CAPACITY: i64 = i64::MAX;

/// Smallest non-zero memory limit a ledger may declare (4 MiB).
pub const MIN_MEMORY_LIMIT: i64 = 4 * 1024 * 1024;

pub const DEFAULT_RESOURCE_POOL_LINK: &str = "default-placement-zone";
pub const DEFAULT_PLACEMENT_LINK: &str = "default-resource-placement";

/// Instance cap of the global default placement.
pub const DEFAULT_PLACEMENT_MAX_INSTANCES: i64 = 1_000_000;

/// Priority of the global default placement.
pub const DEFAULT_PLACEMENT_PRIORITY: i64 = 100;

const GIB: i64 = 1024 * 1024 * 1024;

/// Bounds of the default resource pool.
pub const DEFAULT_POOL_MIN_MEMORY_BYTES: i64 = 46 * GIB;
pub const DEFAULT_POOL_MAX_MEMORY_BYTES: i64 = 2 * DEFAULT_POOL_MIN_MEMORY_BYTES;
pub const DEFAULT_POOL_STORAGE_BYTES: i64 = 1024 * GIB;
pub const DEFAULT_POOL_MIN_CPU_COUNT: i64 = 16;
pub const DEFAULT_POOL_MAX_CPU_COUNT: i64 = 1600;

/// Whether a limit value means "no cap".
pub fn is_unbounded(limit: i64) -> bool {
    limit == 0
}
