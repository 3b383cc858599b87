//! redb table definitions for the GridQuota state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Group resource placements keyed by `{self_link}`.
pub const PLACEMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("placements");

/// Resource pools keyed by `{self_link}`.
pub const RESOURCE_POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("resource_pools");

/// Resource descriptions keyed by `{self_link}`.
pub const RESOURCE_DESCRIPTIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("resource_descriptions");

/// Host inventory keyed by `{host_id}`.
pub const HOSTS: TableDefinition<&str, &[u8]> = TableDefinition::new("hosts");
