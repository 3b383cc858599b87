//! Ordered validator pipelines for ledger create, update and delete.
//!
//! Each validator is a plain function over the current state (if any), the
//! referenced pool and the proposed ledger. Pipelines run in order and stop
//! at the first failure, before anything is written.

use gridquota_core::MIN_MEMORY_LIMIT;
use gridquota_state::{GroupResourcePlacement, ResourcePool};

use crate::error::{LedgerError, LedgerResult};

/// Inputs a validator may consult besides the proposed ledger.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationContext<'a> {
    /// Persisted ledger being replaced; `None` on create.
    pub current: Option<&'a GroupResourcePlacement>,
    /// Pool the proposed ledger points at, if it exists.
    pub pool: Option<&'a ResourcePool>,
    /// Sum of `memory_limit` over the other ledgers in that pool.
    pub others_memory: i64,
}

pub type Validator = fn(&ValidationContext<'_>, &GroupResourcePlacement) -> LedgerResult<()>;

pub const CREATE_PIPELINE: &[Validator] = &[
    require_identity,
    reject_negative_fields,
    require_minimum_memory,
    require_pool,
    check_pool_capacity,
];

pub const UPDATE_PIPELINE: &[Validator] = &[
    require_identity,
    reject_negative_fields,
    require_minimum_memory,
    require_pool,
    guard_instance_shrink,
    guard_memory_shrink,
    guard_reserved_fields,
    check_pool_capacity,
];

/// Run validators in order, stopping at the first error.
pub fn run(
    pipeline: &[Validator],
    ctx: &ValidationContext<'_>,
    proposed: &GroupResourcePlacement,
) -> LedgerResult<()> {
    pipeline.iter().try_for_each(|validate| validate(ctx, proposed))
}

/// A ledger may only be deleted once nothing is reserved against it.
pub fn validate_delete(current: &GroupResourcePlacement) -> LedgerResult<()> {
    if current.has_active_reservations() {
        return Err(LedgerError::LedgerInUse(current.self_link.clone()));
    }
    Ok(())
}

pub fn require_identity(
    _ctx: &ValidationContext<'_>,
    proposed: &GroupResourcePlacement,
) -> LedgerResult<()> {
    if proposed.name.trim().is_empty() {
        return Err(LedgerError::Validation("name is required".to_string()));
    }
    if proposed.resource_pool_link.trim().is_empty() {
        return Err(LedgerError::Validation(
            "resource_pool_link is required".to_string(),
        ));
    }
    Ok(())
}

pub fn reject_negative_fields(
    _ctx: &ValidationContext<'_>,
    proposed: &GroupResourcePlacement,
) -> LedgerResult<()> {
    let fields = [
        ("max_number_instances", proposed.max_number_instances),
        ("memory_limit", proposed.memory_limit),
        ("storage_limit", proposed.storage_limit),
        ("cpu_shares", proposed.cpu_shares),
        ("priority", proposed.priority),
    ];
    match fields.iter().find(|(_, value)| *value < 0) {
        Some((field, value)) => Err(LedgerError::Validation(format!(
            "{field} must not be negative, got {value}"
        ))),
        None => Ok(()),
    }
}

pub fn require_minimum_memory(
    _ctx: &ValidationContext<'_>,
    proposed: &GroupResourcePlacement,
) -> LedgerResult<()> {
    if proposed.is_memory_bounded() && proposed.memory_limit < MIN_MEMORY_LIMIT {
        return Err(LedgerError::Validation(format!(
            "memory_limit must be 0 or at least {MIN_MEMORY_LIMIT} bytes, got {}",
            proposed.memory_limit
        )));
    }
    Ok(())
}

pub fn require_pool(
    ctx: &ValidationContext<'_>,
    proposed: &GroupResourcePlacement,
) -> LedgerResult<()> {
    match ctx.pool {
        Some(_) => Ok(()),
        None => Err(LedgerError::PoolNotFound(
            proposed.resource_pool_link.clone(),
        )),
    }
}

pub fn guard_instance_shrink(
    ctx: &ValidationContext<'_>,
    proposed: &GroupResourcePlacement,
) -> LedgerResult<()> {
    let Some(current) = ctx.current else {
        return Ok(());
    };
    if proposed.is_instance_bounded()
        && proposed.max_number_instances < current.allocated_instances_count
    {
        return Err(LedgerError::ImmutableFieldChanged(format!(
            "max_number_instances cannot be less than the {} currently reserved instances",
            current.allocated_instances_count
        )));
    }
    Ok(())
}

pub fn guard_memory_shrink(
    ctx: &ValidationContext<'_>,
    proposed: &GroupResourcePlacement,
) -> LedgerResult<()> {
    let Some(current) = ctx.current else {
        return Ok(());
    };
    let committed = current.committed_memory();
    if proposed.is_memory_bounded() && proposed.memory_limit < committed {
        return Err(LedgerError::ImmutableFieldChanged(format!(
            "memory_limit cannot be less than the {committed} bytes currently reserved"
        )));
    }
    Ok(())
}

/// Pool link, storage limit and CPU shares are frozen while anything is reserved.
pub fn guard_reserved_fields(
    ctx: &ValidationContext<'_>,
    proposed: &GroupResourcePlacement,
) -> LedgerResult<()> {
    let Some(current) = ctx.current else {
        return Ok(());
    };
    if !current.has_active_reservations() {
        return Ok(());
    }
    let changed = if current.resource_pool_link != proposed.resource_pool_link {
        Some("resource_pool_link")
    } else if current.storage_limit != proposed.storage_limit {
        Some("storage_limit")
    } else if current.cpu_shares != proposed.cpu_shares {
        Some("cpu_shares")
    } else {
        None
    };
    match changed {
        Some(field) => Err(LedgerError::ImmutableFieldChanged(format!(
            "{field} cannot be modified while placement {} has {} active instances",
            current.self_link, current.allocated_instances_count
        ))),
        None => Ok(()),
    }
}

/// Limits in a pool must fit the pool's current capacity.
///
/// Only checked when the ledger is new, moves pools or raises its memory
/// limit. Unbounded ledgers and unbounded pools always pass.
/// Whether writing `proposed` over `current` takes more of a pool's memory:
/// a new bounded ledger, a raised or newly bounded limit, or a pool move.
pub fn claims_pool_headroom(
    current: Option<&GroupResourcePlacement>,
    proposed: &GroupResourcePlacement,
) -> bool {
    if !proposed.is_memory_bounded() {
        return false;
    }
    match current {
        None => true,
        Some(current) => {
            !current.is_memory_bounded()
                || proposed.memory_limit > current.memory_limit
                || current.resource_pool_link != proposed.resource_pool_link
        }
    }
}

pub fn check_pool_capacity(
    ctx: &ValidationContext<'_>,
    proposed: &GroupResourcePlacement,
) -> LedgerResult<()> {
    if !claims_pool_headroom(ctx.current, proposed) {
        return Ok(());
    }
    let Some(pool) = ctx.pool else {
        return Ok(());
    };
    if pool.is_unbounded() {
        return Ok(());
    }

    if proposed.memory_limit > pool.max_memory_bytes {
        return Err(LedgerError::Validation(format!(
            "memory_limit {} exceeds the capacity of pool {} ({} bytes)",
            proposed.memory_limit, pool.self_link, pool.max_memory_bytes
        )));
    }
    let headroom = pool.max_memory_bytes.saturating_sub(ctx.others_memory);
    if proposed.memory_limit > headroom {
        return Err(LedgerError::Validation(format!(
            "pool {} has {} bytes unreserved, placement asks for {}",
            pool.self_link,
            headroom.max(0),
            proposed.memory_limit
        )));
    }
    Ok(())
}
