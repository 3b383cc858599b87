//! Reserve/release arithmetic over a single ledger.
//!
//! [`apply_reservation`] is pure: it mutates the ledger value it is given
//! and nothing else. Persistence and conflict handling live in
//! [`crate::service`], which re-runs this function against a fresh read
//! whenever a conditional write loses a race.
//!
//! A positive count reserves, a negative count releases. A reservation
//! either applies in full or fails without touching the ledger. A release
//! larger than what is reserved for the description is clamped and
//! reported through [`ReservationOutcome::clamped`].

use serde::{Deserialize, Serialize};
use tracing::warn;

use gridquota_state::GroupResourcePlacement;

use crate::error::{LedgerError, LedgerResult};

/// Signed reservation delta against one resource description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub resource_description_link: String,
    /// Positive reserves, negative releases.
    pub resource_count: i64,
}

impl ReservationRequest {
    pub fn reserve(resource_description_link: &str, count: i64) -> Self {
        Self {
            resource_description_link: resource_description_link.to_string(),
            resource_count: count,
        }
    }

    pub fn release(resource_description_link: &str, count: i64) -> Self {
        Self::reserve(resource_description_link, -count)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.resource_description_link.trim().is_empty() {
            return Err(LedgerError::Validation(
                "resource_description_link is required".to_string(),
            ));
        }
        if self.resource_count == 0 {
            return Err(LedgerError::Validation(
                "resource_count must not be zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a reserve/release call actually did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationOutcome {
    /// Signed instance delta applied (may be smaller in magnitude than requested).
    pub applied_instances: i64,
    /// Signed memory delta applied to the description's memory quota.
    pub applied_memory: i64,
    /// True when a release was reduced to what was actually reserved.
    pub clamped: bool,
}

impl ReservationOutcome {
    pub fn is_noop(&self) -> bool {
        self.applied_instances == 0 && self.applied_memory == 0
    }
}

/// Apply a signed reservation delta to `placement`.
///
/// `unit_memory` is the per-instance memory cost of the description (0 when
/// it declares none).
pub fn apply_reservation(
    placement: &mut GroupResourcePlacement,
    resource_description_link: &str,
    count: i64,
    unit_memory: i64,
) -> LedgerResult<ReservationOutcome> {
    if count > 0 {
        reserve(placement, resource_description_link, count, unit_memory.max(0))
    } else if count < 0 {
        Ok(release(placement, resource_description_link, count.unsigned_abs()))
    } else {
        Ok(ReservationOutcome {
            applied_instances: 0,
            applied_memory: 0,
            clamped: false,
        })
    }
}

fn reserve(
    placement: &mut GroupResourcePlacement,
    desc_link: &str,
    count: i64,
    unit_memory: i64,
) -> LedgerResult<ReservationOutcome> {
    if placement.is_instance_bounded() && placement.available_instances_count < count {
        return Err(LedgerError::InsufficientInstances {
            placement: placement.self_link.clone(),
            requested: count,
            available: placement.available_instances_count,
        });
    }

    let memory = count.checked_mul(unit_memory).ok_or_else(|| {
        LedgerError::Validation(format!(
            "requested memory overflows: {count} x {unit_memory} bytes"
        ))
    })?;
    if placement.is_memory_bounded() && placement.available_memory < memory {
        return Err(LedgerError::InsufficientMemory {
            placement: placement.self_link.clone(),
            requested: memory,
            available: placement.available_memory,
        });
    }

    // Unbounded ledgers have no instance cap to stop the counters growing.
    let overflow = || {
        LedgerError::Validation(format!(
            "placement {}: reserving {count} more instances overflows its counters",
            placement.self_link
        ))
    };
    let allocated = placement
        .allocated_instances_count
        .checked_add(count)
        .ok_or_else(overflow)?;
    let desc_count = placement
        .resource_quota_per_resource_desc
        .get(desc_link)
        .copied()
        .unwrap_or(0)
        .checked_add(count)
        .ok_or_else(overflow)?;
    let desc_memory = placement
        .memory_quota_per_resource_desc
        .get(desc_link)
        .copied()
        .unwrap_or(0)
        .checked_add(memory)
        .ok_or_else(overflow)?;

    placement.allocated_instances_count = allocated;
    if placement.is_instance_bounded() {
        placement.available_instances_count -= count;
    }
    if placement.is_memory_bounded() {
        placement.available_memory -= memory;
    }
    placement
        .resource_quota_per_resource_desc
        .insert(desc_link.to_string(), desc_count);
    if memory > 0 {
        placement
            .memory_quota_per_resource_desc
            .insert(desc_link.to_string(), desc_memory);
    }

    Ok(ReservationOutcome {
        applied_instances: count,
        applied_memory: memory,
        clamped: false,
    })
}

fn release(
    placement: &mut GroupResourcePlacement,
    desc_link: &str,
    requested: u64,
) -> ReservationOutcome {
    let reserved = placement
        .resource_quota_per_resource_desc
        .get(desc_link)
        .copied()
        .unwrap_or(0)
        .max(0);
    let allocated = placement.allocated_instances_count.max(0);
    let requested = i64::try_from(requested).unwrap_or(i64::MAX);
    let amount = requested.min(reserved).min(allocated);
    let clamped = amount < requested;

    if clamped {
        warn!(
            placement = %placement.self_link,
            desc = %desc_link,
            requested,
            reserved,
            allocated,
            "release exceeds reservation, clamping"
        );
    }

    // Memory comes back in proportion to the instances released.
    let memory_entry = placement
        .memory_quota_per_resource_desc
        .get(desc_link)
        .copied()
        .unwrap_or(0)
        .max(0);
    let memory = if amount == 0 || reserved == 0 {
        0
    } else if amount == reserved {
        memory_entry
    } else {
        (i128::from(memory_entry) * i128::from(amount) / i128::from(reserved)) as i64
    };

    placement.allocated_instances_count = allocated - amount;
    if placement.is_instance_bounded() {
        placement.available_instances_count += amount;
    }
    if placement.is_memory_bounded() {
        placement.available_memory += memory;
    }
    decrement_entry(&mut placement.resource_quota_per_resource_desc, desc_link, amount);
    decrement_entry(&mut placement.memory_quota_per_resource_desc, desc_link, memory);

    ReservationOutcome {
        applied_instances: -amount,
        applied_memory: -memory,
        clamped,
    }
}

/// Subtract `amount` from a quota entry, removing it once it reaches zero.
fn decrement_entry(map: &mut std::collections::BTreeMap<String, i64>, key: &str, amount: i64) {
    if let Some(value) = map.get_mut(key) {
        *value -= amount;
        if *value <= 0 {
            map.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIT: i64 = 64 * 1024 * 1024;

    fn ledger(max_instances: i64, memory_limit: i64) -> GroupResourcePlacement {
        let mut p = GroupResourcePlacement::new("placements/team-a", "team-a", "pool-a");
        p.max_number_instances = max_instances;
        p.available_instances_count = max_instances;
        p.memory_limit = memory_limit;
        p.available_memory = memory_limit;
        p
    }

    #[test]
    fn reserve_within_instance_cap() {
        let mut p = ledger(10, 0);
        let outcome = apply_reservation(&mut p, "D", 8, UNIT).unwrap();

        assert_eq!(outcome.applied_instances, 8);
        assert_eq!(p.allocated_instances_count, 8);
        assert_eq!(p.available_instances_count, 2);
        assert_eq!(p.resource_quota_per_resource_desc["D"], 8);
        assert_eq!(p.available_memory, 0);
    }

    #[test]
    fn partial_release_returns_instances() {
        let mut p = ledger(10, 0);
        apply_reservation(&mut p, "D", 8, UNIT).unwrap();
        apply_reservation(&mut p, "D", -5, UNIT).unwrap();

        assert_eq!(p.allocated_instances_count, 3);
        assert_eq!(p.available_instances_count, 7);
        assert_eq!(p.resource_quota_per_resource_desc["D"], 3);
    }

    #[test]
    fn over_release_is_clamped_and_entry_removed() {
        let mut p = ledger(10, 0);
        apply_reservation(&mut p, "D", 8, UNIT).unwrap();
        apply_reservation(&mut p, "D", -5, UNIT).unwrap();
        let outcome = apply_reservation(&mut p, "D", -5, UNIT).unwrap();

        assert!(outcome.clamped);
        assert_eq!(outcome.applied_instances, -3);
        assert_eq!(p.allocated_instances_count, 0);
        assert_eq!(p.available_instances_count, 10);
        assert!(!p.resource_quota_per_resource_desc.contains_key("D"));
        assert!(p.memory_quota_per_resource_desc.is_empty());
    }

    #[test]
    fn memory_cap_rejects_without_mutation() {
        let mut p = ledger(0, 8 * UNIT + UNIT / 2);
        apply_reservation(&mut p, "D", 8, UNIT).unwrap();
        assert_eq!(p.available_memory, UNIT / 2);

        let before = p.clone();
        let err = apply_reservation(&mut p, "D", 1, UNIT).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientMemory { .. }));
        assert_eq!(p, before);
    }

    #[test]
    fn instance_cap_rejects_without_mutation() {
        let mut p = ledger(2, 0);
        let before = p.clone();
        let err = apply_reservation(&mut p, "D", 3, 0).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientInstances { requested: 3, available: 2, .. }
        ));
        assert_eq!(p, before);
    }

    #[test]
    fn unbounded_instances_still_track_allocation() {
        let mut p = ledger(0, 0);
        apply_reservation(&mut p, "D", 5, 0).unwrap();
        assert_eq!(p.allocated_instances_count, 5);
        assert_eq!(p.available_instances_count, 0);
        assert_eq!(p.reserved_instances(), 5);
    }

    #[test]
    fn release_of_unknown_description_is_noop() {
        let mut p = ledger(10, 0);
        apply_reservation(&mut p, "D", 4, 0).unwrap();
        let before = p.clone();

        let outcome = apply_reservation(&mut p, "E", -2, 0).unwrap();
        assert!(outcome.clamped);
        assert!(outcome.is_noop());
        assert_eq!(p, before);
    }

    #[test]
    fn memory_is_released_proportionally() {
        let mut p = ledger(0, 16 * UNIT);
        apply_reservation(&mut p, "D", 4, UNIT).unwrap();

        // The description changed its memory in between; release uses the
        // recorded quota, not the new unit cost.
        apply_reservation(&mut p, "D", -1, 2 * UNIT).unwrap();
        assert_eq!(p.memory_quota_per_resource_desc["D"], 3 * UNIT);
        assert_eq!(p.available_memory, 13 * UNIT);

        apply_reservation(&mut p, "D", -3, 2 * UNIT).unwrap();
        assert!(p.memory_quota_per_resource_desc.is_empty());
        assert_eq!(p.available_memory, 16 * UNIT);
    }

    #[test]
    fn distinct_descriptions_are_tracked_separately() {
        let mut p = ledger(10, 0);
        apply_reservation(&mut p, "D", 3, UNIT).unwrap();
        apply_reservation(&mut p, "E", 2, UNIT).unwrap();
        apply_reservation(&mut p, "D", -3, UNIT).unwrap();

        assert_eq!(p.allocated_instances_count, 2);
        assert_eq!(p.resource_quota_per_resource_desc.len(), 1);
        assert_eq!(p.memory_quota_per_resource_desc["E"], 2 * UNIT);
    }

    #[test]
    fn memory_overflow_is_a_validation_error() {
        let mut p = ledger(0, 0);
        let err = apply_reservation(&mut p, "D", i64::MAX, 2).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn instance_counter_overflow_is_a_validation_error() {
        let mut p = ledger(0, 0);
        apply_reservation(&mut p, "D", i64::MAX, 0).unwrap();
        let before = p.clone();

        let err = apply_reservation(&mut p, "D", 1, 0).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(p, before);

        // A different description still overflows the ledger-wide count.
        let err = apply_reservation(&mut p, "E", 1, 0).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(p, before);
        assert_eq!(p.allocated_instances_count, i64::MAX);
    }

    #[test]
    fn request_validation() {
        assert!(ReservationRequest::reserve("D", 1).validate().is_ok());
        assert!(ReservationRequest::release("D", 1).validate().is_ok());
        assert!(ReservationRequest::reserve(" ", 1).validate().is_err());
        assert!(ReservationRequest::reserve("D", 0).validate().is_err());
    }
}
