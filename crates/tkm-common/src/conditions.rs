//! Ordered upsert over status conditions
//!
//! Conditions are unique by type. A condition keeps its position once added,
//! and `lastTransitionTime` moves only when the status flips; reason and
//! message updates alone leave it untouched.

use chrono::{DateTime, Utc};

use crate::crd::{Condition, ConditionStatus};

/// Insert or update a condition, stamping transitions with the current time.
///
/// Returns `true` if anything in the set changed.
pub fn upsert_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) -> bool {
    upsert_condition_at(conditions, type_, status, reason, message, Utc::now())
}

/// Insert or update a condition, stamping transitions with `now`.
pub fn upsert_condition_at(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> bool {
    let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now,
        });
        return true;
    };

    let mut changed = false;
    if existing.status != status {
        existing.status = status;
        existing.last_transition_time = now;
        changed = true;
    }
    if existing.reason != reason {
        existing.reason = reason.to_string();
        changed = true;
    }
    if existing.message != message {
        existing.message = message.to_string();
        changed = true;
    }
    changed
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check whether a condition of the given type is present and `True`
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}
