//! Condition management helpers following Kubernetes API conventions
//!
//! Conditions are recomputed on every pass from the previous status. The
//! transition time only moves when a condition's status flips, so a pass that
//! observes nothing new produces an identical list and no status write.

use chrono::Utc;

use crate::crd::Condition;

/// Standard condition types following Kubernetes conventions
pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";
pub const CONDITION_TYPE_DEGRADED: &str = "Degraded";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

// Reasons that are not validation reasons
pub const REASON_PENDING: &str = "Pending";
pub const REASON_PROVISIONING: &str = "Provisioning";
pub const REASON_AVAILABLE: &str = "Available";
pub const REASON_APPLY_FAILED: &str = "ApplyFailed";
pub const REASON_APPLY_REJECTED: &str = "ApplyRejected";
pub const REASON_FORBIDDEN: &str = "Forbidden";
pub const REASON_CHILD_FAILED: &str = "ChildFailed";
pub const REASON_STORAGE_SHRINK: &str = "StorageShrinkRejected";
pub const REASON_STORAGE_CLASS: &str = "StorageClassImmutable";
pub const REASON_CLEANUP_IN_PROGRESS: &str = "CleanupInProgress";
pub const REASON_CLEANUP_FAILED: &str = "CleanupFailed";

/// Update or add a condition, stamped with the generation it was computed from
///
/// The transition time only changes when the status changes.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    generation: i64,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = Utc::now().to_rfc3339();
            existing.status = status.to_string();
        }
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = Some(generation);
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: Some(generation),
        });
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == CONDITION_STATUS_TRUE)
}

/// True when the condition is set to True with the given reason
pub fn has_true_reason(conditions: &[Condition], type_: &str, reason: &str) -> bool {
    find_condition(conditions, type_)
        .is_some_and(|c| c.status == CONDITION_STATUS_TRUE && c.reason == reason)
}

pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn degraded(time: &str) -> Condition {
        Condition {
            type_: CONDITION_TYPE_DEGRADED.to_string(),
            status: CONDITION_STATUS_TRUE.to_string(),
            last_transition_time: time.to_string(),
            reason: REASON_APPLY_FAILED.to_string(),
            message: "timeout".to_string(),
            observed_generation: Some(1),
        }
    }

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            3,
            CONDITION_TYPE_READY,
            CONDITION_STATUS_TRUE,
            REASON_AVAILABLE,
            "accepting connections",
        );

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, CONDITION_TYPE_READY);
        assert_eq!(conditions[0].observed_generation, Some(3));
    }

    #[test]
    fn test_same_status_keeps_transition_time() {
        let mut conditions = vec![degraded("2024-01-01T00:00:00Z")];
        set_condition(
            &mut conditions,
            2,
            CONDITION_TYPE_DEGRADED,
            CONDITION_STATUS_TRUE,
            REASON_FORBIDDEN,
            "denied",
        );

        assert_eq!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert_eq!(conditions[0].reason, REASON_FORBIDDEN);
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn test_status_flip_moves_transition_time() {
        let mut conditions = vec![degraded("2024-01-01T00:00:00Z")];
        set_condition(
            &mut conditions,
            1,
            CONDITION_TYPE_DEGRADED,
            CONDITION_STATUS_FALSE,
            REASON_AVAILABLE,
            "",
        );

        assert_ne!(conditions[0].last_transition_time, "2024-01-01T00:00:00Z");
        assert!(!is_condition_true(&conditions, CONDITION_TYPE_DEGRADED));
    }

    #[test]
    fn test_reason_lookup_and_removal() {
        let mut conditions = vec![degraded("2024-01-01T00:00:00Z")];
        assert!(has_true_reason(&conditions, CONDITION_TYPE_DEGRADED, REASON_APPLY_FAILED));
        assert!(!has_true_reason(&conditions, CONDITION_TYPE_DEGRADED, REASON_CLEANUP_FAILED));
        assert!(find_condition(&conditions, CONDITION_TYPE_READY).is_none());

        remove_condition(&mut conditions, CONDITION_TYPE_DEGRADED);
        assert!(conditions.is_empty());
    }
}
