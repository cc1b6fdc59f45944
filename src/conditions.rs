//! Kubernetes-standard status condition helpers
//!
//! Provides constants and builder functions for the OSRMCluster status
//! conditions following the Kubernetes API conventions.

use crate::crd::ClusterCondition;
use chrono::Utc;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// OSRMCluster condition types
pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_RECONCILE_SUCCESS: &str = "ReconcileSuccess";

/// Finalizer placed on every live OSRMCluster.
pub const CLUSTER_FINALIZER: &str = "ankri.io/osrm-operator";

/// Build a condition with the current timestamp.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> ClusterCondition {
    ClusterCondition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Set or update a condition in a list, preserving lastTransitionTime when
/// the status hasn't changed.
pub fn set_condition(conditions: &mut Vec<ClusterCondition>, new: ClusterCondition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == new.r#type) {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        conditions.push(new);
    }
}

/// Look up a condition's status by type.
pub fn condition_status<'a>(
    conditions: &'a [ClusterCondition],
    condition_type: &str,
) -> Option<&'a str> {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .map(|c| c.status.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_condition() {
        let cond = build_condition(
            CONDITION_AVAILABLE,
            CONDITION_TRUE,
            "AllProfilesAvailable",
            "2/2 routing deployments available",
        );
        assert_eq!(cond.r#type, "Available");
        assert_eq!(cond.status, "True");
        assert!(cond.last_transition_time.is_some());
        assert_eq!(cond.reason.as_deref(), Some("AllProfilesAvailable"));
    }

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        let cond = build_condition(CONDITION_RECONCILE_SUCCESS, CONDITION_TRUE, "OK", "ok");
        set_condition(&mut conditions, cond);
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn test_set_condition_preserves_transition_time_on_same_status() {
        let mut conditions = vec![ClusterCondition {
            r#type: "Available".to_string(),
            status: CONDITION_TRUE.to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: Some("First".to_string()),
            message: Some("first".to_string()),
        }];

        let cond = build_condition("Available", CONDITION_TRUE, "Second", "second");
        set_condition(&mut conditions, cond);

        assert_eq!(conditions.len(), 1);
        // Transition time preserved because status didn't change
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(conditions[0].reason.as_deref(), Some("Second"));
    }

    #[test]
    fn test_set_condition_updates_transition_time_on_status_change() {
        let mut conditions = vec![ClusterCondition {
            r#type: "Available".to_string(),
            status: CONDITION_FALSE.to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: Some("NotReady".to_string()),
            message: Some("not ready".to_string()),
        }];

        let cond = build_condition("Available", CONDITION_TRUE, "AllReady", "all ready");
        set_condition(&mut conditions, cond);

        assert_eq!(conditions.len(), 1);
        // Transition time updated because status changed
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_condition_status_lookup() {
        let conditions = vec![
            build_condition(CONDITION_AVAILABLE, CONDITION_FALSE, "JobRunning", "building"),
            build_condition(CONDITION_RECONCILE_SUCCESS, CONDITION_TRUE, "OK", "ok"),
        ];
        assert_eq!(
            condition_status(&conditions, CONDITION_AVAILABLE),
            Some(CONDITION_FALSE)
        );
        assert_eq!(condition_status(&conditions, "Degraded"), None);
    }
}
