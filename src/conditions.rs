//! Kubernetes-standard status condition helpers
//!
//! Provides constants and builder functions for managing status conditions
//! across all CRDs following the Kubernetes API conventions.

use chrono::Utc;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// Condition types shared by all fleet resources
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const CONDITION_DEGRADED: &str = "Degraded";
pub const CONDITION_AVAILABLE: &str = "Available";

// Finalizer names
pub const RUNNER_FINALIZER: &str = "fleetops.io/runner-cleanup";
pub const RUNNER_SET_FINALIZER: &str = "fleetops.io/runnerset-cleanup";

// Annotation set by a RunnerReplicaSet to let a busy runner be evicted
// during scale-to-zero
pub const ANNOTATION_FORCE_EVICTION: &str = "fleetops.io/force-eviction";

// Label carrying the canonical template hash on child resources
pub const LABEL_TEMPLATE_HASH: &str = "fleetops.io/runner-template-hash";

// Label tying owned resources back to their parent by name
pub const LABEL_OWNED_BY: &str = "fleetops.io/owned-by";

/// Build a condition with the current timestamp.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> ConditionFields {
    ConditionFields {
        condition_type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Generic condition fields that can be converted into any CRD-specific condition type.
#[derive(Debug, Clone)]
pub struct ConditionFields {
    pub condition_type: String,
    pub status: String,
    pub last_transition_time: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ConditionFields {
    pub fn into_resource_condition(self) -> crate::crd::ResourceCondition {
        crate::crd::ResourceCondition {
            r#type: self.condition_type,
            status: self.status,
            last_transition_time: self.last_transition_time,
            reason: self.reason,
            message: self.message,
        }
    }
}

/// Set or update a condition in a list, preserving lastTransitionTime when status hasn't changed.
pub fn set_condition(conditions: &mut Vec<ConditionFields>, new: ConditionFields) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == new.condition_type)
    {
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

/// Rebuild `ConditionFields` from previously stored resource conditions so
/// that transition times survive across reconciles.
pub fn from_resource_conditions(stored: &[crate::crd::ResourceCondition]) -> Vec<ConditionFields> {
    stored
        .iter()
        .map(|c| ConditionFields {
            condition_type: c.r#type.clone(),
            status: c.status.clone(),
            last_transition_time: c.last_transition_time.clone(),
            reason: c.reason.clone(),
            message: c.message.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_condition() {
        let cond = build_condition(CONDITION_READY, CONDITION_TRUE, "AllReady", "All runners ready");
        assert_eq!(cond.condition_type, "Ready");
        assert_eq!(cond.status, "True");
        assert!(cond.last_transition_time.is_some());
        assert_eq!(cond.reason.as_deref(), Some("AllReady"));
        assert_eq!(cond.message.as_deref(), Some("All runners ready"));
    }

    #[test]
    fn test_set_condition_adds_new() {
        let mut conditions = Vec::new();
        let cond = build_condition("Ready", CONDITION_TRUE, "OK", "ok");
        set_condition(&mut conditions, cond);
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn test_set_condition_preserves_transition_time_on_same_status() {
        let mut conditions = Vec::new();
        let cond1 = ConditionFields {
            condition_type: "Ready".to_string(),
            status: CONDITION_TRUE.to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: Some("First".to_string()),
            message: Some("first".to_string()),
        };
        conditions.push(cond1);

        let cond2 = build_condition("Ready", CONDITION_TRUE, "Second", "second");
        set_condition(&mut conditions, cond2);

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
        let mut conditions = Vec::new();
        let cond1 = ConditionFields {
            condition_type: "Ready".to_string(),
            status: CONDITION_FALSE.to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: Some("NotReady".to_string()),
            message: Some("not ready".to_string()),
        };
        conditions.push(cond1);

        let cond2 = build_condition("Ready", CONDITION_TRUE, "AllReady", "all ready");
        set_condition(&mut conditions, cond2);

        assert_eq!(conditions.len(), 1);
        // Transition time updated because status changed
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_roundtrip_through_stored_conditions() {
        let cond = build_condition("Degraded", CONDITION_FALSE, "Healthy", "healthy");
        let stored = vec![cond.into_resource_condition()];
        let restored = from_resource_conditions(&stored);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].condition_type, "Degraded");
        assert_eq!(restored[0].status, "False");
    }
}
