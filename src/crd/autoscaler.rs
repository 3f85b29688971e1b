//! HorizontalRunnerAutoscaler Custom Resource Definition
//!
//! Autoscaling policy targeting exactly one RunnerDeployment. The desired
//! replica count combines pull-based Provider metrics, event-driven capacity
//! reservations appended by the webhook receiver, and scheduled overrides.

use crate::crd::ResourceCondition;
use crate::error::{OperatorError, Result};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// HorizontalRunnerAutoscaler is the Schema for the horizontalrunnerautoscalers API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fleetops.io",
    version = "v1alpha1",
    kind = "HorizontalRunnerAutoscaler",
    namespaced,
    status = "HorizontalRunnerAutoscalerStatus",
    shortname = "hra",
    printcolumn = r#"{"name":"Min","type":"integer","jsonPath":".spec.minReplicas"}"#,
    printcolumn = r#"{"name":"Max","type":"integer","jsonPath":".spec.maxReplicas"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desiredReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalRunnerAutoscalerSpec {
    /// The RunnerDeployment whose replica count this autoscaler drives
    pub scale_target_ref: ScaleTargetRef,

    /// Lower bound for the desired replica count
    #[serde(default = "default_min_replicas")]
    pub min_replicas: i32,

    /// Upper bound for the desired replica count
    #[serde(default = "default_max_replicas")]
    pub max_replicas: i32,

    /// Minimum interval after a scale-up during which the desired count is
    /// not allowed to decrease
    #[serde(default = "default_scale_down_delay")]
    pub scale_down_delay_seconds_after_scale_up: i64,

    /// Pull-based metrics contributing the replica baseline
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,

    /// Event rules turning webhook deliveries into capacity reservations
    #[serde(default)]
    pub scale_up_triggers: Vec<ScaleUpTrigger>,

    /// Time-windowed min/max overrides
    #[serde(default)]
    pub scheduled_overrides: Vec<ScheduledOverride>,
}

/// Reference to the scaled RunnerDeployment
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    /// Name of the RunnerDeployment in the same namespace
    pub name: String,
}

/// Pull-based scaling metric
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type")]
pub enum MetricSpec {
    /// Scale to the number of queued plus in-progress workflow runs
    TotalNumberOfQueuedAndInProgressWorkflowRuns {
        /// Repositories to sum over; defaults to the target's own scope
        #[serde(default, rename = "repositoryNames")]
        repository_names: Vec<String>,
    },
    /// Scale by the fraction of busy runners at the target
    PercentageRunnersBusy {
        /// Busy fraction at or above which to scale up
        #[serde(default = "default_scale_up_threshold", rename = "scaleUpThreshold")]
        scale_up_threshold: f64,
        /// Busy fraction at or below which to scale down
        #[serde(default = "default_scale_down_threshold", rename = "scaleDownThreshold")]
        scale_down_threshold: f64,
        /// Multiplier applied on scale-up; must be > 1
        #[serde(default = "default_scale_up_factor", rename = "scaleUpFactor")]
        scale_up_factor: f64,
        /// Multiplier applied on scale-down; must be < 1
        #[serde(default = "default_scale_down_factor", rename = "scaleDownFactor")]
        scale_down_factor: f64,
    },
}

/// Rule converting a webhook event into a bounded-duration capacity
/// reservation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleUpTrigger {
    /// Event shape this trigger matches
    pub github_event: TriggerEvent,

    /// Replicas each matching event reserves
    #[serde(default = "default_trigger_amount")]
    pub amount: i32,

    /// Seconds the reservation stays active
    #[serde(default = "default_trigger_duration")]
    pub duration_seconds: i64,
}

/// Event matcher, one explicit variant per event shape. Matching is
/// exhaustive over the variants; within a variant all populated fields must
/// hold, and an empty list places no constraint.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TriggerEvent {
    /// pull_request events
    PullRequest {
        /// Actions to accept (e.g. "opened", "synchronize")
        #[serde(default)]
        types: Vec<String>,
        /// Base branches to accept
        #[serde(default)]
        branches: Vec<String>,
    },
    /// push events
    Push {
        /// Branches to accept
        #[serde(default)]
        branches: Vec<String>,
    },
    /// check_run events
    CheckRun {
        /// Actions to accept (e.g. "created")
        #[serde(default)]
        types: Vec<String>,
        /// Check-run status to require (e.g. "pending", "queued")
        #[serde(default)]
        status: Option<String>,
        /// Repository names to accept; empty accepts any
        #[serde(default)]
        repositories: Vec<String>,
    },
    /// workflow_job events; matched by job labels against the target's
    /// runner labels
    WorkflowJob {},
}

/// Time-windowed min/max override
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledOverride {
    /// RFC 3339 start of the window
    pub start_time: String,
    /// RFC 3339 end of the window
    pub end_time: String,
    /// Repeat the window periodically
    #[serde(default)]
    pub recurrence: Option<RecurrenceRule>,
    /// minReplicas in effect while active
    #[serde(default)]
    pub min_replicas: Option<i32>,
    /// maxReplicas in effect while active
    #[serde(default)]
    pub max_replicas: Option<i32>,
}

/// Recurrence of a scheduled override
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceRule {
    /// How often the window repeats
    pub frequency: RecurrenceFrequency,
    /// RFC 3339 time after which the window stops repeating
    #[serde(default)]
    pub until_time: Option<String>,
}

/// Recurrence frequency
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum RecurrenceFrequency {
    Daily,
    Weekly,
    Monthly,
}

/// Status of a HorizontalRunnerAutoscaler
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalRunnerAutoscalerStatus {
    /// Last observed generation
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Replica count last written to the target
    #[serde(default)]
    pub desired_replicas: Option<i32>,
    /// RFC 3339 time of the most recent scale-out
    #[serde(default)]
    pub last_successful_scale_out_time: Option<String>,
    /// Active and not-yet-collected event reservations
    #[serde(default)]
    pub capacity_reservations: Vec<CapacityReservation>,
    /// Persisted Provider metric cache; survives controller restarts
    #[serde(default)]
    pub cache_entries: Vec<CacheEntry>,
    /// Conditions representing autoscaler state
    #[serde(default)]
    pub conditions: Vec<ResourceCondition>,
}

/// Bounded-duration additive contribution to the desired replica count
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapacityReservation {
    /// RFC 3339 time from which the reservation counts
    pub effective_time: String,
    /// RFC 3339 time at which the reservation lapses
    pub expiration_time: String,
    /// Replicas reserved
    pub replicas: i32,
}

impl CapacityReservation {
    /// Active means `effectiveTime <= now < expirationTime`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let effective = parse_rfc3339(&self.effective_time);
        let expiration = parse_rfc3339(&self.expiration_time);
        match (effective, expiration) {
            (Some(eff), Some(exp)) => eff <= now && now < exp,
            _ => false,
        }
    }

    /// Expired reservations are garbage-collected on the next reconcile.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match parse_rfc3339(&self.expiration_time) {
            Some(exp) => exp <= now,
            // Unparseable timestamps are collected rather than kept forever
            None => true,
        }
    }
}

/// One persisted metric cache entry
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Cache key, e.g. "workflow_runs/queued"
    pub key: String,
    /// Cached metric value
    pub value: i32,
    /// RFC 3339 expiry of this entry
    pub expiration_time: String,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        parse_rfc3339(&self.expiration_time)
            .map(|exp| now < exp)
            .unwrap_or(false)
    }
}

impl HorizontalRunnerAutoscalerSpec {
    /// Field-level validation applied by the admission layer on writes.
    pub fn validate(&self) -> Result<()> {
        if self.scale_target_ref.name.is_empty() {
            return Err(OperatorError::Validation(
                "scaleTargetRef.name must be set".to_string(),
            ));
        }
        if self.min_replicas < 0 {
            return Err(OperatorError::Validation(format!(
                "minReplicas must be >= 0, got {}",
                self.min_replicas
            )));
        }
        if self.min_replicas > self.max_replicas {
            return Err(OperatorError::Validation(format!(
                "minReplicas ({}) must be <= maxReplicas ({})",
                self.min_replicas, self.max_replicas
            )));
        }
        for trigger in &self.scale_up_triggers {
            if trigger.amount <= 0 {
                return Err(OperatorError::Validation(format!(
                    "scaleUpTriggers.amount must be > 0, got {}",
                    trigger.amount
                )));
            }
            if trigger.duration_seconds <= 0 {
                return Err(OperatorError::Validation(format!(
                    "scaleUpTriggers.durationSeconds must be > 0, got {}",
                    trigger.duration_seconds
                )));
            }
        }
        for metric in &self.metrics {
            if let MetricSpec::PercentageRunnersBusy {
                scale_up_factor,
                scale_down_factor,
                ..
            } = metric
            {
                if *scale_up_factor <= 1.0 {
                    return Err(OperatorError::Validation(format!(
                        "scaleUpFactor must be > 1, got {}",
                        scale_up_factor
                    )));
                }
                if *scale_down_factor >= 1.0 || *scale_down_factor < 0.0 {
                    return Err(OperatorError::Validation(format!(
                        "scaleDownFactor must be in [0, 1), got {}",
                        scale_down_factor
                    )));
                }
            }
        }
        for override_ in &self.scheduled_overrides {
            let start = parse_rfc3339(&override_.start_time);
            let end = parse_rfc3339(&override_.end_time);
            match (start, end) {
                (Some(s), Some(e)) if s < e => {}
                (Some(_), Some(_)) => {
                    return Err(OperatorError::Validation(
                        "scheduledOverrides.startTime must precede endTime".to_string(),
                    ))
                }
                _ => {
                    return Err(OperatorError::Validation(
                        "scheduledOverrides times must be RFC 3339".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }
}

/// A RunnerDeployment must be targeted by at most one autoscaler. This is
/// the cross-object half of admission validation; the hook calls it with
/// the sibling autoscalers of the namespace being written to.
pub fn validate_single_autoscaler_target(
    candidate: &HorizontalRunnerAutoscalerSpec,
    candidate_name: &str,
    siblings: &[(String, ScaleTargetRef)],
) -> Result<()> {
    for (name, target) in siblings {
        if name != candidate_name && *target == candidate.scale_target_ref {
            return Err(OperatorError::Validation(format!(
                "RunnerDeployment {:?} is already targeted by autoscaler {:?}",
                candidate.scale_target_ref.name, name
            )));
        }
    }
    Ok(())
}

pub(crate) fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

// Default value functions
fn default_min_replicas() -> i32 {
    1
}

fn default_max_replicas() -> i32 {
    10
}

fn default_scale_down_delay() -> i64 {
    600
}

fn default_trigger_amount() -> i32 {
    1
}

fn default_trigger_duration() -> i64 {
    300
}

fn default_scale_up_threshold() -> f64 {
    0.8
}

fn default_scale_down_threshold() -> f64 {
    0.3
}

fn default_scale_up_factor() -> f64 {
    1.3
}

fn default_scale_down_factor() -> f64 {
    0.7
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_spec_defaults() {
        let json = r#"{"scaleTargetRef": {"name": "fleet"}}"#;
        let spec: HorizontalRunnerAutoscalerSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.min_replicas, 1);
        assert_eq!(spec.max_replicas, 10);
        assert_eq!(spec.scale_down_delay_seconds_after_scale_up, 600);
        assert!(spec.metrics.is_empty());
    }

    #[test]
    fn test_metric_spec_tagged_parsing() {
        let json = r#"{"type": "TotalNumberOfQueuedAndInProgressWorkflowRuns", "repositoryNames": ["a", "b"]}"#;
        let metric: MetricSpec = serde_json::from_str(json).unwrap();
        match metric {
            MetricSpec::TotalNumberOfQueuedAndInProgressWorkflowRuns { repository_names } => {
                assert_eq!(repository_names, vec!["a", "b"]);
            }
            _ => panic!("wrong variant"),
        }

        let json = r#"{"type": "PercentageRunnersBusy", "scaleUpThreshold": 0.9}"#;
        let metric: MetricSpec = serde_json::from_str(json).unwrap();
        match metric {
            MetricSpec::PercentageRunnersBusy {
                scale_up_threshold,
                scale_down_threshold,
                scale_up_factor,
                scale_down_factor,
            } => {
                assert_eq!(scale_up_threshold, 0.9);
                assert_eq!(scale_down_threshold, 0.3);
                assert_eq!(scale_up_factor, 1.3);
                assert_eq!(scale_down_factor, 0.7);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_trigger_event_tagged_parsing() {
        let json = r#"{
            "githubEvent": {"event": "pull_request", "types": ["opened"], "branches": ["main"]},
            "amount": 2,
            "durationSeconds": 60
        }"#;
        let trigger: ScaleUpTrigger = serde_json::from_str(json).unwrap();
        assert_eq!(trigger.amount, 2);
        match trigger.github_event {
            TriggerEvent::PullRequest { types, branches } => {
                assert_eq!(types, vec!["opened"]);
                assert_eq!(branches, vec!["main"]);
            }
            _ => panic!("wrong variant"),
        }

        let json = r#"{"githubEvent": {"event": "workflow_job"}}"#;
        let trigger: ScaleUpTrigger = serde_json::from_str(json).unwrap();
        assert_eq!(trigger.amount, 1);
        assert_eq!(trigger.duration_seconds, 300);
        assert!(matches!(trigger.github_event, TriggerEvent::WorkflowJob {}));
    }

    #[test]
    fn test_reservation_activity_window() {
        let now = Utc::now();
        let active = CapacityReservation {
            effective_time: (now - Duration::seconds(10)).to_rfc3339(),
            expiration_time: (now + Duration::seconds(50)).to_rfc3339(),
            replicas: 1,
        };
        assert!(active.is_active(now));
        assert!(!active.is_expired(now));

        let expired = CapacityReservation {
            effective_time: (now - Duration::seconds(120)).to_rfc3339(),
            expiration_time: (now - Duration::seconds(60)).to_rfc3339(),
            replicas: 1,
        };
        assert!(!expired.is_active(now));
        assert!(expired.is_expired(now));

        let future = CapacityReservation {
            effective_time: (now + Duration::seconds(60)).to_rfc3339(),
            expiration_time: (now + Duration::seconds(120)).to_rfc3339(),
            replicas: 1,
        };
        assert!(!future.is_active(now));
        assert!(!future.is_expired(now));
    }

    #[test]
    fn test_unparseable_reservation_is_collected() {
        let r = CapacityReservation {
            effective_time: "garbage".into(),
            expiration_time: "garbage".into(),
            replicas: 1,
        };
        assert!(!r.is_active(Utc::now()));
        assert!(r.is_expired(Utc::now()));
    }

    #[test]
    fn test_validate_bounds() {
        let json = r#"{"scaleTargetRef": {"name": "fleet"}, "minReplicas": 5, "maxReplicas": 2}"#;
        let spec: HorizontalRunnerAutoscalerSpec = serde_json::from_str(json).unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_factor_ranges() {
        let json = r#"{
            "scaleTargetRef": {"name": "fleet"},
            "metrics": [{"type": "PercentageRunnersBusy", "scaleUpFactor": 0.9}]
        }"#;
        let spec: HorizontalRunnerAutoscalerSpec = serde_json::from_str(json).unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_single_target_rule() {
        let json = r#"{"scaleTargetRef": {"name": "fleet"}}"#;
        let spec: HorizontalRunnerAutoscalerSpec = serde_json::from_str(json).unwrap();

        let siblings = vec![(
            "other-hra".to_string(),
            ScaleTargetRef {
                name: "fleet".to_string(),
            },
        )];
        assert!(validate_single_autoscaler_target(&spec, "my-hra", &siblings).is_err());
        // The candidate's own record doesn't count against it
        assert!(validate_single_autoscaler_target(&spec, "other-hra", &siblings).is_ok());
    }
}
