//! Custom Resource Definitions for the fleetops operator
//!
//! The fleet model is layered: a `RunnerDeployment` owns revisioned
//! `RunnerReplicaSet`s, each of which owns `Runner`s, each of which owns one
//! Pod. A `HorizontalRunnerAutoscaler` targets a single `RunnerDeployment`
//! and drives its replica count. A `RunnerSet` is a standalone
//! StatefulSet-backed fleet for workloads that need stable identities.

mod autoscaler;
mod runner;
mod runner_deployment;
mod runner_replica_set;
mod runner_set;

pub use autoscaler::{
    validate_single_autoscaler_target, CacheEntry, CapacityReservation,
    HorizontalRunnerAutoscaler, HorizontalRunnerAutoscalerSpec, HorizontalRunnerAutoscalerStatus,
    MetricSpec, RecurrenceFrequency, RecurrenceRule, ScaleTargetRef, ScaleUpTrigger,
    ScheduledOverride, TriggerEvent,
};
pub use runner::{
    Runner, RunnerConfig, RunnerPhase, RunnerPodSpec, RunnerRegistrationStatus, RunnerSpec,
    RunnerStatus, RunnerTemplate, TemplateMetadata, WorkVolumeClaimTemplate, WorkflowStatus,
};
pub use runner_deployment::{
    DeploymentStrategy, RunnerDeployment, RunnerDeploymentSpec, RunnerDeploymentStatus,
};
pub use runner_replica_set::{
    RunnerReplicaSet, RunnerReplicaSetSpec, RunnerReplicaSetStatus, Selector,
};
pub use runner_set::{RunnerSet, RunnerSetSpec, RunnerSetStatus};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status condition shared by all fleet resources
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCondition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the condition transitioned
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

/// Resource requirements for containers
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// Resource limits
    #[serde(default)]
    pub limits: ResourceList,
    /// Resource requests
    #[serde(default)]
    pub requests: ResourceList,
}

/// Resource quantities
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct ResourceList {
    /// CPU limit/request (e.g., "500m", "2")
    #[serde(default)]
    pub cpu: Option<String>,
    /// Memory limit/request (e.g., "512Mi", "2Gi")
    #[serde(default)]
    pub memory: Option<String>,
}

/// Environment variable
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// Environment variable name
    pub name: String,
    /// Environment variable value
    #[serde(default)]
    pub value: Option<String>,
}
