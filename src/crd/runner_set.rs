//! RunnerSet Custom Resource Definition
//!
//! A StatefulSet-backed runner fleet. Unlike a RunnerDeployment, pods keep
//! stable network identities and may carry per-replica volume claims, which
//! suits runners with large warm caches.

use crate::crd::{ResourceCondition, RunnerConfig, RunnerPodSpec};
use crate::error::Result;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// RunnerSet is the Schema for the runnersets API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fleetops.io",
    version = "v1alpha1",
    kind = "RunnerSet",
    namespaced,
    status = "RunnerSetStatus",
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSetSpec {
    /// Desired number of runner pods
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Registration target and runner identity
    #[serde(flatten)]
    pub config: RunnerConfig,

    /// Pod-level settings for the runner container
    #[serde(flatten)]
    pub pod: RunnerPodSpec,
}

/// Status of a RunnerSet
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSetStatus {
    /// Observed pod count
    #[serde(default)]
    pub replicas: i32,
    /// Pods passing readiness
    #[serde(default)]
    pub ready_replicas: i32,
    /// Last observed generation
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Conditions representing set state
    #[serde(default)]
    pub conditions: Vec<ResourceCondition>,
}

impl RunnerSetSpec {
    /// Field-level validation applied by the admission layer on writes.
    pub fn validate(&self) -> Result<()> {
        if self.replicas < 0 {
            return Err(crate::error::OperatorError::Validation(format!(
                "replicas must be >= 0, got {}",
                self.replicas
            )));
        }
        self.config.validate_target()
    }
}

fn default_replicas() -> i32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_set_defaults() {
        let json = r#"{"organization": "acme"}"#;
        let spec: RunnerSetSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.replicas, 1);
        assert!(spec.config.ephemeral);
    }

    #[test]
    fn test_validate_requires_target() {
        let spec: RunnerSetSpec = serde_json::from_str("{}").unwrap();
        assert!(spec.validate().is_err());
    }
}
