//! RunnerDeployment Custom Resource Definition
//!
//! A revisioned collection of RunnerReplicaSets. Exactly one child set is
//! active (its template hash matches the current spec); stale sets are
//! drained and garbage-collected.

use crate::crd::{ResourceCondition, RunnerTemplate, Selector};
use crate::error::{OperatorError, Result};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// RunnerDeployment is the Schema for the runnerdeployments API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fleetops.io",
    version = "v1alpha1",
    kind = "RunnerDeployment",
    namespaced,
    status = "RunnerDeploymentStatus",
    shortname = "rdeploy",
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Up-To-Date","type":"integer","jsonPath":".status.updatedReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RunnerDeploymentSpec {
    /// Desired number of Runners. When a HorizontalRunnerAutoscaler targets
    /// this deployment it takes over this field; the user-set value then
    /// only seeds the initial count.
    #[serde(default)]
    pub replicas: Option<i32>,

    /// Label selector for child sets; defaults to the template labels
    #[serde(default)]
    pub selector: Option<Selector>,

    /// Template for created Runners
    pub template: RunnerTemplate,

    /// Rollout strategy applied on template changes
    #[serde(default)]
    pub strategy: DeploymentStrategy,
}

/// Rollout strategy for template changes
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStrategy {
    /// Strategy type (Recreate, RollingUpdate). Recreate switches all
    /// replicas to the new set in one step; runners are stateless
    /// single-job workers so this is the default.
    #[serde(default = "default_strategy_type")]
    pub r#type: String,
}

impl Default for DeploymentStrategy {
    fn default() -> Self {
        Self {
            r#type: default_strategy_type(),
        }
    }
}

/// Status of a RunnerDeployment
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunnerDeploymentStatus {
    /// Replica count the deployment is currently steering toward
    #[serde(default)]
    pub desired_replicas: Option<i32>,
    /// Non-terminating Runners across all child sets
    #[serde(default)]
    pub replicas: i32,
    /// Online Runners across all child sets
    #[serde(default)]
    pub ready_replicas: i32,
    /// Online Runners not currently running a job
    #[serde(default)]
    pub available_replicas: i32,
    /// Runners belonging to the active (current-hash) child set
    #[serde(default)]
    pub updated_replicas: i32,
    /// Template hash of the active child set
    #[serde(default)]
    pub template_hash: Option<String>,
    /// Last observed generation
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Conditions representing deployment state
    #[serde(default)]
    pub conditions: Vec<ResourceCondition>,
}

impl RunnerDeploymentSpec {
    /// The selector in effect: the explicit one, or the template labels.
    pub fn effective_selector(&self) -> Selector {
        match &self.selector {
            Some(s) => s.clone(),
            None => Selector {
                match_labels: self.template.metadata.labels.clone(),
            },
        }
    }

    /// Field-level validation applied by the admission layer on writes.
    pub fn validate(&self) -> Result<()> {
        if let Some(replicas) = self.replicas {
            if replicas < 0 {
                return Err(OperatorError::Validation(format!(
                    "replicas must be >= 0, got {}",
                    replicas
                )));
            }
        }
        if let Some(selector) = &self.selector {
            if !selector.matches(&self.template.metadata.labels) {
                return Err(OperatorError::Validation(
                    "selector must match template labels".to_string(),
                ));
            }
        }
        match self.strategy.r#type.as_str() {
            "Recreate" | "RollingUpdate" => {}
            other => {
                return Err(OperatorError::Validation(format!(
                    "unknown strategy type {:?}",
                    other
                )))
            }
        }
        self.template.spec.validate()
    }
}

fn default_strategy_type() -> String {
    "Recreate".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_deployment_defaults() {
        let json = r#"{
            "template": {
                "metadata": {"labels": {"app": "runners"}},
                "spec": {"repository": "acme/widgets"}
            }
        }"#;
        let spec: RunnerDeploymentSpec = serde_json::from_str(json).unwrap();
        assert!(spec.replicas.is_none());
        assert_eq!(spec.strategy.r#type, "Recreate");
    }

    #[test]
    fn test_effective_selector_falls_back_to_template_labels() {
        let json = r#"{
            "template": {
                "metadata": {"labels": {"app": "runners"}},
                "spec": {"repository": "acme/widgets"}
            }
        }"#;
        let spec: RunnerDeploymentSpec = serde_json::from_str(json).unwrap();
        let selector = spec.effective_selector();
        assert_eq!(
            selector.match_labels,
            BTreeMap::from([("app".to_string(), "runners".to_string())])
        );
    }

    #[test]
    fn test_validate_rejects_unknown_strategy() {
        let json = r#"{
            "template": {
                "metadata": {"labels": {"app": "runners"}},
                "spec": {"repository": "acme/widgets"}
            },
            "strategy": {"type": "BlueGreen"}
        }"#;
        let spec: RunnerDeploymentSpec = serde_json::from_str(json).unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_mismatched_selector() {
        let json = r#"{
            "selector": {"matchLabels": {"app": "other"}},
            "template": {
                "metadata": {"labels": {"app": "runners"}},
                "spec": {"repository": "acme/widgets"}
            }
        }"#;
        let spec: RunnerDeploymentSpec = serde_json::from_str(json).unwrap();
        assert!(spec.validate().is_err());
    }
}
