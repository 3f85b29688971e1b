//! RunnerReplicaSet Custom Resource Definition
//!
//! A set of identical Runners. The reconciler keeps the number of
//! non-terminating owned Runners matching `selector` equal to `replicas`.

use crate::crd::{ResourceCondition, RunnerTemplate};
use crate::error::{OperatorError, Result};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// RunnerReplicaSet is the Schema for the runnerreplicasets API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "fleetops.io",
    version = "v1alpha1",
    kind = "RunnerReplicaSet",
    namespaced,
    status = "RunnerReplicaSetStatus",
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RunnerReplicaSetSpec {
    /// Desired number of Runners
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Label selector scoping which Runners this set owns
    pub selector: Selector,

    /// Template for created Runners
    pub template: RunnerTemplate,

    /// Monotonically non-decreasing timestamp ordering generations during
    /// rollouts; sets with larger effectiveTime are preferred sinks for
    /// replicas
    #[serde(default)]
    pub effective_time: Option<String>,
}

/// Label selector
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    /// Labels a Runner must carry to be owned by this set
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl Selector {
    /// Whether the given label set satisfies the selector.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// Status of a RunnerReplicaSet
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunnerReplicaSetStatus {
    /// Number of non-terminating owned Runners
    #[serde(default)]
    pub replicas: i32,
    /// Runners the Provider reports as online
    #[serde(default)]
    pub ready_replicas: i32,
    /// Online runners not currently running a job
    #[serde(default)]
    pub available_replicas: i32,
    /// Last observed generation
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Conditions representing set state
    #[serde(default)]
    pub conditions: Vec<ResourceCondition>,
}

impl RunnerReplicaSetSpec {
    /// Field-level validation applied by the admission layer on writes.
    pub fn validate(&self) -> Result<()> {
        if self.replicas < 0 {
            return Err(OperatorError::Validation(format!(
                "replicas must be >= 0, got {}",
                self.replicas
            )));
        }
        if self.selector.match_labels.is_empty() {
            return Err(OperatorError::Validation(
                "selector.matchLabels must not be empty".to_string(),
            ));
        }
        if !self.selector.matches(&self.template.metadata.labels) {
            return Err(OperatorError::Validation(
                "selector must match template labels".to_string(),
            ));
        }
        self.template.spec.validate()
    }
}

fn default_replicas() -> i32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_json(replicas: i32) -> String {
        format!(
            r#"{{
                "replicas": {},
                "selector": {{"matchLabels": {{"app": "runners"}}}},
                "template": {{
                    "metadata": {{"labels": {{"app": "runners"}}}},
                    "spec": {{"organization": "acme"}}
                }}
            }}"#,
            replicas
        )
    }

    #[test]
    fn test_replica_set_defaults() {
        let json = r#"{
            "selector": {"matchLabels": {"app": "runners"}},
            "template": {
                "metadata": {"labels": {"app": "runners"}},
                "spec": {"organization": "acme"}
            }
        }"#;
        let spec: RunnerReplicaSetSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.replicas, 1);
        assert!(spec.effective_time.is_none());
    }

    #[test]
    fn test_selector_matches() {
        let selector = Selector {
            match_labels: BTreeMap::from([("app".to_string(), "runners".to_string())]),
        };
        let mut labels = BTreeMap::new();
        assert!(!selector.matches(&labels));
        labels.insert("app".to_string(), "runners".to_string());
        labels.insert("extra".to_string(), "yes".to_string());
        assert!(selector.matches(&labels));
    }

    #[test]
    fn test_validate_rejects_negative_replicas() {
        let spec: RunnerReplicaSetSpec = serde_json::from_str(&spec_json(-1)).unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_selector_template_mismatch() {
        let json = r#"{
            "replicas": 1,
            "selector": {"matchLabels": {"app": "runners"}},
            "template": {
                "metadata": {"labels": {"app": "other"}},
                "spec": {"organization": "acme"}
            }
        }"#;
        let spec: RunnerReplicaSetSpec = serde_json::from_str(json).unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_well_formed_spec() {
        let spec: RunnerReplicaSetSpec = serde_json::from_str(&spec_json(3)).unwrap();
        assert!(spec.validate().is_ok());
    }
}
