//! Runner Custom Resource Definition
//!
//! A `Runner` is one logical self-hosted runner: the registration credential,
//! the backing Pod, and the Provider-side registry entry move together
//! through its lifecycle.

use crate::crd::{EnvVar, ResourceCondition, ResourceRequirements};
use crate::error::{OperatorError, Result};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Runner is the Schema for the runners API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "fleetops.io",
    version = "v1alpha1",
    kind = "Runner",
    namespaced,
    status = "RunnerStatus",
    printcolumn = r#"{"name":"Enterprise","type":"string","jsonPath":".spec.enterprise"}"#,
    printcolumn = r#"{"name":"Organization","type":"string","jsonPath":".spec.organization"}"#,
    printcolumn = r#"{"name":"Repository","type":"string","jsonPath":".spec.repository"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSpec {
    /// Registration target and runner identity
    #[serde(flatten)]
    pub config: RunnerConfig,

    /// Pod-level settings for the runner container
    #[serde(flatten)]
    pub pod: RunnerPodSpec,
}

/// Registration target and runner identity settings.
///
/// Exactly one of `enterprise`, `organization`, `repository` must be set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Enterprise slug this runner registers against
    #[serde(default)]
    pub enterprise: Option<String>,

    /// Organization login this runner registers against
    #[serde(default)]
    pub organization: Option<String>,

    /// Repository in "owner/name" form this runner registers against
    #[serde(default)]
    pub repository: Option<String>,

    /// Runner group to join
    #[serde(default)]
    pub group: Option<String>,

    /// Custom registration labels advertised to the Provider
    #[serde(default)]
    pub labels: Vec<String>,

    /// Deregister and exit after a single job
    #[serde(default = "default_ephemeral")]
    pub ephemeral: bool,

    /// Container image for the runner process
    #[serde(default)]
    pub image: Option<String>,

    /// Image pull policy
    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,

    /// Enable the docker daemon for jobs
    #[serde(default = "default_true")]
    pub docker_enabled: bool,

    /// Run dockerd inside the runner container instead of a sidecar
    #[serde(default)]
    pub dockerd_within_runner: bool,

    /// Docker registry mirror URL passed to the daemon
    #[serde(default)]
    pub docker_registry_mirror: Option<String>,

    /// Image for the docker sidecar container
    #[serde(default)]
    pub docker_image: Option<String>,
}

/// Pod-level settings for the runner container
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunnerPodSpec {
    /// Additional environment variables
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Resource requirements for the runner container
    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Node selector for pod placement
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Service account name for the runner pod
    #[serde(default)]
    pub service_account_name: Option<String>,

    /// Image pull secret names
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,

    /// Volume claim template for the work directory; emptyDir when unset
    #[serde(default)]
    pub work_volume_claim_template: Option<WorkVolumeClaimTemplate>,

    /// Work directory mounted into the runner container
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
}

/// Volume claim template for the runner work directory
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkVolumeClaimTemplate {
    /// Storage class name for the claim
    #[serde(default)]
    pub storage_class_name: Option<String>,
    /// Requested size (e.g., "5Gi")
    #[serde(default = "default_work_volume_size")]
    pub size: String,
    /// Access modes for the claim
    #[serde(default = "default_access_modes")]
    pub access_modes: Vec<String>,
}

/// Template for materializing Runners inside a RunnerReplicaSet or
/// RunnerDeployment. Immutable once embedded; changes produce a new
/// template hash.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunnerTemplate {
    /// Labels and annotations stamped onto created Runners
    #[serde(default)]
    pub metadata: TemplateMetadata,
    /// Runner spec to instantiate
    pub spec: RunnerSpec,
}

/// Metadata subset carried by a RunnerTemplate
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    /// Labels stamped onto created Runners
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Annotations stamped onto created Runners
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Status of a Runner
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunnerStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: RunnerPhase,
    /// Whether the Provider has acknowledged this runner as online
    #[serde(default)]
    pub ready: bool,
    /// Cached registration credential
    #[serde(default)]
    pub registration: Option<RunnerRegistrationStatus>,
    /// Last time the Provider's runner list was consulted
    #[serde(default)]
    pub last_registration_check_time: Option<String>,
    /// Currently assigned workflow job, if any
    #[serde(default)]
    pub workflow: Option<WorkflowStatus>,
    /// Human-readable detail about the current phase
    #[serde(default)]
    pub message: Option<String>,
    /// Consecutive registration failures while in Registering
    #[serde(default)]
    pub registration_failures: i32,
    /// Conditions representing runner state
    #[serde(default)]
    pub conditions: Vec<ResourceCondition>,
}

/// Lifecycle phase of a Runner
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum RunnerPhase {
    /// Created, no Pod yet
    #[default]
    Pending,
    /// Pod created, Provider not yet aware
    Registering,
    /// Provider knows this runner
    Running,
    /// Deletion requested or recreate required
    Terminating,
    /// Registration retries exhausted
    Failed,
    /// Deregistered; awaiting garbage collection
    Deleted,
}

/// Cached registration credential issued by the Provider
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunnerRegistrationStatus {
    /// Short-lived registration token
    #[serde(default)]
    pub token: Option<String>,
    /// RFC 3339 expiry of the token
    #[serde(default)]
    pub expires_at: Option<String>,
    /// Name under which the runner registers, stable across pod restarts
    #[serde(default)]
    pub name: Option<String>,
}

/// Workflow job observed on a running runner
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    /// Job status reported by the Provider
    #[serde(default)]
    pub status: Option<String>,
    /// Provider-side job ID
    #[serde(default)]
    pub job_id: Option<i64>,
}

impl RunnerConfig {
    /// Exactly one of enterprise/organization/repository must be set.
    pub fn validate_target(&self) -> Result<()> {
        let set = [&self.enterprise, &self.organization, &self.repository]
            .iter()
            .filter(|t| t.as_ref().map(|s| !s.is_empty()).unwrap_or(false))
            .count();
        if set != 1 {
            return Err(OperatorError::Validation(format!(
                "exactly one of enterprise, organization, repository must be set, found {}",
                set
            )));
        }
        if let Some(repo) = &self.repository {
            if !repo.is_empty() && repo.split('/').filter(|s| !s.is_empty()).count() != 2 {
                return Err(OperatorError::Validation(format!(
                    "repository must be in owner/name form, got {:?}",
                    repo
                )));
            }
        }
        Ok(())
    }
}

impl RunnerSpec {
    /// Field-level validation applied by the admission layer on writes.
    pub fn validate(&self) -> Result<()> {
        self.config.validate_target()?;
        if let Some(tpl) = &self.pod.work_volume_claim_template {
            if tpl.access_modes.is_empty() {
                return Err(OperatorError::Validation(
                    "workVolumeClaimTemplate.accessModes must not be empty".to_string(),
                ));
            }
            for mode in &tpl.access_modes {
                if mode != "ReadWriteOnce" && mode != "ReadWriteMany" {
                    return Err(OperatorError::Validation(format!(
                        "unsupported work volume access mode {:?}",
                        mode
                    )));
                }
            }
            // Hook-provisioned work volumes carry one job's state and are
            // driven by job pods that need their own identity
            if !self.config.ephemeral {
                return Err(OperatorError::Validation(
                    "workVolumeClaimTemplate requires an ephemeral runner".to_string(),
                ));
            }
            if self
                .pod
                .service_account_name
                .as_deref()
                .unwrap_or_default()
                .is_empty()
            {
                return Err(OperatorError::Validation(
                    "workVolumeClaimTemplate requires serviceAccountName to be set".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// Default value functions
fn default_ephemeral() -> bool {
    true
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_true() -> bool {
    true
}

fn default_work_dir() -> String {
    "/runner/_work".to_string()
}

fn default_work_volume_size() -> String {
    "5Gi".to_string()
}

fn default_access_modes() -> Vec<String> {
    vec!["ReadWriteOnce".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_spec_defaults() {
        let spec: RunnerSpec = serde_json::from_str(r#"{"repository": "acme/widgets"}"#).unwrap();
        assert!(spec.config.ephemeral);
        assert!(spec.config.docker_enabled);
        assert!(!spec.config.dockerd_within_runner);
        assert_eq!(spec.config.image_pull_policy, "IfNotPresent");
        assert_eq!(spec.pod.work_dir, "/runner/_work");
    }

    #[test]
    fn test_runner_phase_default() {
        assert_eq!(RunnerPhase::default(), RunnerPhase::Pending);
    }

    #[test]
    fn test_validate_target_exactly_one() {
        let ok = RunnerConfig {
            organization: Some("acme".into()),
            ..Default::default()
        };
        assert!(ok.validate_target().is_ok());

        let none = RunnerConfig::default();
        assert!(none.validate_target().is_err());

        let both = RunnerConfig {
            organization: Some("acme".into()),
            repository: Some("acme/widgets".into()),
            ..Default::default()
        };
        assert!(both.validate_target().is_err());
    }

    #[test]
    fn test_validate_repository_form() {
        let bad = RunnerConfig {
            repository: Some("widgets".into()),
            ..Default::default()
        };
        assert!(bad.validate_target().is_err());

        let good = RunnerConfig {
            repository: Some("acme/widgets".into()),
            ..Default::default()
        };
        assert!(good.validate_target().is_ok());
    }

    #[test]
    fn test_validate_work_volume_access_modes() {
        let json = r#"{
            "organization": "acme",
            "workVolumeClaimTemplate": {"size": "10Gi", "accessModes": ["ReadOnlyMany"]}
        }"#;
        let spec: RunnerSpec = serde_json::from_str(json).unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_work_volume_requires_service_account() {
        let json = r#"{
            "organization": "acme",
            "serviceAccountName": "runner-hooks",
            "workVolumeClaimTemplate": {"size": "10Gi"}
        }"#;
        let spec: RunnerSpec = serde_json::from_str(json).unwrap();
        assert!(spec.validate().is_ok());

        let json = r#"{
            "organization": "acme",
            "workVolumeClaimTemplate": {"size": "10Gi"}
        }"#;
        let spec: RunnerSpec = serde_json::from_str(json).unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_work_volume_requires_ephemeral() {
        let json = r#"{
            "organization": "acme",
            "ephemeral": false,
            "serviceAccountName": "runner-hooks",
            "workVolumeClaimTemplate": {"size": "10Gi"}
        }"#;
        let spec: RunnerSpec = serde_json::from_str(json).unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_flattened_config_parses() {
        let json = r#"{
            "organization": "acme",
            "group": "default",
            "labels": ["gpu", "linux"],
            "image": "fleetops/runner:v2",
            "env": [{"name": "FOO", "value": "bar"}]
        }"#;
        let spec: RunnerSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.config.organization.as_deref(), Some("acme"));
        assert_eq!(spec.config.labels, vec!["gpu", "linux"]);
        assert_eq!(spec.pod.env.len(), 1);
    }
}
