//! Provider API abstraction
//!
//! The hosted CI service ("the Provider") owns the runner registry and the
//! work queue. Reconcilers talk to it only through [`ProviderClient`];
//! transport, auth and rate-limit handling live in the implementation.

mod github;

pub use github::{GitHubClient, GitHubConfig};

use crate::crd::RunnerConfig;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Registration scope for runners and work queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Enterprise(String),
    Organization(String),
    /// "owner/name"
    Repository(String),
}

impl Target {
    /// Derive the target from a runner configuration. The configuration is
    /// expected to have passed `validate_target` already.
    pub fn from_config(config: &RunnerConfig) -> Result<Target> {
        if let Some(enterprise) = non_empty(&config.enterprise) {
            return Ok(Target::Enterprise(enterprise));
        }
        if let Some(organization) = non_empty(&config.organization) {
            return Ok(Target::Organization(organization));
        }
        if let Some(repository) = non_empty(&config.repository) {
            return Ok(Target::Repository(repository));
        }
        Err(OperatorError::Validation(
            "runner has no registration target".to_string(),
        ))
    }

    /// The owner portion for repository targets, the login/slug otherwise.
    pub fn owner(&self) -> &str {
        match self {
            Target::Enterprise(slug) => slug,
            Target::Organization(login) => login,
            Target::Repository(full) => full.split('/').next().unwrap_or(full),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|s| !s.is_empty()).cloned()
}

/// Short-lived credential authorizing a runner process to join the pool.
#[derive(Debug, Clone)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// A runner as seen by the Provider's registry.
#[derive(Debug, Clone)]
pub struct RunnerInfo {
    pub id: i64,
    pub name: String,
    /// "online" or "offline"
    pub status: String,
    pub busy: bool,
    pub labels: Vec<String>,
}

/// A workflow run in the Provider's work queue.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub id: i64,
    pub status: String,
}

/// Operations the reconcilers need from the Provider.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Issue a registration token scoped to `target`. Idempotent at the
    /// Provider; repeated calls return a fresh token.
    async fn create_registration_token(&self, target: &Target) -> Result<RegistrationToken>;

    /// Remove a registered runner. Returns `Conflict` while the runner is
    /// busy and `NotFound` when the registration is already gone.
    async fn remove_runner(&self, target: &Target, runner_id: i64) -> Result<()>;

    /// List runners registered at `target`.
    async fn list_runners(&self, target: &Target) -> Result<Vec<RunnerInfo>>;

    /// List workflow runs with the given status ("queued", "in_progress")
    /// for one repository in "owner/name" form.
    async fn list_workflow_runs(&self, repository: &str, status: &str)
        -> Result<Vec<WorkflowRun>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_config() {
        let config = RunnerConfig {
            organization: Some("acme".into()),
            ..Default::default()
        };
        assert_eq!(
            Target::from_config(&config).unwrap(),
            Target::Organization("acme".into())
        );

        let config = RunnerConfig {
            repository: Some("acme/widgets".into()),
            ..Default::default()
        };
        let target = Target::from_config(&config).unwrap();
        assert_eq!(target, Target::Repository("acme/widgets".into()));
        assert_eq!(target.owner(), "acme");
    }

    #[test]
    fn test_target_from_empty_config_fails() {
        assert!(Target::from_config(&RunnerConfig::default()).is_err());
    }

    #[test]
    fn test_empty_string_target_is_ignored() {
        let config = RunnerConfig {
            enterprise: Some(String::new()),
            organization: Some("acme".into()),
            ..Default::default()
        };
        assert_eq!(
            Target::from_config(&config).unwrap(),
            Target::Organization("acme".into())
        );
    }
}
