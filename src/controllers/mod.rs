//! Controllers for the fleetops operator
//!
//! Each controller watches its CRD and reconciles actual state with the
//! desired state. The cascade runs RunnerDeployment → RunnerReplicaSet →
//! Runner → Pod, with the HorizontalRunnerAutoscaler writing the
//! deployment's replica count from the outside.

mod autoscaler;
mod runner;
mod runner_deployment;
mod runner_replica_set;
mod runner_set;

pub use autoscaler::{
    compute_desired_replicas, AutoscalerController, DesiredReplicas, DesiredReplicasInput,
};
pub use runner::{RunnerController, RunnerDefaults};
pub use runner_deployment::RunnerDeploymentController;
pub use runner_replica_set::RunnerReplicaSetController;
pub use runner_set::RunnerSetController;

use crate::error::OperatorError;
use kube::runtime::controller::Action;
use std::time::Duration;

/// Requeue policy for controller reconciliation failures.
/// Categorizes errors by severity to choose appropriate retry delays.
pub(crate) fn error_policy_backoff<K>(
    _object: std::sync::Arc<K>,
    error: &OperatorError,
    _ctx: std::sync::Arc<impl std::any::Any + Send + Sync>,
) -> Action {
    let delay_secs = match error {
        // Conflicts resolve on a fresh read — retry quickly
        OperatorError::Conflict(_) => 2,
        // Transient K8s API errors
        OperatorError::KubeApi(_) => 10,
        // Resource not yet available — moderate wait
        OperatorError::NotFound(_) => 15,
        // Provider hiccups — give the other side a moment
        OperatorError::Provider(_) => 30,
        // Rate limits need real breathing room
        OperatorError::RateLimited(_) => 120,
        // State issues — longer wait
        OperatorError::InvalidState(_) => 30,
        // User/config errors unlikely to self-heal — back off further
        OperatorError::Validation(_)
        | OperatorError::Configuration(_)
        | OperatorError::Serialization(_) => 60,
    };

    Action::requeue(Duration::from_secs(delay_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_backoff_ordering() {
        let requeue = |err: OperatorError| {
            error_policy_backoff(Arc::new(()), &err, Arc::new(()))
        };

        // Conflicts retry faster than provider failures, which retry faster
        // than rate limits.
        assert_eq!(
            requeue(OperatorError::Conflict("v".into())),
            Action::requeue(Duration::from_secs(2))
        );
        assert_eq!(
            requeue(OperatorError::Provider("x".into())),
            Action::requeue(Duration::from_secs(30))
        );
        assert_eq!(
            requeue(OperatorError::RateLimited("x".into())),
            Action::requeue(Duration::from_secs(120))
        );
    }
}
