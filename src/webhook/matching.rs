//! Trigger matching
//!
//! An event feeds a reservation into an autoscaler when both hold:
//! the autoscaler's target fleet is registered where the event happened
//! (scope), and one of its triggers accepts the event's fields. Matching is
//! exhaustive over the trigger variants; within a variant all populated
//! fields are ANDed and an empty list places no constraint.

use crate::crd::{RunnerConfig, TriggerEvent};
use crate::webhook::events::{EventContext, EventKind};

/// Whether the event originates from the fleet's registration scope.
///
/// Repository fleets match on the full name, organization fleets on the
/// owner login. Enterprise fleets cannot be attributed from repository
/// payloads, so they participate only through workflow_job label matching.
pub fn scope_matches(config: &RunnerConfig, context: &EventContext) -> bool {
    if let Some(repository) = config.repository.as_deref().filter(|r| !r.is_empty()) {
        return repository == context.repository_full_name;
    }
    if let Some(organization) = config.organization.as_deref().filter(|o| !o.is_empty()) {
        return organization == context.owner;
    }
    if config
        .enterprise
        .as_deref()
        .filter(|e| !e.is_empty())
        .is_some()
    {
        return context.kind == EventKind::WorkflowJob;
    }
    false
}

/// Whether one trigger accepts the event. `runner_labels` are the target
/// template's registration labels, consulted by workflow_job triggers.
pub fn trigger_matches(
    trigger: &TriggerEvent,
    context: &EventContext,
    runner_labels: &[String],
) -> bool {
    match (trigger, context.kind) {
        (TriggerEvent::PullRequest { types, branches }, EventKind::PullRequest) => {
            list_accepts(types, context.action.as_deref())
                && list_accepts(branches, context.branch.as_deref())
        }
        (TriggerEvent::Push { branches }, EventKind::Push) => {
            list_accepts(branches, context.branch.as_deref())
        }
        (
            TriggerEvent::CheckRun {
                types,
                status,
                repositories,
            },
            EventKind::CheckRun,
        ) => {
            list_accepts(types, context.action.as_deref())
                && match status {
                    Some(required) => context.status.as_deref() == Some(required.as_str()),
                    None => true,
                }
                && list_accepts(repositories, Some(&context.repository_name))
        }
        (TriggerEvent::WorkflowJob {}, EventKind::WorkflowJob) => {
            // Only freshly queued jobs create demand, and the job must be
            // satisfiable by this fleet: every requested label present.
            context.action.as_deref() == Some("queued")
                && !context.labels.is_empty()
                && context
                    .labels
                    .iter()
                    .all(|l| runner_labels.iter().any(|r| r == l))
        }
        // Cross-shape pairs never match
        _ => false,
    }
}

/// An empty list accepts anything; a populated list requires membership.
fn list_accepts(list: &[String], value: Option<&str>) -> bool {
    if list.is_empty() {
        return true;
    }
    match value {
        Some(v) => list.iter().any(|item| item == v),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(kind: EventKind) -> EventContext {
        EventContext {
            kind,
            action: Some("created".to_string()),
            branch: Some("main".to_string()),
            status: Some("pending".to_string()),
            labels: Vec::new(),
            owner: "test".to_string(),
            repository_name: "valid".to_string(),
            repository_full_name: "test/valid".to_string(),
        }
    }

    fn repo_config(repository: &str) -> RunnerConfig {
        RunnerConfig {
            repository: Some(repository.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_scope_repository_full_name() {
        let ctx = context(EventKind::PullRequest);
        assert!(scope_matches(&repo_config("test/valid"), &ctx));
        assert!(!scope_matches(&repo_config("test/example"), &ctx));
    }

    #[test]
    fn test_scope_organization_owner() {
        let ctx = context(EventKind::PullRequest);
        let config = RunnerConfig {
            organization: Some("test".to_string()),
            ..Default::default()
        };
        assert!(scope_matches(&config, &ctx));

        let other = RunnerConfig {
            organization: Some("acme".to_string()),
            ..Default::default()
        };
        assert!(!scope_matches(&other, &ctx));
    }

    #[test]
    fn test_scope_enterprise_only_workflow_jobs() {
        let config = RunnerConfig {
            enterprise: Some("big-corp".to_string()),
            ..Default::default()
        };
        assert!(!scope_matches(&config, &context(EventKind::PullRequest)));
        assert!(scope_matches(&config, &context(EventKind::WorkflowJob)));
    }

    #[test]
    fn test_pull_request_types_and_branches_are_anded() {
        let trigger = TriggerEvent::PullRequest {
            types: vec!["created".to_string()],
            branches: vec!["main".to_string()],
        };
        assert!(trigger_matches(&trigger, &context(EventKind::PullRequest), &[]));

        let mut wrong_branch = context(EventKind::PullRequest);
        wrong_branch.branch = Some("develop".to_string());
        assert!(!trigger_matches(&trigger, &wrong_branch, &[]));

        let mut wrong_action = context(EventKind::PullRequest);
        wrong_action.action = Some("closed".to_string());
        assert!(!trigger_matches(&trigger, &wrong_action, &[]));
    }

    #[test]
    fn test_empty_lists_accept_anything() {
        let trigger = TriggerEvent::PullRequest {
            types: Vec::new(),
            branches: Vec::new(),
        };
        assert!(trigger_matches(&trigger, &context(EventKind::PullRequest), &[]));
    }

    #[test]
    fn test_check_run_repository_filter() {
        let trigger = TriggerEvent::CheckRun {
            types: vec!["created".to_string()],
            status: Some("pending".to_string()),
            repositories: vec!["valid".to_string(), "foo".to_string(), "bar".to_string()],
        };
        assert!(trigger_matches(&trigger, &context(EventKind::CheckRun), &[]));

        let mut other_repo = context(EventKind::CheckRun);
        other_repo.repository_name = "example".to_string();
        other_repo.repository_full_name = "test/example".to_string();
        assert!(!trigger_matches(&trigger, &other_repo, &[]));
    }

    #[test]
    fn test_check_run_status_must_match() {
        let trigger = TriggerEvent::CheckRun {
            types: Vec::new(),
            status: Some("pending".to_string()),
            repositories: Vec::new(),
        };
        let mut completed = context(EventKind::CheckRun);
        completed.status = Some("completed".to_string());
        assert!(!trigger_matches(&trigger, &completed, &[]));
    }

    #[test]
    fn test_workflow_job_label_subset_rule() {
        let trigger = TriggerEvent::WorkflowJob {};
        let runner_labels = vec!["custom-label".to_string()];

        let mut disjoint = context(EventKind::WorkflowJob);
        disjoint.action = Some("queued".to_string());
        disjoint.labels = vec!["self-hosted".to_string()];
        assert!(!trigger_matches(&trigger, &disjoint, &runner_labels));

        let mut matching = context(EventKind::WorkflowJob);
        matching.action = Some("queued".to_string());
        matching.labels = vec!["custom-label".to_string()];
        assert!(trigger_matches(&trigger, &matching, &runner_labels));
    }

    #[test]
    fn test_workflow_job_only_queued_actions() {
        let trigger = TriggerEvent::WorkflowJob {};
        let runner_labels = vec!["custom-label".to_string()];
        let mut completed = context(EventKind::WorkflowJob);
        completed.action = Some("completed".to_string());
        completed.labels = vec!["custom-label".to_string()];
        assert!(!trigger_matches(&trigger, &completed, &runner_labels));
    }

    #[test]
    fn test_cross_shape_pairs_never_match() {
        let trigger = TriggerEvent::Push { branches: Vec::new() };
        assert!(!trigger_matches(&trigger, &context(EventKind::PullRequest), &[]));
        let trigger = TriggerEvent::WorkflowJob {};
        assert!(!trigger_matches(&trigger, &context(EventKind::CheckRun), &[]));
    }
}
