//! Webhook event payloads and the fields derived from them
//!
//! Only the fields the trigger matcher consumes are deserialized; the rest
//! of the Provider's payload is ignored.

use crate::error::{OperatorError, Result};
use serde::Deserialize;

/// Supported event shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PullRequest,
    Push,
    CheckRun,
    WorkflowJob,
}

/// Fields derived from a webhook delivery, shared by all event shapes.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub kind: EventKind,
    /// Event action, e.g. "opened", "created", "queued"
    pub action: Option<String>,
    /// Branch the event refers to (base branch for pull requests)
    pub branch: Option<String>,
    /// check_run status, when present
    pub status: Option<String>,
    /// workflow_job labels, when present
    pub labels: Vec<String>,
    /// Repository owner login
    pub owner: String,
    /// Repository name without the owner
    pub repository_name: String,
    /// Repository "owner/name"
    pub repository_full_name: String,
}

#[derive(Deserialize)]
struct Repository {
    name: String,
    full_name: String,
    owner: Owner,
}

#[derive(Deserialize)]
struct Owner {
    login: String,
}

#[derive(Deserialize)]
struct PullRequestEvent {
    action: String,
    pull_request: PullRequestBody,
    repository: Repository,
}

#[derive(Deserialize)]
struct PullRequestBody {
    base: GitRef,
}

#[derive(Deserialize)]
struct GitRef {
    #[serde(rename = "ref")]
    git_ref: String,
}

#[derive(Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: Repository,
}

#[derive(Deserialize)]
struct CheckRunEvent {
    action: String,
    check_run: CheckRunBody,
    repository: Repository,
}

#[derive(Deserialize)]
struct CheckRunBody {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct WorkflowJobEvent {
    action: String,
    workflow_job: WorkflowJobBody,
    repository: Repository,
}

#[derive(Deserialize)]
struct WorkflowJobBody {
    #[serde(default)]
    labels: Vec<String>,
}

/// Parse a delivery into the derived matching fields.
///
/// Returns `Ok(None)` for event names the receiver does not scale on;
/// malformed bodies for supported events are an error.
pub fn parse_event(event_name: &str, body: &[u8]) -> Result<Option<EventContext>> {
    let context = match event_name {
        "pull_request" => {
            let event: PullRequestEvent = parse_body(body)?;
            EventContext {
                kind: EventKind::PullRequest,
                action: Some(event.action),
                branch: Some(event.pull_request.base.git_ref),
                status: None,
                labels: Vec::new(),
                owner: event.repository.owner.login,
                repository_name: event.repository.name,
                repository_full_name: event.repository.full_name,
            }
        }
        "push" => {
            let event: PushEvent = parse_body(body)?;
            EventContext {
                kind: EventKind::Push,
                action: None,
                branch: Some(strip_branch_ref(&event.git_ref)),
                status: None,
                labels: Vec::new(),
                owner: event.repository.owner.login,
                repository_name: event.repository.name,
                repository_full_name: event.repository.full_name,
            }
        }
        "check_run" => {
            let event: CheckRunEvent = parse_body(body)?;
            EventContext {
                kind: EventKind::CheckRun,
                action: Some(event.action),
                branch: None,
                status: event.check_run.status,
                labels: Vec::new(),
                owner: event.repository.owner.login,
                repository_name: event.repository.name,
                repository_full_name: event.repository.full_name,
            }
        }
        "workflow_job" => {
            let event: WorkflowJobEvent = parse_body(body)?;
            EventContext {
                kind: EventKind::WorkflowJob,
                action: Some(event.action),
                branch: None,
                status: None,
                labels: event.workflow_job.labels,
                owner: event.repository.owner.login,
                repository_name: event.repository.name,
                repository_full_name: event.repository.full_name,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(context))
}

fn parse_body<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| OperatorError::Validation(format!("malformed event payload: {}", e)))
}

/// "refs/heads/main" -> "main"
fn strip_branch_ref(git_ref: &str) -> String {
    git_ref
        .strip_prefix("refs/heads/")
        .unwrap_or(git_ref)
        .to_string()
}
