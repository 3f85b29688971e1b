//! GitHub implementation of the Provider API
//!
//! Talks to the GitHub REST API (or a GitHub Enterprise Server instance via
//! a custom base URL) using a personal access token.

use crate::error::{OperatorError, Result};
use crate::provider::{ProviderClient, RegistrationToken, RunnerInfo, Target, WorkflowRun};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("fleetops-operator/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PER_PAGE: u32 = 100;

/// Configuration for the GitHub client.
#[derive(Debug, Clone, Default)]
pub struct GitHubConfig {
    /// Personal access token
    pub token: String,
    /// API base URL; empty uses api.github.com
    pub base_url: String,
}

/// GitHub REST client
pub struct GitHubClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
}

impl GitHubClient {
    pub fn new(config: GitHubConfig) -> Result<Self> {
        if config.token.is_empty() {
            return Err(OperatorError::Configuration(
                "a Provider access token is required".to_string(),
            ));
        }
        let base_url = if config.base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            config.base_url.trim_end_matches('/').to_string()
        };
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            token: config.token,
            base_url,
        })
    }

    /// Path prefix for runner-registry endpoints at the given target.
    fn runners_path(&self, target: &Target) -> String {
        match target {
            Target::Enterprise(slug) => format!("{}/enterprises/{}/actions", self.base_url, slug),
            Target::Organization(login) => format!("{}/orgs/{}/actions", self.base_url, login),
            Target::Repository(full) => format!("{}/repos/{}/actions", self.base_url, full),
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
    }

    /// Map a non-success response onto the operator error taxonomy.
    async fn classify_error(response: reqwest::Response) -> OperatorError {
        let status = response.status();
        let remaining = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = response.text().await.unwrap_or_default();

        match status.as_u16() {
            404 => OperatorError::NotFound(body),
            409 => OperatorError::Conflict(body),
            // Busy runners fail deletion with 422
            422 if body.contains("busy") => OperatorError::Conflict(body),
            403 if remaining.as_deref() == Some("0") => OperatorError::RateLimited(body),
            _ => OperatorError::Provider(format!("status {}: {}", status, body)),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RunnersPage {
    #[serde(default)]
    total_count: i64,
    #[serde(default)]
    runners: Vec<ApiRunner>,
}

#[derive(Deserialize)]
struct ApiRunner {
    id: i64,
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    busy: bool,
    #[serde(default)]
    labels: Vec<ApiRunnerLabel>,
}

#[derive(Deserialize)]
struct ApiRunnerLabel {
    name: String,
}

#[derive(Deserialize)]
struct WorkflowRunsPage {
    #[serde(default)]
    workflow_runs: Vec<ApiWorkflowRun>,
}

#[derive(Deserialize)]
struct ApiWorkflowRun {
    #[serde(default)]
    id: i64,
    #[serde(default)]
    status: String,
}

#[async_trait]
impl ProviderClient for GitHubClient {
    async fn create_registration_token(&self, target: &Target) -> Result<RegistrationToken> {
        let url = format!("{}/runners/registration-token", self.runners_path(target));
        debug!(url = %url, "Requesting registration token");

        let response = self.request(reqwest::Method::POST, &url).send().await?;
        if !response.status().is_success() {
            return Err(Self::classify_error(response).await);
        }
        let body: TokenResponse = response.json().await?;
        Ok(RegistrationToken {
            token: body.token,
            expires_at: body.expires_at,
        })
    }

    async fn remove_runner(&self, target: &Target, runner_id: i64) -> Result<()> {
        let url = format!("{}/runners/{}", self.runners_path(target), runner_id);
        debug!(url = %url, "Removing runner registration");

        let response = self.request(reqwest::Method::DELETE, &url).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(Self::classify_error(response).await)
    }

    async fn list_runners(&self, target: &Target) -> Result<Vec<RunnerInfo>> {
        let mut runners = Vec::new();
        let mut page = 1u32;

        loop {
            let url = format!(
                "{}/runners?per_page={}&page={}",
                self.runners_path(target),
                PER_PAGE,
                page
            );
            let response = self.request(reqwest::Method::GET, &url).send().await?;
            if !response.status().is_success() {
                return Err(Self::classify_error(response).await);
            }
            let body: RunnersPage = response.json().await?;
            let fetched = body.runners.len();

            runners.extend(body.runners.into_iter().map(|r| RunnerInfo {
                id: r.id,
                name: r.name,
                status: r.status,
                busy: r.busy,
                labels: r.labels.into_iter().map(|l| l.name).collect(),
            }));

            if fetched < PER_PAGE as usize || runners.len() as i64 >= body.total_count {
                break;
            }
            page += 1;
        }

        Ok(runners)
    }

    async fn list_workflow_runs(
        &self,
        repository: &str,
        status: &str,
    ) -> Result<Vec<WorkflowRun>> {
        let url = format!(
            "{}/repos/{}/actions/runs?status={}&per_page={}",
            self.base_url, repository, status, PER_PAGE
        );
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        if !response.status().is_success() {
            let err = Self::classify_error(response).await;
            // A freshly created repository may not have an Actions history yet
            if matches!(err, OperatorError::NotFound(_)) {
                warn!(repository = %repository, "Workflow runs endpoint returned 404, treating as empty");
                return Ok(Vec::new());
            }
            return Err(err);
        }
        let body: WorkflowRunsPage = response.json().await?;
        Ok(body
            .workflow_runs
            .into_iter()
            .map(|r| WorkflowRun {
                id: r.id,
                status: r.status,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_requires_token() {
        assert!(GitHubClient::new(GitHubConfig::default()).is_err());
    }

    #[test]
    fn test_runners_path_per_target() {
        let client = GitHubClient::new(GitHubConfig {
            token: "t".into(),
            base_url: String::new(),
        })
        .unwrap();

        assert_eq!(
            client.runners_path(&Target::Repository("acme/widgets".into())),
            "https://api.github.com/repos/acme/widgets/actions"
        );
        assert_eq!(
            client.runners_path(&Target::Organization("acme".into())),
            "https://api.github.com/orgs/acme/actions"
        );
        assert_eq!(
            client.runners_path(&Target::Enterprise("big-corp".into())),
            "https://api.github.com/enterprises/big-corp/actions"
        );
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = GitHubClient::new(GitHubConfig {
            token: "t".into(),
            base_url: "https://ghes.example.com/api/v3/".into(),
        })
        .unwrap();
        assert_eq!(
            client.runners_path(&Target::Organization("acme".into())),
            "https://ghes.example.com/api/v3/orgs/acme/actions"
        );
    }

    #[test]
    fn test_token_response_parsing() {
        let json = r#"{"token": "AABBCC", "expires_at": "2024-06-01T12:00:00Z"}"#;
        let parsed: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.token, "AABBCC");
    }

    #[test]
    fn test_runners_page_parsing() {
        let json = r#"{
            "total_count": 2,
            "runners": [
                {"id": 1, "name": "runner-a", "status": "online", "busy": true,
                 "labels": [{"name": "self-hosted"}, {"name": "linux"}]},
                {"id": 2, "name": "runner-b", "status": "offline", "busy": false}
            ]
        }"#;
        let page: RunnersPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.runners[0].labels.len(), 2);
        assert!(!page.runners[1].busy);
    }

    #[test]
    fn test_workflow_runs_page_parsing() {
        let json = r#"{"total_count": 5, "workflow_runs": [
            {"status": "queued"}, {"status": "queued"},
            {"status": "in_progress"}, {"status": "in_progress"},
            {"status": "completed"}
        ]}"#;
        let page: WorkflowRunsPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.workflow_runs.len(), 5);
        let queued = page
            .workflow_runs
            .iter()
            .filter(|r| r.status == "queued")
            .count();
        assert_eq!(queued, 2);
    }
}
