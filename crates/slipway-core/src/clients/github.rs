//! GitHub Actions client for workflow dispatch, discovery and polling.
//!
//! Thin typed wrapper over `reqwest` against the GitHub REST API. The
//! dispatch endpoint returns no run id, so runs are discovered by scanning
//! recent runs for the correlation uuid echoed in the run name.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::clients::{ClientError, WorkflowClient, with_retry};
use crate::model::{ArtifactRef, RunConclusion, RunStatus, WorkflowRun};

/// Base URL for the GitHub REST API.
const GITHUB_API_BASE: &str = "https://api.github.com";

/// How many recent runs one discovery scan inspects.
const FIND_SCAN_LIMIT: u32 = 20;

static UUID_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").unwrap()
});

/// Workflow client backed by the GitHub Actions REST API.
#[derive(Debug, Clone)]
pub struct GitHubWorkflowClient {
    http: reqwest::Client,
    token: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct ApiRun {
    id: u64,
    #[serde(default)]
    name: Option<String>,
    html_url: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    run_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RunsResponse {
    workflow_runs: Vec<ApiRun>,
}

#[derive(Debug, Deserialize)]
struct ApiArtifact {
    id: u64,
    name: String,
    size_in_bytes: u64,
    archive_download_url: String,
    #[serde(default)]
    digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArtifactsResponse {
    artifacts: Vec<ApiArtifact>,
}

impl GitHubWorkflowClient {
    /// Creates a client authenticating with the given API token.
    pub fn new(token: String) -> Self {
        Self::with_api_base(token, GITHUB_API_BASE.to_string())
    }

    /// Creates a client against a non-default API base URL.
    pub fn with_api_base(token: String, api_base: String) -> Self {
        Self {
            http: reqwest::Client::builder()
                .user_agent("slipway")
                .build()
                .unwrap_or_default(),
            token,
            api_base,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{path}", self.api_base))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        endpoint: &str,
    ) -> Result<reqwest::Response, ClientError> {
        let response = builder
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("{endpoint}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Http {
                status: status.as_u16(),
                endpoint: endpoint.to_string(),
                message: truncate(&message, 512),
            });
        }
        Ok(response)
    }

    async fn json<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        endpoint: &str,
    ) -> Result<T, ClientError> {
        self.send(builder, endpoint)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ClientError::Protocol(format!("{endpoint}: {e}")))
    }
}

#[async_trait]
impl WorkflowClient for GitHubWorkflowClient {
    async fn dispatch(
        &self,
        repo: &str,
        workflow_file: &str,
        git_ref: &str,
        inputs: &BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        let path = format!("/repos/{repo}/actions/workflows/{workflow_file}/dispatches");
        let payload = serde_json::json!({ "ref": git_ref, "inputs": inputs });
        with_retry("dispatch", || async {
            self.send(
                self.request(reqwest::Method::POST, &path).json(&payload),
                "dispatch",
            )
            .await
            .map(|_| ())
        })
        .await
    }

    async fn find_run_by_uuid(
        &self,
        repo: &str,
        workflow_file: &str,
        uuid: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, ClientError> {
        let path = format!(
            "/repos/{repo}/actions/workflows/{workflow_file}/runs\
             ?per_page={FIND_SCAN_LIMIT}&created=%3E%3D{}",
            since.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        let runs: RunsResponse = with_retry("find_run_by_uuid", || async {
            self.json(self.request(reqwest::Method::GET, &path), "find_run_by_uuid")
                .await
        })
        .await?;

        for run in runs.workflow_runs {
            let extracted = run.name.as_deref().and_then(extract_uuid);
            if extracted.is_some_and(|t| t.eq_ignore_ascii_case(uuid)) {
                debug!(repo, run_id = run.id, uuid, "matched run by uuid");
                return Ok(Some(map_run(run)));
            }
        }
        Ok(None)
    }

    async fn get_run(&self, repo: &str, run_id: u64) -> Result<WorkflowRun, ClientError> {
        let path = format!("/repos/{repo}/actions/runs/{run_id}");
        let run: ApiRun = with_retry("get_run", || async {
            self.json(self.request(reqwest::Method::GET, &path), "get_run")
                .await
        })
        .await?;
        Ok(map_run(run))
    }

    async fn list_artifacts(
        &self,
        repo: &str,
        run_id: u64,
    ) -> Result<Vec<ArtifactRef>, ClientError> {
        let path = format!("/repos/{repo}/actions/runs/{run_id}/artifacts");
        let listing: ArtifactsResponse = with_retry("list_artifacts", || async {
            self.json(self.request(reqwest::Method::GET, &path), "list_artifacts")
                .await
        })
        .await?;
        Ok(listing
            .artifacts
            .into_iter()
            .map(|a| ArtifactRef {
                name: a.name,
                id: a.id,
                source_run_id: run_id,
                download_url: a.archive_download_url,
                sha256: a
                    .digest
                    .map(|d| d.strip_prefix("sha256:").unwrap_or(&d).to_string()),
                size: a.size_in_bytes,
            })
            .collect())
    }

    async fn download_artifact(
        &self,
        repo: &str,
        artifact_id: u64,
    ) -> Result<Vec<u8>, ClientError> {
        let path = format!("/repos/{repo}/actions/artifacts/{artifact_id}/zip");
        let bytes = with_retry("download_artifact", || async {
            self.send(self.request(reqwest::Method::GET, &path), "download_artifact")
                .await?
                .bytes()
                .await
                .map_err(|e| ClientError::Transport(format!("download_artifact: {e}")))
        })
        .await?;
        Ok(bytes.to_vec())
    }
}

/// Extracts a uuid-shaped token from a run name, if present.
fn extract_uuid(text: &str) -> Option<&str> {
    UUID_TOKEN.find(text).map(|m| m.as_str())
}

fn map_run(run: ApiRun) -> WorkflowRun {
    let status = match run.status.as_deref() {
        Some("in_progress") => RunStatus::InProgress,
        Some("completed") => RunStatus::Completed,
        // queued, waiting, requested, pending
        _ => RunStatus::Queued,
    };
    let conclusion = match run.conclusion.as_deref() {
        Some("success") => Some(RunConclusion::Success),
        Some("cancelled") => Some(RunConclusion::Cancelled),
        Some("timed_out") => Some(RunConclusion::TimedOut),
        Some(_) => Some(RunConclusion::Failure),
        None => None,
    };
    WorkflowRun {
        id: run.id,
        url: run.html_url,
        status,
        conclusion,
        started_at: run.run_started_at,
        updated_at: run.updated_at,
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_extract_uuid_from_run_name() {
        let name = "Build release [9b2d6f1a-22cc-4f40-9c1e-aa00bb11cc22]";
        assert_eq!(
            extract_uuid(name),
            Some("9b2d6f1a-22cc-4f40-9c1e-aa00bb11cc22")
        );
        assert_eq!(extract_uuid("Build release"), None);
    }

    #[test]
    fn test_should_map_run_status_and_conclusion() {
        let run = map_run(ApiRun {
            id: 1001,
            name: Some("Build".into()),
            html_url: "https://github.com/acme/pkg/actions/runs/1001".into(),
            status: Some("completed".into()),
            conclusion: Some("success".into()),
            run_started_at: None,
            updated_at: None,
        });
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.conclusion, Some(RunConclusion::Success));
    }

    #[test]
    fn test_should_map_unknown_conclusion_to_failure() {
        let run = map_run(ApiRun {
            id: 1,
            name: None,
            html_url: String::new(),
            status: Some("completed".into()),
            conclusion: Some("startup_failure".into()),
            run_started_at: None,
            updated_at: None,
        });
        assert_eq!(run.conclusion, Some(RunConclusion::Failure));
    }

    #[test]
    fn test_should_map_queued_like_statuses() {
        for status in ["queued", "waiting", "requested", "pending"] {
            let run = map_run(ApiRun {
                id: 1,
                name: None,
                html_url: String::new(),
                status: Some(status.into()),
                conclusion: None,
                run_started_at: None,
                updated_at: None,
            });
            assert_eq!(run.status, RunStatus::Queued, "status {status}");
        }
    }

    #[test]
    fn test_should_truncate_long_error_bodies() {
        let long = "x".repeat(600);
        let short = truncate(&long, 512);
        assert!(short.len() <= 515);
        assert!(short.ends_with('…'));
    }
}
