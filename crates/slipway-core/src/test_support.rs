//! Test-only helpers: a scripted workflow client for scenario tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clients::memory::DispatchRecord;
use crate::clients::{ClientError, WorkflowClient};
use crate::model::{ArtifactRef, RunConclusion, RunStatus, WorkflowRun};

/// Builds a workflow run with the given terminal shape.
pub fn run(id: u64, status: RunStatus, conclusion: Option<RunConclusion>) -> WorkflowRun {
    WorkflowRun {
        id,
        url: format!("https://github.com/acme/pkg/actions/runs/{id}"),
        status,
        conclusion,
        started_at: None,
        updated_at: None,
    }
}

/// Builds an artifact stamped with its producing run.
pub fn artifact(name: &str, id: u64, source_run_id: u64, sha256: &str) -> ArtifactRef {
    ArtifactRef {
        name: name.to_string(),
        id,
        source_run_id,
        download_url: format!("https://example.invalid/artifacts/{id}/{name}"),
        sha256: Some(sha256.to_string()),
        size: 64,
    }
}

/// Workflow client answering from per-operation scripts.
///
/// `find_run_by_uuid` and `get_run` pop from queues in call order;
/// artifacts are looked up by run id. Exhausted scripts answer with a
/// protocol error so a mis-scripted test fails loudly instead of hanging.
#[derive(Debug, Default)]
pub struct ScriptedWorkflowClient {
    dispatches: Mutex<Vec<DispatchRecord>>,
    find_calls: Mutex<Vec<String>>,
    finds: Mutex<VecDeque<Result<Option<WorkflowRun>, ClientError>>>,
    polls: Mutex<VecDeque<Result<WorkflowRun, ClientError>>>,
    artifacts: Mutex<BTreeMap<u64, Vec<ArtifactRef>>>,
}

impl ScriptedWorkflowClient {
    /// Creates a client with empty scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the next `find_run_by_uuid` answer.
    pub fn script_find(&self, result: Result<Option<WorkflowRun>, ClientError>) {
        self.finds.lock().unwrap().push_back(result);
    }

    /// Queues the next `get_run` answer.
    pub fn script_poll(&self, result: Result<WorkflowRun, ClientError>) {
        self.polls.lock().unwrap().push_back(result);
    }

    /// Sets the artifact listing for a run.
    pub fn script_artifacts(&self, run_id: u64, artifacts: Vec<ArtifactRef>) {
        self.artifacts.lock().unwrap().insert(run_id, artifacts);
    }

    /// Dispatch intents recorded so far.
    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.dispatches.lock().unwrap().clone()
    }

    /// Uuids passed to `find_run_by_uuid`, in call order.
    pub fn find_calls(&self) -> Vec<String> {
        self.find_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowClient for ScriptedWorkflowClient {
    async fn dispatch(
        &self,
        repo: &str,
        workflow_file: &str,
        git_ref: &str,
        inputs: &BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        self.dispatches.lock().unwrap().push(DispatchRecord {
            repo: repo.to_string(),
            workflow_file: workflow_file.to_string(),
            git_ref: git_ref.to_string(),
            inputs: inputs.clone(),
        });
        Ok(())
    }

    async fn find_run_by_uuid(
        &self,
        _repo: &str,
        _workflow_file: &str,
        uuid: &str,
        _since: DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, ClientError> {
        self.find_calls.lock().unwrap().push(uuid.to_string());
        self.finds
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ClientError::Protocol("find script exhausted".into())))
    }

    async fn get_run(&self, _repo: &str, _run_id: u64) -> Result<WorkflowRun, ClientError> {
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ClientError::Protocol("poll script exhausted".into())))
    }

    async fn list_artifacts(
        &self,
        _repo: &str,
        run_id: u64,
    ) -> Result<Vec<ArtifactRef>, ClientError> {
        Ok(self
            .artifacts
            .lock()
            .unwrap()
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn download_artifact(
        &self,
        _repo: &str,
        _artifact_id: u64,
    ) -> Result<Vec<u8>, ClientError> {
        Ok(Vec::new())
    }
}
