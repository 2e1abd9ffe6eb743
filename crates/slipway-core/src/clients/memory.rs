//! In-memory client implementations.
//!
//! [`InMemoryStateStore`] backs dry runs and tests with the same locking
//! semantics as the object store. [`RecordingWorkflowClient`] and
//! [`RecordingStatusClient`] record every intent and answer synthetically,
//! so a dry run converges without touching the network.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::clients::{
    ClientError, LockAttempt, LockHandle, ReleaseLock, StateStoreClient, StatusClient,
    WorkflowClient,
};
use crate::model::{ArtifactRef, RunConclusion, RunStatus, WorkflowRun};

/// State-store client holding everything in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    objects: Mutex<BTreeMap<String, serde_json::Value>>,
    locks: Mutex<BTreeMap<String, ReleaseLock>>,
}

impl InMemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStoreClient for InMemoryStateStore {
    async fn acquire_lock(
        &self,
        tag: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockAttempt, ClientError> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        if let Some(existing) = locks.get(tag) {
            let age = Utc::now() - existing.acquired_at;
            if age.to_std().unwrap_or_default() <= ttl {
                return Ok(LockAttempt::Held(existing.clone()));
            }
            warn!(tag, holder = %existing.holder_id, "replacing expired lock");
            locks.remove(tag);
        }
        let lock = ReleaseLock {
            holder_id: holder_id.to_string(),
            acquired_at: Utc::now(),
            tag: tag.to_string(),
        };
        locks.insert(tag.to_string(), lock);
        Ok(LockAttempt::Acquired(LockHandle {
            tag: tag.to_string(),
            holder_id: holder_id.to_string(),
        }))
    }

    async fn release_lock(&self, handle: &LockHandle) -> Result<(), ClientError> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        match locks.get(&handle.tag) {
            Some(lock) if lock.holder_id == handle.holder_id => {
                locks.remove(&handle.tag);
                Ok(())
            }
            Some(lock) => Err(ClientError::Protocol(format!(
                "lock for '{}' is held by '{}', not '{}'",
                handle.tag, lock.holder_id, handle.holder_id
            ))),
            None => {
                warn!(tag = %handle.tag, "lock already gone");
                Ok(())
            }
        }
    }

    async fn load_state(&self, tag: &str) -> Result<Option<serde_json::Value>, ClientError> {
        let objects = self.objects.lock().expect("object map poisoned");
        Ok(objects.get(tag).cloned())
    }

    async fn save_state(&self, tag: &str, body: &serde_json::Value) -> Result<(), ClientError> {
        let mut objects = self.objects.lock().expect("object map poisoned");
        objects.insert(tag.to_string(), body.clone());
        Ok(())
    }

    async fn delete_state(&self, tag: &str) -> Result<(), ClientError> {
        let mut objects = self.objects.lock().expect("object map poisoned");
        objects.remove(tag);
        Ok(())
    }
}

/// A recorded workflow dispatch intent.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    /// Target repository.
    pub repo: String,
    /// Workflow file.
    pub workflow_file: String,
    /// Dispatched ref.
    pub git_ref: String,
    /// Inputs as they would have been sent.
    pub inputs: BTreeMap<String, String>,
}

/// Workflow client that records intents and succeeds synthetically.
///
/// Every dispatch is assigned a fabricated run id; discovery and polling
/// answer with an immediately completed, successful run. Artifact names
/// passed to [`with_artifacts`](Self::with_artifacts) are synthesized for
/// every run so whitelisted collection succeeds.
#[derive(Debug, Default)]
pub struct RecordingWorkflowClient {
    dispatches: Mutex<Vec<DispatchRecord>>,
    run_ids: Mutex<BTreeMap<String, u64>>,
    next_run_id: AtomicU64,
    artifact_names: Vec<String>,
}

impl RecordingWorkflowClient {
    /// Creates a recorder with no synthetic artifacts.
    pub fn new() -> Self {
        Self {
            next_run_id: AtomicU64::new(9000),
            ..Self::default()
        }
    }

    /// Creates a recorder that synthesizes the given artifact names.
    pub fn with_artifacts(artifact_names: Vec<String>) -> Self {
        Self {
            artifact_names,
            ..Self::new()
        }
    }

    /// All dispatch intents recorded so far.
    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.dispatches.lock().expect("dispatch log poisoned").clone()
    }

    fn completed_run(&self, run_id: u64, repo: &str) -> WorkflowRun {
        WorkflowRun {
            id: run_id,
            url: format!("https://example.invalid/{repo}/runs/{run_id}"),
            status: RunStatus::Completed,
            conclusion: Some(RunConclusion::Success),
            started_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
        }
    }
}

#[async_trait]
impl WorkflowClient for RecordingWorkflowClient {
    async fn dispatch(
        &self,
        repo: &str,
        workflow_file: &str,
        git_ref: &str,
        inputs: &BTreeMap<String, String>,
    ) -> Result<(), ClientError> {
        debug!(repo, workflow_file, git_ref, "dry-run dispatch recorded");
        if let Some(uuid) = inputs.get("workflow_uuid") {
            let id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
            self.run_ids
                .lock()
                .expect("run id map poisoned")
                .insert(uuid.clone(), id);
        }
        self.dispatches
            .lock()
            .expect("dispatch log poisoned")
            .push(DispatchRecord {
                repo: repo.to_string(),
                workflow_file: workflow_file.to_string(),
                git_ref: git_ref.to_string(),
                inputs: inputs.clone(),
            });
        Ok(())
    }

    async fn find_run_by_uuid(
        &self,
        repo: &str,
        _workflow_file: &str,
        uuid: &str,
        _since: chrono::DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, ClientError> {
        let run_ids = self.run_ids.lock().expect("run id map poisoned");
        Ok(run_ids.get(uuid).map(|id| self.completed_run(*id, repo)))
    }

    async fn get_run(&self, repo: &str, run_id: u64) -> Result<WorkflowRun, ClientError> {
        Ok(self.completed_run(run_id, repo))
    }

    async fn list_artifacts(
        &self,
        _repo: &str,
        run_id: u64,
    ) -> Result<Vec<ArtifactRef>, ClientError> {
        Ok(self
            .artifact_names
            .iter()
            .enumerate()
            .map(|(idx, name)| ArtifactRef {
                name: name.clone(),
                id: run_id * 100 + idx as u64,
                source_run_id: run_id,
                download_url: format!("https://example.invalid/artifacts/{run_id}/{name}"),
                sha256: None,
                size: 0,
            })
            .collect())
    }

    async fn download_artifact(
        &self,
        _repo: &str,
        _artifact_id: u64,
    ) -> Result<Vec<u8>, ClientError> {
        Ok(Vec::new())
    }
}

/// Status client that records message bodies instead of posting them.
#[derive(Debug, Default)]
pub struct RecordingStatusClient {
    posts: Mutex<Vec<String>>,
    updates: Mutex<Vec<String>>,
}

impl RecordingStatusClient {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bodies passed to `post_message` so far.
    pub fn posts(&self) -> Vec<String> {
        self.posts.lock().expect("post log poisoned").clone()
    }

    /// Bodies passed to `update_message` so far.
    pub fn updates(&self) -> Vec<String> {
        self.updates.lock().expect("update log poisoned").clone()
    }
}

#[async_trait]
impl StatusClient for RecordingStatusClient {
    async fn post_message(
        &self,
        _channel: &str,
        _thread: Option<&str>,
        body: &str,
    ) -> Result<String, ClientError> {
        let mut posts = self.posts.lock().expect("post log poisoned");
        posts.push(body.to_string());
        Ok(format!("{}.000100", posts.len()))
    }

    async fn update_message(
        &self,
        _channel: &str,
        _ts: &str,
        body: &str,
    ) -> Result<(), ClientError> {
        self.updates
            .lock()
            .expect("update log poisoned")
            .push(body.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_should_grant_lock_to_single_holder() {
        let store = InMemoryStateStore::new();
        let ttl = Duration::from_secs(3600);

        let first = store.acquire_lock("8.2.0", "holder-a", ttl).await.unwrap();
        assert!(matches!(first, LockAttempt::Acquired(_)));

        let second = store.acquire_lock("8.2.0", "holder-b", ttl).await.unwrap();
        match second {
            LockAttempt::Held(lock) => assert_eq!(lock.holder_id, "holder-a"),
            LockAttempt::Acquired(_) => panic!("second holder must not acquire"),
        }
    }

    #[tokio::test]
    async fn test_should_release_and_reacquire() {
        let store = InMemoryStateStore::new();
        let ttl = Duration::from_secs(3600);

        let LockAttempt::Acquired(handle) =
            store.acquire_lock("8.2.0", "holder-a", ttl).await.unwrap()
        else {
            panic!("expected acquisition");
        };
        store.release_lock(&handle).await.unwrap();

        let again = store.acquire_lock("8.2.0", "holder-b", ttl).await.unwrap();
        assert!(matches!(again, LockAttempt::Acquired(_)));
    }

    #[tokio::test]
    async fn test_should_take_over_expired_lock() {
        let store = InMemoryStateStore::new();
        {
            let mut locks = store.locks.lock().unwrap();
            locks.insert(
                "8.2.0".to_string(),
                ReleaseLock {
                    holder_id: "crashed".into(),
                    acquired_at: Utc::now() - chrono::Duration::hours(12),
                    tag: "8.2.0".into(),
                },
            );
        }
        let attempt = store
            .acquire_lock("8.2.0", "holder-b", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(matches!(attempt, LockAttempt::Acquired(_)));
    }

    #[tokio::test]
    async fn test_should_tolerate_releasing_vanished_lock() {
        let store = InMemoryStateStore::new();
        let handle = LockHandle {
            tag: "8.2.0".into(),
            holder_id: "holder-a".into(),
        };
        store.release_lock(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_should_discover_recorded_dispatch_by_uuid() {
        let client = RecordingWorkflowClient::new();
        let mut inputs = BTreeMap::new();
        inputs.insert("workflow_uuid".to_string(), "abc-123".to_string());
        client
            .dispatch("acme/pkg", "build.yml", "main", &inputs)
            .await
            .unwrap();

        let run = client
            .find_run_by_uuid("acme/pkg", "build.yml", "abc-123", Utc::now())
            .await
            .unwrap()
            .expect("run should be discoverable");
        assert_eq!(run.conclusion, Some(RunConclusion::Success));
        assert_eq!(client.dispatches().len(), 1);
    }

    #[tokio::test]
    async fn test_should_synthesize_whitelisted_artifacts() {
        let client = RecordingWorkflowClient::with_artifacts(vec!["pkg.tgz".into()]);
        let artifacts = client.list_artifacts("acme/pkg", 9000).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "pkg.tgz");
        assert_eq!(artifacts[0].source_run_id, 9000);
    }
}
