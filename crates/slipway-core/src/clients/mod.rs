//! Client contracts for the external services the engine talks to.
//!
//! Defines the three narrow trait seams — [`WorkflowClient`] for the
//! workflow host, [`StateStoreClient`] for the object store, and
//! [`StatusClient`] for the status sink — plus [`ClientError`] and the
//! shared retry policy. Clients are the only components that touch the
//! network; everything above them receives `Arc<dyn ...>` so tests and
//! dry runs substitute in-memory implementations.

pub mod github;
pub mod memory;
pub mod s3;
pub mod slack;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::model::{ArtifactRef, WorkflowRun};

/// Maximum attempts for a single client operation, including the first.
pub const RETRY_BUDGET: u32 = 5;

/// Initial backoff delay between retries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Backoff delay cap.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(8);

/// Error type for all client operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The remote service answered with a non-success HTTP status.
    #[error("HTTP {status} from {endpoint}: {message}")]
    Http {
        /// HTTP status code returned by the service.
        status: u16,
        /// Endpoint or operation that produced the error.
        endpoint: String,
        /// Response body or service-provided error description.
        message: String,
    },

    /// The request never produced a response (DNS, connect, timeout).
    #[error("transport error: {0}")]
    Transport(String),

    /// The response arrived but did not match the expected shape.
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Whether retrying the operation may succeed.
    ///
    /// Transport failures and HTTP 408/429/5xx are transient; every other
    /// HTTP status (authentication, missing repository, bad request) and
    /// protocol mismatches are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Http { status, .. } => {
                matches!(status, 408 | 429) || *status >= 500
            }
            ClientError::Protocol(_) => false,
        }
    }
}

/// Retries `call` up to [`RETRY_BUDGET`] times with exponential backoff.
///
/// Only transient errors (see [`ClientError::is_transient`]) are retried;
/// the final error is returned unchanged. The backoff doubles from
/// [`RETRY_BASE_DELAY`] up to [`RETRY_MAX_DELAY`] with a small jitter so
/// concurrent branches do not poll in lockstep.
pub(crate) async fn with_retry<T, F, Fut>(op: &str, mut call: F) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < RETRY_BUDGET => {
                warn!(op, attempt, error = %err, "transient client error, backing off");
                tokio::time::sleep(delay + jitter(delay)).await;
                delay = (delay * 2).min(RETRY_MAX_DELAY);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Deterministic-enough jitter of up to a quarter of `delay`.
fn jitter(delay: Duration) -> Duration {
    let window = (delay.as_millis() / 4).max(1) as u64;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    Duration::from_millis(nanos % window)
}

/// Contents of the per-tag release lock object.
///
/// The mere existence of the lock object denotes a release in progress;
/// the body identifies the holder for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseLock {
    /// Identifier of the process holding the lock.
    pub holder_id: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// The release tag the lock protects.
    pub tag: String,
}

/// Proof of lock ownership, required to release the lock.
#[derive(Debug, Clone)]
pub struct LockHandle {
    /// The locked release tag.
    pub tag: String,
    /// The holder identifier this handle was issued for.
    pub holder_id: String,
}

/// Outcome of a lock acquisition attempt.
#[derive(Debug)]
pub enum LockAttempt {
    /// The lock was created; the caller is now the holder.
    Acquired(LockHandle),
    /// The lock already exists; the current holder's metadata is returned.
    Held(ReleaseLock),
}

/// Adapter to the workflow host (GitHub Actions API).
///
/// The dispatch API does not return a run id, so callers correlate runs
/// through a caller-generated `workflow_uuid` threaded through the inputs
/// and discovered later via [`find_run_by_uuid`](Self::find_run_by_uuid).
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Fires a workflow dispatch for `workflow_file` at `git_ref`.
    async fn dispatch(
        &self,
        repo: &str,
        workflow_file: &str,
        git_ref: &str,
        inputs: &BTreeMap<String, String>,
    ) -> Result<(), ClientError>;

    /// Scans recent runs of `workflow_file` created after `since` for one
    /// whose name carries `uuid`. Returns `None` when no run matches.
    async fn find_run_by_uuid(
        &self,
        repo: &str,
        workflow_file: &str,
        uuid: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<WorkflowRun>, ClientError>;

    /// Fetches the current status and conclusion of a run.
    async fn get_run(&self, repo: &str, run_id: u64) -> Result<WorkflowRun, ClientError>;

    /// Lists the artifacts produced by a completed run.
    async fn list_artifacts(
        &self,
        repo: &str,
        run_id: u64,
    ) -> Result<Vec<ArtifactRef>, ClientError>;

    /// Downloads a single artifact archive; the caller decides the destination.
    async fn download_artifact(&self, repo: &str, artifact_id: u64)
    -> Result<Vec<u8>, ClientError>;
}

/// Adapter to the object store holding state documents and release locks.
///
/// State documents are exchanged as raw JSON values so the client stays a
/// thin transport; typed (de)serialization lives in
/// [`StateStore`](crate::store::StateStore).
#[async_trait]
pub trait StateStoreClient: Send + Sync {
    /// Conditionally creates the lock object for `tag`.
    ///
    /// A held lock older than `ttl` is treated as leaked: it is removed and
    /// creation is retried once before reporting [`LockAttempt::Held`].
    async fn acquire_lock(
        &self,
        tag: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockAttempt, ClientError>;

    /// Deletes the lock object if the holder matches.
    ///
    /// A lock that has already vanished is logged and treated as released.
    async fn release_lock(&self, handle: &LockHandle) -> Result<(), ClientError>;

    /// Loads the state document for `tag`, or `None` if absent.
    async fn load_state(&self, tag: &str) -> Result<Option<serde_json::Value>, ClientError>;

    /// Writes the state document for `tag` (atomic object replacement).
    async fn save_state(&self, tag: &str, body: &serde_json::Value) -> Result<(), ClientError>;

    /// Deletes the state document for `tag`; absent documents are fine.
    async fn delete_state(&self, tag: &str) -> Result<(), ClientError>;
}

/// Adapter to the status sink (Slack web API).
#[async_trait]
pub trait StatusClient: Send + Sync {
    /// Posts the first status message, optionally threaded, returning its `ts`.
    async fn post_message(
        &self,
        channel: &str,
        thread: Option<&str>,
        body: &str,
    ) -> Result<String, ClientError>;

    /// Updates an existing message in place.
    ///
    /// Implementations must swallow "no change" responses.
    async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        body: &str,
    ) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_should_classify_transient_errors() {
        assert!(ClientError::Transport("timeout".into()).is_transient());
        for status in [408, 429, 500, 502, 503] {
            let err = ClientError::Http {
                status,
                endpoint: "op".into(),
                message: String::new(),
            };
            assert!(err.is_transient(), "status {status} should be transient");
        }
    }

    #[test]
    fn test_should_classify_terminal_errors() {
        for status in [400, 401, 403, 404, 422] {
            let err = ClientError::Http {
                status,
                endpoint: "op".into(),
                message: String::new(),
            };
            assert!(!err.is_transient(), "status {status} should be terminal");
        }
        assert!(!ClientError::Protocol("missing field".into()).is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_retry_transient_until_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ClientError::Transport("reset".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), RETRY_BUDGET);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_not_retry_terminal_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ClientError::Http {
                    status: 404,
                    endpoint: "op".into(),
                    message: "missing".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_return_first_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ClientError::Transport("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
