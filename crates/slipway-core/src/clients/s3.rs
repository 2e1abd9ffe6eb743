//! S3-backed state store client.
//!
//! State documents live at `release-state/<tag>.json`, locks at
//! `release-locks/<tag>.lock`. The lock is a conditional create
//! (`If-None-Match: *`): its mere existence denotes a release in progress,
//! and a holder older than the TTL is treated as leaked and taken over.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::clients::{
    ClientError, LockAttempt, LockHandle, ReleaseLock, StateStoreClient, with_retry,
};

/// State-store client over an S3 bucket.
#[derive(Debug, Clone)]
pub struct S3StateStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

fn state_key(tag: &str) -> String {
    format!("release-state/{tag}.json")
}

fn lock_key(tag: &str) -> String {
    format!("release-locks/{tag}.lock")
}

/// HTTP status of a service error, when the SDK saw a response.
fn sdk_status<E>(err: &SdkError<E>) -> Option<u16> {
    match err {
        SdkError::ServiceError(ctx) => Some(ctx.raw().status().as_u16()),
        _ => None,
    }
}

fn map_sdk_err<E>(op: &str, err: SdkError<E>) -> ClientError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match sdk_status(&err) {
        Some(status) => ClientError::Http {
            status,
            endpoint: op.to_string(),
            message: err.to_string(),
        },
        None => ClientError::Transport(format!("{op}: {err}")),
    }
}

impl S3StateStore {
    /// Creates a store over `bucket` using the given SDK client.
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    async fn get_json(&self, key: &str, op: &str) -> Result<Option<serde_json::Value>, ClientError> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        let output = match result {
            Ok(output) => output,
            Err(err) => {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    return Ok(None);
                }
                return Err(map_sdk_err(op, err));
            }
        };
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| ClientError::Transport(format!("{op}: {e}")))?
            .into_bytes();
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ClientError::Protocol(format!("{op}: invalid JSON at {key}: {e}")))
    }

    async fn put_json(
        &self,
        key: &str,
        body: &serde_json::Value,
        op: &str,
    ) -> Result<(), ClientError> {
        let payload =
            serde_json::to_vec_pretty(body).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(payload))
            .send()
            .await
            .map(|_| ())
            .map_err(|err| map_sdk_err(op, err))
    }

    /// Creates the lock object, failing if it already exists.
    async fn create_lock(&self, key: &str, lock: &ReleaseLock) -> Result<bool, ClientError> {
        let payload = serde_json::to_vec_pretty(lock)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .if_none_match("*")
            .body(ByteStream::from(payload))
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) if sdk_status(&err) == Some(412) => Ok(false),
            Err(err) => Err(map_sdk_err("acquire_lock", err)),
        }
    }

    async fn read_lock(&self, key: &str) -> Result<Option<ReleaseLock>, ClientError> {
        match self.get_json(key, "read_lock").await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| ClientError::Protocol(format!("malformed lock object: {e}"))),
            None => Ok(None),
        }
    }

    async fn delete_object(&self, key: &str, op: &str) -> Result<(), ClientError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| map_sdk_err(op, err))
    }
}

#[async_trait]
impl StateStoreClient for S3StateStore {
    async fn acquire_lock(
        &self,
        tag: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockAttempt, ClientError> {
        let key = lock_key(tag);
        let lock = ReleaseLock {
            holder_id: holder_id.to_string(),
            acquired_at: Utc::now(),
            tag: tag.to_string(),
        };
        let handle = LockHandle {
            tag: tag.to_string(),
            holder_id: holder_id.to_string(),
        };

        if self.create_lock(&key, &lock).await? {
            return Ok(LockAttempt::Acquired(handle));
        }

        // Contended: inspect the holder, take over only a leaked lock.
        match self.read_lock(&key).await? {
            Some(existing) => {
                let age = (Utc::now() - existing.acquired_at).to_std().unwrap_or_default();
                if age <= ttl {
                    return Ok(LockAttempt::Held(existing));
                }
                warn!(
                    tag,
                    holder = %existing.holder_id,
                    age_secs = age.as_secs(),
                    "taking over expired release lock"
                );
                self.delete_object(&key, "acquire_lock").await?;
                if self.create_lock(&key, &lock).await? {
                    Ok(LockAttempt::Acquired(handle))
                } else {
                    // Someone else won the takeover race.
                    match self.read_lock(&key).await? {
                        Some(existing) => Ok(LockAttempt::Held(existing)),
                        None => Err(ClientError::Protocol(
                            "lock vanished during takeover".into(),
                        )),
                    }
                }
            }
            // The holder released between our create and read; try again once.
            None => {
                if self.create_lock(&key, &lock).await? {
                    Ok(LockAttempt::Acquired(handle))
                } else {
                    match self.read_lock(&key).await? {
                        Some(existing) => Ok(LockAttempt::Held(existing)),
                        None => Err(ClientError::Protocol(
                            "lock object flapping during acquisition".into(),
                        )),
                    }
                }
            }
        }
    }

    async fn release_lock(&self, handle: &LockHandle) -> Result<(), ClientError> {
        let key = lock_key(&handle.tag);
        match self.read_lock(&key).await? {
            Some(lock) if lock.holder_id == handle.holder_id => {
                self.delete_object(&key, "release_lock").await?;
                debug!(tag = %handle.tag, "lock object deleted");
                Ok(())
            }
            Some(lock) => Err(ClientError::Protocol(format!(
                "lock for '{}' is held by '{}', not '{}'",
                handle.tag, lock.holder_id, handle.holder_id
            ))),
            None => {
                info!(tag = %handle.tag, "lock already gone, treating as released");
                Ok(())
            }
        }
    }

    async fn load_state(&self, tag: &str) -> Result<Option<serde_json::Value>, ClientError> {
        let key = state_key(tag);
        with_retry("load_state", || async {
            self.get_json(&key, "load_state").await
        })
        .await
    }

    async fn save_state(&self, tag: &str, body: &serde_json::Value) -> Result<(), ClientError> {
        let key = state_key(tag);
        with_retry("save_state", || async {
            self.put_json(&key, body, "save_state").await
        })
        .await
    }

    async fn delete_state(&self, tag: &str) -> Result<(), ClientError> {
        let key = state_key(tag);
        with_retry("delete_state", || async {
            self.delete_object(&key, "delete_state").await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_lay_out_object_keys_per_tag() {
        assert_eq!(state_key("8.2.0"), "release-state/8.2.0.json");
        assert_eq!(lock_key("8.2.0"), "release-locks/8.2.0.lock");
    }
}
