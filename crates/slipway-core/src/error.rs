//! Error types for the orchestration engine.
//!
//! Defines [`CoreError`] as the primary error type for all operations in
//! `slipway-core`. Uses `thiserror` for ergonomic error definitions; the
//! client layer has its own [`ClientError`](crate::clients::ClientError)
//! which converts into the `Client` variant.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::clients::ClientError;

/// Error type for engine operations.
///
/// Variants are grouped by subsystem: configuration, client transport,
/// lock contention, state handling, and invariant violations.
///
/// # Examples
///
/// ```
/// use slipway_core::CoreError;
///
/// let err = CoreError::Config("unknown package 'docker'".into());
/// assert!(err.to_string().contains("docker"));
/// ```
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A configuration error (missing package, bad template, unknown key).
    #[error("Config error: {0}")]
    Config(String),

    /// An error from one of the external clients after retries.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The release lock for this tag is held by another process.
    #[error("release lock held by {holder_id} since {acquired_at}")]
    LockHeld {
        /// Identifier of the current lock holder.
        holder_id: String,
        /// When the current holder acquired the lock.
        acquired_at: DateTime<Utc>,
    },

    /// A state-handling error (missing document, malformed snapshot).
    #[error("State error: {0}")]
    State(String),

    /// An internal invariant was violated; treated as a bug.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// An I/O error from file system operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
