//! State persistence under the release lock.
//!
//! [`StateStore`] wraps a [`StateStoreClient`] with the typed document
//! handling: lock lifecycle, load-or-absent, dirty-flag sync after each
//! tick, and the force-rebuild reset primitive. Ephemeral fields never
//! reach the stored document (they are `#[serde(skip)]` on the model), and
//! unknown fields ride along through the flattened extra maps.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::clients::{LockAttempt, LockHandle, StateStoreClient};
use crate::error::CoreError;
use crate::model::{ReleaseState, StateHandle};

/// Age after which a held lock is considered leaked and taken over.
pub const LOCK_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// Scope of a force-rebuild reset.
///
/// # Examples
///
/// ```
/// use slipway_core::ResetSelector;
///
/// assert_eq!("all".parse::<ResetSelector>().unwrap(), ResetSelector::All);
/// assert_eq!(
///     "docker".parse::<ResetSelector>().unwrap(),
///     ResetSelector::Package("docker".into()),
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetSelector {
    /// Delete the whole stored document.
    All,
    /// Reset a single package's pipeline.
    Package(String),
}

impl FromStr for ResetSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty force-rebuild selector".to_string());
        }
        if s == "all" {
            Ok(ResetSelector::All)
        } else {
            Ok(ResetSelector::Package(s.to_string()))
        }
    }
}

/// Typed persistence layer over the object-store client.
#[derive(Clone)]
pub struct StateStore {
    client: Arc<dyn StateStoreClient>,
}

impl StateStore {
    /// Wraps a state-store client.
    pub fn new(client: Arc<dyn StateStoreClient>) -> Self {
        Self { client }
    }

    /// Acquires the release lock for `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockHeld`] with the current holder's metadata
    /// when another process holds the lock.
    pub async fn acquire_lock(&self, tag: &str, holder_id: &str) -> Result<LockHandle, CoreError> {
        match self.client.acquire_lock(tag, holder_id, LOCK_TTL).await? {
            LockAttempt::Acquired(handle) => {
                info!(tag, holder_id, "release lock acquired");
                Ok(handle)
            }
            LockAttempt::Held(lock) => Err(CoreError::LockHeld {
                holder_id: lock.holder_id,
                acquired_at: lock.acquired_at,
            }),
        }
    }

    /// Releases a previously acquired lock.
    pub async fn release_lock(&self, handle: &LockHandle) -> Result<(), CoreError> {
        self.client.release_lock(handle).await?;
        info!(tag = %handle.tag, "release lock released");
        Ok(())
    }

    /// Loads the state document for `tag`, or `None` when no run exists yet.
    pub async fn load(&self, tag: &str) -> Result<Option<ReleaseState>, CoreError> {
        match self.client.load_state(tag).await? {
            Some(value) => {
                let state: ReleaseState = serde_json::from_value(value)
                    .map_err(|e| CoreError::State(format!("malformed state for '{tag}': {e}")))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Writes the document (atomic object replacement).
    pub async fn save(&self, state: &ReleaseState) -> Result<(), CoreError> {
        let body = serde_json::to_value(state)?;
        self.client.save_state(&state.tag, &body).await?;
        Ok(())
    }

    /// Deletes the stored document.
    pub async fn delete(&self, tag: &str) -> Result<(), CoreError> {
        self.client.delete_state(tag).await?;
        Ok(())
    }

    /// Persists the shared state if it was mutated since the last sync.
    pub async fn sync(&self, state: &StateHandle) -> Result<(), CoreError> {
        let snapshot = {
            let mut state = state.borrow_mut();
            if !state.meta.ephemeral.dirty {
                return Ok(());
            }
            state.meta.ephemeral.dirty = false;
            state.clone()
        };
        debug!(tag = %snapshot.tag, "persisting state");
        self.save(&snapshot).await
    }

    /// Applies a force-rebuild reset.
    ///
    /// `All` removes the stored document; a package selector resets that
    /// package's phases, artifacts and result, bumping its attempt
    /// counters, while every other package is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Config`] when the named package does not exist
    /// in the stored document.
    pub async fn reset(&self, tag: &str, selector: &ResetSelector) -> Result<(), CoreError> {
        match selector {
            ResetSelector::All => {
                info!(tag, "force rebuild: deleting stored state");
                self.delete(tag).await
            }
            ResetSelector::Package(name) => {
                let Some(mut state) = self.load(tag).await? else {
                    debug!(tag, "no stored state, nothing to reset");
                    return Ok(());
                };
                match state.package_mut(name) {
                    Some(package) => package.reset(),
                    None => {
                        return Err(CoreError::Config(format!(
                            "cannot force-rebuild unknown package '{name}'"
                        )));
                    }
                }
                info!(tag, package = %name, "force rebuild: package state reset");
                state.touch();
                self.save(&state).await
            }
        }
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}
