//! Slipway Release Orchestration Engine
//!
//! Drives multi-package releases of a server distribution through a
//! two-phase (build → publish) pipeline per downstream package: workflows
//! are dispatched into each package repository, their runs discovered and
//! monitored, artifacts handed from build to publish, and the full release
//! state persisted in an object store under a per-tag lock so runs are
//! resumable and observable across restarts.
//!
//! # Architecture
//!
//! - [`Controller`] owns the lifecycle: lock, load, tick to quiescence,
//!   persist, release
//! - [`bt`] is the behavior-tree runtime: composites, decorators, and the
//!   tick loop with cooperative suspension on client calls and timers
//! - [`leaves`] is the domain node library; [`tree`] assembles it into
//!   per-package pipelines rooted at a single release goal
//! - [`ReleaseState`](model::ReleaseState) is the persisted document;
//!   [`StateStore`](store::StateStore) syncs it after every mutating tick
//!   with ephemeral fields stripped
//! - [`clients`] defines the narrow seams to the workflow host, the object
//!   store and the status sink; in-memory implementations back dry runs
//!   and tests
//! - [`StatusRenderer`](render::StatusRenderer) projects state into the
//!   pinned status message after each tick

pub mod bt;
pub mod clients;
pub mod config;
mod controller;
mod error;
pub mod leaves;
pub mod model;
pub mod render;
pub mod store;
pub mod test_support;
pub mod tree;

pub use clients::{
    ClientError, LockAttempt, LockHandle, ReleaseLock, StateStoreClient, StatusClient,
    WorkflowClient,
};
pub use config::{PackageConfig, PhaseConfig, ReleaseConfig};
pub use controller::{Controller, ReleaseOutcome, ReleaseOverrides};
pub use error::CoreError;
pub use model::{
    ArtifactRef, PackageResult, PackageState, PackageSummary, PhaseKind, PhaseState, PhaseStatus,
    ReleaseState, ReleaseType, RunConclusion, RunStatus, StateHandle, WorkflowRun,
};
pub use store::{ResetSelector, StateStore};
