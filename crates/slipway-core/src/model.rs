//! Release state document and its consistency rules.
//!
//! A pure data module: the persisted document types ([`ReleaseState`],
//! [`PackageState`], [`PhaseState`], [`WorkflowRun`], [`ArtifactRef`]),
//! release-type derivation from the tag, the invariant predicates, and the
//! read-only projections consumed by the status renderer.
//!
//! Every document struct carries a flattened `extra` map so fields written
//! by newer schema versions survive a load/save round trip, and the
//! ephemeral sub-objects are `#[serde(skip)]` so they never reach the
//! persisted snapshot.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Current schema version written into new state documents.
pub const STATE_SCHEMA_VERSION: u32 = 2;

/// Shared handle to the release state.
///
/// The tree, the store syncer and the renderer all hold clones; mutation
/// happens only from the single-threaded tick loop, so a `RefCell` is
/// sufficient.
pub type StateHandle = Rc<RefCell<ReleaseState>>;

static GA_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+$").unwrap());
static RC_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+(\.\d+)?-rc\d+$").unwrap());
static MILESTONE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+-m\d+$").unwrap());
static MAINTENANCE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+-.+$").unwrap());

/// Kind of release, normally derived from the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseType {
    /// Release candidate (`8.2.0-rc1`, `8.2-rc2`).
    Rc,
    /// General availability (`8.2.0`).
    Ga,
    /// Maintenance respin (`8.2.0-int3` and other non-rc suffixes).
    Maintenance,
    /// Milestone build (`8.4-m01`).
    Milestone,
}

impl ReleaseType {
    /// Derives the release type from a tag, or `None` when the tag matches
    /// no known pattern (the caller decides whether that is fatal).
    ///
    /// # Examples
    ///
    /// ```
    /// use slipway_core::model::ReleaseType;
    ///
    /// assert_eq!(ReleaseType::derive("8.2.0"), Some(ReleaseType::Ga));
    /// assert_eq!(ReleaseType::derive("8.2.0-rc1"), Some(ReleaseType::Rc));
    /// assert_eq!(ReleaseType::derive("8.4-m01"), Some(ReleaseType::Milestone));
    /// assert_eq!(ReleaseType::derive("8.2.1-int2"), Some(ReleaseType::Maintenance));
    /// assert_eq!(ReleaseType::derive("nightly"), None);
    /// ```
    pub fn derive(tag: &str) -> Option<ReleaseType> {
        if RC_TAG.is_match(tag) {
            Some(ReleaseType::Rc)
        } else if MILESTONE_TAG.is_match(tag) {
            Some(ReleaseType::Milestone)
        } else if GA_TAG.is_match(tag) {
            Some(ReleaseType::Ga)
        } else if MAINTENANCE_TAG.is_match(tag) {
            Some(ReleaseType::Maintenance)
        } else {
            None
        }
    }

    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseType::Rc => "rc",
            ReleaseType::Ga => "ga",
            ReleaseType::Maintenance => "maintenance",
            ReleaseType::Milestone => "milestone",
        }
    }
}

impl fmt::Display for ReleaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReleaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rc" => Ok(ReleaseType::Rc),
            "ga" => Ok(ReleaseType::Ga),
            "maintenance" => Ok(ReleaseType::Maintenance),
            "milestone" => Ok(ReleaseType::Milestone),
            other => Err(format!(
                "unknown release type '{other}' (expected rc, ga, maintenance or milestone)"
            )),
        }
    }
}

/// The two workflow invocations every package undergoes per release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    /// The build stage, producing artifacts.
    Build,
    /// The publish stage, consuming the build's artifacts.
    Publish,
}

impl PhaseKind {
    /// Stable lowercase name used in node names and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Build => "build",
            PhaseKind::Publish => "publish",
        }
    }
}

/// Lifecycle of a single phase within one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// No dispatch has been issued for the current attempt.
    NotStarted,
    /// Dispatch accepted; the run is not yet (or no longer) observed live.
    Triggered,
    /// The run was found and is executing.
    InProgress,
    /// The run completed with a success conclusion.
    Succeeded,
    /// The run completed with a failure conclusion.
    Failed,
    /// The run was cancelled remotely.
    Cancelled,
    /// The run (or its monitor) timed out.
    TimedOut,
}

impl PhaseStatus {
    /// Whether the phase can make no further progress in this attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Succeeded
                | PhaseStatus::Failed
                | PhaseStatus::Cancelled
                | PhaseStatus::TimedOut
        )
    }

    /// Terminal but not successful.
    pub fn is_unsuccessful_terminal(&self) -> bool {
        self.is_terminal() && *self != PhaseStatus::Succeeded
    }

    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::NotStarted => "not_started",
            PhaseStatus::Triggered => "triggered",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Succeeded => "succeeded",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Cancelled => "cancelled",
            PhaseStatus::TimedOut => "timed_out",
        }
    }
}

/// Terminal outcome of a package pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageResult {
    /// Pipeline has not reached a terminal outcome.
    Pending,
    /// Both phases succeeded.
    Success,
    /// A phase terminally failed.
    Failed,
    /// The package did not participate in this run.
    Skipped,
}

impl Default for PackageResult {
    fn default() -> Self {
        PackageResult::Pending
    }
}

/// Coarse status of a remote workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted but not yet executing.
    Queued,
    /// Executing.
    InProgress,
    /// Finished; see the conclusion.
    Completed,
}

/// Conclusion of a completed workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunConclusion {
    /// The run succeeded.
    Success,
    /// The run failed.
    Failure,
    /// The run was cancelled.
    Cancelled,
    /// The run exceeded its own time limit.
    TimedOut,
}

/// Handle to a remote workflow run, populated after discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run id assigned by the workflow host.
    pub id: u64,

    /// Browser URL of the run.
    pub url: String,

    /// Current coarse status.
    pub status: RunStatus,

    /// Conclusion, present once `status` is [`RunStatus::Completed`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<RunConclusion>,

    /// When the run started, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the run was last updated, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A named output of a completed build run, handed to the publish phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Logical artifact name.
    pub name: String,

    /// Artifact id assigned by the workflow host (used for download).
    pub id: u64,

    /// Run id the artifact was produced by.
    pub source_run_id: u64,

    /// Direct download URL for the artifact archive.
    pub download_url: String,

    /// Content digest, when the host reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// Archive size in bytes.
    pub size: u64,
}

/// Per-phase values that live only for the duration of one controller run.
#[derive(Debug, Clone, Default)]
pub struct PhaseEphemeral {
    /// Reason a failure must not be retried (auth, missing repo, bad config).
    pub fatal_reason: Option<String>,
}

/// State of one phase (build or publish) of a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    /// Workflow file to dispatch (e.g. `build.yml`).
    pub workflow: String,

    /// Source reference to dispatch against.
    #[serde(rename = "ref")]
    pub git_ref: String,

    /// Inputs as rendered and passed at the last dispatch.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,

    /// Handle to the dispatched run, populated after discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<WorkflowRun>,

    /// Phase lifecycle status; monotonic within a single attempt.
    pub status: PhaseStatus,

    /// Number of retries so far; `0` for the first attempt.
    #[serde(default)]
    pub attempts: u32,

    /// Correlation identifier injected into the dispatch inputs so the run
    /// can be discovered by scanning recent runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    /// When the dispatch was issued; bounds the run discovery scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,

    /// Unknown fields from newer schemas, preserved across load/save.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,

    /// Run-scoped values, never persisted.
    #[serde(skip)]
    pub ephemeral: PhaseEphemeral,
}

impl PhaseState {
    /// Creates a fresh phase for `workflow` dispatched against `git_ref`.
    pub fn new(workflow: String, git_ref: String) -> Self {
        Self {
            workflow,
            git_ref,
            inputs: BTreeMap::new(),
            run: None,
            status: PhaseStatus::NotStarted,
            attempts: 0,
            uuid: None,
            dispatched_at: None,
            extra: BTreeMap::new(),
            ephemeral: PhaseEphemeral::default(),
        }
    }

    /// Begins a new attempt: clears the run handle and resets the status,
    /// incrementing `attempts`. The workflow identity and ref are kept.
    pub fn reset_for_attempt(&mut self) {
        self.inputs.clear();
        self.run = None;
        self.status = PhaseStatus::NotStarted;
        self.attempts += 1;
        self.uuid = None;
        self.dispatched_at = None;
        self.ephemeral = PhaseEphemeral::default();
    }
}

/// State of one downstream package in the release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageState {
    /// Whether this package participates in the current run.
    pub enabled: bool,

    /// Repository the package's workflows live in (`owner/repo`).
    pub repo: String,

    /// Build stage state.
    pub build: PhaseState,

    /// Publish stage state.
    pub publish: PhaseState,

    /// Artifacts collected from the successful build run, by logical name.
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactRef>,

    /// Terminal outcome of the package pipeline.
    #[serde(default)]
    pub result: PackageResult,

    /// Unknown fields from newer schemas, preserved across load/save.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl PackageState {
    /// Resets the package to a pre-run state, incrementing both phases'
    /// attempt counters. Used by the force-rebuild primitive.
    pub fn reset(&mut self) {
        self.build.reset_for_attempt();
        self.publish.reset_for_attempt();
        self.artifacts.clear();
        self.result = PackageResult::Pending;
    }
}

/// Values excluded from persistence; reloading a state discards them.
#[derive(Debug, Clone, Default)]
pub struct EphemeralMeta {
    /// Set by mutations, cleared by the post-tick sync.
    pub dirty: bool,

    /// Status channel the pinned message lives in.
    pub status_channel: Option<String>,

    /// Timestamp (message id) of the pinned status message.
    pub status_ts: Option<String>,
}

/// House-keeping metadata on the state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMeta {
    /// Schema version the document was written with.
    pub schema_version: u32,

    /// Last time the document was mutated.
    pub updated_at: DateTime<Utc>,

    /// Unknown fields from newer schemas, preserved across load/save.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,

    /// Run-scoped values, never persisted.
    #[serde(skip)]
    pub ephemeral: EphemeralMeta,
}

/// The persisted release state document, one per tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseState {
    /// The release identifier (e.g. `8.2.0`).
    pub tag: String,

    /// Kind of release, derived from the tag unless forced.
    pub release_type: ReleaseType,

    /// Per-package pipeline state.
    #[serde(default)]
    pub packages: BTreeMap<String, PackageState>,

    /// House-keeping metadata.
    pub meta: StateMeta,

    /// Unknown fields from newer schemas, preserved across load/save.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Read-only per-package projection for the status renderer and the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSummary {
    /// Package name.
    pub name: String,
    /// Whether the package participates in the current run.
    pub enabled: bool,
    /// Build phase status.
    pub build: PhaseStatus,
    /// Browser URL of the build run, when known.
    pub build_url: Option<String>,
    /// Publish phase status.
    pub publish: PhaseStatus,
    /// Browser URL of the publish run, when known.
    pub publish_url: Option<String>,
    /// Terminal outcome.
    pub result: PackageResult,
    /// Why the package cannot progress, when it terminally failed.
    pub blocking_reason: Option<String>,
}

impl ReleaseState {
    /// Creates an empty state document for `tag`.
    pub fn new(tag: impl Into<String>, release_type: ReleaseType) -> Self {
        Self {
            tag: tag.into(),
            release_type,
            packages: BTreeMap::new(),
            meta: StateMeta {
                schema_version: STATE_SCHEMA_VERSION,
                updated_at: Utc::now(),
                extra: BTreeMap::new(),
                ephemeral: EphemeralMeta::default(),
            },
            extra: BTreeMap::new(),
        }
    }

    /// Marks the document dirty and stamps the update time.
    pub fn touch(&mut self) {
        self.meta.ephemeral.dirty = true;
        self.meta.updated_at = Utc::now();
    }

    /// Looks up a package by name.
    pub fn package(&self, name: &str) -> Option<&PackageState> {
        self.packages.get(name)
    }

    /// Looks up a package by name, mutably.
    pub fn package_mut(&mut self, name: &str) -> Option<&mut PackageState> {
        self.packages.get_mut(name)
    }

    /// Looks up a phase of a package.
    pub fn phase(&self, name: &str, kind: PhaseKind) -> Option<&PhaseState> {
        self.package(name).map(|p| match kind {
            PhaseKind::Build => &p.build,
            PhaseKind::Publish => &p.publish,
        })
    }

    /// Looks up a phase of a package, mutably.
    pub fn phase_mut(&mut self, name: &str, kind: PhaseKind) -> Option<&mut PhaseState> {
        self.package_mut(name).map(|p| match kind {
            PhaseKind::Build => &mut p.build,
            PhaseKind::Publish => &mut p.publish,
        })
    }

    /// Checks the document's structural invariants.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the first violation:
    /// a `success` result without both phases succeeded, or an artifact
    /// not stamped with the succeeding build run.
    pub fn validate(&self) -> Result<(), String> {
        for (name, package) in &self.packages {
            if package.result == PackageResult::Success
                && (package.build.status != PhaseStatus::Succeeded
                    || package.publish.status != PhaseStatus::Succeeded)
            {
                return Err(format!(
                    "package '{name}' is success but build={} publish={}",
                    package.build.status.as_str(),
                    package.publish.status.as_str(),
                ));
            }
            for (artifact_name, artifact) in &package.artifacts {
                if package.build.status != PhaseStatus::Succeeded {
                    return Err(format!(
                        "package '{name}' holds artifact '{artifact_name}' \
                         but its build has not succeeded"
                    ));
                }
                let build_run_id = package.build.run.as_ref().map(|r| r.id);
                if build_run_id != Some(artifact.source_run_id) {
                    return Err(format!(
                        "artifact '{artifact_name}' of package '{name}' came from \
                         run {} but the build run is {:?}",
                        artifact.source_run_id, build_run_id,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Settles package results after the tree converged.
    ///
    /// `FinalizePackage` already marked fully successful packages; this
    /// marks disabled packages `skipped` and enabled packages with a
    /// terminally failed phase `failed`. Interrupted packages stay
    /// `pending` so a resumed run picks them up.
    pub fn reconcile_results(&mut self) {
        for package in self.packages.values_mut() {
            if package.result == PackageResult::Success {
                continue;
            }
            if !package.enabled {
                package.result = PackageResult::Skipped;
            } else if package.build.status.is_unsuccessful_terminal()
                || package.publish.status.is_unsuccessful_terminal()
            {
                package.result = PackageResult::Failed;
            }
        }
    }

    /// Per-package projection in name order.
    pub fn summaries(&self) -> Vec<PackageSummary> {
        self.packages
            .iter()
            .map(|(name, package)| PackageSummary {
                name: name.clone(),
                enabled: package.enabled,
                build: package.build.status,
                build_url: package.build.run.as_ref().map(|r| r.url.clone()),
                publish: package.publish.status,
                publish_url: package.publish.run.as_ref().map(|r| r.url.clone()),
                result: package.result,
                blocking_reason: blocking_reason(package),
            })
            .collect()
    }
}

/// Derives why a package cannot progress, if it cannot.
fn blocking_reason(package: &PackageState) -> Option<String> {
    for (kind, phase) in [
        (PhaseKind::Build, &package.build),
        (PhaseKind::Publish, &package.publish),
    ] {
        if let Some(reason) = &phase.ephemeral.fatal_reason {
            return Some(format!("{}: {reason}", kind.as_str()));
        }
        if phase.status.is_unsuccessful_terminal() {
            let run = phase
                .run
                .as_ref()
                .map(|r| format!(" ({})", r.url))
                .unwrap_or_default();
            return Some(format!(
                "{} {}{run}",
                kind.as_str(),
                phase.status.as_str(),
            ));
        }
    }
    None
}
