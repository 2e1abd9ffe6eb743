//! Domain leaves for the release tree.
//!
//! Each leaf is a single atomic action or a side-effect-free condition;
//! conditions never mutate state, actions do their one job unconditionally
//! and leave sequencing to the composites. Deferred leaves spawn exactly
//! one client call or timer at a time through [`TickCtx::spawn`] and park
//! the receiver until it resolves.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bt::{Leaf, Status, TickCtx};
use crate::clients::{ClientError, WorkflowClient};
use crate::config::{TemplateContext, render_inputs};
use crate::model::{
    ArtifactRef, PackageResult, PhaseKind, PhaseStatus, RunConclusion, RunStatus, StateHandle,
    WorkflowRun,
};

/// Delay between run-discovery attempts.
const FIND_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Discovery attempts before the phase is failed as unfindable.
const FIND_BUDGET: u32 = 5;

/// Initial delay between run status polls.
const POLL_INITIAL: Duration = Duration::from_secs(10);

/// Cap for the doubling poll delay.
const POLL_CAP: Duration = Duration::from_secs(120);

/// Scan-window skew subtracted from the dispatch timestamp, covering clock
/// drift between this host and the workflow host.
const FIND_SINCE_SKEW_SECS: i64 = 120;

/// Delay between dependency re-checks in [`WaitFor`].
const DEP_POLL: Duration = Duration::from_secs(1);

fn leaf_name(package: &str, kind: PhaseKind, action: &str) -> String {
    format!("{package}.{} {action}", kind.as_str())
}

/// Condition: the phase has already reached `succeeded`.
///
/// First child of every phase fallback, so resumed runs skip completed
/// phases without touching the network.
pub struct PhaseAlreadySucceeded {
    state: StateHandle,
    package: String,
    kind: PhaseKind,
    name: String,
}

impl PhaseAlreadySucceeded {
    pub fn new(state: StateHandle, package: &str, kind: PhaseKind) -> Self {
        Self {
            state,
            package: package.to_string(),
            kind,
            name: leaf_name(package, kind, "already succeeded?"),
        }
    }
}

impl Leaf for PhaseAlreadySucceeded {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, _ctx: &TickCtx) -> Status {
        let state = self.state.borrow();
        match state.phase(&self.package, self.kind) {
            Some(phase) if phase.status == PhaseStatus::Succeeded => Status::Success,
            Some(_) => Status::Failure,
            None => missing_package(&self.package),
        }
    }
}

/// Action: dispatch the phase workflow unless a live dispatch exists.
///
/// A phase that terminally failed is reset for a fresh attempt first
/// (attempt counter incremented, stale build artifacts cleared), then the
/// inputs are rendered from their templates, the correlation uuid and
/// standard inputs are injected, and the dispatch is fired.
pub struct DispatchIfNeeded {
    state: StateHandle,
    client: Arc<dyn WorkflowClient>,
    package: String,
    kind: PhaseKind,
    inputs_template: BTreeMap<String, String>,
    pending: Option<oneshot::Receiver<Result<(), ClientError>>>,
    name: String,
}

impl DispatchIfNeeded {
    pub fn new(
        state: StateHandle,
        client: Arc<dyn WorkflowClient>,
        package: &str,
        kind: PhaseKind,
        inputs_template: BTreeMap<String, String>,
    ) -> Self {
        Self {
            state,
            client,
            package: package.to_string(),
            kind,
            inputs_template,
            pending: None,
            name: leaf_name(package, kind, "dispatch"),
        }
    }

    fn start(&mut self, ctx: &TickCtx) -> Status {
        let mut state = self.state.borrow_mut();

        let Some(phase) = state.phase(&self.package, self.kind) else {
            return missing_package(&self.package);
        };
        match phase.status {
            PhaseStatus::Succeeded
            | PhaseStatus::Triggered
            | PhaseStatus::InProgress => return Status::Success,
            PhaseStatus::NotStarted => {}
            PhaseStatus::Failed | PhaseStatus::Cancelled | PhaseStatus::TimedOut => {
                // New attempt. A rebuilt package invalidates previously
                // collected artifacts (they are stamped with the old run).
                let Some(package) = state.package_mut(&self.package) else {
                    return missing_package(&self.package);
                };
                if self.kind == PhaseKind::Build {
                    package.artifacts.clear();
                }
                let phase = match self.kind {
                    PhaseKind::Build => &mut package.build,
                    PhaseKind::Publish => &mut package.publish,
                };
                phase.reset_for_attempt();
                info!(
                    package = %self.package,
                    phase = self.kind.as_str(),
                    attempt = phase.attempts,
                    "starting new phase attempt"
                );
            }
        }

        let tag = state.tag.clone();
        let release_type = state.release_type;
        let status_channel = state.meta.ephemeral.status_channel.clone();
        let status_ts = state.meta.ephemeral.status_ts.clone();
        let Some(package) = state.package(&self.package) else {
            return missing_package(&self.package);
        };
        let repo = package.repo.clone();
        let artifacts = package.artifacts.clone();

        let template_ctx = TemplateContext {
            tag: &tag,
            release_type,
            artifacts: &artifacts,
        };
        let rendered = render_inputs(&self.inputs_template, &template_ctx);
        let Some(phase) = state.phase_mut(&self.package, self.kind) else {
            return missing_package(&self.package);
        };
        let mut inputs = match rendered {
            Ok(inputs) => inputs,
            Err(err) => {
                phase.ephemeral.fatal_reason = Some(err.to_string());
                error!(
                    package = %self.package,
                    phase = self.kind.as_str(),
                    error = %err,
                    "cannot render workflow inputs"
                );
                return Status::Failure;
            }
        };

        let uuid = Uuid::new_v4().to_string();
        inputs.insert("workflow_uuid".to_string(), uuid.clone());
        inputs.insert("release_tag".to_string(), tag);
        if let (Some(channel), Some(ts)) = (status_channel, status_ts) {
            inputs.insert("status_channel".to_string(), channel);
            inputs.insert("status_ts".to_string(), ts);
        }

        phase.uuid = Some(uuid.clone());
        phase.inputs = inputs.clone();
        let workflow = phase.workflow.clone();
        let git_ref = phase.git_ref.clone();
        state.touch();
        drop(state);

        info!(
            package = %self.package,
            phase = self.kind.as_str(),
            workflow = %workflow,
            git_ref = %git_ref,
            uuid = %uuid,
            "dispatching workflow"
        );
        let client = Arc::clone(&self.client);
        self.pending = Some(ctx.spawn(async move {
            client.dispatch(&repo, &workflow, &git_ref, &inputs).await
        }));
        Status::Running
    }
}

impl Leaf for DispatchIfNeeded {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, ctx: &TickCtx) -> Status {
        let Some(rx) = &mut self.pending else {
            return self.start(ctx);
        };
        match rx.try_recv() {
            Err(TryRecvError::Empty) => Status::Running,
            Ok(Ok(())) => {
                self.pending = None;
                let mut state = self.state.borrow_mut();
                let Some(phase) = state.phase_mut(&self.package, self.kind) else {
                    return missing_package(&self.package);
                };
                phase.status = PhaseStatus::Triggered;
                phase.dispatched_at = Some(Utc::now());
                state.touch();
                info!(
                    package = %self.package,
                    phase = self.kind.as_str(),
                    "workflow dispatched"
                );
                Status::Success
            }
            Ok(Err(err)) => {
                self.pending = None;
                let mut state = self.state.borrow_mut();
                if let Some(phase) = state.phase_mut(&self.package, self.kind) {
                    if !err.is_transient() {
                        phase.ephemeral.fatal_reason = Some(err.to_string());
                    }
                }
                error!(
                    package = %self.package,
                    phase = self.kind.as_str(),
                    error = %err,
                    "workflow dispatch failed"
                );
                Status::Failure
            }
            Err(TryRecvError::Closed) => {
                self.pending = None;
                Status::Failure
            }
        }
    }

    fn cancel(&mut self) {
        self.pending = None;
    }

    fn reset(&mut self) {
        self.pending = None;
    }
}

enum MonitorStep {
    Idle,
    Find(oneshot::Receiver<Result<Option<WorkflowRun>, ClientError>>),
    Wait {
        rx: oneshot::Receiver<()>,
        next: NextAction,
    },
    Poll(oneshot::Receiver<Result<WorkflowRun, ClientError>>),
}

#[derive(Clone, Copy)]
enum NextAction {
    Find,
    Poll,
}

/// Deferred action: discover the dispatched run and poll it to completion.
///
/// Discovery scans recent runs for the correlation uuid, bounded by the
/// dispatch timestamp; polling doubles its delay from [`POLL_INITIAL`] up
/// to [`POLL_CAP`]. Conclusions map onto the phase status; a non-transient
/// client error records a fatal reason so the surrounding retry gives up.
pub struct MonitorRun {
    state: StateHandle,
    client: Arc<dyn WorkflowClient>,
    package: String,
    kind: PhaseKind,
    step: MonitorStep,
    find_attempts: u32,
    poll_delay: Duration,
    name: String,
}

impl MonitorRun {
    pub fn new(
        state: StateHandle,
        client: Arc<dyn WorkflowClient>,
        package: &str,
        kind: PhaseKind,
    ) -> Self {
        Self {
            state,
            client,
            package: package.to_string(),
            kind,
            step: MonitorStep::Idle,
            find_attempts: 0,
            poll_delay: POLL_INITIAL,
            name: leaf_name(package, kind, "monitor"),
        }
    }

    fn spawn_find(&mut self, ctx: &TickCtx) -> Status {
        let state = self.state.borrow();
        let Some(package) = state.package(&self.package) else {
            return missing_package(&self.package);
        };
        let phase = match self.kind {
            PhaseKind::Build => &package.build,
            PhaseKind::Publish => &package.publish,
        };
        let Some(uuid) = phase.uuid.clone() else {
            error!(
                package = %self.package,
                phase = self.kind.as_str(),
                "no dispatch uuid recorded, cannot discover run"
            );
            return Status::Failure;
        };
        let since = phase
            .dispatched_at
            .unwrap_or_else(Utc::now)
            - ChronoDuration::seconds(FIND_SINCE_SKEW_SECS);
        let repo = package.repo.clone();
        let workflow = phase.workflow.clone();
        drop(state);

        debug!(
            package = %self.package,
            phase = self.kind.as_str(),
            uuid = %uuid,
            attempt = self.find_attempts + 1,
            "searching for workflow run"
        );
        let client = Arc::clone(&self.client);
        self.step = MonitorStep::Find(ctx.spawn(async move {
            client
                .find_run_by_uuid(&repo, &workflow, &uuid, since)
                .await
        }));
        Status::Running
    }

    fn spawn_poll(&mut self, ctx: &TickCtx) -> Status {
        let state = self.state.borrow();
        let Some(package) = state.package(&self.package) else {
            return missing_package(&self.package);
        };
        let phase = match self.kind {
            PhaseKind::Build => &package.build,
            PhaseKind::Publish => &package.publish,
        };
        let Some(run) = &phase.run else {
            drop(state);
            return self.spawn_find(ctx);
        };
        let run_id = run.id;
        let repo = package.repo.clone();
        drop(state);

        let client = Arc::clone(&self.client);
        self.step = MonitorStep::Poll(
            ctx.spawn(async move { client.get_run(&repo, run_id).await }),
        );
        self.poll_delay = (self.poll_delay * 2).min(POLL_CAP);
        Status::Running
    }

    /// Records the freshly observed run and maps it onto the phase status.
    /// Returns the leaf status when the run is terminal.
    fn absorb_run(&mut self, run: WorkflowRun) -> Option<Status> {
        let mut state = self.state.borrow_mut();
        let phase = state.phase_mut(&self.package, self.kind)?;

        let old_status = phase.status;
        let new_status = match run.status {
            RunStatus::Queued => PhaseStatus::Triggered,
            RunStatus::InProgress => PhaseStatus::InProgress,
            RunStatus::Completed => match run.conclusion {
                Some(RunConclusion::Success) => PhaseStatus::Succeeded,
                Some(RunConclusion::Cancelled) => PhaseStatus::Cancelled,
                Some(RunConclusion::TimedOut) => PhaseStatus::TimedOut,
                // A completed run without a conclusion is treated as failed.
                Some(RunConclusion::Failure) | None => PhaseStatus::Failed,
            },
        };
        phase.run = Some(run);
        phase.status = new_status;
        if old_status != new_status {
            info!(
                package = %self.package,
                phase = self.kind.as_str(),
                from = old_status.as_str(),
                to = new_status.as_str(),
                "workflow status changed"
            );
        }
        state.touch();

        match new_status {
            PhaseStatus::Succeeded => Some(Status::Success),
            s if s.is_unsuccessful_terminal() => Some(Status::Failure),
            _ => None,
        }
    }

    fn fail_with(&mut self, err: ClientError) -> Status {
        let mut state = self.state.borrow_mut();
        if let Some(phase) = state.phase_mut(&self.package, self.kind) {
            if !err.is_transient() {
                phase.ephemeral.fatal_reason = Some(err.to_string());
            }
        }
        error!(
            package = %self.package,
            phase = self.kind.as_str(),
            error = %err,
            "run monitoring failed"
        );
        Status::Failure
    }
}

impl Leaf for MonitorRun {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, ctx: &TickCtx) -> Status {
        let step = std::mem::replace(&mut self.step, MonitorStep::Idle);
        match step {
            MonitorStep::Idle => {
                let (status, run_known) = {
                    let state = self.state.borrow();
                    let Some(phase) = state.phase(&self.package, self.kind) else {
                        return missing_package(&self.package);
                    };
                    (phase.status, phase.run.is_some())
                };
                if status == PhaseStatus::Succeeded {
                    return Status::Success;
                }
                if status.is_unsuccessful_terminal() {
                    return Status::Failure;
                }
                if run_known {
                    self.spawn_poll(ctx)
                } else {
                    self.spawn_find(ctx)
                }
            }
            MonitorStep::Find(mut rx) => match rx.try_recv() {
                Err(TryRecvError::Empty) => {
                    self.step = MonitorStep::Find(rx);
                    Status::Running
                }
                Ok(Ok(Some(run))) => {
                    info!(
                        package = %self.package,
                        phase = self.kind.as_str(),
                        run_id = run.id,
                        url = %run.url,
                        "workflow run discovered"
                    );
                    if let Some(terminal) = self.absorb_run(run) {
                        return terminal;
                    }
                    self.step = MonitorStep::Wait {
                        rx: ctx.timer(self.poll_delay),
                        next: NextAction::Poll,
                    };
                    Status::Running
                }
                Ok(Ok(None)) => {
                    self.find_attempts += 1;
                    if self.find_attempts >= FIND_BUDGET {
                        let mut state = self.state.borrow_mut();
                        if let Some(phase) = state.phase_mut(&self.package, self.kind) {
                            phase.ephemeral.fatal_reason = Some(format!(
                                "no run matching uuid {} appeared within {} attempts",
                                phase.uuid.as_deref().unwrap_or("?"),
                                FIND_BUDGET,
                            ));
                        }
                        error!(
                            package = %self.package,
                            phase = self.kind.as_str(),
                            "workflow run not found"
                        );
                        return Status::Failure;
                    }
                    self.step = MonitorStep::Wait {
                        rx: ctx.timer(FIND_RETRY_DELAY),
                        next: NextAction::Find,
                    };
                    Status::Running
                }
                Ok(Err(err)) => self.fail_with(err),
                Err(TryRecvError::Closed) => Status::Failure,
            },
            MonitorStep::Wait { mut rx, next } => match rx.try_recv() {
                Err(TryRecvError::Empty) => {
                    self.step = MonitorStep::Wait { rx, next };
                    Status::Running
                }
                _ => match next {
                    NextAction::Find => self.spawn_find(ctx),
                    NextAction::Poll => self.spawn_poll(ctx),
                },
            },
            MonitorStep::Poll(mut rx) => match rx.try_recv() {
                Err(TryRecvError::Empty) => {
                    self.step = MonitorStep::Poll(rx);
                    Status::Running
                }
                Ok(Ok(run)) => {
                    if let Some(terminal) = self.absorb_run(run) {
                        return terminal;
                    }
                    self.step = MonitorStep::Wait {
                        rx: ctx.timer(self.poll_delay),
                        next: NextAction::Poll,
                    };
                    Status::Running
                }
                Ok(Err(err)) => self.fail_with(err),
                Err(TryRecvError::Closed) => Status::Failure,
            },
        }
    }

    fn cancel(&mut self) {
        self.step = MonitorStep::Idle;
    }

    fn reset(&mut self) {
        self.step = MonitorStep::Idle;
        self.find_attempts = 0;
        self.poll_delay = POLL_INITIAL;
    }
}

/// Condition closing each phase sequence: the phase settled on `succeeded`.
pub struct CollectOutcome {
    state: StateHandle,
    package: String,
    kind: PhaseKind,
    name: String,
}

impl CollectOutcome {
    pub fn new(state: StateHandle, package: &str, kind: PhaseKind) -> Self {
        Self {
            state,
            package: package.to_string(),
            kind,
            name: leaf_name(package, kind, "outcome"),
        }
    }
}

impl Leaf for CollectOutcome {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, _ctx: &TickCtx) -> Status {
        let state = self.state.borrow();
        let Some(phase) = state.phase(&self.package, self.kind) else {
            return missing_package(&self.package);
        };
        if phase.status == PhaseStatus::Succeeded {
            Status::Success
        } else {
            let url = phase
                .run
                .as_ref()
                .map(|r| r.url.clone())
                .unwrap_or_default();
            warn!(
                package = %self.package,
                phase = self.kind.as_str(),
                status = phase.status.as_str(),
                url = %url,
                "phase did not succeed"
            );
            Status::Failure
        }
    }
}

/// Deferred action: enumerate the successful build run's artifacts and
/// record them on the package, stamped with the producing run id.
///
/// Idempotent: a package that already carries artifacts is left untouched.
pub struct CollectArtifacts {
    state: StateHandle,
    client: Arc<dyn WorkflowClient>,
    package: String,
    whitelist: Vec<String>,
    pending: Option<oneshot::Receiver<Result<Vec<ArtifactRef>, ClientError>>>,
    name: String,
}

impl CollectArtifacts {
    pub fn new(
        state: StateHandle,
        client: Arc<dyn WorkflowClient>,
        package: &str,
        whitelist: Vec<String>,
    ) -> Self {
        Self {
            state,
            client,
            package: package.to_string(),
            whitelist,
            pending: None,
            name: format!("{package} collect artifacts"),
        }
    }

    fn start(&mut self, ctx: &TickCtx) -> Status {
        let state = self.state.borrow();
        let Some(package) = state.package(&self.package) else {
            return missing_package(&self.package);
        };
        if !package.artifacts.is_empty() {
            return Status::Success;
        }
        if package.build.status != PhaseStatus::Succeeded {
            error!(
                package = %self.package,
                status = package.build.status.as_str(),
                "cannot collect artifacts before the build succeeded"
            );
            return Status::Failure;
        }
        let Some(run) = &package.build.run else {
            error!(package = %self.package, "build succeeded but no run is recorded");
            return Status::Failure;
        };
        let repo = package.repo.clone();
        let run_id = run.id;
        drop(state);

        let client = Arc::clone(&self.client);
        self.pending = Some(ctx.spawn(
            async move { client.list_artifacts(&repo, run_id).await },
        ));
        Status::Running
    }
}

impl Leaf for CollectArtifacts {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, ctx: &TickCtx) -> Status {
        let Some(rx) = &mut self.pending else {
            return self.start(ctx);
        };
        match rx.try_recv() {
            Err(TryRecvError::Empty) => Status::Running,
            Ok(Ok(artifacts)) => {
                self.pending = None;
                let kept: BTreeMap<String, ArtifactRef> = artifacts
                    .into_iter()
                    .filter(|a| self.whitelist.is_empty() || self.whitelist.contains(&a.name))
                    .map(|a| (a.name.clone(), a))
                    .collect();

                for wanted in &self.whitelist {
                    if !kept.contains_key(wanted) {
                        error!(
                            package = %self.package,
                            artifact = %wanted,
                            "expected artifact missing from build run"
                        );
                        return Status::Failure;
                    }
                }

                let mut state = self.state.borrow_mut();
                let Some(package) = state.package_mut(&self.package) else {
                    return missing_package(&self.package);
                };
                info!(
                    package = %self.package,
                    count = kept.len(),
                    "collected build artifacts"
                );
                package.artifacts = kept;
                state.touch();
                Status::Success
            }
            Ok(Err(err)) => {
                self.pending = None;
                error!(
                    package = %self.package,
                    error = %err,
                    "artifact listing failed"
                );
                Status::Failure
            }
            Err(TryRecvError::Closed) => {
                self.pending = None;
                Status::Failure
            }
        }
    }

    fn cancel(&mut self) {
        self.pending = None;
    }

    fn reset(&mut self) {
        self.pending = None;
    }
}

/// Action closing the package branch: record the terminal success.
pub struct FinalizePackage {
    state: StateHandle,
    package: String,
    name: String,
}

impl FinalizePackage {
    pub fn new(state: StateHandle, package: &str) -> Self {
        Self {
            state,
            package: package.to_string(),
            name: format!("{package} finalize"),
        }
    }
}

impl Leaf for FinalizePackage {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, _ctx: &TickCtx) -> Status {
        let mut state = self.state.borrow_mut();
        let Some(package) = state.package_mut(&self.package) else {
            return missing_package(&self.package);
        };
        if package.build.status != PhaseStatus::Succeeded
            || package.publish.status != PhaseStatus::Succeeded
        {
            error!(
                package = %self.package,
                build = package.build.status.as_str(),
                publish = package.publish.status.as_str(),
                "finalize reached without both phases succeeded"
            );
            return Status::Failure;
        }
        package.result = PackageResult::Success;
        state.touch();
        info!(package = %self.package, "package released");
        Status::Success
    }
}

/// Condition: another package's build has succeeded.
///
/// Used for configured `depends_on` edges; re-checks on a short timer so
/// the tick loop is never left without a pending wake-up.
pub struct WaitFor {
    state: StateHandle,
    dependency: String,
    timer: Option<oneshot::Receiver<()>>,
    name: String,
}

impl WaitFor {
    pub fn new(state: StateHandle, package: &str, dependency: &str) -> Self {
        Self {
            state,
            dependency: dependency.to_string(),
            timer: None,
            name: format!("{package} wait for {dependency}"),
        }
    }
}

impl Leaf for WaitFor {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, ctx: &TickCtx) -> Status {
        let status = {
            let state = self.state.borrow();
            match state.phase(&self.dependency, PhaseKind::Build) {
                Some(phase) => phase.status,
                None => return missing_package(&self.dependency),
            }
        };
        if status == PhaseStatus::Succeeded {
            self.timer = None;
            return Status::Success;
        }
        if status.is_unsuccessful_terminal() {
            warn!(
                dependency = %self.dependency,
                status = status.as_str(),
                "dependency terminally failed"
            );
            self.timer = None;
            return Status::Failure;
        }
        if let Some(rx) = &mut self.timer {
            if matches!(rx.try_recv(), Err(TryRecvError::Empty)) {
                return Status::Running;
            }
        }
        self.timer = Some(ctx.timer(DEP_POLL));
        Status::Running
    }

    fn cancel(&mut self) {
        self.timer = None;
    }

    fn reset(&mut self) {
        self.timer = None;
    }
}

fn missing_package(name: &str) -> Status {
    error!(package = %name, "package missing from state document");
    Status::Failure
}
