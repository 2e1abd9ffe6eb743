//! Lifecycle controller: the end-to-end release run.
//!
//! Acquires the per-tag release lock, loads (or creates) the state
//! document, applies force-rebuild resets and overrides, ticks the release
//! tree to quiescence — persisting state and refreshing the status message
//! after every tick — and releases the lock on every exit path.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::bt::{BehaviourTree, Status};
use crate::clients::{StateStoreClient, StatusClient, WorkflowClient};
use crate::config::{ReleaseConfig, TemplateContext, render_template};
use crate::error::CoreError;
use crate::model::{
    PackageState, PhaseState, ReleaseState, ReleaseType, StateHandle,
};
use crate::render::{self, StatusRenderer};
use crate::store::{ResetSelector, StateStore};
use crate::tree::build_release_tree;

/// Safety valve: a tree that has not converged after this many ticks is a
/// scheduling bug, not a slow release.
const TICK_CUTOFF: u64 = 100_000;

/// Operator overrides applied on top of the configuration.
#[derive(Debug, Clone, Default)]
pub struct ReleaseOverrides {
    /// Restrict the run to these packages; empty means all.
    pub only_packages: Vec<String>,
    /// Wipe state before the run starts.
    pub force_rebuild: Option<ResetSelector>,
    /// Override the tag-derived release type.
    pub force_release_type: Option<ReleaseType>,
    /// Recording clients only; nothing real is touched.
    pub dry_run: bool,
}

/// Result of a completed (converged) release run.
#[derive(Debug, Clone)]
pub struct ReleaseOutcome {
    /// Terminal status of the tree root.
    pub root_status: Status,
    /// Final state snapshot.
    pub state: ReleaseState,
}

impl ReleaseOutcome {
    /// True when every enabled package succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.root_status == Status::Success && render::all_succeeded(&self.state)
    }
}

/// Drives a release (or a read-only status view) over injected clients.
pub struct Controller {
    config: ReleaseConfig,
    workflow: Arc<dyn WorkflowClient>,
    store: StateStore,
    status: Arc<dyn StatusClient>,
    status_channel: Option<String>,
}

impl Controller {
    /// Creates a controller over the given clients.
    pub fn new(
        config: ReleaseConfig,
        workflow: Arc<dyn WorkflowClient>,
        state_store: Arc<dyn StateStoreClient>,
        status: Arc<dyn StatusClient>,
        status_channel: Option<String>,
    ) -> Self {
        Self {
            config,
            workflow,
            store: StateStore::new(state_store),
            status,
            status_channel,
        }
    }

    /// Runs the release for `tag` to quiescence.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LockHeld`] when another controller owns the
    /// tag, [`CoreError::Config`] for unresolvable configuration, and
    /// propagates persistence failures. A failed run (packages failed but
    /// the tree converged) is an `Ok` outcome with a failure root status.
    pub async fn run_release(
        &self,
        tag: &str,
        overrides: &ReleaseOverrides,
    ) -> Result<ReleaseOutcome, CoreError> {
        let release_type = self.resolve_release_type(tag, overrides)?;
        info!(
            tag,
            release_type = %release_type,
            dry_run = overrides.dry_run,
            "starting release run"
        );

        let holder_id = format!("slipway-{}", Uuid::new_v4());
        let lock = self.store.acquire_lock(tag, &holder_id).await?;
        let result = self.run_locked(tag, release_type, overrides).await;
        if let Err(err) = self.store.release_lock(&lock).await {
            warn!(tag, error = %err, "failed to release lock");
        }
        result
    }

    async fn run_locked(
        &self,
        tag: &str,
        release_type: ReleaseType,
        overrides: &ReleaseOverrides,
    ) -> Result<ReleaseOutcome, CoreError> {
        if let Some(selector) = &overrides.force_rebuild {
            self.store.reset(tag, selector).await?;
        }

        let mut state = match self.store.load(tag).await? {
            Some(state) => state,
            None => ReleaseState::new(tag, release_type),
        };
        state.release_type = release_type;
        ensure_package_entries(&mut state, &self.config, &overrides.only_packages)?;
        state
            .validate()
            .map_err(CoreError::Invariant)?;
        state.touch();

        let handle: StateHandle = Rc::new(RefCell::new(state));
        let mut renderer =
            StatusRenderer::new(Arc::clone(&self.status), self.status_channel.clone());
        renderer.ensure_thread(&handle).await;
        self.store.sync(&handle).await?;

        let mut tree = BehaviourTree::new(build_release_tree(&handle, &self.config, &self.workflow));
        let root_status = loop {
            let status = tree.tick();
            self.store.sync(&handle).await?;
            renderer.refresh(&handle).await;
            if status.is_terminal() {
                break status;
            }
            if tree.ticks() > TICK_CUTOFF {
                return Err(CoreError::Invariant(format!(
                    "release tree did not converge within {TICK_CUTOFF} ticks"
                )));
            }
            tree.wait_for_activity().await;
        };

        {
            let mut state = handle.borrow_mut();
            state.reconcile_results();
            state.touch();
        }
        self.store.sync(&handle).await?;
        renderer.refresh(&handle).await;

        let state = handle.borrow().clone();
        state.validate().map_err(CoreError::Invariant)?;
        info!(tag, ticks = tree.ticks(), status = ?root_status, "release run converged");
        Ok(ReleaseOutcome { root_status, state })
    }

    /// Loads the state for `tag` read-only and renders it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::State`] when no state document exists yet.
    pub async fn show_status(&self, tag: &str) -> Result<String, CoreError> {
        let state = self.store.load(tag).await?.ok_or_else(|| {
            CoreError::State(format!("no release state stored for tag '{tag}'"))
        })?;
        Ok(render::render(&state))
    }

    fn resolve_release_type(
        &self,
        tag: &str,
        overrides: &ReleaseOverrides,
    ) -> Result<ReleaseType, CoreError> {
        if let Some(forced) = overrides.force_release_type {
            return Ok(forced);
        }
        if let Some(configured) = self.config.release_type_overrides.get(tag) {
            return Ok(*configured);
        }
        ReleaseType::derive(tag).ok_or_else(|| {
            CoreError::Config(format!(
                "cannot derive a release type from tag '{tag}'; \
                 use --force-release-type"
            ))
        })
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("status_channel", &self.status_channel)
            .finish_non_exhaustive()
    }
}

/// Creates missing package entries from the configuration and re-evaluates
/// the enabled flags. Entries are never deleted; a package that disappears
/// from the config keeps its recorded history but grows no branch.
fn ensure_package_entries(
    state: &mut ReleaseState,
    config: &ReleaseConfig,
    only_packages: &[String],
) -> Result<(), CoreError> {
    for name in only_packages {
        if config.package(name).is_none() {
            return Err(CoreError::Config(format!(
                "unknown package '{name}' in --only-packages"
            )));
        }
    }

    let tag = state.tag.clone();
    let empty_artifacts = Default::default();
    let ctx = TemplateContext {
        tag: &tag,
        release_type: state.release_type,
        artifacts: &empty_artifacts,
    };

    for package_cfg in &config.packages {
        let enabled =
            only_packages.is_empty() || only_packages.iter().any(|n| n == &package_cfg.name);

        if let Some(existing) = state.packages.get_mut(&package_cfg.name) {
            existing.enabled = enabled;
            existing.repo = package_cfg.repo.clone();
            continue;
        }

        let build_ref = render_template(&package_cfg.build.ref_template, &ctx)
            .map_err(|e| CoreError::Config(format!("package '{}': {e}", package_cfg.name)))?;
        let publish_ref = render_template(&package_cfg.publish.ref_template, &ctx)
            .map_err(|e| CoreError::Config(format!("package '{}': {e}", package_cfg.name)))?;

        state.packages.insert(
            package_cfg.name.clone(),
            PackageState {
                enabled,
                repo: package_cfg.repo.clone(),
                build: PhaseState::new(package_cfg.build.workflow.clone(), build_ref),
                publish: PhaseState::new(package_cfg.publish.workflow.clone(), publish_ref),
                artifacts: Default::default(),
                result: Default::default(),
                extra: Default::default(),
            },
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clients::memory::{
        InMemoryStateStore, RecordingStatusClient, RecordingWorkflowClient,
    };
    use crate::config::{PackageConfig, PhaseConfig};
    use crate::model::{PackageResult, PhaseKind, PhaseStatus, RunConclusion, RunStatus};
    use crate::test_support::{ScriptedWorkflowClient, artifact, run};

    fn phase_cfg(workflow: &str, whitelist: &[&str]) -> PhaseConfig {
        PhaseConfig {
            workflow: workflow.into(),
            ref_template: "release/{tag}".into(),
            inputs_template: Default::default(),
            timeout_minutes: None,
            artifacts_whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn single_package_config() -> ReleaseConfig {
        ReleaseConfig {
            version: 1,
            packages: vec![PackageConfig {
                name: "docker".into(),
                repo: "acme/docker-images".into(),
                build: phase_cfg("build.yml", &["pkg.tgz"]),
                publish: phase_cfg("publish.yml", &[]),
                depends_on: Vec::new(),
            }],
            release_type_overrides: Default::default(),
        }
    }

    fn two_package_config() -> ReleaseConfig {
        let mut config = single_package_config();
        config.packages.push(PackageConfig {
            name: "debian".into(),
            repo: "acme/debian-pkg".into(),
            build: phase_cfg("build.yml", &[]),
            publish: phase_cfg("publish.yml", &[]),
            depends_on: Vec::new(),
        });
        config
    }

    struct Harness {
        controller: Controller,
        workflow: Arc<ScriptedWorkflowClient>,
        store_client: Arc<InMemoryStateStore>,
    }

    fn harness(config: ReleaseConfig) -> Harness {
        let workflow = Arc::new(ScriptedWorkflowClient::new());
        let store_client = Arc::new(InMemoryStateStore::new());
        let status = Arc::new(RecordingStatusClient::new());
        let controller = Controller::new(
            config,
            workflow.clone(),
            store_client.clone(),
            status,
            None,
        );
        Harness {
            controller,
            workflow,
            store_client,
        }
    }

    async fn stored_state(h: &Harness, tag: &str) -> ReleaseState {
        let store = StateStore::new(h.store_client.clone() as Arc<dyn StateStoreClient>);
        store
            .load(tag)
            .await
            .unwrap()
            .expect("state should be stored")
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_release_single_package_happy_path() {
        let h = harness(single_package_config());
        // Build: discovered in progress, then polls to success
        h.workflow
            .script_find(Ok(Some(run(1001, RunStatus::InProgress, None))));
        h.workflow
            .script_poll(Ok(run(1001, RunStatus::InProgress, None)));
        h.workflow.script_poll(Ok(run(
            1001,
            RunStatus::Completed,
            Some(RunConclusion::Success),
        )));
        h.workflow
            .script_artifacts(1001, vec![artifact("pkg.tgz", 5, 1001, "aa11")]);
        // Publish: discovered already completed
        h.workflow.script_find(Ok(Some(run(
            2002,
            RunStatus::Completed,
            Some(RunConclusion::Success),
        ))));

        let outcome = h
            .controller
            .run_release("8.2.0", &ReleaseOverrides::default())
            .await
            .unwrap();

        assert_eq!(outcome.root_status, Status::Success);
        assert!(outcome.all_succeeded());

        let state = stored_state(&h, "8.2.0").await;
        let docker = state.package("docker").unwrap();
        assert_eq!(docker.result, PackageResult::Success);
        assert_eq!(docker.build.status, PhaseStatus::Succeeded);
        assert_eq!(docker.publish.status, PhaseStatus::Succeeded);
        let pkg = docker.artifacts.get("pkg.tgz").expect("artifact collected");
        assert_eq!(pkg.source_run_id, 1001);
        assert_eq!(pkg.sha256.as_deref(), Some("aa11"));

        // Both dispatches carried the correlation uuid and the tag
        let dispatches = h.workflow.dispatches();
        assert_eq!(dispatches.len(), 2);
        for dispatch in &dispatches {
            assert!(dispatch.inputs.contains_key("workflow_uuid"));
            assert_eq!(dispatch.inputs.get("release_tag").unwrap(), "8.2.0");
            assert_eq!(dispatch.git_ref, "release/8.2.0");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_fail_release_and_skip_publish_on_build_failure() {
        let h = harness(single_package_config());
        // First attempt plus two retries, all concluding in failure
        for id in [1001, 1002, 1003] {
            h.workflow.script_find(Ok(Some(run(
                id,
                RunStatus::Completed,
                Some(RunConclusion::Failure),
            ))));
        }

        let outcome = h
            .controller
            .run_release("8.2.0", &ReleaseOverrides::default())
            .await
            .unwrap();

        assert_eq!(outcome.root_status, Status::Failure);
        assert!(!outcome.all_succeeded());

        let state = stored_state(&h, "8.2.0").await;
        let docker = state.package("docker").unwrap();
        assert_eq!(docker.result, PackageResult::Failed);
        assert_eq!(docker.build.status, PhaseStatus::Failed);
        assert_eq!(docker.build.attempts, 2);
        assert_eq!(docker.publish.status, PhaseStatus::NotStarted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_not_retry_fatal_monitor_failure() {
        let h = harness(single_package_config());
        // Repository gone: a terminal client error must not be retried.
        h.workflow.script_find(Err(crate::clients::ClientError::Http {
            status: 404,
            endpoint: "find_run_by_uuid".into(),
            message: "Not Found".into(),
        }));

        let outcome = h
            .controller
            .run_release("8.2.0", &ReleaseOverrides::default())
            .await
            .unwrap();

        assert_eq!(outcome.root_status, Status::Failure);
        // One dispatch, one discovery attempt, no retries
        assert_eq!(h.workflow.dispatches().len(), 1);
        assert_eq!(h.workflow.find_calls().len(), 1);

        let docker = outcome.state.package("docker").unwrap();
        assert_eq!(docker.build.attempts, 0);
        let summary = &outcome.state.summaries()[0];
        assert!(
            summary
                .blocking_reason
                .as_deref()
                .is_some_and(|r| r.contains("404"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_resume_dispatched_build_without_redispatch() {
        let h = harness(single_package_config());

        // Persist a state as if a previous controller died right after
        // dispatching the build.
        {
            let store = StateStore::new(h.store_client.clone() as Arc<dyn StateStoreClient>);
            let mut state = ReleaseState::new("8.2.0", ReleaseType::Ga);
            ensure_package_entries(&mut state, &single_package_config(), &[]).unwrap();
            let build = state.phase_mut("docker", PhaseKind::Build).unwrap();
            build.status = PhaseStatus::Triggered;
            build.uuid = Some("u-123".into());
            build.dispatched_at = Some(chrono::Utc::now());
            store.save(&state).await.unwrap();
        }

        h.workflow.script_find(Ok(Some(run(
            1001,
            RunStatus::Completed,
            Some(RunConclusion::Success),
        ))));
        h.workflow
            .script_artifacts(1001, vec![artifact("pkg.tgz", 5, 1001, "aa11")]);
        h.workflow.script_find(Ok(Some(run(
            2002,
            RunStatus::Completed,
            Some(RunConclusion::Success),
        ))));

        let outcome = h
            .controller
            .run_release("8.2.0", &ReleaseOverrides::default())
            .await
            .unwrap();
        assert_eq!(outcome.root_status, Status::Success);

        // Only the publish phase dispatched; the build run was picked up
        // via the persisted uuid.
        let dispatches = h.workflow.dispatches();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].workflow_file, "publish.yml");
        assert_eq!(h.workflow.find_calls()[0], "u-123");
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_force_rebuild_only_selected_package() {
        let h = harness(two_package_config());

        // Both packages fully succeeded in a prior run.
        {
            let store = StateStore::new(h.store_client.clone() as Arc<dyn StateStoreClient>);
            let mut state = ReleaseState::new("8.2.0", ReleaseType::Ga);
            ensure_package_entries(&mut state, &two_package_config(), &[]).unwrap();
            for (name, build_id, publish_id) in
                [("docker", 1001, 1002), ("debian", 2001, 2002)]
            {
                let package = state.package_mut(name).unwrap();
                package.build.status = PhaseStatus::Succeeded;
                package.build.run = Some(run(
                    build_id,
                    RunStatus::Completed,
                    Some(RunConclusion::Success),
                ));
                package.publish.status = PhaseStatus::Succeeded;
                package.publish.run = Some(run(
                    publish_id,
                    RunStatus::Completed,
                    Some(RunConclusion::Success),
                ));
                package.result = PackageResult::Success;
            }
            state
                .package_mut("docker")
                .unwrap()
                .artifacts
                .insert("pkg.tgz".into(), artifact("pkg.tgz", 5, 1001, "aa11"));
            store.save(&state).await.unwrap();
        }

        // Fresh docker pipeline after the reset
        h.workflow.script_find(Ok(Some(run(
            3001,
            RunStatus::Completed,
            Some(RunConclusion::Success),
        ))));
        h.workflow
            .script_artifacts(3001, vec![artifact("pkg.tgz", 9, 3001, "bb22")]);
        h.workflow.script_find(Ok(Some(run(
            3002,
            RunStatus::Completed,
            Some(RunConclusion::Success),
        ))));

        let overrides = ReleaseOverrides {
            force_rebuild: Some(ResetSelector::Package("docker".into())),
            ..Default::default()
        };
        let outcome = h.controller.run_release("8.2.0", &overrides).await.unwrap();
        assert_eq!(outcome.root_status, Status::Success);

        let state = stored_state(&h, "8.2.0").await;
        let docker = state.package("docker").unwrap();
        assert_eq!(docker.build.run.as_ref().unwrap().id, 3001);
        assert_eq!(docker.build.attempts, 1);

        // The independent package was skipped via its succeeded phases and
        // keeps its original runs.
        let debian = state.package("debian").unwrap();
        assert_eq!(debian.build.run.as_ref().unwrap().id, 2001);
        assert_eq!(debian.publish.run.as_ref().unwrap().id, 2002);
        // No debian dispatches happened
        assert!(
            h.workflow
                .dispatches()
                .iter()
                .all(|d| d.repo == "acme/docker-images")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_fail_dependent_when_dependency_build_fails() {
        let mut config = two_package_config();
        // debian consumes docker's build outputs
        config.packages[1].depends_on.push("docker".into());
        let h = harness(config);

        // Docker's build fails across the initial attempt and both retries.
        for id in [1001, 1002, 1003] {
            h.workflow.script_find(Ok(Some(run(
                id,
                RunStatus::Completed,
                Some(RunConclusion::Failure),
            ))));
        }

        let outcome = h
            .controller
            .run_release("8.2.0", &ReleaseOverrides::default())
            .await
            .unwrap();

        assert_eq!(outcome.root_status, Status::Failure);

        let state = stored_state(&h, "8.2.0").await;
        assert_eq!(state.package("docker").unwrap().result, PackageResult::Failed);

        // The dependent never left the gate: no dispatch, phases untouched,
        // outcome still pending for a future run.
        let debian = state.package("debian").unwrap();
        assert_eq!(debian.build.status, PhaseStatus::NotStarted);
        assert_eq!(debian.publish.status, PhaseStatus::NotStarted);
        assert_eq!(debian.result, PackageResult::Pending);
        assert!(
            h.workflow
                .dispatches()
                .iter()
                .all(|d| d.repo == "acme/docker-images")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_abort_when_lock_is_held() {
        let h = harness(single_package_config());
        let handle = match h
            .store_client
            .acquire_lock("8.2.0", "other-controller", Duration::from_secs(3600))
            .await
            .unwrap()
        {
            crate::clients::LockAttempt::Acquired(handle) => handle,
            crate::clients::LockAttempt::Held(_) => panic!("fixture lock must acquire"),
        };

        let err = h
            .controller
            .run_release("8.2.0", &ReleaseOverrides::default())
            .await
            .unwrap_err();
        match err {
            CoreError::LockHeld { holder_id, .. } => {
                assert_eq!(holder_id, "other-controller");
            }
            other => panic!("expected LockHeld, got {other}"),
        }

        // The loser must not have written any state.
        let store = StateStore::new(h.store_client.clone() as Arc<dyn StateStoreClient>);
        assert!(store.load("8.2.0").await.unwrap().is_none());

        h.store_client.release_lock(&handle).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_dry_run_with_recorders_only() {
        let workflow = Arc::new(RecordingWorkflowClient::with_artifacts(vec![
            "pkg.tgz".into(),
        ]));
        let store_client = Arc::new(InMemoryStateStore::new());
        let controller = Controller::new(
            single_package_config(),
            workflow.clone(),
            store_client.clone(),
            Arc::new(RecordingStatusClient::new()),
            None,
        );

        let overrides = ReleaseOverrides {
            dry_run: true,
            ..Default::default()
        };
        let outcome = controller.run_release("8.2.0", &overrides).await.unwrap();
        assert_eq!(outcome.root_status, Status::Success);
        assert!(outcome.all_succeeded());

        // Intents were recorded for both phases
        assert_eq!(workflow.dispatches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_disable_packages_outside_only_packages() {
        let h = harness(two_package_config());
        h.workflow.script_find(Ok(Some(run(
            1001,
            RunStatus::Completed,
            Some(RunConclusion::Success),
        ))));
        h.workflow
            .script_artifacts(1001, vec![artifact("pkg.tgz", 5, 1001, "aa11")]);
        h.workflow.script_find(Ok(Some(run(
            1002,
            RunStatus::Completed,
            Some(RunConclusion::Success),
        ))));

        let overrides = ReleaseOverrides {
            only_packages: vec!["docker".into()],
            ..Default::default()
        };
        let outcome = h.controller.run_release("8.2.0", &overrides).await.unwrap();
        assert_eq!(outcome.root_status, Status::Success);

        let state = stored_state(&h, "8.2.0").await;
        assert_eq!(
            state.package("debian").unwrap().result,
            PackageResult::Skipped
        );
        assert_eq!(
            state.package("docker").unwrap().result,
            PackageResult::Success
        );
    }

    #[tokio::test]
    async fn test_should_reject_unknown_only_package() {
        let h = harness(single_package_config());
        let overrides = ReleaseOverrides {
            only_packages: vec!["nope".into()],
            ..Default::default()
        };
        let err = h
            .controller
            .run_release("8.2.0", &overrides)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn test_should_reject_underivable_tag() {
        let h = harness(single_package_config());
        let err = h
            .controller
            .run_release("weekly-snapshot", &ReleaseOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_render_status_read_only() {
        let h = harness(single_package_config());
        h.workflow.script_find(Ok(Some(run(
            1001,
            RunStatus::Completed,
            Some(RunConclusion::Success),
        ))));
        h.workflow
            .script_artifacts(1001, vec![artifact("pkg.tgz", 5, 1001, "aa11")]);
        h.workflow.script_find(Ok(Some(run(
            2002,
            RunStatus::Completed,
            Some(RunConclusion::Success),
        ))));
        h.controller
            .run_release("8.2.0", &ReleaseOverrides::default())
            .await
            .unwrap();

        let rendered = h.controller.show_status("8.2.0").await.unwrap();
        assert!(rendered.contains("Release 8.2.0"));
        assert!(rendered.contains("✅ docker"));
    }
}
