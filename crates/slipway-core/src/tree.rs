//! Assembly of the release behavior tree.
//!
//! The root is a barrier parallel over one branch per configured package,
//! in declared order. Each branch is guarded on `package.enabled` (a
//! disabled package trivially succeeds) and sequences dependency waits,
//! the build subtree, artifact collection, the publish subtree and the
//! finalizer. A phase subtree succeeds immediately when the phase already
//! succeeded in a previous run; otherwise it dispatches, monitors under a
//! timeout, and is retried a bounded number of times unless the failure
//! was classified as fatal.

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::bt::{Node, ParallelPolicy, Status};
use crate::clients::WorkflowClient;
use crate::config::{
    DEFAULT_BUILD_TIMEOUT_MINUTES, DEFAULT_PUBLISH_TIMEOUT_MINUTES, PackageConfig, ReleaseConfig,
};
use crate::leaves::{
    CollectArtifacts, CollectOutcome, DispatchIfNeeded, FinalizePackage, MonitorRun,
    PhaseAlreadySucceeded, WaitFor,
};
use crate::model::{PhaseKind, StateHandle};

/// Retries per phase subtree on top of the first attempt.
const PHASE_RETRY_LIMIT: u32 = 2;

/// Builds the release tree for every configured package.
pub fn build_release_tree(
    state: &StateHandle,
    config: &ReleaseConfig,
    client: &Arc<dyn WorkflowClient>,
) -> Node {
    let tag = state.borrow().tag.clone();
    let branches = config
        .packages
        .iter()
        .map(|package| package_branch(state, package, client))
        .collect();
    Node::parallel(format!("release {tag}"), ParallelPolicy::AllSuccess, branches)
}

fn package_branch(
    state: &StateHandle,
    package: &PackageConfig,
    client: &Arc<dyn WorkflowClient>,
) -> Node {
    let name = package.name.as_str();

    let mut steps = Vec::new();
    for dependency in &package.depends_on {
        steps.push(Node::leaf(WaitFor::new(Rc::clone(state), name, dependency)));
    }
    steps.push(phase_subtree(state, package, PhaseKind::Build, client));
    steps.push(Node::leaf(CollectArtifacts::new(
        Rc::clone(state),
        Arc::clone(client),
        name,
        package.build.artifacts_whitelist.clone(),
    )));
    steps.push(phase_subtree(state, package, PhaseKind::Publish, client));
    steps.push(Node::leaf(FinalizePackage::new(Rc::clone(state), name)));

    let pipeline = Node::sequence(format!("{name} pipeline"), steps);

    let pred_state = Rc::clone(state);
    let pred_name = package.name.clone();
    Node::guard(
        format!("{name} enabled?"),
        Box::new(move || {
            pred_state
                .borrow()
                .package(&pred_name)
                .map(|p| p.enabled)
                .unwrap_or(false)
        }),
        // A package excluded from this run succeeds trivially.
        Status::Success,
        pipeline,
    )
}

fn phase_subtree(
    state: &StateHandle,
    package: &PackageConfig,
    kind: PhaseKind,
    client: &Arc<dyn WorkflowClient>,
) -> Node {
    let name = package.name.as_str();
    let (phase_cfg, default_timeout) = match kind {
        PhaseKind::Build => (&package.build, DEFAULT_BUILD_TIMEOUT_MINUTES),
        PhaseKind::Publish => (&package.publish, DEFAULT_PUBLISH_TIMEOUT_MINUTES),
    };
    let timeout = Duration::from_secs(phase_cfg.timeout_minutes_or(default_timeout) * 60);

    let attempt = Node::sequence(
        format!("{name}.{} attempt", kind.as_str()),
        vec![
            Node::leaf(DispatchIfNeeded::new(
                Rc::clone(state),
                Arc::clone(client),
                name,
                kind,
                phase_cfg.inputs_template.clone(),
            )),
            Node::timeout(
                format!("{name}.{} timeout", kind.as_str()),
                timeout,
                Node::leaf(MonitorRun::new(
                    Rc::clone(state),
                    Arc::clone(client),
                    name,
                    kind,
                )),
            ),
            Node::leaf(CollectOutcome::new(Rc::clone(state), name, kind)),
        ],
    );

    // Transient failures are retried; a fatal classification gives up.
    let fatal_state = Rc::clone(state);
    let fatal_name = package.name.clone();
    let retried = Node::retry_unless(
        format!("{name}.{} retry", kind.as_str()),
        PHASE_RETRY_LIMIT,
        Some(Box::new(move || {
            fatal_state
                .borrow()
                .phase(&fatal_name, kind)
                .map(|p| p.ephemeral.fatal_reason.is_some())
                .unwrap_or(true)
        })),
        attempt,
    );

    Node::fallback(
        format!("{name}.{}", kind.as_str()),
        vec![
            Node::leaf(PhaseAlreadySucceeded::new(Rc::clone(state), name, kind)),
            retried,
        ],
    )
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::bt::BehaviourTree;
    use crate::clients::memory::RecordingWorkflowClient;
    use crate::config::PhaseConfig;
    use crate::model::{PackageResult, PhaseStatus, ReleaseState, ReleaseType};

    fn config(names: &[&str]) -> ReleaseConfig {
        ReleaseConfig {
            version: 1,
            packages: names
                .iter()
                .map(|name| PackageConfig {
                    name: name.to_string(),
                    repo: format!("acme/{name}"),
                    build: PhaseConfig {
                        workflow: "build.yml".into(),
                        ref_template: "main".into(),
                        inputs_template: Default::default(),
                        timeout_minutes: None,
                        artifacts_whitelist: Vec::new(),
                    },
                    publish: PhaseConfig {
                        workflow: "publish.yml".into(),
                        ref_template: "main".into(),
                        inputs_template: Default::default(),
                        timeout_minutes: None,
                        artifacts_whitelist: Vec::new(),
                    },
                    depends_on: Vec::new(),
                })
                .collect(),
            release_type_overrides: Default::default(),
        }
    }

    fn state_for(config: &ReleaseConfig, enabled: &[&str]) -> StateHandle {
        let mut state = ReleaseState::new("8.2.0", ReleaseType::Ga);
        for package in &config.packages {
            state.packages.insert(
                package.name.clone(),
                crate::model::PackageState {
                    enabled: enabled.contains(&package.name.as_str()),
                    repo: package.repo.clone(),
                    build: crate::model::PhaseState::new("build.yml".into(), "main".into()),
                    publish: crate::model::PhaseState::new("publish.yml".into(), "main".into()),
                    artifacts: Default::default(),
                    result: PackageResult::Pending,
                    extra: Default::default(),
                },
            );
        }
        Rc::new(RefCell::new(state))
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_skip_disabled_packages_trivially() {
        let config = config(&["docker"]);
        let state = state_for(&config, &[]);
        let client: Arc<dyn WorkflowClient> = Arc::new(RecordingWorkflowClient::new());

        let mut tree = BehaviourTree::new(build_release_tree(&state, &config, &client));
        assert_eq!(tree.tick(), crate::bt::Status::Success);
        // Nothing was dispatched and the phases were never started
        assert_eq!(
            state.borrow().phase("docker", PhaseKind::Build).unwrap().status,
            PhaseStatus::NotStarted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_hold_dependent_until_dependency_build_succeeds() {
        use crate::test_support::{ScriptedWorkflowClient, run};
        use crate::model::{RunConclusion, RunStatus};

        let mut config = config(&["docker", "debian"]);
        config.packages[1].depends_on.push("docker".into());
        let state = state_for(&config, &["docker", "debian"]);

        let scripted = Arc::new(ScriptedWorkflowClient::new());
        // Docker's build is discovered in progress and needs two polls to
        // finish; everything dispatched afterwards completes immediately.
        scripted.script_find(Ok(Some(run(1001, RunStatus::InProgress, None))));
        scripted.script_poll(Ok(run(1001, RunStatus::InProgress, None)));
        scripted.script_poll(Ok(run(
            1001,
            RunStatus::Completed,
            Some(RunConclusion::Success),
        )));
        for id in [1002, 2001, 2002] {
            scripted.script_find(Ok(Some(run(
                id,
                RunStatus::Completed,
                Some(RunConclusion::Success),
            ))));
        }

        let client: Arc<dyn WorkflowClient> = scripted.clone();
        let mut tree = BehaviourTree::new(build_release_tree(&state, &config, &client));
        let mut saw_waiting = false;
        loop {
            let status = tree.tick();
            {
                let state = state.borrow();
                let docker_build = state.phase("docker", PhaseKind::Build).unwrap().status;
                let debian_build = state.phase("debian", PhaseKind::Build).unwrap().status;
                if docker_build != PhaseStatus::Succeeded {
                    assert_eq!(
                        debian_build,
                        PhaseStatus::NotStarted,
                        "dependent dispatched before its dependency's build succeeded"
                    );
                    saw_waiting = true;
                }
            }
            if status.is_terminal() {
                assert_eq!(status, crate::bt::Status::Success);
                break;
            }
            tree.wait_for_activity().await;
        }
        assert!(saw_waiting, "dependency was never observed in a waiting state");

        let state = state.borrow();
        assert_eq!(state.package("docker").unwrap().result, PackageResult::Success);
        assert_eq!(state.package("debian").unwrap().result, PackageResult::Success);
        // The dependent did dispatch once released
        assert!(
            scripted
                .dispatches()
                .iter()
                .any(|d| d.repo == "acme/debian")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_drive_enabled_package_to_success() {
        let config = config(&["docker"]);
        let state = state_for(&config, &["docker"]);
        let client: Arc<dyn WorkflowClient> = Arc::new(RecordingWorkflowClient::new());

        let mut tree = BehaviourTree::new(build_release_tree(&state, &config, &client));
        loop {
            let status = tree.tick();
            if status.is_terminal() {
                assert_eq!(status, crate::bt::Status::Success);
                break;
            }
            tree.wait_for_activity().await;
        }

        let state = state.borrow();
        let docker = state.package("docker").unwrap();
        assert_eq!(docker.build.status, PhaseStatus::Succeeded);
        assert_eq!(docker.publish.status, PhaseStatus::Succeeded);
        assert_eq!(docker.result, PackageResult::Success);
    }
}
