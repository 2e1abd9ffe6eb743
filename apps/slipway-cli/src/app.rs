//! Command handlers: client wiring and exit-code mapping.
//!
//! Builds the controller from environment credentials (or from recorders
//! for dry runs), executes the requested command, and maps outcomes and
//! errors onto the stable exit codes.

use std::path::Path;
use std::sync::Arc;

use slipway_core::clients::github::GitHubWorkflowClient;
use slipway_core::clients::memory::{
    InMemoryStateStore, RecordingStatusClient, RecordingWorkflowClient,
};
use slipway_core::clients::s3::S3StateStore;
use slipway_core::clients::slack::SlackStatusClient;
use slipway_core::{
    Controller, CoreError, ReleaseConfig, ReleaseOverrides, StateStoreClient, StatusClient,
    WorkflowClient, render,
};
use tracing::{error, info};

use crate::exit_codes;

/// Runs the release pipeline and prints the final per-package table.
pub async fn run_release(tag: &str, config_path: &Path, overrides: ReleaseOverrides) -> i32 {
    let outcome = async {
        let config = ReleaseConfig::from_yaml(config_path)?;
        let controller = build_controller(config, overrides.dry_run).await?;
        controller.run_release(tag, &overrides).await
    }
    .await;

    match outcome {
        Ok(outcome) => {
            println!("{}", render::render(&outcome.state));
            if outcome.all_succeeded() {
                exit_codes::OK
            } else {
                exit_codes::RELEASE_FAILED
            }
        }
        Err(err) => report_error(err),
    }
}

/// Renders the persisted state for a tag read-only.
pub async fn show_status(tag: &str, config_path: &Path) -> i32 {
    let rendered = async {
        let config = ReleaseConfig::from_yaml(config_path)?;
        let controller = build_controller(config, false).await?;
        controller.show_status(tag).await
    }
    .await;

    match rendered {
        Ok(rendered) => {
            println!("{rendered}");
            exit_codes::OK
        }
        Err(err) => report_error(err),
    }
}

async fn build_controller(config: ReleaseConfig, dry_run: bool) -> Result<Controller, CoreError> {
    if dry_run {
        info!("dry run: wiring recording clients");
        let artifact_names: Vec<String> = config
            .packages
            .iter()
            .flat_map(|p| p.build.artifacts_whitelist.iter().cloned())
            .collect();
        let workflow: Arc<dyn WorkflowClient> =
            Arc::new(RecordingWorkflowClient::with_artifacts(artifact_names));
        let state_store: Arc<dyn StateStoreClient> = Arc::new(InMemoryStateStore::new());
        let status: Arc<dyn StatusClient> = Arc::new(RecordingStatusClient::new());
        return Ok(Controller::new(config, workflow, state_store, status, None));
    }

    let github_token = require_env("GITHUB_TOKEN")?;
    let bucket = require_env("SLIPWAY_STATE_BUCKET")?;

    let aws_config = aws_config::load_from_env().await;
    let state_store: Arc<dyn StateStoreClient> = Arc::new(S3StateStore::new(
        aws_sdk_s3::Client::new(&aws_config),
        bucket,
    ));
    let workflow: Arc<dyn WorkflowClient> = Arc::new(GitHubWorkflowClient::new(github_token));

    // The status thread is optional; without Slack credentials the run is
    // observable through logs and `slipway status`.
    let (status, status_channel): (Arc<dyn StatusClient>, Option<String>) = match (
        std::env::var("SLACK_BOT_TOKEN").ok(),
        std::env::var("SLIPWAY_STATUS_CHANNEL").ok(),
    ) {
        (Some(token), Some(channel)) => (Arc::new(SlackStatusClient::new(token)), Some(channel)),
        _ => (Arc::new(RecordingStatusClient::new()), None),
    };

    Ok(Controller::new(
        config,
        workflow,
        state_store,
        status,
        status_channel,
    ))
}

fn require_env(name: &str) -> Result<String, CoreError> {
    std::env::var(name)
        .map_err(|_| CoreError::Config(format!("environment variable {name} is not set")))
}

fn report_error(err: CoreError) -> i32 {
    match &err {
        CoreError::LockHeld { .. } => {
            error!("{err}");
            exit_codes::LOCK_HELD
        }
        CoreError::Config(_) => {
            error!("{err}");
            exit_codes::USAGE
        }
        _ => {
            error!("{err}");
            exit_codes::INTERNAL
        }
    }
}
