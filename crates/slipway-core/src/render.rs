//! Post-tick status rendering.
//!
//! Projects the release state into a human-readable message and keeps a
//! single pinned status message up to date. The renderer compares against
//! the last emitted rendering and only calls the status sink on change;
//! sink errors are logged and swallowed so the tree never stalls on a
//! status update.

use std::sync::Arc;

use tracing::{info, warn};

use crate::clients::StatusClient;
use crate::model::{PackageResult, PackageSummary, ReleaseState, StateHandle};

/// Keeps the pinned status message in sync with the release state.
pub struct StatusRenderer {
    client: Arc<dyn StatusClient>,
    channel: Option<String>,
    last: Option<String>,
}

impl StatusRenderer {
    /// Creates a renderer posting into `channel`; with no channel the
    /// renderer is inert and only the CLI projection remains.
    pub fn new(client: Arc<dyn StatusClient>, channel: Option<String>) -> Self {
        Self {
            client,
            channel,
            last: None,
        }
    }

    /// Posts the initial status message and pins its coordinates into the
    /// ephemeral metadata so dispatched workflows can reply in-thread.
    pub async fn ensure_thread(&mut self, state: &StateHandle) {
        let Some(channel) = self.channel.clone() else {
            return;
        };
        if state.borrow().meta.ephemeral.status_ts.is_some() {
            return;
        }
        let body = render(&state.borrow());
        match self.client.post_message(&channel, None, &body).await {
            Ok(ts) => {
                info!(channel = %channel, ts = %ts, "status thread created");
                let mut state = state.borrow_mut();
                state.meta.ephemeral.status_channel = Some(channel);
                state.meta.ephemeral.status_ts = Some(ts);
                self.last = Some(body);
            }
            Err(err) => {
                warn!(error = %err, "could not create status thread");
            }
        }
    }

    /// Refreshes the pinned message if the rendering changed.
    pub async fn refresh(&mut self, state: &StateHandle) {
        let (channel, ts) = {
            let state = state.borrow();
            match (
                state.meta.ephemeral.status_channel.clone(),
                state.meta.ephemeral.status_ts.clone(),
            ) {
                (Some(channel), Some(ts)) => (channel, ts),
                _ => return,
            }
        };
        let body = render(&state.borrow());
        if self.last.as_deref() == Some(body.as_str()) {
            return;
        }
        match self.client.update_message(&channel, &ts, &body).await {
            Ok(()) => self.last = Some(body),
            Err(err) => {
                // Next tick retries with a fresh rendering.
                warn!(error = %err, "status update failed");
            }
        }
    }
}

impl std::fmt::Debug for StatusRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusRenderer")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Renders the whole release state, one package per line.
pub fn render(state: &ReleaseState) -> String {
    let mut lines = vec![format!(
        "Release {} ({})",
        state.tag, state.release_type
    )];
    for summary in state.summaries() {
        lines.push(render_package(&summary));
    }
    lines.join("\n")
}

fn render_package(summary: &PackageSummary) -> String {
    let glyph = match summary.result {
        PackageResult::Success => "✅",
        PackageResult::Failed => "❌",
        PackageResult::Skipped => "⏭",
        PackageResult::Pending => {
            if summary.enabled {
                "🔄"
            } else {
                "⏸"
            }
        }
    };
    let mut line = format!(
        "{glyph} {} — build {}{}, publish {}{}",
        summary.name,
        summary.build.as_str(),
        render_link(summary.build_url.as_deref()),
        summary.publish.as_str(),
        render_link(summary.publish_url.as_deref()),
    );
    if let Some(reason) = &summary.blocking_reason {
        line.push_str(&format!(" — {reason}"));
    }
    line
}

fn render_link(url: Option<&str>) -> String {
    match url {
        Some(url) => format!(" <{url}>"),
        None => String::new(),
    }
}

/// True when every enabled package ended successfully.
pub fn all_succeeded(state: &ReleaseState) -> bool {
    state
        .packages
        .values()
        .filter(|p| p.enabled)
        .all(|p| p.result == PackageResult::Success)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    use super::*;
    use crate::clients::memory::RecordingStatusClient;
    use crate::model::{
        PackageState, PhaseState, PhaseStatus, ReleaseType, RunConclusion, RunStatus, WorkflowRun,
    };

    fn sample_state() -> ReleaseState {
        let mut state = ReleaseState::new("8.2.0", ReleaseType::Ga);
        let mut build = PhaseState::new("build.yml".into(), "main".into());
        build.status = PhaseStatus::Succeeded;
        build.run = Some(WorkflowRun {
            id: 1001,
            url: "https://github.com/acme/pkg/actions/runs/1001".into(),
            status: RunStatus::Completed,
            conclusion: Some(RunConclusion::Success),
            started_at: None,
            updated_at: None,
        });
        state.packages.insert(
            "docker".into(),
            PackageState {
                enabled: true,
                repo: "acme/pkg".into(),
                build,
                publish: PhaseState::new("publish.yml".into(), "main".into()),
                artifacts: BTreeMap::new(),
                result: PackageResult::Pending,
                extra: BTreeMap::new(),
            },
        );
        state
    }

    #[test]
    fn test_should_render_header_and_package_line() {
        let rendered = render(&sample_state());
        assert!(rendered.starts_with("Release 8.2.0 (ga)"));
        assert!(rendered.contains("docker"));
        assert!(rendered.contains("build succeeded"));
        assert!(rendered.contains("runs/1001"));
        assert!(rendered.contains("publish not_started"));
    }

    #[test]
    fn test_should_render_failure_with_reason() {
        let mut state = sample_state();
        {
            let pkg = state.package_mut("docker").unwrap();
            pkg.result = PackageResult::Failed;
            pkg.publish.status = PhaseStatus::Failed;
        }
        let rendered = render(&state);
        assert!(rendered.contains("❌ docker"));
        assert!(rendered.contains("publish failed"));
    }

    #[tokio::test]
    async fn test_should_post_once_and_update_on_change() {
        let recorder = Arc::new(RecordingStatusClient::new());
        let client: Arc<dyn StatusClient> = recorder.clone();
        let mut renderer = StatusRenderer::new(client, Some("C123".into()));
        let handle: StateHandle = Rc::new(RefCell::new(sample_state()));

        renderer.ensure_thread(&handle).await;
        assert_eq!(recorder.posts().len(), 1);
        assert!(handle.borrow().meta.ephemeral.status_ts.is_some());

        // Unchanged state: no update call
        renderer.refresh(&handle).await;
        assert!(recorder.updates().is_empty());

        // Mutation changes the rendering
        handle.borrow_mut().package_mut("docker").unwrap().publish.status =
            PhaseStatus::InProgress;
        renderer.refresh(&handle).await;
        assert_eq!(recorder.updates().len(), 1);
        assert!(recorder.updates()[0].contains("publish in_progress"));
    }

    #[tokio::test]
    async fn test_should_stay_inert_without_channel() {
        let recorder = Arc::new(RecordingStatusClient::new());
        let client: Arc<dyn StatusClient> = recorder.clone();
        let mut renderer = StatusRenderer::new(client, None);
        let handle: StateHandle = Rc::new(RefCell::new(sample_state()));

        renderer.ensure_thread(&handle).await;
        renderer.refresh(&handle).await;
        assert!(recorder.posts().is_empty());
        assert!(recorder.updates().is_empty());
    }
}
