//! Thin async client for the Slack Web API methods used by the renderer.
//!
//! Wraps `reqwest::Client` with the bot token for authorization and
//! provides typed methods for `chat.postMessage` and `chat.update`.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::clients::{ClientError, StatusClient, with_retry};

/// Base URL for the Slack Web API.
const SLACK_API_BASE: &str = "https://slack.com/api";

/// Status client backed by the Slack Web API.
#[derive(Debug, Clone)]
pub struct SlackStatusClient {
    http: reqwest::Client,
    bot_token: String,
    api_base: String,
}

/// Generic Slack API response envelope for deserialization.
#[derive(Debug, Deserialize)]
struct SlackApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

impl SlackStatusClient {
    /// Creates a new client with the given bot token (`xoxb-...`).
    pub fn new(bot_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token,
            api_base: SLACK_API_BASE.to_string(),
        }
    }

    /// Sends a JSON POST request to a Slack Web API method.
    async fn call(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<SlackApiResponse, ClientError> {
        let response = self
            .http
            .post(format!("{}/{method}", self.api_base))
            .bearer_auth(&self.bot_token)
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("{method}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Http {
                status: status.as_u16(),
                endpoint: method.to_string(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        response
            .json::<SlackApiResponse>()
            .await
            .map_err(|e| ClientError::Protocol(format!("{method}: {e}")))
    }
}

#[async_trait]
impl StatusClient for SlackStatusClient {
    async fn post_message(
        &self,
        channel: &str,
        thread: Option<&str>,
        body: &str,
    ) -> Result<String, ClientError> {
        let mut payload = serde_json::json!({
            "channel": channel,
            "text": body,
        });
        if let Some(thread_ts) = thread {
            payload["thread_ts"] = serde_json::Value::String(thread_ts.to_string());
        }
        debug!(channel, "posting status message");
        let response = with_retry("chat.postMessage", || async {
            self.call("chat.postMessage", &payload).await
        })
        .await?;

        if !response.ok {
            return Err(ClientError::Protocol(format!(
                "chat.postMessage error: {}",
                response.error.unwrap_or_default()
            )));
        }
        response.ts.ok_or_else(|| {
            ClientError::Protocol("chat.postMessage response missing 'ts'".into())
        })
    }

    async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        body: &str,
    ) -> Result<(), ClientError> {
        let payload = serde_json::json!({
            "channel": channel,
            "ts": ts,
            "text": body,
        });
        debug!(channel, ts, "updating status message");
        let response = with_retry("chat.update", || async {
            self.call("chat.update", &payload).await
        })
        .await?;

        if !response.ok {
            let error = response.error.unwrap_or_default();
            // An identical rendering is not a failure.
            if error == "message_not_changed" {
                return Ok(());
            }
            warn!(error = %error, "chat.update rejected");
            return Err(ClientError::Protocol(format!("chat.update error: {error}")));
        }
        Ok(())
    }
}
