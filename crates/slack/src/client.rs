//! Slack Web API client (`chat.postMessage` / `chat.update`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::blocks::{Block, OutgoingMessage, PostedMessage};
use crate::error::DeliveryError;
use crate::ChatClient;

/// Default Slack Web API base URL.
pub const DEFAULT_API_URL: &str = "https://slack.com/api";

/// Slack Web API client authenticated with a bot token.
pub struct SlackClient {
    api_url: String,
    token: String,
    client: reqwest::Client,
}

impl SlackClient {
    /// Create a client against the public Slack API.
    pub fn new(token: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        Self::with_api_url(DEFAULT_API_URL, token, timeout)
    }

    /// Create a client against a specific API base URL.
    pub fn with_api_url(api_url: &str, token: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
        })
    }

    async fn call<T: Serialize + Sync>(
        &self,
        method: &str,
        body: &T,
    ) -> Result<SlackResponse, DeliveryError> {
        let url = format!("{}/{method}", self.api_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return Err(DeliveryError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SlackResponse = response.json().await?;
        if !parsed.ok {
            return Err(DeliveryError::Api(
                parsed.error.unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }

        Ok(parsed)
    }
}

#[async_trait]
impl ChatClient for SlackClient {
    async fn post_message(&self, message: &OutgoingMessage) -> Result<PostedMessage, DeliveryError> {
        let payload = PostPayload {
            channel: &message.channel,
            attachments: vec![Attachment::from(message)],
            thread_ts: message.thread_ts.as_deref(),
            reply_broadcast: message.thread_ts.is_some() && message.broadcast,
        };

        debug!(
            channel = %message.channel,
            thread_ts = ?message.thread_ts,
            broadcast = payload.reply_broadcast,
            blocks = message.blocks.len(),
            "Posting Slack message"
        );

        let response = self.call("chat.postMessage", &payload).await?;

        Ok(PostedMessage {
            channel: response.channel.unwrap_or_else(|| message.channel.clone()),
            ts: response.ts.unwrap_or_default(),
        })
    }

    async fn update_message(
        &self,
        ts: &str,
        message: &OutgoingMessage,
    ) -> Result<PostedMessage, DeliveryError> {
        let payload = UpdatePayload {
            channel: &message.channel,
            ts,
            attachments: vec![Attachment::from(message)],
        };

        debug!(channel = %message.channel, ts, "Updating Slack message");

        let response = self.call("chat.update", &payload).await?;

        Ok(PostedMessage {
            channel: response.channel.unwrap_or_else(|| message.channel.clone()),
            ts: response.ts.unwrap_or_else(|| ts.to_string()),
        })
    }
}

/// Single colored attachment wrapping the message blocks.
#[derive(Debug, Serialize)]
struct Attachment<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<&'a str>,
    blocks: &'a [Block],
}

impl<'a> From<&'a OutgoingMessage> for Attachment<'a> {
    fn from(message: &'a OutgoingMessage) -> Self {
        Self {
            color: message.color.as_deref(),
            blocks: &message.blocks,
        }
    }
}

#[derive(Debug, Serialize)]
struct PostPayload<'a> {
    channel: &'a str,
    attachments: Vec<Attachment<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_ts: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    reply_broadcast: bool,
}

#[derive(Debug, Serialize)]
struct UpdatePayload<'a> {
    channel: &'a str,
    ts: &'a str,
    attachments: Vec<Attachment<'a>>,
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}
