//! Slack Web API client
//!
//! Uses the secrecy crate to protect the bot token in memory. DMs resolve a
//! conversation id via conversations.open before posting. Failures are
//! classified for the dispatcher: network errors, 5xx and rate limits retry;
//! other API errors give up.

use async_trait::async_trait;
use cadence_core::{ChannelSender, DeliveryReceipt, DeliveryTarget, Error, MessageModel, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::render::render_blocks;

/// Hard timeout for Slack calls.
const SLACK_TIMEOUT_SECS: u64 = 10;

/// Slack Web API client
#[derive(Clone)]
pub struct SlackClient {
    bot_token: SecretString,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenConversationResponse {
    ok: bool,
    #[serde(default)]
    channel: Option<ConversationRef>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConversationRef {
    id: String,
}

impl SlackClient {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self::with_base_url(bot_token, "https://slack.com/api")
    }

    /// Point the client at a different API root (tests).
    pub fn with_base_url(bot_token: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SLACK_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            bot_token: SecretString::new(bot_token.into()),
            base_url: base_url.into(),
            client,
        }
    }

    /// Resolve a DM channel id for a user.
    pub async fn open_dm(&self, slack_user_id: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/conversations.open", self.base_url))
            .bearer_auth(self.bot_token.expose_secret())
            .json(&serde_json::json!({ "users": slack_user_id }))
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(http_error(status));
        }

        let body: OpenConversationResponse = response.json().await.map_err(network_error)?;
        if !body.ok {
            return Err(api_error(body.error.as_deref().unwrap_or("unknown")));
        }
        body.channel
            .map(|c| c.id)
            .ok_or_else(|| api_error("missing_channel"))
    }

    /// Post a rendered message.
    pub async fn post_message(
        &self,
        channel: &str,
        text: &str,
        blocks: &[crate::blocks::SlackBlock],
    ) -> Result<DeliveryReceipt> {
        let response = self
            .client
            .post(format!("{}/chat.postMessage", self.base_url))
            .bearer_auth(self.bot_token.expose_secret())
            .json(&serde_json::json!({
                "channel": channel,
                "text": text,
                "blocks": blocks,
            }))
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(http_error(status));
        }

        let body: PostMessageResponse = response.json().await.map_err(network_error)?;
        if !body.ok {
            let error = body.error.as_deref().unwrap_or("unknown");
            warn!(channel = %channel, error = %error, "chat.postMessage rejected");
            return Err(api_error(error));
        }

        debug!(channel = %channel, ts = ?body.ts, "Message posted");
        Ok(DeliveryReceipt {
            ts: body.ts.unwrap_or_default(),
            channel_id: body.channel.unwrap_or_else(|| channel.to_string()),
        })
    }
}

fn network_error(e: reqwest::Error) -> Error {
    Error::Delivery {
        message: format!("slack network error: {}", e),
        retryable: true,
    }
}

fn http_error(status: reqwest::StatusCode) -> Error {
    // 429 and 5xx are transient; other 4xx are permanent
    let retryable = status.as_u16() == 429 || status.is_server_error();
    Error::Delivery {
        message: format!("slack http {}", status.as_u16()),
        retryable,
    }
}

fn api_error(error: &str) -> Error {
    Error::Delivery {
        message: format!("slack api error: {}", error),
        retryable: error == "ratelimited",
    }
}

#[async_trait]
impl ChannelSender for SlackClient {
    async fn deliver(&self, target: &DeliveryTarget, model: &MessageModel) -> Result<DeliveryReceipt> {
        let channel = match target {
            DeliveryTarget::Channel { channel_id } => channel_id.clone(),
            DeliveryTarget::Dm { slack_user_id } => self.open_dm(slack_user_id).await?,
        };
        let blocks = render_blocks(model);
        self.post_message(&channel, &model.plain_text(), &blocks).await
    }
}
