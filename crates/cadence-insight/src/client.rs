//! Insight API client
//!
//! Uses the secrecy crate to protect the API key in memory. Responses are
//! expected to be JSON, possibly wrapped in ```json fences; anything
//! unparsable falls back to the deterministic heuristic so callers always
//! get an insight.

use async_trait::async_trait;
use cadence_core::{Error, Insight, InsightProvider, InsightRequest, Result};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::heuristic::fallback_insight;

/// Hard timeout for insight generation.
const INSIGHT_TIMEOUT_SECS: u64 = 60;

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// HTTP insight client
#[derive(Clone)]
pub struct InsightClient {
    api_key: SecretString,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

impl InsightClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, "https://api.anthropic.com/v1")
    }

    /// Point the client at a different API root (tests).
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(INSIGHT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            api_key: SecretString::new(api_key.into()),
            base_url: base_url.into(),
            model: DEFAULT_MODEL.to_string(),
            client,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    async fn complete(&self, request: &InsightRequest) -> Result<String> {
        let system = "You produce sales-notification insights. Respond with a single JSON object: \
                      {\"summary\": string, \"bullets\": [string], \"suggested_action\": string|null}.";
        let user = serde_json::json!({
            "kind": request.kind,
            "context": request.context,
        });

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&serde_json::json!({
                "model": self.model,
                "max_tokens": 1024,
                "system": system,
                "messages": [{ "role": "user", "content": user.to_string() }],
            }))
            .send()
            .await
            .map_err(|e| Error::Other(format!("insight request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Delivery {
                message: format!("insight http {}", status.as_u16()),
                retryable: status.as_u16() == 429 || status.is_server_error(),
            });
        }

        let body: MessageResponse = response
            .json()
            .await
            .map_err(|e| Error::Other(format!("insight response unreadable: {}", e)))?;
        let text = body
            .content
            .iter()
            .find_map(|block| match block {
                ContentBlock::Text { text } => Some(text.clone()),
                ContentBlock::Other => None,
            })
            .unwrap_or_default();
        Ok(text)
    }
}

/// Strip an optional ```json fence and parse the structured insight.
pub fn parse_insight(text: &str) -> Option<Insight> {
    let fence = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok()?;
    let candidate = fence
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or_else(|| text.trim());
    serde_json::from_str(candidate).ok()
}

#[async_trait]
impl InsightProvider for InsightClient {
    async fn generate(&self, request: InsightRequest) -> Result<Insight> {
        let text = self.complete(&request).await?;
        match parse_insight(&text) {
            Some(insight) => {
                debug!(kind = ?request.kind, "Insight parsed");
                Ok(insight)
            }
            None => {
                warn!(kind = ?request.kind, "Insight response unparsable, using heuristic");
                Ok(fallback_insight(&request))
            }
        }
    }
}
