//! Delivery and insight seams
//!
//! The engine talks to the chat workspace and the insight model through these
//! traits; concrete clients live in their own crates so the core stays free
//! of HTTP details and tests can substitute stubs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::message::MessageModel;
use crate::Result;

/// Where a message should land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryTarget {
    Dm { slack_user_id: String },
    Channel { channel_id: String },
}

/// Proof of delivery from the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub ts: String,
    pub channel_id: String,
}

/// A channel that can deliver a rendered message. Implementations classify
/// upstream failures as retryable (network, 5xx, rate limit) or permanent via
/// [`crate::Error::Delivery`].
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn deliver(&self, target: &DeliveryTarget, model: &MessageModel) -> Result<DeliveryReceipt>;
}

/// What kind of insight to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    MeetingPrep,
    Debrief,
    DealNudge,
    Digest,
}

/// Request for the opaque insight provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightRequest {
    pub kind: InsightKind,
    pub context: serde_json::Value,
}

/// Structured insight. Providers must always return something usable; parse
/// failures fall back to a deterministic heuristic inside the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub summary: String,
    pub bullets: Vec<String>,
    pub suggested_action: Option<String>,
}

/// Generates message content from CRM context. The engine never builds
/// prompts itself; that is the provider's concern.
#[async_trait]
pub trait InsightProvider: Send + Sync {
    async fn generate(&self, request: InsightRequest) -> Result<Insight>;
}
