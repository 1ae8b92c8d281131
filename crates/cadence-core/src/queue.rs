//! Queued notification and transcript queue types
//!
//! Rows here are leased, not popped: a lease makes the row invisible to other
//! workers for its duration and bumps the attempt counter, so retry handling
//! needs no extra bookkeeping. Terminal statuses are frozen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::feature::{Feature, Priority};
use crate::{Error, Result};

/// Status of a queued notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Scheduled,
    Sent,
    Failed,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        !self.is_terminal() || *self == next
    }
}

impl FromStr for NotificationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "scheduled" => Ok(Self::Scheduled),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(Error::Other(format!("Invalid notification status: {}", s))),
        }
    }
}

/// A notification waiting for its send time or a retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedNotification {
    pub id: String,
    pub user_id: String,
    pub org_id: String,
    pub feature: Feature,
    pub priority: Priority,
    pub channel: String,
    pub payload: serde_json::Value,
    pub scheduled_for: DateTime<Utc>,
    pub status: NotificationStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub leased_until: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueuedNotification {
    pub fn new(
        user_id: impl Into<String>,
        org_id: impl Into<String>,
        feature: Feature,
        priority: Priority,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            org_id: org_id.into(),
            feature,
            priority,
            channel: "slack".to_string(),
            payload: serde_json::json!({}),
            scheduled_for,
            status: NotificationStatus::Pending,
            attempts: 0,
            max_attempts: 5,
            leased_until: None,
            last_attempt_at: None,
            last_error: None,
            dedupe_key: None,
            created_at: now,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn scheduled(mut self) -> Self {
        self.status = NotificationStatus::Scheduled;
        self
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// A pending transcript fetch for one call. Deleted on success, carried
/// forward with an incremented attempt count on transient failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptQueueItem {
    pub call_id: String,
    pub org_id: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub priority: Priority,
    pub leased_until: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TranscriptQueueItem {
    pub fn new(call_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            org_id: org_id.into(),
            attempts: 0,
            max_attempts: 10,
            priority: Priority::Normal,
            leased_until: None,
            last_attempt_at: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Attempts are counted at lease time, so a freshly leased item carrying
    /// more than `max_attempts` has already burned its full budget.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts > self.max_attempts
    }
}
