//! Read-mostly CRM views
//!
//! Users, calls, deals and meetings are shared with the CRM. The engine reads
//! them and appends engine-owned fields (transcript state, ingest metadata)
//! but never mutates business fields. Cross-references are ids only; resolve
//! on demand, no in-memory object graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{Error, Result};

/// A CRM user. Never destroyed, only deactivated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub org_id: String,
    pub timezone: String,
    pub last_app_active_at: Option<DateTime<Utc>>,
    pub last_chat_active_at: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<String>, email: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            org_id: org_id.into(),
            timezone: "UTC".to_string(),
            last_app_active_at: None,
            last_chat_active_at: None,
            last_login_at: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Most recent activity across all channels.
    pub fn last_active_at(&self) -> Option<DateTime<Utc>> {
        [self.last_app_active_at, self.last_chat_active_at, self.last_login_at]
            .into_iter()
            .flatten()
            .max()
    }

    /// First name guess for message copy: the email local part, capitalized.
    pub fn name_for_greeting(&self) -> String {
        let local = self.email.split('@').next().unwrap_or("there");
        let mut chars = local.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => "there".to_string(),
        }
    }

    pub fn days_inactive(&self, now: DateTime<Utc>) -> f64 {
        match self.last_active_at() {
            Some(at) => (now - at).num_seconds().max(0) as f64 / 86_400.0,
            None => (now - self.created_at).num_seconds().max(0) as f64 / 86_400.0,
        }
    }
}

/// Call direction as normalized from telephony payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
    Internal,
    Unknown,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for CallDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "inbound" | "incoming" => Ok(Self::Inbound),
            "outbound" | "outgoing" => Ok(Self::Outbound),
            "internal" => Ok(Self::Internal),
            _ => Ok(Self::Unknown),
        }
    }
}

/// Lifecycle of a call's transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptStatus {
    Missing,
    Queued,
    Ready,
    Failed,
}

impl TranscriptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Queued => "queued",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for TranscriptStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "missing" => Ok(Self::Missing),
            "queued" => Ok(Self::Queued),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            _ => Err(Error::Other(format!("Unknown transcript status: {}", s))),
        }
    }
}

/// A call row, upserted from telephony webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub org_id: String,
    pub provider: String,
    pub external_id: String,
    pub direction: CallDirection,
    pub status: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub owner_user_id: Option<String>,
    pub owner_email: Option<String>,
    pub recording_url: Option<String>,
    pub transcript_text: Option<String>,
    pub transcript_json: Option<String>,
    pub transcript_status: TranscriptStatus,
    pub meeting_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn has_recording(&self) -> bool {
        self.recording_url.as_deref().map(|u| !u.is_empty()).unwrap_or(false)
    }
}

/// Deal health as assessed by the CRM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealHealth {
    Healthy,
    Warning,
    Critical,
    Stalled,
}

impl DealHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Stalled => "stalled",
        }
    }
}

impl FromStr for DealHealth {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            "stalled" => Ok(Self::Stalled),
            _ => Err(Error::Other(format!("Unknown deal health: {}", s))),
        }
    }
}

/// Deal risk as assessed by the CRM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealRisk {
    Low,
    Medium,
    High,
    Critical,
}

impl DealRisk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for DealRisk {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(Error::Other(format!("Unknown deal risk: {}", s))),
        }
    }
}

/// A deal as the momentum job sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deal {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub company: String,
    pub owner_user_id: Option<String>,
    pub stage: String,
    pub health: DealHealth,
    pub risk: DealRisk,
    pub clarity: i64,
    pub amount: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    /// Momentum nudge trigger: struggling health, elevated risk, or a fuzzy
    /// next step.
    pub fn needs_momentum_nudge(&self) -> bool {
        matches!(self.health, DealHealth::Warning | DealHealth::Critical | DealHealth::Stalled)
            || matches!(self.risk, DealRisk::High | DealRisk::Critical)
            || self.clarity < 50
    }
}

/// A meeting as seen by prep/debrief jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub id: String,
    pub org_id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub deal_id: Option<String>,
    pub owner_user_id: Option<String>,
    pub attendees: Vec<String>,
    pub has_recording: bool,
    pub transcript_status: TranscriptStatus,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}
