//! Notification features and delivery priorities
//!
//! A [`Feature`] is a named class of notification with its own settings,
//! trigger and dedupe behavior. Keeping it a closed enum means every feature
//! gets exhaustively handled at compile time; adding one is a data change in
//! this module plus a trigger evaluator.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::{Error, Result};

/// The closed set of notification features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    DailyDigest,
    MorningBrief,
    MeetingPrep,
    DealMomentum,
    MeetingDebrief,
    Reengagement,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::DailyDigest,
        Feature::MorningBrief,
        Feature::MeetingPrep,
        Feature::DealMomentum,
        Feature::MeetingDebrief,
        Feature::Reengagement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DailyDigest => "daily_digest",
            Self::MorningBrief => "morning_brief",
            Self::MeetingPrep => "meeting_prep",
            Self::DealMomentum => "deal_momentum",
            Self::MeetingDebrief => "meeting_debrief",
            Self::Reengagement => "reengagement",
        }
    }

    /// Feature-level dedupe window override. `None` means the window is
    /// derived from cooldown x fatigue x segment at dispatch time.
    pub fn dedupe_window_override(&self) -> Option<DedupeWindow> {
        match self {
            Self::DailyDigest | Self::MorningBrief => {
                Some(DedupeWindow::Duration(Duration::hours(20)))
            }
            // One prep message per meeting, ever.
            Self::MeetingPrep => Some(DedupeWindow::Indefinite),
            _ => None,
        }
    }

    /// Whether the feature fans out per organization rather than per user.
    pub fn is_org_scoped(&self) -> bool {
        matches!(self, Self::DailyDigest)
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "daily_digest" => Ok(Self::DailyDigest),
            "morning_brief" => Ok(Self::MorningBrief),
            "meeting_prep" => Ok(Self::MeetingPrep),
            "deal_momentum" => Ok(Self::DealMomentum),
            "meeting_debrief" => Ok(Self::MeetingDebrief),
            "reengagement" => Ok(Self::Reengagement),
            _ => Err(Error::Other(format!("Unknown feature: {}", s))),
        }
    }
}

/// Dedupe window for a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeWindow {
    Duration(Duration),
    /// At most one send per (feature, org, recipient, entity), ever.
    Indefinite,
}

impl DedupeWindow {
    /// Bucket index for the unique sent-log constraint. Times inside the same
    /// bucket collide on insert; an indefinite window collapses to one bucket.
    pub fn bucket(&self, at: DateTime<Utc>) -> i64 {
        match self {
            Self::Indefinite => 0,
            Self::Duration(window) => {
                let secs = window.num_seconds().max(1);
                at.timestamp().div_euclid(secs)
            }
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Duration(d) => Some(*d),
            Self::Indefinite => None,
        }
    }
}

/// Delivery priority. `Urgent` alone bypasses cooldown and quiet hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Additive boost applied by the optimal-time scorer.
    pub fn time_boost(&self) -> f64 {
        match self {
            Self::Urgent => 30.0,
            Self::High => 15.0,
            Self::Normal => 0.0,
            Self::Low => -10.0,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "urgent" => Ok(Self::Urgent),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(Error::Other(format!("Unknown priority: {}", s))),
        }
    }
}

/// How a feature's messages reach the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    Dm,
    Channel,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dm => "dm",
            Self::Channel => "channel",
        }
    }
}

impl FromStr for DeliveryMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dm" => Ok(Self::Dm),
            "channel" => Ok(Self::Channel),
            _ => Err(Error::Other(format!("Unknown delivery method: {}", s))),
        }
    }
}

/// Per-(org, feature) settings row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSettings {
    pub org_id: String,
    pub feature: Feature,
    pub enabled: bool,
    pub channel_id: Option<String>,
    pub delivery_method: DeliveryMethod,
    pub schedule_timezone: String,
    pub thresholds: serde_json::Map<String, serde_json::Value>,
    /// `None` means every category is enabled.
    pub enabled_categories: Option<Vec<String>>,
}

impl FeatureSettings {
    pub fn new(org_id: impl Into<String>, feature: Feature) -> Self {
        Self {
            org_id: org_id.into(),
            feature,
            enabled: true,
            channel_id: None,
            delivery_method: DeliveryMethod::Dm,
            schedule_timezone: "UTC".to_string(),
            thresholds: serde_json::Map::new(),
            enabled_categories: None,
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self.delivery_method = DeliveryMethod::Channel;
        self
    }

    pub fn category_enabled(&self, category: &str) -> bool {
        match &self.enabled_categories {
            None => true,
            Some(set) => set.iter().any(|c| c == category),
        }
    }
}

/// Chat mapping for a user within an org. No mapping means skip, not error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub org_id: String,
    pub user_id: String,
    pub slack_user_id: Option<String>,
    pub email: String,
    pub name: String,
}

/// A delivery already made, keyed for dedupe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentRecord {
    pub feature: Feature,
    pub org_id: String,
    pub recipient_id: String,
    pub entity_id: String,
    pub window_bucket: i64,
    pub sent_at: DateTime<Utc>,
    pub slack_ts: String,
    pub channel_id: String,
}

/// Stable dedupe key over the dispatch identity. `entity_id` may be empty for
/// cohort-wide sends (a digest whose entity is the org itself).
pub fn dedupe_key(feature: Feature, org_id: &str, slack_user_id: &str, entity_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(feature.as_str().as_bytes());
    hasher.update(org_id.as_bytes());
    hasher.update(slack_user_id.as_bytes());
    hasher.update(entity_id.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_feature_round_trip() {
        for feature in Feature::ALL {
            assert_eq!(Feature::from_str(feature.as_str()).unwrap(), feature);
        }
        assert!(Feature::from_str("nope").is_err());
    }

    #[test]
    fn test_priority_round_trip() {
        for p in [Priority::Urgent, Priority::High, Priority::Normal, Priority::Low] {
            assert_eq!(Priority::from_str(p.as_str()).unwrap(), p);
        }
    }

    #[test]
    fn test_dedupe_window_overrides() {
        assert_eq!(
            Feature::DailyDigest.dedupe_window_override(),
            Some(DedupeWindow::Duration(Duration::hours(20)))
        );
        assert_eq!(
            Feature::MeetingPrep.dedupe_window_override(),
            Some(DedupeWindow::Indefinite)
        );
        assert_eq!(Feature::DealMomentum.dedupe_window_override(), None);
    }

    #[test]
    fn test_window_bucket_changes_across_boundary() {
        let window = DedupeWindow::Duration(Duration::hours(20));
        let a = Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap();
        let b = a + Duration::minutes(5);
        let c = a + Duration::hours(21);
        assert_eq!(window.bucket(a), window.bucket(b));
        assert_ne!(window.bucket(a), window.bucket(c));
    }

    #[test]
    fn test_indefinite_window_has_single_bucket() {
        let a = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(DedupeWindow::Indefinite.bucket(a), DedupeWindow::Indefinite.bucket(b));
    }

    #[test]
    fn test_dedupe_key_is_stable_and_distinct() {
        let a = dedupe_key(Feature::DailyDigest, "org1", "U1", "");
        let b = dedupe_key(Feature::DailyDigest, "org1", "U1", "");
        let c = dedupe_key(Feature::DailyDigest, "org1", "U2", "");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_category_filtering() {
        let mut settings = FeatureSettings::new("org1", Feature::DealMomentum);
        assert!(settings.category_enabled("risk"));
        settings.enabled_categories = Some(vec!["risk".to_string()]);
        assert!(settings.category_enabled("risk"));
        assert!(!settings.category_enabled("health"));
    }
}
