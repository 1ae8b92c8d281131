//! Engagement metric computer
//!
//! Pure, deterministic functions over a user's activity and notification
//! interaction history. No I/O happens here; callers load the inputs, this
//! module derives integer scores in [0, 100], a segment, activity patterns
//! and a fatigue level. Missing data always yields conservative scores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::config::EngagementConfig;
use crate::{Error, Result};

/// Engagement segment. Ordering of the variants mirrors declining engagement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    PowerUser,
    Regular,
    Casual,
    AtRisk,
    Dormant,
    Churned,
}

impl Segment {
    pub const ALL: [Segment; 6] = [
        Segment::PowerUser,
        Segment::Regular,
        Segment::Casual,
        Segment::AtRisk,
        Segment::Dormant,
        Segment::Churned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PowerUser => "power_user",
            Self::Regular => "regular",
            Self::Casual => "casual",
            Self::AtRisk => "at_risk",
            Self::Dormant => "dormant",
            Self::Churned => "churned",
        }
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Segment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "power_user" => Ok(Self::PowerUser),
            "regular" => Ok(Self::Regular),
            "casual" => Ok(Self::Casual),
            "at_risk" => Ok(Self::AtRisk),
            "dormant" => Ok(Self::Dormant),
            "churned" => Ok(Self::Churned),
            _ => Err(Error::Other(format!("Unknown segment: {}", s))),
        }
    }
}

/// Fatigue level derived from the fatigue score via configured boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatigueLevel {
    Low,
    Moderate,
    High,
    Critical,
}

impl FatigueLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// How often a user wants to hear from us. Stored preference, not derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredFrequency {
    High,
    Moderate,
    Low,
}

impl PreferredFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Moderate => "moderate",
            Self::Low => "low",
        }
    }
}

impl FromStr for PreferredFrequency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "high" => Ok(Self::High),
            "moderate" => Ok(Self::Moderate),
            "low" => Ok(Self::Low),
            _ => Err(Error::Other(format!("Unknown frequency: {}", s))),
        }
    }
}

/// Where an activity event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySource {
    App,
    Chat,
}

impl ActivitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Chat => "chat",
        }
    }
}

impl FromStr for ActivitySource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "app" => Ok(Self::App),
            "chat" => Ok(Self::Chat),
            _ => Err(Error::Other(format!("Unknown activity source: {}", s))),
        }
    }
}

/// Append-only activity event used to derive metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub user_id: String,
    pub source: ActivitySource,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub weekday: u8,
    pub hour: u8,
    pub session_id: Option<String>,
}

/// Append-only record of a delivered notification and what the user did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationInteraction {
    pub user_id: String,
    pub delivered_at: DateTime<Utc>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub dismissed_at: Option<DateTime<Utc>>,
    pub time_to_interaction_secs: Option<i64>,
    pub weekday: u8,
    pub hour: u8,
}

/// Learned per-weekday active hours plus the global peak hour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityPatterns {
    /// weekday 0..6 -> up to five hours, most active first.
    #[serde(default)]
    pub typical_active_hours: HashMap<u8, Vec<u8>>,
    pub peak_hour: Option<u8>,
}

impl ActivityPatterns {
    /// 1-based rank of `hour` within the weekday's typical list.
    pub fn hour_rank(&self, weekday: u8, hour: u8) -> Option<usize> {
        self.typical_active_hours
            .get(&weekday)
            .and_then(|hours| hours.iter().position(|&h| h == hour))
            .map(|idx| idx + 1)
    }
}

/// The engine-owned per-user metrics row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMetrics {
    pub user_id: String,
    pub org_id: String,
    pub app_score: i64,
    pub chat_score: i64,
    pub notif_score: i64,
    pub overall_score: i64,
    pub segment: Segment,
    pub fatigue: i64,
    pub preferred_frequency: PreferredFrequency,
    pub patterns: ActivityPatterns,
    pub avg_daily_sessions: f64,
    pub notifications_since_feedback: i64,
    pub last_feedback_requested_at: Option<DateTime<Utc>>,
    pub reengagement_attempts: i64,
    pub last_reengagement_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl UserMetrics {
    /// A fresh row for a user with no history: neutral notification score,
    /// casual segment, no fatigue.
    pub fn bootstrap(user_id: impl Into<String>, org_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            org_id: org_id.into(),
            app_score: 0,
            chat_score: 0,
            notif_score: 50,
            overall_score: 0,
            segment: Segment::Casual,
            fatigue: 0,
            preferred_frequency: PreferredFrequency::Moderate,
            patterns: ActivityPatterns::default(),
            avg_daily_sessions: 0.0,
            notifications_since_feedback: 0,
            last_feedback_requested_at: None,
            reengagement_attempts: 0,
            last_reengagement_at: None,
            updated_at: now,
        }
    }

    pub fn fatigue_level(&self, config: &EngagementConfig) -> FatigueLevel {
        config.fatigue.level_for(self.fatigue)
    }
}

/// Output of a full metric recomputation.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedScores {
    pub app: i64,
    pub chat: i64,
    pub notification: i64,
    pub overall: i64,
}

fn clamp_score(value: f64) -> i64 {
    (value.round() as i64).clamp(0, 100)
}

fn days_between(earlier: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - earlier).num_seconds().max(0) as f64 / 86_400.0
}

fn decay_score(last_active: Option<DateTime<Utc>>, now: DateTime<Utc>, ladder: [i64; 4]) -> i64 {
    match last_active {
        None => ladder[3],
        Some(at) => {
            let days = days_between(at, now);
            if days < 1.0 {
                ladder[0]
            } else if days < 3.0 {
                ladder[1]
            } else if days < 7.0 {
                ladder[2]
            } else {
                ladder[3]
            }
        }
    }
}

/// App engagement score over the recent activity window (7 days of events).
pub fn app_score(
    events: &[ActivityEvent],
    last_app_active_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> i64 {
    let app_events: Vec<&ActivityEvent> = events
        .iter()
        .filter(|e| e.source == ActivitySource::App)
        .collect();

    if app_events.is_empty() {
        return decay_score(last_app_active_at, now, [60, 40, 20, 10]);
    }

    let days_with_activity = distinct_days(&app_events);
    let total_events = app_events.len() as f64;
    let unique_sessions = app_events
        .iter()
        .filter_map(|e| e.session_id.as_deref())
        .collect::<std::collections::HashSet<_>>()
        .len() as f64;

    let frequency = (days_with_activity / 7.0).min(1.0) * 40.0;
    let intensity = (total_events / 50.0).min(1.0) * 30.0;
    let sessions = (unique_sessions / 10.0).min(1.0) * 30.0;
    clamp_score(frequency + intensity + sessions)
}

/// Chat engagement score over the recent activity window.
pub fn chat_score(
    events: &[ActivityEvent],
    last_chat_active_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> i64 {
    let chat_events: Vec<&ActivityEvent> = events
        .iter()
        .filter(|e| e.source == ActivitySource::Chat)
        .collect();

    if chat_events.is_empty() {
        return decay_score(last_chat_active_at, now, [50, 30, 15, 10]);
    }

    let days_with_activity = distinct_days(&chat_events);
    let total_events = chat_events.len() as f64;

    let frequency = (days_with_activity / 7.0).min(1.0) * 50.0;
    let intensity = (total_events / 20.0).min(1.0) * 50.0;
    clamp_score(frequency + intensity)
}

/// Notification engagement score. Neutral 50 without history.
pub fn notification_score(interactions: &[NotificationInteraction]) -> i64 {
    if interactions.is_empty() {
        return 50;
    }

    let total = interactions.len() as f64;
    let clicks = interactions.iter().filter(|i| i.clicked_at.is_some()).count() as f64;
    let dismissals = interactions.iter().filter(|i| i.dismissed_at.is_some()).count() as f64;

    let ctr_score = (clicks / total) * 60.0;

    let response_times: Vec<i64> = interactions
        .iter()
        .filter(|i| i.clicked_at.is_some())
        .filter_map(|i| i.time_to_interaction_secs)
        .collect();
    let response_time_score = if response_times.is_empty() {
        0.0
    } else {
        let avg_secs = response_times.iter().sum::<i64>() as f64 / response_times.len() as f64;
        (25.0 - (avg_secs / 3600.0) * 25.0).max(0.0)
    };

    let dismissal_penalty = (dismissals / total) * 15.0;

    clamp_score(ctr_score + response_time_score - dismissal_penalty + 15.0)
}

/// Weighted overall score.
pub fn overall_score(app: i64, chat: i64, notification: i64, config: &EngagementConfig) -> i64 {
    let weights = &config.weights;
    clamp_score(
        app as f64 * weights.app + chat as f64 * weights.chat + notification as f64 * weights.notification,
    )
}

/// Segment assignment: ordered checks, first match wins.
pub fn assign_segment(
    overall: i64,
    days_since_active: f64,
    sessions_per_day: f64,
    config: &EngagementConfig,
) -> Segment {
    let s = &config.segments;
    if days_since_active >= s.churned_days as f64 {
        Segment::Churned
    } else if days_since_active >= s.dormant_days as f64 {
        Segment::Dormant
    } else if days_since_active >= s.at_risk_days as f64 || overall < s.at_risk_max_score {
        Segment::AtRisk
    } else if overall >= s.power_min_score && sessions_per_day >= s.power_min_sessions {
        Segment::PowerUser
    } else if overall >= s.regular_min_score {
        Segment::Regular
    } else if overall >= s.casual_min_score {
        Segment::Casual
    } else {
        Segment::AtRisk
    }
}

/// Bucket events by weekday and hour; top five hours per weekday by count,
/// global mode as the peak hour. Count ties break toward the earlier hour.
pub fn activity_patterns(events: &[ActivityEvent]) -> ActivityPatterns {
    let mut per_weekday: HashMap<u8, HashMap<u8, usize>> = HashMap::new();
    let mut global: HashMap<u8, usize> = HashMap::new();

    for event in events {
        *per_weekday
            .entry(event.weekday)
            .or_default()
            .entry(event.hour)
            .or_insert(0) += 1;
        *global.entry(event.hour).or_insert(0) += 1;
    }

    let peak_hour = global
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(&hour, _)| hour);

    let typical_active_hours = per_weekday
        .into_iter()
        .map(|(weekday, counts)| {
            let mut hours: Vec<(u8, usize)> = counts.into_iter().collect();
            hours.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            hours.truncate(5);
            (weekday, hours.into_iter().map(|(h, _)| h).collect())
        })
        .collect();

    ActivityPatterns {
        typical_active_hours,
        peak_hour,
    }
}

/// Fatigue over the most recent 20 interactions: half weight on dismissals,
/// half on ignores (delivered, never clicked). A dismissed notification also
/// counts as ignored, so an all-dismissed history saturates at 100.
pub fn fatigue_score(interactions: &[NotificationInteraction]) -> i64 {
    if interactions.is_empty() {
        return 0;
    }

    let mut recent: Vec<&NotificationInteraction> = interactions.iter().collect();
    recent.sort_by(|a, b| b.delivered_at.cmp(&a.delivered_at));
    recent.truncate(20);

    let total = recent.len() as f64;
    let dismissals = recent.iter().filter(|i| i.dismissed_at.is_some()).count() as f64;
    let ignores = recent.iter().filter(|i| i.clicked_at.is_none()).count() as f64;

    clamp_score((dismissals / total) * 50.0 + (ignores / total) * 50.0)
}

/// Whether a feedback prompt is due: 10 notifications before the first ask,
/// 14 days between asks afterwards.
pub fn should_request_feedback(metrics: &UserMetrics, now: DateTime<Utc>, config: &EngagementConfig) -> bool {
    match metrics.last_feedback_requested_at {
        None => metrics.notifications_since_feedback >= config.min_notifications_before_feedback,
        Some(at) => days_between(at, now) >= config.feedback_interval_days as f64,
    }
}

/// Full recomputation: scores, segment and patterns in one pass.
pub fn compute_scores(
    events: &[ActivityEvent],
    interactions: &[NotificationInteraction],
    last_app_active_at: Option<DateTime<Utc>>,
    last_chat_active_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &EngagementConfig,
) -> ComputedScores {
    let app = app_score(events, last_app_active_at, now);
    let chat = chat_score(events, last_chat_active_at, now);
    let notification = notification_score(interactions);
    let overall = overall_score(app, chat, notification, config);
    ComputedScores {
        app,
        chat,
        notification,
        overall,
    }
}

fn distinct_days(events: &[&ActivityEvent]) -> f64 {
    events
        .iter()
        .map(|e| e.occurred_at.date_naive())
        .collect::<std::collections::HashSet<_>>()
        .len() as f64
}
