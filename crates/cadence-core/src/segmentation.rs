//! Segment transitions and re-engagement selection
//!
//! Segments move along a fixed edge set; anything else is treated as data
//! corruption and rejected, keeping the previous segment. Re-engagement
//! candidacy, trigger selection, priority scoring and channel choice for the
//! inactive segments live here too.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngagementConfig;
use crate::metrics::{Segment, UserMetrics};

/// Whether a segment write from `from` to `to` is legal.
pub fn can_transition(from: Segment, to: Segment) -> bool {
    use Segment::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (PowerUser, Regular)
            | (PowerUser, AtRisk)
            | (Regular, PowerUser)
            | (Regular, Casual)
            | (Regular, AtRisk)
            | (Casual, Regular)
            | (Casual, AtRisk)
            | (Casual, Dormant)
            | (AtRisk, Casual)
            | (AtRisk, Regular)
            | (AtRisk, Dormant)
            | (Dormant, AtRisk)
            | (Dormant, Casual)
            | (Dormant, Churned)
            | (Churned, Dormant)
    )
}

/// Content-driven re-engagement hooks, in selection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentTrigger {
    UpcomingMeeting,
    DealUpdate,
    ChampionChange,
    NewEmailSummary,
}

impl ContentTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpcomingMeeting => "upcoming_meeting",
            Self::DealUpdate => "deal_update",
            Self::ChampionChange => "champion_change",
            Self::NewEmailSummary => "new_email_summary",
        }
    }
}

/// What a re-engagement send will be about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReengagementTopic {
    Content(ContentTrigger),
    SegmentDefault(String),
}

/// Delivery channel for re-engagement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReengagementChannel {
    Email,
    Chat,
}

/// Eligibility: inactive segment, attempts under the cap, cooled down since
/// the last attempt, and inactive for at least the segment's trigger days.
pub fn is_reengagement_candidate(
    metrics: &UserMetrics,
    days_inactive: f64,
    now: DateTime<Utc>,
    config: &EngagementConfig,
) -> bool {
    let trigger = match config.reengagement_trigger(metrics.segment) {
        Some(t) => t,
        None => return false,
    };

    if metrics.reengagement_attempts >= trigger.max_attempts {
        return false;
    }

    if let Some(last) = metrics.last_reengagement_at {
        let days_since_attempt = (now - last).num_seconds() as f64 / 86_400.0;
        if days_since_attempt < trigger.cooldown_days as f64 {
            return false;
        }
    }

    days_inactive >= trigger.after_days as f64
}

/// Pick the first available content trigger, else the segment default.
pub fn select_topic(
    available: &[ContentTrigger],
    segment: Segment,
    config: &EngagementConfig,
) -> ReengagementTopic {
    const ORDER: [ContentTrigger; 4] = [
        ContentTrigger::UpcomingMeeting,
        ContentTrigger::DealUpdate,
        ContentTrigger::ChampionChange,
        ContentTrigger::NewEmailSummary,
    ];
    for trigger in ORDER {
        if available.contains(&trigger) {
            return ReengagementTopic::Content(trigger);
        }
    }
    let default = config
        .reengagement_trigger(segment)
        .and_then(|t| t.notification_types.first().cloned())
        .unwrap_or_else(|| "activity_summary".to_string());
    ReengagementTopic::SegmentDefault(default)
}

/// Priority score in [0, 100] for ordering re-engagement sends.
pub fn priority_score(
    previous_overall: i64,
    attempts: i64,
    content_driven: bool,
    days_inactive: f64,
) -> i64 {
    let mut score = 50.0;
    if previous_overall > 70 {
        score += 15.0;
    } else if previous_overall > 50 {
        score += 10.0;
    }
    score -= 10.0 * attempts as f64;
    if content_driven {
        score += 20.0;
    }
    if days_inactive < 7.0 {
        score += 5.0;
    } else if days_inactive > 30.0 {
        score -= 10.0;
    } else if days_inactive >= 14.0 {
        score -= 5.0;
    }
    (score.round() as i64).clamp(0, 100)
}

/// Channel choice: deeply inactive users get email, at-risk users with a chat
/// mapping get chat, everyone else email.
pub fn select_channel(segment: Segment, has_chat_mapping: bool) -> ReengagementChannel {
    match segment {
        Segment::Churned | Segment::Dormant => ReengagementChannel::Email,
        Segment::AtRisk if has_chat_mapping => ReengagementChannel::Chat,
        _ => ReengagementChannel::Email,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 3, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_legal_transitions() {
        use Segment::*;
        assert!(can_transition(PowerUser, Regular));
        assert!(can_transition(Regular, PowerUser));
        assert!(can_transition(Casual, Dormant));
        assert!(can_transition(Dormant, Churned));
        assert!(can_transition(Churned, Dormant));
        assert!(can_transition(AtRisk, Regular));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        use Segment::*;
        // Anything outside the edge set is illegal
        assert!(!can_transition(PowerUser, Churned));
        assert!(!can_transition(PowerUser, Dormant));
        assert!(!can_transition(Churned, PowerUser));
        assert!(!can_transition(Churned, Regular));
        assert!(!can_transition(Dormant, PowerUser));
        assert!(!can_transition(Casual, PowerUser));
    }

    #[test]
    fn test_self_transition_is_legal() {
        for segment in Segment::ALL {
            assert!(can_transition(segment, segment));
        }
    }

    #[test]
    fn test_exhaustive_transition_matrix() {
        use Segment::*;
        let legal: &[(Segment, Segment)] = &[
            (PowerUser, Regular),
            (PowerUser, AtRisk),
            (Regular, PowerUser),
            (Regular, Casual),
            (Regular, AtRisk),
            (Casual, Regular),
            (Casual, AtRisk),
            (Casual, Dormant),
            (AtRisk, Casual),
            (AtRisk, Regular),
            (AtRisk, Dormant),
            (Dormant, AtRisk),
            (Dormant, Casual),
            (Dormant, Churned),
            (Churned, Dormant),
        ];
        for from in Segment::ALL {
            for to in Segment::ALL {
                let expected = from == to || legal.contains(&(from, to));
                assert_eq!(can_transition(from, to), expected, "{:?} -> {:?}", from, to);
            }
        }
    }

    fn inactive_metrics(segment: Segment, attempts: i64) -> UserMetrics {
        let mut m = UserMetrics::bootstrap("u1", "org1", now());
        m.segment = segment;
        m.reengagement_attempts = attempts;
        m
    }

    #[test]
    fn test_candidacy_requires_inactive_segment() {
        let config = EngagementConfig::default();
        let m = inactive_metrics(Segment::Regular, 0);
        assert!(!is_reengagement_candidate(&m, 10.0, now(), &config));
    }

    #[test]
    fn test_candidacy_trigger_days_per_segment() {
        let config = EngagementConfig::default();
        assert!(!is_reengagement_candidate(
            &inactive_metrics(Segment::AtRisk, 0),
            4.9,
            now(),
            &config
        ));
        assert!(is_reengagement_candidate(
            &inactive_metrics(Segment::AtRisk, 0),
            5.0,
            now(),
            &config
        ));
        // Dormant fires after only 3 days, by design
        assert!(is_reengagement_candidate(
            &inactive_metrics(Segment::Dormant, 0),
            3.0,
            now(),
            &config
        ));
        assert!(!is_reengagement_candidate(
            &inactive_metrics(Segment::Churned, 0),
            13.0,
            now(),
            &config
        ));
        assert!(is_reengagement_candidate(
            &inactive_metrics(Segment::Churned, 0),
            14.0,
            now(),
            &config
        ));
    }

    #[test]
    fn test_candidacy_attempt_cap() {
        let config = EngagementConfig::default();
        assert!(!is_reengagement_candidate(
            &inactive_metrics(Segment::AtRisk, 3),
            10.0,
            now(),
            &config
        ));
    }

    #[test]
    fn test_candidacy_cooldown_between_attempts() {
        let config = EngagementConfig::default();
        let mut m = inactive_metrics(Segment::AtRisk, 1);
        m.last_reengagement_at = Some(now() - Duration::days(2));
        assert!(!is_reengagement_candidate(&m, 10.0, now(), &config));
        m.last_reengagement_at = Some(now() - Duration::days(4));
        assert!(is_reengagement_candidate(&m, 10.0, now(), &config));
    }

    #[test]
    fn test_topic_selection_order() {
        let config = EngagementConfig::default();
        let topic = select_topic(
            &[ContentTrigger::NewEmailSummary, ContentTrigger::DealUpdate],
            Segment::AtRisk,
            &config,
        );
        assert_eq!(topic, ReengagementTopic::Content(ContentTrigger::DealUpdate));

        let topic = select_topic(&[], Segment::Churned, &config);
        assert_eq!(topic, ReengagementTopic::SegmentDefault("win_back".to_string()));
    }

    #[test]
    fn test_priority_score_terms() {
        assert_eq!(priority_score(80, 0, false, 10.0), 65);
        assert_eq!(priority_score(60, 0, false, 10.0), 60);
        assert_eq!(priority_score(40, 0, false, 10.0), 50);
        assert_eq!(priority_score(40, 2, false, 10.0), 30);
        assert_eq!(priority_score(40, 0, true, 10.0), 70);
        assert_eq!(priority_score(40, 0, false, 3.0), 55);
        assert_eq!(priority_score(40, 0, false, 20.0), 45);
        assert_eq!(priority_score(40, 0, false, 31.0), 40);
        // Clamped at the edges
        assert_eq!(priority_score(0, 10, false, 40.0), 0);
        assert_eq!(priority_score(100, 0, true, 3.0), 90);
    }

    #[test]
    fn test_channel_selection() {
        assert_eq!(select_channel(Segment::Churned, true), ReengagementChannel::Email);
        assert_eq!(select_channel(Segment::Dormant, true), ReengagementChannel::Email);
        assert_eq!(select_channel(Segment::AtRisk, true), ReengagementChannel::Chat);
        assert_eq!(select_channel(Segment::AtRisk, false), ReengagementChannel::Email);
    }
}
