//! Engagement tuning registry
//!
//! One immutable value holding every tunable constant: score weights, segment
//! boundaries, frequency limits, fatigue multipliers, priority overrides,
//! send-time windows and re-engagement triggers. Constructed once and passed
//! explicitly so tests can vary thresholds per case.

use serde::{Deserialize, Serialize};

use crate::feature::Priority;
use crate::metrics::{FatigueLevel, PreferredFrequency, Segment};

/// Relative weight of each channel in the overall score. Must sum to 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub app: f64,
    pub chat: f64,
    pub notification: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            app: 0.4,
            chat: 0.3,
            notification: 0.3,
        }
    }
}

/// Boundaries for the ordered segment-assignment rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentThresholds {
    pub churned_days: i64,
    pub dormant_days: i64,
    pub at_risk_days: i64,
    pub at_risk_max_score: i64,
    pub power_min_score: i64,
    pub power_min_sessions: f64,
    pub regular_min_score: i64,
    pub casual_min_score: i64,
}

impl Default for SegmentThresholds {
    fn default() -> Self {
        Self {
            churned_days: 30,
            dormant_days: 14,
            at_risk_days: 7,
            at_risk_max_score: 25,
            power_min_score: 80,
            power_min_sessions: 3.0,
            regular_min_score: 50,
            casual_min_score: 25,
        }
    }
}

/// Per-frequency delivery ceilings before fatigue scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyLimits {
    pub max_per_hour: u32,
    pub max_per_day: u32,
}

/// Fatigue boundaries and the cooldown multiplier ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FatigueConfig {
    pub moderate: i64,
    pub high: i64,
    pub critical: i64,
}

impl Default for FatigueConfig {
    fn default() -> Self {
        Self {
            moderate: 25,
            high: 50,
            critical: 75,
        }
    }
}

impl FatigueConfig {
    pub fn level_for(&self, fatigue: i64) -> FatigueLevel {
        if fatigue >= self.critical {
            FatigueLevel::Critical
        } else if fatigue >= self.high {
            FatigueLevel::High
        } else if fatigue >= self.moderate {
            FatigueLevel::Moderate
        } else {
            FatigueLevel::Low
        }
    }

    pub fn cooldown_multiplier(&self, level: FatigueLevel) -> f64 {
        match level {
            FatigueLevel::Low => 1.0,
            FatigueLevel::Moderate => 1.25,
            FatigueLevel::High => 1.75,
            FatigueLevel::Critical => 2.5,
        }
    }
}

/// Per-priority limit and cooldown behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityOverride {
    pub allow_exceed: bool,
    pub cooldown_minutes: i64,
}

/// Send-time window configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub business_start: u8,
    pub business_end: u8,
    pub weekend_factor: f64,
    pub lookahead_hours: i64,
    pub min_confidence: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            business_start: 9,
            business_end: 18,
            weekend_factor: 0.5,
            lookahead_hours: 24,
            min_confidence: 0.4,
        }
    }
}

/// Re-engagement trigger for one inactive segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReengagementTrigger {
    pub after_days: i64,
    pub max_attempts: i64,
    pub cooldown_days: i64,
    pub notification_types: Vec<String>,
}

/// The process-wide tuning registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementConfig {
    pub weights: ScoreWeights,
    pub segments: SegmentThresholds,
    pub fatigue: FatigueConfig,
    pub timing: TimingConfig,
    pub feedback_interval_days: i64,
    pub min_notifications_before_feedback: i64,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            segments: SegmentThresholds::default(),
            fatigue: FatigueConfig::default(),
            timing: TimingConfig::default(),
            feedback_interval_days: 14,
            min_notifications_before_feedback: 10,
        }
    }
}

impl EngagementConfig {
    /// Hour/day ceilings for a preferred frequency.
    pub fn notification_thresholds(&self, frequency: PreferredFrequency) -> FrequencyLimits {
        match frequency {
            PreferredFrequency::High => FrequencyLimits {
                max_per_hour: 4,
                max_per_day: 15,
            },
            PreferredFrequency::Moderate => FrequencyLimits {
                max_per_hour: 2,
                max_per_day: 8,
            },
            PreferredFrequency::Low => FrequencyLimits {
                max_per_hour: 1,
                max_per_day: 4,
            },
        }
    }

    /// Limit and cooldown behavior per priority. Only urgent and high may
    /// exceed frequency ceilings; only urgent skips cooldown entirely.
    pub fn priority_override(&self, priority: Priority) -> PriorityOverride {
        match priority {
            Priority::Urgent => PriorityOverride {
                allow_exceed: true,
                cooldown_minutes: 0,
            },
            Priority::High => PriorityOverride {
                allow_exceed: true,
                cooldown_minutes: 30,
            },
            Priority::Normal => PriorityOverride {
                allow_exceed: false,
                cooldown_minutes: 60,
            },
            Priority::Low => PriorityOverride {
                allow_exceed: false,
                cooldown_minutes: 120,
            },
        }
    }

    /// Cooldown stretch applied on top of the fatigue multiplier.
    pub fn segment_cooldown_multiplier(&self, segment: Segment) -> f64 {
        match segment {
            Segment::PowerUser => 0.5,
            Segment::Regular => 1.0,
            Segment::Casual => 1.5,
            Segment::AtRisk => 2.0,
            Segment::Dormant => 2.5,
            Segment::Churned => 3.0,
        }
    }

    /// Multiplicative factor in the optimal-time score.
    pub fn segment_priority_factor(&self, segment: Segment) -> f64 {
        match segment {
            Segment::PowerUser => 1.1,
            Segment::Regular => 1.0,
            Segment::Casual => 0.9,
            Segment::AtRisk => 0.8,
            Segment::Dormant => 0.7,
            Segment::Churned => 0.6,
        }
    }

    /// Re-engagement trigger for inactive segments; engaged segments get none.
    pub fn reengagement_trigger(&self, segment: Segment) -> Option<ReengagementTrigger> {
        match segment {
            Segment::AtRisk => Some(ReengagementTrigger {
                after_days: 5,
                max_attempts: 3,
                cooldown_days: 4,
                notification_types: vec![
                    "activity_summary".to_string(),
                    "feature_highlight".to_string(),
                ],
            }),
            // Three days after entering dormant, intentionally shorter than
            // the 14-day inactivity that defines the segment.
            Segment::Dormant => Some(ReengagementTrigger {
                after_days: 3,
                max_attempts: 4,
                cooldown_days: 7,
                notification_types: vec![
                    "pipeline_recap".to_string(),
                    "activity_summary".to_string(),
                ],
            }),
            Segment::Churned => Some(ReengagementTrigger {
                after_days: 14,
                max_attempts: 2,
                cooldown_days: 30,
                notification_types: vec!["win_back".to_string()],
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_sum_to_one() {
        let w = ScoreWeights::default();
        assert!((w.app + w.chat + w.notification - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fatigue_level_boundaries() {
        let f = FatigueConfig::default();
        assert_eq!(f.level_for(0), FatigueLevel::Low);
        assert_eq!(f.level_for(24), FatigueLevel::Low);
        assert_eq!(f.level_for(25), FatigueLevel::Moderate);
        assert_eq!(f.level_for(50), FatigueLevel::High);
        assert_eq!(f.level_for(74), FatigueLevel::High);
        assert_eq!(f.level_for(75), FatigueLevel::Critical);
        assert_eq!(f.level_for(100), FatigueLevel::Critical);
    }

    #[test]
    fn test_cooldown_multipliers_monotone() {
        let f = FatigueConfig::default();
        assert_eq!(f.cooldown_multiplier(FatigueLevel::Low), 1.0);
        assert_eq!(f.cooldown_multiplier(FatigueLevel::Critical), 2.5);
    }

    #[test]
    fn test_only_urgent_has_zero_cooldown() {
        let config = EngagementConfig::default();
        assert_eq!(config.priority_override(Priority::Urgent).cooldown_minutes, 0);
        for p in [Priority::High, Priority::Normal, Priority::Low] {
            assert!(config.priority_override(p).cooldown_minutes > 0);
        }
    }

    #[test]
    fn test_moderate_limits_match_product_defaults() {
        let config = EngagementConfig::default();
        let limits = config.notification_thresholds(PreferredFrequency::Moderate);
        assert_eq!(limits.max_per_hour, 2);
        assert_eq!(limits.max_per_day, 8);
    }

    #[test]
    fn test_reengagement_triggers_only_for_inactive_segments() {
        let config = EngagementConfig::default();
        assert!(config.reengagement_trigger(Segment::PowerUser).is_none());
        assert!(config.reengagement_trigger(Segment::Regular).is_none());
        assert!(config.reengagement_trigger(Segment::Casual).is_none());
        assert_eq!(config.reengagement_trigger(Segment::AtRisk).unwrap().after_days, 5);
        assert_eq!(config.reengagement_trigger(Segment::Dormant).unwrap().after_days, 3);
        assert_eq!(config.reengagement_trigger(Segment::Churned).unwrap().after_days, 14);
    }

    #[test]
    fn test_segment_cooldown_multiplier_increases_with_disengagement() {
        let config = EngagementConfig::default();
        let mut last = 0.0;
        for segment in Segment::ALL {
            let m = config.segment_cooldown_multiplier(segment);
            assert!(m > last);
            last = m;
        }
    }
}
