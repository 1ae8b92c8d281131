//! Delivery policy engine
//!
//! The central gate for every candidate delivery. CPU-only: callers load the
//! user's metrics and recent send counts, this module decides send-now, defer
//! or deny. Ordering is fixed: priority downgrade, quiet-window deferral,
//! hourly limit, daily limit, cooldown.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::clock::{hour_in_zone, is_weekend, local_hour_start, start_of_day, start_of_hour, weekday_in_zone};
use crate::config::EngagementConfig;
use crate::feature::Priority;
use crate::metrics::{FatigueLevel, UserMetrics};

/// Recent delivery counts for a recipient, as returned by the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecentCounts {
    pub hour: u32,
    pub day: u32,
    pub last_sent_at: Option<DateTime<Utc>>,
}

/// Why a delivery was refused outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    HourlyLimit,
    DailyLimit,
    CooldownActive,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HourlyLimit => "hourly_limit",
            Self::DailyLimit => "daily_limit",
            Self::CooldownActive => "cooldown_active",
        }
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    /// Deliver immediately with the (possibly downgraded) priority.
    SendNow { priority: Priority },
    /// Outside the user's window; deliver at the recommended time instead.
    Defer {
        priority: Priority,
        until: DateTime<Utc>,
        confidence: f64,
    },
    /// Refused; earliest time a retry could pass.
    Deny {
        reason: DenyReason,
        next_allowed_at: DateTime<Utc>,
    },
}

/// Recommended send time from the optimal-time scorer.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimalTime {
    pub send_at: DateTime<Utc>,
    pub confidence: f64,
}

/// Fatigue-driven priority downgrade. Urgent is never downgraded; high
/// fatigue downgrades only normal, mirroring the shipped behavior.
pub fn downgrade_priority(priority: Priority, fatigue: FatigueLevel) -> Priority {
    match (fatigue, priority) {
        (FatigueLevel::Critical, Priority::High) => Priority::Normal,
        (FatigueLevel::Critical, Priority::Normal) => Priority::Low,
        (FatigueLevel::High, Priority::Normal) => Priority::Low,
        _ => priority,
    }
}

/// Whether to fold this notification into a batch instead of sending alone.
pub fn should_batch(priority: Priority, fatigue: FatigueLevel, pending_count: u32) -> bool {
    if matches!(priority, Priority::Urgent | Priority::High) {
        return false;
    }
    if fatigue >= FatigueLevel::High && pending_count < 5 {
        return true;
    }
    priority == Priority::Low && pending_count > 0 && pending_count < 3
}

/// Evaluate the full gate for one candidate delivery.
pub fn evaluate(
    config: &EngagementConfig,
    metrics: &UserMetrics,
    requested_priority: Priority,
    tz: Tz,
    counts: RecentCounts,
    now: DateTime<Utc>,
) -> PolicyDecision {
    let fatigue_level = metrics.fatigue_level(config);
    let priority = downgrade_priority(requested_priority, fatigue_level);
    let fatigue_multiplier = config.fatigue.cooldown_multiplier(fatigue_level);
    let overrides = config.priority_override(priority);

    // 1. Quiet/active window
    if priority != Priority::Urgent {
        let hour = hour_in_zone(now, tz);
        let weekday = weekday_in_zone(now, tz);
        let in_business_hours =
            hour >= config.timing.business_start && hour <= config.timing.business_end;
        let in_active_hours = metrics.patterns.hour_rank(weekday, hour).is_some();
        if !in_business_hours && !in_active_hours {
            let optimal = optimal_send_time(config, metrics, priority, tz, now);
            return PolicyDecision::Defer {
                priority,
                until: optimal.send_at,
                confidence: optimal.confidence,
            };
        }
    }

    let limits = config.notification_thresholds(metrics.preferred_frequency);

    // 2. Hourly limit
    let effective_hourly = ((limits.max_per_hour as f64 / fatigue_multiplier).floor() as u32).max(1);
    if counts.hour >= effective_hourly && !overrides.allow_exceed {
        return PolicyDecision::Deny {
            reason: DenyReason::HourlyLimit,
            next_allowed_at: start_of_hour(now) + Duration::hours(1),
        };
    }

    // 3. Daily limit
    let effective_daily = ((limits.max_per_day as f64 / fatigue_multiplier).floor() as u32).max(1);
    if counts.day >= effective_daily && !overrides.allow_exceed {
        return PolicyDecision::Deny {
            reason: DenyReason::DailyLimit,
            next_allowed_at: start_of_day(now, tz) + Duration::hours(24),
        };
    }

    // 4+5. Cooldown, stretched by fatigue then segment
    if priority != Priority::Urgent {
        if let Some(last_sent) = counts.last_sent_at {
            let segment_multiplier = config.segment_cooldown_multiplier(metrics.segment);
            let effective_secs = (overrides.cooldown_minutes as f64
                * fatigue_multiplier
                * segment_multiplier
                * 60.0)
                .round() as i64;
            let effective = Duration::seconds(effective_secs);
            if now - last_sent < effective {
                return PolicyDecision::Deny {
                    reason: DenyReason::CooldownActive,
                    next_allowed_at: last_sent + effective,
                };
            }
        }
    }

    PolicyDecision::SendNow { priority }
}

/// Score every candidate hour in the lookahead window and pick the best.
///
/// Candidates are local hour starts; the first candidate is the current hour
/// (offset 0). Non-urgent priorities only consider business hours. A best
/// score below the confidence floor falls back to the peak hour (confidence
/// 0.3); urgent with no qualifying hour sends immediately (0.5).
pub fn optimal_send_time(
    config: &EngagementConfig,
    metrics: &UserMetrics,
    priority: Priority,
    tz: Tz,
    now: DateTime<Utc>,
) -> OptimalTime {
    let fatigue_multiplier = config.fatigue.cooldown_multiplier(metrics.fatigue_level(config));
    let current_hour_start = local_hour_start(now, tz);

    let mut best: Option<(f64, DateTime<Utc>)> = None;

    for offset in 0..=config.timing.lookahead_hours {
        let candidate = current_hour_start + Duration::hours(offset);
        if candidate < now && offset > 0 {
            continue;
        }
        let hour = hour_in_zone(candidate, tz);
        let weekday = weekday_in_zone(candidate, tz);

        let in_business_hours =
            hour >= config.timing.business_start && hour <= config.timing.business_end;
        if priority != Priority::Urgent && !in_business_hours {
            continue;
        }

        let offset_hours = ((candidate - now).num_seconds().max(0) / 3600) as f64;

        let mut score = 50.0;
        if Some(hour) == metrics.patterns.peak_hour {
            score += 30.0;
        } else if let Some(rank) = metrics.patterns.hour_rank(weekday, hour) {
            score += (25.0 - 5.0 * rank as f64).max(0.0);
        }
        score += (metrics.notif_score as f64 / 100.0) * 20.0;
        score -= ((fatigue_multiplier - 1.0) * 20.0).min(25.0);
        score += priority.time_boost();
        if is_weekend(candidate, tz) && priority != Priority::Urgent {
            score *= config.timing.weekend_factor;
        }
        score *= config.segment_priority_factor(metrics.segment);
        score -= 2.0 * offset_hours;

        match best {
            Some((best_score, _)) if best_score >= score => {}
            _ => best = Some((score, candidate.max(now))),
        }
    }

    if let Some((score, send_at)) = best {
        if score >= config.timing.min_confidence * 100.0 {
            return OptimalTime {
                send_at,
                confidence: (score / 100.0).clamp(0.0, 1.0),
            };
        }
    }

    if priority == Priority::Urgent {
        return OptimalTime {
            send_at: now,
            confidence: 0.5,
        };
    }

    match metrics.patterns.peak_hour {
        Some(peak) => OptimalTime {
            send_at: next_local_hour(now, tz, peak),
            confidence: 0.3,
        },
        None => OptimalTime {
            send_at: crate::clock::next_business_hour_start(now, tz, &config.timing),
            confidence: 0.3,
        },
    }
}

/// The next occurrence of local hour `hour` at or after `t`.
fn next_local_hour(t: DateTime<Utc>, tz: Tz, hour: u8) -> DateTime<Utc> {
    let mut candidate = local_hour_start(t, tz);
    for _ in 0..=24 {
        if hour_in_zone(candidate, tz) == hour && candidate >= t {
            return candidate;
        }
        candidate += Duration::hours(1);
    }
    t
}
