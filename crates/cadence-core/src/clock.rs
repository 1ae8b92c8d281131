//! Clock and calendar helpers
//!
//! Every component obtains wall time through the [`Clock`] trait so tests can
//! pin a fixed instant. Weekdays are numbered 0 (Sunday) through 6 (Saturday);
//! hours are 0..23 in the user's timezone.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::config::TimingConfig;

/// Source of wall time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock pinned to a fixed instant.
#[derive(Debug, Clone)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Parse an IANA timezone name, falling back to UTC on garbage input.
pub fn parse_timezone(tz: &str) -> Tz {
    tz.parse::<Tz>().unwrap_or_else(|_| {
        warn!(timezone = %tz, "Unknown timezone, falling back to UTC");
        chrono_tz::UTC
    })
}

/// Weekday as 0 (Sunday) .. 6 (Saturday) in the given timezone.
pub fn weekday_in_zone(t: DateTime<Utc>, tz: Tz) -> u8 {
    t.with_timezone(&tz).weekday().num_days_from_sunday() as u8
}

/// Hour 0..23 in the given timezone.
pub fn hour_in_zone(t: DateTime<Utc>, tz: Tz) -> u8 {
    t.with_timezone(&tz).hour() as u8
}

/// Truncate to the top of the hour (UTC).
pub fn start_of_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive()
        .and_hms_opt(t.hour(), 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(t)
}

/// Midnight of the local day containing `t`, expressed back in UTC.
pub fn start_of_day(t: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = t.with_timezone(&tz);
    let midnight = local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time");
    match tz.from_local_datetime(&midnight).earliest() {
        Some(local_midnight) => local_midnight.with_timezone(&Utc),
        None => t,
    }
}

/// Whether `t` falls on Saturday or Sunday in the given timezone.
pub fn is_weekend(t: DateTime<Utc>, tz: Tz) -> bool {
    matches!(weekday_in_zone(t, tz), 0 | 6)
}

/// The next instant at or after `t` that falls inside business hours in the
/// user's timezone. If `t` is already inside the window it is returned as-is.
pub fn next_business_hour_start(t: DateTime<Utc>, tz: Tz, timing: &TimingConfig) -> DateTime<Utc> {
    let local = t.with_timezone(&tz);
    let hour = local.hour() as u8;

    if hour >= timing.business_start && hour < timing.business_end {
        return t;
    }

    let target_day = if hour < timing.business_start {
        local.date_naive()
    } else {
        local.date_naive() + Duration::days(1)
    };
    let opening = target_day
        .and_hms_opt(timing.business_start as u32, 0, 0)
        .expect("business_start is a valid hour");
    match tz.from_local_datetime(&opening).earliest() {
        Some(open_local) => open_local.with_timezone(&Utc),
        None => t + Duration::hours(1),
    }
}

/// A candidate send time in the user's zone: the start of a local hour.
pub fn local_hour_start(t: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = t.with_timezone(&tz);
    let naive = local
        .date_naive()
        .and_hms_opt(local.hour(), 0, 0)
        .expect("hour start is always valid");
    match tz.from_local_datetime(&naive).earliest() {
        Some(hs) => hs.with_timezone(&Utc),
        None => start_of_hour(t),
    }
}
