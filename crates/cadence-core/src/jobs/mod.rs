//! Scheduled jobs
//!
//! Each job is a cron-entry function: load the orgs with the feature enabled
//! (or one org for a manual run), fan out over recipients on a bounded pool,
//! and invoke the dispatcher per candidate. Per-unit errors are collected
//! into the report; they never block sibling units. Cancellation is checked
//! between batches.

pub mod daily_digest;
pub mod deal_momentum;
pub mod meeting_debrief;
pub mod meeting_prep;
pub mod morning_brief;
pub mod queue_drain;
pub mod reengagement;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{parse_timezone, start_of_day, Clock};
use crate::config::EngagementConfig;
use crate::crm::User;
use crate::database::Database;
use crate::delivery::InsightProvider;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::feature::Feature;
use crate::metrics::{self, UserMetrics};
use crate::Result;

/// Orgs processed concurrently per job.
pub const ORG_CONCURRENCY: usize = 5;

/// Users processed concurrently within one org.
pub const USER_CONCURRENCY: usize = 3;

/// Pause between fan-out batches, to stay under upstream rate limits.
pub const BATCH_PAUSE_MS: u64 = 1000;

/// Everything a job needs to run.
#[derive(Clone)]
pub struct JobContext {
    pub dispatcher: Dispatcher,
    pub insight: Option<Arc<dyn InsightProvider>>,
    pub clock: Arc<dyn Clock>,
    pub cancel: CancellationToken,
    pub site_url: String,
}

impl JobContext {
    pub fn new(dispatcher: Dispatcher, clock: Arc<dyn Clock>) -> Self {
        Self {
            dispatcher,
            insight: None,
            clock,
            cancel: CancellationToken::new(),
            site_url: "https://app.cadence.example".to_string(),
        }
    }

    pub fn with_insight(mut self, insight: Arc<dyn InsightProvider>) -> Self {
        self.insight = Some(insight);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn db(&self) -> &Database {
        self.dispatcher.db()
    }

    pub fn config(&self) -> &EngagementConfig {
        self.dispatcher.config()
    }
}

/// Manual narrowing from a cron body: a single org, user or entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobScope {
    pub org_id: Option<String>,
    pub user_id: Option<String>,
    pub entity_id: Option<String>,
}

impl JobScope {
    /// A scoped run is a manual trigger and bypasses dedupe.
    pub fn is_manual(&self) -> bool {
        self.org_id.is_some()
    }

    pub fn matches_user(&self, user_id: &str) -> bool {
        self.user_id.as_deref().map(|u| u == user_id).unwrap_or(true)
    }

    pub fn matches_entity(&self, entity_id: &str) -> bool {
        self.entity_id.as_deref().map(|e| e == entity_id).unwrap_or(true)
    }
}

/// Aggregated job outcome. `success` stays true as long as at least one unit
/// completed; unit errors are summarized, never fatal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobReport {
    pub success: bool,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub skip_reasons: Vec<String>,
    pub errors: Vec<String>,
}

impl JobReport {
    pub fn absorb_outcome(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Delivered { .. } => self.sent += 1,
            DispatchOutcome::Skipped(reason) => {
                self.skipped += 1;
                self.skip_reasons.push(describe_skip(reason));
            }
            DispatchOutcome::Failed { error, .. } => {
                self.failed += 1;
                self.errors.push(error.clone());
            }
        }
    }

    pub fn absorb_error(&mut self, context: &str, error: &crate::Error) {
        self.failed += 1;
        self.errors.push(format!("{}: {}", context, error));
    }

    pub fn merge(&mut self, other: JobReport) {
        self.sent += other.sent;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.skip_reasons.extend(other.skip_reasons);
        self.errors.extend(other.errors);
    }

    /// Finalize the success flag: true when any unit completed, or when
    /// there was nothing to do at all.
    pub fn finish(mut self) -> Self {
        let completed = self.sent + self.skipped;
        self.success = completed > 0 || self.errors.is_empty();
        self
    }
}

/// Human-readable skip label for admin-facing responses: the bare reason,
/// plus the earliest retry time for policy denials and deferrals.
fn describe_skip(reason: &crate::dispatcher::SkipReason) -> String {
    use crate::dispatcher::SkipReason;
    match reason {
        SkipReason::Policy { reason, next_allowed_at } => {
            format!("{}:{}", reason.as_str(), *next_allowed_at)
        }
        SkipReason::Deferred { until } => format!("deferred:{}", until),
        other => other.as_str().to_string(),
    }
}

/// Resolve the orgs a job run covers.
pub async fn orgs_for(ctx: &JobContext, feature: Feature, scope: &JobScope) -> Result<Vec<String>> {
    match &scope.org_id {
        Some(org) => Ok(vec![org.clone()]),
        None => ctx.db().orgs_with_feature_enabled(feature).await,
    }
}

/// Fan out over orgs in bounded batches with the inter-batch pause, checking
/// cancellation between batches. The per-org future must not panic; errors
/// come back in its report.
pub async fn for_each_org<'a, F, Fut>(
    ctx: &'a JobContext,
    orgs: &'a [String],
    run_org: F,
) -> JobReport
where
    F: Fn(&'a str) -> Fut,
    Fut: std::future::Future<Output = JobReport> + 'a,
{
    let mut report = JobReport::default();
    let mut batches = orgs.chunks(ORG_CONCURRENCY).peekable();
    while let Some(batch) = batches.next() {
        if ctx.cancel.is_cancelled() {
            info!("Job cancelled between org batches");
            break;
        }
        let results = futures::future::join_all(batch.iter().map(|org| run_org(org))).await;
        for r in results {
            report.merge(r);
        }
        if batches.peek().is_some() {
            tokio::time::sleep(std::time::Duration::from_millis(BATCH_PAUSE_MS)).await;
        }
    }
    report
}

/// Recompute a user's metrics on first use of the day and cache them on the
/// metric row. Fresh rows are returned as-is.
pub async fn ensure_fresh_metrics(ctx: &JobContext, user: &User) -> Result<UserMetrics> {
    let now = ctx.clock.now();
    let tz = parse_timezone(&user.timezone);
    let day_start = start_of_day(now, tz);

    if let Some(existing) = ctx.db().get_user_metrics(&user.id).await? {
        if existing.updated_at >= day_start {
            return Ok(existing);
        }
    }

    let events = ctx
        .db()
        .list_activity_events(&user.id, now - Duration::days(7))
        .await?;
    let interactions = ctx.db().list_interactions(&user.id, 50).await?;

    let scores = metrics::compute_scores(
        &events,
        &interactions,
        user.last_app_active_at,
        user.last_chat_active_at,
        now,
        ctx.config(),
    );

    let unique_sessions = events
        .iter()
        .filter_map(|e| e.session_id.as_deref())
        .collect::<std::collections::HashSet<_>>()
        .len();
    let sessions_per_day = unique_sessions as f64 / 7.0;
    let days_inactive = user.days_inactive(now);

    let previous = ctx.db().get_user_metrics(&user.id).await?;
    let mut updated = previous
        .clone()
        .unwrap_or_else(|| UserMetrics::bootstrap(&user.id, &user.org_id, now));
    updated.app_score = scores.app;
    updated.chat_score = scores.chat;
    updated.notif_score = scores.notification;
    updated.overall_score = scores.overall;
    updated.segment = metrics::assign_segment(scores.overall, days_inactive, sessions_per_day, ctx.config());
    updated.fatigue = metrics::fatigue_score(&interactions);
    updated.patterns = metrics::activity_patterns(&events);
    updated.avg_daily_sessions = sessions_per_day;
    updated.updated_at = now;

    let written_segment = ctx.db().upsert_user_metrics(&updated).await?;
    updated.segment = written_segment;
    ctx.dispatcher.invalidate_metrics(&user.id).await;

    debug!(
        user_id = %user.id,
        overall = updated.overall_score,
        segment = %updated.segment,
        fatigue = updated.fatigue,
        "Metrics recomputed"
    );
    Ok(updated)
}

/// Log and swallow a per-unit error into the report.
pub(crate) fn unit_error(report: &mut JobReport, context: &str, error: crate::Error) {
    warn!(context = %context, error = %error, "Job unit failed");
    report.absorb_error(context, &error);
}

/// Shared helper: hour label in a user's zone for message copy.
pub(crate) fn local_time_label(t: DateTime<Utc>, tz: chrono_tz::Tz) -> String {
    t.with_timezone(&tz).format("%H:%M").to_string()
}
