//! Morning brief job
//!
//! One message per mapped user per day, targeted at 08:00 in the user's
//! timezone: before that local hour the send is queued for 08:00; after it,
//! the dispatcher sends subject to policy. The 20h dedupe window keeps a
//! second cron firing quiet.

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use super::{ensure_fresh_metrics, for_each_org, orgs_for, unit_error, JobContext, JobReport, JobScope, USER_CONCURRENCY};
use crate::clock::{local_hour_start, parse_timezone, start_of_day};
use crate::crm::User;
use crate::dispatcher::{DispatchOutcome, DispatchRequest, SkipReason};
use crate::feature::{dedupe_key, Feature, Priority};
use crate::message::{BriefModel, DealLine, MeetingLine, MessageBody, MessageModel};
use crate::queue::QueuedNotification;
use crate::Result;

const BRIEF_LOCAL_HOUR: u8 = 8;

pub async fn run(ctx: &JobContext, scope: &JobScope) -> Result<JobReport> {
    let orgs = orgs_for(ctx, Feature::MorningBrief, scope).await?;
    info!(orgs = orgs.len(), "Morning brief fan-out");
    let report = for_each_org(ctx, &orgs, |org| run_org(ctx, org, scope)).await;
    Ok(report.finish())
}

async fn run_org(ctx: &JobContext, org_id: &str, scope: &JobScope) -> JobReport {
    let mut report = JobReport::default();
    let recipients = match ctx.db().list_mapped_recipients(org_id).await {
        Ok(r) => r,
        Err(e) => {
            unit_error(&mut report, org_id, e);
            return report;
        }
    };

    for chunk in recipients.chunks(USER_CONCURRENCY) {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let results = futures::future::join_all(
            chunk
                .iter()
                .filter(|r| scope.matches_user(&r.user_id))
                .map(|r| run_user(ctx, org_id, &r.user_id, scope)),
        )
        .await;
        for r in results {
            report.merge(r);
        }
    }
    report
}

async fn run_user(ctx: &JobContext, org_id: &str, user_id: &str, scope: &JobScope) -> JobReport {
    let mut report = JobReport::default();
    let now = ctx.clock.now();

    let user = match ctx.db().get_user(user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            report.skipped += 1;
            return report;
        }
        Err(e) => {
            unit_error(&mut report, user_id, e);
            return report;
        }
    };

    if let Err(e) = ensure_fresh_metrics(ctx, &user).await {
        unit_error(&mut report, user_id, e);
        return report;
    }

    let tz = parse_timezone(&user.timezone);
    let local_hour = crate::clock::hour_in_zone(now, tz);

    // Too early: park the brief at 08:00 local instead of waking the user.
    if local_hour < BRIEF_LOCAL_HOUR && !scope.is_manual() {
        let eight_local = start_of_day(now, tz) + Duration::hours(BRIEF_LOCAL_HOUR as i64);
        let queued = QueuedNotification::new(user_id, org_id, Feature::MorningBrief, Priority::Normal, eight_local)
            .with_dedupe_key(dedupe_key(Feature::MorningBrief, org_id, user_id, ""))
            .scheduled();
        match ctx.db().enqueue_notification(&queued).await {
            Ok(_) => report.skipped += 1,
            Err(e) => unit_error(&mut report, user_id, e),
        }
        return report;
    }

    let mut request = DispatchRequest::new(Feature::MorningBrief, org_id, user_id, Priority::Normal);
    if scope.is_manual() {
        request = request.manual();
    }

    let user_for_model = user.clone();
    let outcome = ctx
        .dispatcher
        .dispatch(request, || build_model(ctx, org_id, &user_for_model))
        .await;
    match outcome {
        Ok(outcome) => {
            if let DispatchOutcome::Skipped(SkipReason::NoMapping) = outcome {
                info!(user_id = %user_id, "Morning brief skipped, no chat mapping");
            }
            report.absorb_outcome(&outcome);
        }
        Err(e) => unit_error(&mut report, user_id, e),
    }
    report
}

/// Today's meetings plus up to three deals that need attention.
pub(crate) async fn build_model(ctx: &JobContext, org_id: &str, user: &User) -> Result<MessageModel> {
    let now = ctx.clock.now();
    let tz = parse_timezone(&user.timezone);
    let day_start = start_of_day(now, tz);
    let day_end = day_start + Duration::hours(24);

    let meetings = ctx
        .db()
        .meetings_for_user_between(org_id, &user.id, local_hour_start(now, tz), day_end)
        .await?
        .into_iter()
        .map(|m| MeetingLine {
            title: m.title,
            starts_at_label: super::local_time_label(m.starts_at, tz),
            attendee_count: m.attendees.len(),
        })
        .collect();

    let focus_deals = ctx
        .db()
        .list_deals_for_owner(org_id, &user.id)
        .await?
        .into_iter()
        .filter(|d| d.needs_momentum_nudge())
        .take(3)
        .map(|d| DealLine {
            name: d.name,
            company: d.company,
            stage: d.stage,
            health_label: d.health.as_str().to_string(),
        })
        .collect();

    let greeting_name = user.name_for_greeting();
    Ok(MessageModel::new(
        Feature::MorningBrief,
        "brief",
        format!("Good morning, {}", greeting_name),
        MessageBody::Brief(BriefModel {
            greeting_name,
            meetings,
            focus_deals,
        }),
    )
    .with_action_url(format!("{}/today", ctx.site_url)))
}
