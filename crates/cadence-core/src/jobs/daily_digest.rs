//! Daily digest job
//!
//! One org-wide message per org per day, posted to the configured channel.
//! The 20h dedupe window (keyed on the org as the entity) makes a double cron
//! firing harmless.

use chrono::{DateTime, Utc};
use tracing::info;

use super::{orgs_for, for_each_org, unit_error, JobContext, JobReport, JobScope};
use crate::clock::{parse_timezone, start_of_day};
use crate::dispatcher::DispatchRequest;
use crate::feature::{Feature, Priority};
use crate::message::{DigestModel, MessageBody, MessageModel};
use crate::Result;

pub async fn run(ctx: &JobContext, scope: &JobScope) -> Result<JobReport> {
    let orgs = orgs_for(ctx, Feature::DailyDigest, scope).await?;
    info!(orgs = orgs.len(), "Daily digest fan-out");
    let report = for_each_org(ctx, &orgs, |org| run_org(ctx, org, scope)).await;
    Ok(report.finish())
}

async fn run_org(ctx: &JobContext, org_id: &str, scope: &JobScope) -> JobReport {
    let mut report = JobReport::default();
    let now = ctx.clock.now();

    let mut request = DispatchRequest::new(Feature::DailyDigest, org_id, "", Priority::Normal)
        .with_entity(org_id);
    if scope.is_manual() {
        request = request.manual();
    }

    let outcome = ctx
        .dispatcher
        .dispatch(request, || build_model(ctx, org_id, now))
        .await;
    match outcome {
        Ok(outcome) => report.absorb_outcome(&outcome),
        Err(e) => unit_error(&mut report, org_id, e),
    }
    report
}

/// Assemble the digest from today's CRM activity. Deterministic; the insight
/// provider only decorates the highlights when configured.
pub(crate) async fn build_model(
    ctx: &JobContext,
    org_id: &str,
    now: DateTime<Utc>,
) -> Result<MessageModel> {
    let settings = ctx
        .db()
        .get_feature_settings(org_id, Feature::DailyDigest)
        .await?;
    let tz = parse_timezone(
        settings
            .as_ref()
            .map(|s| s.schedule_timezone.as_str())
            .unwrap_or("UTC"),
    );
    let day_start = start_of_day(now, tz);

    let deals_in_motion = ctx
        .db()
        .count_deals_updated_since(org_id, now - chrono::Duration::days(7))
        .await? as usize;
    let meetings_held = ctx
        .db()
        .meetings_starting_between(org_id, day_start, now)
        .await?
        .len();
    let calls_logged = ctx.db().count_calls_logged(org_id, day_start).await? as usize;

    let mut highlights: Vec<String> = ctx
        .db()
        .list_deals_needing_momentum(org_id)
        .await?
        .into_iter()
        .take(3)
        .map(|deal| format!("{} ({}) needs a next step", deal.name, deal.company))
        .collect();

    if let Some(insight) = &ctx.insight {
        let generated = insight
            .generate(crate::delivery::InsightRequest {
                kind: crate::delivery::InsightKind::Digest,
                context: serde_json::json!({
                    "org_id": org_id,
                    "deals_in_motion": deals_in_motion,
                    "meetings_held": meetings_held,
                    "calls_logged": calls_logged,
                }),
            })
            .await;
        if let Ok(generated) = generated {
            highlights.extend(generated.bullets.into_iter().take(2));
        }
    }

    let date_label = now.with_timezone(&tz).format("%a, %b %-d").to_string();
    Ok(MessageModel::new(
        Feature::DailyDigest,
        "digest",
        format!("Daily digest — {}", date_label),
        MessageBody::Digest(DigestModel {
            org_name: org_id.to_string(),
            date_label,
            deals_in_motion,
            meetings_held,
            calls_logged,
            highlights,
        }),
    )
    .with_action_url(format!("{}/digest", ctx.site_url)))
}
