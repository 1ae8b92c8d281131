//! Queued notification drain
//!
//! Re-dispatches chat rows parked by deferrals, policy denials, batching and
//! the transcript worker. Runs on its own cron cadence; leasing keeps
//! concurrent drains from double-sending, and the dispatcher re-applies the
//! full gate on every attempt.

use chrono::Duration;
use tracing::{info, warn};

use super::{meeting_debrief, JobContext, JobReport, JobScope};
use crate::dispatcher::{DispatchOutcome, DispatchRequest};
use crate::feature::Feature;
use crate::message::MessageModel;
use crate::queue::{NotificationStatus, QueuedNotification};
use crate::{Error, Result};

const DRAIN_BATCH: i64 = 50;
const LEASE_MINUTES: i64 = 5;

pub async fn run(ctx: &JobContext, _scope: &JobScope) -> Result<JobReport> {
    let now = ctx.clock.now();
    let leased = ctx
        .db()
        .lease_notifications(None, Some("slack"), DRAIN_BATCH, Duration::minutes(LEASE_MINUTES), now)
        .await?;

    let mut report = JobReport::default();
    if leased.is_empty() {
        return Ok(report.finish());
    }
    info!(count = leased.len(), "Draining queued notifications");

    for notification in leased {
        if ctx.cancel.is_cancelled() {
            // Leave the rest leased; the lease expiry re-offers them.
            break;
        }
        drain_one(ctx, notification, &mut report).await;
    }
    Ok(report.finish())
}

async fn drain_one(ctx: &JobContext, notification: QueuedNotification, report: &mut JobReport) {
    let id = notification.id.clone();
    let outcome = redispatch(ctx, &notification).await;

    let settle = match &outcome {
        Ok(DispatchOutcome::Delivered { .. }) => (NotificationStatus::Sent, None),
        // Deferrals and denials enqueue a fresh row; dedupe and the other
        // skips mean this row's moment has passed either way.
        Ok(DispatchOutcome::Skipped(_)) => (NotificationStatus::Cancelled, None),
        Ok(DispatchOutcome::Failed { error, retryable }) => {
            if *retryable && notification.can_retry() {
                (NotificationStatus::Pending, Some(error.clone()))
            } else {
                (NotificationStatus::Failed, Some(error.clone()))
            }
        }
        Err(e) => {
            if notification.can_retry() {
                (NotificationStatus::Pending, Some(e.to_string()))
            } else {
                (NotificationStatus::Failed, Some(e.to_string()))
            }
        }
    };

    match &outcome {
        Ok(o) => report.absorb_outcome(o),
        Err(e) => {
            warn!(id = %id, error = %e, "Queued notification could not be rebuilt");
            report.failed += 1;
            report.errors.push(format!("{}: {}", id, e));
        }
    }

    if let Err(e) = ctx
        .db()
        .settle_notification(&id, settle.0, settle.1.as_deref())
        .await
    {
        warn!(id = %id, error = %e, "Failed to settle queued notification");
        report.errors.push(format!("settle {}: {}", id, e));
    }
}

/// Rebuild the message for a parked row and push it back through the
/// dispatcher (which re-evaluates settings, dedupe and policy).
async fn redispatch(ctx: &JobContext, notification: &QueuedNotification) -> Result<DispatchOutcome> {
    let entity_id = notification
        .payload
        .get("entity_id")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let model = build_for(ctx, notification, entity_id.as_deref()).await?;

    let mut request = DispatchRequest::new(
        notification.feature,
        &notification.org_id,
        &notification.user_id,
        notification.priority,
    );
    if let Some(entity) = entity_id {
        request = request.with_entity(entity);
    }

    ctx.dispatcher.dispatch(request, || async move { Ok(model) }).await
}

async fn build_for(
    ctx: &JobContext,
    notification: &QueuedNotification,
    entity_id: Option<&str>,
) -> Result<MessageModel> {
    match notification.feature {
        Feature::DailyDigest => {
            super::daily_digest::build_model(ctx, &notification.org_id, ctx.clock.now()).await
        }
        Feature::MorningBrief => {
            let user = ctx
                .db()
                .get_user(&notification.user_id)
                .await?
                .ok_or_else(|| Error::UserNotFound(notification.user_id.clone()))?;
            super::morning_brief::build_model(ctx, &notification.org_id, &user).await
        }
        Feature::MeetingPrep => {
            let meeting_id = entity_id
                .ok_or_else(|| Error::Other("Meeting prep row without meeting id".to_string()))?;
            let meeting = ctx
                .db()
                .get_meeting(meeting_id)
                .await?
                .ok_or_else(|| Error::Other(format!("Meeting not found: {}", meeting_id)))?;
            super::meeting_prep::build_model(ctx, meeting).await
        }
        Feature::DealMomentum => {
            let deal_id = entity_id
                .ok_or_else(|| Error::Other("Deal momentum row without deal id".to_string()))?;
            let deal = ctx
                .db()
                .get_deal(deal_id)
                .await?
                .ok_or_else(|| Error::Other(format!("Deal not found: {}", deal_id)))?;
            super::deal_momentum::build_model(ctx, deal).await
        }
        Feature::MeetingDebrief => {
            let call_id = notification
                .payload
                .get("call_id")
                .and_then(|v| v.as_str())
                .or(entity_id)
                .ok_or_else(|| Error::Other("Debrief row without call id".to_string()))?;
            meeting_debrief::build_model(ctx, call_id).await
        }
        Feature::Reengagement => {
            // Email rows carry a prebuilt model; chat rows rebuild a default.
            if let Some(model) = notification.payload.get("model") {
                return Ok(serde_json::from_value(model.clone())?);
            }
            let user = ctx
                .db()
                .get_user(&notification.user_id)
                .await?
                .ok_or_else(|| Error::UserNotFound(notification.user_id.clone()))?;
            let metrics = ctx
                .dispatcher
                .load_metrics(&notification.user_id, &notification.org_id)
                .await?;
            Ok(super::reengagement::build_model(
                ctx,
                &user,
                &metrics,
                &crate::segmentation::ReengagementTopic::SegmentDefault("activity_summary".to_string()),
            ))
        }
    }
}
