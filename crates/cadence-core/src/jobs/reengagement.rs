//! Re-engagement job
//!
//! Daily pass over every active user: refresh metrics, send feedback prompts
//! when due, and pick up users in the inactive segments for a win-back nudge.
//! Chat-eligible users go through the dispatcher; everyone else is handed to
//! the external mailer via an email-channel queue row.

use tracing::{debug, info};

use super::{ensure_fresh_metrics, for_each_org, orgs_for, unit_error, JobContext, JobReport, JobScope, USER_CONCURRENCY};
use crate::crm::User;
use crate::dispatcher::{DispatchOutcome, DispatchRequest};
use crate::feature::{Feature, Priority};
use crate::message::{MessageBody, MessageModel, ReengagementModel};
use crate::metrics::{self, UserMetrics};
use crate::queue::QueuedNotification;
use crate::segmentation::{
    self, ContentTrigger, ReengagementChannel, ReengagementTopic,
};
use crate::Result;

pub async fn run(ctx: &JobContext, scope: &JobScope) -> Result<JobReport> {
    let orgs = orgs_for(ctx, Feature::Reengagement, scope).await?;
    info!(orgs = orgs.len(), "Re-engagement fan-out");
    let report = for_each_org(ctx, &orgs, |org| run_org(ctx, org, scope)).await;
    Ok(report.finish())
}

async fn run_org(ctx: &JobContext, org_id: &str, scope: &JobScope) -> JobReport {
    let mut report = JobReport::default();
    let users = match ctx.db().list_active_users(org_id).await {
        Ok(u) => u,
        Err(e) => {
            unit_error(&mut report, org_id, e);
            return report;
        }
    };

    for chunk in users.chunks(USER_CONCURRENCY) {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let results = futures::future::join_all(
            chunk
                .iter()
                .filter(|u| scope.matches_user(&u.id))
                .map(|u| run_user(ctx, org_id, u, scope)),
        )
        .await;
        for r in results {
            report.merge(r);
        }
    }
    report
}

async fn run_user(ctx: &JobContext, org_id: &str, user: &User, scope: &JobScope) -> JobReport {
    let mut report = JobReport::default();
    let now = ctx.clock.now();

    let user_metrics = match ensure_fresh_metrics(ctx, user).await {
        Ok(m) => m,
        Err(e) => {
            unit_error(&mut report, &user.id, e);
            return report;
        }
    };

    // Feedback prompt, gated on volume then interval
    if metrics::should_request_feedback(&user_metrics, now, ctx.config()) {
        if let Err(e) = request_feedback(ctx, org_id, &user.id, now).await {
            unit_error(&mut report, &user.id, e);
        }
    }

    let days_inactive = user.days_inactive(now);
    if !segmentation::is_reengagement_candidate(&user_metrics, days_inactive, now, ctx.config()) {
        return report;
    }

    let available = available_triggers(ctx, org_id, user).await.unwrap_or_default();
    let topic = segmentation::select_topic(&available, user_metrics.segment, ctx.config());
    let content_driven = matches!(topic, ReengagementTopic::Content(_));
    let score = segmentation::priority_score(
        user_metrics.overall_score,
        user_metrics.reengagement_attempts,
        content_driven,
        days_inactive,
    );
    let priority = if score >= 70 { Priority::High } else { Priority::Normal };

    let has_chat_mapping = match ctx.db().get_recipient(org_id, &user.id).await {
        Ok(r) => r.and_then(|r| r.slack_user_id).is_some(),
        Err(e) => {
            unit_error(&mut report, &user.id, e);
            return report;
        }
    };
    let channel = segmentation::select_channel(user_metrics.segment, has_chat_mapping);

    debug!(
        user_id = %user.id,
        segment = %user_metrics.segment,
        score = score,
        channel = ?channel,
        "Re-engagement candidate"
    );

    match channel {
        ReengagementChannel::Chat => {
            // Fold into the user's pending batch rather than trickling nudges
            let fatigue_level = user_metrics.fatigue_level(ctx.config());
            let pending = match ctx.db().count_pending_notifications(&user.id).await {
                Ok(p) => p,
                Err(e) => {
                    unit_error(&mut report, &user.id, e);
                    return report;
                }
            };
            if crate::policy::should_batch(priority, fatigue_level, pending) {
                let tz = crate::clock::parse_timezone(&user.timezone);
                let optimal =
                    crate::policy::optimal_send_time(ctx.config(), &user_metrics, priority, tz, now);
                let model = build_model(ctx, user, &user_metrics, &topic);
                let queued = QueuedNotification::new(
                    &user.id,
                    org_id,
                    Feature::Reengagement,
                    priority,
                    optimal.send_at,
                )
                .with_payload(serde_json::json!({ "model": model }))
                .scheduled();
                match ctx.db().enqueue_notification(&queued).await {
                    Ok(_) => report.skipped += 1,
                    Err(e) => unit_error(&mut report, &user.id, e),
                }
                return report;
            }

            let mut request = DispatchRequest::new(Feature::Reengagement, org_id, &user.id, priority);
            if scope.is_manual() {
                request = request.manual();
            }
            let model = build_model(ctx, user, &user_metrics, &topic);
            let outcome = ctx.dispatcher.dispatch(request, || async move { Ok(model) }).await;
            match outcome {
                Ok(outcome) => {
                    if matches!(outcome, DispatchOutcome::Delivered { .. }) {
                        if let Err(e) = ctx.db().record_reengagement_attempt(&user.id, now).await {
                            unit_error(&mut report, &user.id, e);
                        }
                        ctx.dispatcher.invalidate_metrics(&user.id).await;
                    }
                    report.absorb_outcome(&outcome);
                }
                Err(e) => unit_error(&mut report, &user.id, e),
            }
        }
        ReengagementChannel::Email => {
            let model = build_model(ctx, user, &user_metrics, &topic);
            let mut queued =
                QueuedNotification::new(&user.id, org_id, Feature::Reengagement, priority, now);
            queued.channel = "email".to_string();
            queued.payload = serde_json::json!({
                "model": model,
                "email": user.email,
                "topic": topic_label(&topic),
            });
            match ctx.db().enqueue_notification(&queued).await {
                Ok(_) => {
                    if let Err(e) = ctx.db().record_reengagement_attempt(&user.id, now).await {
                        unit_error(&mut report, &user.id, e);
                    }
                    ctx.dispatcher.invalidate_metrics(&user.id).await;
                    report.skipped += 1;
                }
                Err(e) => unit_error(&mut report, &user.id, e),
            }
        }
    }
    report
}

async fn request_feedback(
    ctx: &JobContext,
    org_id: &str,
    user_id: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    ctx.db().record_feedback_requested(user_id, now).await?;
    ctx.dispatcher.invalidate_metrics(user_id).await;
    ctx.db()
        .insert_in_app_notification(
            user_id,
            org_id,
            "feedback",
            "feedback_request",
            "How are these updates landing?",
            "Tell us which notifications help and which just add noise.",
            Some(&format!("{}/settings/notifications", ctx.site_url)),
            &serde_json::json!({}),
            now,
        )
        .await?;
    info!(user_id = %user_id, "Feedback prompt recorded");
    Ok(())
}

/// Content hooks currently available for a user.
async fn available_triggers(ctx: &JobContext, org_id: &str, user: &User) -> Result<Vec<ContentTrigger>> {
    let now = ctx.clock.now();
    let mut triggers = Vec::new();

    let upcoming = ctx
        .db()
        .meetings_for_user_between(org_id, &user.id, now, now + chrono::Duration::days(7))
        .await?;
    if !upcoming.is_empty() {
        triggers.push(ContentTrigger::UpcomingMeeting);
    }

    if let Some(last_active) = user.last_active_at() {
        let deals = ctx.db().list_deals_for_owner(org_id, &user.id).await?;
        if deals.iter().any(|d| d.updated_at > last_active) {
            triggers.push(ContentTrigger::DealUpdate);
        }
    }

    Ok(triggers)
}

fn topic_label(topic: &ReengagementTopic) -> String {
    match topic {
        ReengagementTopic::Content(t) => t.as_str().to_string(),
        ReengagementTopic::SegmentDefault(s) => s.clone(),
    }
}

pub(crate) fn build_model(
    ctx: &JobContext,
    user: &User,
    user_metrics: &UserMetrics,
    topic: &ReengagementTopic,
) -> MessageModel {
    let name = user.name_for_greeting();
    let (headline, body_lines) = match topic {
        ReengagementTopic::Content(ContentTrigger::UpcomingMeeting) => (
            format!("{}, you have a meeting coming up", name),
            vec!["Your prep notes are ready when you are.".to_string()],
        ),
        ReengagementTopic::Content(ContentTrigger::DealUpdate) => (
            "Your deals moved while you were away".to_string(),
            vec!["Catch up on what changed before your next touchpoint.".to_string()],
        ),
        ReengagementTopic::Content(ContentTrigger::ChampionChange) => (
            "A key contact changed on one of your accounts".to_string(),
            vec![],
        ),
        ReengagementTopic::Content(ContentTrigger::NewEmailSummary) => (
            "New email activity on your accounts".to_string(),
            vec![],
        ),
        ReengagementTopic::SegmentDefault(kind) => match kind.as_str() {
            "win_back" => (
                format!("{}, your pipeline is still here", name),
                vec!["Pick up where you left off in a couple of clicks.".to_string()],
            ),
            "pipeline_recap" => (
                "Your pipeline at a glance".to_string(),
                vec![format!("Engagement score: {}", user_metrics.overall_score)],
            ),
            _ => (
                "Here's what you missed".to_string(),
                vec![],
            ),
        },
    };

    MessageModel::new(
        Feature::Reengagement,
        "reengagement",
        headline.clone(),
        MessageBody::Reengagement(ReengagementModel {
            headline,
            body_lines,
            topic: topic_label(topic),
        }),
    )
    .with_action_url(format!("{}/welcome-back", ctx.site_url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::EngagementConfig;
    use crate::database::Database;
    use crate::delivery::{ChannelSender, DeliveryReceipt, DeliveryTarget};
    use crate::dispatcher::Dispatcher;
    use crate::feature::{FeatureSettings, Recipient};
    use crate::metrics::Segment;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSender(AtomicUsize);

    #[async_trait]
    impl ChannelSender for CountingSender {
        async fn deliver(&self, _target: &DeliveryTarget, _model: &MessageModel) -> Result<DeliveryReceipt> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(DeliveryReceipt {
                ts: format!("500.{}", n),
                channel_id: "D1".to_string(),
            })
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 3, 12, 0, 0).unwrap()
    }

    async fn setup() -> (JobContext, Arc<CountingSender>, Database) {
        let db = Database::in_memory().await.unwrap();
        let sender = Arc::new(CountingSender(AtomicUsize::new(0)));
        let dispatcher = Dispatcher::new(
            db.clone(),
            EngagementConfig::default(),
            sender.clone(),
            Arc::new(FixedClock(now())),
        );
        let ctx = JobContext::new(dispatcher, Arc::new(FixedClock(now())));
        db.upsert_feature_settings(&FeatureSettings::new("org1", Feature::Reengagement))
            .await
            .unwrap();
        (ctx, sender, db)
    }

    /// An at-risk user: active 6 days ago, metrics row already staged today.
    async fn seed_at_risk_user(db: &Database, with_mapping: bool) -> User {
        let mut user = User::new("u1", "amy@acme.com", "org1");
        user.last_app_active_at = Some(now() - Duration::days(6));
        db.upsert_user(&user).await.unwrap();
        if with_mapping {
            db.upsert_recipient(&Recipient {
                org_id: "org1".to_string(),
                user_id: "u1".to_string(),
                slack_user_id: Some("U1".to_string()),
                email: "amy@acme.com".to_string(),
                name: "Amy".to_string(),
            })
            .await
            .unwrap();
        }
        let mut m = UserMetrics::bootstrap("u1", "org1", now());
        m.segment = Segment::AtRisk;
        m.overall_score = 20;
        db.upsert_user_metrics(&m).await.unwrap();
        user
    }

    #[tokio::test]
    async fn test_at_risk_user_with_mapping_gets_chat_nudge() {
        let (ctx, sender, db) = setup().await;
        seed_at_risk_user(&db, true).await;

        let report = run(&ctx, &JobScope::default()).await.unwrap();
        assert!(report.success);
        assert_eq!(report.sent, 1);
        assert_eq!(sender.0.load(Ordering::SeqCst), 1);

        // Attempt recorded
        let m = db.get_user_metrics("u1").await.unwrap().unwrap();
        assert_eq!(m.reengagement_attempts, 1);
    }

    #[tokio::test]
    async fn test_at_risk_without_mapping_goes_to_email_queue() {
        let (ctx, sender, db) = setup().await;
        seed_at_risk_user(&db, false).await;

        let report = run(&ctx, &JobScope::default()).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(sender.0.load(Ordering::SeqCst), 0);

        let queued = db
            .lease_notifications(Some(Feature::Reengagement), Some("email"), 10, Duration::minutes(5), now())
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].channel, "email");
    }

    #[tokio::test]
    async fn test_engaged_user_is_left_alone() {
        let (ctx, sender, db) = setup().await;
        let mut user = User::new("u2", "bob@acme.com", "org1");
        user.last_app_active_at = Some(now() - Duration::hours(2));
        db.upsert_user(&user).await.unwrap();
        let mut m = UserMetrics::bootstrap("u2", "org1", now());
        m.segment = Segment::Regular;
        m.overall_score = 70;
        db.upsert_user_metrics(&m).await.unwrap();

        let report = run(&ctx, &JobScope::default()).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(sender.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_attempt_cap_stops_nudges() {
        let (ctx, sender, db) = setup().await;
        seed_at_risk_user(&db, true).await;
        let mut m = db.get_user_metrics("u1").await.unwrap().unwrap();
        m.reengagement_attempts = 3;
        db.upsert_user_metrics(&m).await.unwrap();

        let report = run(&ctx, &JobScope::default()).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(sender.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fatigued_user_is_batched_not_pinged() {
        let (ctx, sender, db) = setup().await;
        seed_at_risk_user(&db, true).await;
        let mut m = db.get_user_metrics("u1").await.unwrap().unwrap();
        m.fatigue = 60;
        db.upsert_user_metrics(&m).await.unwrap();

        let report = run(&ctx, &JobScope::default()).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(sender.0.load(Ordering::SeqCst), 0);

        // Parked on the queue with a prebuilt model
        let queued = db
            .lease_notifications(Some(Feature::Reengagement), Some("slack"), 10, Duration::hours(30), now() + Duration::hours(26))
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].payload.get("model").is_some());
    }

    #[tokio::test]
    async fn test_feedback_prompt_when_due() {
        let (ctx, _, db) = setup().await;
        let mut user = User::new("u3", "cara@acme.com", "org1");
        user.last_app_active_at = Some(now() - Duration::hours(1));
        db.upsert_user(&user).await.unwrap();
        let mut m = UserMetrics::bootstrap("u3", "org1", now());
        m.notifications_since_feedback = 12;
        db.upsert_user_metrics(&m).await.unwrap();

        run(&ctx, &JobScope::default()).await.unwrap();

        let m = db.get_user_metrics("u3").await.unwrap().unwrap();
        assert_eq!(m.notifications_since_feedback, 0);
        assert!(m.last_feedback_requested_at.is_some());
        assert_eq!(db.count_in_app_notifications("u3").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_content_trigger_shapes_message() {
        let (ctx, _, db) = setup().await;
        let user = seed_at_risk_user(&db, true).await;
        let m = db.get_user_metrics("u1").await.unwrap().unwrap();

        let model = build_model(
            &ctx,
            &user,
            &m,
            &ReengagementTopic::Content(ContentTrigger::DealUpdate),
        );
        match model.body {
            MessageBody::Reengagement(r) => {
                assert_eq!(r.topic, "deal_update");
                assert!(r.headline.contains("deals moved"));
            }
            other => panic!("expected reengagement body, got {:?}", other),
        }
    }
}
