//! Meeting prep job
//!
//! Fires for meetings starting 25 to 35 minutes from now, one prep message
//! per meeting ever (indefinite dedupe on the meeting id). Talking points
//! come from the insight provider when configured, otherwise from a
//! deterministic summary of the linked deal.

use chrono::Duration;
use tracing::info;

use super::{for_each_org, orgs_for, unit_error, JobContext, JobReport, JobScope};
use crate::crm::Meeting;
use crate::dispatcher::DispatchRequest;
use crate::feature::{Feature, Priority};
use crate::message::{DealLine, MeetingPrepModel, MessageBody, MessageModel};
use crate::Result;

const WINDOW_START_MINUTES: i64 = 25;
const WINDOW_END_MINUTES: i64 = 35;

pub async fn run(ctx: &JobContext, scope: &JobScope) -> Result<JobReport> {
    let orgs = orgs_for(ctx, Feature::MeetingPrep, scope).await?;
    info!(orgs = orgs.len(), "Meeting prep fan-out");
    let report = for_each_org(ctx, &orgs, |org| run_org(ctx, org, scope)).await;
    Ok(report.finish())
}

async fn run_org(ctx: &JobContext, org_id: &str, scope: &JobScope) -> JobReport {
    let mut report = JobReport::default();
    let now = ctx.clock.now();
    let window_start = now + Duration::minutes(WINDOW_START_MINUTES);
    let window_end = now + Duration::minutes(WINDOW_END_MINUTES);

    let meetings = match ctx
        .db()
        .meetings_starting_between(org_id, window_start, window_end)
        .await
    {
        Ok(m) => m,
        Err(e) => {
            unit_error(&mut report, org_id, e);
            return report;
        }
    };

    for meeting in meetings {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if !scope.matches_entity(&meeting.id) {
            continue;
        }
        let owner = match &meeting.owner_user_id {
            Some(owner) => owner.clone(),
            None => {
                report.skipped += 1;
                continue;
            }
        };

        let mut request = DispatchRequest::new(Feature::MeetingPrep, org_id, &owner, Priority::High)
            .with_entity(&meeting.id);
        if scope.is_manual() {
            request = request.manual();
        }

        let meeting_for_model = meeting.clone();
        let outcome = ctx
            .dispatcher
            .dispatch(request, || build_model(ctx, meeting_for_model))
            .await;
        match outcome {
            Ok(outcome) => report.absorb_outcome(&outcome),
            Err(e) => unit_error(&mut report, &meeting.id, e),
        }
    }
    report
}

pub(crate) async fn build_model(ctx: &JobContext, meeting: Meeting) -> Result<MessageModel> {
    let now = ctx.clock.now();
    let starts_in_minutes = (meeting.starts_at - now).num_minutes().max(0);

    let deal = match &meeting.deal_id {
        Some(deal_id) => ctx.db().get_deal(deal_id).await?.map(|d| DealLine {
            name: d.name,
            company: d.company,
            stage: d.stage,
            health_label: d.health.as_str().to_string(),
        }),
        None => None,
    };

    let mut talking_points = Vec::new();
    if let Some(insight) = &ctx.insight {
        if let Ok(generated) = insight
            .generate(crate::delivery::InsightRequest {
                kind: crate::delivery::InsightKind::MeetingPrep,
                context: serde_json::json!({
                    "meeting_title": meeting.title,
                    "attendees": meeting.attendees,
                    "deal": deal,
                }),
            })
            .await
        {
            talking_points = generated.bullets;
        }
    }
    if talking_points.is_empty() {
        if let Some(deal) = &deal {
            talking_points.push(format!("{} is in {}", deal.name, deal.stage));
            talking_points.push(format!("Deal health: {}", deal.health_label));
        }
        talking_points.push("Review the last touchpoint before joining".to_string());
    }

    Ok(MessageModel::new(
        Feature::MeetingPrep,
        "meeting",
        format!("Prep: {}", meeting.title),
        MessageBody::MeetingPrep(MeetingPrepModel {
            meeting_title: meeting.title.clone(),
            starts_in_minutes,
            attendees: meeting.attendees.clone(),
            deal,
            talking_points,
        }),
    )
    .with_action_url(format!("{}/meetings/{}", ctx.site_url, meeting.id))
    .with_metadata(serde_json::json!({ "meeting_id": meeting.id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::EngagementConfig;
    use crate::crm::{TranscriptStatus, User};
    use crate::database::Database;
    use crate::delivery::{ChannelSender, DeliveryReceipt, DeliveryTarget};
    use crate::dispatcher::Dispatcher;
    use crate::feature::{FeatureSettings, Recipient};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSender(AtomicUsize);

    #[async_trait]
    impl ChannelSender for CountingSender {
        async fn deliver(&self, _target: &DeliveryTarget, _model: &MessageModel) -> Result<DeliveryReceipt> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(DeliveryReceipt {
                ts: format!("300.{}", n),
                channel_id: "D1".to_string(),
            })
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap()
    }

    fn meeting_at(starts_at: DateTime<Utc>) -> Meeting {
        Meeting {
            id: "m1".to_string(),
            org_id: "org1".to_string(),
            title: "Acme demo".to_string(),
            starts_at,
            deal_id: None,
            owner_user_id: Some("u1".to_string()),
            attendees: vec!["amy@acme.com".to_string()],
            has_recording: false,
            transcript_status: TranscriptStatus::Missing,
            summary: None,
            created_at: now(),
        }
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

        db.upsert_feature_settings(&FeatureSettings::new("org1", Feature::MeetingPrep))
            .await
            .unwrap();
        db.upsert_user(&User::new("u1", "amy@acme.com", "org1")).await.unwrap();
        db.upsert_recipient(&Recipient {
            org_id: "org1".to_string(),
            user_id: "u1".to_string(),
            slack_user_id: Some("U1".to_string()),
            email: "amy@acme.com".to_string(),
            name: "Amy".to_string(),
        })
        .await
        .unwrap();
        (ctx, sender, db)
    }

    #[tokio::test]
    async fn test_meeting_inside_window_gets_prep() {
        let (ctx, sender, db) = setup().await;
        db.upsert_meeting(&meeting_at(now() + Duration::minutes(30))).await.unwrap();

        let report = run(&ctx, &JobScope::default()).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(sender.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_meeting_outside_window_is_ignored() {
        let (ctx, sender, db) = setup().await;
        db.upsert_meeting(&meeting_at(now() + Duration::minutes(50))).await.unwrap();
        db.upsert_meeting(&{
            let mut m = meeting_at(now() + Duration::minutes(10));
            m.id = "m2".to_string();
            m
        })
        .await
        .unwrap();

        let report = run(&ctx, &JobScope::default()).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(sender.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_prep_never_repeats_for_a_meeting() {
        let (ctx, sender, db) = setup().await;
        db.upsert_meeting(&meeting_at(now() + Duration::minutes(30))).await.unwrap();

        run(&ctx, &JobScope::default()).await.unwrap();
        // The meeting drifts (still inside a later window) but the prep for
        // its id already went out.
        let later = now() + Duration::minutes(4);
        let dispatcher = Dispatcher::new(
            db.clone(),
            EngagementConfig::default(),
            sender.clone(),
            Arc::new(FixedClock(later)),
        );
        let ctx2 = JobContext::new(dispatcher, Arc::new(FixedClock(later)));
        let second = run(&ctx2, &JobScope::default()).await.unwrap();
        assert_eq!(second.sent, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(sender.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prep_model_includes_deal_talking_points() {
        let (ctx, _, db) = setup().await;
        db.upsert_deal(&crate::crm::Deal {
            id: "d1".to_string(),
            org_id: "org1".to_string(),
            name: "Acme expansion".to_string(),
            company: "Acme".to_string(),
            owner_user_id: Some("u1".to_string()),
            stage: "negotiation".to_string(),
            health: crate::crm::DealHealth::Warning,
            risk: crate::crm::DealRisk::Medium,
            clarity: 70,
            amount: None,
            updated_at: now(),
        })
        .await
        .unwrap();
        let mut meeting = meeting_at(now() + Duration::minutes(30));
        meeting.deal_id = Some("d1".to_string());

        let model = build_model(&ctx, meeting).await.unwrap();
        match model.body {
            MessageBody::MeetingPrep(prep) => {
                assert_eq!(prep.starts_in_minutes, 30);
                assert!(prep.deal.is_some());
                assert!(prep.talking_points.iter().any(|p| p.contains("negotiation")));
            }
            other => panic!("expected prep body, got {:?}", other),
        }
    }
}
