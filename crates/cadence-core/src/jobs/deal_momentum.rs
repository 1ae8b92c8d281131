//! Deal momentum job
//!
//! Nudges deal owners when a deal's health, risk or next-step clarity slips.
//! Deduped per deal over a settings-tunable cooldown (default 3 days) so a
//! struggling deal does not nag daily.

use tracing::info;

use super::{for_each_org, orgs_for, unit_error, JobContext, JobReport, JobScope};
use crate::crm::Deal;
use crate::dispatcher::DispatchRequest;
use crate::feature::{Feature, Priority};
use crate::message::{DealLine, DealNudgeModel, MessageBody, MessageModel};
use crate::Result;

pub async fn run(ctx: &JobContext, scope: &JobScope) -> Result<JobReport> {
    let orgs = orgs_for(ctx, Feature::DealMomentum, scope).await?;
    info!(orgs = orgs.len(), "Deal momentum fan-out");
    let report = for_each_org(ctx, &orgs, |org| run_org(ctx, org, scope)).await;
    Ok(report.finish())
}

async fn run_org(ctx: &JobContext, org_id: &str, scope: &JobScope) -> JobReport {
    let mut report = JobReport::default();
    let deals = match ctx.db().list_deals_needing_momentum(org_id).await {
        Ok(d) => d,
        Err(e) => {
            unit_error(&mut report, org_id, e);
            return report;
        }
    };

    for deal in deals {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if !scope.matches_entity(&deal.id) {
            continue;
        }
        let owner = match &deal.owner_user_id {
            Some(owner) => owner.clone(),
            None => {
                report.skipped += 1;
                continue;
            }
        };
        if !scope.matches_user(&owner) {
            continue;
        }

        let mut request = DispatchRequest::new(Feature::DealMomentum, org_id, &owner, Priority::Normal)
            .with_entity(&deal.id);
        if scope.is_manual() {
            request = request.manual();
        }

        let deal_for_model = deal.clone();
        let outcome = ctx
            .dispatcher
            .dispatch(request, || build_model(ctx, deal_for_model))
            .await;
        match outcome {
            Ok(outcome) => report.absorb_outcome(&outcome),
            Err(e) => unit_error(&mut report, &deal.id, e),
        }
    }
    report
}

pub(crate) async fn build_model(ctx: &JobContext, deal: Deal) -> Result<MessageModel> {
    let mut reasons = Vec::new();
    if matches!(
        deal.health,
        crate::crm::DealHealth::Warning | crate::crm::DealHealth::Critical | crate::crm::DealHealth::Stalled
    ) {
        reasons.push(format!("Health is {}", deal.health.as_str()));
    }
    if matches!(deal.risk, crate::crm::DealRisk::High | crate::crm::DealRisk::Critical) {
        reasons.push(format!("Risk is {}", deal.risk.as_str()));
    }
    if deal.clarity < 50 {
        reasons.push(format!("Next step clarity at {}%", deal.clarity));
    }

    let mut suggested_action = format!("Book a next step with {}", deal.company);
    if let Some(insight) = &ctx.insight {
        if let Ok(generated) = insight
            .generate(crate::delivery::InsightRequest {
                kind: crate::delivery::InsightKind::DealNudge,
                context: serde_json::json!({
                    "deal_name": deal.name,
                    "stage": deal.stage,
                    "health": deal.health.as_str(),
                    "risk": deal.risk.as_str(),
                    "clarity": deal.clarity,
                }),
            })
            .await
        {
            if let Some(action) = generated.suggested_action {
                suggested_action = action;
            }
        }
    }

    Ok(MessageModel::new(
        Feature::DealMomentum,
        "deal",
        format!("{} is losing momentum", deal.name),
        MessageBody::DealNudge(DealNudgeModel {
            deal: DealLine {
                name: deal.name.clone(),
                company: deal.company.clone(),
                stage: deal.stage.clone(),
                health_label: deal.health.as_str().to_string(),
            },
            reasons,
            suggested_action,
        }),
    )
    .with_action_url(format!("{}/deals/{}", ctx.site_url, deal.id))
    .with_metadata(serde_json::json!({ "deal_id": deal.id })))
}
