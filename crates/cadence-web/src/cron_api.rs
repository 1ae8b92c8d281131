//! Cron endpoints
//!
//! `POST /cron/:feature` with either the shared cron secret or a service
//! bearer. An optional body narrows the run to one org/user/entity, which is
//! treated as a manual trigger (dedupe bypass). Policy denials surface in
//! the JSON result, never as error statuses.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use cadence_core::jobs::{self, JobReport, JobScope};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::verify_cron;
use crate::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct CronBody {
    pub org_id: Option<String>,
    pub user_id: Option<String>,
    pub entity_id: Option<String>,
}

impl From<CronBody> for JobScope {
    fn from(body: CronBody) -> Self {
        Self {
            org_id: body.org_id,
            user_id: body.user_id,
            entity_id: body.entity_id,
        }
    }
}

/// Dispatch a cron invocation to the matching job.
pub async fn cron_handler(
    State(state): State<Arc<AppState>>,
    Path(feature): Path<String>,
    headers: HeaderMap,
    body: Option<Json<CronBody>>,
) -> impl IntoResponse {
    if !verify_cron(&headers, &state.auth) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "success": false, "error": "unauthorized" })),
        );
    }

    let scope: JobScope = body.map(|Json(b)| b.into()).unwrap_or_default();
    let manual = scope.is_manual();
    info!(feature = %feature, manual = manual, "Cron invocation");

    let result = match feature.as_str() {
        "daily_digest" => jobs::daily_digest::run(&state.ctx, &scope).await,
        "morning_brief" => jobs::morning_brief::run(&state.ctx, &scope).await,
        "meeting_prep" => jobs::meeting_prep::run(&state.ctx, &scope).await,
        "deal_momentum" => jobs::deal_momentum::run(&state.ctx, &scope).await,
        "reengagement" => jobs::reengagement::run(&state.ctx, &scope).await,
        "queue_drain" => jobs::queue_drain::run(&state.ctx, &scope).await,
        "transcript_queue" => {
            return match &state.transcript_worker {
                Some(worker) => match worker.tick().await {
                    Ok(report) => (
                        StatusCode::OK,
                        Json(serde_json::json!({ "success": true, "report": {
                            "processed": report.processed,
                            "succeeded": report.succeeded,
                            "not_ready": report.not_ready,
                            "failed": report.failed,
                            "exhausted": report.exhausted,
                        }})),
                    ),
                    Err(e) => {
                        warn!(error = %e, "Transcript tick failed");
                        (
                            StatusCode::OK,
                            Json(serde_json::json!({ "success": false, "error": e.to_string() })),
                        )
                    }
                },
                // Missing provider env disables the feature, never crashes it
                None => (
                    StatusCode::OK,
                    Json(serde_json::json!({
                        "success": true,
                        "skipped": "transcript provider not configured"
                    })),
                ),
            };
        }
        _ => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "success": false, "error": format!("unknown feature: {}", feature) })),
            )
        }
    };

    match result {
        Ok(report) => (StatusCode::OK, Json(render_report(report, manual))),
        Err(e) => {
            warn!(feature = %feature, error = %e, "Job crashed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "success": false, "error": e.to_string() })),
            )
        }
    }
}

/// Manual single-target runs get a human-readable failure when nothing went
/// out; fleet runs always report aggregate counts.
fn render_report(report: JobReport, manual: bool) -> serde_json::Value {
    if manual && report.sent == 0 {
        if let Some(reason) = report.skip_reasons.first() {
            return serde_json::json!({ "success": false, "error": reason });
        }
        if let Some(error) = report.errors.first() {
            return serde_json::json!({ "success": false, "error": error });
        }
    }
    serde_json::to_value(&report).unwrap_or_else(|_| serde_json::json!({ "success": false }))
}
