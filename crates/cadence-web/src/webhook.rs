//! Telephony webhook receiver
//!
//! Verifies one of two signature schemes, normalizes the payload into a
//! canonical call event and runs the idempotent ingest pipeline. Business
//! no-ops (non-call events, payloads without a call identity) return 2xx so
//! providers do not build retry storms.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use cadence_core::{ingest, InteractionEvent, InteractionKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::{
    has_service_bearer, timestamp_fresh, verify_proxy_signature, verify_provider_signature,
};
use crate::AppState;

/// Query string for the webhook endpoint.
#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    pub token: Option<String>,
}

/// Webhook response
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl WebhookResponse {
    fn ok(call_id: Option<String>) -> Self {
        Self {
            status: "ok".to_string(),
            ignored: None,
            reason: None,
            call_id,
        }
    }

    fn ignored(reason: &str) -> Self {
        Self {
            status: "ok".to_string(),
            ignored: Some(true),
            reason: Some(reason.to_string()),
            call_id: None,
        }
    }

    fn error(reason: &str) -> Self {
        Self {
            status: "error".to_string(),
            ignored: None,
            reason: Some(reason.to_string()),
            call_id: None,
        }
    }
}

/// Telephony webhook handler.
pub async fn telephony_webhook_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let now = state.ctx.clock.now();

    // Resolve the org behind the opaque token
    let org_id = match query.token.as_deref().and_then(|t| state.webhook_orgs.get(t)) {
        Some(org) => org.clone(),
        None => {
            warn!("Webhook with missing or unknown token");
            return (
                StatusCode::UNAUTHORIZED,
                Json(WebhookResponse::error("Unknown webhook token")),
            );
        }
    };

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Webhook payload is not JSON");
            return (
                StatusCode::BAD_REQUEST,
                Json(WebhookResponse::error("Invalid JSON payload")),
            );
        }
    };
    let event_type = payload
        .get("type")
        .or_else(|| payload.get("event"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    // Either auth mode is sufficient; both enforce the replay window.
    let proxy_ts = headers
        .get("x-use60-timestamp")
        .and_then(|v| v.to_str().ok());
    let proxy_sig = headers
        .get("x-use60-signature")
        .and_then(|v| v.to_str().ok());
    let provider_ts = headers
        .get("x-justcall-request-timestamp")
        .and_then(|v| v.to_str().ok());
    let provider_sig = headers
        .get("x-justcall-signature")
        .and_then(|v| v.to_str().ok());

    let authorized = if let (Some(ts), Some(sig)) = (proxy_ts, proxy_sig) {
        if !fresh(ts, now) {
            return stale_response();
        }
        has_service_bearer(&headers, &state.auth)
            && state
                .auth
                .proxy_secret
                .as_deref()
                .map(|secret| verify_proxy_signature(secret, ts, &body, sig))
                .unwrap_or(false)
    } else if let (Some(ts), Some(sig)) = (provider_ts, provider_sig) {
        if !fresh(ts, now) {
            return stale_response();
        }
        state
            .auth
            .provider_secret
            .as_deref()
            .map(|secret| {
                verify_provider_signature(secret, &state.auth.webhook_url, &event_type, ts, sig)
            })
            .unwrap_or(false)
    } else {
        false
    };

    if !authorized {
        warn!(org_id = %org_id, "Webhook signature verification failed");
        return (
            StatusCode::UNAUTHORIZED,
            Json(WebhookResponse::error("Invalid signature")),
        );
    }

    // Business-level applicability after auth
    if !ingest::is_call_event(&event_type) {
        return (
            StatusCode::OK,
            Json(WebhookResponse::ignored("not_applicable")),
        );
    }

    let data = payload.get("data").unwrap_or(&payload);
    let event = match ingest::normalize_call_payload(&event_type, data) {
        Some(event) => event,
        None => {
            return (
                StatusCode::OK,
                Json(WebhookResponse::ignored("no_call_identity")),
            )
        }
    };

    match ingest::process_call_event(state.ctx.db(), &org_id, &state.provider_name, event, now).await
    {
        Ok(outcome) => {
            info!(
                org_id = %org_id,
                call_id = %outcome.call_id,
                inserted = outcome.inserted,
                "Webhook processed"
            );
            (StatusCode::OK, Json(WebhookResponse::ok(Some(outcome.call_id))))
        }
        Err(e) => {
            warn!(org_id = %org_id, error = %e, "Webhook ingest failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(WebhookResponse::error("Ingest failed")),
            )
        }
    }
}

fn fresh(ts: &str, now: chrono::DateTime<chrono::Utc>) -> bool {
    ts.parse::<i64>().map(|secs| timestamp_fresh(secs, now)).unwrap_or(false)
}

fn stale_response() -> (StatusCode, Json<WebhookResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(WebhookResponse::error("Stale webhook timestamp")),
    )
}

/// Chat interaction payload after the chat platform's envelope is unwrapped.
#[derive(Debug, Deserialize)]
pub struct InteractionBody {
    pub org_id: String,
    pub slack_user_id: String,
    pub kind: InteractionKind,
    pub message_ts: String,
}

/// Chat interaction handler (button clicks, dismissals, thread replies).
/// Uses the proxy signature scheme.
pub async fn interaction_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let now = state.ctx.clock.now();

    let ts = headers
        .get("x-use60-timestamp")
        .and_then(|v| v.to_str().ok());
    let sig = headers
        .get("x-use60-signature")
        .and_then(|v| v.to_str().ok());
    let authorized = match (ts, sig) {
        (Some(ts), Some(sig)) => {
            if !fresh(ts, now) {
                return stale_response();
            }
            state
                .auth
                .proxy_secret
                .as_deref()
                .map(|secret| verify_proxy_signature(secret, ts, &body, sig))
                .unwrap_or(false)
        }
        _ => false,
    };
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(WebhookResponse::error("Invalid signature")),
        );
    }

    let interaction: InteractionBody = match serde_json::from_slice(&body) {
        Ok(i) => i,
        Err(e) => {
            warn!(error = %e, "Interaction payload malformed");
            return (
                StatusCode::BAD_REQUEST,
                Json(WebhookResponse::error("Invalid JSON payload")),
            );
        }
    };

    let event = InteractionEvent {
        slack_user_id: interaction.slack_user_id,
        kind: interaction.kind,
        message_ts: interaction.message_ts,
        occurred_at: now,
    };
    match ingest::process_interaction_event(state.ctx.db(), &interaction.org_id, &event, chrono_tz::UTC)
        .await
    {
        Ok(true) => (StatusCode::OK, Json(WebhookResponse::ok(None))),
        Ok(false) => (
            StatusCode::OK,
            Json(WebhookResponse::ignored("no_matching_delivery")),
        ),
        Err(e) => {
            warn!(error = %e, "Interaction ingest failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(WebhookResponse::error("Ingest failed")),
            )
        }
    }
}

/// Build the webhook org map from `token=org,token=org` env syntax.
pub fn parse_webhook_orgs(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (token, org) = pair.split_once('=')?;
            let token = token.trim();
            let org = org.trim();
            (!token.is_empty() && !org.is_empty()).then(|| (token.to_string(), org.to_string()))
        })
        .collect()
}
