//! Cadence Web - HTTP surface
//!
//! This crate provides the inbound interfaces:
//! - Telephony webhook ingest with two signature schemes
//! - Chat interaction ingest
//! - Authenticated cron endpoints driving the scheduled jobs

pub mod auth;
pub mod cron_api;
pub mod webhook;

use axum::{
    routing::{get, post},
    Router,
};
use cadence_core::{JobContext, TranscriptWorker};
use std::collections::HashMap;
use std::sync::Arc;

pub use auth::AuthConfig;
pub use webhook::parse_webhook_orgs;

/// Shared state behind every handler.
pub struct AppState {
    pub ctx: JobContext,
    pub auth: AuthConfig,
    /// Opaque webhook token -> org id.
    pub webhook_orgs: HashMap<String, String>,
    /// Telephony provider label used as the ingest source key.
    pub provider_name: String,
    pub transcript_worker: Option<Arc<TranscriptWorker>>,
}

impl AppState {
    pub fn new(ctx: JobContext, auth: AuthConfig) -> Self {
        Self {
            ctx,
            auth,
            webhook_orgs: HashMap::new(),
            provider_name: "justcall".to_string(),
            transcript_worker: None,
        }
    }

    pub fn with_webhook_orgs(mut self, orgs: HashMap<String, String>) -> Self {
        self.webhook_orgs = orgs;
        self
    }

    pub fn with_transcript_worker(mut self, worker: Arc<TranscriptWorker>) -> Self {
        self.transcript_worker = Some(worker);
        self
    }
}

/// Build the router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/webhook", post(webhook::telephony_webhook_handler))
        .route("/interactions", post(webhook::interaction_handler))
        .route("/cron/:feature", post(cron_api::cron_handler))
        .with_state(state)
}
