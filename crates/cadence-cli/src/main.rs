//! Cadence CLI

use anyhow::Result;
use async_trait::async_trait;
use cadence_core::{
    jobs, CallRecord, Database, Dispatcher, EngagementConfig, JobContext, JobScope, SystemClock,
    TranscriptFetch, TranscriptFetchError, TranscriptProvider, TranscriptWorker,
};
use cadence_insight::InsightClient;
use cadence_slack::SlackClient;
use cadence_web::{parse_webhook_orgs, AppState, AuthConfig};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Initialize logging with the specified verbosity level
fn init_logging(verbose: u8, quiet: bool, json: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env().add_directive(format!("cadence={}", level).parse()?);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 1);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Proactive engagement engine for the sales CRM")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database path
    #[arg(long, env = "CADENCE_DB_PATH", default_value = "cadence.db", global = true)]
    db: String,

    /// Verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    /// JSON log output
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (webhooks + cron endpoints)
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "CADENCE_PORT", default_value = "8080")]
        port: u16,
    },
    /// Run one scheduled job immediately
    RunJob {
        /// Feature key (daily_digest, morning_brief, meeting_prep,
        /// deal_momentum, reengagement, queue_drain)
        feature: String,
        /// Narrow to one org (manual trigger, dedupe bypass)
        #[arg(long)]
        org: Option<String>,
        /// Narrow to one user
        #[arg(long)]
        user: Option<String>,
        /// Narrow to one entity (meeting, deal)
        #[arg(long)]
        entity: Option<String>,
    },
    /// Run one transcript worker tick
    TranscriptTick,
}

/// Environment-derived settings. Missing optional pieces disable the
/// corresponding surface instead of crashing.
struct Settings {
    slack_bot_token: Option<String>,
    insight_api_key: Option<String>,
    cron_secret: Option<String>,
    service_token: Option<String>,
    proxy_secret: Option<String>,
    provider_secret: Option<String>,
    webhook_url: String,
    webhook_org_tokens: String,
    site_url: String,
    transcript_api_url: Option<String>,
    transcript_api_key: Option<String>,
}

impl Settings {
    fn from_env() -> Self {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            slack_bot_token: env("SLACK_BOT_TOKEN"),
            insight_api_key: env("INSIGHT_API_KEY"),
            cron_secret: env("CRON_SECRET"),
            service_token: env("SERVICE_ROLE_TOKEN"),
            proxy_secret: env("WEBHOOK_PROXY_SECRET"),
            provider_secret: env("JUSTCALL_WEBHOOK_SECRET"),
            webhook_url: env("WEBHOOK_PUBLIC_URL").unwrap_or_default(),
            webhook_org_tokens: env("WEBHOOK_ORG_TOKENS").unwrap_or_default(),
            site_url: env("SITE_URL").unwrap_or_else(|| "http://localhost:3000".to_string()),
            transcript_api_url: env("TRANSCRIPT_API_URL"),
            transcript_api_key: env("TRANSCRIPT_API_KEY"),
        }
    }
}

/// Transcript fetches against the telephony provider's REST API.
struct HttpTranscriptProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpTranscriptProvider {
    fn new(base_url: String, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            base_url,
            api_key,
            client,
        }
    }
}

#[async_trait]
impl TranscriptProvider for HttpTranscriptProvider {
    async fn fetch(&self, call: &CallRecord) -> std::result::Result<TranscriptFetch, TranscriptFetchError> {
        let url = format!("{}/calls/{}/transcript", self.base_url, call.external_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| TranscriptFetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TranscriptFetchError::Http {
                status: status.as_u16(),
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TranscriptFetchError::Network(e.to_string()))?;
        let text = body
            .get("transcript")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(TranscriptFetch {
            raw_json: Some(body.to_string()),
            text,
        })
    }
}

async fn build_context(db_path: &str, settings: &Settings) -> Result<Option<JobContext>> {
    let bot_token = match &settings.slack_bot_token {
        Some(token) => token.clone(),
        None => {
            // No chat credentials: every delivery-facing feature is off
            warn!("SLACK_BOT_TOKEN not set, delivery features disabled");
            return Ok(None);
        }
    };

    let db = Database::new(db_path).await?;
    let clock = Arc::new(SystemClock);
    let sender = Arc::new(SlackClient::new(bot_token));
    let dispatcher = Dispatcher::new(db, EngagementConfig::default(), sender, clock.clone());

    let mut ctx = JobContext::new(dispatcher, clock);
    ctx.site_url = settings.site_url.clone();
    if let Some(api_key) = &settings.insight_api_key {
        ctx = ctx.with_insight(Arc::new(InsightClient::new(api_key.clone())));
    } else {
        info!("INSIGHT_API_KEY not set, using deterministic content only");
    }
    Ok(Some(ctx))
}

fn transcript_worker(ctx: &JobContext, settings: &Settings) -> Option<Arc<TranscriptWorker>> {
    match (&settings.transcript_api_url, &settings.transcript_api_key) {
        (Some(url), Some(key)) => {
            let provider = Arc::new(HttpTranscriptProvider::new(url.clone(), key.clone()));
            Some(Arc::new(TranscriptWorker::new(
                ctx.db().clone(),
                provider,
                ctx.clock.clone(),
            )))
        }
        _ => {
            info!("Transcript provider env not set, transcript queue disabled");
            None
        }
    }
}

async fn serve(port: u16, db_path: &str, settings: Settings) -> Result<()> {
    let ctx = match build_context(db_path, &settings).await? {
        Some(ctx) => ctx,
        None => return Ok(()),
    };

    // Ctrl-C cancels in-flight job fan-outs and stops the listener
    let cancel = tokio_util::sync::CancellationToken::new();
    let ctx = ctx.with_cancel(cancel.clone());
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    let worker = transcript_worker(&ctx, &settings);
    let auth = AuthConfig {
        cron_secret: settings.cron_secret.clone(),
        service_token: settings.service_token.clone(),
        proxy_secret: settings.proxy_secret.clone(),
        provider_secret: settings.provider_secret.clone(),
        webhook_url: settings.webhook_url.clone(),
    };
    if auth.cron_secret.is_none() && auth.service_token.is_none() {
        warn!("Neither CRON_SECRET nor SERVICE_ROLE_TOKEN set, cron endpoints will reject everything");
    }

    let mut state = AppState::new(ctx, auth)
        .with_webhook_orgs(parse_webhook_orgs(&settings.webhook_org_tokens));
    if let Some(worker) = worker {
        state = state.with_transcript_worker(worker);
    }

    let router = cadence_web::create_router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port = port, "Cadence listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn run_job(
    feature: &str,
    db_path: &str,
    settings: Settings,
    scope: JobScope,
) -> Result<()> {
    let ctx = match build_context(db_path, &settings).await? {
        Some(ctx) => ctx,
        None => return Ok(()),
    };

    let report = match feature {
        "daily_digest" => jobs::daily_digest::run(&ctx, &scope).await,
        "morning_brief" => jobs::morning_brief::run(&ctx, &scope).await,
        "meeting_prep" => jobs::meeting_prep::run(&ctx, &scope).await,
        "deal_momentum" => jobs::deal_momentum::run(&ctx, &scope).await,
        "reengagement" => jobs::reengagement::run(&ctx, &scope).await,
        "queue_drain" => jobs::queue_drain::run(&ctx, &scope).await,
        other => {
            error!(feature = %other, "Unknown feature");
            return Ok(());
        }
    };

    match report {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Err(e) => error!(error = %e, "Job failed"),
    }
    Ok(())
}

async fn transcript_tick(db_path: &str, settings: Settings) -> Result<()> {
    let ctx = match build_context(db_path, &settings).await? {
        Some(ctx) => ctx,
        None => return Ok(()),
    };
    match transcript_worker(&ctx, &settings) {
        Some(worker) => {
            let report = worker.tick().await?;
            info!(
                processed = report.processed,
                succeeded = report.succeeded,
                failed = report.failed,
                "Transcript tick done"
            );
        }
        None => info!("Transcript worker not configured, nothing to do"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.json)?;

    let settings = Settings::from_env();

    match cli.command {
        Commands::Serve { port } => serve(port, &cli.db, settings).await,
        Commands::RunJob {
            feature,
            org,
            user,
            entity,
        } => {
            let scope = JobScope {
                org_id: org,
                user_id: user,
                entity_id: entity,
            };
            run_job(&feature, &cli.db, settings, scope).await
        }
        Commands::TranscriptTick => transcript_tick(&cli.db, settings).await,
    }
}
