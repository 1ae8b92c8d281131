//! The dispatch pipeline
//!
//! For one (feature, org, recipient, entity) tuple: load settings, resolve
//! the chat mapping, dedupe, evaluate policy, build the message, deliver,
//! then record + mirror + log engagement. Policy denials and deferrals leave
//! a queued row behind so the send is reconsidered when the window opens.

use chrono::{DateTime, Duration, Utc};
use moka::future::Cache;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, error, info, warn};

use crate::clock::{hour_in_zone, parse_timezone, start_of_day, start_of_hour, weekday_in_zone, Clock};
use crate::config::EngagementConfig;
use crate::database::Database;
use crate::delivery::{ChannelSender, DeliveryTarget};
use crate::feature::{dedupe_key, DedupeWindow, DeliveryMethod, Feature, Priority};
use crate::message::MessageModel;
use crate::metrics::UserMetrics;
use crate::mirror;
use crate::policy::{self, DenyReason, PolicyDecision};
use crate::queue::QueuedNotification;
use crate::{Error, Result};

/// Why a dispatch was skipped. Never an error: skipping is a correct outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    FeatureDisabled,
    NoMapping,
    Deduped,
    Deferred { until: DateTime<Utc> },
    Policy { reason: DenyReason, next_allowed_at: DateTime<Utc> },
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FeatureDisabled => "feature_disabled",
            Self::NoMapping => "no_mapping",
            Self::Deduped => "deduped",
            Self::Deferred { .. } => "deferred",
            Self::Policy { reason, .. } => reason.as_str(),
        }
    }
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Delivered { ts: String, channel_id: String },
    Skipped(SkipReason),
    Failed { error: String, retryable: bool },
}

/// One dispatch to run.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub feature: Feature,
    pub org_id: String,
    pub user_id: String,
    pub entity_id: Option<String>,
    pub priority: Priority,
    /// Admin-triggered runs bypass dedupe.
    pub manual: bool,
}

impl DispatchRequest {
    pub fn new(
        feature: Feature,
        org_id: impl Into<String>,
        user_id: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            feature,
            org_id: org_id.into(),
            user_id: user_id.into(),
            entity_id: None,
            priority,
            manual: false,
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }
}

/// The dispatcher. Cheap to clone; the metrics cache and channel sender are
/// shared.
#[derive(Clone)]
pub struct Dispatcher {
    db: Database,
    config: EngagementConfig,
    sender: Arc<dyn ChannelSender>,
    clock: Arc<dyn Clock>,
    metrics_cache: Cache<String, UserMetrics>,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        config: EngagementConfig,
        sender: Arc<dyn ChannelSender>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let metrics_cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(StdDuration::from_secs(3600))
            .build();
        Self {
            db,
            config,
            sender,
            clock,
            metrics_cache,
        }
    }

    pub fn config(&self) -> &EngagementConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Metrics with a 1h TTL cache in front; a user without a row gets a
    /// bootstrap value (not persisted).
    pub async fn load_metrics(&self, user_id: &str, org_id: &str) -> Result<UserMetrics> {
        if let Some(cached) = self.metrics_cache.get(&user_id.to_string()).await {
            return Ok(cached);
        }
        let metrics = match self.db.get_user_metrics(user_id).await? {
            Some(m) => m,
            None => UserMetrics::bootstrap(user_id, org_id, self.clock.now()),
        };
        self.metrics_cache.insert(user_id.to_string(), metrics.clone()).await;
        Ok(metrics)
    }

    /// Metric writes must call this so the cache never serves stale rows.
    pub async fn invalidate_metrics(&self, user_id: &str) {
        self.metrics_cache.invalidate(&user_id.to_string()).await;
    }

    /// Run the full pipeline for one candidate delivery.
    pub async fn dispatch<F, Fut>(&self, request: DispatchRequest, build_model: F) -> Result<DispatchOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MessageModel>> + Send,
    {
        let now = self.clock.now();
        let entity_id = request.entity_id.clone().unwrap_or_default();

        // 1. Feature settings gate
        let settings = match self.db.get_feature_settings(&request.org_id, request.feature).await? {
            Some(s) if s.enabled => s,
            _ => return Ok(DispatchOutcome::Skipped(SkipReason::FeatureDisabled)),
        };

        // 2. Resolve the delivery target
        let (target, recipient_key) = match settings.delivery_method {
            DeliveryMethod::Channel => match &settings.channel_id {
                Some(channel) => (
                    DeliveryTarget::Channel { channel_id: channel.clone() },
                    format!("channel:{}", channel),
                ),
                None => return Ok(DispatchOutcome::Skipped(SkipReason::NoMapping)),
            },
            DeliveryMethod::Dm => {
                let mapping = self
                    .db
                    .get_recipient(&request.org_id, &request.user_id)
                    .await?
                    .and_then(|r| r.slack_user_id);
                match mapping {
                    Some(slack_user_id) => (
                        DeliveryTarget::Dm { slack_user_id: slack_user_id.clone() },
                        slack_user_id,
                    ),
                    None => return Ok(DispatchOutcome::Skipped(SkipReason::NoMapping)),
                }
            }
        };

        let user = self.db.get_user(&request.user_id).await?;
        let tz = parse_timezone(
            user.as_ref()
                .map(|u| u.timezone.as_str())
                .unwrap_or(settings.schedule_timezone.as_str()),
        );

        // 4 (early). Metrics drive both the dedupe window and the policy gate.
        let metrics = self.load_metrics(&request.user_id, &request.org_id).await?;
        let window = self.dedupe_window(request.feature, request.priority, &metrics, &settings);

        // 3. Dedupe probe (skipped for manual runs)
        if !request.manual {
            let recent = match window {
                DedupeWindow::Indefinite => {
                    self.db
                        .find_any_sent(request.feature, &request.org_id, &recipient_key, &entity_id)
                        .await?
                }
                DedupeWindow::Duration(d) => {
                    self.db
                        .find_recent_sent(request.feature, &request.org_id, &recipient_key, &entity_id, d, now)
                        .await?
                }
            };
            if recent.is_some() {
                debug!(
                    feature = %request.feature,
                    org_id = %request.org_id,
                    user_id = %request.user_id,
                    "Dispatch deduped"
                );
                return Ok(DispatchOutcome::Skipped(SkipReason::Deduped));
            }
        }

        // 5. Policy gate
        let counts = self
            .db
            .count_recent(&recipient_key, start_of_hour(now), start_of_day(now, tz))
            .await?;
        let decision = policy::evaluate(&self.config, &metrics, request.priority, tz, counts, now);

        let priority = match decision {
            PolicyDecision::SendNow { priority } => priority,
            PolicyDecision::Defer { until, .. } => {
                if !request.manual {
                    self.queue_for_later(&request, &entity_id, until).await?;
                }
                return Ok(DispatchOutcome::Skipped(SkipReason::Deferred { until }));
            }
            PolicyDecision::Deny { reason, next_allowed_at } => {
                if !request.manual {
                    self.queue_for_later(&request, &entity_id, next_allowed_at).await?;
                }
                return Ok(DispatchOutcome::Skipped(SkipReason::Policy { reason, next_allowed_at }));
            }
        };

        // 6+7. Assemble the typed model; rendering happens in the sender.
        let model = build_model().await?;

        // 8. Deliver
        let receipt = match self.sender.deliver(&target, &model).await {
            Ok(receipt) => receipt,
            Err(Error::Delivery { message, retryable }) => {
                warn!(
                    feature = %request.feature,
                    org_id = %request.org_id,
                    retryable = retryable,
                    error = %message,
                    "Chat delivery failed"
                );
                return Ok(DispatchOutcome::Failed { error: message, retryable });
            }
            Err(e) => {
                return Ok(DispatchOutcome::Failed {
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                })
            }
        };

        // 9. Record; a lost insert race means another dispatch won the window.
        let recorded = self
            .record_sent_with_retry(&request, &recipient_key, &entity_id, window.bucket(now), now, &receipt.ts, &receipt.channel_id)
            .await;
        if let Some(false) = recorded {
            return Ok(DispatchOutcome::Skipped(SkipReason::Deduped));
        }

        // In-app mirror is best-effort
        mirror::mirror_to_in_app(&self.db, &request.user_id, &request.org_id, &model, now).await;

        // Engagement log feeds fatigue and the feedback gate
        if !request.user_id.is_empty() {
            let weekday = weekday_in_zone(now, tz);
            let hour = hour_in_zone(now, tz);
            if let Err(e) = self
                .db
                .record_delivery_interaction(&request.user_id, &receipt.ts, now, weekday, hour)
                .await
            {
                warn!(error = %e, "Failed to log delivery interaction");
            }
            if let Err(e) = self.db.increment_notifications_since_feedback(&request.user_id).await {
                warn!(error = %e, "Failed to bump feedback counter");
            }
        }

        info!(
            feature = %request.feature,
            org_id = %request.org_id,
            user_id = %request.user_id,
            priority = %priority,
            ts = %receipt.ts,
            "Dispatch delivered"
        );
        Ok(DispatchOutcome::Delivered {
            ts: receipt.ts,
            channel_id: receipt.channel_id,
        })
    }

    fn dedupe_window(
        &self,
        feature: Feature,
        priority: Priority,
        metrics: &UserMetrics,
        settings: &crate::feature::FeatureSettings,
    ) -> DedupeWindow {
        if let Some(window) = feature.dedupe_window_override() {
            return window;
        }
        // Momentum nudges dedupe per deal over a settings-tunable horizon
        if feature == Feature::DealMomentum {
            let cooldown_days = settings
                .thresholds
                .get("cooldown_days")
                .and_then(|v| v.as_f64())
                .unwrap_or(3.0);
            return DedupeWindow::Duration(Duration::seconds((cooldown_days * 86_400.0) as i64));
        }
        let fatigue_multiplier = self
            .config
            .fatigue
            .cooldown_multiplier(metrics.fatigue_level(&self.config));
        let segment_multiplier = self.config.segment_cooldown_multiplier(metrics.segment);
        let minutes = self.config.priority_override(priority).cooldown_minutes as f64
            * fatigue_multiplier
            * segment_multiplier;
        DedupeWindow::Duration(Duration::seconds((minutes * 60.0).round().max(60.0) as i64))
    }

    async fn queue_for_later(
        &self,
        request: &DispatchRequest,
        entity_id: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Result<()> {
        let key = dedupe_key(request.feature, &request.org_id, &request.user_id, entity_id);
        let mut queued = QueuedNotification::new(
            &request.user_id,
            &request.org_id,
            request.feature,
            request.priority,
            scheduled_for,
        )
        .with_dedupe_key(key)
        .scheduled();
        if !entity_id.is_empty() {
            queued.payload = serde_json::json!({ "entity_id": entity_id });
        }
        self.db.enqueue_notification(&queued).await?;
        debug!(
            feature = %request.feature,
            user_id = %request.user_id,
            scheduled_for = %scheduled_for,
            "Queued for reconsideration"
        );
        Ok(())
    }

    /// The record write after a successful delivery is retried with backoff:
    /// an acknowledged external send must end up recorded. Returns
    /// `Some(false)` when the unique slot was taken by a concurrent dispatch,
    /// `None` when recording ultimately failed (flagged, still a success).
    #[allow(clippy::too_many_arguments)]
    async fn record_sent_with_retry(
        &self,
        request: &DispatchRequest,
        recipient_key: &str,
        entity_id: &str,
        bucket: i64,
        now: DateTime<Utc>,
        ts: &str,
        channel_id: &str,
    ) -> Option<bool> {
        for attempt in 0..3u32 {
            match self
                .db
                .record_sent(request.feature, &request.org_id, recipient_key, entity_id, bucket, now, ts, channel_id)
                .await
            {
                Ok(inserted) => return Some(inserted),
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "record_sent failed after delivery"
                    );
                    tokio::time::sleep(StdDuration::from_secs(1 << attempt)).await;
                }
            }
        }
        error!(
            feature = %request.feature,
            org_id = %request.org_id,
            recipient = %recipient_key,
            slack_ts = %ts,
            "sent_unrecorded: delivery acknowledged but never recorded, needs reconciliation"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::crm::User;
    use crate::delivery::DeliveryReceipt;
    use crate::feature::{FeatureSettings, Recipient};
    use crate::message::{BriefModel, MessageBody};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubSender {
        sent: AtomicUsize,
        fail_with: Mutex<Option<(String, bool)>>,
    }

    impl StubSender {
        fn new() -> Self {
            Self {
                sent: AtomicUsize::new(0),
                fail_with: Mutex::new(None),
            }
        }

        fn fail(&self, message: &str, retryable: bool) {
            *self.fail_with.lock().unwrap() = Some((message.to_string(), retryable));
        }

        fn sent_count(&self) -> usize {
            self.sent.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChannelSender for StubSender {
        async fn deliver(&self, target: &DeliveryTarget, _model: &MessageModel) -> Result<DeliveryReceipt> {
            if let Some((message, retryable)) = self.fail_with.lock().unwrap().clone() {
                return Err(Error::Delivery { message, retryable });
            }
            let n = self.sent.fetch_add(1, Ordering::SeqCst);
            let channel_id = match target {
                DeliveryTarget::Dm { slack_user_id } => format!("D-{}", slack_user_id),
                DeliveryTarget::Channel { channel_id } => channel_id.clone(),
            };
            Ok(DeliveryReceipt {
                ts: format!("171700000{}.000100", n),
                channel_id,
            })
        }
    }

    fn tuesday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 3, 12, 0, 0).unwrap()
    }

    fn brief_model() -> MessageModel {
        MessageModel::new(
            Feature::MorningBrief,
            "brief",
            "Good morning",
            MessageBody::Brief(BriefModel {
                greeting_name: "Amy".to_string(),
                meetings: vec![],
                focus_deals: vec![],
            }),
        )
    }

    async fn setup() -> (Dispatcher, Arc<StubSender>, Database) {
        let db = Database::in_memory().await.unwrap();
        let sender = Arc::new(StubSender::new());
        let dispatcher = Dispatcher::new(
            db.clone(),
            EngagementConfig::default(),
            sender.clone(),
            Arc::new(FixedClock(tuesday_noon())),
        );

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
        db.upsert_feature_settings(&FeatureSettings::new("org1", Feature::MorningBrief))
            .await
            .unwrap();

        (dispatcher, sender, db)
    }

    #[tokio::test]
    async fn test_disabled_feature_skips() {
        let (dispatcher, sender, db) = setup().await;
        let mut settings = FeatureSettings::new("org1", Feature::MorningBrief);
        settings.enabled = false;
        db.upsert_feature_settings(&settings).await.unwrap();

        let outcome = dispatcher
            .dispatch(
                DispatchRequest::new(Feature::MorningBrief, "org1", "u1", Priority::Normal),
                || async { Ok(brief_model()) },
            )
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::FeatureDisabled));
        assert_eq!(sender.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_settings_means_disabled() {
        let (dispatcher, _, _) = setup().await;
        let outcome = dispatcher
            .dispatch(
                DispatchRequest::new(Feature::DealMomentum, "org1", "u1", Priority::Normal),
                || async { Ok(brief_model()) },
            )
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::FeatureDisabled));
    }

    #[tokio::test]
    async fn test_missing_mapping_skips() {
        let (dispatcher, sender, db) = setup().await;
        db.upsert_recipient(&Recipient {
            org_id: "org1".to_string(),
            user_id: "u1".to_string(),
            slack_user_id: None,
            email: "amy@acme.com".to_string(),
            name: "Amy".to_string(),
        })
        .await
        .unwrap();

        let outcome = dispatcher
            .dispatch(
                DispatchRequest::new(Feature::MorningBrief, "org1", "u1", Priority::Normal),
                || async { Ok(brief_model()) },
            )
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped(SkipReason::NoMapping));
        assert_eq!(sender.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_delivery_records_mirrors_and_logs() {
        let (dispatcher, sender, db) = setup().await;

        let outcome = dispatcher
            .dispatch(
                DispatchRequest::new(Feature::MorningBrief, "org1", "u1", Priority::Normal),
                || async { Ok(brief_model()) },
            )
            .await
            .unwrap();

        match outcome {
            DispatchOutcome::Delivered { channel_id, .. } => assert_eq!(channel_id, "D-U1"),
            other => panic!("expected delivery, got {:?}", other),
        }
        assert_eq!(sender.sent_count(), 1);
        assert_eq!(db.count_in_app_notifications("u1").await.unwrap(), 1);
        let interactions = db.list_interactions("u1", 10).await.unwrap();
        assert_eq!(interactions.len(), 1);
    }

    #[tokio::test]
    async fn test_second_dispatch_in_window_dedupes() {
        let (dispatcher, sender, _) = setup().await;
        let request = DispatchRequest::new(Feature::MorningBrief, "org1", "u1", Priority::Normal);

        let first = dispatcher.dispatch(request.clone(), || async { Ok(brief_model()) }).await.unwrap();
        assert!(matches!(first, DispatchOutcome::Delivered { .. }));

        let second = dispatcher.dispatch(request, || async { Ok(brief_model()) }).await.unwrap();
        assert_eq!(second, DispatchOutcome::Skipped(SkipReason::Deduped));
        assert_eq!(sender.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_manual_dispatch_bypasses_dedupe() {
        let (dispatcher, sender, _) = setup().await;
        let request = DispatchRequest::new(Feature::MorningBrief, "org1", "u1", Priority::Normal);

        dispatcher.dispatch(request.clone(), || async { Ok(brief_model()) }).await.unwrap();
        let rerun = dispatcher
            .dispatch(request.manual(), || async { Ok(brief_model()) })
            .await
            .unwrap();
        // Manual skips the probe; the insert itself still loses the window
        // slot, so the rerun reports deduped after delivering.
        assert_eq!(rerun, DispatchOutcome::Skipped(SkipReason::Deduped));
        assert_eq!(sender.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_policy_deny_queues_for_reconsideration() {
        let (dispatcher, sender, db) = setup().await;
        // Fill the hour: moderate frequency allows 2/hour
        db.record_sent(Feature::DealMomentum, "org1", "U1", "a", 1, tuesday_noon(), "1", "C").await.unwrap();
        db.record_sent(Feature::DealMomentum, "org1", "U1", "b", 2, tuesday_noon(), "2", "C").await.unwrap();

        let outcome = dispatcher
            .dispatch(
                DispatchRequest::new(Feature::MorningBrief, "org1", "u1", Priority::Normal),
                || async { Ok(brief_model()) },
            )
            .await
            .unwrap();

        match outcome {
            DispatchOutcome::Skipped(SkipReason::Policy { reason, next_allowed_at }) => {
                assert_eq!(reason, DenyReason::HourlyLimit);
                assert_eq!(next_allowed_at, Utc.with_ymd_and_hms(2025, 6, 3, 13, 0, 0).unwrap());
            }
            other => panic!("expected policy deny, got {:?}", other),
        }
        assert_eq!(sender.sent_count(), 0);

        // A reconsideration row exists at the deny horizon
        let queued = db
            .lease_notifications(None, None, 10, Duration::minutes(5), Utc.with_ymd_and_hms(2025, 6, 3, 13, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].feature, Feature::MorningBrief);
    }

    #[tokio::test]
    async fn test_transient_failure_reports_retryable() {
        let (dispatcher, sender, _) = setup().await;
        sender.fail("ratelimited", true);

        let outcome = dispatcher
            .dispatch(
                DispatchRequest::new(Feature::MorningBrief, "org1", "u1", Priority::Normal),
                || async { Ok(brief_model()) },
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Failed {
                error: "ratelimited".to_string(),
                retryable: true
            }
        );
    }

    #[tokio::test]
    async fn test_channel_delivery_uses_configured_channel() {
        let (dispatcher, _, db) = setup().await;
        db.upsert_feature_settings(
            &FeatureSettings::new("org1", Feature::DailyDigest).with_channel("C-SALES"),
        )
        .await
        .unwrap();

        let outcome = dispatcher
            .dispatch(
                DispatchRequest::new(Feature::DailyDigest, "org1", "u1", Priority::Normal),
                || async { Ok(brief_model()) },
            )
            .await
            .unwrap();
        match outcome {
            DispatchOutcome::Delivered { channel_id, .. } => assert_eq!(channel_id, "C-SALES"),
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_critical_fatigue_still_delivers_first_send() {
        let (dispatcher, sender, db) = setup().await;
        let mut metrics = UserMetrics::bootstrap("u1", "org1", tuesday_noon());
        metrics.fatigue = 80;
        db.upsert_user_metrics(&metrics).await.unwrap();
        dispatcher.invalidate_metrics("u1").await;

        // Downgraded to low under critical fatigue, but the first send of the
        // hour goes out.
        let outcome = dispatcher
            .dispatch(
                DispatchRequest::new(Feature::MorningBrief, "org1", "u1", Priority::Normal),
                || async { Ok(brief_model()) },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Delivered { .. }));
        assert_eq!(sender.sent_count(), 1);
    }
}
