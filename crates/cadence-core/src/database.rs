//! Database layer for SQLite
//!
//! Owns every table the engine writes: user metrics, feature settings,
//! recipients, the sent log (whose unique index is the dedupe serialization
//! point), the notification queue, the transcript queue, telephony ingest
//! tables and the in-app mirror. CRM views (users, deals, meetings) are read
//! and appended to, never business-mutated.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration as StdDuration;
use tracing::warn;
use uuid::Uuid;

use crate::crm::{CallDirection, CallRecord, Deal, DealHealth, DealRisk, Meeting, TranscriptStatus, User};
use crate::feature::{DeliveryMethod, Feature, FeatureSettings, Recipient, SentRecord};
use crate::ingest::CallEvent;
use crate::metrics::{
    ActivityEvent, ActivityPatterns, ActivitySource, NotificationInteraction, PreferredFrequency,
    Segment, UserMetrics,
};
use crate::policy::RecentCounts;
use crate::queue::{NotificationStatus, QueuedNotification, TranscriptQueueItem};
use crate::segmentation;
use crate::{Error, Result};

/// Database configuration
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub acquire_timeout: StdDuration,
    pub idle_timeout: StdDuration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: StdDuration::from_secs(30),
            idle_timeout: StdDuration::from_secs(600),
        }
    }
}

/// Database connection and operations
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection with default config
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(path, DatabaseConfig::default()).await
    }

    /// Create a new database connection with custom config
    pub async fn with_config(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // WAL mode for concurrent dispatchers sharing the store
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout=5000").execute(&pool).await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(include_str!("../../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await?;
        sqlx::query(include_str!("../../../migrations/002_notifications.sql"))
            .execute(&self.pool)
            .await?;
        sqlx::query(include_str!("../../../migrations/003_telephony.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ==================== User Operations ====================

    pub async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, org_id, timezone, last_app_active_at,
                               last_chat_active_at, last_login_at, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                timezone = excluded.timezone,
                last_app_active_at = excluded.last_app_active_at,
                last_chat_active_at = excluded.last_chat_active_at,
                last_login_at = excluded.last_login_at,
                is_active = excluded.is_active
            "#,
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.org_id)
        .bind(&user.timezone)
        .bind(user.last_app_active_at.map(|t| t.to_rfc3339()))
        .bind(user.last_chat_active_at.map(|t| t.to_rfc3339()))
        .bind(user.last_login_at.map(|t| t.to_rfc3339()))
        .bind(user.is_active as i32)
        .bind(user.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_user).transpose()
    }

    pub async fn find_user_by_email(&self, org_id: &str, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE org_id = ? AND email = ? LIMIT 1")
            .bind(org_id)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_user).transpose()
    }

    pub async fn list_active_users(&self, org_id: &str) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM users WHERE org_id = ? AND is_active = 1 ORDER BY id")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_user).collect()
    }

    // ==================== Activity & Interactions ====================

    pub async fn insert_activity_event(&self, event: &ActivityEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_events (user_id, source, event_type, occurred_at, weekday, hour, session_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.user_id)
        .bind(event.source.as_str())
        .bind(&event.event_type)
        .bind(event.occurred_at.to_rfc3339())
        .bind(event.weekday as i32)
        .bind(event.hour as i32)
        .bind(&event.session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_activity_events(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ActivityEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM activity_events WHERE user_id = ? AND occurred_at >= ? ORDER BY occurred_at",
        )
        .bind(user_id)
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(ActivityEvent {
                    user_id: row.try_get("user_id")?,
                    source: ActivitySource::from_str(&row.try_get::<String, _>("source")?)?,
                    event_type: row.try_get("event_type")?,
                    occurred_at: parse_ts(row.try_get("occurred_at")?)?,
                    weekday: row.try_get::<i32, _>("weekday")? as u8,
                    hour: row.try_get::<i32, _>("hour")? as u8,
                    session_id: row.try_get("session_id")?,
                })
            })
            .collect()
    }

    /// Append the delivered leg of an interaction; clicks and dismissals are
    /// attributed later by message ts.
    pub async fn record_delivery_interaction(
        &self,
        user_id: &str,
        slack_ts: &str,
        delivered_at: DateTime<Utc>,
        weekday: u8,
        hour: u8,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_interactions (user_id, slack_ts, delivered_at, weekday, hour)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(slack_ts)
        .bind(delivered_at.to_rfc3339())
        .bind(weekday as i32)
        .bind(hour as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_interaction_clicked(
        &self,
        user_id: &str,
        slack_ts: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notification_interactions
            SET clicked_at = ?,
                time_to_interaction_secs = CAST(strftime('%s', ?) AS INTEGER) - CAST(strftime('%s', delivered_at) AS INTEGER)
            WHERE user_id = ? AND slack_ts = ? AND clicked_at IS NULL
            "#,
        )
        .bind(at.to_rfc3339())
        .bind(at.to_rfc3339())
        .bind(user_id)
        .bind(slack_ts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_interaction_dismissed(
        &self,
        user_id: &str,
        slack_ts: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notification_interactions
            SET dismissed_at = ?
            WHERE user_id = ? AND slack_ts = ? AND dismissed_at IS NULL
            "#,
        )
        .bind(at.to_rfc3339())
        .bind(user_id)
        .bind(slack_ts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_interactions(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<NotificationInteraction>> {
        let rows = sqlx::query(
            "SELECT * FROM notification_interactions WHERE user_id = ? ORDER BY delivered_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(NotificationInteraction {
                    user_id: row.try_get("user_id")?,
                    delivered_at: parse_ts(row.try_get("delivered_at")?)?,
                    clicked_at: parse_opt_ts(row.try_get("clicked_at")?)?,
                    dismissed_at: parse_opt_ts(row.try_get("dismissed_at")?)?,
                    time_to_interaction_secs: row.try_get("time_to_interaction_secs")?,
                    weekday: row.try_get::<i32, _>("weekday")? as u8,
                    hour: row.try_get::<i32, _>("hour")? as u8,
                })
            })
            .collect()
    }

    // ==================== User Metrics ====================

    pub async fn get_user_metrics(&self, user_id: &str) -> Result<Option<UserMetrics>> {
        let row = sqlx::query("SELECT * FROM user_metrics WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_metrics).transpose()
    }

    /// Write a metrics row, enforcing segment transition legality: an illegal
    /// transition keeps the previous segment and logs an anomaly with both
    /// values. Returns the segment actually written.
    pub async fn upsert_user_metrics(&self, metrics: &UserMetrics) -> Result<Segment> {
        let previous = self.get_user_metrics(&metrics.user_id).await?;
        let segment = match &previous {
            Some(prev) if !segmentation::can_transition(prev.segment, metrics.segment) => {
                warn!(
                    user_id = %metrics.user_id,
                    from = %prev.segment,
                    to = %metrics.segment,
                    "Illegal segment transition rejected, previous segment retained"
                );
                prev.segment
            }
            _ => metrics.segment,
        };

        sqlx::query(
            r#"
            INSERT INTO user_metrics (
                user_id, org_id, app_score, chat_score, notif_score, overall_score,
                segment, fatigue, preferred_frequency, patterns_json, avg_daily_sessions,
                notifications_since_feedback, last_feedback_requested_at,
                reengagement_attempts, last_reengagement_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                org_id = excluded.org_id,
                app_score = excluded.app_score,
                chat_score = excluded.chat_score,
                notif_score = excluded.notif_score,
                overall_score = excluded.overall_score,
                segment = excluded.segment,
                fatigue = excluded.fatigue,
                preferred_frequency = excluded.preferred_frequency,
                patterns_json = excluded.patterns_json,
                avg_daily_sessions = excluded.avg_daily_sessions,
                notifications_since_feedback = excluded.notifications_since_feedback,
                last_feedback_requested_at = excluded.last_feedback_requested_at,
                reengagement_attempts = excluded.reengagement_attempts,
                last_reengagement_at = excluded.last_reengagement_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&metrics.user_id)
        .bind(&metrics.org_id)
        .bind(metrics.app_score)
        .bind(metrics.chat_score)
        .bind(metrics.notif_score)
        .bind(metrics.overall_score)
        .bind(segment.as_str())
        .bind(metrics.fatigue)
        .bind(metrics.preferred_frequency.as_str())
        .bind(serde_json::to_string(&metrics.patterns)?)
        .bind(metrics.avg_daily_sessions)
        .bind(metrics.notifications_since_feedback)
        .bind(metrics.last_feedback_requested_at.map(|t| t.to_rfc3339()))
        .bind(metrics.reengagement_attempts)
        .bind(metrics.last_reengagement_at.map(|t| t.to_rfc3339()))
        .bind(metrics.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(segment)
    }

    pub async fn record_reengagement_attempt(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE user_metrics
            SET reengagement_attempts = reengagement_attempts + 1, last_reengagement_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(at.to_rfc3339())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn increment_notifications_since_feedback(&self, user_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE user_metrics SET notifications_since_feedback = notifications_since_feedback + 1 WHERE user_id = ?",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_feedback_requested(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE user_metrics
            SET notifications_since_feedback = 0, last_feedback_requested_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(at.to_rfc3339())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Feature Settings & Recipients ====================

    pub async fn upsert_feature_settings(&self, settings: &FeatureSettings) -> Result<()> {
        let categories_json = settings
            .enabled_categories
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO notification_feature_settings (
                org_id, feature, enabled, channel_id, delivery_method,
                schedule_timezone, thresholds_json, enabled_categories
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(org_id, feature) DO UPDATE SET
                enabled = excluded.enabled,
                channel_id = excluded.channel_id,
                delivery_method = excluded.delivery_method,
                schedule_timezone = excluded.schedule_timezone,
                thresholds_json = excluded.thresholds_json,
                enabled_categories = excluded.enabled_categories
            "#,
        )
        .bind(&settings.org_id)
        .bind(settings.feature.as_str())
        .bind(settings.enabled as i32)
        .bind(&settings.channel_id)
        .bind(settings.delivery_method.as_str())
        .bind(&settings.schedule_timezone)
        .bind(serde_json::to_string(&settings.thresholds)?)
        .bind(categories_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_feature_settings(
        &self,
        org_id: &str,
        feature: Feature,
    ) -> Result<Option<FeatureSettings>> {
        let row = sqlx::query(
            "SELECT * FROM notification_feature_settings WHERE org_id = ? AND feature = ?",
        )
        .bind(org_id)
        .bind(feature.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let categories: Option<String> = row.try_get("enabled_categories")?;
            Ok(FeatureSettings {
                org_id: row.try_get("org_id")?,
                feature: Feature::from_str(&row.try_get::<String, _>("feature")?)?,
                enabled: row.try_get::<i32, _>("enabled")? == 1,
                channel_id: row.try_get("channel_id")?,
                delivery_method: DeliveryMethod::from_str(
                    &row.try_get::<String, _>("delivery_method")?,
                )?,
                schedule_timezone: row.try_get("schedule_timezone")?,
                thresholds: serde_json::from_str(&row.try_get::<String, _>("thresholds_json")?)?,
                enabled_categories: categories.map(|c| serde_json::from_str(&c)).transpose()?,
            })
        })
        .transpose()
    }

    pub async fn orgs_with_feature_enabled(&self, feature: Feature) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT org_id FROM notification_feature_settings WHERE feature = ? AND enabled = 1 ORDER BY org_id",
        )
        .bind(feature.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn upsert_recipient(&self, recipient: &Recipient) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recipients (org_id, user_id, slack_user_id, email, name)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(org_id, user_id) DO UPDATE SET
                slack_user_id = excluded.slack_user_id,
                email = excluded.email,
                name = excluded.name
            "#,
        )
        .bind(&recipient.org_id)
        .bind(&recipient.user_id)
        .bind(&recipient.slack_user_id)
        .bind(&recipient.email)
        .bind(&recipient.name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_recipient(&self, org_id: &str, user_id: &str) -> Result<Option<Recipient>> {
        let row = sqlx::query("SELECT * FROM recipients WHERE org_id = ? AND user_id = ?")
            .bind(org_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_recipient).transpose()
    }

    pub async fn find_recipient_by_slack(
        &self,
        org_id: &str,
        slack_user_id: &str,
    ) -> Result<Option<Recipient>> {
        let row = sqlx::query("SELECT * FROM recipients WHERE org_id = ? AND slack_user_id = ?")
            .bind(org_id)
            .bind(slack_user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_recipient).transpose()
    }

    /// Users with a Slack mapping, the fan-out population for per-user jobs.
    pub async fn list_mapped_recipients(&self, org_id: &str) -> Result<Vec<Recipient>> {
        let rows = sqlx::query(
            "SELECT * FROM recipients WHERE org_id = ? AND slack_user_id IS NOT NULL ORDER BY user_id",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_recipient).collect()
    }

    // ==================== Sent Log ====================

    /// Insert a sent record. Returns `false` when the (feature, org,
    /// recipient, entity, window) slot is already taken, which is the signal
    /// a concurrent or repeated dispatch deduplicates on.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_sent(
        &self,
        feature: Feature,
        org_id: &str,
        recipient_id: &str,
        entity_id: &str,
        window_bucket: i64,
        sent_at: DateTime<Utc>,
        slack_ts: &str,
        channel_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sent_log (feature, org_id, recipient_id, entity_id, window_bucket,
                                  sent_at, slack_ts, channel_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(feature.as_str())
        .bind(org_id)
        .bind(recipient_id)
        .bind(entity_id)
        .bind(window_bucket)
        .bind(sent_at.to_rfc3339())
        .bind(slack_ts)
        .bind(channel_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db_err))
                if db_err.message().contains("UNIQUE constraint failed") =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_recent_sent(
        &self,
        feature: Feature,
        org_id: &str,
        recipient_id: &str,
        entity_id: &str,
        within: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<SentRecord>> {
        let cutoff = now - within;
        let row = sqlx::query(
            r#"
            SELECT * FROM sent_log
            WHERE feature = ? AND org_id = ? AND recipient_id = ? AND entity_id = ? AND sent_at >= ?
            ORDER BY sent_at DESC
            LIMIT 1
            "#,
        )
        .bind(feature.as_str())
        .bind(org_id)
        .bind(recipient_id)
        .bind(entity_id)
        .bind(cutoff.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_sent_record).transpose()
    }

    /// Any prior send for the key, regardless of age (indefinite windows).
    pub async fn find_any_sent(
        &self,
        feature: Feature,
        org_id: &str,
        recipient_id: &str,
        entity_id: &str,
    ) -> Result<Option<SentRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM sent_log
            WHERE feature = ? AND org_id = ? AND recipient_id = ? AND entity_id = ?
            ORDER BY sent_at DESC
            LIMIT 1
            "#,
        )
        .bind(feature.as_str())
        .bind(org_id)
        .bind(recipient_id)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_sent_record).transpose()
    }

    pub async fn count_recent(
        &self,
        recipient_id: &str,
        hour_start: DateTime<Utc>,
        day_start: DateTime<Utc>,
    ) -> Result<RecentCounts> {
        let hour: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sent_log WHERE recipient_id = ? AND sent_at >= ?",
        )
        .bind(recipient_id)
        .bind(hour_start.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        let day: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sent_log WHERE recipient_id = ? AND sent_at >= ?",
        )
        .bind(recipient_id)
        .bind(day_start.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        let last: Option<String> = sqlx::query_scalar(
            "SELECT MAX(sent_at) FROM sent_log WHERE recipient_id = ?",
        )
        .bind(recipient_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(RecentCounts {
            hour: hour as u32,
            day: day as u32,
            last_sent_at: parse_opt_ts(last)?,
        })
    }

    // ==================== Notification Queue ====================

    pub async fn enqueue_notification(&self, notification: &QueuedNotification) -> Result<String> {
        sqlx::query(
            r#"
            INSERT INTO queued_notifications (
                id, user_id, org_id, feature, priority, channel, payload_json,
                scheduled_for, status, attempts, max_attempts, leased_until,
                last_attempt_at, last_error, dedupe_key, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&notification.id)
        .bind(&notification.user_id)
        .bind(&notification.org_id)
        .bind(notification.feature.as_str())
        .bind(notification.priority.as_str())
        .bind(&notification.channel)
        .bind(serde_json::to_string(&notification.payload)?)
        .bind(notification.scheduled_for.to_rfc3339())
        .bind(notification.status.as_str())
        .bind(notification.attempts)
        .bind(notification.max_attempts)
        .bind(notification.leased_until.map(|t| t.to_rfc3339()))
        .bind(notification.last_attempt_at.map(|t| t.to_rfc3339()))
        .bind(&notification.last_error)
        .bind(&notification.dedupe_key)
        .bind(notification.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(notification.id.clone())
    }

    pub async fn get_queued_notification(&self, id: &str) -> Result<Option<QueuedNotification>> {
        let row = sqlx::query("SELECT * FROM queued_notifications WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_queued).transpose()
    }

    /// Lease due notifications: each claimed row becomes invisible to other
    /// workers until the lease expires, and its attempt counter is bumped.
    /// `channel` narrows the drain to one delivery channel (the chat drain
    /// must not consume rows an external mailer owns).
    pub async fn lease_notifications(
        &self,
        feature: Option<Feature>,
        channel: Option<&str>,
        limit: i64,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedNotification>> {
        let feature_filter = feature.map(|f| f.as_str().to_string()).unwrap_or_default();
        let channel_filter = channel.map(|c| c.to_string()).unwrap_or_default();
        let candidates: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM queued_notifications
            WHERE status IN ('pending', 'scheduled') AND scheduled_for <= ?
              AND (leased_until IS NULL OR leased_until < ?)
              AND (? = '' OR feature = ?)
              AND (? = '' OR channel = ?)
            ORDER BY scheduled_for
            LIMIT ?
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(&feature_filter)
        .bind(&feature_filter)
        .bind(&channel_filter)
        .bind(&channel_filter)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let leased_until = (now + lease).to_rfc3339();
        let mut leased = Vec::new();
        for id in candidates {
            let claimed = sqlx::query(
                r#"
                UPDATE queued_notifications
                SET leased_until = ?, attempts = attempts + 1, last_attempt_at = ?
                WHERE id = ? AND (leased_until IS NULL OR leased_until < ?)
                "#,
            )
            .bind(&leased_until)
            .bind(now.to_rfc3339())
            .bind(&id)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 1 {
                if let Some(notification) = self.get_queued_notification(&id).await? {
                    leased.push(notification);
                }
            }
        }
        Ok(leased)
    }

    /// Settle a leased notification. Terminal rows are immutable; an attempt
    /// to move one is rejected.
    pub async fn settle_notification(
        &self,
        id: &str,
        status: NotificationStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let current = self
            .get_queued_notification(id)
            .await?
            .ok_or_else(|| Error::Other(format!("Queued notification not found: {}", id)))?;

        if !current.status.can_transition_to(status) {
            return Err(Error::InvalidStatusTransition(
                current.status.as_str().to_string(),
                status.as_str().to_string(),
            ));
        }

        sqlx::query(
            "UPDATE queued_notifications SET status = ?, leased_until = NULL, last_error = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pending notifications for a user, the batching signal.
    pub async fn count_pending_notifications(&self, user_id: &str) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queued_notifications WHERE user_id = ? AND status IN ('pending', 'scheduled')",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    // ==================== Transcript Queue ====================

    pub async fn enqueue_transcript_fetch(&self, item: &TranscriptQueueItem) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO transcript_queue (
                call_id, org_id, attempts, max_attempts, priority, leased_until,
                last_attempt_at, last_error, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&item.call_id)
        .bind(&item.org_id)
        .bind(item.attempts)
        .bind(item.max_attempts)
        .bind(item.priority.as_str())
        .bind(item.leased_until.map(|t| t.to_rfc3339()))
        .bind(item.last_attempt_at.map(|t| t.to_rfc3339()))
        .bind(&item.last_error)
        .bind(item.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lease transcript items. As with the notification queue, the attempt
    /// counter is bumped on lease: every invocation over an item counts as
    /// one attempt, whatever its outcome.
    pub async fn lease_transcript_items(
        &self,
        limit: i64,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<TranscriptQueueItem>> {
        let candidates: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT call_id FROM transcript_queue
            WHERE leased_until IS NULL OR leased_until < ?
            ORDER BY created_at
            LIMIT ?
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let leased_until = (now + lease).to_rfc3339();
        let mut leased = Vec::new();
        for call_id in candidates {
            let claimed = sqlx::query(
                r#"
                UPDATE transcript_queue
                SET leased_until = ?, attempts = attempts + 1, last_attempt_at = ?
                WHERE call_id = ? AND (leased_until IS NULL OR leased_until < ?)
                "#,
            )
            .bind(&leased_until)
            .bind(now.to_rfc3339())
            .bind(&call_id)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 1 {
                if let Some(item) = self.get_transcript_item(&call_id).await? {
                    leased.push(item);
                }
            }
        }
        Ok(leased)
    }

    pub async fn get_transcript_item(&self, call_id: &str) -> Result<Option<TranscriptQueueItem>> {
        let row = sqlx::query("SELECT * FROM transcript_queue WHERE call_id = ?")
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(TranscriptQueueItem {
                call_id: row.try_get("call_id")?,
                org_id: row.try_get("org_id")?,
                attempts: row.try_get("attempts")?,
                max_attempts: row.try_get("max_attempts")?,
                priority: crate::feature::Priority::from_str(&row.try_get::<String, _>("priority")?)?,
                leased_until: parse_opt_ts(row.try_get("leased_until")?)?,
                last_attempt_at: parse_opt_ts(row.try_get("last_attempt_at")?)?,
                last_error: row.try_get("last_error")?,
                created_at: parse_ts(row.try_get("created_at")?)?,
            })
        })
        .transpose()
    }

    /// Record a failed fetch: keep the attempt count (it was bumped on
    /// lease), note the error, and hold the lease until the retry horizon.
    pub async fn record_transcript_failure(
        &self,
        call_id: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE transcript_queue
            SET last_error = ?, leased_until = ?
            WHERE call_id = ?
            "#,
        )
        .bind(error)
        .bind(retry_at.to_rfc3339())
        .bind(call_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_transcript_item(&self, call_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM transcript_queue WHERE call_id = ?")
            .bind(call_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Calls ====================

    /// Upsert a call keyed on (org, provider, external id). Returns the row
    /// and whether it was newly inserted. Re-delivery of the same event is a
    /// refresh, never a second row.
    pub async fn upsert_call(
        &self,
        org_id: &str,
        provider: &str,
        event: &CallEvent,
        now: DateTime<Utc>,
    ) -> Result<(CallRecord, bool)> {
        let existing = self.get_call_by_external(org_id, provider, &event.external_id).await?;

        match existing {
            Some(call) => {
                sqlx::query(
                    r#"
                    UPDATE calls
                    SET direction = ?, status = ?, started_at = ?, ended_at = ?,
                        duration_secs = ?, from_number = ?, to_number = ?,
                        owner_user_id = COALESCE(?, owner_user_id),
                        owner_email = COALESCE(?, owner_email),
                        recording_url = COALESCE(?, recording_url),
                        transcript_text = COALESCE(transcript_text, ?),
                        updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(event.direction.as_str())
                .bind(&event.status)
                .bind(event.started_at.map(|t| t.to_rfc3339()))
                .bind(event.ended_at.map(|t| t.to_rfc3339()))
                .bind(event.duration_secs)
                .bind(&event.from_number)
                .bind(&event.to_number)
                .bind(&event.owner_user_id)
                .bind(&event.agent_email)
                .bind(&event.recording_url)
                .bind(&event.transcript_text)
                .bind(now.to_rfc3339())
                .bind(&call.id)
                .execute(&self.pool)
                .await?;

                let refreshed = self
                    .get_call(&call.id)
                    .await?
                    .ok_or_else(|| Error::CallNotFound(call.id.clone()))?;
                Ok((refreshed, false))
            }
            None => {
                let id = Uuid::new_v4().to_string();
                let transcript_status = if event.transcript_text.is_some() {
                    TranscriptStatus::Ready
                } else {
                    TranscriptStatus::Missing
                };
                sqlx::query(
                    r#"
                    INSERT INTO calls (
                        id, org_id, provider, external_id, direction, status, started_at,
                        ended_at, duration_secs, from_number, to_number, owner_user_id,
                        owner_email, recording_url, transcript_text, transcript_json,
                        transcript_status, meeting_id, created_at, updated_at
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, NULL, ?, ?)
                    "#,
                )
                .bind(&id)
                .bind(org_id)
                .bind(provider)
                .bind(&event.external_id)
                .bind(event.direction.as_str())
                .bind(&event.status)
                .bind(event.started_at.map(|t| t.to_rfc3339()))
                .bind(event.ended_at.map(|t| t.to_rfc3339()))
                .bind(event.duration_secs)
                .bind(&event.from_number)
                .bind(&event.to_number)
                .bind(&event.owner_user_id)
                .bind(&event.agent_email)
                .bind(&event.recording_url)
                .bind(&event.transcript_text)
                .bind(transcript_status.as_str())
                .bind(now.to_rfc3339())
                .bind(now.to_rfc3339())
                .execute(&self.pool)
                .await?;

                let inserted = self
                    .get_call(&id)
                    .await?
                    .ok_or_else(|| Error::CallNotFound(id.clone()))?;
                Ok((inserted, true))
            }
        }
    }

    pub async fn get_call(&self, id: &str) -> Result<Option<CallRecord>> {
        let row = sqlx::query("SELECT * FROM calls WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_call).transpose()
    }

    pub async fn get_call_by_external(
        &self,
        org_id: &str,
        provider: &str,
        external_id: &str,
    ) -> Result<Option<CallRecord>> {
        let row = sqlx::query(
            "SELECT * FROM calls WHERE org_id = ? AND provider = ? AND external_id = ?",
        )
        .bind(org_id)
        .bind(provider)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_call).transpose()
    }

    pub async fn set_call_transcript(
        &self,
        call_id: &str,
        text: &str,
        json: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE calls
            SET transcript_text = ?, transcript_json = ?, transcript_status = 'ready', updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(text)
        .bind(json)
        .bind(now.to_rfc3339())
        .bind(call_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_call_transcript_status(
        &self,
        call_id: &str,
        status: TranscriptStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE calls SET transcript_status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now.to_rfc3339())
            .bind(call_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Communication & Outbound Activity ====================

    /// Deduped on (user, external id, source). Returns whether a row was added.
    pub async fn insert_communication_event(
        &self,
        user_id: &str,
        org_id: &str,
        external_id: &str,
        source: &str,
        event_type: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO communication_events (user_id, org_id, external_id, source, event_type, occurred_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(org_id)
        .bind(external_id)
        .bind(source)
        .bind(event_type)
        .bind(occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_communication_events(&self, external_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM communication_events WHERE external_id = ?")
                .bind(external_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn insert_outbound_activity(
        &self,
        user_id: &str,
        org_id: &str,
        outbound_type: &str,
        original_activity_id: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO outbound_activities (user_id, org_id, activity_type, outbound_type, original_activity_id, occurred_at)
            VALUES (?, ?, 'outbound', ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(org_id)
        .bind(outbound_type)
        .bind(original_activity_id)
        .bind(occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_integration_heartbeat(
        &self,
        org_id: &str,
        provider: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO integration_heartbeats (org_id, provider, last_event_at)
            VALUES (?, ?, ?)
            ON CONFLICT(org_id, provider) DO UPDATE SET last_event_at = excluded.last_event_at
            "#,
        )
        .bind(org_id)
        .bind(provider)
        .bind(at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== In-app Mirror ====================

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_in_app_notification(
        &self,
        user_id: &str,
        org_id: &str,
        category: &str,
        notif_type: &str,
        title: &str,
        message: &str,
        action_url: Option<&str>,
        metadata: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO in_app_notifications (id, user_id, org_id, category, notif_type, title,
                                              message, action_url, metadata_json, read, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(org_id)
        .bind(category)
        .bind(notif_type)
        .bind(title)
        .bind(message)
        .bind(action_url)
        .bind(serde_json::to_string(metadata)?)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn count_in_app_notifications(&self, user_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM in_app_notifications WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ==================== CRM Views ====================

    pub async fn upsert_deal(&self, deal: &Deal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deals (id, org_id, name, company, owner_user_id, stage, health, risk, clarity, amount, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                company = excluded.company,
                owner_user_id = excluded.owner_user_id,
                stage = excluded.stage,
                health = excluded.health,
                risk = excluded.risk,
                clarity = excluded.clarity,
                amount = excluded.amount,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&deal.id)
        .bind(&deal.org_id)
        .bind(&deal.name)
        .bind(&deal.company)
        .bind(&deal.owner_user_id)
        .bind(&deal.stage)
        .bind(deal.health.as_str())
        .bind(deal.risk.as_str())
        .bind(deal.clarity)
        .bind(deal.amount)
        .bind(deal.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_deal(&self, id: &str) -> Result<Option<Deal>> {
        let row = sqlx::query("SELECT * FROM deals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_deal).transpose()
    }

    pub async fn list_deals_needing_momentum(&self, org_id: &str) -> Result<Vec<Deal>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM deals
            WHERE org_id = ?
              AND (health IN ('warning', 'critical', 'stalled')
                   OR risk IN ('high', 'critical')
                   OR clarity < 50)
            ORDER BY id
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_deal).collect()
    }

    pub async fn upsert_meeting(&self, meeting: &Meeting) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO meetings (id, org_id, title, starts_at, deal_id, owner_user_id,
                                  attendees_json, has_recording, transcript_status, summary, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                starts_at = excluded.starts_at,
                deal_id = excluded.deal_id,
                owner_user_id = excluded.owner_user_id,
                attendees_json = excluded.attendees_json,
                has_recording = excluded.has_recording,
                transcript_status = excluded.transcript_status,
                summary = excluded.summary
            "#,
        )
        .bind(&meeting.id)
        .bind(&meeting.org_id)
        .bind(&meeting.title)
        .bind(meeting.starts_at.to_rfc3339())
        .bind(&meeting.deal_id)
        .bind(&meeting.owner_user_id)
        .bind(serde_json::to_string(&meeting.attendees)?)
        .bind(meeting.has_recording as i32)
        .bind(meeting.transcript_status.as_str())
        .bind(&meeting.summary)
        .bind(meeting.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_meeting(&self, id: &str) -> Result<Option<Meeting>> {
        let row = sqlx::query("SELECT * FROM meetings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_meeting).transpose()
    }

    pub async fn list_deals_for_owner(&self, org_id: &str, owner_user_id: &str) -> Result<Vec<Deal>> {
        let rows = sqlx::query(
            "SELECT * FROM deals WHERE org_id = ? AND owner_user_id = ? ORDER BY updated_at DESC",
        )
        .bind(org_id)
        .bind(owner_user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_deal).collect()
    }

    pub async fn count_deals_updated_since(&self, org_id: &str, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM deals WHERE org_id = ? AND updated_at >= ?")
                .bind(org_id)
                .bind(since.to_rfc3339())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn count_calls_logged(&self, org_id: &str, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM calls WHERE org_id = ? AND created_at >= ?")
                .bind(org_id)
                .bind(since.to_rfc3339())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn meetings_for_user_between(
        &self,
        org_id: &str,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Meeting>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM meetings
            WHERE org_id = ? AND owner_user_id = ? AND starts_at >= ? AND starts_at <= ?
            ORDER BY starts_at
            "#,
        )
        .bind(org_id)
        .bind(user_id)
        .bind(from.to_rfc3339())
        .bind(to.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_meeting).collect()
    }

    pub async fn set_meeting_transcript_status(
        &self,
        meeting_id: &str,
        status: TranscriptStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE meetings SET transcript_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(meeting_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn meetings_starting_between(
        &self,
        org_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Meeting>> {
        let rows = sqlx::query(
            "SELECT * FROM meetings WHERE org_id = ? AND starts_at >= ? AND starts_at <= ? ORDER BY starts_at",
        )
        .bind(org_id)
        .bind(from.to_rfc3339())
        .bind(to.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_meeting).collect()
    }
}

// ==================== Row Mapping ====================

fn parse_ts(value: String) -> Result<DateTime<Utc>> {
    Ok(value.parse()?)
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| v.parse().map_err(Error::from)).transpose()
}

fn row_to_user(row: sqlx::sqlite::SqliteRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        org_id: row.try_get("org_id")?,
        timezone: row.try_get("timezone")?,
        last_app_active_at: parse_opt_ts(row.try_get("last_app_active_at")?)?,
        last_chat_active_at: parse_opt_ts(row.try_get("last_chat_active_at")?)?,
        last_login_at: parse_opt_ts(row.try_get("last_login_at")?)?,
        is_active: row.try_get::<i32, _>("is_active")? == 1,
        created_at: parse_ts(row.try_get("created_at")?)?,
    })
}

fn row_to_metrics(row: sqlx::sqlite::SqliteRow) -> Result<UserMetrics> {
    let patterns: ActivityPatterns =
        serde_json::from_str(&row.try_get::<String, _>("patterns_json")?)?;
    Ok(UserMetrics {
        user_id: row.try_get("user_id")?,
        org_id: row.try_get("org_id")?,
        app_score: row.try_get("app_score")?,
        chat_score: row.try_get("chat_score")?,
        notif_score: row.try_get("notif_score")?,
        overall_score: row.try_get("overall_score")?,
        segment: Segment::from_str(&row.try_get::<String, _>("segment")?)?,
        fatigue: row.try_get("fatigue")?,
        preferred_frequency: PreferredFrequency::from_str(
            &row.try_get::<String, _>("preferred_frequency")?,
        )?,
        patterns,
        avg_daily_sessions: row.try_get("avg_daily_sessions")?,
        notifications_since_feedback: row.try_get("notifications_since_feedback")?,
        last_feedback_requested_at: parse_opt_ts(row.try_get("last_feedback_requested_at")?)?,
        reengagement_attempts: row.try_get("reengagement_attempts")?,
        last_reengagement_at: parse_opt_ts(row.try_get("last_reengagement_at")?)?,
        updated_at: parse_ts(row.try_get("updated_at")?)?,
    })
}

fn row_to_recipient(row: sqlx::sqlite::SqliteRow) -> Result<Recipient> {
    Ok(Recipient {
        org_id: row.try_get("org_id")?,
        user_id: row.try_get("user_id")?,
        slack_user_id: row.try_get("slack_user_id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
    })
}

fn row_to_sent_record(row: sqlx::sqlite::SqliteRow) -> Result<SentRecord> {
    Ok(SentRecord {
        feature: Feature::from_str(&row.try_get::<String, _>("feature")?)?,
        org_id: row.try_get("org_id")?,
        recipient_id: row.try_get("recipient_id")?,
        entity_id: row.try_get("entity_id")?,
        window_bucket: row.try_get("window_bucket")?,
        sent_at: parse_ts(row.try_get("sent_at")?)?,
        slack_ts: row.try_get("slack_ts")?,
        channel_id: row.try_get("channel_id")?,
    })
}

fn row_to_queued(row: sqlx::sqlite::SqliteRow) -> Result<QueuedNotification> {
    Ok(QueuedNotification {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        org_id: row.try_get("org_id")?,
        feature: Feature::from_str(&row.try_get::<String, _>("feature")?)?,
        priority: crate::feature::Priority::from_str(&row.try_get::<String, _>("priority")?)?,
        channel: row.try_get("channel")?,
        payload: serde_json::from_str(&row.try_get::<String, _>("payload_json")?)?,
        scheduled_for: parse_ts(row.try_get("scheduled_for")?)?,
        status: NotificationStatus::from_str(&row.try_get::<String, _>("status")?)?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        leased_until: parse_opt_ts(row.try_get("leased_until")?)?,
        last_attempt_at: parse_opt_ts(row.try_get("last_attempt_at")?)?,
        last_error: row.try_get("last_error")?,
        dedupe_key: row.try_get("dedupe_key")?,
        created_at: parse_ts(row.try_get("created_at")?)?,
    })
}

fn row_to_call(row: sqlx::sqlite::SqliteRow) -> Result<CallRecord> {
    Ok(CallRecord {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        provider: row.try_get("provider")?,
        external_id: row.try_get("external_id")?,
        direction: CallDirection::from_str(&row.try_get::<String, _>("direction")?)?,
        status: row.try_get("status")?,
        started_at: parse_opt_ts(row.try_get("started_at")?)?,
        ended_at: parse_opt_ts(row.try_get("ended_at")?)?,
        duration_secs: row.try_get("duration_secs")?,
        from_number: row.try_get("from_number")?,
        to_number: row.try_get("to_number")?,
        owner_user_id: row.try_get("owner_user_id")?,
        owner_email: row.try_get("owner_email")?,
        recording_url: row.try_get("recording_url")?,
        transcript_text: row.try_get("transcript_text")?,
        transcript_json: row.try_get("transcript_json")?,
        transcript_status: TranscriptStatus::from_str(
            &row.try_get::<String, _>("transcript_status")?,
        )?,
        meeting_id: row.try_get("meeting_id")?,
        created_at: parse_ts(row.try_get("created_at")?)?,
        updated_at: parse_ts(row.try_get("updated_at")?)?,
    })
}

fn row_to_deal(row: sqlx::sqlite::SqliteRow) -> Result<Deal> {
    Ok(Deal {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        name: row.try_get("name")?,
        company: row.try_get("company")?,
        owner_user_id: row.try_get("owner_user_id")?,
        stage: row.try_get("stage")?,
        health: DealHealth::from_str(&row.try_get::<String, _>("health")?)?,
        risk: DealRisk::from_str(&row.try_get::<String, _>("risk")?)?,
        clarity: row.try_get("clarity")?,
        amount: row.try_get("amount")?,
        updated_at: parse_ts(row.try_get("updated_at")?)?,
    })
}

fn row_to_meeting(row: sqlx::sqlite::SqliteRow) -> Result<Meeting> {
    Ok(Meeting {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        title: row.try_get("title")?,
        starts_at: parse_ts(row.try_get("starts_at")?)?,
        deal_id: row.try_get("deal_id")?,
        owner_user_id: row.try_get("owner_user_id")?,
        attendees: serde_json::from_str(&row.try_get::<String, _>("attendees_json")?)?,
        has_recording: row.try_get::<i32, _>("has_recording")? == 1,
        transcript_status: TranscriptStatus::from_str(
            &row.try_get::<String, _>("transcript_status")?,
        )?,
        summary: row.try_get("summary")?,
        created_at: parse_ts(row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn db() -> Database {
        Database::in_memory().await.unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_user_round_trip() {
        let db = db().await;
        let mut user = User::new("u1", "amy@acme.com", "org1");
        user.timezone = "America/New_York".to_string();
        user.last_app_active_at = Some(now());
        db.upsert_user(&user).await.unwrap();

        let loaded = db.get_user("u1").await.unwrap().unwrap();
        assert_eq!(loaded.email, "amy@acme.com");
        assert_eq!(loaded.timezone, "America/New_York");
        assert_eq!(loaded.last_app_active_at, Some(now()));

        let by_email = db.find_user_by_email("org1", "amy@acme.com").await.unwrap();
        assert!(by_email.is_some());
        assert!(db.find_user_by_email("org2", "amy@acme.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_metrics_round_trip_with_patterns() {
        let db = db().await;
        let mut metrics = UserMetrics::bootstrap("u1", "org1", now());
        metrics.patterns.typical_active_hours.insert(2, vec![14, 9, 15]);
        metrics.patterns.peak_hour = Some(14);
        metrics.overall_score = 72;
        db.upsert_user_metrics(&metrics).await.unwrap();

        let loaded = db.get_user_metrics("u1").await.unwrap().unwrap();
        assert_eq!(loaded.overall_score, 72);
        assert_eq!(loaded.patterns.peak_hour, Some(14));
        assert_eq!(loaded.patterns.typical_active_hours[&2], vec![14, 9, 15]);
    }

    #[tokio::test]
    async fn test_illegal_segment_transition_retains_previous() {
        let db = db().await;
        let mut metrics = UserMetrics::bootstrap("u1", "org1", now());
        metrics.segment = Segment::PowerUser;
        db.upsert_user_metrics(&metrics).await.unwrap();

        // power_user -> churned is not an allowed edge
        metrics.segment = Segment::Churned;
        metrics.overall_score = 5;
        let written = db.upsert_user_metrics(&metrics).await.unwrap();
        assert_eq!(written, Segment::PowerUser);

        let loaded = db.get_user_metrics("u1").await.unwrap().unwrap();
        assert_eq!(loaded.segment, Segment::PowerUser);
        // The rest of the row still updates
        assert_eq!(loaded.overall_score, 5);
    }

    #[tokio::test]
    async fn test_legal_segment_transition_applies() {
        let db = db().await;
        let mut metrics = UserMetrics::bootstrap("u1", "org1", now());
        metrics.segment = Segment::PowerUser;
        db.upsert_user_metrics(&metrics).await.unwrap();

        metrics.segment = Segment::Regular;
        let written = db.upsert_user_metrics(&metrics).await.unwrap();
        assert_eq!(written, Segment::Regular);
    }

    #[tokio::test]
    async fn test_record_sent_dedupes_on_window_bucket() {
        let db = db().await;
        let first = db
            .record_sent(Feature::DailyDigest, "org1", "U1", "", 42, now(), "1.0", "C1")
            .await
            .unwrap();
        assert!(first);

        let second = db
            .record_sent(Feature::DailyDigest, "org1", "U1", "", 42, now(), "2.0", "C1")
            .await
            .unwrap();
        assert!(!second);

        // A different bucket inserts fine
        let third = db
            .record_sent(Feature::DailyDigest, "org1", "U1", "", 43, now(), "3.0", "C1")
            .await
            .unwrap();
        assert!(third);
    }

    #[tokio::test]
    async fn test_count_recent() {
        let db = db().await;
        let hour_start = now() - Duration::minutes(10);
        let day_start = now() - Duration::hours(10);

        db.record_sent(Feature::MorningBrief, "org1", "U1", "", 1, now() - Duration::minutes(5), "1", "C")
            .await
            .unwrap();
        db.record_sent(Feature::DealMomentum, "org1", "U1", "d1", 2, now() - Duration::hours(2), "2", "C")
            .await
            .unwrap();
        db.record_sent(Feature::DealMomentum, "org1", "U2", "d1", 3, now(), "3", "C")
            .await
            .unwrap();

        let counts = db.count_recent("U1", hour_start, day_start).await.unwrap();
        assert_eq!(counts.hour, 1);
        assert_eq!(counts.day, 2);
        assert_eq!(counts.last_sent_at, Some(now() - Duration::minutes(5)));
    }

    #[tokio::test]
    async fn test_find_recent_sent_window() {
        let db = db().await;
        db.record_sent(Feature::DailyDigest, "org1", "U1", "", 1, now() - Duration::hours(21), "1", "C")
            .await
            .unwrap();

        let within_20h = db
            .find_recent_sent(Feature::DailyDigest, "org1", "U1", "", Duration::hours(20), now())
            .await
            .unwrap();
        assert!(within_20h.is_none());

        let within_24h = db
            .find_recent_sent(Feature::DailyDigest, "org1", "U1", "", Duration::hours(24), now())
            .await
            .unwrap();
        assert!(within_24h.is_some());
    }

    #[tokio::test]
    async fn test_queue_lease_increments_attempts_and_hides_row() {
        let db = db().await;
        let n = QueuedNotification::new("u1", "org1", Feature::MorningBrief, crate::feature::Priority::Normal, now());
        db.enqueue_notification(&n).await.unwrap();

        let leased = db
            .lease_notifications(None, None, 10, Duration::minutes(5), now())
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].attempts, 1);

        // A second lease within the lease window sees nothing
        let leased_again = db
            .lease_notifications(None, None, 10, Duration::minutes(5), now())
            .await
            .unwrap();
        assert!(leased_again.is_empty());

        // After expiry the row is visible again
        let leased_later = db
            .lease_notifications(None, None, 10, Duration::minutes(5), now() + Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(leased_later.len(), 1);
        assert_eq!(leased_later[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_queue_lease_respects_schedule_and_feature() {
        let db = db().await;
        let due = QueuedNotification::new("u1", "org1", Feature::MorningBrief, crate::feature::Priority::Normal, now());
        let future = QueuedNotification::new(
            "u2",
            "org1",
            Feature::DealMomentum,
            crate::feature::Priority::Normal,
            now() + Duration::hours(3),
        );
        db.enqueue_notification(&due).await.unwrap();
        db.enqueue_notification(&future).await.unwrap();

        let leased = db
            .lease_notifications(Some(Feature::DealMomentum), None, 10, Duration::minutes(5), now())
            .await
            .unwrap();
        assert!(leased.is_empty());

        let leased = db
            .lease_notifications(Some(Feature::MorningBrief), None, 10, Duration::minutes(5), now())
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].user_id, "u1");
    }

    #[tokio::test]
    async fn test_settle_rejects_terminal_transitions() {
        let db = db().await;
        let n = QueuedNotification::new("u1", "org1", Feature::MorningBrief, crate::feature::Priority::Normal, now());
        let id = db.enqueue_notification(&n).await.unwrap();

        db.settle_notification(&id, NotificationStatus::Sent, None).await.unwrap();

        let err = db
            .settle_notification(&id, NotificationStatus::Pending, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStatusTransition(_, _)));

        let loaded = db.get_queued_notification(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, NotificationStatus::Sent);
    }

    #[tokio::test]
    async fn test_transcript_queue_attempts_count_leases() {
        let db = db().await;
        let item = TranscriptQueueItem::new("call-1", "org1");
        assert!(db.enqueue_transcript_fetch(&item).await.unwrap());
        // Enqueueing twice is a no-op
        assert!(!db.enqueue_transcript_fetch(&item).await.unwrap());

        let leased = db
            .lease_transcript_items(50, Duration::minutes(5), now())
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].attempts, 1);

        // Leased rows are invisible to a second worker
        let leased_again = db
            .lease_transcript_items(50, Duration::minutes(5), now())
            .await
            .unwrap();
        assert!(leased_again.is_empty());

        let retry_at = now() + Duration::minutes(2);
        db.record_transcript_failure("call-1", "transcription_fetch_failed_500", retry_at)
            .await
            .unwrap();
        let item = db.get_transcript_item("call-1").await.unwrap().unwrap();
        // Failure itself does not double-count the attempt
        assert_eq!(item.attempts, 1);
        assert_eq!(item.last_error.as_deref(), Some("transcription_fetch_failed_500"));
        // The lease holds until the retry horizon
        assert_eq!(item.leased_until, Some(retry_at));

        let visible_after_retry = db
            .lease_transcript_items(50, Duration::minutes(5), retry_at + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(visible_after_retry.len(), 1);
        assert_eq!(visible_after_retry[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_communication_event_dedupe() {
        let db = db().await;
        // The same external event inserts once
        assert!(db
            .insert_communication_event("u1", "org1", "ext-1", "justcall", "call", now())
            .await
            .unwrap());
        assert!(!db
            .insert_communication_event("u1", "org1", "ext-1", "justcall", "call", now())
            .await
            .unwrap());
        assert_eq!(db.count_communication_events("ext-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_outbound_activity_dedupe() {
        let db = db().await;
        assert!(db
            .insert_outbound_activity("u1", "org1", "call", "call-1", now())
            .await
            .unwrap());
        assert!(!db
            .insert_outbound_activity("u1", "org1", "call", "call-1", now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_deal_momentum_query() {
        let db = db().await;
        let healthy = Deal {
            id: "d1".to_string(),
            org_id: "org1".to_string(),
            name: "Good deal".to_string(),
            company: "Acme".to_string(),
            owner_user_id: Some("u1".to_string()),
            stage: "proposal".to_string(),
            health: DealHealth::Healthy,
            risk: DealRisk::Low,
            clarity: 90,
            amount: None,
            updated_at: now(),
        };
        let mut stalled = healthy.clone();
        stalled.id = "d2".to_string();
        stalled.health = DealHealth::Stalled;
        let mut fuzzy = healthy.clone();
        fuzzy.id = "d3".to_string();
        fuzzy.clarity = 30;

        db.upsert_deal(&healthy).await.unwrap();
        db.upsert_deal(&stalled).await.unwrap();
        db.upsert_deal(&fuzzy).await.unwrap();

        let flagged = db.list_deals_needing_momentum("org1").await.unwrap();
        let ids: Vec<&str> = flagged.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d2", "d3"]);
    }

    #[tokio::test]
    async fn test_meetings_window_query() {
        let db = db().await;
        let meeting = Meeting {
            id: "m1".to_string(),
            org_id: "org1".to_string(),
            title: "Acme sync".to_string(),
            starts_at: now() + Duration::minutes(30),
            deal_id: None,
            owner_user_id: Some("u1".to_string()),
            attendees: vec!["amy@acme.com".to_string()],
            has_recording: false,
            transcript_status: TranscriptStatus::Missing,
            summary: None,
            created_at: now(),
        };
        db.upsert_meeting(&meeting).await.unwrap();

        let hits = db
            .meetings_starting_between("org1", now() + Duration::minutes(25), now() + Duration::minutes(35))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let misses = db
            .meetings_starting_between("org1", now() + Duration::minutes(35), now() + Duration::minutes(45))
            .await
            .unwrap();
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn test_interaction_click_attribution() {
        let db = db().await;
        db.record_delivery_interaction("u1", "111.222", now(), 2, 10).await.unwrap();

        let clicked = db
            .mark_interaction_clicked("u1", "111.222", now() + Duration::seconds(90))
            .await
            .unwrap();
        assert!(clicked);
        // Second click on the same message does not rewrite
        let clicked_again = db
            .mark_interaction_clicked("u1", "111.222", now() + Duration::seconds(300))
            .await
            .unwrap();
        assert!(!clicked_again);

        let interactions = db.list_interactions("u1", 10).await.unwrap();
        assert_eq!(interactions.len(), 1);
        assert_eq!(interactions[0].time_to_interaction_secs, Some(90));
    }

    #[tokio::test]
    async fn test_feedback_counters() {
        let db = db().await;
        let metrics = UserMetrics::bootstrap("u1", "org1", now());
        db.upsert_user_metrics(&metrics).await.unwrap();

        db.increment_notifications_since_feedback("u1").await.unwrap();
        db.increment_notifications_since_feedback("u1").await.unwrap();
        let loaded = db.get_user_metrics("u1").await.unwrap().unwrap();
        assert_eq!(loaded.notifications_since_feedback, 2);

        db.record_feedback_requested("u1", now()).await.unwrap();
        let loaded = db.get_user_metrics("u1").await.unwrap().unwrap();
        assert_eq!(loaded.notifications_since_feedback, 0);
        assert_eq!(loaded.last_feedback_requested_at, Some(now()));
    }
}
