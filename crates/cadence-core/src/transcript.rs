//! Transcript queue worker
//!
//! Bounded per-tick worker draining the transcript fetch queue. Leasing makes
//! items invisible to sibling workers; the attempt counter (bumped on lease)
//! is the only retry signal. A second pass over a call whose transcript is
//! already ready is a no-op, so the worker is safe to re-run at any cadence.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::crm::{CallRecord, TranscriptStatus};
use crate::database::Database;
use crate::feature::{Feature, Priority};
use crate::queue::{QueuedNotification, TranscriptQueueItem};
use crate::Result;

/// Minimum transcript length that counts as a usable transcript.
pub const MIN_TRANSCRIPT_CHARS: usize = 20;

/// Items processed per tick.
pub const MAX_ITEMS_PER_TICK: i64 = 50;

/// A fetched transcript.
#[derive(Debug, Clone)]
pub struct TranscriptFetch {
    pub text: String,
    pub raw_json: Option<String>,
}

/// How a fetch failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptFetchError {
    /// Upstream answered with a non-success status.
    Http { status: u16 },
    /// The request never completed.
    Network(String),
}

impl TranscriptFetchError {
    /// Error label recorded on the queue item.
    pub fn label(&self) -> String {
        match self {
            Self::Http { status } => format!("transcription_fetch_failed_{}", status),
            Self::Network(_) => "transcription_fetch_failed_network".to_string(),
        }
    }
}

/// External transcript source.
#[async_trait]
pub trait TranscriptProvider: Send + Sync {
    async fn fetch(&self, call: &CallRecord) -> std::result::Result<TranscriptFetch, TranscriptFetchError>;
}

/// Outcome counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptTickReport {
    pub processed: usize,
    pub succeeded: usize,
    pub not_ready: usize,
    pub failed: usize,
    pub exhausted: usize,
    pub dropped: usize,
}

/// The worker itself.
pub struct TranscriptWorker {
    db: Database,
    provider: Arc<dyn TranscriptProvider>,
    clock: Arc<dyn Clock>,
    lease: Duration,
}

impl TranscriptWorker {
    pub fn new(db: Database, provider: Arc<dyn TranscriptProvider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            provider,
            clock,
            lease: Duration::minutes(5),
        }
    }

    /// Process up to [`MAX_ITEMS_PER_TICK`] leased items.
    pub async fn tick(&self) -> Result<TranscriptTickReport> {
        let now = self.clock.now();
        let items = self
            .db
            .lease_transcript_items(MAX_ITEMS_PER_TICK, self.lease, now)
            .await?;

        let mut report = TranscriptTickReport::default();
        for item in items {
            report.processed += 1;
            self.process_item(item, now, &mut report).await?;
        }

        if report.processed > 0 {
            info!(
                processed = report.processed,
                succeeded = report.succeeded,
                not_ready = report.not_ready,
                failed = report.failed,
                exhausted = report.exhausted,
                "Transcript tick complete"
            );
        }
        Ok(report)
    }

    async fn process_item(
        &self,
        item: TranscriptQueueItem,
        now: DateTime<Utc>,
        report: &mut TranscriptTickReport,
    ) -> Result<()> {
        let call = match self.db.get_call(&item.call_id).await? {
            Some(call) => call,
            None => {
                warn!(call_id = %item.call_id, "Queued transcript fetch for missing call, dropping");
                self.db.delete_transcript_item(&item.call_id).await?;
                report.dropped += 1;
                return Ok(());
            }
        };

        if call.transcript_status == TranscriptStatus::Ready {
            debug!(call_id = %call.id, "Transcript already ready, dropping queue item");
            self.db.delete_transcript_item(&item.call_id).await?;
            report.dropped += 1;
            return Ok(());
        }

        if item.attempts_exhausted() {
            warn!(
                call_id = %call.id,
                attempts = item.attempts,
                "Transcript fetch attempts exhausted"
            );
            self.db
                .set_call_transcript_status(&call.id, TranscriptStatus::Failed, now)
                .await?;
            self.db.delete_transcript_item(&item.call_id).await?;
            report.exhausted += 1;
            return Ok(());
        }

        match self.provider.fetch(&call).await {
            Ok(fetch) if fetch.text.trim().chars().count() >= MIN_TRANSCRIPT_CHARS => {
                self.db
                    .set_call_transcript(&call.id, &fetch.text, fetch.raw_json.as_deref(), now)
                    .await?;
                if let Some(meeting_id) = &call.meeting_id {
                    self.db
                        .set_meeting_transcript_status(meeting_id, TranscriptStatus::Ready)
                        .await?;
                }
                self.db.delete_transcript_item(&item.call_id).await?;
                self.enqueue_debrief(&call, now).await?;
                report.succeeded += 1;
            }
            Ok(_) => {
                debug!(call_id = %call.id, "Transcript too short, not ready yet");
                self.db
                    .record_transcript_failure(&call.id, "transcript_not_ready", self.retry_at(&item, now))
                    .await?;
                report.not_ready += 1;
            }
            Err(e) => {
                warn!(call_id = %call.id, error = %e.label(), "Transcript fetch failed");
                self.db
                    .record_transcript_failure(&call.id, &e.label(), self.retry_at(&item, now))
                    .await?;
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Linear backoff with a small deterministic jitter derived from the call
    /// id, so a burst of failures does not retry in lockstep.
    fn retry_at(&self, item: &TranscriptQueueItem, now: DateTime<Utc>) -> DateTime<Utc> {
        let jitter_secs = (item
            .call_id
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64))
            % 30) as i64;
        now + Duration::seconds(60 * item.attempts.max(1) + jitter_secs)
    }

    /// Hand the ready transcript over to the debrief pipeline, exactly once:
    /// the queue item is already gone, and a ready call never re-enters.
    async fn enqueue_debrief(&self, call: &CallRecord, now: DateTime<Utc>) -> Result<()> {
        let user_id = call.owner_user_id.clone().unwrap_or_default();
        let entity = call.meeting_id.clone().unwrap_or_else(|| call.id.clone());
        let queued = QueuedNotification::new(user_id, &call.org_id, Feature::MeetingDebrief, Priority::Normal, now)
            .with_payload(serde_json::json!({ "call_id": call.id, "entity_id": entity }))
            .with_dedupe_key(crate::feature::dedupe_key(
                Feature::MeetingDebrief,
                &call.org_id,
                call.owner_user_id.as_deref().unwrap_or(""),
                &entity,
            ));
        self.db.enqueue_notification(&queued).await?;
        info!(call_id = %call.id, entity = %entity, "Debrief dispatch enqueued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::ingest::{normalize_call_payload, process_call_event};
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// Scripted provider: pops the next response per fetch.
    struct ScriptedProvider {
        script: Mutex<Vec<std::result::Result<TranscriptFetch, TranscriptFetchError>>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<std::result::Result<TranscriptFetch, TranscriptFetchError>>) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait]
    impl TranscriptProvider for ScriptedProvider {
        async fn fetch(
            &self,
            _call: &CallRecord,
        ) -> std::result::Result<TranscriptFetch, TranscriptFetchError> {
            self.script
                .lock()
                .unwrap()
                .remove(0)
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap()
    }

    async fn seed_call(db: &Database) -> String {
        let payload = serde_json::json!({
            "call_id": "jc-1",
            "direction": "inbound",
            "recording_url": "https://r.example.com/jc-1.mp3"
        });
        let event = normalize_call_payload("call_completed", &payload).unwrap();
        let outcome = process_call_event(db, "org1", "justcall", event, now()).await.unwrap();
        outcome.call_id
    }

    fn ok_text(text: &str) -> std::result::Result<TranscriptFetch, TranscriptFetchError> {
        Ok(TranscriptFetch {
            text: text.to_string(),
            raw_json: Some("{\"segments\":[]}".to_string()),
        })
    }

    #[tokio::test]
    async fn test_retry_ladder_then_success() {
        // Three 500s, one too-short 200, then a valid 200
        let db = Database::in_memory().await.unwrap();
        let call_id = seed_call(&db).await;

        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(TranscriptFetchError::Http { status: 500 }),
            Err(TranscriptFetchError::Http { status: 500 }),
            Err(TranscriptFetchError::Http { status: 500 }),
            ok_text("too short"),
            ok_text("hello, thanks for taking the time today, let's review the proposal"),
        ]));

        let mut tick_time = now();
        for invocation in 1..=5 {
            let worker = TranscriptWorker::new(
                db.clone(),
                provider.clone(),
                Arc::new(FixedClock(tick_time)),
            );
            let report = worker.tick().await.unwrap();
            assert_eq!(report.processed, 1, "invocation {}", invocation);

            let call = db.get_call(&call_id).await.unwrap().unwrap();
            if invocation < 5 {
                assert_eq!(call.transcript_status, TranscriptStatus::Queued);
                let item = db.get_transcript_item(&call_id).await.unwrap().unwrap();
                assert_eq!(item.attempts, invocation);
                // Jump past the retry horizon for the next invocation
                tick_time = item.leased_until.unwrap() + Duration::seconds(1);
            } else {
                assert_eq!(call.transcript_status, TranscriptStatus::Ready);
            }
        }

        // Queue item gone, exactly one debrief enqueued
        assert!(db.get_transcript_item(&call_id).await.unwrap().is_none());
        let queued = db
            .lease_notifications(Some(Feature::MeetingDebrief), None, 10, Duration::minutes(5), tick_time)
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);

        let call = db.get_call(&call_id).await.unwrap().unwrap();
        assert!(call.transcript_text.unwrap().contains("review the proposal"));
        assert!(call.transcript_json.is_some());
    }

    #[tokio::test]
    async fn test_second_pass_over_ready_call_is_noop() {
        let db = Database::in_memory().await.unwrap();
        let call_id = seed_call(&db).await;
        db.set_call_transcript(&call_id, "a transcript long enough to be ready", None, now())
            .await
            .unwrap();

        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let worker = TranscriptWorker::new(db.clone(), provider, Arc::new(FixedClock(now())));
        let report = worker.tick().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.succeeded, 0);
        assert!(db.get_transcript_item(&call_id).await.unwrap().is_none());

        // No debrief from the no-op pass
        let queued = db
            .lease_notifications(Some(Feature::MeetingDebrief), None, 10, Duration::minutes(5), now())
            .await
            .unwrap();
        assert!(queued.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_item_marks_call_failed() {
        let db = Database::in_memory().await.unwrap();
        let call_id = seed_call(&db).await;

        // Burn through the attempt budget
        let mut tick_time = now();
        let responses: Vec<_> = (0..10).map(|_| Err(TranscriptFetchError::Http { status: 503 })).collect();
        let provider = Arc::new(ScriptedProvider::new(responses));
        for _ in 0..10 {
            let worker = TranscriptWorker::new(db.clone(), provider.clone(), Arc::new(FixedClock(tick_time)));
            worker.tick().await.unwrap();
            if let Some(item) = db.get_transcript_item(&call_id).await.unwrap() {
                tick_time = item.leased_until.unwrap() + Duration::seconds(1);
            }
        }

        let item = db.get_transcript_item(&call_id).await.unwrap().unwrap();
        assert_eq!(item.attempts, 10);

        // The 11th lease carries attempts past the cap: marked failed, dropped
        let worker = TranscriptWorker::new(
            db.clone(),
            Arc::new(ScriptedProvider::new(vec![])),
            Arc::new(FixedClock(tick_time)),
        );
        let report = worker.tick().await.unwrap();
        assert_eq!(report.exhausted, 1);

        let call = db.get_call(&call_id).await.unwrap().unwrap();
        assert_eq!(call.transcript_status, TranscriptStatus::Failed);
        assert!(db.get_transcript_item(&call_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_call_drops_item() {
        let db = Database::in_memory().await.unwrap();
        db.enqueue_transcript_fetch(&TranscriptQueueItem::new("ghost-call", "org1"))
            .await
            .unwrap();

        let worker = TranscriptWorker::new(
            db.clone(),
            Arc::new(ScriptedProvider::new(vec![])),
            Arc::new(FixedClock(now())),
        );
        let report = worker.tick().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(db.get_transcript_item("ghost-call").await.unwrap().is_none());
    }
}
