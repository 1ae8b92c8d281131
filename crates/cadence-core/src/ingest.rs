//! Telephony and chat-interaction ingest
//!
//! Shape-variable webhook payloads are parsed once into canonical values at
//! the boundary; everything downstream consumes only the canonical shape.
//! Unknown keys are preserved in `extras` for observability. Side effects are
//! ordered and idempotent so providers can redeliver freely.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use tracing::{debug, info};

use crate::clock::{hour_in_zone, weekday_in_zone};
use crate::crm::{CallDirection, TranscriptStatus};
use crate::database::Database;
use crate::queue::TranscriptQueueItem;
use crate::Result;

const CALL_FIELDS: [&str; 14] = [
    "id", "call_id", "call_sid", "direction", "call_type", "status", "start_time", "started_at",
    "end_time", "ended_at", "duration", "recording_url", "agent_email", "transcript",
];

/// Canonical call event, normalized from a provider payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    pub external_id: String,
    pub direction: CallDirection,
    pub status: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub agent_email: Option<String>,
    /// Filled by owner resolution, not by normalization.
    pub owner_user_id: Option<String>,
    pub recording_url: Option<String>,
    pub transcript_text: Option<String>,
    /// Keys the canonical shape does not model, kept for observability.
    pub extras: serde_json::Map<String, Value>,
}

/// Whether an inbound event type is a call event at all.
pub fn is_call_event(event_type: &str) -> bool {
    event_type.contains("call")
}

/// Normalize a provider payload into a [`CallEvent`]. Returns `None` when the
/// payload has no usable call identity, which callers must treat as
/// not-applicable rather than an error.
pub fn normalize_call_payload(event_type: &str, data: &Value) -> Option<CallEvent> {
    if !is_call_event(event_type) {
        return None;
    }

    let external_id = string_field(data, &["call_id", "id", "call_sid"])?;

    let direction = string_field(data, &["direction", "call_type"])
        .and_then(|d| CallDirection::from_str(&d).ok())
        .unwrap_or(CallDirection::Unknown);

    // Clamped to >= 0 and floored to whole seconds
    let duration_secs = number_field(data, &["duration", "duration_seconds"])
        .map(|d| (d.max(0.0).floor()) as i64);

    let transcript_text = string_field(data, &["transcript", "transcript_text"])
        .filter(|t| !t.trim().is_empty());

    let extras = data
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter(|(key, _)| !CALL_FIELDS.contains(&key.as_str()))
                .filter(|(key, _)| {
                    !["from", "from_number", "to", "to_number", "contact_number"]
                        .contains(&key.as_str())
                })
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
        .unwrap_or_default();

    Some(CallEvent {
        external_id,
        direction,
        status: string_field(data, &["status", "call_status"]),
        started_at: time_field(data, &["start_time", "started_at"]),
        ended_at: time_field(data, &["end_time", "ended_at"]),
        duration_secs,
        from_number: string_field(data, &["from", "from_number"]),
        to_number: string_field(data, &["to", "to_number", "contact_number"]),
        agent_email: string_field(data, &["agent_email"]),
        owner_user_id: None,
        recording_url: string_field(data, &["recording_url"]),
        transcript_text,
        extras,
    })
}

fn string_field(data: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match data.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn number_field(data: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match data.get(key) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(parsed) = s.parse::<f64>() {
                    return Some(parsed);
                }
            }
            _ => {}
        }
    }
    None
}

fn time_field(data: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    for key in keys {
        match data.get(key) {
            Some(Value::String(s)) => {
                if let Ok(t) = s.parse::<DateTime<Utc>>() {
                    return Some(t);
                }
            }
            Some(Value::Number(n)) => {
                if let Some(secs) = n.as_i64() {
                    if let Some(t) = Utc.timestamp_opt(secs, 0).single() {
                        return Some(t);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// What happened while ingesting one call event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallIngestOutcome {
    pub call_id: String,
    pub inserted: bool,
    pub transcript_enqueued: bool,
    pub communication_inserted: bool,
    pub outbound_inserted: bool,
}

/// Run the ordered, idempotent side effects for a normalized call event.
pub async fn process_call_event(
    db: &Database,
    org_id: &str,
    provider: &str,
    mut event: CallEvent,
    now: DateTime<Utc>,
) -> Result<CallIngestOutcome> {
    // 1. Owner resolution: look the agent up by email, keep the email even
    //    when org membership is missing.
    let owner = match &event.agent_email {
        Some(email) => db.find_user_by_email(org_id, email).await?,
        None => None,
    };
    event.owner_user_id = owner.as_ref().map(|u| u.id.clone());

    // 2. Upsert the call row
    let (call, inserted) = db.upsert_call(org_id, provider, &event, now).await?;

    // 3. Recording without transcript: queue a fetch
    let mut transcript_enqueued = false;
    if call.transcript_text.is_none() && call.has_recording() {
        let item = TranscriptQueueItem::new(&call.id, org_id);
        transcript_enqueued = db.enqueue_transcript_fetch(&item).await?;
        if transcript_enqueued {
            db.set_call_transcript_status(&call.id, TranscriptStatus::Queued, now).await?;
        }
    }

    // 4. Transcript already present on insert: the debrief pipeline picks the
    //    call up the same way the fetch worker would have handed it over.
    if inserted && call.transcript_text.is_some() {
        debug!(call_id = %call.id, "Transcript arrived with the webhook, skipping fetch queue");
    }

    // 5. Communication event, deduped on (user, external id, source)
    let comm_user = event.owner_user_id.clone().unwrap_or_default();
    let occurred_at = event.started_at.unwrap_or(now);
    let communication_inserted = db
        .insert_communication_event(&comm_user, org_id, &event.external_id, provider, "call", occurred_at)
        .await?;

    // 6. Outbound calls become outbound activities for the owning rep
    let mut outbound_inserted = false;
    if event.direction == CallDirection::Outbound {
        if let Some(owner_id) = &event.owner_user_id {
            outbound_inserted = db
                .insert_outbound_activity(owner_id, org_id, "call", &call.id, occurred_at)
                .await?;
        }
    }

    // 7. Heartbeat
    db.touch_integration_heartbeat(org_id, provider, now).await?;

    info!(
        call_id = %call.id,
        org_id = %org_id,
        provider = %provider,
        inserted = inserted,
        transcript_enqueued = transcript_enqueued,
        "Call event ingested"
    );

    Ok(CallIngestOutcome {
        call_id: call.id,
        inserted,
        transcript_enqueued,
        communication_inserted,
        outbound_inserted,
    })
}

/// What a user did with a delivered chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Clicked,
    Dismissed,
    Replied,
}

/// A normalized chat interaction (button click, dismissal, threaded reply).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub slack_user_id: String,
    pub kind: InteractionKind,
    pub message_ts: String,
    pub occurred_at: DateTime<Utc>,
}

/// Attribute an interaction back to the delivered notification it belongs to.
/// Unknown users or unmatched messages are ignored, not errors.
pub async fn process_interaction_event(
    db: &Database,
    org_id: &str,
    event: &InteractionEvent,
    tz: chrono_tz::Tz,
) -> Result<bool> {
    let recipient = match db.find_recipient_by_slack(org_id, &event.slack_user_id).await? {
        Some(r) => r,
        None => {
            debug!(slack_user = %event.slack_user_id, "Interaction from unmapped user ignored");
            return Ok(false);
        }
    };

    let updated = match event.kind {
        InteractionKind::Clicked | InteractionKind::Replied => {
            db.mark_interaction_clicked(&recipient.user_id, &event.message_ts, event.occurred_at)
                .await?
        }
        InteractionKind::Dismissed => {
            db.mark_interaction_dismissed(&recipient.user_id, &event.message_ts, event.occurred_at)
                .await?
        }
    };

    // A reply is chat activity in its own right
    if updated && event.kind == InteractionKind::Replied {
        db.insert_activity_event(&crate::metrics::ActivityEvent {
            user_id: recipient.user_id.clone(),
            source: crate::metrics::ActivitySource::Chat,
            event_type: "thread_reply".to_string(),
            occurred_at: event.occurred_at,
            weekday: weekday_in_zone(event.occurred_at, tz),
            hour: hour_in_zone(event.occurred_at, tz),
            session_id: None,
        })
        .await?;
    }

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_non_call_event_is_not_applicable() {
        assert!(normalize_call_payload("sms_received", &json!({"id": "x"})).is_none());
        assert!(normalize_call_payload("contact_updated", &json!({"id": "x"})).is_none());
    }

    #[test]
    fn test_call_without_identity_is_not_applicable() {
        assert!(normalize_call_payload("call_completed", &json!({"direction": "inbound"})).is_none());
    }

    #[test]
    fn test_normalize_full_payload() {
        let payload = json!({
            "call_id": "jc-123",
            "direction": "Outgoing",
            "status": "completed",
            "start_time": "2025-06-03T09:00:00+00:00",
            "end_time": "2025-06-03T09:05:30+00:00",
            "duration": 330.7,
            "from": "+15550100",
            "to": "+15550111",
            "agent_email": "amy@acme.com",
            "recording_url": "https://recordings.example.com/jc-123.mp3",
            "ivr_path": "sales"
        });
        let event = normalize_call_payload("call_completed", &payload).unwrap();
        assert_eq!(event.external_id, "jc-123");
        assert_eq!(event.direction, CallDirection::Outbound);
        assert_eq!(event.duration_secs, Some(330));
        assert_eq!(event.from_number.as_deref(), Some("+15550100"));
        assert_eq!(event.agent_email.as_deref(), Some("amy@acme.com"));
        assert!(event.transcript_text.is_none());
        // Unknown keys survive in extras
        assert_eq!(event.extras.get("ivr_path"), Some(&json!("sales")));
        assert!(!event.extras.contains_key("call_id"));
    }

    #[test]
    fn test_duration_clamped_and_floored() {
        let event = normalize_call_payload(
            "call_completed",
            &json!({"call_id": "a", "duration": -12.0}),
        )
        .unwrap();
        assert_eq!(event.duration_secs, Some(0));

        let event = normalize_call_payload(
            "call_completed",
            &json!({"call_id": "a", "duration": "47.9"}),
        )
        .unwrap();
        assert_eq!(event.duration_secs, Some(47));
    }

    #[test]
    fn test_epoch_timestamps_accepted() {
        let event = normalize_call_payload(
            "call_completed",
            &json!({"call_id": "a", "start_time": 1_748_941_200}),
        )
        .unwrap();
        assert!(event.started_at.is_some());
    }

    #[test]
    fn test_normalize_round_trips_through_store() {
        // normalize -> upsert -> read back keeps the canonical value intact
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let db = Database::in_memory().await.unwrap();
            let payload = json!({
                "call_id": "jc-9",
                "direction": "inbound",
                "status": "completed",
                "duration": 61,
                "from": "+15550100",
                "to": "+15550111",
            });
            let event = normalize_call_payload("call_completed", &payload).unwrap();
            let (call, inserted) = db.upsert_call("org1", "justcall", &event, now()).await.unwrap();
            assert!(inserted);

            let reread = db.get_call(&call.id).await.unwrap().unwrap();
            assert_eq!(reread.external_id, event.external_id);
            assert_eq!(reread.direction, event.direction);
            assert_eq!(reread.status, event.status);
            assert_eq!(reread.duration_secs, event.duration_secs);
            assert_eq!(reread.from_number, event.from_number);
            assert_eq!(reread.to_number, event.to_number);
        });
    }

    #[tokio::test]
    async fn test_process_call_event_is_idempotent() {
        // Identical redelivery yields one call row and one
        // communication event
        let db = Database::in_memory().await.unwrap();
        let mut user = crate::crm::User::new("u1", "amy@acme.com", "org1");
        user.is_active = true;
        db.upsert_user(&user).await.unwrap();

        let payload = json!({
            "call_id": "jc-77",
            "direction": "outbound",
            "duration": 120,
            "agent_email": "amy@acme.com",
            "recording_url": "https://r.example.com/jc-77.mp3"
        });
        let event = normalize_call_payload("call_completed", &payload).unwrap();

        let first = process_call_event(&db, "org1", "justcall", event.clone(), now())
            .await
            .unwrap();
        assert!(first.inserted);
        assert!(first.transcript_enqueued);
        assert!(first.communication_inserted);
        assert!(first.outbound_inserted);

        let second = process_call_event(&db, "org1", "justcall", event, now())
            .await
            .unwrap();
        assert!(!second.inserted);
        assert!(!second.transcript_enqueued);
        assert!(!second.communication_inserted);
        assert!(!second.outbound_inserted);
        assert_eq!(second.call_id, first.call_id);

        assert_eq!(db.count_communication_events("jc-77").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_owner_without_membership_keeps_email() {
        let db = Database::in_memory().await.unwrap();
        // No user provisioned for this email
        let payload = json!({
            "call_id": "jc-88",
            "direction": "inbound",
            "agent_email": "ghost@elsewhere.com"
        });
        let event = normalize_call_payload("call_completed", &payload).unwrap();
        let outcome = process_call_event(&db, "org1", "justcall", event, now()).await.unwrap();

        let call = db.get_call(&outcome.call_id).await.unwrap().unwrap();
        assert!(call.owner_user_id.is_none());
        assert_eq!(call.owner_email.as_deref(), Some("ghost@elsewhere.com"));
    }

    #[tokio::test]
    async fn test_recording_triggers_transcript_queue_and_status() {
        let db = Database::in_memory().await.unwrap();
        let payload = json!({
            "call_id": "jc-55",
            "direction": "inbound",
            "recording_url": "https://r.example.com/jc-55.mp3"
        });
        let event = normalize_call_payload("call_completed", &payload).unwrap();
        let outcome = process_call_event(&db, "org1", "justcall", event, now()).await.unwrap();

        assert!(outcome.transcript_enqueued);
        let call = db.get_call(&outcome.call_id).await.unwrap().unwrap();
        assert_eq!(call.transcript_status, TranscriptStatus::Queued);
        assert!(db.get_transcript_item(&outcome.call_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_interaction_event_attribution() {
        let db = Database::in_memory().await.unwrap();
        db.upsert_recipient(&crate::feature::Recipient {
            org_id: "org1".to_string(),
            user_id: "u1".to_string(),
            slack_user_id: Some("U99".to_string()),
            email: "amy@acme.com".to_string(),
            name: "Amy".to_string(),
        })
        .await
        .unwrap();
        db.record_delivery_interaction("u1", "500.100", now(), 2, 10).await.unwrap();

        let event = InteractionEvent {
            slack_user_id: "U99".to_string(),
            kind: InteractionKind::Clicked,
            message_ts: "500.100".to_string(),
            occurred_at: now() + chrono::Duration::seconds(45),
        };
        assert!(process_interaction_event(&db, "org1", &event, chrono_tz::UTC).await.unwrap());

        // Unmapped user is a quiet no-op
        let stranger = InteractionEvent {
            slack_user_id: "U00".to_string(),
            kind: InteractionKind::Clicked,
            message_ts: "500.100".to_string(),
            occurred_at: now(),
        };
        assert!(!process_interaction_event(&db, "org1", &stranger, chrono_tz::UTC).await.unwrap());
    }
}
