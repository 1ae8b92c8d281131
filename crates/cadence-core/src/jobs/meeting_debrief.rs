//! Meeting debrief builder
//!
//! Debriefs are not cron-driven: the transcript worker enqueues one when a
//! transcript becomes ready, and the queue drain dispatches it. This module
//! owns the model construction from the transcribed call.

use crate::message::{DebriefModel, MessageBody, MessageModel};
use crate::{Error, Result};

use super::JobContext;

/// Characters of transcript handed to the heuristic summary.
const HEURISTIC_SUMMARY_CHARS: usize = 280;

pub(crate) async fn build_model(ctx: &JobContext, call_id: &str) -> Result<MessageModel> {
    let call = ctx
        .db()
        .get_call(call_id)
        .await?
        .ok_or_else(|| Error::CallNotFound(call_id.to_string()))?;

    let transcript = call
        .transcript_text
        .clone()
        .ok_or_else(|| Error::Other(format!("Call {} has no transcript", call_id)))?;

    let subject = match &call.meeting_id {
        Some(meeting_id) => ctx
            .db()
            .get_meeting(meeting_id)
            .await?
            .map(|m| m.title)
            .unwrap_or_else(|| "Call debrief".to_string()),
        None => "Call debrief".to_string(),
    };

    let (summary, action_items) = match &ctx.insight {
        Some(insight) => match insight
            .generate(crate::delivery::InsightRequest {
                kind: crate::delivery::InsightKind::Debrief,
                context: serde_json::json!({
                    "subject": subject,
                    "transcript": transcript,
                    "duration_secs": call.duration_secs,
                }),
            })
            .await
        {
            Ok(generated) => (generated.summary, generated.bullets),
            Err(_) => heuristic_debrief(&transcript),
        },
        None => heuristic_debrief(&transcript),
    };

    Ok(MessageModel::new(
        crate::feature::Feature::MeetingDebrief,
        "meeting",
        format!("Debrief: {}", subject),
        MessageBody::Debrief(DebriefModel {
            subject,
            summary,
            action_items,
        }),
    )
    .with_action_url(format!("{}/calls/{}", ctx.site_url, call.id))
    .with_metadata(serde_json::json!({ "call_id": call.id })))
}

/// Deterministic fallback when no insight provider is configured: lead with
/// the opening of the transcript, surface lines that sound like commitments.
pub(crate) fn heuristic_debrief(transcript: &str) -> (String, Vec<String>) {
    let summary: String = transcript.chars().take(HEURISTIC_SUMMARY_CHARS).collect();
    let action_items = transcript
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("i'll") || lower.contains("we will") || lower.contains("next step")
        })
        .take(5)
        .map(|line| line.trim().to_string())
        .collect();
    (summary, action_items)
}
