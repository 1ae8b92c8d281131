//! Deterministic insight fallback
//!
//! When the model response cannot be parsed (or no provider is configured
//! upstream), insights are derived mechanically from the request context so
//! the pipeline never stalls on the model.

use cadence_core::{Insight, InsightKind, InsightRequest};

/// Build a usable insight from the raw context, no external call.
pub fn fallback_insight(request: &InsightRequest) -> Insight {
    let context = &request.context;
    match request.kind {
        InsightKind::MeetingPrep => {
            let title = context
                .get("meeting_title")
                .and_then(|v| v.as_str())
                .unwrap_or("the meeting");
            Insight {
                summary: format!("Prep notes for {}", title),
                bullets: vec![
                    "Review the last touchpoint and open action items".to_string(),
                    "Confirm the agenda in the first five minutes".to_string(),
                ],
                suggested_action: None,
            }
        }
        InsightKind::Debrief => {
            let transcript = context
                .get("transcript")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let summary: String = transcript.chars().take(280).collect();
            let bullets = transcript
                .lines()
                .filter(|line| {
                    let lower = line.to_lowercase();
                    lower.contains("i'll") || lower.contains("next step")
                })
                .take(5)
                .map(|line| line.trim().to_string())
                .collect();
            Insight {
                summary,
                bullets,
                suggested_action: None,
            }
        }
        InsightKind::DealNudge => {
            let stage = context.get("stage").and_then(|v| v.as_str()).unwrap_or("");
            Insight {
                summary: "This deal needs a concrete next step".to_string(),
                bullets: vec![],
                suggested_action: Some(if stage.is_empty() {
                    "Schedule a check-in with the buyer".to_string()
                } else {
                    format!("Agree the exit criteria for {}", stage)
                }),
            }
        }
        InsightKind::Digest => Insight {
            summary: "Daily activity summary".to_string(),
            bullets: vec![],
            suggested_action: None,
        },
    }
}
