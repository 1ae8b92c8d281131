//! Typed message models
//!
//! The dispatcher assembles one of these from CRM context; rendering into
//! chat blocks is a pure function that lives with the channel client. The
//! plain-text form doubles as the chat fallback text and the in-app mirror
//! body.

use serde::{Deserialize, Serialize};

use crate::feature::Feature;

/// One line about a meeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingLine {
    pub title: String,
    pub starts_at_label: String,
    pub attendee_count: usize,
}

/// One line about a deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealLine {
    pub name: String,
    pub company: String,
    pub stage: String,
    pub health_label: String,
}

/// Org-wide end-of-day digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestModel {
    pub org_name: String,
    pub date_label: String,
    pub deals_in_motion: usize,
    pub meetings_held: usize,
    pub calls_logged: usize,
    pub highlights: Vec<String>,
}

/// Per-user morning brief.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BriefModel {
    pub greeting_name: String,
    pub meetings: Vec<MeetingLine>,
    pub focus_deals: Vec<DealLine>,
}

/// Pre-meeting prep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingPrepModel {
    pub meeting_title: String,
    pub starts_in_minutes: i64,
    pub attendees: Vec<String>,
    pub deal: Option<DealLine>,
    pub talking_points: Vec<String>,
}

/// Deal momentum nudge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealNudgeModel {
    pub deal: DealLine,
    pub reasons: Vec<String>,
    pub suggested_action: String,
}

/// Post-meeting debrief.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebriefModel {
    pub subject: String,
    pub summary: String,
    pub action_items: Vec<String>,
}

/// Re-engagement nudge for an inactive user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReengagementModel {
    pub headline: String,
    pub body_lines: Vec<String>,
    pub topic: String,
}

/// Per-feature typed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Digest(DigestModel),
    Brief(BriefModel),
    MeetingPrep(MeetingPrepModel),
    DealNudge(DealNudgeModel),
    Debrief(DebriefModel),
    Reengagement(ReengagementModel),
}

/// A renderable, channel-neutral message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageModel {
    pub feature: Feature,
    pub category: String,
    pub title: String,
    pub body: MessageBody,
    pub action_url: Option<String>,
    pub metadata: serde_json::Value,
}

impl MessageModel {
    pub fn new(feature: Feature, category: impl Into<String>, title: impl Into<String>, body: MessageBody) -> Self {
        Self {
            feature,
            category: category.into(),
            title: title.into(),
            body,
            action_url: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_action_url(mut self, url: impl Into<String>) -> Self {
        self.action_url = Some(url.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Plain-text rendering: the chat fallback text and the in-app body.
    pub fn plain_text(&self) -> String {
        let mut lines = vec![self.title.clone()];
        match &self.body {
            MessageBody::Digest(d) => {
                lines.push(format!(
                    "{}: {} deals in motion, {} meetings, {} calls logged",
                    d.date_label, d.deals_in_motion, d.meetings_held, d.calls_logged
                ));
                lines.extend(d.highlights.iter().cloned());
            }
            MessageBody::Brief(b) => {
                if b.meetings.is_empty() {
                    lines.push("No meetings on the calendar today.".to_string());
                } else {
                    for m in &b.meetings {
                        lines.push(format!("{} at {} ({} attendees)", m.title, m.starts_at_label, m.attendee_count));
                    }
                }
                for d in &b.focus_deals {
                    lines.push(format!("{} ({}) - {}, {}", d.name, d.company, d.stage, d.health_label));
                }
            }
            MessageBody::MeetingPrep(p) => {
                lines.push(format!("{} starts in {} minutes", p.meeting_title, p.starts_in_minutes));
                if !p.attendees.is_empty() {
                    lines.push(format!("With: {}", p.attendees.join(", ")));
                }
                lines.extend(p.talking_points.iter().cloned());
            }
            MessageBody::DealNudge(n) => {
                lines.push(format!("{} ({}) needs attention", n.deal.name, n.deal.company));
                lines.extend(n.reasons.iter().cloned());
                lines.push(n.suggested_action.clone());
            }
            MessageBody::Debrief(d) => {
                lines.push(d.summary.clone());
                lines.extend(d.action_items.iter().map(|item| format!("- {}", item)));
            }
            MessageBody::Reengagement(r) => {
                lines.push(r.headline.clone());
                lines.extend(r.body_lines.iter().cloned());
            }
        }
        lines.join("\n")
    }
}
