//! Message model rendering
//!
//! Pure functions from the engine's typed [`MessageModel`] to Block Kit
//! blocks. No I/O, no state; the client calls this right before posting.

use cadence_core::{MessageBody, MessageModel};

use crate::blocks::{SlackBlock, SlackElement, SlackText};

/// Render a model into the block list for chat.postMessage.
pub fn render_blocks(model: &MessageModel) -> Vec<SlackBlock> {
    let mut blocks = vec![SlackBlock::header(&model.title)];

    match &model.body {
        MessageBody::Digest(digest) => {
            blocks.push(SlackBlock::fields(vec![
                SlackText::mrkdwn(format!("*Deals in motion:* {}", digest.deals_in_motion)),
                SlackText::mrkdwn(format!("*Meetings:* {}", digest.meetings_held)),
                SlackText::mrkdwn(format!("*Calls logged:* {}", digest.calls_logged)),
            ]));
            if !digest.highlights.is_empty() {
                blocks.push(SlackBlock::Divider);
                let bullets = digest
                    .highlights
                    .iter()
                    .map(|h| format!("• {}", h))
                    .collect::<Vec<_>>()
                    .join("\n");
                blocks.push(SlackBlock::section(SlackText::mrkdwn(bullets)));
            }
            blocks.push(SlackBlock::context(digest.date_label.clone()));
        }
        MessageBody::Brief(brief) => {
            if brief.meetings.is_empty() {
                blocks.push(SlackBlock::section(SlackText::mrkdwn(
                    "No meetings on the calendar today.",
                )));
            } else {
                let lines = brief
                    .meetings
                    .iter()
                    .map(|m| format!("• *{}* at {} ({} attendees)", m.title, m.starts_at_label, m.attendee_count))
                    .collect::<Vec<_>>()
                    .join("\n");
                blocks.push(SlackBlock::section(SlackText::mrkdwn(lines)));
            }
            if !brief.focus_deals.is_empty() {
                blocks.push(SlackBlock::Divider);
                let lines = brief
                    .focus_deals
                    .iter()
                    .map(|d| format!("• *{}* ({}) — {}, {}", d.name, d.company, d.stage, d.health_label))
                    .collect::<Vec<_>>()
                    .join("\n");
                blocks.push(SlackBlock::section(SlackText::mrkdwn(lines)));
            }
        }
        MessageBody::MeetingPrep(prep) => {
            blocks.push(SlackBlock::section(SlackText::mrkdwn(format!(
                "*{}* starts in {} minutes",
                prep.meeting_title, prep.starts_in_minutes
            ))));
            if !prep.attendees.is_empty() {
                blocks.push(SlackBlock::context(format!("With: {}", prep.attendees.join(", "))));
            }
            if let Some(deal) = &prep.deal {
                blocks.push(SlackBlock::fields(vec![
                    SlackText::mrkdwn(format!("*Deal:* {} ({})", deal.name, deal.company)),
                    SlackText::mrkdwn(format!("*Stage:* {}", deal.stage)),
                ]));
            }
            if !prep.talking_points.is_empty() {
                let bullets = prep
                    .talking_points
                    .iter()
                    .map(|p| format!("• {}", p))
                    .collect::<Vec<_>>()
                    .join("\n");
                blocks.push(SlackBlock::section(SlackText::mrkdwn(bullets)));
            }
        }
        MessageBody::DealNudge(nudge) => {
            blocks.push(SlackBlock::section(SlackText::mrkdwn(format!(
                "*{}* ({}) — {}",
                nudge.deal.name, nudge.deal.company, nudge.deal.stage
            ))));
            if !nudge.reasons.is_empty() {
                let bullets = nudge
                    .reasons
                    .iter()
                    .map(|r| format!("• {}", r))
                    .collect::<Vec<_>>()
                    .join("\n");
                blocks.push(SlackBlock::section(SlackText::mrkdwn(bullets)));
            }
            blocks.push(SlackBlock::section(SlackText::mrkdwn(format!(
                "_Suggested:_ {}",
                nudge.suggested_action
            ))));
        }
        MessageBody::Debrief(debrief) => {
            blocks.push(SlackBlock::section(SlackText::mrkdwn(debrief.summary.clone())));
            if !debrief.action_items.is_empty() {
                blocks.push(SlackBlock::Divider);
                let items = debrief
                    .action_items
                    .iter()
                    .map(|i| format!("☐ {}", i))
                    .collect::<Vec<_>>()
                    .join("\n");
                blocks.push(SlackBlock::section(SlackText::mrkdwn(items)));
            }
        }
        MessageBody::Reengagement(reengagement) => {
            blocks.push(SlackBlock::section(SlackText::mrkdwn(reengagement.headline.clone())));
            for line in &reengagement.body_lines {
                blocks.push(SlackBlock::context(line.clone()));
            }
        }
    }

    if let Some(url) = &model.action_url {
        blocks.push(SlackBlock::Actions {
            elements: vec![SlackElement::link_button("Open in app", "open_app", url)],
        });
    }

    blocks
}
