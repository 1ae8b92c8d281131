//! Slack Block Kit types
//!
//! Just enough of the block model to render engine messages. Serialization
//! matches the chat.postMessage wire format.

use serde::{Deserialize, Serialize};

/// Slack message block types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlackBlock {
    Section {
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<SlackText>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fields: Option<Vec<SlackText>>,
    },
    Divider,
    Context {
        elements: Vec<SlackContextElement>,
    },
    Header {
        text: SlackText,
    },
    Actions {
        elements: Vec<SlackElement>,
    },
}

impl SlackBlock {
    pub fn section(text: SlackText) -> Self {
        Self::Section {
            text: Some(text),
            fields: None,
        }
    }

    pub fn fields(fields: Vec<SlackText>) -> Self {
        Self::Section {
            text: None,
            fields: Some(fields),
        }
    }

    pub fn header(text: impl Into<String>) -> Self {
        Self::Header {
            text: SlackText::plain(text),
        }
    }

    pub fn context(text: impl Into<String>) -> Self {
        Self::Context {
            elements: vec![SlackContextElement::Mrkdwn { text: text.into() }],
        }
    }
}

/// Slack text object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackText {
    #[serde(rename = "type")]
    pub text_type: TextType,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emoji: Option<bool>,
}

impl SlackText {
    pub fn mrkdwn(text: impl Into<String>) -> Self {
        Self {
            text_type: TextType::Mrkdwn,
            text: text.into(),
            emoji: None,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text_type: TextType::PlainText,
            text: text.into(),
            emoji: Some(true),
        }
    }
}

/// Text type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TextType {
    PlainText,
    Mrkdwn,
}

/// Interactive elements
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlackElement {
    Button {
        text: SlackText,
        action_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        style: Option<ButtonStyle>,
    },
}

impl SlackElement {
    pub fn link_button(label: impl Into<String>, action_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::Button {
            text: SlackText::plain(label),
            action_id: action_id.into(),
            value: None,
            url: Some(url.into()),
            style: None,
        }
    }
}

/// Button style
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ButtonStyle {
    Primary,
    Danger,
}

/// Context element
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlackContextElement {
    Mrkdwn { text: String },
    PlainText { text: String, emoji: Option<bool> },
}
