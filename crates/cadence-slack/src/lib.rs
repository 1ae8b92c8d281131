//! Cadence Slack - chat delivery for the engagement engine
//!
//! This crate provides:
//! - The Slack Web API client (chat.postMessage, conversations.open)
//! - Block Kit types and pure message-model rendering
//! - The [`cadence_core::ChannelSender`] implementation the dispatcher uses

pub mod blocks;
pub mod client;
pub mod render;

pub use blocks::{ButtonStyle, SlackBlock, SlackContextElement, SlackElement, SlackText, TextType};
pub use client::SlackClient;
pub use render::render_blocks;
