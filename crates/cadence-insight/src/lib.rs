//! Cadence Insight - structured content generation
//!
//! This crate provides the [`cadence_core::InsightProvider`] implementation:
//! an HTTP client for the insight model plus a deterministic heuristic used
//! whenever the model's output cannot be parsed.

pub mod client;
pub mod heuristic;

pub use client::{parse_insight, InsightClient};
pub use heuristic::fallback_insight;
