//! Cadence Core - Engagement decision and dispatch pipeline
//!
//! This crate provides the engine behind proactive CRM notifications:
//! - Engagement scoring, segmentation and fatigue tracking
//! - The delivery policy gate (limits, cooldowns, optimal send times)
//! - The dispatch pipeline with at-most-once delivery per dedupe window
//! - Scheduled jobs (digest, brief, meeting prep, deal momentum, re-engagement)
//! - Telephony ingest normalization and the transcript fetch worker
//! - The SQLite store that owns all engine state

pub mod clock;
pub mod config;
pub mod crm;
pub mod database;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod feature;
pub mod ingest;
pub mod jobs;
pub mod message;
pub mod metrics;
pub mod mirror;
pub mod policy;
pub mod queue;
pub mod segmentation;
pub mod transcript;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{
    EngagementConfig, FatigueConfig, FrequencyLimits, PriorityOverride, ReengagementTrigger,
    ScoreWeights, SegmentThresholds, TimingConfig,
};
pub use crm::{
    CallDirection, CallRecord, Deal, DealHealth, DealRisk, Meeting, TranscriptStatus, User,
};
pub use database::{Database, DatabaseConfig};
pub use delivery::{
    ChannelSender, DeliveryReceipt, DeliveryTarget, Insight, InsightKind, InsightProvider,
    InsightRequest,
};
pub use dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher, SkipReason};
pub use error::{Error, Result};
pub use feature::{
    dedupe_key, DedupeWindow, DeliveryMethod, Feature, FeatureSettings, Priority, Recipient,
    SentRecord,
};
pub use ingest::{
    is_call_event, normalize_call_payload, process_call_event, process_interaction_event,
    CallEvent, CallIngestOutcome, InteractionEvent, InteractionKind,
};
pub use jobs::{JobContext, JobReport, JobScope};
pub use message::{
    BriefModel, DealLine, DealNudgeModel, DebriefModel, DigestModel, MeetingLine,
    MeetingPrepModel, MessageBody, MessageModel, ReengagementModel,
};
pub use metrics::{
    ActivityEvent, ActivityPatterns, ActivitySource, ComputedScores, FatigueLevel,
    NotificationInteraction, PreferredFrequency, Segment, UserMetrics,
};
pub use policy::{DenyReason, OptimalTime, PolicyDecision, RecentCounts};
pub use queue::{NotificationStatus, QueuedNotification, TranscriptQueueItem};
pub use segmentation::{can_transition, ContentTrigger, ReengagementChannel, ReengagementTopic};
pub use transcript::{
    TranscriptFetch, TranscriptFetchError, TranscriptProvider, TranscriptTickReport,
    TranscriptWorker,
};
