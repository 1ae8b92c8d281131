//! Error types for cadence-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Recipient mapping not found for user {0}")]
    RecipientNotFound(String),

    #[error("Call not found: {0}")]
    CallNotFound(String),

    #[error("Invalid segment transition: {0} -> {1}")]
    InvalidSegmentTransition(String, String),

    #[error("Invalid notification status transition: {0} -> {1}")]
    InvalidStatusTransition(String, String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Delivery failed (retryable={retryable}): {message}")]
    Delivery { message: String, retryable: bool },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timestamp parse error: {0}")]
    TimestampParse(#[from] chrono::ParseError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Delivery { retryable, .. } => *retryable,
            Self::Database(_) | Self::Io(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
