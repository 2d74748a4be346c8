/// Error types for the inbox sync core
use crate::types::MessageId;
use std::time::Duration;
use thiserror::Error;

/// Failure of a collaborator call (HTTP fetch, send, subscription).
///
/// Cloneable so it can be kept in view state and handed to several observers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("channel closed")]
    Closed,
}

impl FetchError {
    /// Server-side and transport failures are worth retrying, client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http { status, .. } => *status >= 500 || *status == 429,
            FetchError::Decode(_) => false,
            FetchError::Network(_) | FetchError::Timeout(_) | FetchError::Closed => true,
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Decode(e.to_string())
    }
}

/// Errors surfaced by timeline operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimelineError {
    /// The newest page could not be loaded; the conversation is unusable until reloaded.
    #[error("initial load failed: {0}")]
    InitialLoad(FetchError),

    /// A backward page failed; loaded messages are untouched.
    #[error("loading older messages failed: {0}")]
    OlderPage(FetchError),

    /// A send failed; the optimistic entry is kept and flagged for retry.
    #[error("sending message {temp_id} failed: {source}")]
    Send {
        temp_id: MessageId,
        source: FetchError,
    },

    #[error("message has no content")]
    EmptyMessage,

    #[error("message {0} is not awaiting retry")]
    NotRetryable(MessageId),

    #[error("unknown message {0}")]
    UnknownMessage(MessageId),
}

/// A real-time payload that could not be decoded. Logged and dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealtimeDecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("payload missing field `{0}`")]
    MissingField(&'static str),

    #[error("payload field `{0}` has an invalid value")]
    InvalidField(&'static str),
}

/// Crate-level error
#[derive(Error, Debug)]
pub enum InboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Timeline error: {0}")]
    Timeline(#[from] TimelineError),

    #[error("Realtime error: {0}")]
    Realtime(#[from] RealtimeDecodeError),

    #[error("Session error: {0}")]
    Session(String),
}

pub type Result<T> = std::result::Result<T, InboxError>;
