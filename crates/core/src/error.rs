//! Error taxonomy shared across the watch pipeline.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ResourceIdentity;

/// Fatal to a watch session: no handler is registered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StartupError {
    #[error("timed out after {0:?} waiting for cache sync")]
    SyncTimeout(Duration),
    #[error("shutdown requested before cache sync")]
    Cancelled,
    #[error("event source closed before cache sync")]
    SourceClosed,
    #[error("event source failed to start: {0}")]
    Connect(String),
}

/// Mid-stream fault reported by an event source. The source owns recovery.
#[derive(Debug, Error, Clone)]
#[error("transport error at {at}: {message}")]
pub struct TransportError {
    pub message: String,
    pub at: DateTime<Utc>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), at: Utc::now() }
    }
}

/// A sub-entity (or whole object) that could not be read.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed snapshot {}: {reason}", locate(.identity, .index))]
pub struct MalformedSnapshotError {
    pub identity: Option<ResourceIdentity>,
    pub index: Option<usize>,
    pub reason: String,
}

fn locate(identity: &Option<ResourceIdentity>, index: &Option<usize>) -> String {
    let who = identity.as_ref().map(|i| i.to_string()).unwrap_or_else(|| "<unknown>".to_string());
    match index {
        Some(i) => format!("{who} [{i}]"),
        None => who,
    }
}

/// Failure of a single handler invocation. Never escalates past the event.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Malformed(#[from] MalformedSnapshotError),
}

/// Reported by sinks; logged by the dispatcher and otherwise ignored.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink queue full; notice dropped")]
    Backpressure,
    #[error("sink closed")]
    Closed,
    #[error("sink encode: {0}")]
    Encode(#[from] serde_json::Error),
}
