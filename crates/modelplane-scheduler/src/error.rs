//! Scheduler error types.

use thiserror::Error;

use crate::events::EventType;

/// Errors that can occur while coordinating events.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("event coordinator is not running")]
    NotRunning,

    #[error("no output for {event:?} within {timeout_ms}ms")]
    SyncTimeout { event: EventType, timeout_ms: u64 },

    #[error("event coordinator stopped while waiting for {0:?}")]
    Stopped(EventType),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("placement error: {0}")]
    Placement(#[from] modelplane_placement::PlacementError),

    #[error("state store error: {0}")]
    State(#[from] modelplane_state::StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
