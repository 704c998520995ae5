//! Error types for the placement engine.

use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("state error: {0}")]
    State(#[from] modelplane_state::StateError),

    #[error("model {0} has no versions")]
    NoVersions(String),
}
