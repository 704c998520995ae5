//! Error types for the modelplane state crate.

use thiserror::Error;

/// Result type alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while reading or mutating cluster state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict { key: String, expected: u64, found: u64 },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("model {model} has no version {version}")]
    VersionNotFound { model: String, version: u32 },

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("replica {server}:{replica_idx} not found")]
    ReplicaNotFound { server: String, replica_idx: u32 },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
