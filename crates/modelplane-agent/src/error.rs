//! Agent error types.

use thiserror::Error;

/// Failure delivering a command to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The agent answered and refused.
    #[error("agent returned status {code}: {message}")]
    Status { code: u16, message: String },

    /// The agent could not be reached.
    #[error("agent unreachable: {0}")]
    Connection(String),
}

impl DispatchError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Status { code, .. } => matches!(code, 408 | 429 | 502 | 503 | 504),
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] modelplane_scheduler::SchedulerError),

    #[error("event coordinator stopped before the drain completed")]
    CoordinatorStopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_retryable() {
        assert!(DispatchError::Connection("refused".into()).is_retryable());
    }

    #[test]
    fn only_transient_statuses_are_retryable() {
        let status = |code| DispatchError::Status {
            code,
            message: String::new(),
        };
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!status(500).is_retryable());
    }
}
