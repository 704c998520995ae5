//! Agent-facing side of the control plane.
//!
//! # Components
//!
//! - [`DrainController`]: debounced termination signal from the replica's
//!   lifecycle hook, served as `GET /terminate`, that holds the caller until
//!   the scheduler has moved the replica's models elsewhere.
//! - [`CommandDispatcher`]: delivers load/unload commands from the
//!   coordinator to agents with bounded retry, reporting failures back as
//!   replica status events.

pub mod dispatch;
pub mod drain;
pub mod error;
pub mod retry;

pub use dispatch::{AgentTransport, CommandDispatcher};
pub use drain::{
    DrainConfig, DrainController, ReplicaDrainer, SchedulerDrainer, drain_on_request, drain_router,
};
pub use error::{AgentError, AgentResult, DispatchError};
pub use retry::{RetryConfig, retry_with_backoff};
