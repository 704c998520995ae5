//! modelplane-placement: maps model versions onto server replicas.
//!
//! Placement is a pipeline of small, stateless predicates and orderings:
//! server filters prune servers, server sorters rank the survivors, and the
//! same pair of stages then runs over each server's replicas. The engine
//! picks the first server that can host the requested replica count and
//! turns the difference between the current and desired assignment into
//! agent commands.
//!
//! # Components
//!
//! - **`filters`**: server and replica filters (sharing, capabilities, memory, draining)
//! - **`sorters`**: server and replica orderings (stickiness, index, free memory)
//! - **`engine`**: [`PlacementEngine`]: schedule, deassign, unload
//! - **`command`**: [`AgentCommand`], what the engine asks agents to do, and
//!   the commands still awaiting an agent answer

pub mod command;
pub mod engine;
pub mod error;
pub mod filters;
pub mod sorters;

pub use command::{AgentCommand, pending_commands};
pub use engine::{NoCandidates, Placement, PlacementEngine, Rejection};
pub use error::{PlacementError, PlacementResult};
pub use filters::{ReplicaFilter, ServerFilter};
pub use sorters::{ReplicaSorter, ServerSorter};
