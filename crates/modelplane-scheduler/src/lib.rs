//! modelplane-scheduler: event coordination for the control plane.
//!
//! Everything that changes cluster state arrives here as an [`Event`]. The
//! [`EventCoordinator`] orders events by priority, hands them one at a time
//! to the handler registered for their type, and fans the resulting
//! [`OutputEvent`]s out to subscribers (agent dispatch, routers, status
//! watchers). The [`Synchroniser`] holds back events that need a populated
//! cluster until the expected servers have reconnected after a restart.
//!
//! # Architecture
//!
//! ```text
//! producers ──submit──▶ EventQueue (binary heap: priority, time, seq)
//!                            │ single consumer
//!                            ▼
//!                    HandlerRegistry[EventType]
//!                            │ ClusterStore::update (copy, apply, commit)
//!                            ▼
//!                      Vec<OutputEvent> ──try_send──▶ subscribers
//! ```

pub mod coordinator;
pub mod error;
pub mod events;
pub mod handlers;
pub mod queue;
pub mod synchroniser;

pub use coordinator::{CoordinatorConfig, CoordinatorStats, EventCoordinator, Subscription};
pub use error::{SchedulerError, SchedulerResult};
pub use events::{Event, EventType, OutputEvent, Priority, ServerReplicaInfo};
pub use handlers::{EventHandler, HandlerRegistry};
pub use queue::{EventQueue, PrioritizedEvent};
pub use synchroniser::{ServerBasedSynchroniser, SimpleSynchroniser, Synchroniser};
