//! Delivery of agent commands.
//!
//! The dispatcher subscribes to the coordinator's agent commands and pushes
//! each through an [`AgentTransport`]. Transient failures are retried with
//! backoff; anything that still fails is reported back to the coordinator as
//! a `LoadFailed` / `UnloadFailed` replica status so the state machine can
//! react instead of waiting for a report that will never come.
//!
//! Outputs the subscription had to drop are recovered by a resync: every
//! load or unload the cluster state still waits on is sent again. Delivery
//! is therefore at least once; agents treat repeated commands as no-ops.

use std::sync::Arc;

use async_trait::async_trait;
use modelplane_placement::{AgentCommand, pending_commands};
use modelplane_scheduler::{Event, EventCoordinator, OutputEvent, Subscription};
use modelplane_state::ReplicaState;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::retry::{RetryConfig, retry_with_backoff};

/// How commands reach a server replica's agent.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send(&self, command: &AgentCommand) -> Result<(), DispatchError>;
}

pub struct CommandDispatcher<T> {
    transport: Arc<T>,
    coordinator: Arc<EventCoordinator>,
    retry: RetryConfig,
}

impl<T: AgentTransport + 'static> CommandDispatcher<T> {
    pub fn new(transport: Arc<T>, coordinator: Arc<EventCoordinator>) -> Self {
        Self {
            transport,
            coordinator,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// A coordinator subscription carrying only agent commands.
    pub fn subscribe(&self, buffer: usize) -> Subscription {
        self.coordinator
            .subscribe_filtered("agent-dispatch", buffer, |o| o.agent_command().is_some())
    }

    /// Send one command, retrying transient failures.
    pub async fn dispatch(&self, command: &AgentCommand) -> Result<(), DispatchError> {
        let name = command.to_string();
        retry_with_backoff(&self.retry, &name, DispatchError::is_retryable, || {
            self.transport.send(command)
        })
        .await
    }

    /// Dispatch, reporting a final failure back as a replica status.
    pub async fn handle(&self, command: &AgentCommand) {
        match self.dispatch(command).await {
            Ok(()) => debug!(%command, "command delivered"),
            Err(e) => self.report_failure(command, &e),
        }
    }

    fn report_failure(&self, command: &AgentCommand, error: &DispatchError) {
        let state = if command.is_load() {
            ReplicaState::LoadFailed
        } else {
            ReplicaState::UnloadFailed
        };
        let id = command.model_version();
        warn!(%command, error = %error, %state, "command failed, reporting");
        let event = Event::ModelReplicaStatus {
            model: id.model,
            version: id.version,
            server: command.server().to_string(),
            replica_idx: command.replica_idx(),
            state,
            reason: error.to_string(),
        };
        if let Err(e) = self.coordinator.submit(event) {
            warn!(%command, error = %e, "could not report command failure");
        }
    }

    /// Re-send every command the cluster state is still waiting on.
    pub async fn resync(&self) -> usize {
        let state = self.coordinator.store().get_cluster_state().await;
        let commands = pending_commands(&state);
        info!(commands = commands.len(), "resyncing agent commands");
        for command in &commands {
            self.handle(command).await;
        }
        commands.len()
    }

    /// Consume `subscription` until the coordinator stops.
    ///
    /// Commands are delivered one at a time in the order they were emitted.
    pub fn spawn(self: Arc<Self>, mut subscription: Subscription) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(subscriber = %subscription.name(), "command dispatcher started");
            let mut seen_dropped = 0;
            while let Some(output) = subscription.recv().await {
                let dropped = subscription.dropped();
                if dropped > seen_dropped {
                    warn!(lost = dropped - seen_dropped, "agent commands dropped, resyncing");
                    seen_dropped = dropped;
                    self.resync().await;
                }
                if let OutputEvent::Agent { command } = output {
                    self.handle(&command).await;
                }
            }
            info!("command dispatcher stopped");
        })
    }
}
