//! Control plane assembly.
//!
//! Startup order:
//! 1. Open the key/value store and restore the persisted cluster state.
//!    Restored replicas become absent markers until their agents reconnect
//! 2. Build the synchroniser and the event coordinator, then start it
//! 3. Attach agent command dispatch and the synchroniser's connect watcher
//! 4. Signal the synchroniser with the replica count from persisted state;
//!    once ready, sweep what the missing replicas left behind
//! 5. Start the failed-model retry loops and, if configured, the drain watcher

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use modelplane_agent::{
    AgentTransport, CommandDispatcher, DispatchError, DrainController, SchedulerDrainer,
    drain_on_request, drain_router,
};
use modelplane_placement::{AgentCommand, PlacementEngine};
use modelplane_scheduler::{
    Event, EventCoordinator, HandlerRegistry, OutputEvent, ServerBasedSynchroniser,
    SimpleSynchroniser, Subscription, Synchroniser,
};
use modelplane_state::{ClusterState, ClusterStore, KeyValueStore, StateError, StateStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{DaemonConfig, SynchroniserKind};

/// Logs commands instead of delivering them; stands in until a real agent
/// transport is configured.
pub struct TracingTransport;

#[async_trait]
impl AgentTransport for TracingTransport {
    async fn send(&self, command: &AgentCommand) -> Result<(), DispatchError> {
        info!(%command, "agent command");
        Ok(())
    }
}

pub struct ControlPlane {
    coordinator: Arc<EventCoordinator>,
    synchroniser: Arc<dyn Synchroniser>,
    drain: DrainController,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlPlane {
    /// Open the configured store and start.
    pub async fn start(config: &DaemonConfig) -> anyhow::Result<Self> {
        let kv: Arc<dyn KeyValueStore> = if config.store.in_memory {
            info!("using in-memory state store");
            Arc::new(StateStore::open_in_memory()?)
        } else {
            std::fs::create_dir_all(&config.store.data_dir)?;
            let path = config.store.db_path();
            let store = StateStore::open(&path)?;
            info!(path = ?path, "state store opened");
            Arc::new(store)
        };
        Self::start_with_store(config, kv, Arc::new(TracingTransport)).await
    }

    /// Start on an existing store, delivering commands through `transport`.
    pub async fn start_with_store<T: AgentTransport + 'static>(
        config: &DaemonConfig,
        kv: Arc<dyn KeyValueStore>,
        transport: Arc<T>,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(ClusterStore::new(kv));
        let restored = store.load().await?;
        let expected = store
            .update(|s| {
                s.clear_replicas();
                Ok::<_, StateError>(expected_replicas(s))
            })
            .await?;
        info!(restored, expected, "cluster state loaded");

        let timeout = Duration::from_millis(config.synchroniser.timeout_ms);
        let server_based = match config.synchroniser.kind {
            SynchroniserKind::ServerBased => Some(Arc::new(ServerBasedSynchroniser::new(timeout))),
            SynchroniserKind::Simple => None,
        };
        let synchroniser: Arc<dyn Synchroniser> = match &server_based {
            Some(sync) => sync.clone(),
            None => Arc::new(SimpleSynchroniser::new(timeout)),
        };

        let coordinator = Arc::new(
            EventCoordinator::with_config(
                store,
                HandlerRegistry::standard(Arc::new(PlacementEngine::default())),
                config.coordinator.to_coordinator_config(),
            )
            .with_synchroniser(synchroniser.clone()),
        );
        coordinator.start();

        let buffer = config.coordinator.subscriber_buffer;
        let mut tasks = Vec::new();

        let dispatcher = Arc::new(
            CommandDispatcher::new(transport, coordinator.clone())
                .with_retry(config.dispatch.to_retry_config()),
        );
        tasks.push(dispatcher.clone().spawn(dispatcher.subscribe(buffer)));

        if let Some(sync) = &server_based {
            tasks.push(sync.watch_coordinator(coordinator.subscribe("synchroniser", buffer)));
        }

        // Connect events from agents may already be flowing; signalling from
        // a task keeps startup from racing them.
        let signaller = synchroniser.clone();
        let sweeper = coordinator.clone();
        let counter = server_based.clone();
        tasks.push(tokio::spawn(async move {
            signaller.signals(expected);
            signaller.wait_ready().await;
            if !signaller.is_ready() {
                return;
            }
            let connected = counter.map(|sync| sync.connected_count());
            info!(expected, ?connected, "scheduling ready");
            if restored && let Err(e) = sweeper.submit(Event::ScheduleFailedModels) {
                warn!(error = %e, "post-restart sweep not queued");
            }
        }));

        let (shutdown_tx, _) = watch::channel(false);
        tasks.push(spawn_connect_retry(
            coordinator.clone(),
            coordinator.subscribe_filtered("connect-retry", buffer, |o| {
                matches!(o, OutputEvent::ServerReplicaConnected { .. })
            }),
            shutdown_tx.subscribe(),
        ));
        if config.coordinator.retry_interval_secs > 0 {
            tasks.push(spawn_retry_loop(
                coordinator.clone(),
                Duration::from_secs(config.coordinator.retry_interval_secs),
                shutdown_tx.subscribe(),
            ));
        }

        let drain = DrainController::new(config.drain.to_drain_config());
        if let Some(server) = &config.drain.server {
            let drainer =
                SchedulerDrainer::new(coordinator.clone(), server.clone(), config.drain.replica_idx);
            let controller = drain.clone();
            tasks.push(tokio::spawn(async move {
                match drain_on_request(&controller, &drainer).await {
                    Ok(true) => info!("drain finished"),
                    Ok(false) => {}
                    Err(e) => error!(error = %e, "drain failed"),
                }
            }));
        }

        info!("control plane started");
        Ok(Self {
            coordinator,
            synchroniser,
            drain,
            shutdown_tx,
            tasks,
        })
    }

    pub fn coordinator(&self) -> &Arc<EventCoordinator> {
        &self.coordinator
    }

    pub fn synchroniser(&self) -> &Arc<dyn Synchroniser> {
        &self.synchroniser
    }

    pub fn drain_controller(&self) -> &DrainController {
        &self.drain
    }

    /// HTTP surface: the drain endpoint.
    pub fn router(&self) -> Router {
        drain_router(self.drain.clone())
    }

    /// Stop background work and release every waiter.
    pub async fn shutdown(self) {
        info!("control plane shutting down");
        self.shutdown_tx.send_replace(true);
        self.drain.cancel();
        self.synchroniser.stop();
        self.coordinator.stop().await;
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("control plane stopped");
    }
}

/// Distinct server replicas recorded in `state`, connected or awaited.
pub fn expected_replicas(state: &ClusterState) -> usize {
    state.known_replica_count()
}

/// Retry failed placements whenever new capacity connects. The retry is
/// gated, so nothing is placed before the synchroniser is ready.
fn spawn_connect_retry(
    coordinator: Arc<EventCoordinator>,
    mut connects: Subscription,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                output = connects.recv() => {
                    let Some(_) = output else { break };
                    if let Err(e) = coordinator.submit(Event::ScheduleFailedModels) {
                        warn!(error = %e, "connect retry not queued");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

fn spawn_retry_loop(
    coordinator: Arc<EventCoordinator>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = coordinator.submit(Event::ScheduleFailedModels) {
                        warn!(error = %e, "failed-model retry not queued");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Run until Ctrl-C, serving the drain endpoint.
pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("modelplane daemon starting");
    let plane = ControlPlane::start(&config).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.drain.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "drain endpoint listening");

    let drain = plane.drain_controller().clone();
    let server = axum::serve(listener, plane.router()).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
        info!("shutdown signal received");
        // In-flight /terminate calls must not hold up shutdown.
        drain.cancel();
    });
    server.await?;

    plane.shutdown().await;
    info!("modelplane daemon stopped");
    Ok(())
}
