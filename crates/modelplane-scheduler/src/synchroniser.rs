//! Startup barrier.
//!
//! After a restart the control plane knows (from persisted state) how many
//! server replicas it expects to reconnect. Until they have, scheduling
//! against the partial server set would move models needlessly, so the
//! coordinator defers server-dependent events until the synchroniser reports
//! ready.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::coordinator::{Subscription, lock, stopped};
use crate::events::OutputEvent;

#[async_trait]
pub trait Synchroniser: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Resolves once ready, or once the synchroniser is stopped.
    async fn wait_ready(&self);

    /// Declare how many distinct server replicas to wait for.
    ///
    /// Only the first call counts.
    fn signals(&self, expected: usize);

    fn server_connected(&self, server: &str, replica_idx: u32);

    /// Release every waiter and abandon pending connection bookkeeping.
    fn stop(&self);
}

/// Flags shared by both synchronisers.
struct Readiness {
    ready: AtomicBool,
    ready_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Readiness {
    fn new() -> Self {
        let (ready_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ready: AtomicBool::new(false),
            ready_tx,
            shutdown_tx,
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Returns true for the one caller that flipped the flag.
    fn fire(&self, cause: &str) -> bool {
        if self
            .ready
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.ready_tx.send_replace(true);
        info!(%cause, "cluster ready");
        true
    }

    async fn wait(&self) {
        let mut ready = self.ready_tx.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = stopped(&mut ready) => {}
            _ = stopped(&mut shutdown) => {}
        }
    }

    fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Fire after `timeout` unless stopped first.
    fn spawn_timeout(self: &Arc<Self>, timeout: Duration) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    this.fire("timeout");
                }
                _ = stopped(&mut shutdown) => {}
            }
        })
    }
}

// ── Server based ───────────────────────────────────────────────────

struct ServerBasedInner {
    readiness: Arc<Readiness>,
    signalled: AtomicBool,
    expected: AtomicUsize,
    signal_tx: watch::Sender<bool>,
    connected: Mutex<HashSet<(String, u32)>>,
}

impl ServerBasedInner {
    fn record(&self, server: String, replica_idx: u32) {
        let count = {
            let mut connected = lock(&self.connected);
            connected.insert((server.clone(), replica_idx));
            connected.len()
        };
        let expected = self.expected.load(Ordering::Acquire);
        debug!(%server, replica = replica_idx, count, expected, "server replica synchronised");
        if count >= expected {
            self.readiness.fire("all expected server replicas connected");
        }
    }
}

/// Ready once `n` distinct server replicas have connected after
/// [`signals(n)`](Synchroniser::signals), or after a timeout.
pub struct ServerBasedSynchroniser {
    inner: Arc<ServerBasedInner>,
}

impl ServerBasedSynchroniser {
    /// Starts the timeout clock immediately; needs a tokio runtime.
    pub fn new(timeout: Duration) -> Self {
        let readiness = Arc::new(Readiness::new());
        readiness.spawn_timeout(timeout);
        let (signal_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerBasedInner {
                readiness,
                signalled: AtomicBool::new(false),
                expected: AtomicUsize::new(0),
                signal_tx,
                connected: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Distinct replicas counted so far.
    pub fn connected_count(&self) -> usize {
        lock(&self.inner.connected).len()
    }

    /// Feed `ServerReplicaConnected` outputs from a coordinator subscription.
    pub fn watch_coordinator(self: &Arc<Self>, mut subscription: Subscription) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown = self.inner.readiness.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    next = subscription.recv() => next,
                    _ = stopped(&mut shutdown) => None,
                };
                match next {
                    Some(OutputEvent::ServerReplicaConnected {
                        server,
                        replica_idx,
                    }) => this.server_connected(&server, replica_idx),
                    Some(_) => {}
                    None => break,
                }
            }
            debug!(subscriber = %subscription.name(), "synchroniser stopped watching");
        })
    }
}

#[async_trait]
impl Synchroniser for ServerBasedSynchroniser {
    fn is_ready(&self) -> bool {
        self.inner.readiness.is_ready()
    }

    async fn wait_ready(&self) {
        self.inner.readiness.wait().await;
    }

    fn signals(&self, expected: usize) {
        if self
            .inner
            .signalled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(expected, "synchroniser already signalled");
            return;
        }
        self.inner.expected.store(expected, Ordering::Release);
        info!(expected, "waiting for server replicas");
        if expected == 0 {
            self.inner.readiness.fire("no server replicas expected");
        }
        self.inner.signal_tx.send_replace(true);
    }

    fn server_connected(&self, server: &str, replica_idx: u32) {
        let inner = self.inner.clone();
        let server = server.to_string();
        let mut signal = inner.signal_tx.subscribe();
        let mut shutdown = inner.readiness.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = stopped(&mut signal) => inner.record(server, replica_idx),
                _ = stopped(&mut shutdown) => {}
            }
        });
    }

    fn stop(&self) {
        self.inner.readiness.stop();
    }
}

// ── Simple ─────────────────────────────────────────────────────────

/// Ready after a fixed delay, whatever connects.
pub struct SimpleSynchroniser {
    readiness: Arc<Readiness>,
}

impl SimpleSynchroniser {
    /// Starts the clock immediately; needs a tokio runtime.
    pub fn new(timeout: Duration) -> Self {
        let readiness = Arc::new(Readiness::new());
        readiness.spawn_timeout(timeout);
        Self { readiness }
    }
}

#[async_trait]
impl Synchroniser for SimpleSynchroniser {
    fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    async fn wait_ready(&self) {
        self.readiness.wait().await;
    }

    fn signals(&self, expected: usize) {
        debug!(expected, "simple synchroniser ignores signals");
    }

    fn server_connected(&self, _server: &str, _replica_idx: u32) {}

    fn stop(&self) {
        self.readiness.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(600);

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn ready_after_expected_replicas_connect() {
        let sync = ServerBasedSynchroniser::new(LONG);
        sync.signals(2);
        sync.server_connected("mlserver", 0);
        sync.server_connected("mlserver", 0);
        settle().await;
        assert!(!sync.is_ready(), "duplicate connects count once");

        sync.server_connected("triton", 0);
        tokio::time::timeout(Duration::from_secs(1), sync.wait_ready())
            .await
            .unwrap();
        assert!(sync.is_ready());
        assert_eq!(sync.connected_count(), 2);
    }

    #[tokio::test]
    async fn connects_before_signal_wait_for_it() {
        let sync = ServerBasedSynchroniser::new(LONG);
        sync.server_connected("mlserver", 0);
        settle().await;
        assert_eq!(sync.connected_count(), 0);

        sync.signals(1);
        tokio::time::timeout(Duration::from_secs(1), sync.wait_ready())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn zero_expected_is_ready_at_signal() {
        let sync = ServerBasedSynchroniser::new(LONG);
        assert!(!sync.is_ready());
        sync.signals(0);
        assert!(sync.is_ready());
    }

    #[tokio::test]
    async fn only_first_signal_counts() {
        let sync = ServerBasedSynchroniser::new(LONG);
        sync.signals(1);
        sync.signals(5);
        sync.server_connected("mlserver", 0);
        tokio::time::timeout(Duration::from_secs(1), sync.wait_ready())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_ready() {
        let sync = ServerBasedSynchroniser::new(Duration::from_secs(30));
        sync.signals(3);
        sync.wait_ready().await;
        assert!(sync.is_ready());
    }

    #[tokio::test]
    async fn concurrent_waiters_release_together() {
        let sync = Arc::new(ServerBasedSynchroniser::new(LONG));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let sync = sync.clone();
                tokio::spawn(async move { sync.wait_ready().await })
            })
            .collect();
        settle().await;
        sync.signals(0);
        for w in waiters {
            tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn stop_releases_waiters_without_ready() {
        let sync = Arc::new(ServerBasedSynchroniser::new(LONG));
        let waiter = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.wait_ready().await })
        };
        settle().await;
        sync.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!sync.is_ready());
    }

    #[tokio::test]
    async fn watches_coordinator_connect_outputs() {
        use crate::coordinator::EventCoordinator;
        use crate::events::{Event, ServerReplicaInfo};
        use crate::handlers::HandlerRegistry;
        use modelplane_placement::PlacementEngine;
        use modelplane_state::ClusterStore;

        let coordinator = EventCoordinator::new(
            Arc::new(ClusterStore::in_memory().unwrap()),
            HandlerRegistry::standard(Arc::new(PlacementEngine::default())),
        );
        coordinator.start();
        let sync = Arc::new(ServerBasedSynchroniser::new(LONG));
        let watcher = sync.watch_coordinator(coordinator.subscribe("synchroniser", 64));
        sync.signals(1);

        coordinator
            .submit(Event::ServerReplicaConnected(ServerReplicaInfo {
                server: "mlserver".into(),
                replica_idx: 0,
                address: String::new(),
                http_port: 0,
                grpc_port: 0,
                capabilities: Vec::new(),
                memory: 1_000,
                loaded_models: Vec::new(),
            }))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), sync.wait_ready())
            .await
            .unwrap();

        coordinator.stop().await;
        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn simple_synchroniser_waits_out_the_timeout() {
        let sync = SimpleSynchroniser::new(Duration::from_secs(10));
        sync.signals(1);
        sync.server_connected("mlserver", 0);
        assert!(!sync.is_ready());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(sync.is_ready());
    }
}
