//! Replica drain on termination.
//!
//! The pod lifecycle hook calls `GET /terminate` before the replica is
//! killed. Stray single calls (health checks, retries) are noise, so a call only
//! counts once enough of them arrive inside the debounce window. The first
//! call past the threshold triggers the drain; every call past the threshold
//! then blocks until the scheduler reports that the replica's models have
//! been placed elsewhere.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use modelplane_scheduler::{Event, EventCoordinator, OutputEvent};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone)]
pub struct DrainConfig {
    pub debounce: Duration,
    pub threshold: u32,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            threshold: 3,
        }
    }
}

struct DrainInner {
    config: DrainConfig,
    count: Mutex<u32>,
    triggered: AtomicBool,
    trigger_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct DrainController {
    inner: Arc<DrainInner>,
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new(DrainConfig::default())
    }
}

impl DrainController {
    pub fn new(config: DrainConfig) -> Self {
        let (trigger_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(DrainInner {
                config,
                count: Mutex::new(0),
                triggered: AtomicBool::new(false),
                trigger_tx,
                done_tx,
                cancel_tx,
            }),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Acquire)
    }

    /// Register one termination request.
    ///
    /// Returns `true` if the call was past the threshold and waited for the
    /// drain to finish (or for [`cancel`](Self::cancel)); `false` if it was
    /// treated as noise.
    pub async fn terminate(&self) -> bool {
        *self.inner.count.lock().await += 1;
        tokio::time::sleep(self.inner.config.debounce).await;

        let past_threshold = {
            let mut count = self.inner.count.lock().await;
            if *count >= self.inner.config.threshold {
                if self
                    .inner
                    .triggered
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    info!(requests = *count, "drain triggered");
                    self.inner.trigger_tx.send_replace(true);
                }
                true
            } else {
                debug!(requests = *count, threshold = self.inner.config.threshold, "terminate below threshold");
                *count = 0;
                false
            }
        };
        if !past_threshold {
            return false;
        }

        let mut done = self.inner.done_tx.subscribe();
        let mut cancel = self.inner.cancel_tx.subscribe();
        tokio::select! {
            _ = raised(&mut done) => {}
            _ = raised(&mut cancel) => {}
        }
        true
    }

    /// Resolves `true` when the drain is triggered, `false` on cancel.
    pub async fn wait_on_trigger(&self) -> bool {
        let mut trigger = self.inner.trigger_tx.subscribe();
        let mut cancel = self.inner.cancel_tx.subscribe();
        tokio::select! {
            _ = raised(&mut trigger) => true,
            _ = raised(&mut cancel) => false,
        }
    }

    /// Release every caller blocked in [`terminate`](Self::terminate).
    pub fn set_scheduler_done(&self) {
        self.inner.done_tx.send_replace(true);
        info!("drain complete");
    }

    /// Release all waiters without draining.
    pub fn cancel(&self) {
        self.inner.cancel_tx.send_replace(true);
        debug!("drain controller cancelled");
    }
}

async fn raised(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|v| *v).await;
}

// ── HTTP ───────────────────────────────────────────────────────────

/// `GET /terminate`, answering `ok` once the call is released.
pub fn drain_router(controller: DrainController) -> Router {
    Router::new()
        .route("/terminate", get(terminate))
        .with_state(controller)
}

async fn terminate(State(controller): State<DrainController>) -> &'static str {
    controller.terminate().await;
    "ok\n"
}

// ── Draining ───────────────────────────────────────────────────────

/// Moves this replica's models elsewhere.
#[async_trait]
pub trait ReplicaDrainer: Send + Sync {
    async fn drain(&self) -> AgentResult<()>;
}

/// Wait for the trigger, drain through `drainer`, then release the callers.
///
/// Returns `Ok(false)` if the controller was cancelled first. Callers are
/// released even when the drain fails.
pub async fn drain_on_request(
    controller: &DrainController,
    drainer: &dyn ReplicaDrainer,
) -> AgentResult<bool> {
    if !controller.wait_on_trigger().await {
        return Ok(false);
    }
    let result = drainer.drain().await;
    if let Err(e) = &result {
        warn!(error = %e, "drain failed, releasing terminate callers anyway");
    }
    controller.set_scheduler_done();
    result.map(|()| true)
}

/// Drains one server replica through the event coordinator.
pub struct SchedulerDrainer {
    coordinator: Arc<EventCoordinator>,
    server: String,
    replica_idx: u32,
}

impl SchedulerDrainer {
    pub fn new(coordinator: Arc<EventCoordinator>, server: impl Into<String>, replica_idx: u32) -> Self {
        Self {
            coordinator,
            server: server.into(),
            replica_idx,
        }
    }
}

#[async_trait]
impl ReplicaDrainer for SchedulerDrainer {
    /// Waits, without a deadline, until the models moved off the replica
    /// serve elsewhere.
    async fn drain(&self) -> AgentResult<()> {
        let server = self.server.clone();
        let idx = self.replica_idx;
        let mut drained = self.coordinator.subscribe_filtered("drain", 4, move |o| {
            matches!(o, OutputEvent::ServerReplicaDrained { server: s, replica_idx, .. }
                if *s == server && *replica_idx == idx)
        });
        self.coordinator.submit(Event::DrainServerReplica {
            server: self.server.clone(),
            replica_idx: idx,
        })?;
        match drained.recv().await {
            Some(OutputEvent::ServerReplicaDrained { rescheduled, .. }) => {
                info!(server = %self.server, replica = idx, rescheduled, "replica drained");
                Ok(())
            }
            _ => Err(AgentError::CoordinatorStopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn controller() -> DrainController {
        DrainController::new(DrainConfig {
            debounce: Duration::from_millis(50),
            threshold: 3,
        })
    }

    struct Noop;

    #[async_trait]
    impl ReplicaDrainer for Noop {
        async fn drain(&self) -> AgentResult<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_call_is_noise() {
        let c = controller();
        assert!(!c.terminate().await);
        assert!(!c.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_triggers_and_blocks_until_done() {
        let c = controller();
        let callers: Vec<_> = (0..3)
            .map(|_| {
                let c = c.clone();
                tokio::spawn(async move { c.terminate().await })
            })
            .collect();

        assert!(c.wait_on_trigger().await);
        assert!(c.is_triggered());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(callers.iter().all(|h| !h.is_finished()));

        c.set_scheduler_done();
        for h in callers {
            assert!(h.await.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn counter_resets_after_noise() {
        let c = controller();
        assert!(!c.terminate().await);
        assert!(!c.terminate().await);
        assert!(!c.terminate().await);
        assert!(!c.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_releases_everyone() {
        let c = controller();
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.wait_on_trigger().await })
        };
        let callers: Vec<_> = (0..3)
            .map(|_| {
                let c = c.clone();
                tokio::spawn(async move { c.terminate().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(200)).await;
        c.cancel();
        waiter.await.unwrap();
        for h in callers {
            h.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_controller_skips_drain() {
        let c = controller();
        c.cancel();
        assert!(!drain_on_request(&c, &Noop).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_on_request_releases_terminate_callers() {
        let c = controller();
        let drainer = {
            let c = c.clone();
            tokio::spawn(async move { drain_on_request(&c, &Noop).await.unwrap() })
        };
        let callers: Vec<_> = (0..3)
            .map(|_| {
                let c = c.clone();
                tokio::spawn(async move { c.terminate().await })
            })
            .collect();
        assert!(drainer.await.unwrap());
        for h in callers {
            assert!(h.await.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_endpoint_answers_ok() {
        let c = controller();
        let response = drain_router(c)
            .oneshot(Request::get("/terminate").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"ok\n");
    }
}
