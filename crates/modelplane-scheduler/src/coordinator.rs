//! Event coordinator: the single writer to cluster state.
//!
//! Producers submit [`Event`]s from any task without blocking. One background
//! task pops them in priority order, applies each through its registered
//! handler inside [`ClusterStore::update`], and fans the resulting
//! [`OutputEvent`]s out to every subscriber.
//!
//! # Architecture
//!
//! ```text
//!  submit ──► EventQueue (heap) ──► consumer task ──► HandlerRegistry
//!                  ▲      │                                 │
//!                  │      └─► deferred (until ready)        ▼
//!                  └──────────── requeue ◄── Synchroniser  ClusterStore::update
//!                                                           │
//!                                    subscribers ◄── try_send outputs
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

use modelplane_state::ClusterStore;
use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{Event, EventType, OutputEvent, Priority};
use crate::handlers::HandlerRegistry;
use crate::queue::{EventQueue, PrioritizedEvent};
use crate::synchroniser::Synchroniser;

/// Subscriber-side predicate; outputs it rejects are never sent.
pub type OutputFilter = Arc<dyn Fn(&OutputEvent) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long `submit_sync` waits for the first output.
    pub sync_timeout: Duration,
    /// After the first output, how long `submit_sync` keeps collecting.
    pub coalesce_window: Duration,
    /// Channel size of the private `submit_sync` subscriber.
    pub sync_buffer: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(5),
            coalesce_window: Duration::from_millis(10),
            sync_buffer: 10,
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub queued: u64,
    pub processed: u64,
    pub failed: u64,
    pub dropped_no_handler: u64,
    pub dropped_subscriber: u64,
    pub depth: usize,
    pub deferred: usize,
    pub subscribers: usize,
}

struct Subscriber {
    name: String,
    tx: mpsc::Sender<OutputEvent>,
    filter: Option<OutputFilter>,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped_no_handler: AtomicU64,
    dropped_subscriber: AtomicU64,
}

struct Inner {
    config: CoordinatorConfig,
    store: Arc<ClusterStore>,
    registry: HandlerRegistry,
    synchroniser: OnceLock<Arc<dyn Synchroniser>>,
    queue: Mutex<EventQueue>,
    deferred: Mutex<Vec<PrioritizedEvent>>,
    notify: Notify,
    running: AtomicBool,
    seq: AtomicU64,
    next_subscriber: AtomicU64,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    shutdown_tx: watch::Sender<bool>,
    counters: Counters,
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    name: String,
    rx: mpsc::Receiver<OutputEvent>,
    dropped: Arc<AtomicU64>,
    owner: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next output; `None` once the coordinator has stopped.
    pub async fn recv(&mut self) -> Option<OutputEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OutputEvent> {
        self.rx.try_recv().ok()
    }

    /// Outputs lost so far because this subscription's buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.owner.upgrade() {
            inner.unsubscribe(self.id);
        }
    }
}

pub struct EventCoordinator {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventCoordinator {
    pub fn new(store: Arc<ClusterStore>, registry: HandlerRegistry) -> Self {
        Self::with_config(store, registry, CoordinatorConfig::default())
    }

    pub fn with_config(
        store: Arc<ClusterStore>,
        registry: HandlerRegistry,
        config: CoordinatorConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                registry,
                synchroniser: OnceLock::new(),
                queue: Mutex::new(EventQueue::new()),
                deferred: Mutex::new(Vec::new()),
                notify: Notify::new(),
                running: AtomicBool::new(false),
                seq: AtomicU64::new(0),
                next_subscriber: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
                shutdown_tx,
                counters: Counters::default(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Gate server-dependent events on `synchroniser` becoming ready.
    ///
    /// Must be called before [`start`](Self::start).
    pub fn with_synchroniser(self, synchroniser: Arc<dyn Synchroniser>) -> Self {
        if self.inner.synchroniser.set(synchroniser).is_err() {
            warn!("synchroniser already attached; ignored");
        }
        self
    }

    pub fn store(&self) -> &Arc<ClusterStore> {
        &self.inner.store
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Spawn the consumer task. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown_tx.send_replace(false);
        let mut tasks = lock(&self.tasks);

        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(run_loop(inner, shutdown)));

        if let Some(sync) = self.inner.synchroniser.get().cloned() {
            let inner = self.inner.clone();
            let mut shutdown = self.inner.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = sync.wait_ready() => inner.requeue_deferred(),
                    _ = stopped(&mut shutdown) => {}
                }
            }));
        }
        info!(handlers = self.inner.registry.len(), "event coordinator started");
    }

    /// Stop the consumer, wait for it, and close every subscriber channel.
    ///
    /// Events still queued are discarded.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown_tx.send_replace(true);
        self.inner.notify.notify_one();

        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "coordinator task failed");
            }
        }
        lock(&self.inner.subscribers).clear();
        let discarded = lock(&self.inner.queue).drain().len();
        info!(discarded, "event coordinator stopped");
    }

    /// Queue `event` at its default priority.
    pub fn submit(&self, event: Event) -> SchedulerResult<()> {
        let priority = event.default_priority();
        self.submit_with_priority(event, priority)
    }

    pub fn submit_with_priority(&self, event: Event, priority: Priority) -> SchedulerResult<()> {
        if !self.is_running() {
            return Err(SchedulerError::NotRunning);
        }
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let event_type = event.event_type();
        lock(&self.inner.queue).push(PrioritizedEvent {
            event,
            priority,
            submitted_at: Instant::now(),
            seq,
        });
        self.inner.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.inner.notify.notify_one();
        debug!(event = ?event_type, ?priority, seq, "event queued");
        Ok(())
    }

    /// Submit `event` and collect the outputs it produces.
    ///
    /// Waits for the first output up to the configured timeout, then gathers
    /// whatever else arrives inside the coalescing window. The private
    /// subscriber sees every output, including those of concurrent events.
    pub async fn submit_sync(&self, event: Event) -> SchedulerResult<Vec<OutputEvent>> {
        let event_type = event.event_type();
        let config = &self.inner.config;
        let mut sub = self.subscribe(format!("sync-{event_type:?}"), config.sync_buffer);
        self.submit(event)?;

        let first = tokio::time::timeout(config.sync_timeout, sub.recv())
            .await
            .map_err(|_| SchedulerError::SyncTimeout {
                event: event_type,
                timeout_ms: config.sync_timeout.as_millis() as u64,
            })?
            .ok_or(SchedulerError::Stopped(event_type))?;

        let mut outputs = vec![first];
        let deadline = tokio::time::Instant::now() + config.coalesce_window;
        while let Ok(Some(next)) = tokio::time::timeout_at(deadline, sub.recv()).await {
            outputs.push(next);
        }
        Ok(outputs)
    }

    pub fn subscribe(&self, name: impl Into<String>, buffer: usize) -> Subscription {
        self.subscribe_inner(name.into(), buffer, None)
    }

    /// Subscribe to outputs accepted by `filter` only.
    pub fn subscribe_filtered(
        &self,
        name: impl Into<String>,
        buffer: usize,
        filter: impl Fn(&OutputEvent) -> bool + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_inner(name.into(), buffer, Some(Arc::new(filter)))
    }

    fn subscribe_inner(
        &self,
        name: String,
        buffer: usize,
        filter: Option<OutputFilter>,
    ) -> Subscription {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        lock(&self.inner.subscribers).insert(
            id,
            Subscriber {
                name: name.clone(),
                tx,
                filter,
                dropped: dropped.clone(),
            },
        );
        debug!(subscriber = %name, id, "subscribed");
        Subscription {
            id,
            name,
            rx,
            dropped,
            owner: Arc::downgrade(&self.inner),
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        let c = &self.inner.counters;
        CoordinatorStats {
            queued: c.queued.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dropped_no_handler: c.dropped_no_handler.load(Ordering::Relaxed),
            dropped_subscriber: c.dropped_subscriber.load(Ordering::Relaxed),
            depth: lock(&self.inner.queue).len(),
            deferred: lock(&self.inner.deferred).len(),
            subscribers: lock(&self.inner.subscribers).len(),
        }
    }
}

// ── Consumer ───────────────────────────────────────────────────────

async fn run_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    debug!("coordinator loop starting");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let next = lock(&inner.queue).pop();
        let Some(item) = next else {
            tokio::select! {
                _ = inner.notify.notified() => {}
                _ = shutdown.changed() => {}
            }
            continue;
        };
        inner.process(item).await;
    }
    debug!("coordinator loop exiting");
}

impl Inner {
    async fn process(&self, item: PrioritizedEvent) {
        let event_type = item.event.event_type();

        if event_type.requires_ready()
            && let Some(sync) = self.synchroniser.get()
            && !sync.is_ready()
        {
            lock(&self.deferred).push(item);
            debug!(event = ?event_type, "deferred until cluster is ready");
            // Readiness may have flipped while we were deferring.
            if sync.is_ready() {
                self.requeue_deferred();
            }
            return;
        }

        let Some(handler) = self.registry.get(event_type) else {
            warn!(event = ?event_type, "no handler registered, event dropped");
            self.counters.dropped_no_handler.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let result = self
            .store
            .update(|state| handler.handle(state, &item.event))
            .await;
        match result {
            Ok(outputs) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                debug!(event = ?event_type, seq = item.seq, outputs = outputs.len(), "event applied");
                self.publish(&outputs);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(event = ?event_type, seq = item.seq, error = %e, "event rejected");
            }
        }
    }

    fn publish(&self, outputs: &[OutputEvent]) {
        let subscribers = lock(&self.subscribers);
        for output in outputs {
            for (id, sub) in subscribers.iter() {
                if sub.filter.as_ref().is_some_and(|f| !f(output)) {
                    continue;
                }
                match sub.tx.try_send(output.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.counters.dropped_subscriber.fetch_add(1, Ordering::Relaxed);
                        sub.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(subscriber = %sub.name, id, "subscriber channel full, output dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(subscriber = %sub.name, id, "subscriber gone");
                    }
                }
            }
        }
    }

    fn requeue_deferred(&self) {
        let deferred: Vec<_> = lock(&self.deferred).drain(..).collect();
        if deferred.is_empty() {
            return;
        }
        let count = deferred.len();
        let mut queue = lock(&self.queue);
        for item in deferred {
            queue.push(item);
        }
        drop(queue);
        self.notify.notify_one();
        info!(count, "cluster ready, deferred events requeued");
    }

    fn unsubscribe(&self, id: u64) {
        if let Some(sub) = lock(&self.subscribers).remove(&id) {
            debug!(subscriber = %sub.name, id, "unsubscribed");
        }
    }
}

/// Resolves once `rx` carries `true` or its sender is gone.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
