//! End-to-end control plane tests.
//!
//! Each test starts a full control plane in-process: store, coordinator,
//! synchroniser, dispatcher and drain endpoint. Agents are played by the
//! test, which receives commands through a channel transport and answers
//! with replica status events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use modelplane_agent::{AgentTransport, DispatchError};
use modelplane_placement::AgentCommand;
use modelplane_scheduler::{Event, ServerReplicaInfo};
use modelplane_state::{
    ClusterStore, KeyValueStore, ModelDefinition, ModelState, ReplicaState, StateStore,
};
use modelplaned::{ControlPlane, DaemonConfig, SynchroniserKind};
use tokio::sync::mpsc;
use tower::ServiceExt;

struct ChannelTransport {
    tx: mpsc::UnboundedSender<AgentCommand>,
}

#[async_trait]
impl AgentTransport for ChannelTransport {
    async fn send(&self, command: &AgentCommand) -> Result<(), DispatchError> {
        self.tx
            .send(command.clone())
            .map_err(|e| DispatchError::Connection(e.to_string()))
    }
}

fn test_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.store.in_memory = true;
    config.synchroniser.timeout_ms = 30_000;
    config.coordinator.retry_interval_secs = 0;
    config.drain.debounce_ms = 20;
    config
}

fn memory_store() -> Arc<dyn KeyValueStore> {
    Arc::new(StateStore::open_in_memory().unwrap())
}

async fn start(
    config: &DaemonConfig,
    kv: Arc<dyn KeyValueStore>,
) -> (ControlPlane, mpsc::UnboundedReceiver<AgentCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let plane = ControlPlane::start_with_store(config, kv, Arc::new(ChannelTransport { tx }))
        .await
        .unwrap();
    (plane, rx)
}

fn replica(idx: u32) -> Event {
    replica_with_memory(idx, 10_000)
}

fn replica_with_memory(idx: u32, memory: u64) -> Event {
    Event::ServerReplicaConnected(ServerReplicaInfo {
        server: "mlserver".into(),
        replica_idx: idx,
        address: format!("mlserver-{idx}"),
        http_port: 9000,
        grpc_port: 9500,
        capabilities: vec!["sklearn".into()],
        memory,
        loaded_models: Vec::new(),
    })
}

fn iris() -> ModelDefinition {
    let mut def = ModelDefinition::new("iris", "gs://models/iris", 1_000);
    def.requirements = vec!["sklearn".into()];
    def
}

/// Play the agent for one command: report it loaded.
fn loaded(command: &AgentCommand) -> Event {
    let id = command.model_version();
    Event::ModelReplicaStatus {
        model: id.model,
        version: id.version,
        server: command.server().to_string(),
        replica_idx: command.replica_idx(),
        state: ReplicaState::Loaded,
        reason: String::new(),
    }
}

async fn next_command(rx: &mut mpsc::UnboundedReceiver<AgentCommand>) -> AgentCommand {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no command dispatched")
        .expect("dispatcher stopped")
}

async fn assert_no_command(rx: &mut mpsc::UnboundedReceiver<AgentCommand>) {
    if let Ok(command) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        panic!("unexpected command {command:?}");
    }
}

async fn wait_for_replica(plane: &ControlPlane, idx: u32, expected: ReplicaState) {
    let store = plane.coordinator().store().clone();
    tokio::time::timeout(Duration::from_secs(5), async move {
        loop {
            let state = store.get_cluster_state().await;
            if let Ok(mv) = state.model_version("iris", 1)
                && mv.replica_state(idx) == expected
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("replica {idx} never reached {expected}"));
}

#[tokio::test]
async fn model_load_round_trip_becomes_available() {
    let (plane, mut commands) = start(&test_config(), memory_store()).await;
    let coordinator = plane.coordinator().clone();

    coordinator.submit_sync(replica(0)).await.unwrap();
    coordinator.submit_sync(Event::LoadModel(iris())).await.unwrap();

    let command = next_command(&mut commands).await;
    assert!(command.is_load());
    assert_eq!(command.server(), "mlserver");
    assert_eq!(command.replica_idx(), 0);

    coordinator.submit_sync(loaded(&command)).await.unwrap();

    let state = coordinator.store().get_cluster_state().await;
    let mv = state.model_version("iris", 1).unwrap();
    assert_eq!(mv.replica_state(0), ReplicaState::Available);
    assert_eq!(mv.status.state, ModelState::Available);

    plane.shutdown().await;
}

#[tokio::test]
async fn restart_defers_scheduling_until_known_replicas_reconnect() {
    let kv = memory_store();
    let config = test_config();

    let (first, _commands) = start(&config, kv.clone()).await;
    first.coordinator().submit_sync(replica(0)).await.unwrap();
    first.shutdown().await;

    let (second, mut commands) = start(&config, kv).await;
    assert!(!second.synchroniser().is_ready());

    second.coordinator().submit(Event::LoadModel(iris())).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        second
            .coordinator()
            .store()
            .get_cluster_state()
            .await
            .model("iris")
            .is_err(),
        "load must wait for the persisted replica"
    );
    assert_eq!(second.coordinator().stats().deferred, 1);

    second.coordinator().submit(replica(0)).unwrap();
    tokio::time::timeout(Duration::from_secs(5), second.synchroniser().wait_ready())
        .await
        .unwrap();
    assert!(second.synchroniser().is_ready());

    let command = next_command(&mut commands).await;
    assert!(command.is_load());
    assert_eq!(command.model_version().to_string(), "iris:1");

    second.shutdown().await;
}

#[tokio::test]
async fn restart_waits_for_every_known_replica_before_placing() {
    let kv = memory_store();
    let config = test_config();

    let (first, _commands) = start(&config, kv.clone()).await;
    let coordinator = first.coordinator().clone();
    coordinator.submit_sync(replica_with_memory(0, 500)).await.unwrap();
    coordinator.submit_sync(replica_with_memory(1, 500)).await.unwrap();
    coordinator.submit_sync(Event::LoadModel(iris())).await.unwrap();
    let state = coordinator.store().get_cluster_state().await;
    assert_eq!(
        state.model_version("iris", 1).unwrap().status.state,
        ModelState::ScheduleFailed
    );
    first.shutdown().await;

    let (second, mut commands) = start(&config, kv).await;
    second
        .coordinator()
        .submit_sync(replica_with_memory(0, 10_000))
        .await
        .unwrap();
    assert!(!second.synchroniser().is_ready());
    assert_no_command(&mut commands).await;

    second
        .coordinator()
        .submit_sync(replica_with_memory(1, 10_000))
        .await
        .unwrap();
    let command = next_command(&mut commands).await;
    assert!(command.is_load());
    assert_eq!(command.model_version().to_string(), "iris:1");
    assert!(second.synchroniser().is_ready());

    second.shutdown().await;
}

#[tokio::test]
async fn restart_without_returning_replica_schedules_nothing() {
    let kv = memory_store();
    let mut config = test_config();

    let (first, _commands) = start(&config, kv.clone()).await;
    first.coordinator().submit_sync(replica(0)).await.unwrap();
    first.shutdown().await;

    config.synchroniser.timeout_ms = 100;
    let (second, mut commands) = start(&config, kv).await;
    let store = second.coordinator().store().clone();
    let state = store.get_cluster_state().await;
    let server = state.server("mlserver").unwrap();
    assert!(server.replicas.is_empty(), "restored replica is not connected");
    assert!(server.absent_replicas.contains(&0));

    tokio::time::timeout(Duration::from_secs(5), second.synchroniser().wait_ready())
        .await
        .unwrap();
    second
        .coordinator()
        .submit_sync(Event::LoadModel(iris()))
        .await
        .unwrap();
    assert_no_command(&mut commands).await;

    let state = store.get_cluster_state().await;
    assert_eq!(
        state.model_version("iris", 1).unwrap().status.state,
        ModelState::ScheduleFailed
    );
    assert!(state.server("mlserver").unwrap().replicas.is_empty());

    // Readiness ends the wait for the missing replica.
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.get_cluster_state().await.known_replica_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    second.shutdown().await;
}

#[tokio::test]
async fn terminate_burst_waits_for_replacement_before_answering() {
    let mut config = test_config();
    config.drain.server = Some("mlserver".into());
    config.drain.replica_idx = 0;
    let (plane, mut commands) = start(&config, memory_store()).await;
    let coordinator = plane.coordinator().clone();

    coordinator.submit_sync(replica(0)).await.unwrap();
    coordinator.submit_sync(Event::LoadModel(iris())).await.unwrap();
    let first = next_command(&mut commands).await;
    coordinator.submit_sync(loaded(&first)).await.unwrap();
    coordinator.submit_sync(replica(1)).await.unwrap();

    let router = plane.router();
    let callers: Vec<_> = (0..3)
        .map(|_| {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .oneshot(Request::get("/terminate").body(Body::empty()).unwrap())
                    .await
                    .unwrap()
            })
        })
        .collect();

    let replacement = next_command(&mut commands).await;
    assert!(replacement.is_load());
    assert_eq!(replacement.replica_idx(), 1);
    assert!(plane.drain_controller().is_triggered());

    // Nobody is answered while the model only serves from the draining replica.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(callers.iter().all(|c| !c.is_finished()));
    let state = coordinator.store().get_cluster_state().await;
    assert!(state.replica("mlserver", 0).unwrap().is_draining);
    assert_eq!(
        state.model_version("iris", 1).unwrap().replica_state(0),
        ReplicaState::Draining
    );

    // The replacement serving releases the callers and the old copy.
    coordinator.submit_sync(loaded(&replacement)).await.unwrap();
    for caller in callers {
        let response = tokio::time::timeout(Duration::from_secs(5), caller)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let unload = next_command(&mut commands).await;
    assert!(!unload.is_load());
    assert_eq!(unload.replica_idx(), 0);
    wait_for_replica(&plane, 1, ReplicaState::Available).await;

    plane.shutdown().await;
}

#[tokio::test]
async fn simple_synchroniser_waits_out_its_timeout() {
    let mut config = test_config();
    config.synchroniser.kind = SynchroniserKind::Simple;
    config.synchroniser.timeout_ms = 50;
    let (plane, mut commands) = start(&config, memory_store()).await;

    plane.coordinator().submit_sync(replica(0)).await.unwrap();
    plane.coordinator().submit(Event::LoadModel(iris())).unwrap();

    tokio::time::timeout(Duration::from_secs(5), plane.synchroniser().wait_ready())
        .await
        .unwrap();
    assert!(next_command(&mut commands).await.is_load());

    plane.shutdown().await;
}

#[tokio::test]
async fn file_backed_state_survives_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.store.in_memory = false;
    config.store.data_dir = dir.path().join("state");

    let plane = ControlPlane::start(&config).await.unwrap();
    plane.coordinator().submit_sync(replica(0)).await.unwrap();
    plane.coordinator().submit_sync(replica(1)).await.unwrap();
    plane.shutdown().await;

    assert!(config.store.db_path().exists());
    let kv = StateStore::open(&config.store.db_path()).unwrap();
    let store = ClusterStore::new(Arc::new(kv));
    assert!(store.load().await.unwrap());
    let state = store.get_cluster_state().await;
    assert_eq!(state.server("mlserver").unwrap().replicas.len(), 2);
    assert_eq!(modelplaned::expected_replicas(&state), 2);
}
