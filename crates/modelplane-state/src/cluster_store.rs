//! ClusterStore: the locked, persisted cluster view.
//!
//! Readers get a cloned snapshot and never hold the lock across awaits.
//! Writers go through [`ClusterStore::update`], which mutates a copy and only
//! swaps it in (and persists it) when the closure succeeds, so a rejected
//! event leaves both memory and disk untouched.
//!
//! Writes are conditional on the snapshot version this store last loaded or
//! wrote. A second writer on the same key/value store makes the next write
//! fail with [`StateError::VersionConflict`] instead of overwriting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::cluster::ClusterState;
use crate::error::{StateError, StateResult};
use crate::store::{KeyValueStore, StateStore};

/// Key the whole cluster snapshot is persisted under.
pub const CLUSTER_STATE_KEY: &str = "cluster/state";

pub struct ClusterStore {
    kv: Arc<dyn KeyValueStore>,
    state: RwLock<ClusterState>,
    /// Snapshot version last seen; 0 while nothing is persisted.
    version: AtomicU64,
}

impl ClusterStore {
    /// Start from an empty cluster, persisting through `kv`.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            state: RwLock::new(ClusterState::default()),
            version: AtomicU64::new(0),
        }
    }

    /// Empty cluster on an in-memory redb backend.
    pub fn in_memory() -> StateResult<Self> {
        Ok(Self::new(Arc::new(StateStore::open_in_memory()?)))
    }

    /// Underlying key/value store.
    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    /// Replace the in-memory view with the persisted snapshot, if any.
    ///
    /// Returns whether a snapshot was found.
    pub async fn load(&self) -> StateResult<bool> {
        let Some(stored) = self.kv.get(CLUSTER_STATE_KEY)? else {
            debug!("no persisted cluster state");
            return Ok(false);
        };
        let restored: ClusterState = serde_json::from_slice(&stored.value)
            .map_err(|e| StateError::Deserialize(e.to_string()))?;
        info!(
            models = restored.models.len(),
            servers = restored.servers.len(),
            version = stored.version,
            "cluster state restored"
        );
        *self.state.write().await = restored;
        self.version.store(stored.version, Ordering::Release);
        Ok(true)
    }

    /// Point-in-time copy of the cluster.
    pub async fn get_cluster_state(&self) -> ClusterState {
        self.state.read().await.clone()
    }

    /// Persist `state` and make it the current view.
    pub async fn save_cluster_state(&self, state: ClusterState) -> StateResult<()> {
        let mut guard = self.state.write().await;
        self.persist(&state)?;
        *guard = state;
        Ok(())
    }

    /// Apply `f` to a copy of the cluster and commit it if `f` succeeds.
    pub async fn update<T, E>(
        &self,
        f: impl FnOnce(&mut ClusterState) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StateError>,
    {
        let mut guard = self.state.write().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        if next != *guard {
            self.persist(&next)?;
            *guard = next;
        }
        Ok(out)
    }

    fn persist(&self, state: &ClusterState) -> StateResult<()> {
        let bytes = serde_json::to_vec(state).map_err(|e| StateError::Serialize(e.to_string()))?;
        let expected = self.version.load(Ordering::Acquire);
        let version = self.kv.set_if_version(CLUSTER_STATE_KEY, &bytes, expected)?;
        self.version.store(version, Ordering::Release);
        debug!(version, bytes = bytes.len(), "cluster state persisted");
        Ok(())
    }
}
