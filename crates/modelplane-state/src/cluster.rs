//! The cluster-wide view: models, servers, pipelines, experiments.
//!
//! [`ClusterState`] is the unit of load and save. All replica state changes
//! that must stay consistent with server-side accounting go through
//! [`ClusterState::set_replica_state`], which keeps memory reservations and
//! the per-replica loaded/loading sets in step with the model's replica map.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::model::{Model, ModelDefinition, ModelVersion, ModelVersionId};
use crate::replica::ReplicaState;
use crate::server::{Server, ServerReplica};

/// A chain of model steps; refreshed whenever one of its models changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    #[serde(default)]
    pub version: u32,
    /// Model names in step order.
    pub steps: Vec<String>,
}

/// Traffic split across candidate models.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    #[serde(default)]
    pub default_model: Option<String>,
    pub candidates: Vec<String>,
}

impl Experiment {
    pub fn references(&self, model: &str) -> bool {
        self.default_model.as_deref() == Some(model) || self.candidates.iter().any(|c| c == model)
    }
}

/// A model version replica slot that points at a replica its server no longer has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingReplica {
    pub model: ModelVersionId,
    pub server: String,
    pub replica_idx: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    pub models: BTreeMap<String, Model>,
    #[serde(default)]
    pub servers: BTreeMap<String, Server>,
    #[serde(default)]
    pub pipelines: BTreeMap<String, Pipeline>,
    #[serde(default)]
    pub experiments: BTreeMap<String, Experiment>,
}

impl ClusterState {
    // ── Lookups ────────────────────────────────────────────────────

    pub fn model(&self, name: &str) -> StateResult<&Model> {
        self.models
            .get(name)
            .ok_or_else(|| StateError::ModelNotFound(name.to_string()))
    }

    pub fn model_mut(&mut self, name: &str) -> StateResult<&mut Model> {
        self.models
            .get_mut(name)
            .ok_or_else(|| StateError::ModelNotFound(name.to_string()))
    }

    pub fn model_version(&self, name: &str, version: u32) -> StateResult<&ModelVersion> {
        self.model(name)?
            .version(version)
            .ok_or_else(|| StateError::VersionNotFound {
                model: name.to_string(),
                version,
            })
    }

    pub fn server(&self, name: &str) -> StateResult<&Server> {
        self.servers
            .get(name)
            .ok_or_else(|| StateError::ServerNotFound(name.to_string()))
    }

    pub fn server_mut(&mut self, name: &str) -> StateResult<&mut Server> {
        self.servers
            .get_mut(name)
            .ok_or_else(|| StateError::ServerNotFound(name.to_string()))
    }

    pub fn replica(&self, server: &str, idx: u32) -> StateResult<&ServerReplica> {
        self.server(server)?
            .replica(idx)
            .ok_or_else(|| StateError::ReplicaNotFound {
                server: server.to_string(),
                replica_idx: idx,
            })
    }

    // ── Models ─────────────────────────────────────────────────────

    /// Create or re-version a model from a submitted definition.
    ///
    /// Returns the version that should now be scheduled.
    pub fn upsert_model(&mut self, definition: ModelDefinition) -> StateResult<u32> {
        definition.validate()?;
        let name = definition.name.clone();
        match self.models.get_mut(&name) {
            Some(model) => model.apply_definition(definition),
            None => {
                let model = Model::new(definition);
                let version = model.latest().map(|v| v.version).unwrap_or(1);
                self.models.insert(name, model);
                Ok(version)
            }
        }
    }

    /// Drop a deleted model once nothing of it remains on any replica.
    pub fn remove_model_if_terminated(&mut self, name: &str) -> bool {
        let done = self
            .models
            .get(name)
            .is_some_and(|m| m.deleted && m.is_fully_inactive());
        if done {
            self.models.remove(name);
            debug!(model = %name, "terminated model removed");
        }
        done
    }

    /// Move replica `idx` of `model:version` to `state`.
    ///
    /// Memory on the server replica is reserved while the version is active
    /// there and released when it becomes inactive. Returns the previous state.
    pub fn set_replica_state(
        &mut self,
        model: &str,
        version: u32,
        idx: u32,
        state: ReplicaState,
        reason: impl Into<String>,
    ) -> StateResult<ReplicaState> {
        let mv = self
            .models
            .get_mut(model)
            .ok_or_else(|| StateError::ModelNotFound(model.to_string()))?
            .version_mut(version)
            .ok_or_else(|| StateError::VersionNotFound {
                model: model.to_string(),
                version,
            })?;
        let server_name = mv.server.clone().ok_or_else(|| StateError::Invalid {
            field: "server",
            reason: format!("{model}:{version} is not assigned to a server"),
        })?;

        let previous = mv.set_replica_state(idx, state, reason);
        let required = mv.required_memory();
        let id = mv.id();

        let Some(replica) = self
            .servers
            .get_mut(&server_name)
            .and_then(|s| s.replicas.get_mut(&idx))
        else {
            debug!(%id, server = %server_name, replica = idx, "state change on missing replica");
            return Ok(previous);
        };

        if previous.is_inactive() && !state.is_inactive() {
            replica.reserve(required);
        } else if !previous.is_inactive() && state.is_inactive() {
            replica.release(required);
        }

        replica.loading_models.remove(&id);
        replica.loaded_models.remove(&id);
        if matches!(state, ReplicaState::LoadRequested | ReplicaState::Loading) {
            replica.loading_models.insert(id);
        } else if state.can_receive_traffic() {
            replica.loaded_models.insert(id);
        }

        Ok(previous)
    }

    // ── Servers ────────────────────────────────────────────────────

    /// Model versions that are active on `server:idx`.
    pub fn models_on_replica(&self, server: &str, idx: u32) -> Vec<ModelVersionId> {
        let mut out = Vec::new();
        for model in self.models.values() {
            for mv in &model.versions {
                if mv.server.as_deref() == Some(server) && !mv.replica_state(idx).is_inactive() {
                    out.push(mv.id());
                }
            }
        }
        out
    }

    /// Recompute a replica's reservation and model sets from the model side.
    ///
    /// Used when a replica record is replaced (agent reconnect) so its
    /// accounting matches the replica states the models still hold for it.
    pub fn rebuild_replica_accounting(&mut self, server: &str, idx: u32) {
        let mut reserved = 0u64;
        let mut loaded = BTreeSet::new();
        let mut loading = BTreeSet::new();
        for model in self.models.values() {
            for mv in &model.versions {
                if mv.server.as_deref() != Some(server) {
                    continue;
                }
                let state = mv.replica_state(idx);
                if !state.is_inactive() {
                    reserved = reserved.saturating_add(mv.required_memory());
                }
                if matches!(state, ReplicaState::LoadRequested | ReplicaState::Loading) {
                    loading.insert(mv.id());
                } else if state.can_receive_traffic() {
                    loaded.insert(mv.id());
                }
            }
        }
        if let Some(replica) = self
            .servers
            .get_mut(server)
            .and_then(|s| s.replicas.get_mut(&idx))
        {
            replica.reserved_memory = reserved;
            replica.loaded_models = loaded;
            replica.loading_models = loading;
        }
    }

    /// Turn every server replica record into an absent marker.
    ///
    /// Replica records describe live agent connections. After a restart they
    /// only tell how many agents to wait for; each agent re-registers its
    /// replica on connect. Model replica slots are kept so reconnecting agents
    /// can be matched against them.
    pub fn clear_replicas(&mut self) {
        for server in self.servers.values_mut() {
            let known: Vec<u32> = server.replicas.keys().copied().collect();
            server.absent_replicas.extend(known);
            server.replicas.clear();
        }
    }

    /// Server replicas seen before, connected or still awaited.
    pub fn known_replica_count(&self) -> usize {
        self.servers
            .values()
            .map(|s| s.replicas.len() + s.absent_replicas.len())
            .sum()
    }

    /// Stop waiting for replicas that never came back. Returns how many.
    pub fn forget_absent_replicas(&mut self) -> usize {
        let mut forgotten = 0;
        for server in self.servers.values_mut() {
            forgotten += server.absent_replicas.len();
            server.absent_replicas.clear();
        }
        forgotten
    }

    /// Replica slots whose server or replica index has disappeared.
    pub fn dangling_replicas(&self) -> Vec<DanglingReplica> {
        let mut out = Vec::new();
        for model in self.models.values() {
            for mv in &model.versions {
                let Some(server) = mv.server.as_deref() else {
                    continue;
                };
                for (idx, status) in &mv.replicas {
                    if status.state.is_inactive() {
                        continue;
                    }
                    let exists = self
                        .servers
                        .get(server)
                        .is_some_and(|s| s.replicas.contains_key(idx));
                    if !exists {
                        out.push(DanglingReplica {
                            model: mv.id(),
                            server: server.to_string(),
                            replica_idx: *idx,
                        });
                    }
                }
            }
        }
        out
    }

    // ── Pipelines & experiments ────────────────────────────────────

    pub fn pipelines_using_model(&self, model: &str) -> Vec<String> {
        self.pipelines
            .values()
            .filter(|p| p.steps.iter().any(|s| s == model))
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn experiments_using_model(&self, model: &str) -> Vec<String> {
        self.experiments
            .values()
            .filter(|e| e.references(model))
            .map(|e| e.name.clone())
            .collect()
    }
}
