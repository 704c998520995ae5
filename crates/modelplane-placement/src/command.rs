//! Commands the placement engine emits for server agents.

use std::fmt;

use modelplane_state::{ClusterState, ModelVersionId, ReplicaState};
use serde::{Deserialize, Serialize};

/// A load or unload of one model version on one server replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AgentCommand {
    LoadModel {
        server: String,
        replica_idx: u32,
        model: String,
        version: u32,
    },
    UnloadModel {
        server: String,
        replica_idx: u32,
        model: String,
        version: u32,
    },
}

impl AgentCommand {
    pub fn load(server: &str, replica_idx: u32, id: &ModelVersionId) -> Self {
        Self::LoadModel {
            server: server.to_string(),
            replica_idx,
            model: id.model.clone(),
            version: id.version,
        }
    }

    pub fn unload(server: &str, replica_idx: u32, id: &ModelVersionId) -> Self {
        Self::UnloadModel {
            server: server.to_string(),
            replica_idx,
            model: id.model.clone(),
            version: id.version,
        }
    }

    pub fn server(&self) -> &str {
        match self {
            Self::LoadModel { server, .. } | Self::UnloadModel { server, .. } => server,
        }
    }

    pub fn replica_idx(&self) -> u32 {
        match self {
            Self::LoadModel { replica_idx, .. } | Self::UnloadModel { replica_idx, .. } => {
                *replica_idx
            }
        }
    }

    pub fn model_version(&self) -> ModelVersionId {
        match self {
            Self::LoadModel { model, version, .. } | Self::UnloadModel { model, version, .. } => {
                ModelVersionId::new(model.clone(), *version)
            }
        }
    }

    pub fn is_load(&self) -> bool {
        matches!(self, Self::LoadModel { .. })
    }
}

impl fmt::Display for AgentCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.is_load() { "load" } else { "unload" };
        write!(
            f,
            "{op} {} on {}:{}",
            self.model_version(),
            self.server(),
            self.replica_idx()
        )
    }
}

/// Commands for every replica still waiting on an agent to act.
///
/// A replica sits in `LoadRequested` or `UnloadRequested` from the moment its
/// command is emitted until the agent reports back, so resending these is
/// enough to recover commands that were never delivered.
pub fn pending_commands(state: &ClusterState) -> Vec<AgentCommand> {
    let mut out = Vec::new();
    for model in state.models.values() {
        for mv in &model.versions {
            let Some(server) = mv.server.as_deref() else {
                continue;
            };
            let id = mv.id();
            for (idx, status) in &mv.replicas {
                match status.state {
                    ReplicaState::LoadRequested => out.push(AgentCommand::load(server, *idx, &id)),
                    ReplicaState::UnloadRequested => {
                        out.push(AgentCommand::unload(server, *idx, &id))
                    }
                    _ => {}
                }
            }
        }
    }
    out
}
