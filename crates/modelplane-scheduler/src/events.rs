//! Events that drive the control plane and the outputs they produce.

use modelplane_placement::AgentCommand;
use modelplane_state::{
    Experiment, ModelDefinition, ModelStatus, ModelVersionId, Pipeline, ReplicaState,
};
use serde::{Deserialize, Serialize};

/// Dispatch class. Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    /// Server lifecycle: connects, disconnects, drains.
    High = 0,
    /// Model, pipeline and experiment mutations.
    Normal = 1,
    /// Status reports from agents.
    Low = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    LoadModel,
    UnloadModel,
    ServerNotify,
    ServerReplicaConnected,
    ServerReplicaDisconnected,
    DrainServerReplica,
    ModelReplicaStatus,
    ScheduleFailedModels,
    PipelineUpsert,
    PipelineDelete,
    ExperimentUpsert,
    ExperimentDelete,
}

impl EventType {
    pub fn default_priority(self) -> Priority {
        match self {
            Self::ServerNotify
            | Self::ServerReplicaConnected
            | Self::ServerReplicaDisconnected
            | Self::DrainServerReplica => Priority::High,
            Self::ModelReplicaStatus => Priority::Low,
            Self::LoadModel
            | Self::UnloadModel
            | Self::ScheduleFailedModels
            | Self::PipelineUpsert
            | Self::PipelineDelete
            | Self::ExperimentUpsert
            | Self::ExperimentDelete => Priority::Normal,
        }
    }

    /// Events that schedule against the server set and so must wait until
    /// the cluster has been rebuilt after a restart.
    pub fn requires_ready(self) -> bool {
        matches!(
            self,
            Self::LoadModel
                | Self::UnloadModel
                | Self::ScheduleFailedModels
                | Self::PipelineUpsert
                | Self::PipelineDelete
                | Self::ExperimentUpsert
                | Self::ExperimentDelete
        )
    }
}

/// What an agent reports about its replica when it (re)connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReplicaInfo {
    pub server: String,
    pub replica_idx: u32,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub http_port: u16,
    #[serde(default)]
    pub grpc_port: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub memory: u64,
    /// Model versions the replica already has loaded.
    #[serde(default)]
    pub loaded_models: Vec<ModelVersionId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    LoadModel(ModelDefinition),
    UnloadModel {
        model: String,
    },
    ServerNotify {
        server: String,
        shared: bool,
        expected_replicas: Option<u32>,
        min_replicas: u32,
        max_replicas: u32,
    },
    ServerReplicaConnected(ServerReplicaInfo),
    ServerReplicaDisconnected {
        server: String,
        replica_idx: u32,
    },
    DrainServerReplica {
        server: String,
        replica_idx: u32,
    },
    ModelReplicaStatus {
        model: String,
        version: u32,
        server: String,
        replica_idx: u32,
        state: ReplicaState,
        reason: String,
    },
    ScheduleFailedModels,
    PipelineUpsert(Pipeline),
    PipelineDelete {
        name: String,
    },
    ExperimentUpsert(Experiment),
    ExperimentDelete {
        name: String,
    },
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::LoadModel(_) => EventType::LoadModel,
            Self::UnloadModel { .. } => EventType::UnloadModel,
            Self::ServerNotify { .. } => EventType::ServerNotify,
            Self::ServerReplicaConnected(_) => EventType::ServerReplicaConnected,
            Self::ServerReplicaDisconnected { .. } => EventType::ServerReplicaDisconnected,
            Self::DrainServerReplica { .. } => EventType::DrainServerReplica,
            Self::ModelReplicaStatus { .. } => EventType::ModelReplicaStatus,
            Self::ScheduleFailedModels => EventType::ScheduleFailedModels,
            Self::PipelineUpsert(_) => EventType::PipelineUpsert,
            Self::PipelineDelete { .. } => EventType::PipelineDelete,
            Self::ExperimentUpsert(_) => EventType::ExperimentUpsert,
            Self::ExperimentDelete { .. } => EventType::ExperimentDelete,
        }
    }

    pub fn default_priority(&self) -> Priority {
        self.event_type().default_priority()
    }
}

/// Something downstream needs to act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputEvent {
    /// Load or unload to be delivered to a server agent.
    Agent { command: AgentCommand },
    /// A model version's status after the event.
    ModelStatus {
        model: ModelVersionId,
        status: ModelStatus,
    },
    /// A deleted model has fully terminated and left the cluster.
    ModelRemoved { model: String },
    ServerReplicaConnected { server: String, replica_idx: u32 },
    /// A drain finished: each of the `rescheduled` models moved off the replica
    /// serves elsewhere, could not be placed, or is gone.
    ServerReplicaDrained {
        server: String,
        replica_idx: u32,
        rescheduled: usize,
    },
    /// A model could not fit on the server it lives on.
    ServerScaleUp {
        server: String,
        model: ModelVersionId,
    },
    PipelineRefresh { pipeline: String },
    ExperimentRefresh { experiment: String },
}

impl OutputEvent {
    pub fn agent_command(&self) -> Option<&AgentCommand> {
        match self {
            Self::Agent { command } => Some(command),
            _ => None,
        }
    }
}
