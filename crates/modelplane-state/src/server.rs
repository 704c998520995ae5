//! Inference servers and their replicas.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::ModelVersionId;

/// A named group of interchangeable replicas (one runtime deployment).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    /// Shared servers accept any model that does not pin a server.
    #[serde(default = "default_shared")]
    pub shared: bool,
    /// Replica count the orchestrator intends to run. `None` while unknown,
    /// `Some(0)` once the server is being deleted.
    #[serde(default)]
    pub expected_replicas: Option<u32>,
    #[serde(default)]
    pub min_replicas: u32,
    #[serde(default)]
    pub max_replicas: u32,
    #[serde(default)]
    pub replicas: BTreeMap<u32, ServerReplica>,
    /// Replicas known before a restart that have not connected since.
    #[serde(default)]
    pub absent_replicas: BTreeSet<u32>,
}

fn default_shared() -> bool {
    true
}

impl Server {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: true,
            expected_replicas: None,
            min_replicas: 0,
            max_replicas: 0,
            replicas: BTreeMap::new(),
            absent_replicas: BTreeSet::new(),
        }
    }

    pub fn replica(&self, idx: u32) -> Option<&ServerReplica> {
        self.replicas.get(&idx)
    }

    pub fn replica_mut(&mut self, idx: u32) -> Option<&mut ServerReplica> {
        self.replicas.get_mut(&idx)
    }

    /// The server has been told to go away.
    pub fn is_deleted(&self) -> bool {
        self.expected_replicas == Some(0)
    }
}

/// One running instance of a server, as reported by its agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerReplica {
    /// Name of the owning [`Server`].
    pub server: String,
    pub replica_idx: u32,
    /// Inference service host.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub http_port: u16,
    #[serde(default)]
    pub grpc_port: u16,
    /// Capabilities advertised by the runtime, e.g. `sklearn`, `alibi-explain`.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Total model memory in bytes.
    pub memory: u64,
    /// Memory held by model versions that are active on this replica.
    #[serde(default)]
    pub reserved_memory: u64,
    #[serde(default)]
    pub is_draining: bool,
    /// Models moved off this replica by a drain that are not yet serving
    /// elsewhere. Empty once the drain has been reported.
    #[serde(default)]
    pub drain_pending: BTreeSet<String>,
    #[serde(default)]
    pub loaded_models: BTreeSet<ModelVersionId>,
    #[serde(default)]
    pub loading_models: BTreeSet<ModelVersionId>,
}

impl ServerReplica {
    pub fn new(server: impl Into<String>, replica_idx: u32, memory: u64) -> Self {
        Self {
            server: server.into(),
            replica_idx,
            address: String::new(),
            http_port: 0,
            grpc_port: 0,
            capabilities: BTreeSet::new(),
            memory,
            reserved_memory: 0,
            is_draining: false,
            drain_pending: BTreeSet::new(),
            loaded_models: BTreeSet::new(),
            loading_models: BTreeSet::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    /// Memory not held by any active model version.
    pub fn available_memory(&self) -> u64 {
        self.memory.saturating_sub(self.reserved_memory)
    }

    pub fn reserve(&mut self, bytes: u64) {
        self.reserved_memory = self.reserved_memory.saturating_add(bytes);
    }

    pub fn release(&mut self, bytes: u64) {
        self.reserved_memory = self.reserved_memory.saturating_sub(bytes);
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.capabilities.contains(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_memory_never_underflows() {
        let mut r = ServerReplica::new("mlserver", 0, 1000);
        r.reserve(600);
        r.reserve(600);
        assert_eq!(r.available_memory(), 0);
        r.release(10_000);
        assert_eq!(r.reserved_memory, 0);
        assert_eq!(r.available_memory(), 1000);
    }

    #[test]
    fn deleted_only_when_expected_is_zero() {
        let mut s = Server::new("mlserver");
        assert!(!s.is_deleted());
        s.expected_replicas = Some(0);
        assert!(s.is_deleted());
    }

    #[test]
    fn shared_defaults_to_true_when_absent() {
        let s: Server = serde_json::from_str(r#"{"name":"triton"}"#).unwrap();
        assert!(s.shared);
        assert!(s.replicas.is_empty());
    }
}
