//! modelplane-state: cluster state for the modelplane control plane.
//!
//! Holds the authoritative view of which model versions live on which
//! server replicas, the replica lifecycle state machine that governs them,
//! and a redb-backed key/value store the whole view is persisted through.
//!
//! # Components
//!
//! - [`replica`]: replica lifecycle states and their classification predicates
//! - [`model`]: models, versions, definitions, and per-replica status maps
//! - [`server`]: servers and their replicas, with memory reservation
//! - [`cluster`]: the [`ClusterState`] aggregate plus pipelines and experiments
//! - [`store`]: the [`KeyValueStore`] contract and its redb implementation
//! - [`cluster_store`]: [`ClusterStore`], the locked, persisted cluster view
//!
//! # Architecture
//!
//! Servers and replicas are plain records in maps keyed by name and index.
//! A replica refers to its server by name only, and a model version refers
//! to its replicas by index on the server it names. There are no
//! back-pointers; lookups go through [`ClusterState`].

pub mod cluster;
pub mod cluster_store;
pub mod error;
pub mod model;
pub mod replica;
pub mod server;
pub mod store;
pub mod tables;

pub use cluster::{ClusterState, DanglingReplica, Experiment, Pipeline};
pub use cluster_store::ClusterStore;
pub use error::{StateError, StateResult};
pub use model::{
    Model, ModelDefinition, ModelRuntime, ModelState, ModelStatus, ModelVersion, ModelVersionId,
};
pub use replica::{ReplicaState, ReplicaStatus};
pub use server::{Server, ServerReplica};
pub use store::{KeyValueStore, StateStore, Versioned};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
