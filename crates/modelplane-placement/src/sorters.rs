//! Candidate orderings.
//!
//! Sorters are applied one after another with a stable sort, so the last
//! sorter in a chain has the final say and earlier ones break its ties.

use std::cmp::Ordering;

use modelplane_state::{ModelVersion, Server, ServerReplica};

pub trait ServerSorter: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_less(&self, model: &ModelVersion, a: &Server, b: &Server) -> bool;
}

pub trait ReplicaSorter: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_less(&self, model: &ModelVersion, a: &ServerReplica, b: &ServerReplica) -> bool;
}

pub fn default_server_sorters() -> Vec<Box<dyn ServerSorter>> {
    vec![Box::new(ModelAlreadyLoadedOnServerSorter)]
}

pub fn default_replica_sorters() -> Vec<Box<dyn ReplicaSorter>> {
    vec![
        Box::new(ReplicaIndexSorter),
        Box::new(AvailableMemorySorter),
        Box::new(ModelAlreadyLoadedSorter),
    ]
}

/// Stable sort driven by a strict "less than" predicate.
pub(crate) fn sort_stable_by<T>(items: &mut [T], is_less: impl Fn(&T, &T) -> bool) {
    items.sort_by(|a, b| {
        if is_less(a, b) {
            Ordering::Less
        } else if is_less(b, a) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    });
}

/// Keeps a version on the server it already lives on.
pub struct ModelAlreadyLoadedOnServerSorter;

impl ServerSorter for ModelAlreadyLoadedOnServerSorter {
    fn name(&self) -> &'static str {
        "ModelAlreadyLoadedOnServerSorter"
    }

    fn is_less(&self, model: &ModelVersion, a: &Server, b: &Server) -> bool {
        let current = model.server.as_deref();
        current == Some(a.name.as_str()) && current != Some(b.name.as_str())
    }
}

/// Lower replica index first.
pub struct ReplicaIndexSorter;

impl ReplicaSorter for ReplicaIndexSorter {
    fn name(&self) -> &'static str {
        "ReplicaIndexSorter"
    }

    fn is_less(&self, _model: &ModelVersion, a: &ServerReplica, b: &ServerReplica) -> bool {
        a.replica_idx < b.replica_idx
    }
}

/// More unreserved memory first.
pub struct AvailableMemorySorter;

impl ReplicaSorter for AvailableMemorySorter {
    fn name(&self) -> &'static str {
        "AvailableMemorySorter"
    }

    fn is_less(&self, _model: &ModelVersion, a: &ServerReplica, b: &ServerReplica) -> bool {
        a.available_memory() > b.available_memory()
    }
}

/// Replicas already hosting the version first.
pub struct ModelAlreadyLoadedSorter;

impl ReplicaSorter for ModelAlreadyLoadedSorter {
    fn name(&self) -> &'static str {
        "ModelAlreadyLoadedSorter"
    }

    fn is_less(&self, model: &ModelVersion, a: &ServerReplica, b: &ServerReplica) -> bool {
        model.is_loading_or_loaded(&a.server, a.replica_idx)
            && !model.is_loading_or_loaded(&b.server, b.replica_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelplane_state::{ModelDefinition, ReplicaState};

    fn model() -> ModelVersion {
        ModelVersion::new(1, ModelDefinition::new("iris", "gs://iris", 10))
    }

    fn replica(idx: u32, reserved: u64) -> ServerReplica {
        let mut r = ServerReplica::new("mlserver", idx, 1000);
        r.reserve(reserved);
        r
    }

    fn apply(model: &ModelVersion, replicas: &mut [ServerReplica]) {
        for sorter in default_replica_sorters() {
            sort_stable_by(replicas, |a, b| sorter.is_less(model, a, b));
        }
    }

    #[test]
    fn sticky_server_sorts_first() {
        let mut m = model();
        m.server = Some("b".into());
        let mut servers = vec![Server::new("a"), Server::new("b"), Server::new("c")];
        sort_stable_by(&mut servers, |x, y| {
            ModelAlreadyLoadedOnServerSorter.is_less(&m, x, y)
        });
        let names: Vec<_> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn no_current_server_keeps_order() {
        let m = model();
        let mut servers = vec![Server::new("z"), Server::new("a")];
        sort_stable_by(&mut servers, |x, y| {
            ModelAlreadyLoadedOnServerSorter.is_less(&m, x, y)
        });
        assert_eq!(servers[0].name, "z");
    }

    #[test]
    fn replicas_ordered_by_free_memory_then_index() {
        let m = model();
        let mut replicas = vec![replica(2, 0), replica(0, 500), replica(1, 0)];
        apply(&m, &mut replicas);
        let order: Vec<_> = replicas.iter().map(|r| r.replica_idx).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn loaded_replica_wins_over_free_memory() {
        let mut m = model();
        m.server = Some("mlserver".into());
        m.set_replica_state(0, ReplicaState::Available, "");
        let mut replicas = vec![replica(1, 0), replica(0, 900)];
        apply(&m, &mut replicas);
        assert_eq!(replicas[0].replica_idx, 0);
    }
}
