//! Candidate filters.
//!
//! A filter is a pure predicate over (model version, candidate). Each one
//! also describes itself for the candidate it rejected, so an unschedulable
//! model can say exactly which rule kept it off which server.

use modelplane_state::model::EXPLAINER_CAPABILITY;
use modelplane_state::{ModelVersion, Server, ServerReplica};

/// Decides whether a whole server may host a model version.
pub trait ServerFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn filter(&self, model: &ModelVersion, server: &Server) -> bool;
    fn description(&self, model: &ModelVersion, server: &Server) -> String;
}

/// Decides whether one replica of a surviving server may host a model version.
pub trait ReplicaFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn filter(&self, model: &ModelVersion, replica: &ServerReplica) -> bool;
    fn description(&self, model: &ModelVersion, replica: &ServerReplica) -> String;
}

/// Server filters in evaluation order.
pub fn default_server_filters() -> Vec<Box<dyn ServerFilter>> {
    vec![
        Box::new(ServerReplicaFilter),
        Box::new(SharingServerFilter),
        Box::new(DeletedServerFilter),
        Box::new(ServerRequirementFilter),
    ]
}

/// Replica filters in evaluation order.
pub fn default_replica_filters() -> Vec<Box<dyn ReplicaFilter>> {
    vec![
        Box::new(AvailableMemoryReplicaFilter),
        Box::new(ExplainerFilter),
        Box::new(ReplicaDrainingFilter),
    ]
}

// ── Server filters ─────────────────────────────────────────────────

/// Unpinned models go to shared servers; pinned models go to their server only.
pub struct SharingServerFilter;

impl ServerFilter for SharingServerFilter {
    fn name(&self) -> &'static str {
        "SharingServerFilter"
    }

    fn filter(&self, model: &ModelVersion, server: &Server) -> bool {
        match model.definition.server.as_deref() {
            None => server.shared,
            Some(requested) => requested == server.name,
        }
    }

    fn description(&self, model: &ModelVersion, server: &Server) -> String {
        match model.definition.server.as_deref() {
            None => format!("model requests no server, server {} shared={}", server.name, server.shared),
            Some(requested) => format!("model requests server {requested}, candidate is {}", server.name),
        }
    }
}

/// The server has at least one connected replica.
pub struct ServerReplicaFilter;

impl ServerFilter for ServerReplicaFilter {
    fn name(&self) -> &'static str {
        "ServerReplicaFilter"
    }

    fn filter(&self, _model: &ModelVersion, server: &Server) -> bool {
        !server.replicas.is_empty()
    }

    fn description(&self, _model: &ModelVersion, server: &Server) -> String {
        format!("server has {} replicas", server.replicas.len())
    }
}

/// Every required capability is advertised by the server.
///
/// Replicas of one server run the same runtime, so any one of them speaks
/// for the server. A server with no replicas advertises nothing.
pub struct ServerRequirementFilter;

impl ServerRequirementFilter {
    fn missing<'a>(model: &'a ModelVersion, server: &Server) -> Vec<&'a str> {
        let Some(replica) = server.replicas.values().next() else {
            return model.definition.requirements.iter().map(String::as_str).collect();
        };
        model
            .definition
            .requirements
            .iter()
            .filter(|req| !replica.has_capability(req))
            .map(String::as_str)
            .collect()
    }
}

impl ServerFilter for ServerRequirementFilter {
    fn name(&self) -> &'static str {
        "ServerRequirementFilter"
    }

    fn filter(&self, model: &ModelVersion, server: &Server) -> bool {
        !server.replicas.is_empty() && Self::missing(model, server).is_empty()
    }

    fn description(&self, model: &ModelVersion, server: &Server) -> String {
        if server.replicas.is_empty() {
            return "server has no replicas to read capabilities from".to_string();
        }
        format!(
            "model requirements {:?}, missing {:?}",
            model.definition.requirements,
            Self::missing(model, server)
        )
    }
}

/// The server is not scheduled for deletion.
pub struct DeletedServerFilter;

impl ServerFilter for DeletedServerFilter {
    fn name(&self) -> &'static str {
        "DeletedServerFilter"
    }

    fn filter(&self, _model: &ModelVersion, server: &Server) -> bool {
        !server.is_deleted()
    }

    fn description(&self, _model: &ModelVersion, server: &Server) -> String {
        format!("expected replicas {:?}", server.expected_replicas)
    }
}

// ── Replica filters ────────────────────────────────────────────────

/// Explainer models need a replica that can run explainers.
pub struct ExplainerFilter;

impl ReplicaFilter for ExplainerFilter {
    fn name(&self) -> &'static str {
        "ExplainerFilter"
    }

    fn filter(&self, model: &ModelVersion, replica: &ServerReplica) -> bool {
        !model.definition.explainer || replica.has_capability(EXPLAINER_CAPABILITY)
    }

    fn description(&self, model: &ModelVersion, replica: &ServerReplica) -> String {
        format!(
            "explainer={} replica capabilities {:?}",
            model.definition.explainer, replica.capabilities
        )
    }
}

/// Draining replicas take no new models.
pub struct ReplicaDrainingFilter;

impl ReplicaFilter for ReplicaDrainingFilter {
    fn name(&self) -> &'static str {
        "ReplicaDrainingFilter"
    }

    fn filter(&self, _model: &ModelVersion, replica: &ServerReplica) -> bool {
        !replica.is_draining
    }

    fn description(&self, _model: &ModelVersion, replica: &ServerReplica) -> String {
        format!("replica draining={}", replica.is_draining)
    }
}

/// Enough unreserved memory, unless the version already holds memory here.
pub struct AvailableMemoryReplicaFilter;

impl ReplicaFilter for AvailableMemoryReplicaFilter {
    fn name(&self) -> &'static str {
        "AvailableMemoryReplicaFilter"
    }

    fn filter(&self, model: &ModelVersion, replica: &ServerReplica) -> bool {
        replica.available_memory() >= model.required_memory()
            || model.is_loading_or_loaded(&replica.server, replica.replica_idx)
    }

    fn description(&self, model: &ModelVersion, replica: &ServerReplica) -> String {
        format!(
            "model requires {} bytes, replica has {} of {} available",
            model.required_memory(),
            replica.available_memory(),
            replica.memory
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelplane_state::{ModelDefinition, ReplicaState};

    fn make_model(requirements: &[&str], memory: u64) -> ModelVersion {
        let mut d = ModelDefinition::new("iris", "gs://iris", memory);
        d.requirements = requirements.iter().map(|s| s.to_string()).collect();
        ModelVersion::new(1, d)
    }

    fn make_server(name: &str, caps: &[&str]) -> Server {
        let mut s = Server::new(name);
        s.replicas.insert(
            0,
            ServerReplica::new(name, 0, 1000).with_capabilities(caps.iter().copied()),
        );
        s
    }

    #[test]
    fn sharing_filter_routes_pinned_and_unpinned_models() {
        let mut private = make_server("private", &[]);
        private.shared = false;
        let shared = make_server("shared", &[]);

        let unpinned = make_model(&[], 1);
        assert!(SharingServerFilter.filter(&unpinned, &shared));
        assert!(!SharingServerFilter.filter(&unpinned, &private));

        let mut pinned = make_model(&[], 1);
        pinned.definition.server = Some("private".into());
        assert!(SharingServerFilter.filter(&pinned, &private));
        assert!(!SharingServerFilter.filter(&pinned, &shared));
    }

    #[test]
    fn requirement_filter_needs_every_capability() {
        let server = make_server("mlserver", &["sklearn", "xgboost"]);
        assert!(ServerRequirementFilter.filter(&make_model(&["sklearn"], 1), &server));
        assert!(ServerRequirementFilter.filter(&make_model(&[], 1), &server));
        assert!(!ServerRequirementFilter.filter(&make_model(&["sklearn", "gpu"], 1), &server));
    }

    #[test]
    fn requirement_filter_fails_closed_without_replicas() {
        let server = Server::new("empty");
        assert!(!ServerRequirementFilter.filter(&make_model(&[], 1), &server));
    }

    #[test]
    fn requirement_description_names_missing_capability() {
        let server = make_server("mlserver", &["sklearn"]);
        let desc = ServerRequirementFilter.description(&make_model(&["gpu"], 1), &server);
        assert!(desc.contains("gpu"), "{desc}");
    }

    #[test]
    fn deleted_server_filter() {
        let mut server = make_server("mlserver", &[]);
        assert!(DeletedServerFilter.filter(&make_model(&[], 1), &server));
        server.expected_replicas = Some(2);
        assert!(DeletedServerFilter.filter(&make_model(&[], 1), &server));
        server.expected_replicas = Some(0);
        assert!(!DeletedServerFilter.filter(&make_model(&[], 1), &server));
    }

    #[test]
    fn replica_filter_rejects_empty_server() {
        assert!(!ServerReplicaFilter.filter(&make_model(&[], 1), &Server::new("x")));
    }

    #[test]
    fn explainer_needs_capability() {
        let mut model = make_model(&[], 1);
        model.definition.explainer = true;
        let plain = ServerReplica::new("s", 0, 10);
        let explain = ServerReplica::new("s", 1, 10).with_capabilities([EXPLAINER_CAPABILITY]);
        assert!(!ExplainerFilter.filter(&model, &plain));
        assert!(ExplainerFilter.filter(&model, &explain));
        assert!(ExplainerFilter.filter(&make_model(&[], 1), &plain));
    }

    #[test]
    fn draining_replica_rejected() {
        let mut replica = ServerReplica::new("s", 0, 10);
        assert!(ReplicaDrainingFilter.filter(&make_model(&[], 1), &replica));
        replica.is_draining = true;
        assert!(!ReplicaDrainingFilter.filter(&make_model(&[], 1), &replica));
    }

    #[test]
    fn memory_filter_checks_unreserved_memory() {
        let mut replica = ServerReplica::new("s", 0, 1000);
        replica.reserve(600);
        assert!(AvailableMemoryReplicaFilter.filter(&make_model(&[], 400), &replica));
        assert!(!AvailableMemoryReplicaFilter.filter(&make_model(&[], 401), &replica));
    }

    #[test]
    fn memory_filter_passes_where_already_loaded() {
        let mut replica = ServerReplica::new("s", 0, 1000);
        replica.reserve(1000);
        let mut model = make_model(&[], 500);
        model.server = Some("s".into());
        model.set_replica_state(0, ReplicaState::Available, "");
        assert!(AvailableMemoryReplicaFilter.filter(&model, &replica));

        let other = ServerReplica::new("s", 1, 100);
        assert!(!AvailableMemoryReplicaFilter.filter(&model, &other));
    }
}
