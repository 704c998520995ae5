//! Placement engine: turns a model's desired replica count into assignments.
//!
//! Scheduling a model:
//! 1. Deleted (or scaled-to-zero) models are unloaded everywhere.
//! 2. Server filters prune servers; server sorters rank the rest.
//! 3. Per server, replica filters prune replicas; replica sorters rank them.
//! 4. The first server with enough eligible replicas for the desired count
//!    wins. If none has, the first with at least the minimum count wins.
//! 5. The chosen replicas are diffed against the current assignment and the
//!    difference becomes `LoadModel` / `UnloadModel` commands.
//!
//! Every decision is applied to the [`ClusterState`] passed in; callers run
//! the engine inside [`ClusterStore::update`](modelplane_state::ClusterStore::update)
//! so a failed scheduling pass never leaves half-applied state behind.

use std::collections::BTreeSet;

use modelplane_state::{ClusterState, ModelVersion, ModelVersionId, ReplicaState};
use tracing::{debug, info, warn};

use crate::command::AgentCommand;
use crate::error::{PlacementError, PlacementResult};
use crate::filters::{ReplicaFilter, ServerFilter, default_replica_filters, default_server_filters};
use crate::sorters::{
    ReplicaSorter, ServerSorter, default_replica_sorters, default_server_sorters, sort_stable_by,
};

/// Why one candidate was not used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub server: String,
    /// `None` when the whole server was rejected.
    pub replica_idx: Option<u32>,
    pub filter: &'static str,
    pub reason: String,
}

/// No server could take the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoCandidates {
    pub model: ModelVersionId,
    /// One entry per rejected server or replica, in evaluation order.
    pub rejections: Vec<Rejection>,
    /// The server the model already lives on, which would need more replicas.
    pub scale_up: Option<String>,
}

impl NoCandidates {
    pub fn summary(&self) -> String {
        if self.rejections.is_empty() {
            return "no servers available".to_string();
        }
        let parts: Vec<String> = self
            .rejections
            .iter()
            .map(|r| match r.replica_idx {
                Some(idx) => format!("{}:{} {} ({})", r.server, idx, r.filter, r.reason),
                None => format!("{} {} ({})", r.server, r.filter, r.reason),
            })
            .collect();
        parts.join("; ")
    }
}

/// Result of scheduling one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// The latest version is assigned to `replicas` on `server`.
    Scheduled {
        model: ModelVersionId,
        server: String,
        replicas: Vec<u32>,
        commands: Vec<AgentCommand>,
    },
    /// The model is deleted or scaled to zero; its replicas are being released.
    Unloaded {
        model: String,
        commands: Vec<AgentCommand>,
    },
    Unschedulable(NoCandidates),
}

impl Placement {
    pub fn commands(&self) -> &[AgentCommand] {
        match self {
            Self::Scheduled { commands, .. } | Self::Unloaded { commands, .. } => commands,
            Self::Unschedulable(_) => &[],
        }
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled { .. })
    }
}

/// A server that passed the server filters, with its eligible replicas ranked.
struct Candidate {
    server: String,
    replicas: Vec<u32>,
}

pub struct PlacementEngine {
    server_filters: Vec<Box<dyn ServerFilter>>,
    replica_filters: Vec<Box<dyn ReplicaFilter>>,
    server_sorters: Vec<Box<dyn ServerSorter>>,
    replica_sorters: Vec<Box<dyn ReplicaSorter>>,
}

impl Default for PlacementEngine {
    fn default() -> Self {
        Self::new(
            default_server_filters(),
            default_replica_filters(),
            default_server_sorters(),
            default_replica_sorters(),
        )
    }
}

impl PlacementEngine {
    pub fn new(
        server_filters: Vec<Box<dyn ServerFilter>>,
        replica_filters: Vec<Box<dyn ReplicaFilter>>,
        server_sorters: Vec<Box<dyn ServerSorter>>,
        replica_sorters: Vec<Box<dyn ReplicaSorter>>,
    ) -> Self {
        Self {
            server_filters,
            replica_filters,
            server_sorters,
            replica_sorters,
        }
    }

    /// Place (or unplace) the latest version of `model_name`.
    pub fn schedule(&self, state: &mut ClusterState, model_name: &str) -> PlacementResult<Placement> {
        let model = state.model(model_name)?;
        let latest = model
            .latest()
            .cloned()
            .ok_or_else(|| PlacementError::NoVersions(model_name.to_string()))?;

        if model.deleted {
            let versions: Vec<u32> = model.versions.iter().map(|v| v.version).collect();
            let mut commands = Vec::new();
            for version in versions {
                commands.extend(self.unload_version(state, model_name, version)?);
            }
            state.model_mut(model_name)?.refresh_statuses();
            info!(model = %model_name, unloads = commands.len(), "deleted model unloading");
            return Ok(Placement::Unloaded {
                model: model_name.to_string(),
                commands,
            });
        }

        if latest.desired_replicas() == 0 {
            let commands = self.unload_version(state, model_name, latest.version)?;
            state.model_mut(model_name)?.refresh_statuses();
            info!(model = %model_name, unloads = commands.len(), "model scaled to zero");
            return Ok(Placement::Unloaded {
                model: model_name.to_string(),
                commands,
            });
        }

        let mut rejections = Vec::new();
        let candidates = self.candidates(state, &latest, &mut rejections);
        let desired = latest.desired_replicas() as usize;
        let min = latest.min_replicas() as usize;

        let chosen = candidates
            .iter()
            .find(|c| c.replicas.len() >= desired)
            .map(|c| (c, desired))
            .or_else(|| {
                (min > 0)
                    .then(|| candidates.iter().find(|c| c.replicas.len() >= min))
                    .flatten()
                    .map(|c| (c, c.replicas.len().min(desired)))
            });

        let Some((candidate, count)) = chosen else {
            for c in &candidates {
                rejections.push(Rejection {
                    server: c.server.clone(),
                    replica_idx: None,
                    filter: "ReplicaCount",
                    reason: format!("{} eligible replicas, need {desired}", c.replicas.len()),
                });
            }
            return self.fail(state, &latest, rejections);
        };

        if count < desired {
            warn!(
                model = %latest.id(),
                server = %candidate.server,
                placed = count,
                desired,
                "partially scheduled at min replicas"
            );
        }

        let server = candidate.server.clone();
        let replicas: Vec<u32> = candidate.replicas[..count].to_vec();
        let (id, commands) = self.apply_assignment(state, model_name, latest.version, &server, &replicas)?;
        info!(model = %id, %server, ?replicas, commands = commands.len(), "model scheduled");
        Ok(Placement::Scheduled {
            model: id,
            server,
            replicas,
            commands,
        })
    }

    /// Unload up to `count` replicas of the latest version.
    ///
    /// Victims are chosen draining first, then replicas that are not serving
    /// yet, then the highest index.
    pub fn deassign(
        &self,
        state: &mut ClusterState,
        model_name: &str,
        count: u32,
    ) -> PlacementResult<Vec<AgentCommand>> {
        let latest = state
            .model(model_name)?
            .latest()
            .cloned()
            .ok_or_else(|| PlacementError::NoVersions(model_name.to_string()))?;

        let mut victims: Vec<(u32, ReplicaState)> = latest
            .replicas
            .iter()
            .filter(|(_, s)| is_unloadable(s.state))
            .map(|(idx, s)| (*idx, s.state))
            .collect();
        victims.sort_by_key(|(idx, s)| {
            let rank = match s {
                ReplicaState::Draining => 0,
                ReplicaState::LoadRequested => 1,
                _ => 2,
            };
            (rank, std::cmp::Reverse(*idx))
        });
        victims.truncate(count as usize);

        let idxs: Vec<u32> = victims.into_iter().map(|(idx, _)| idx).collect();
        let commands = self.unload_replicas(state, model_name, latest.version, &idxs)?;
        state.model_mut(model_name)?.refresh_statuses();
        Ok(commands)
    }

    /// Unload every replica of `model:version` that still holds the model.
    pub fn unload_version(
        &self,
        state: &mut ClusterState,
        model_name: &str,
        version: u32,
    ) -> PlacementResult<Vec<AgentCommand>> {
        let mv = state.model_version(model_name, version)?;
        let idxs: Vec<u32> = mv.replicas_in_state(is_unloadable);
        self.unload_replicas(state, model_name, version, &idxs)
    }

    /// Move the given replicas to `UnloadRequested` and emit unload commands.
    pub fn unload_replicas(
        &self,
        state: &mut ClusterState,
        model_name: &str,
        version: u32,
        idxs: &[u32],
    ) -> PlacementResult<Vec<AgentCommand>> {
        let mv = state.model_version(model_name, version)?;
        let Some(server) = mv.server.clone() else {
            return Ok(Vec::new());
        };
        let id = mv.id();
        let mut commands = Vec::with_capacity(idxs.len());
        for &idx in idxs {
            state.set_replica_state(model_name, version, idx, ReplicaState::UnloadRequested, "")?;
            debug!(model = %id, %server, replica = idx, "unload requested");
            commands.push(AgentCommand::unload(&server, idx, &id));
        }
        Ok(commands)
    }

    // ── Internals ──────────────────────────────────────────────────

    fn candidates(
        &self,
        state: &ClusterState,
        mv: &ModelVersion,
        rejections: &mut Vec<Rejection>,
    ) -> Vec<Candidate> {
        let mut servers: Vec<_> = state
            .servers
            .values()
            .filter(|server| {
                match self.server_filters.iter().find(|f| !f.filter(mv, server)) {
                    Some(f) => {
                        debug!(model = %mv.id(), server = %server.name, filter = f.name(), "server rejected");
                        rejections.push(Rejection {
                            server: server.name.clone(),
                            replica_idx: None,
                            filter: f.name(),
                            reason: f.description(mv, server),
                        });
                        false
                    }
                    None => true,
                }
            })
            .collect();
        for sorter in &self.server_sorters {
            sort_stable_by(&mut servers, |a, b| sorter.is_less(mv, a, b));
        }

        let mut out = Vec::with_capacity(servers.len());
        for server in servers {
            let mut replicas: Vec<_> = server
                .replicas
                .values()
                .filter(|replica| {
                    match self.replica_filters.iter().find(|f| !f.filter(mv, replica)) {
                        Some(f) => {
                            rejections.push(Rejection {
                                server: server.name.clone(),
                                replica_idx: Some(replica.replica_idx),
                                filter: f.name(),
                                reason: f.description(mv, replica),
                            });
                            false
                        }
                        None => true,
                    }
                })
                .collect();
            for sorter in &self.replica_sorters {
                sort_stable_by(&mut replicas, |a, b| sorter.is_less(mv, a, b));
            }
            out.push(Candidate {
                server: server.name.clone(),
                replicas: replicas.iter().map(|r| r.replica_idx).collect(),
            });
        }
        out
    }

    fn fail(
        &self,
        state: &mut ClusterState,
        latest: &ModelVersion,
        rejections: Vec<Rejection>,
    ) -> PlacementResult<Placement> {
        let failure = NoCandidates {
            model: latest.id(),
            rejections,
            scale_up: latest.server.clone(),
        };
        let summary = failure.summary();
        warn!(model = %failure.model, reason = %summary, "failed to schedule model");

        let model = state.model_mut(&latest.definition.name)?;
        if let Some(mv) = model.version_mut(latest.version) {
            mv.mark_schedule_failed(summary);
            if !mv.is_active() {
                mv.server = None;
            }
        }
        Ok(Placement::Unschedulable(failure))
    }

    fn apply_assignment(
        &self,
        state: &mut ClusterState,
        model_name: &str,
        version: u32,
        server: &str,
        replicas: &[u32],
    ) -> PlacementResult<(ModelVersionId, Vec<AgentCommand>)> {
        let model = state.model_mut(model_name)?;
        let mut version = version;
        let moving = model
            .version(version)
            .is_some_and(|mv| mv.server.as_deref().is_some_and(|s| s != server) && mv.is_active());
        if moving {
            let definition = model
                .version(version)
                .map(|mv| mv.definition.clone())
                .ok_or_else(|| PlacementError::NoVersions(model_name.to_string()))?;
            let next = model.add_version(definition);
            info!(model = %model_name, from = version, to = next, %server, "server changed, new version added");
            version = next;
        }
        let mv = model
            .version_mut(version)
            .ok_or_else(|| PlacementError::NoVersions(model_name.to_string()))?;
        mv.server = Some(server.to_string());
        let id = mv.id();
        let current: Vec<(u32, ReplicaState)> =
            mv.replicas.iter().map(|(idx, s)| (*idx, s.state)).collect();

        let chosen: BTreeSet<u32> = replicas.iter().copied().collect();
        let mut commands = Vec::new();

        for &idx in replicas {
            let existing = state.model_version(model_name, version)?.replica_state(idx);
            if existing.is_loading_or_loaded() {
                continue;
            }
            state.set_replica_state(model_name, version, idx, ReplicaState::LoadRequested, "")?;
            debug!(model = %id, %server, replica = idx, "load requested");
            commands.push(AgentCommand::load(server, idx, &id));
        }

        for (idx, existing) in current {
            if chosen.contains(&idx) || !is_unloadable(existing) || existing == ReplicaState::Draining
            {
                continue;
            }
            state.set_replica_state(model_name, version, idx, ReplicaState::UnloadRequested, "")?;
            debug!(model = %id, %server, replica = idx, "unload requested");
            commands.push(AgentCommand::unload(server, idx, &id));
        }

        state.model_mut(model_name)?.refresh_statuses();
        Ok((id, commands))
    }
}

/// Holds the model and is not already on its way out.
fn is_unloadable(state: ReplicaState) -> bool {
    !state.unloading_or_unloaded() && !state.is_inactive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelplane_state::model::EXPLAINER_CAPABILITY;
    use modelplane_state::{ModelDefinition, ModelState, Server, ServerReplica};

    fn make_server(name: &str, replicas: u32, memory: u64, caps: &[&str]) -> Server {
        let mut s = Server::new(name);
        for idx in 0..replicas {
            s.replicas.insert(
                idx,
                ServerReplica::new(name, idx, memory).with_capabilities(caps.iter().copied()),
            );
        }
        s
    }

    fn make_model(name: &str, replicas: u32, memory: u64) -> ModelDefinition {
        let mut d = ModelDefinition::new(name, format!("gs://models/{name}"), memory);
        d.replicas = replicas;
        d
    }

    fn cluster(servers: Vec<Server>) -> ClusterState {
        let mut cs = ClusterState::default();
        for s in servers {
            cs.servers.insert(s.name.clone(), s);
        }
        cs
    }

    fn loads(p: &Placement) -> Vec<(String, u32)> {
        p.commands()
            .iter()
            .filter(|c| c.is_load())
            .map(|c| (c.server().to_string(), c.replica_idx()))
            .collect()
    }

    // ── Scheduling ─────────────────────────────────────────────────

    #[test]
    fn schedules_onto_matching_server() {
        let mut cs = cluster(vec![
            make_server("triton", 2, 1000, &["onnx"]),
            make_server("mlserver", 2, 1000, &["sklearn"]),
        ]);
        let mut d = make_model("iris", 1, 100);
        d.requirements = vec!["sklearn".into()];
        cs.upsert_model(d).unwrap();

        let placement = PlacementEngine::default().schedule(&mut cs, "iris").unwrap();
        assert_eq!(loads(&placement), vec![("mlserver".to_string(), 0)]);

        let mv = cs.model_version("iris", 1).unwrap();
        assert_eq!(mv.server.as_deref(), Some("mlserver"));
        assert_eq!(mv.replica_state(0), ReplicaState::LoadRequested);
        assert_eq!(cs.replica("mlserver", 0).unwrap().reserved_memory, 100);
    }

    #[test]
    fn rescheduling_without_change_is_idempotent() {
        let mut cs = cluster(vec![make_server("mlserver", 2, 1000, &[])]);
        cs.upsert_model(make_model("iris", 2, 100)).unwrap();
        let engine = PlacementEngine::default();

        let first = engine.schedule(&mut cs, "iris").unwrap();
        assert_eq!(first.commands().len(), 2);
        let before = cs.clone();

        let second = engine.schedule(&mut cs, "iris").unwrap();
        assert!(second.commands().is_empty());
        assert!(second.is_scheduled());
        assert_eq!(
            cs.replica("mlserver", 0).unwrap().reserved_memory,
            before.replica("mlserver", 0).unwrap().reserved_memory
        );
    }

    #[test]
    fn unschedulable_reports_every_rejection() {
        let mut cs = cluster(vec![
            make_server("small", 1, 50, &[]),
            make_server("gpu", 1, 1000, &["gpu"]),
        ]);
        cs.servers.get_mut("gpu").unwrap().shared = false;
        cs.upsert_model(make_model("llm", 1, 100)).unwrap();

        let placement = PlacementEngine::default().schedule(&mut cs, "llm").unwrap();
        let Placement::Unschedulable(failure) = placement else {
            panic!("expected unschedulable, got {placement:?}");
        };
        let filters: Vec<_> = failure.rejections.iter().map(|r| r.filter).collect();
        assert!(filters.contains(&"SharingServerFilter"));
        assert!(filters.contains(&"AvailableMemoryReplicaFilter"));
        assert!(failure.scale_up.is_none());

        let mv = cs.model_version("llm", 1).unwrap();
        assert_eq!(mv.status.state, ModelState::ScheduleFailed);
        assert!(mv.status.reason.contains("small"));
    }

    #[test]
    fn no_servers_is_unschedulable() {
        let mut cs = ClusterState::default();
        cs.upsert_model(make_model("iris", 1, 1)).unwrap();
        let placement = PlacementEngine::default().schedule(&mut cs, "iris").unwrap();
        assert!(matches!(placement, Placement::Unschedulable(_)));
    }

    #[test]
    fn falls_back_to_min_replicas() {
        let mut cs = cluster(vec![make_server("mlserver", 2, 1000, &[])]);
        let mut d = make_model("iris", 3, 100);
        d.min_replicas = 2;
        cs.upsert_model(d).unwrap();

        let placement = PlacementEngine::default().schedule(&mut cs, "iris").unwrap();
        let Placement::Scheduled { replicas, .. } = &placement else {
            panic!("expected scheduled, got {placement:?}");
        };
        assert_eq!(replicas.len(), 2);
    }

    #[test]
    fn sticky_to_current_server() {
        let mut cs = cluster(vec![
            make_server("a", 1, 1000, &[]),
            make_server("b", 1, 1000, &[]),
        ]);
        cs.upsert_model(make_model("iris", 1, 100)).unwrap();
        let engine = PlacementEngine::default();
        engine.schedule(&mut cs, "iris").unwrap();
        assert_eq!(cs.model_version("iris", 1).unwrap().server.as_deref(), Some("a"));

        // "b" now has far more free memory, but the model stays put.
        cs.servers.get_mut("b").unwrap().replicas.get_mut(&0).unwrap().memory = 10_000;
        let placement = engine.schedule(&mut cs, "iris").unwrap();
        assert!(placement.commands().is_empty());
    }

    #[test]
    fn explainer_only_lands_on_explain_capable_replica() {
        let mut server = make_server("mlserver", 2, 1000, &[]);
        server
            .replicas
            .get_mut(&1)
            .unwrap()
            .capabilities
            .insert(EXPLAINER_CAPABILITY.to_string());
        let mut cs = cluster(vec![server]);
        let mut d = make_model("explain", 1, 10);
        d.explainer = true;
        cs.upsert_model(d).unwrap();

        let placement = PlacementEngine::default().schedule(&mut cs, "explain").unwrap();
        assert_eq!(loads(&placement), vec![("mlserver".to_string(), 1)]);
    }

    #[test]
    fn draining_replica_is_replaced_not_unloaded() {
        let mut cs = cluster(vec![make_server("mlserver", 2, 1000, &[])]);
        cs.upsert_model(make_model("iris", 1, 100)).unwrap();
        let engine = PlacementEngine::default();
        engine.schedule(&mut cs, "iris").unwrap();
        cs.set_replica_state("iris", 1, 0, ReplicaState::Available, "").unwrap();

        cs.servers.get_mut("mlserver").unwrap().replicas.get_mut(&0).unwrap().is_draining = true;
        cs.set_replica_state("iris", 1, 0, ReplicaState::Draining, "").unwrap();

        let placement = engine.schedule(&mut cs, "iris").unwrap();
        assert_eq!(placement.commands().len(), 1);
        assert_eq!(loads(&placement), vec![("mlserver".to_string(), 1)]);
        assert_eq!(
            cs.model_version("iris", 1).unwrap().replica_state(0),
            ReplicaState::Draining
        );
    }

    #[test]
    fn scale_down_unloads_surplus_replicas() {
        let mut cs = cluster(vec![make_server("mlserver", 3, 1000, &[])]);
        cs.upsert_model(make_model("iris", 3, 100)).unwrap();
        let engine = PlacementEngine::default();
        engine.schedule(&mut cs, "iris").unwrap();
        for idx in 0..3 {
            cs.set_replica_state("iris", 1, idx, ReplicaState::Available, "").unwrap();
        }

        let placement = engine.deassign(&mut cs, "iris", 1).unwrap();
        assert_eq!(placement.len(), 1);
        assert_eq!(placement[0].replica_idx(), 2);
        assert_eq!(
            cs.model_version("iris", 1).unwrap().replica_state(2),
            ReplicaState::UnloadRequested
        );
    }

    #[test]
    fn deassign_prefers_draining_then_pending() {
        let mut cs = cluster(vec![make_server("mlserver", 3, 1000, &[])]);
        cs.upsert_model(make_model("iris", 3, 100)).unwrap();
        let engine = PlacementEngine::default();
        engine.schedule(&mut cs, "iris").unwrap();
        cs.set_replica_state("iris", 1, 0, ReplicaState::Available, "").unwrap();
        cs.set_replica_state("iris", 1, 1, ReplicaState::Draining, "").unwrap();
        // replica 2 stays LoadRequested

        let commands = engine.deassign(&mut cs, "iris", 2).unwrap();
        let victims: Vec<_> = commands.iter().map(|c| c.replica_idx()).collect();
        assert_eq!(victims, vec![1, 2]);
    }

    #[test]
    fn deleted_model_unloads_all_versions() {
        let mut cs = cluster(vec![make_server("mlserver", 2, 1000, &[])]);
        cs.upsert_model(make_model("iris", 2, 100)).unwrap();
        let engine = PlacementEngine::default();
        engine.schedule(&mut cs, "iris").unwrap();
        cs.set_replica_state("iris", 1, 0, ReplicaState::Available, "").unwrap();
        cs.set_replica_state("iris", 1, 1, ReplicaState::Available, "").unwrap();

        cs.model_mut("iris").unwrap().deleted = true;
        let placement = engine.schedule(&mut cs, "iris").unwrap();
        assert!(matches!(placement, Placement::Unloaded { .. }));
        assert_eq!(placement.commands().len(), 2);
        assert!(placement.commands().iter().all(|c| !c.is_load()));
        assert_eq!(
            cs.model_version("iris", 1).unwrap().status.state,
            ModelState::Terminating
        );
    }

    #[test]
    fn moving_server_adds_version() {
        let mut cs = cluster(vec![
            make_server("a", 1, 1000, &[]),
            make_server("b", 1, 1000, &[]),
        ]);
        cs.upsert_model(make_model("iris", 1, 100)).unwrap();
        let engine = PlacementEngine::default();
        engine.schedule(&mut cs, "iris").unwrap();
        cs.set_replica_state("iris", 1, 0, ReplicaState::Available, "").unwrap();

        cs.servers.get_mut("a").unwrap().expected_replicas = Some(0);
        let placement = engine.schedule(&mut cs, "iris").unwrap();
        let Placement::Scheduled { model, server, .. } = &placement else {
            panic!("expected scheduled, got {placement:?}");
        };
        assert_eq!(server, "b");
        assert_eq!(model.version, 2);
        // The old version keeps serving until the new one is available.
        assert_eq!(
            cs.model_version("iris", 1).unwrap().replica_state(0),
            ReplicaState::Available
        );
    }

    #[test]
    fn summary_lists_rejections() {
        let failure = NoCandidates {
            model: ModelVersionId::new("iris", 1),
            rejections: vec![Rejection {
                server: "mlserver".into(),
                replica_idx: Some(0),
                filter: "ReplicaDrainingFilter",
                reason: "replica draining=true".into(),
            }],
            scale_up: None,
        };
        assert_eq!(
            failure.summary(),
            "mlserver:0 ReplicaDrainingFilter (replica draining=true)"
        );
    }
}
