//! Event handlers: the model/server state machine.
//!
//! Each handler applies one event type to a mutable copy of the
//! [`ClusterState`] and returns the outputs downstream consumers need. The
//! coordinator commits the copy only when the handler returns `Ok`, so an
//! error anywhere in a handler drops the whole event.
//!
//! # Components
//!
//! - **ModelLifecycle**: load, unload, agent status reports, retries
//! - **ServerLifecycle**: notify, connect, disconnect, drain
//! - **References**: pipelines and experiments that track model status

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use modelplane_placement::{Placement, PlacementEngine};
use modelplane_state::{
    ClusterState, Model, ModelState, ModelVersionId, ReplicaState, Server, ServerReplica,
    StateError,
};
use tracing::{debug, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::events::{Event, EventType, OutputEvent, ServerReplicaInfo};

/// Applies one kind of event to the cluster.
pub trait EventHandler: Send + Sync {
    fn handle(&self, state: &mut ClusterState, event: &Event) -> SchedulerResult<Vec<OutputEvent>>;
}

impl<F> EventHandler for F
where
    F: Fn(&mut ClusterState, &Event) -> SchedulerResult<Vec<OutputEvent>> + Send + Sync,
{
    fn handle(&self, state: &mut ClusterState, event: &Event) -> SchedulerResult<Vec<OutputEvent>> {
        self(state, event)
    }
}

/// Explicit mapping from event type to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Box<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full control-plane state machine backed by `engine`.
    pub fn standard(engine: Arc<PlacementEngine>) -> Self {
        let mut registry = Self::new();
        let model = ModelLifecycle {
            engine: engine.clone(),
        };
        let servers = ServerLifecycle { engine };
        for t in [
            EventType::LoadModel,
            EventType::UnloadModel,
            EventType::ModelReplicaStatus,
            EventType::ScheduleFailedModels,
        ] {
            registry.register(t, model.clone());
        }
        for t in [
            EventType::ServerNotify,
            EventType::ServerReplicaConnected,
            EventType::ServerReplicaDisconnected,
            EventType::DrainServerReplica,
        ] {
            registry.register(t, servers.clone());
        }
        for t in [
            EventType::PipelineUpsert,
            EventType::PipelineDelete,
            EventType::ExperimentUpsert,
            EventType::ExperimentDelete,
        ] {
            registry.register(t, References);
        }
        registry
    }

    /// Register (or replace) the handler for `event_type`.
    pub fn register(&mut self, event_type: EventType, handler: impl EventHandler + 'static) {
        self.handlers.insert(event_type, Box::new(handler));
    }

    pub fn get(&self, event_type: EventType) -> Option<&dyn EventHandler> {
        self.handlers.get(&event_type).map(|h| h.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ── Shared helpers ─────────────────────────────────────────────────

/// Status output for a model plus refreshes for everything that references it.
fn model_outputs(state: &ClusterState, name: &str) -> Vec<OutputEvent> {
    let mut out = Vec::new();
    match state.models.get(name).and_then(Model::latest) {
        Some(latest) => out.push(OutputEvent::ModelStatus {
            model: latest.id(),
            status: latest.status.clone(),
        }),
        None => out.push(OutputEvent::ModelRemoved {
            model: name.to_string(),
        }),
    }
    for pipeline in state.pipelines_using_model(name) {
        out.push(OutputEvent::PipelineRefresh { pipeline });
    }
    for experiment in state.experiments_using_model(name) {
        out.push(OutputEvent::ExperimentRefresh { experiment });
    }
    out
}

/// Run placement for one model and translate the result into outputs.
fn schedule_model(
    engine: &PlacementEngine,
    state: &mut ClusterState,
    name: &str,
) -> SchedulerResult<Vec<OutputEvent>> {
    let placement = engine.schedule(state, name)?;
    let mut out: Vec<OutputEvent> = placement
        .commands()
        .iter()
        .cloned()
        .map(|command| OutputEvent::Agent { command })
        .collect();
    if let Placement::Unschedulable(failure) = &placement
        && let Some(server) = &failure.scale_up
    {
        out.push(OutputEvent::ServerScaleUp {
            server: server.clone(),
            model: failure.model.clone(),
        });
    }
    state.remove_model_if_terminated(name);
    out.extend(model_outputs(state, name));
    Ok(out)
}

/// The latest version has fewer live replicas than it wants.
fn needs_reschedule(model: &Model) -> bool {
    if model.deleted {
        return false;
    }
    let Some(latest) = model.latest() else {
        return false;
    };
    latest.status.state == ModelState::ScheduleFailed
        || latest.replicas_in_state(ReplicaState::is_loading_or_loaded).len()
            < latest.desired_replicas() as usize
}

fn reschedule_pending(
    engine: &PlacementEngine,
    state: &mut ClusterState,
) -> SchedulerResult<Vec<OutputEvent>> {
    let pending: Vec<String> = state
        .models
        .values()
        .filter(|m| needs_reschedule(m))
        .map(|m| m.name.clone())
        .collect();
    let mut out = Vec::new();
    for name in pending {
        debug!(model = %name, "retrying placement");
        match schedule_model(engine, state, &name) {
            Ok(outputs) => out.extend(outputs),
            Err(e) => warn!(model = %name, error = %e, "retry placement failed"),
        }
    }
    Ok(out)
}

/// The version should stop serving: its model was deleted, or a newer
/// version is already available.
fn is_superseded(state: &ClusterState, id: &ModelVersionId) -> bool {
    state.models.get(&id.model).is_some_and(|m| {
        m.deleted
            || (!m.is_latest(id.version)
                && m.latest()
                    .is_some_and(|v| v.status.state == ModelState::Available))
    })
}

fn is_unloadable(state: ReplicaState) -> bool {
    !state.unloading_or_unloaded() && !state.is_inactive()
}

/// The model no longer needs `server:idx`: it is gone, has nowhere to go, or
/// its latest version serves from another replica.
fn has_moved(state: &ClusterState, name: &str, server: &str, idx: u32) -> bool {
    let Some(model) = state.models.get(name) else {
        return true;
    };
    let Some(latest) = model.latest() else {
        return true;
    };
    if model.deleted || latest.status.state == ModelState::ScheduleFailed {
        return true;
    }
    let elsewhere = latest.server.as_deref() != Some(server);
    latest
        .replicas
        .iter()
        .any(|(i, s)| s.state == ReplicaState::Available && (elsewhere || *i != idx))
}

/// Report every drain whose moved models have all settled.
fn settle_drains(state: &mut ClusterState) -> Vec<OutputEvent> {
    let waiting: Vec<(String, u32, BTreeSet<String>)> = state
        .servers
        .values()
        .flat_map(|s| s.replicas.values())
        .filter(|r| r.is_draining && !r.drain_pending.is_empty())
        .map(|r| (r.server.clone(), r.replica_idx, r.drain_pending.clone()))
        .collect();

    let mut out = Vec::new();
    for (server, idx, pending) in waiting {
        if !pending.iter().all(|name| has_moved(state, name, &server, idx)) {
            continue;
        }
        if let Some(replica) = state
            .servers
            .get_mut(&server)
            .and_then(|s| s.replica_mut(idx))
        {
            replica.drain_pending.clear();
        }
        info!(%server, replica = idx, rescheduled = pending.len(), "server replica drained");
        out.push(OutputEvent::ServerReplicaDrained {
            server,
            replica_idx: idx,
            rescheduled: pending.len(),
        });
    }
    out
}

/// Stop waiting for replicas that never returned and release model replica
/// slots on server replicas which no longer exist, the way a disconnect
/// would. Returns the affected models.
fn release_dangling(state: &mut ClusterState) -> SchedulerResult<BTreeSet<String>> {
    let forgotten = state.forget_absent_replicas();
    if forgotten > 0 {
        info!(replicas = forgotten, "gave up on replicas absent since restart");
    }
    let mut touched = BTreeSet::new();
    for slot in state.dangling_replicas() {
        let id = &slot.model;
        let model = state.model_mut(&id.model)?;
        if !model.deleted && model.is_latest(id.version) {
            if let Some(mv) = model.version_mut(id.version) {
                mv.delete_replica(slot.replica_idx);
            }
        } else {
            state.set_replica_state(&id.model, id.version, slot.replica_idx, ReplicaState::Unloaded, "replica gone")?;
        }
        debug!(model = %id, server = %slot.server, replica = slot.replica_idx, "released slot on missing replica");
        touched.insert(id.model.clone());
    }
    for name in &touched {
        if let Ok(model) = state.model_mut(name) {
            model.refresh_statuses();
        }
        state.remove_model_if_terminated(name);
    }
    if !touched.is_empty() {
        info!(models = touched.len(), "released replicas that never came back");
    }
    Ok(touched)
}

// ── Model lifecycle ────────────────────────────────────────────────

#[derive(Clone)]
struct ModelLifecycle {
    engine: Arc<PlacementEngine>,
}

impl EventHandler for ModelLifecycle {
    fn handle(&self, state: &mut ClusterState, event: &Event) -> SchedulerResult<Vec<OutputEvent>> {
        let mut out = self.apply(state, event)?;
        out.extend(settle_drains(state));
        Ok(out)
    }
}

impl ModelLifecycle {
    fn apply(&self, state: &mut ClusterState, event: &Event) -> SchedulerResult<Vec<OutputEvent>> {
        match event {
            Event::LoadModel(definition) => {
                let name = &definition.name;
                let previous = state.models.get(name).and_then(Model::latest).map(|v| v.version);
                let version = state.upsert_model(definition.clone())?;
                info!(model = %name, version, "model load requested");
                if previous == Some(version)
                    && let Some(out) = self.scale_down(state, name)?
                {
                    return Ok(out);
                }
                schedule_model(&self.engine, state, name)
            }
            Event::UnloadModel { model } => {
                state.model_mut(model)?.deleted = true;
                info!(%model, "model unload requested");
                schedule_model(&self.engine, state, model)
            }
            Event::ModelReplicaStatus {
                model,
                version,
                server,
                replica_idx,
                state: reported,
                reason,
            } => self.replica_status(state, model, *version, server, *replica_idx, *reported, reason),
            Event::ScheduleFailedModels => {
                let mut out = Vec::new();
                for name in release_dangling(state)? {
                    out.extend(model_outputs(state, &name));
                }
                out.extend(reschedule_pending(&self.engine, state)?);
                Ok(out)
            }
            other => Err(SchedulerError::InvalidEvent(format!(
                "{:?} routed to model handler",
                other.event_type()
            ))),
        }
    }

    /// Unload surplus replicas after the replica count of the latest version
    /// went down. Returns `None` when there is nothing to remove.
    ///
    /// Draining replicas are removed first; they only count as surplus when
    /// the replicas that stay can serve on their own.
    fn scale_down(
        &self,
        state: &mut ClusterState,
        name: &str,
    ) -> SchedulerResult<Option<Vec<OutputEvent>>> {
        let Some(latest) = state.model(name)?.latest() else {
            return Ok(None);
        };
        let desired = latest.desired_replicas();
        let held = latest.replicas_in_state(is_unloadable);
        let staying = latest
            .replicas_in_state(|s| is_unloadable(s) && s != ReplicaState::Draining)
            .len() as u32;
        if desired == 0 || staying <= desired {
            return Ok(None);
        }
        let surplus = held.len() as u32 - desired;
        let commands = self.engine.deassign(state, name, surplus)?;
        info!(model = %name, desired, removed = commands.len(), "model scaled down");

        let mut out: Vec<OutputEvent> = commands
            .into_iter()
            .map(|command| OutputEvent::Agent { command })
            .collect();
        out.extend(model_outputs(state, name));
        Ok(Some(out))
    }

    #[allow(clippy::too_many_arguments)]
    fn replica_status(
        &self,
        state: &mut ClusterState,
        name: &str,
        version: u32,
        server: &str,
        idx: u32,
        reported: ReplicaState,
        reason: &str,
    ) -> SchedulerResult<Vec<OutputEvent>> {
        let mv = state.model_version(name, version)?;
        if mv.server.as_deref() != Some(server) {
            return Err(SchedulerError::InvalidEvent(format!(
                "{name}:{version} is not placed on {server}"
            )));
        }

        let model = state.model(name)?;
        let current = !model.deleted && model.is_latest(version);
        let on_draining = state.replica(server, idx).is_ok_and(|r| r.is_draining);

        // Route programming is synchronous here, so a loaded replica serves at
        // once. On a draining replica it only serves until its replacement is up.
        let next = match reported {
            ReplicaState::Loaded | ReplicaState::Available if on_draining && current => {
                ReplicaState::Draining
            }
            ReplicaState::Loaded => ReplicaState::Available,
            other => other,
        };
        let previous = state.set_replica_state(name, version, idx, next, reason)?;
        debug!(model = %name, version, %server, replica = idx, from = %previous, to = %next, "replica status");

        state.model_mut(name)?.refresh_statuses();

        let mut commands = Vec::new();
        let id = ModelVersionId::new(name, version);
        if next.can_receive_traffic() && (is_superseded(state, &id) || (on_draining && !current)) {
            commands.extend(self.engine.unload_replicas(state, name, version, &[idx])?);
        }

        let model = state.model(name)?;
        if !model.deleted
            && let Some(latest) = model.latest()
            && latest.status.state == ModelState::Available
        {
            let latest_version = latest.version;
            let draining = latest.replicas_in_state(|s| s == ReplicaState::Draining);
            let older: Vec<u32> = model
                .versions
                .iter()
                .filter(|v| v.version != latest_version && v.is_active())
                .map(|v| v.version)
                .collect();
            for old in older {
                commands.extend(self.engine.unload_version(state, name, old)?);
            }
            if !draining.is_empty() {
                commands.extend(self.engine.unload_replicas(state, name, latest_version, &draining)?);
            }
        }
        if next == ReplicaState::LoadFailed {
            warn!(model = %name, version, %server, replica = idx, %reason, "model failed to load");
        }

        state.model_mut(name)?.refresh_statuses();
        state.remove_model_if_terminated(name);

        let mut out: Vec<OutputEvent> = commands
            .into_iter()
            .map(|command| OutputEvent::Agent { command })
            .collect();
        out.extend(model_outputs(state, name));
        Ok(out)
    }
}

// ── Server lifecycle ───────────────────────────────────────────────

#[derive(Clone)]
struct ServerLifecycle {
    engine: Arc<PlacementEngine>,
}

impl EventHandler for ServerLifecycle {
    fn handle(&self, state: &mut ClusterState, event: &Event) -> SchedulerResult<Vec<OutputEvent>> {
        match event {
            Event::ServerNotify {
                server,
                shared,
                expected_replicas,
                min_replicas,
                max_replicas,
            } => {
                let entry = state
                    .servers
                    .entry(server.clone())
                    .or_insert_with(|| Server::new(server.clone()));
                entry.shared = *shared;
                entry.expected_replicas = *expected_replicas;
                entry.min_replicas = *min_replicas;
                entry.max_replicas = *max_replicas;
                info!(%server, shared, ?expected_replicas, "server updated");
                if entry.is_deleted() {
                    return self.reschedule_server_models(state, server);
                }
                Ok(Vec::new())
            }
            Event::ServerReplicaConnected(info) => self.connected(state, info),
            Event::ServerReplicaDisconnected {
                server,
                replica_idx,
            } => self.disconnected(state, server, *replica_idx),
            Event::DrainServerReplica {
                server,
                replica_idx,
            } => self.drain(state, server, *replica_idx),
            other => Err(SchedulerError::InvalidEvent(format!(
                "{:?} routed to server handler",
                other.event_type()
            ))),
        }
    }
}

impl ServerLifecycle {
    fn connected(
        &self,
        state: &mut ClusterState,
        info: &ServerReplicaInfo,
    ) -> SchedulerResult<Vec<OutputEvent>> {
        let server = &info.server;
        let idx = info.replica_idx;

        let mut replica = ServerReplica::new(server.clone(), idx, info.memory)
            .with_capabilities(info.capabilities.iter().cloned());
        replica.address = info.address.clone();
        replica.http_port = info.http_port;
        replica.grpc_port = info.grpc_port;
        if let Ok(previous) = state.replica(server, idx) {
            replica.is_draining = previous.is_draining;
            replica.drain_pending = previous.drain_pending.clone();
        }
        let srv = state
            .servers
            .entry(server.clone())
            .or_insert_with(|| Server::new(server.clone()));
        let returned = srv.absent_replicas.remove(&idx);
        let reconnect = srv.replicas.insert(idx, replica).is_some() || returned;
        state.rebuild_replica_accounting(server, idx);

        let reported: BTreeSet<_> = info.loaded_models.iter().cloned().collect();
        let mut touched = BTreeSet::new();

        for id in &reported {
            let Some(mv) = state
                .models
                .get_mut(&id.model)
                .and_then(|m| m.version_mut(id.version))
            else {
                debug!(model = %id, %server, replica = idx, "agent reported unknown model");
                continue;
            };
            match mv.server.as_deref() {
                None => mv.server = Some(server.clone()),
                Some(s) if s == server => {}
                Some(other) => {
                    warn!(model = %id, placed_on = %other, %server, "agent reported model placed elsewhere");
                    continue;
                }
            }
            state.set_replica_state(&id.model, id.version, idx, ReplicaState::Available, "")?;
            touched.insert(id.model.clone());
        }

        // Anything we believe is serving here but the agent no longer has is gone.
        for id in state.models_on_replica(server, idx) {
            if reported.contains(&id) {
                continue;
            }
            let mv = state.model_version(&id.model, id.version)?;
            if mv.replica_state(idx).can_receive_traffic() {
                state.set_replica_state(&id.model, id.version, idx, ReplicaState::Unloaded, "not reported on connect")?;
                touched.insert(id.model.clone());
            }
        }

        for name in &touched {
            if let Ok(model) = state.model_mut(name) {
                model.refresh_statuses();
            }
        }

        let mut out = vec![OutputEvent::ServerReplicaConnected {
            server: server.clone(),
            replica_idx: idx,
        }];
        for id in &reported {
            let serving = state
                .model_version(&id.model, id.version)
                .is_ok_and(|mv| mv.is_loading_or_loaded(server, idx));
            if serving && is_superseded(state, id) {
                for command in self.engine.unload_replicas(state, &id.model, id.version, &[idx])? {
                    out.push(OutputEvent::Agent { command });
                }
            }
        }
        info!(%server, replica = idx, reconnect, models = reported.len(), "server replica connected");

        for name in &touched {
            out.extend(model_outputs(state, name));
        }
        out.extend(settle_drains(state));
        Ok(out)
    }

    fn disconnected(
        &self,
        state: &mut ClusterState,
        server: &str,
        idx: u32,
    ) -> SchedulerResult<Vec<OutputEvent>> {
        let srv = state.server_mut(server)?;
        srv.absent_replicas.remove(&idx);
        let Some(removed) = srv.replicas.remove(&idx) else {
            debug!(%server, replica = idx, "disconnect for unknown replica");
            return Ok(Vec::new());
        };
        if srv.replicas.is_empty()
            && srv.absent_replicas.is_empty()
            && srv.expected_replicas.unwrap_or(0) == 0
        {
            state.servers.remove(server);
            info!(%server, "server removed after last replica left");
        }

        let mut reschedule = BTreeSet::new();
        let mut settle = BTreeSet::new();
        for id in state.models_on_replica(server, idx) {
            let model = state.model_mut(&id.model)?;
            let current = !model.deleted && model.is_latest(id.version);
            if current {
                if let Some(mv) = model.version_mut(id.version) {
                    mv.delete_replica(idx);
                }
                reschedule.insert(id.model.clone());
            } else {
                state.set_replica_state(&id.model, id.version, idx, ReplicaState::Unloaded, "replica disconnected")?;
                settle.insert(id.model.clone());
            }
        }
        info!(%server, replica = idx, affected = reschedule.len() + settle.len(), "server replica disconnected");

        let mut out = Vec::new();
        for name in settle.difference(&reschedule) {
            if let Ok(model) = state.model_mut(name) {
                model.refresh_statuses();
            }
            state.remove_model_if_terminated(name);
            out.extend(model_outputs(state, name));
        }
        for name in &reschedule {
            out.extend(schedule_model(&self.engine, state, name)?);
        }
        // A draining replica that leaves has nothing more to wait for.
        if removed.is_draining && !removed.drain_pending.is_empty() {
            out.push(OutputEvent::ServerReplicaDrained {
                server: server.to_string(),
                replica_idx: idx,
                rescheduled: removed.drain_pending.len(),
            });
        }
        out.extend(settle_drains(state));
        Ok(out)
    }

    fn drain(
        &self,
        state: &mut ClusterState,
        server: &str,
        idx: u32,
    ) -> SchedulerResult<Vec<OutputEvent>> {
        let replica = state
            .server_mut(server)?
            .replica_mut(idx)
            .ok_or_else(|| StateError::ReplicaNotFound {
                server: server.to_string(),
                replica_idx: idx,
            })?;
        replica.is_draining = true;

        let mut reschedule = BTreeSet::new();
        let mut out = Vec::new();
        for id in state.models_on_replica(server, idx) {
            let model = state.model(&id.model)?;
            let current = !model.deleted && model.is_latest(id.version);
            let replica_state = model
                .version(id.version)
                .map(|v| v.replica_state(idx))
                .unwrap_or(ReplicaState::Unknown);
            if !current {
                if is_unloadable(replica_state) {
                    for command in self.engine.unload_replicas(state, &id.model, id.version, &[idx])? {
                        out.push(OutputEvent::Agent { command });
                    }
                }
                continue;
            }
            // Serving replicas keep serving until the replacement is available.
            // A load still in flight turns Draining once it reports Loaded.
            if replica_state.can_receive_traffic() {
                state.set_replica_state(&id.model, id.version, idx, ReplicaState::Draining, "replica draining")?;
            }
            if replica_state.is_loading_or_loaded() || replica_state == ReplicaState::Draining {
                reschedule.insert(id.model.clone());
            }
        }

        for name in &reschedule {
            out.extend(schedule_model(&self.engine, state, name)?);
        }

        let waiting = reschedule
            .iter()
            .filter(|name| !has_moved(state, name, server, idx))
            .count();
        if waiting == 0 {
            info!(%server, replica = idx, rescheduled = reschedule.len(), "server replica drained");
            out.push(OutputEvent::ServerReplicaDrained {
                server: server.to_string(),
                replica_idx: idx,
                rescheduled: reschedule.len(),
            });
            return Ok(out);
        }
        if let Some(replica) = state.server_mut(server)?.replica_mut(idx) {
            replica.drain_pending = reschedule;
        }
        info!(%server, replica = idx, waiting, "server replica draining, waiting for replacements");
        Ok(out)
    }

    fn reschedule_server_models(
        &self,
        state: &mut ClusterState,
        server: &str,
    ) -> SchedulerResult<Vec<OutputEvent>> {
        let names: Vec<String> = state
            .models
            .values()
            .filter(|m| !m.deleted)
            .filter(|m| m.latest().is_some_and(|v| v.server.as_deref() == Some(server)))
            .map(|m| m.name.clone())
            .collect();
        let mut out = Vec::new();
        for name in names {
            out.extend(schedule_model(&self.engine, state, &name)?);
        }
        Ok(out)
    }
}

// ── Pipelines & experiments ────────────────────────────────────────

#[derive(Clone, Copy)]
struct References;

impl EventHandler for References {
    fn handle(&self, state: &mut ClusterState, event: &Event) -> SchedulerResult<Vec<OutputEvent>> {
        match event {
            Event::PipelineUpsert(pipeline) => {
                let mut pipeline = pipeline.clone();
                if let Some(existing) = state.pipelines.get(&pipeline.name) {
                    pipeline.version = pipeline.version.max(existing.version + 1);
                }
                let name = pipeline.name.clone();
                state.pipelines.insert(name.clone(), pipeline);
                Ok(vec![OutputEvent::PipelineRefresh { pipeline: name }])
            }
            Event::PipelineDelete { name } => {
                state
                    .pipelines
                    .remove(name)
                    .ok_or_else(|| SchedulerError::InvalidEvent(format!("pipeline {name} not found")))?;
                Ok(vec![OutputEvent::PipelineRefresh {
                    pipeline: name.clone(),
                }])
            }
            Event::ExperimentUpsert(experiment) => {
                let name = experiment.name.clone();
                state.experiments.insert(name.clone(), experiment.clone());
                Ok(vec![OutputEvent::ExperimentRefresh { experiment: name }])
            }
            Event::ExperimentDelete { name } => {
                state.experiments.remove(name).ok_or_else(|| {
                    SchedulerError::InvalidEvent(format!("experiment {name} not found"))
                })?;
                Ok(vec![OutputEvent::ExperimentRefresh {
                    experiment: name.clone(),
                }])
            }
            other => Err(SchedulerError::InvalidEvent(format!(
                "{:?} routed to reference handler",
                other.event_type()
            ))),
        }
    }
}
