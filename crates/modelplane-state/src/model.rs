//! Models, model versions, and their per-replica state maps.
//!
//! A [`Model`] is an ordered list of [`ModelVersion`]s; the last one is the
//! latest. Each version owns an immutable [`ModelDefinition`], the name of the
//! server it is placed on, and a `replica index → ReplicaStatus` map for the
//! replicas of that server. Version status is derived from the replica map by
//! [`ModelVersion::refresh_status`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};
use crate::replica::{ReplicaState, ReplicaStatus};

/// Capability advertised by replicas able to host explainer models.
pub const EXPLAINER_CAPABILITY: &str = "alibi-explain";

/// Identifies one version of one model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelVersionId {
    pub model: String,
    pub version: u32,
}

impl ModelVersionId {
    pub fn new(model: impl Into<String>, version: u32) -> Self {
        Self {
            model: model.into(),
            version,
        }
    }
}

impl fmt::Display for ModelVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model, self.version)
    }
}

// ── Definition ─────────────────────────────────────────────────────

/// Serving runtime of a model, where it affects memory sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelRuntime {
    /// MLServer loads one copy per parallel worker.
    MlServer { parallel_workers: u32 },
    /// Triton loads one copy per CPU model instance.
    Triton { cpu_instance_count: u32 },
}

impl ModelRuntime {
    /// How many copies of the model a single replica holds in memory.
    pub fn instance_multiplier(&self) -> u64 {
        let n = match self {
            Self::MlServer { parallel_workers } => *parallel_workers,
            Self::Triton { cpu_instance_count } => *cpu_instance_count,
        };
        u64::from(n.max(1))
    }
}

/// What the user asked for. Immutable once attached to a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    /// Artifact location (s3://, gs://, file://, ...).
    pub uri: String,
    /// Capabilities a replica must advertise, e.g. `sklearn`, `gpu`.
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Memory for one loaded copy, in bytes.
    pub memory_bytes: u64,
    /// Pin the model to a named server instead of any shared server.
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub explainer: bool,
    #[serde(default)]
    pub runtime: Option<ModelRuntime>,
    /// Desired replica count.
    pub replicas: u32,
    /// Fewest replicas worth scheduling when the desired count does not fit. 0 disables.
    #[serde(default)]
    pub min_replicas: u32,
    /// Upper bound on replicas. 0 means unbounded.
    #[serde(default)]
    pub max_replicas: u32,
    /// Generation of the resource this definition came from, if any.
    #[serde(default)]
    pub generation: u64,
}

impl ModelDefinition {
    /// A single-replica definition with no requirements.
    pub fn new(name: impl Into<String>, uri: impl Into<String>, memory_bytes: u64) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            requirements: Vec::new(),
            memory_bytes,
            server: None,
            explainer: false,
            runtime: None,
            replicas: 1,
            min_replicas: 0,
            max_replicas: 0,
            generation: 0,
        }
    }

    /// Memory one replica must have free to host this model.
    pub fn required_memory(&self) -> u64 {
        let multiplier = self
            .runtime
            .as_ref()
            .map(ModelRuntime::instance_multiplier)
            .unwrap_or(1);
        self.memory_bytes.saturating_mul(multiplier)
    }

    /// Reject definitions no scheduler run could make sense of.
    pub fn validate(&self) -> StateResult<()> {
        if self.name.trim().is_empty() {
            return Err(StateError::Invalid {
                field: "name",
                reason: "must not be empty".into(),
            });
        }
        if self.min_replicas > self.replicas {
            return Err(StateError::Invalid {
                field: "min_replicas",
                reason: format!(
                    "min_replicas {} exceeds replicas {}",
                    self.min_replicas, self.replicas
                ),
            });
        }
        if self.max_replicas > 0 && self.replicas > self.max_replicas {
            return Err(StateError::Invalid {
                field: "replicas",
                reason: format!(
                    "replicas {} exceeds max_replicas {}",
                    self.replicas, self.max_replicas
                ),
            });
        }
        Ok(())
    }

    /// True when `other` needs different resources or a different home.
    ///
    /// Replica counts are not part of this: scaling keeps the version.
    pub fn placement_differs(&self, other: &ModelDefinition) -> bool {
        self.memory_bytes != other.memory_bytes
            || self.requirements != other.requirements
            || self.server != other.server
            || self.explainer != other.explainer
            || self.runtime != other.runtime
    }

    /// True when `other` equals this definition apart from replica counts
    /// and generation.
    pub fn only_scale_differs(&self, other: &ModelDefinition) -> bool {
        let mut rescaled = self.clone();
        rescaled.replicas = other.replicas;
        rescaled.min_replicas = other.min_replicas;
        rescaled.max_replicas = other.max_replicas;
        rescaled.generation = other.generation;
        rescaled == *other
    }
}

// ── Status ─────────────────────────────────────────────────────────

/// Derived state of a model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    #[default]
    Unknown,
    Progressing,
    Available,
    Failed,
    ScheduleFailed,
    ScaledDown,
    Terminating,
    Terminated,
    TerminateFailed,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown",
            Self::Progressing => "Progressing",
            Self::Available => "Available",
            Self::Failed => "Failed",
            Self::ScheduleFailed => "ScheduleFailed",
            Self::ScaledDown => "ScaledDown",
            Self::Terminating => "Terminating",
            Self::Terminated => "Terminated",
            Self::TerminateFailed => "TerminateFailed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelStatus {
    pub state: ModelState,
    #[serde(default)]
    pub reason: String,
    pub available_replicas: u32,
    pub unavailable_replicas: u32,
    #[serde(default)]
    pub draining_replicas: u32,
    /// Unix timestamp (milliseconds) of the replica change that produced this status.
    pub timestamp_ms: u64,
}

#[derive(Default)]
struct ReplicaTally {
    available: u32,
    loading: u32,
    load_failed: u32,
    unloading: u32,
    unload_failed: u32,
    draining: u32,
    latest_ms: u64,
    failed_ms: u64,
    failed_reason: String,
}

// ── Version ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version: u32,
    pub definition: ModelDefinition,
    /// Server whose replicas the `replicas` map indexes into.
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub replicas: BTreeMap<u32, ReplicaStatus>,
    #[serde(default)]
    pub status: ModelStatus,
}

impl ModelVersion {
    pub fn new(version: u32, definition: ModelDefinition) -> Self {
        Self {
            version,
            definition,
            server: None,
            replicas: BTreeMap::new(),
            status: ModelStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn id(&self) -> ModelVersionId {
        ModelVersionId::new(self.definition.name.clone(), self.version)
    }

    pub fn required_memory(&self) -> u64 {
        self.definition.required_memory()
    }

    pub fn desired_replicas(&self) -> u32 {
        self.definition.replicas
    }

    pub fn min_replicas(&self) -> u32 {
        self.definition.min_replicas
    }

    pub fn has_server(&self) -> bool {
        self.server.is_some()
    }

    /// State of replica `idx`; `Unknown` if the version never touched it.
    pub fn replica_state(&self, idx: u32) -> ReplicaState {
        self.replicas
            .get(&idx)
            .map(|s| s.state)
            .unwrap_or(ReplicaState::Unknown)
    }

    /// Record a new state for replica `idx`, returning the previous one.
    pub fn set_replica_state(
        &mut self,
        idx: u32,
        state: ReplicaState,
        reason: impl Into<String>,
    ) -> ReplicaState {
        let previous = self.replica_state(idx);
        self.replicas.insert(idx, ReplicaStatus::new(state, reason));
        previous
    }

    pub fn delete_replica(&mut self, idx: u32) -> Option<ReplicaStatus> {
        self.replicas.remove(&idx)
    }

    /// Indices whose state satisfies `pred`, ascending.
    pub fn replicas_in_state(&self, pred: impl Fn(ReplicaState) -> bool) -> Vec<u32> {
        self.replicas
            .iter()
            .filter(|(_, s)| pred(s.state))
            .map(|(idx, _)| *idx)
            .collect()
    }

    /// Replicas that should receive traffic for this version.
    ///
    /// Serving replicas win; if there are none, draining replicas keep
    /// serving until their replacement is up.
    pub fn get_assignment(&self) -> Vec<u32> {
        let serving = self.replicas_in_state(|s| {
            matches!(
                s,
                ReplicaState::Loaded | ReplicaState::Available | ReplicaState::LoadedUnavailable
            )
        });
        if !serving.is_empty() {
            return serving;
        }
        self.replicas_in_state(|s| s == ReplicaState::Draining)
    }

    /// Whether this version is loading or loaded on exactly `server:idx`.
    pub fn is_loading_or_loaded(&self, server: &str, idx: u32) -> bool {
        self.server.as_deref() == Some(server) && self.replica_state(idx).is_loading_or_loaded()
    }

    pub fn has_live_replicas(&self) -> bool {
        self.replicas.values().any(|s| s.state.can_receive_traffic())
    }

    /// At least one replica still holds (or is acquiring) resources.
    pub fn is_active(&self) -> bool {
        self.replicas.values().any(|s| !s.state.is_inactive())
    }

    /// Recompute [`ModelStatus`] from the replica map.
    ///
    /// Superseded and deleted versions report termination progress; the
    /// latest version reports placement progress. `prev_available` is true
    /// when an earlier version was available, which lets a rolling update
    /// count as available as soon as the new version serves anywhere.
    pub fn refresh_status(&mut self, is_latest: bool, deleted: bool, prev_available: bool) {
        if self.status.state == ModelState::ScheduleFailed
            && is_latest
            && !deleted
            && self.replicas.is_empty()
        {
            return;
        }

        let tally = self.tally(deleted);
        let mut reason = String::new();
        let mut timestamp_ms = tally.latest_ms;

        let state = if deleted || !is_latest {
            if tally.unload_failed > 0 {
                reason = tally.failed_reason.clone();
                timestamp_ms = tally.failed_ms;
                ModelState::TerminateFailed
            } else if tally.unloading > 0 || tally.available > 0 || tally.loading > 0 {
                ModelState::Terminating
            } else {
                ModelState::Terminated
            }
        } else {
            let desired = self.desired_replicas();
            let min = self.min_replicas();
            if tally.load_failed > 0 {
                reason = tally.failed_reason.clone();
                timestamp_ms = tally.failed_ms;
                ModelState::Failed
            } else if tally.available == 0 && desired == 0 && min == 0 {
                ModelState::ScaledDown
            } else if tally.available == desired
                || (min > 0 && tally.available >= min)
                || (tally.available > 0 && prev_available)
            {
                ModelState::Available
            } else {
                ModelState::Progressing
            }
        };

        self.status = ModelStatus {
            state,
            reason,
            available_replicas: tally.available,
            unavailable_replicas: tally.loading + tally.load_failed,
            draining_replicas: tally.draining,
            timestamp_ms,
        };
    }

    /// Placement found no home for this version.
    pub fn mark_schedule_failed(&mut self, reason: impl Into<String>) {
        let available = self.get_assignment().len() as u32;
        self.status = ModelStatus {
            state: ModelState::ScheduleFailed,
            reason: reason.into(),
            available_replicas: available,
            unavailable_replicas: self.desired_replicas().saturating_sub(available),
            draining_replicas: 0,
            timestamp_ms: crate::epoch_millis(),
        };
    }

    fn tally(&self, deleted: bool) -> ReplicaTally {
        let mut t = ReplicaTally::default();
        for status in self.replicas.values() {
            match status.state {
                ReplicaState::Available => t.available += 1,
                ReplicaState::LoadRequested | ReplicaState::Loading | ReplicaState::Loaded => {
                    t.loading += 1
                }
                ReplicaState::LoadFailed | ReplicaState::LoadedUnavailable => {
                    t.load_failed += 1;
                    if !deleted && status.timestamp_ms >= t.failed_ms {
                        t.failed_ms = status.timestamp_ms;
                        t.failed_reason = status.reason.clone();
                    }
                }
                ReplicaState::UnloadEnvoyRequested
                | ReplicaState::UnloadRequested
                | ReplicaState::Unloading => t.unloading += 1,
                ReplicaState::UnloadFailed => {
                    t.unload_failed += 1;
                    if status.timestamp_ms >= t.failed_ms {
                        t.failed_ms = status.timestamp_ms;
                        t.failed_reason = status.reason.clone();
                    }
                }
                ReplicaState::Draining => t.draining += 1,
                ReplicaState::Unloaded | ReplicaState::Unknown => {}
            }
            t.latest_ms = t.latest_ms.max(status.timestamp_ms);
        }
        t
    }
}

// ── Model ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    /// Oldest first; the last entry is the latest version.
    pub versions: Vec<ModelVersion>,
    #[serde(default)]
    pub deleted: bool,
}

impl Model {
    /// A new model with its first version numbered from the definition's generation.
    pub fn new(definition: ModelDefinition) -> Self {
        let version = u32::try_from(definition.generation.max(1)).unwrap_or(u32::MAX);
        Self {
            name: definition.name.clone(),
            versions: vec![ModelVersion::new(version, definition)],
            deleted: false,
        }
    }

    pub fn latest(&self) -> Option<&ModelVersion> {
        self.versions.last()
    }

    pub fn latest_mut(&mut self) -> Option<&mut ModelVersion> {
        self.versions.last_mut()
    }

    pub fn version(&self, version: u32) -> Option<&ModelVersion> {
        self.versions.iter().find(|v| v.version == version)
    }

    pub fn version_mut(&mut self, version: u32) -> Option<&mut ModelVersion> {
        self.versions.iter_mut().find(|v| v.version == version)
    }

    pub fn is_latest(&self, version: u32) -> bool {
        self.latest().is_some_and(|v| v.version == version)
    }

    /// Every version has released all of its replicas.
    pub fn is_fully_inactive(&self) -> bool {
        self.versions.iter().all(|v| !v.is_active())
    }

    /// Most recent version whose status is `Available`, excluding the latest.
    pub fn last_available_before_latest(&self) -> Option<&ModelVersion> {
        let n = self.versions.len();
        self.versions
            .iter()
            .take(n.saturating_sub(1))
            .rev()
            .find(|v| v.status.state == ModelState::Available)
    }

    /// Append a new version carrying `definition`; returns its number.
    pub fn add_version(&mut self, definition: ModelDefinition) -> u32 {
        let next = self.latest().map(|v| v.version + 1).unwrap_or(1);
        let generation = u32::try_from(definition.generation).unwrap_or(u32::MAX);
        let version = next.max(generation);
        self.versions.push(ModelVersion::new(version, definition));
        version
    }

    /// Fold a (re)submitted definition into this model.
    ///
    /// Returns the version number that should be scheduled. A deleted model
    /// only comes back once all of its versions are inactive; a definition
    /// that changes resources or placement constraints gets a new version, as
    /// does a newer generation unless only the replica counts moved; anything
    /// else, scaling included, is updated in place on the latest version.
    pub fn apply_definition(&mut self, definition: ModelDefinition) -> StateResult<u32> {
        if self.deleted {
            if !self.is_fully_inactive() {
                return Err(StateError::Invalid {
                    field: "model",
                    reason: format!("{} is still terminating", self.name),
                });
            }
            self.deleted = false;
            return Ok(self.add_version(definition));
        }

        let Some(latest) = self.versions.last_mut() else {
            return Ok(self.add_version(definition));
        };
        if latest.definition == definition {
            return Ok(latest.version);
        }
        let rescale = latest.definition.only_scale_differs(&definition);
        if latest.definition.placement_differs(&definition)
            || (definition.generation > latest.definition.generation && !rescale)
        {
            return Ok(self.add_version(definition));
        }
        latest.definition = definition;
        Ok(latest.version)
    }

    /// Recompute every version's status; the latest gets placement semantics.
    pub fn refresh_statuses(&mut self) {
        let prev_available = self.last_available_before_latest().is_some();
        let deleted = self.deleted;
        let n = self.versions.len();
        for (i, version) in self.versions.iter_mut().enumerate() {
            let is_latest = i + 1 == n;
            version.refresh_status(is_latest, deleted, is_latest && prev_available);
        }
    }
}
