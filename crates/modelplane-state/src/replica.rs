//! Replica lifecycle states.
//!
//! Every (model version, server replica) pair carries one [`ReplicaState`].
//! Scheduling decisions and agent reports move it around; nothing enforces a
//! transition table, so the predicates below are the only contract other
//! components rely on.
//!
//! ```text
//!   Unknown ─▶ LoadRequested ─▶ Loading ─▶ Loaded ─▶ Available
//!                  │                          │          │
//!                  ▼                          ▼          ▼
//!              LoadFailed             LoadedUnavailable  Draining
//!
//!   (any live) ─▶ UnloadEnvoyRequested ─▶ UnloadRequested ─▶ Unloading ─▶ Unloaded
//!                                                               │
//!                                                               ▼
//!                                                          UnloadFailed
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one model version on one server replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    Unknown,
    LoadRequested,
    Loading,
    Loaded,
    Available,
    LoadedUnavailable,
    Draining,
    UnloadEnvoyRequested,
    UnloadRequested,
    Unloading,
    Unloaded,
    LoadFailed,
    UnloadFailed,
}

impl ReplicaState {
    /// Every state, in declaration order.
    pub const ALL: [ReplicaState; 13] = [
        ReplicaState::Unknown,
        ReplicaState::LoadRequested,
        ReplicaState::Loading,
        ReplicaState::Loaded,
        ReplicaState::Available,
        ReplicaState::LoadedUnavailable,
        ReplicaState::Draining,
        ReplicaState::UnloadEnvoyRequested,
        ReplicaState::UnloadRequested,
        ReplicaState::Unloading,
        ReplicaState::Unloaded,
        ReplicaState::LoadFailed,
        ReplicaState::UnloadFailed,
    ];

    /// The replica holds the model and may be routed inference traffic.
    pub fn can_receive_traffic(self) -> bool {
        matches!(
            self,
            Self::Loaded | Self::Available | Self::LoadedUnavailable | Self::Draining
        )
    }

    /// The agent has started (or finished) loading; a new load would be redundant.
    pub fn already_loading_or_loaded(self) -> bool {
        matches!(
            self,
            Self::Loading | Self::Loaded | Self::Available | Self::LoadedUnavailable
        )
    }

    /// Already on the way out, or never really in.
    ///
    /// `Loading` is included: a load still in flight when an unload is
    /// requested is superseded by that unload.
    pub fn unloading_or_unloaded(self) -> bool {
        matches!(
            self,
            Self::UnloadEnvoyRequested
                | Self::UnloadRequested
                | Self::Unloading
                | Self::Loading
                | Self::Unloaded
                | Self::Unknown
        )
    }

    /// The replica holds no resources for this model version.
    pub fn is_inactive(self) -> bool {
        matches!(
            self,
            Self::Unloaded | Self::UnloadFailed | Self::Unknown | Self::LoadFailed
        )
    }

    /// A load has been requested or has completed, counting memory as committed.
    pub fn is_loading_or_loaded(self) -> bool {
        matches!(
            self,
            Self::LoadRequested
                | Self::Loading
                | Self::Loaded
                | Self::Available
                | Self::LoadedUnavailable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::LoadRequested => "LoadRequested",
            Self::Loading => "Loading",
            Self::Loaded => "Loaded",
            Self::Available => "Available",
            Self::LoadedUnavailable => "LoadedUnavailable",
            Self::Draining => "Draining",
            Self::UnloadEnvoyRequested => "UnloadEnvoyRequested",
            Self::UnloadRequested => "UnloadRequested",
            Self::Unloading => "Unloading",
            Self::Unloaded => "Unloaded",
            Self::LoadFailed => "LoadFailed",
            Self::UnloadFailed => "UnloadFailed",
        }
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one replica slot plus when and why it got there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub state: ReplicaState,
    /// Unix timestamp (milliseconds) of the last state change.
    pub timestamp_ms: u64,
    #[serde(default)]
    pub reason: String,
}

impl ReplicaStatus {
    pub fn new(state: ReplicaState, reason: impl Into<String>) -> Self {
        Self {
            state,
            timestamp_ms: crate::epoch_millis(),
            reason: reason.into(),
        }
    }
}
