//! modelplane.toml configuration.
//!
//! Every section and field is optional; an empty file yields the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use modelplane_agent::{DrainConfig, RetryConfig};
use modelplane_scheduler::CoordinatorConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub store: StoreConfig,
    pub coordinator: CoordinatorSection,
    pub synchroniser: SynchroniserSection,
    pub drain: DrainSection,
    pub dispatch: DispatchSection,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// Keep state in memory only; nothing survives a restart.
    pub in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/modelplane"),
            in_memory: false,
        }
    }
}

impl StoreConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("modelplane.redb")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    pub sync_timeout_ms: u64,
    pub coalesce_window_ms: u64,
    pub sync_buffer: usize,
    /// Channel size for long-lived subscribers (dispatch, synchroniser).
    pub subscriber_buffer: usize,
    /// How often models that could not be placed are retried; 0 disables.
    pub retry_interval_secs: u64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 5_000,
            coalesce_window_ms: 10,
            sync_buffer: 10,
            subscriber_buffer: 1024,
            retry_interval_secs: 30,
        }
    }
}

impl CoordinatorSection {
    pub fn to_coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            sync_timeout: Duration::from_millis(self.sync_timeout_ms),
            coalesce_window: Duration::from_millis(self.coalesce_window_ms),
            sync_buffer: self.sync_buffer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynchroniserKind {
    /// Wait for the server replicas known from persisted state.
    #[default]
    ServerBased,
    /// Wait out the timeout only.
    Simple,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynchroniserSection {
    pub kind: SynchroniserKind,
    pub timeout_ms: u64,
}

impl Default for SynchroniserSection {
    fn default() -> Self {
        Self {
            kind: SynchroniserKind::ServerBased,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainSection {
    pub port: u16,
    pub debounce_ms: u64,
    pub threshold: u32,
    /// Server replica drained when `/terminate` triggers. Without it the
    /// endpoint still answers but nothing is drained.
    pub server: Option<String>,
    pub replica_idx: u32,
}

impl Default for DrainSection {
    fn default() -> Self {
        Self {
            port: 9007,
            debounce_ms: 100,
            threshold: 3,
            server: None,
            replica_idx: 0,
        }
    }
}

impl DrainSection {
    pub fn to_drain_config(&self) -> DrainConfig {
        DrainConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            threshold: self.threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            max_attempts: retry.max_attempts,
            initial_delay_ms: retry.initial_delay.as_millis() as u64,
            max_delay_ms: retry.max_delay.as_millis() as u64,
            multiplier: retry.multiplier,
            jitter: retry.jitter,
        }
    }
}

impl DispatchSection {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.coordinator.sync_timeout_ms, 5_000);
        assert_eq!(config.drain.threshold, 3);
        assert_eq!(config.synchroniser.kind, SynchroniserKind::ServerBased);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = DaemonConfig::from_toml(
            r#"
[store]
data_dir = "/tmp/mp"

[synchroniser]
kind = "simple"

[drain]
server = "mlserver"
replica_idx = 2
"#,
        )
        .unwrap();
        assert_eq!(config.store.db_path(), PathBuf::from("/tmp/mp/modelplane.redb"));
        assert!(!config.store.in_memory);
        assert_eq!(config.synchroniser.kind, SynchroniserKind::Simple);
        assert_eq!(config.synchroniser.timeout_ms, 10_000);
        assert_eq!(config.drain.server.as_deref(), Some("mlserver"));
        assert_eq!(config.drain.port, 9007);
    }

    #[test]
    fn conversions_carry_values() {
        let config = DaemonConfig::default();
        let coordinator = config.coordinator.to_coordinator_config();
        assert_eq!(coordinator.coalesce_window, Duration::from_millis(10));
        let retry = config.dispatch.to_retry_config();
        assert_eq!(retry.max_attempts, RetryConfig::default().max_attempts);
        assert_eq!(config.drain.to_drain_config().debounce, Duration::from_millis(100));
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = DaemonConfig::default();
        config.drain.server = Some("triton".into());
        let text = config.to_toml_string().unwrap();
        assert_eq!(DaemonConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(DaemonConfig::from_toml("[synchroniser]\nkind = \"eventual\"\n").is_err());
    }
}
