//! modelplaned: assembles the modelplane control plane.
//!
//! The binary in `main.rs` only parses flags and sets up logging; everything
//! it runs lives here so tests can start a control plane in-process.

pub mod config;
pub mod control_plane;

pub use config::{DaemonConfig, SynchroniserKind};
pub use control_plane::{ControlPlane, TracingTransport, expected_replicas, run};
