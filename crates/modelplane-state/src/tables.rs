//! redb table definitions for the modelplane state store.
//!
//! Values and their versions live in separate tables keyed by the same
//! string key, and are always written in the same transaction.

use redb::TableDefinition;

/// Opaque values keyed by caller-chosen string keys (e.g. `cluster/state`).
pub const VALUES: TableDefinition<&str, &[u8]> = TableDefinition::new("values");

/// Monotonic write counter per key, bumped on every `set`.
pub const VERSIONS: TableDefinition<&str, u64> = TableDefinition::new("versions");
