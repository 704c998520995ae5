//! StateStore: redb-backed key/value persistence for modelplane.
//!
//! The control plane only needs an opaque get/set/delete contract, so the
//! store deals in raw bytes and leaves encoding to its callers. Every key
//! carries a version that is bumped on each write in the same transaction as
//! the value, which gives callers optimistic concurrency through
//! [`KeyValueStore::set_if_version`]. Both on-disk and in-memory backends are
//! supported (the latter for tests and ephemeral clusters).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::{VALUES, VERSIONS};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// A stored value together with the version it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Minimal persistence contract the cluster store is written against.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StateResult<Option<Versioned>>;

    /// Write unconditionally; returns the new version.
    fn set(&self, key: &str, value: &[u8]) -> StateResult<u64>;

    /// Write only if the key is currently at `expected` (0 = absent).
    fn set_if_version(&self, key: &str, value: &[u8], expected: u64) -> StateResult<u64>;

    /// Returns true if the key existed.
    fn delete(&self, key: &str) -> StateResult<bool>;
}

/// Thread-safe key/value store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(VALUES).map_err(map_err!(Table))?;
        txn.open_table(VERSIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Write `value` under `key`, optionally checking the current version first.
    fn write(&self, key: &str, value: &[u8], expected: Option<u64>) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut versions = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            let current = versions
                .get(key)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);
            if let Some(expected) = expected.filter(|e| *e != current) {
                return Err(StateError::VersionConflict {
                    key: key.to_string(),
                    expected,
                    found: current,
                });
            }
            next = current + 1;
            versions.insert(key, next).map_err(map_err!(Write))?;

            let mut values = txn.open_table(VALUES).map_err(map_err!(Table))?;
            values.insert(key, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, version = next, bytes = value.len(), "value stored");
        Ok(next)
    }
}

impl KeyValueStore for StateStore {
    fn get(&self, key: &str) -> StateResult<Option<Versioned>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let values = txn.open_table(VALUES).map_err(map_err!(Table))?;
        let Some(guard) = values.get(key).map_err(map_err!(Read))? else {
            return Ok(None);
        };
        let value = guard.value().to_vec();
        let versions = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
        let version = versions
            .get(key)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);
        Ok(Some(Versioned { value, version }))
    }

    fn set(&self, key: &str, value: &[u8]) -> StateResult<u64> {
        self.write(key, value, None)
    }

    fn set_if_version(&self, key: &str, value: &[u8], expected: u64) -> StateResult<u64> {
        self.write(key, value, Some(expected))
    }

    fn delete(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut values = txn.open_table(VALUES).map_err(map_err!(Table))?;
            existed = values.remove(key).map_err(map_err!(Write))?.is_some();
            let mut versions = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            versions.remove(key).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "value deleted");
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_returns_value_and_version() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.set("a", b"one").unwrap(), 1);
        assert_eq!(store.set("a", b"two").unwrap(), 2);

        let got = store.get("a").unwrap().unwrap();
        assert_eq!(got.value, b"two");
        assert_eq!(got.version, 2);
    }

    #[test]
    fn get_missing_is_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn delete_reports_existence() {
        let store = StateStore::open_in_memory().unwrap();
        store.set("a", b"x").unwrap();
        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn delete_resets_version() {
        let store = StateStore::open_in_memory().unwrap();
        store.set("a", b"x").unwrap();
        store.set("a", b"y").unwrap();
        store.delete("a").unwrap();
        assert_eq!(store.set_if_version("a", b"z", 0).unwrap(), 1);
    }

    #[test]
    fn conditional_write_detects_conflict() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.set_if_version("k", b"v1", 0).unwrap(), 1);

        let err = store.set_if_version("k", b"v2", 0).unwrap_err();
        assert!(matches!(
            err,
            StateError::VersionConflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
        // Failed write leaves the old value in place.
        assert_eq!(store.get("k").unwrap().unwrap().value, b"v1");

        assert_eq!(store.set_if_version("k", b"v2", 1).unwrap(), 2);
    }

    #[test]
    fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.set("cluster/state", b"{}").unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        let got = store.get("cluster/state").unwrap().unwrap();
        assert_eq!(got.value, b"{}");
        assert_eq!(got.version, 1);
    }
}
