//! # Migration Runner
//!
//! Schema steps are applied once, in ascending version order, at startup.
//! Every pending step writes into one staged overlay that is committed with
//! a single `atomic_batch_write` together with the new schema version, so a
//! failing step leaves the store exactly as it was.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use shared_types::{NodePorts, SupervisorError, SupervisorResult};
use tracing::{debug, info};

use crate::domain::records::{
    decode_u64, decode_value, encode, sequence_key, table_marker_key, table_prefix, NODES,
    SCHEMA_VERSION_KEY, TABLES, WORKERS,
};
use crate::ports::{BatchOperation, KeyValueStore};

/// One versioned schema step.
pub struct Migration {
    pub version: u64,
    pub name: &'static str,
    pub up: fn(&mut MigrationContext<'_>) -> SupervisorResult<()>,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("name", &self.name)
            .finish()
    }
}

/// The supervisor's schema history.
pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_tables",
        up: create_tables,
    },
    Migration {
        version: 2,
        name: "worker_nullable_fields",
        up: worker_nullable_fields,
    },
    Migration {
        version: 3,
        name: "node_ports_and_endpoint",
        up: node_ports_and_endpoint,
    },
];

/// Reads see earlier staged writes; nothing reaches the backend until the
/// runner commits.
pub struct MigrationContext<'a> {
    base: &'a dyn KeyValueStore,
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> MigrationContext<'a> {
    fn new(base: &'a dyn KeyValueStore) -> Self {
        Self {
            base,
            staged: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> SupervisorResult<Option<Vec<u8>>> {
        match self.staged.get(key.as_bytes()) {
            Some(staged) => Ok(staged.clone()),
            None => Ok(self.base.get(key.as_bytes())?),
        }
    }

    pub fn put(&mut self, key: &str, value: Vec<u8>) {
        self.staged.insert(key.as_bytes().to_vec(), Some(value));
    }

    pub fn delete(&mut self, key: &str) {
        self.staged.insert(key.as_bytes().to_vec(), None);
    }

    /// Rows under `prefix` as JSON, staged writes applied.
    pub fn rows(&self, prefix: &str) -> SupervisorResult<Vec<(String, Value)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .base
            .prefix_scan(prefix.as_bytes())?
            .into_iter()
            .collect();
        for (key, staged) in self.staged.range(prefix.as_bytes().to_vec()..) {
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            match staged {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }

        merged
            .into_iter()
            .map(|(key, bytes)| {
                let value = decode_value(&key, &bytes)?;
                Ok((String::from_utf8_lossy(&key).into_owned(), value))
            })
            .collect()
    }

    fn into_batch(self) -> Vec<BatchOperation> {
        self.staged
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => BatchOperation::put(key, value),
                None => BatchOperation::delete(key),
            })
            .collect()
    }
}

/// Applies pending migrations.
pub struct MigrationRunner<'m> {
    migrations: &'m [Migration],
}

impl Default for MigrationRunner<'static> {
    fn default() -> Self {
        Self::new(MIGRATIONS)
    }
}

impl<'m> MigrationRunner<'m> {
    #[must_use]
    pub fn new(migrations: &'m [Migration]) -> Self {
        Self { migrations }
    }

    /// Highest version this runner knows about.
    #[must_use]
    pub fn latest_version(&self) -> u64 {
        self.migrations.iter().map(|m| m.version).max().unwrap_or(0)
    }

    /// Version recorded in the store, 0 for a fresh store.
    pub fn current_version(store: &dyn KeyValueStore) -> SupervisorResult<u64> {
        match store.get(SCHEMA_VERSION_KEY.as_bytes())? {
            Some(bytes) => decode_u64(SCHEMA_VERSION_KEY.as_bytes(), &bytes),
            None => Ok(0),
        }
    }

    /// Apply every migration newer than the stored version.
    ///
    /// Returns the versions applied. Any failure is `FatalStartup` and
    /// nothing is written.
    pub fn run(&self, store: &mut dyn KeyValueStore) -> SupervisorResult<Vec<u64>> {
        let fatal = |msg: String| SupervisorError::FatalStartup(msg);

        if self
            .migrations
            .windows(2)
            .any(|pair| pair[0].version >= pair[1].version)
        {
            return Err(fatal("migrations are not in strictly ascending order".into()));
        }

        let current = Self::current_version(store)
            .map_err(|e| fatal(format!("cannot read schema version: {e}")))?;
        if current > self.latest_version() {
            return Err(fatal(format!(
                "store schema version {current} is newer than supported {}",
                self.latest_version()
            )));
        }

        let pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| m.version > current)
            .collect();
        if pending.is_empty() {
            debug!(version = current, "schema up to date");
            return Ok(Vec::new());
        }

        let mut ctx = MigrationContext::new(&*store);
        let mut applied = Vec::with_capacity(pending.len());
        for migration in pending {
            (migration.up)(&mut ctx).map_err(|e| {
                fatal(format!(
                    "migration {} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            debug!(version = migration.version, name = migration.name, "migration staged");
            applied.push(migration.version);
        }

        let version = applied.last().copied().unwrap_or(current);
        ctx.put(SCHEMA_VERSION_KEY, version.to_be_bytes().to_vec());
        let batch = ctx.into_batch();

        store
            .atomic_batch_write(batch)
            .map_err(|e| fatal(format!("cannot commit migrations: {e}")))?;
        info!(from = current, to = version, "schema migrated");
        Ok(applied)
    }
}

// =============================================================================
// STEPS
// =============================================================================

fn create_tables(ctx: &mut MigrationContext<'_>) -> SupervisorResult<()> {
    for table in TABLES {
        ctx.put(&table_marker_key(table), Vec::new());
        if ctx.get(&sequence_key(table))?.is_none() {
            ctx.put(&sequence_key(table), 0u64.to_be_bytes().to_vec());
        }
    }
    Ok(())
}

/// Worker rows from before the chain index and deposit were tracked.
fn worker_nullable_fields(ctx: &mut MigrationContext<'_>) -> SupervisorResult<()> {
    for (key, mut row) in ctx.rows(&table_prefix(WORKERS))? {
        let Some(object) = row.as_object_mut() else {
            return Err(SupervisorError::Storage(format!("{key} is not an object")));
        };
        let mut changed = false;
        for (field, default) in [
            ("validator_index", Value::Null),
            ("deposit_data", Value::Null),
            ("status", json!("pending")),
        ] {
            if !object.contains_key(field) {
                object.insert(field.to_string(), default);
                changed = true;
            }
        }
        if changed {
            ctx.put(&key, encode(&row)?);
        }
    }
    Ok(())
}

/// Node rows from before ports were configurable.
fn node_ports_and_endpoint(ctx: &mut MigrationContext<'_>) -> SupervisorResult<()> {
    let defaults = NodePorts::default();
    for (key, mut row) in ctx.rows(&table_prefix(NODES))? {
        let Some(object) = row.as_object_mut() else {
            return Err(SupervisorError::Storage(format!("{key} is not an object")));
        };
        let mut changed = false;
        if !object.contains_key("ports") {
            object.insert("ports".into(), serde_json::to_value(defaults)?);
            changed = true;
        }
        if !object.contains_key("rpc_endpoint") {
            let ports: NodePorts = serde_json::from_value(object["ports"].clone())?;
            object.insert("rpc_endpoint".into(), json!(ports.default_rpc_endpoint()));
            changed = true;
        }
        if !object.contains_key("process_state") {
            object.insert("process_state".into(), json!("stopped"));
            changed = true;
        }
        if changed {
            ctx.put(&key, encode(&row)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryKVStore;
    use crate::domain::records::row_key;
    use shared_types::ErrorKind;

    fn failing(_: &mut MigrationContext<'_>) -> SupervisorResult<()> {
        Err(SupervisorError::Storage("boom".into()))
    }

    #[test]
    fn test_fresh_store_applies_all_in_order() {
        let mut store = InMemoryKVStore::new();
        let applied = MigrationRunner::default().run(&mut store).unwrap();
        assert_eq!(applied, vec![1, 2, 3]);
        assert_eq!(MigrationRunner::current_version(&store).unwrap(), 3);
        assert!(store.exists(b"meta/tables/workers").unwrap());
    }

    #[test]
    fn test_second_run_is_noop() {
        let mut store = InMemoryKVStore::new();
        MigrationRunner::default().run(&mut store).unwrap();
        assert!(MigrationRunner::default().run(&mut store).unwrap().is_empty());
    }

    #[test]
    fn test_failure_is_fatal_and_atomic() {
        let steps = [
            Migration {
                version: 1,
                name: "create_tables",
                up: create_tables,
            },
            Migration {
                version: 2,
                name: "broken",
                up: failing,
            },
        ];
        let mut store = InMemoryKVStore::new();
        let err = MigrationRunner::new(&steps).run(&mut store).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FatalStartup);
        assert!(err.to_string().contains("broken"));
        // Version 1 was staged but never committed.
        assert!(store.is_empty());
    }

    #[test]
    fn test_unordered_migrations_rejected() {
        let steps = [
            Migration {
                version: 2,
                name: "b",
                up: create_tables,
            },
            Migration {
                version: 1,
                name: "a",
                up: create_tables,
            },
        ];
        let mut store = InMemoryKVStore::new();
        assert!(MigrationRunner::new(&steps).run(&mut store).is_err());
    }

    #[test]
    fn test_newer_store_rejected() {
        let mut store = InMemoryKVStore::new();
        store
            .put(SCHEMA_VERSION_KEY.as_bytes(), &99u64.to_be_bytes())
            .unwrap();
        let err = MigrationRunner::default().run(&mut store).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_backfills_old_rows() {
        let mut store = InMemoryKVStore::new();
        store
            .put(
                row_key(WORKERS, 1).as_bytes(),
                br#"{"id":1,"node_id":1,"public_key":"aa","withdrawal_address":"bb","signature":"cc","created_at":"2024-01-01T00:00:00Z"}"#,
            )
            .unwrap();
        store
            .put(
                row_key(NODES, 1).as_bytes(),
                br#"{"id":1,"name":"n","network":"testnet8","data_path":"/d","created_at":"2024-01-01T00:00:00Z"}"#,
            )
            .unwrap();

        MigrationRunner::default().run(&mut store).unwrap();

        let worker: shared_types::Worker = serde_json::from_slice(
            &store.get(row_key(WORKERS, 1).as_bytes()).unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(worker.status, shared_types::WorkerStatus::Pending);
        assert_eq!(worker.validator_index, None);

        let node: shared_types::Node = serde_json::from_slice(
            &store.get(row_key(NODES, 1).as_bytes()).unwrap().unwrap(),
        )
        .unwrap();
        assert_eq!(node.rpc_endpoint, "http://127.0.0.1:8545");
        assert_eq!(node.process_state, shared_types::ProcessState::Stopped);
    }
}
