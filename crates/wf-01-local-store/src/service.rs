//! # Local Store Service
//!
//! Record-level API used by the node manager, worker manager and status
//! monitor. Every read-modify-write runs under the row lock of the record it
//! touches; the backend mutex is only held for single backend calls.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use shared_types::{
    normalize_hex, JobId, KeyMaterial, NewNode, Node, NodeId, NodeUpdate, ProcessState,
    SupervisorError, SupervisorResult, TargetId, Worker, WorkerId, WorkerStatus,
};
use tracing::{debug, info};

use crate::adapters::{FileBackedKVStore, InMemoryKVStore};
use crate::domain::filters::{NodeFilter, WorkerFilter};
use crate::domain::query::{Condition, Query};
use crate::domain::records::{
    decode, decode_u64, decode_value, encode, health_key, row_key, sequence_key, table_prefix,
    HEALTH, NODES, WORKERS,
};
use crate::migrations::MigrationRunner;
use crate::ports::{BatchOperation, KeyValueStore};

/// Fine-grained locks keyed by record key.
#[derive(Default)]
struct RowLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RowLocks {
    fn get(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}

/// Persisted Node/Worker records and health counters.
pub struct LocalStore {
    backend: Mutex<Box<dyn KeyValueStore>>,
    rows: RowLocks,
    /// Snapshot jobs currently owning a node's data directory.
    leases: Mutex<HashMap<NodeId, JobId>>,
    schema_version: u64,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("schema_version", &self.schema_version)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Open over an arbitrary backend, running pending migrations.
    pub fn open(mut backend: Box<dyn KeyValueStore>) -> SupervisorResult<Self> {
        MigrationRunner::default().run(backend.as_mut())?;
        let schema_version = MigrationRunner::current_version(backend.as_ref())
            .map_err(|e| SupervisorError::FatalStartup(e.to_string()))?;

        Ok(Self {
            backend: Mutex::new(backend),
            rows: RowLocks::default(),
            leases: Mutex::new(HashMap::new()),
            schema_version,
        })
    }

    /// Ephemeral store.
    pub fn in_memory() -> SupervisorResult<Self> {
        Self::open(Box::new(InMemoryKVStore::new()))
    }

    /// File-backed store at `path`, exclusively locked.
    pub fn open_file(path: &Path) -> SupervisorResult<Self> {
        let backend = FileBackedKVStore::open(path).map_err(|e| {
            SupervisorError::FatalStartup(format!("cannot open store {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "opened file store");
        Self::open(Box::new(backend))
    }

    /// RocksDB store in directory `path`.
    #[cfg(feature = "rocksdb")]
    pub fn open_rocksdb(path: &Path) -> SupervisorResult<Self> {
        let backend = crate::adapters::RocksDbStore::open(path).map_err(|e| {
            SupervisorError::FatalStartup(format!("cannot open store {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "opened rocksdb store");
        Self::open(Box::new(backend))
    }

    #[must_use]
    pub fn schema_version(&self) -> u64 {
        self.schema_version
    }

    // =========================================================================
    // BACKEND HELPERS
    // =========================================================================

    fn read<T: DeserializeOwned>(&self, key: &str) -> SupervisorResult<Option<T>> {
        let bytes = self.backend.lock().get(key.as_bytes())?;
        bytes.map(|b| decode(key.as_bytes(), &b)).transpose()
    }

    fn write(&self, operations: Vec<BatchOperation>) -> SupervisorResult<()> {
        self.backend.lock().atomic_batch_write(operations)?;
        Ok(())
    }

    fn scan<T: DeserializeOwned>(&self, table: &str, query: &Query) -> SupervisorResult<Vec<T>> {
        let raw = self
            .backend
            .lock()
            .prefix_scan(table_prefix(table).as_bytes())?;

        let mut rows = Vec::with_capacity(raw.len());
        for (key, bytes) in raw {
            rows.push((decode_value(&key, &bytes)?, (key, bytes)));
        }
        query
            .filter(rows)?
            .into_iter()
            .map(|(key, bytes)| decode(&key, &bytes))
            .collect()
    }

    /// Reserve the next id of `table`; the caller writes the returned
    /// sequence operation in the same batch as the row.
    fn next_id(&self, table: &str) -> SupervisorResult<(u64, BatchOperation)> {
        let key = sequence_key(table);
        let last = match self.backend.lock().get(key.as_bytes())? {
            Some(bytes) => decode_u64(key.as_bytes(), &bytes)?,
            None => 0,
        };
        let id = last + 1;
        Ok((id, BatchOperation::put(key, id.to_be_bytes().to_vec())))
    }

    // =========================================================================
    // NODES
    // =========================================================================

    /// Insert a node. `data_path` must be absolute and not used by another
    /// node.
    pub fn insert_node(&self, new: NewNode) -> SupervisorResult<Node> {
        if new.name.trim().is_empty() {
            return Err(SupervisorError::Precondition("node name is empty".into()));
        }
        if !new.data_path.is_absolute() {
            return Err(SupervisorError::Precondition(format!(
                "data path {} is not absolute",
                new.data_path.display()
            )));
        }

        // One lock for every insert: the uniqueness check spans all rows.
        let seq = self.rows.get(&sequence_key(NODES));
        let _guard = seq.lock();

        let data_path = serde_json::to_value(&new.data_path)?;
        let clash: Vec<Node> = self.scan(
            NODES,
            &Query::new().with("data_path", Condition::Equals(data_path)),
        )?;
        if let Some(existing) = clash.first() {
            return Err(SupervisorError::Precondition(format!(
                "data path {} already used by node {}",
                new.data_path.display(),
                existing.id
            )));
        }

        let (id, seq_op) = self.next_id(NODES)?;
        let ports = new.ports.unwrap_or_default();
        let node = Node {
            id: NodeId(id),
            name: new.name,
            network: new.network,
            data_path: new.data_path,
            rpc_endpoint: new
                .rpc_endpoint
                .unwrap_or_else(|| ports.default_rpc_endpoint()),
            ports,
            process_state: ProcessState::Stopped,
            created_at: Utc::now(),
        };

        self.write(vec![
            seq_op,
            BatchOperation::put(row_key(NODES, id), encode(&node)?),
        ])?;
        info!(node_id = %node.id, network = %node.network, "node record created");
        Ok(node)
    }

    pub fn get_node(&self, id: NodeId) -> SupervisorResult<Node> {
        self.read(&row_key(NODES, id.0))?
            .ok_or_else(|| SupervisorError::not_found("node", id))
    }

    pub fn list_nodes(&self, filter: &NodeFilter) -> SupervisorResult<Vec<Node>> {
        self.scan(NODES, &filter.to_query())
    }

    /// Read-modify-write of one node under its row lock.
    ///
    /// `f` also sees the snapshot lease on the node's data directory. The
    /// row is only written when `f` succeeds.
    pub fn modify_node<T>(
        &self,
        id: NodeId,
        f: impl FnOnce(&mut Node, Option<JobId>) -> SupervisorResult<T>,
    ) -> SupervisorResult<(Node, T)> {
        let key = row_key(NODES, id.0);
        let row = self.rows.get(&key);
        let _guard = row.lock();

        let mut node: Node = self
            .read(&key)?
            .ok_or_else(|| SupervisorError::not_found("node", id))?;
        let lease = self.data_lease(id);
        let out = f(&mut node, lease)?;
        self.write(vec![BatchOperation::put(key, encode(&node)?)])?;
        Ok((node, out))
    }

    /// Apply a partial update. The network can never change.
    pub fn update_node(&self, id: NodeId, update: NodeUpdate) -> SupervisorResult<Node> {
        let (node, ()) = self.modify_node(id, |node, _| {
            if let Some(network) = update.network {
                if network != node.network {
                    return Err(SupervisorError::Precondition(format!(
                        "network of node {} is {} and cannot change",
                        node.id, node.network
                    )));
                }
            }
            if let Some(name) = update.name {
                if name.trim().is_empty() {
                    return Err(SupervisorError::Precondition("node name is empty".into()));
                }
                node.name = name;
            }
            if let Some(ports) = update.ports {
                node.ports = ports;
            }
            if let Some(endpoint) = update.rpc_endpoint {
                node.rpc_endpoint = endpoint;
            }
            Ok(())
        })?;
        Ok(node)
    }

    /// Set the process state, returning the previous one.
    pub fn set_process_state(
        &self,
        id: NodeId,
        state: ProcessState,
    ) -> SupervisorResult<ProcessState> {
        let (_, previous) = self.modify_node(id, |node, _| {
            Ok(std::mem::replace(&mut node.process_state, state))
        })?;
        Ok(previous)
    }

    /// Delete a node together with its workers and health counters, in one
    /// batch. Returns the ids of the removed workers.
    pub fn delete_node(&self, id: NodeId) -> SupervisorResult<Vec<WorkerId>> {
        let key = row_key(NODES, id.0);
        let row = self.rows.get(&key);
        let _guard = row.lock();

        if self.read::<Node>(&key)?.is_none() {
            return Err(SupervisorError::not_found("node", id));
        }
        if let Some(job) = self.data_lease(id) {
            return Err(SupervisorError::Conflict(format!(
                "snapshot job {job} owns node {id}"
            )));
        }

        let workers = self.list_workers(&WorkerFilter::all().node(id))?;
        let mut batch = vec![
            BatchOperation::delete(key),
            BatchOperation::delete(health_key(&TargetId::Node(id))),
        ];
        for worker in &workers {
            batch.push(BatchOperation::delete(row_key(WORKERS, worker.id.0)));
            batch.push(BatchOperation::delete(health_key(&TargetId::Worker(
                worker.id,
            ))));
        }
        self.write(batch)?;

        let removed: Vec<WorkerId> = workers.into_iter().map(|w| w.id).collect();
        info!(node_id = %id, workers = removed.len(), "node record deleted");
        Ok(removed)
    }

    // =========================================================================
    // WORKERS
    // =========================================================================

    /// Insert a `pending` worker on an existing node. A public key may
    /// appear once per node.
    pub fn insert_worker(&self, node_id: NodeId, keys: &KeyMaterial) -> SupervisorResult<Worker> {
        let public_key = normalize_hex(&keys.public_key);
        if public_key.is_empty() {
            return Err(SupervisorError::Precondition("public key is empty".into()));
        }

        // The node row lock keeps the duplicate check and the insert together.
        let node_key = row_key(NODES, node_id.0);
        let node_row = self.rows.get(&node_key);
        let _node_guard = node_row.lock();
        if self.read::<Node>(&node_key)?.is_none() {
            return Err(SupervisorError::not_found("node", node_id));
        }

        let duplicates = self.list_workers(
            &WorkerFilter::all().node(node_id).public_key(&public_key),
        )?;
        if !duplicates.is_empty() {
            return Err(SupervisorError::Conflict(format!(
                "public key {public_key} already registered on node {node_id}"
            )));
        }

        let seq = self.rows.get(&sequence_key(WORKERS));
        let _seq_guard = seq.lock();
        let (id, seq_op) = self.next_id(WORKERS)?;
        let worker = Worker {
            id: WorkerId(id),
            node_id,
            validator_index: None,
            public_key,
            withdrawal_address: normalize_hex(&keys.withdrawal_address),
            signature: normalize_hex(&keys.signature),
            status: WorkerStatus::Pending,
            deposit_data: keys.deposit_data.clone(),
            created_at: Utc::now(),
        };

        self.write(vec![
            seq_op,
            BatchOperation::put(row_key(WORKERS, id), encode(&worker)?),
        ])?;
        info!(worker_id = %worker.id, node_id = %node_id, "worker record created");
        Ok(worker)
    }

    pub fn get_worker(&self, id: WorkerId) -> SupervisorResult<Worker> {
        self.read(&row_key(WORKERS, id.0))?
            .ok_or_else(|| SupervisorError::not_found("worker", id))
    }

    pub fn list_workers(&self, filter: &WorkerFilter) -> SupervisorResult<Vec<Worker>> {
        self.scan(WORKERS, &filter.to_query())
    }

    /// Read-modify-write of one worker under its row lock.
    pub fn modify_worker<T>(
        &self,
        id: WorkerId,
        f: impl FnOnce(&mut Worker) -> SupervisorResult<T>,
    ) -> SupervisorResult<(Worker, T)> {
        let key = row_key(WORKERS, id.0);
        let row = self.rows.get(&key);
        let _guard = row.lock();

        let mut worker: Worker = self
            .read(&key)?
            .ok_or_else(|| SupervisorError::not_found("worker", id))?;
        let out = f(&mut worker)?;
        self.write(vec![BatchOperation::put(key, encode(&worker)?)])?;
        Ok((worker, out))
    }

    /// Delete a worker if `check` accepts it.
    pub fn delete_worker(
        &self,
        id: WorkerId,
        check: impl FnOnce(&Worker) -> SupervisorResult<()>,
    ) -> SupervisorResult<Worker> {
        let key = row_key(WORKERS, id.0);
        let row = self.rows.get(&key);
        let _guard = row.lock();

        let worker: Worker = self
            .read(&key)?
            .ok_or_else(|| SupervisorError::not_found("worker", id))?;
        check(&worker)?;
        self.write(vec![
            BatchOperation::delete(key),
            BatchOperation::delete(health_key(&TargetId::Worker(id))),
        ])?;
        debug!(worker_id = %id, "worker record deleted");
        Ok(worker)
    }

    // =========================================================================
    // HEALTH COUNTERS
    // =========================================================================

    /// Record a health result; returns the consecutive failure count after
    /// this result (0 on success).
    ///
    /// Fails with `NotFound` once the target is deleted. The check runs under
    /// the same row locks the deletes take, so a counter never outlives its
    /// target.
    pub fn record_health(&self, target: TargetId, healthy: bool) -> SupervisorResult<u32> {
        let node_id = match target {
            TargetId::Node(id) => id,
            TargetId::Worker(id) => {
                let worker_row = self.rows.get(&row_key(WORKERS, id.0));
                let _worker_guard = worker_row.lock();
                let worker = self.get_worker(id)?;
                // Cascading deletes hold only the node row.
                let node_row = self.rows.get(&row_key(NODES, worker.node_id.0));
                let _node_guard = node_row.lock();
                self.get_worker(id)?;
                return self.write_health(target, healthy);
            }
        };
        let node_row = self.rows.get(&row_key(NODES, node_id.0));
        let _guard = node_row.lock();
        self.get_node(node_id)?;
        self.write_health(target, healthy)
    }

    /// Caller holds the target's row lock.
    fn write_health(&self, target: TargetId, healthy: bool) -> SupervisorResult<u32> {
        let key = health_key(&target);
        let failures = if healthy {
            0
        } else {
            self.read::<u32>(&key)?.unwrap_or(0).saturating_add(1)
        };
        self.write(vec![BatchOperation::put(key, encode(&failures)?)])?;
        Ok(failures)
    }

    pub fn health_failures(&self, target: TargetId) -> SupervisorResult<u32> {
        Ok(self.read::<u32>(&health_key(&target))?.unwrap_or(0))
    }

    /// Number of health counters on record.
    pub fn health_targets(&self) -> SupervisorResult<usize> {
        Ok(self
            .backend
            .lock()
            .prefix_scan(table_prefix(HEALTH).as_bytes())?
            .len())
    }

    // =========================================================================
    // DATA LEASES
    // =========================================================================

    /// Hand a node's data directory to a snapshot job.
    ///
    /// The node must be stopped (or failed, which has no processes either)
    /// and not already leased.
    pub fn lease_data_path(&self, node_id: NodeId, job: JobId) -> SupervisorResult<Node> {
        let key = row_key(NODES, node_id.0);
        let row = self.rows.get(&key);
        let _guard = row.lock();

        let node: Node = self
            .read(&key)?
            .ok_or_else(|| SupervisorError::not_found("node", node_id))?;
        let mut leases = self.leases.lock();
        if let Some(holder) = leases.get(&node_id) {
            return Err(SupervisorError::Conflict(format!(
                "snapshot job {holder} already active for node {node_id}"
            )));
        }
        if !node.process_state.is_idle() {
            return Err(SupervisorError::Precondition(format!(
                "node {node_id} is {}, stop it first",
                node.process_state
            )));
        }
        leases.insert(node_id, job);
        debug!(node_id = %node_id, job_id = %job, "data path leased");
        Ok(node)
    }

    /// Release a lease; only the holding job can release it.
    pub fn release_data_lease(&self, node_id: NodeId, job: JobId) {
        let mut leases = self.leases.lock();
        if leases.get(&node_id) == Some(&job) {
            leases.remove(&node_id);
            debug!(node_id = %node_id, job_id = %job, "data path released");
        }
    }

    #[must_use]
    pub fn data_lease(&self, node_id: NodeId) -> Option<JobId> {
        self.leases.lock().get(&node_id).copied()
    }
}
