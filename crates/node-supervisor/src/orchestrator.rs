//! # Orchestrator
//!
//! Owns the event bus and every component, and is the only process-wide
//! lifecycle.
//!
//! ## Startup order
//!
//! 1. Open the store and run migrations
//! 2. Node manager (reconcile persisted states)
//! 3. Worker manager (observe status samples)
//! 4. Status monitor (start polling)
//! 5. Snapshot manager (recover data directories)
//!
//! The first failure aborts the sequence and tears down whatever was built.
//! `destroy` runs in exactly the reverse order, skips components that never
//! came up and can be called any number of times.

use std::sync::Arc;

use parking_lot::Mutex;
use shared_bus::{EventPublisher, InMemoryEventBus};
use shared_rpc::{HttpNodeRpc, NodeRpc};
use shared_types::{NodeId, SupervisorError, SupervisorResult};
use tracing::{error, info, warn};
use wf_01_local_store::LocalStore;
use wf_02_node_manager::{CommandBuilder, NodeManager, WaterfallCommands};
use wf_03_worker_manager::WorkerManager;
use wf_04_status_monitor::StatusMonitor;
use wf_05_snapshot_manager::{HttpSource, SchemeRouter, SnapshotManager, SnapshotSource};

use crate::config::{StoreBackend, SupervisorConfig};

/// The outward-facing I/O the components are built on.
#[derive(Clone)]
pub struct Adapters {
    pub rpc: Arc<dyn NodeRpc>,
    pub commands: Arc<dyn CommandBuilder>,
    pub snapshots: Arc<dyn SnapshotSource>,
}

impl Adapters {
    /// HTTP RPC, the Waterfall binaries and http/file snapshot sources.
    pub fn from_config(config: &SupervisorConfig) -> SupervisorResult<Self> {
        let rpc = HttpNodeRpc::new(config.rpc_timeout)
            .map_err(|e| SupervisorError::FatalStartup(format!("rpc client: {e}")))?;
        let http = HttpSource::new(config.download_connect_timeout)
            .map_err(|e| SupervisorError::FatalStartup(format!("download client: {e}")))?;

        let commands = config.binaries.bootnodes.iter().fold(
            WaterfallCommands::new(&config.binaries.coordinator, &config.binaries.validator),
            |commands, (network, bootnodes)| commands.with_bootnodes(*network, bootnodes.clone()),
        );

        Ok(Self {
            rpc: Arc::new(rpc),
            commands: Arc::new(commands),
            snapshots: Arc::new(SchemeRouter::new(http)),
        })
    }
}

/// Open the configured store and run pending migrations.
pub fn open_store(config: &SupervisorConfig) -> SupervisorResult<LocalStore> {
    let path = config.store_path();
    match config.store.backend {
        StoreBackend::Memory => LocalStore::in_memory(),
        StoreBackend::File => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SupervisorError::FatalStartup(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
            LocalStore::open_file(&path)
        }
        #[cfg(feature = "rocksdb")]
        StoreBackend::RocksDb => LocalStore::open_rocksdb(&path),
        #[cfg(not(feature = "rocksdb"))]
        StoreBackend::RocksDb => Err(SupervisorError::FatalStartup(
            "rocksdb backend is not compiled in".into(),
        )),
    }
}

#[derive(Default)]
struct Components {
    store: Option<Arc<LocalStore>>,
    nodes: Option<NodeManager>,
    workers: Option<WorkerManager>,
    monitor: Option<StatusMonitor>,
    snapshots: Option<SnapshotManager>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Running,
    Destroyed,
}

/// Explicit registry of the supervisor's components.
pub struct Orchestrator {
    config: SupervisorConfig,
    adapters: Adapters,
    bus: Arc<InMemoryEventBus>,
    components: Mutex<Components>,
    phase: Mutex<Phase>,
    /// Serializes `initialize` and `destroy`.
    lifecycle: tokio::sync::Mutex<()>,
    corrupt: Mutex<Vec<NodeId>>,
}

impl Orchestrator {
    pub fn new(config: SupervisorConfig) -> SupervisorResult<Self> {
        let adapters = Adapters::from_config(&config)?;
        Ok(Self::with_adapters(config, adapters))
    }

    pub fn with_adapters(config: SupervisorConfig, adapters: Adapters) -> Self {
        Self {
            config,
            adapters,
            bus: Arc::new(InMemoryEventBus::new()),
            components: Mutex::new(Components::default()),
            phase: Mutex::new(Phase::Created),
            lifecycle: tokio::sync::Mutex::new(()),
            corrupt: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn bus(&self) -> Arc<InMemoryEventBus> {
        Arc::clone(&self.bus)
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Nodes found half-applied by snapshot recovery at startup.
    pub fn corrupt_nodes(&self) -> Vec<NodeId> {
        self.corrupt.lock().clone()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Bring every component up in order. A no-op when already running; an
    /// error once destroyed.
    pub async fn initialize(&self) -> SupervisorResult<()> {
        let _guard = self.lifecycle.lock().await;
        match self.phase() {
            Phase::Running => return Ok(()),
            Phase::Destroyed => {
                return Err(SupervisorError::Unavailable(
                    "supervisor has been shut down".into(),
                ))
            }
            Phase::Created => {}
        }

        info!("starting supervisor");
        match self.start_components().await {
            Ok(()) => {
                *self.phase.lock() = Phase::Running;
                info!("supervisor running");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, kind = err.kind().code(), "startup failed, tearing down");
                self.teardown().await;
                *self.phase.lock() = Phase::Destroyed;
                Err(err)
            }
        }
    }

    async fn start_components(&self) -> SupervisorResult<()> {
        let store = Arc::new(open_store(&self.config)?);
        info!(schema_version = store.schema_version(), "store ready");
        self.components.lock().store = Some(Arc::clone(&store));

        let publisher: Arc<dyn EventPublisher> = self.bus.clone();

        let nodes = NodeManager::new(
            Arc::clone(&store),
            Arc::clone(&publisher),
            Arc::clone(&self.adapters.commands),
            self.config.process.into(),
        );
        self.components.lock().nodes = Some(nodes.clone());
        let reconciled = nodes.initialize().await?;
        info!(reconciled, "node manager ready");

        let workers = WorkerManager::new(
            Arc::clone(&store),
            self.bus.clone() as Arc<dyn shared_bus::EventBus>,
            Arc::clone(&self.adapters.rpc),
            self.config.workers.clone(),
        );
        self.components.lock().workers = Some(workers.clone());
        workers.initialize().await?;
        info!("worker manager ready");

        let monitor = StatusMonitor::new(
            Arc::clone(&store),
            Arc::clone(&publisher),
            Arc::clone(&self.adapters.rpc),
            self.config.monitor,
        );
        self.components.lock().monitor = Some(monitor.clone());
        monitor.start().await?;
        info!("status monitor ready");

        let snapshots = SnapshotManager::new(
            Arc::clone(&store),
            publisher,
            Arc::clone(&self.adapters.snapshots),
            self.config.snapshot,
        );
        self.components.lock().snapshots = Some(snapshots.clone());
        let corrupt = snapshots.initialize().await?;
        if !corrupt.is_empty() {
            warn!(nodes = ?corrupt, "data directories need attention");
        }
        *self.corrupt.lock() = corrupt;
        info!("snapshot manager ready");

        Ok(())
    }

    /// Tear everything down in reverse order. Safe before `initialize` and
    /// on repeated calls.
    pub async fn destroy(&self) {
        let _guard = self.lifecycle.lock().await;
        if self.phase() == Phase::Destroyed {
            return;
        }
        info!("shutting down supervisor");
        self.teardown().await;
        *self.phase.lock() = Phase::Destroyed;
        info!("supervisor stopped");
    }

    async fn teardown(&self) {
        let components = std::mem::take(&mut *self.components.lock());

        if let Some(snapshots) = components.snapshots {
            snapshots.destroy().await;
        }
        if let Some(monitor) = components.monitor {
            monitor.destroy().await;
        }
        if let Some(workers) = components.workers {
            workers.destroy().await;
        }
        if let Some(nodes) = components.nodes {
            nodes.destroy().await;
        }
        if let Some(store) = components.store {
            drop(store);
            info!("store closed");
        }
    }

    // =========================================================================
    // COMPONENT ACCESS
    // =========================================================================

    fn component<T: Clone>(&self, pick: impl FnOnce(&Components) -> Option<&T>) -> SupervisorResult<T> {
        if self.phase() != Phase::Running {
            return Err(SupervisorError::Unavailable("supervisor is not running".into()));
        }
        pick(&self.components.lock())
            .cloned()
            .ok_or_else(|| SupervisorError::Unavailable("supervisor is not running".into()))
    }

    pub fn nodes(&self) -> SupervisorResult<NodeManager> {
        self.component(|c| c.nodes.as_ref())
    }

    pub fn workers(&self) -> SupervisorResult<WorkerManager> {
        self.component(|c| c.workers.as_ref())
    }

    pub fn monitor(&self) -> SupervisorResult<StatusMonitor> {
        self.component(|c| c.monitor.as_ref())
    }

    pub fn snapshots(&self) -> SupervisorResult<SnapshotManager> {
        self.component(|c| c.snapshots.as_ref())
    }

    pub fn store(&self) -> SupervisorResult<Arc<LocalStore>> {
        self.component(|c| c.store.as_ref())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use async_trait::async_trait;
    use shared_rpc::{NodeHealth, RpcError, TransactionRequest, ValidatorInfo};
    use shared_types::{ErrorKind, NewNode, Network, ProcessState};
    use std::path::Path;
    use std::time::Duration;
    use wf_05_snapshot_manager::FileSource;

    pub(crate) struct OfflineRpc;

    #[async_trait]
    impl NodeRpc for OfflineRpc {
        async fn node_health(&self, _endpoint: &str) -> Result<NodeHealth, RpcError> {
            Err(RpcError::Connection("offline".into()))
        }

        async fn validator_info(
            &self,
            _endpoint: &str,
            _public_key: &str,
        ) -> Result<ValidatorInfo, RpcError> {
            Err(RpcError::Connection("offline".into()))
        }

        async fn send_transaction(
            &self,
            _endpoint: &str,
            _request: &TransactionRequest,
        ) -> Result<String, RpcError> {
            Err(RpcError::Connection("offline".into()))
        }
    }

    pub(crate) fn test_config(dir: &Path, backend: StoreBackend) -> SupervisorConfig {
        let mut config = SupervisorConfig {
            data_dir: dir.to_path_buf(),
            store: StoreConfig {
                backend,
                path: Some(dir.join("supervisor.db")),
            },
            ..SupervisorConfig::default()
        };
        config.monitor.poll_interval = Duration::from_millis(50);
        config.monitor.shutdown_grace = Duration::from_millis(200);
        config.process.stop_grace = Duration::from_millis(500);
        config
    }

    pub(crate) fn test_adapters() -> Adapters {
        Adapters {
            rpc: Arc::new(OfflineRpc),
            commands: Arc::new(WaterfallCommands::new("/nonexistent/coordinator", "/nonexistent/gwat")),
            snapshots: Arc::new(FileSource),
        }
    }

    #[tokio::test]
    async fn test_destroy_without_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            Orchestrator::with_adapters(test_config(dir.path(), StoreBackend::Memory), test_adapters());

        orchestrator.destroy().await;
        orchestrator.destroy().await;

        assert_eq!(orchestrator.phase(), Phase::Destroyed);
        let err = orchestrator.initialize().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_initialize_and_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            Orchestrator::with_adapters(test_config(dir.path(), StoreBackend::File), test_adapters());

        assert_eq!(orchestrator.nodes().unwrap_err().kind(), ErrorKind::Unavailable);
        orchestrator.initialize().await.unwrap();
        orchestrator.initialize().await.unwrap();
        assert_eq!(orchestrator.phase(), Phase::Running);
        assert!(orchestrator.monitor().unwrap().is_running());
        assert!(dir.path().join("supervisor.db").exists());

        orchestrator.destroy().await;
        assert_eq!(orchestrator.phase(), Phase::Destroyed);
        assert_eq!(orchestrator.workers().unwrap_err().kind(), ErrorKind::Unavailable);

        // The store lock is released with the store.
        LocalStore::open_file(&dir.path().join("supervisor.db")).unwrap();
    }

    #[tokio::test]
    async fn test_second_supervisor_on_same_store_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let first =
            Orchestrator::with_adapters(test_config(dir.path(), StoreBackend::File), test_adapters());
        first.initialize().await.unwrap();

        let second =
            Orchestrator::with_adapters(test_config(dir.path(), StoreBackend::File), test_adapters());
        let err = second.initialize().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(second.phase(), Phase::Destroyed);

        first.destroy().await;
    }

    #[tokio::test]
    async fn test_failing_stage_tears_down_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path(), StoreBackend::File);
        config.monitor.poll_interval = Duration::ZERO;
        let orchestrator = Orchestrator::with_adapters(config, test_adapters());

        let err = orchestrator.initialize().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(orchestrator.phase(), Phase::Destroyed);
        assert!(orchestrator.store().is_err());

        LocalStore::open_file(&dir.path().join("supervisor.db")).unwrap();
        orchestrator.destroy().await;
    }

    #[tokio::test]
    async fn test_startup_reconciles_stale_running_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("supervisor.db");
        {
            let store = LocalStore::open_file(&store_path).unwrap();
            let node = store
                .insert_node(NewNode {
                    name: "n1".into(),
                    network: Network::Testnet8,
                    data_path: dir.path().join("n1"),
                    ports: None,
                    rpc_endpoint: None,
                })
                .unwrap();
            store.set_process_state(node.id, ProcessState::Running).unwrap();
        }

        let orchestrator =
            Orchestrator::with_adapters(test_config(dir.path(), StoreBackend::File), test_adapters());
        orchestrator.initialize().await.unwrap();

        let nodes = orchestrator.nodes().unwrap();
        let listed = nodes.list_nodes(&wf_01_local_store::NodeFilter::all()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].process_state, ProcessState::Stopped);
        orchestrator.destroy().await;
    }
}
