//! Fixtures shared by the integration flows: scripted child processes, an
//! in-memory chain behind the RPC port, a snapshot source the test feeds by
//! hand and a harness around a running [`Orchestrator`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use node_supervisor::{Adapters, Orchestrator, StoreBackend, SupervisorConfig};
use parking_lot::Mutex;
use shared_rpc::{NodeHealth, NodeRpc, RpcError, TransactionRequest, ValidatorInfo};
use shared_types::{
    normalize_hex, DataLayout, KeyMaterial, Network, NewNode, Node, SupervisorResult,
};
use tokio::sync::mpsc;
use wf_02_node_manager::{CommandBuilder, LaunchSpec, ProcessRole};
use wf_05_snapshot_manager::{FileSource, SnapshotError, SnapshotReader, SnapshotSource};

pub const DEPOSIT_ADDRESS: &str = "0x5555555555555555555555555555555555555555";

// =============================================================================
// PROCESSES
// =============================================================================

/// Runs each role as `sh -c <script>`.
pub struct ScriptCommands {
    coordinator: String,
    validator: String,
    builds: AtomicUsize,
}

impl ScriptCommands {
    pub fn new(coordinator: &str, validator: &str) -> Self {
        Self {
            coordinator: coordinator.to_string(),
            validator: validator.to_string(),
            builds: AtomicUsize::new(0),
        }
    }

    /// Both roles run until stopped.
    pub fn long_running() -> Self {
        Self::new("echo coordinator up; exec sleep 30", "echo gwat up; exec sleep 30")
    }

    /// Processes launched so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl CommandBuilder for ScriptCommands {
    fn build(&self, node: &Node, role: ProcessRole) -> SupervisorResult<LaunchSpec> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let script = match role {
            ProcessRole::Coordinator => &self.coordinator,
            ProcessRole::Validator => &self.validator,
        };
        let layout = DataLayout::new(&node.data_path);
        Ok(LaunchSpec {
            role,
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.clone()],
            env: Vec::new(),
            working_dir: layout.root().to_path_buf(),
            log_path: layout.process_log(role.as_str()),
        })
    }
}

// =============================================================================
// CHAIN
// =============================================================================

/// A healthy node whose validator registry the test edits.
#[derive(Default)]
pub struct ChainRpc {
    validators: Mutex<HashMap<String, ValidatorInfo>>,
    sent: Mutex<Vec<TransactionRequest>>,
}

impl ChainRpc {
    pub fn set_validator(&self, public_key: &str, info: ValidatorInfo) {
        self.validators.lock().insert(normalize_hex(public_key), info);
    }

    pub fn sent(&self) -> Vec<TransactionRequest> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl NodeRpc for ChainRpc {
    async fn node_health(&self, _endpoint: &str) -> Result<NodeHealth, RpcError> {
        Ok(NodeHealth {
            sync_height: 1_000,
            peer_count: 4,
            syncing: false,
        })
    }

    async fn validator_info(&self, _endpoint: &str, public_key: &str) -> Result<ValidatorInfo, RpcError> {
        Ok(self
            .validators
            .lock()
            .get(&normalize_hex(public_key))
            .copied()
            .unwrap_or(ValidatorInfo {
                status: None,
                index: None,
            }))
    }

    async fn send_transaction(
        &self,
        _endpoint: &str,
        request: &TransactionRequest,
    ) -> Result<String, RpcError> {
        let mut sent = self.sent.lock();
        sent.push(request.clone());
        Ok(format!("0x{:064x}", sent.len()))
    }
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// A source whose single transfer delivers whatever the test sends.
pub struct GatedSource {
    chunks: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl GatedSource {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedSender<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                chunks: Mutex::new(Some(rx)),
            }),
            tx,
        )
    }
}

struct GatedReader {
    chunks: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl SnapshotReader for GatedReader {
    fn total_bytes(&self) -> Option<u64> {
        None
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, SnapshotError> {
        Ok(self.chunks.recv().await)
    }
}

#[async_trait]
impl SnapshotSource for GatedSource {
    async fn open(&self, _url: &str) -> Result<Box<dyn SnapshotReader>, SnapshotError> {
        let chunks = self
            .chunks
            .lock()
            .take()
            .ok_or_else(|| SnapshotError::Download("transfer already opened".into()))?;
        Ok(Box::new(GatedReader { chunks }))
    }
}

/// Write a plain tar archive with `files` (relative path, contents).
pub fn write_archive(path: &Path, files: &[(&str, &str)]) {
    let file = std::fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(file);
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, contents.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap();
}

// =============================================================================
// HARNESS
// =============================================================================

pub fn key_material(seed: u8) -> KeyMaterial {
    KeyMaterial {
        public_key: format!("0x{}", hex_byte(seed).repeat(48)),
        withdrawal_address: format!("0x{}", hex_byte(seed.wrapping_add(1)).repeat(20)),
        signature: format!("0x{}", hex_byte(seed.wrapping_add(2)).repeat(96)),
        keystore: None,
        deposit_data: None,
    }
}

fn hex_byte(b: u8) -> String {
    format!("{b:02x}")
}

/// Settings for a quiet supervisor: memory store, no background polling
/// (tests drive `poll_once`), short process grace periods.
pub fn test_config(dir: &Path) -> SupervisorConfig {
    let mut config = SupervisorConfig {
        data_dir: dir.to_path_buf(),
        ..SupervisorConfig::default()
    };
    config.store.backend = StoreBackend::Memory;
    config.store.path = Some(dir.join("supervisor.db"));
    config.monitor.poll_interval = Duration::from_secs(3600);
    config.monitor.shutdown_grace = Duration::from_millis(200);
    config.process.startup_grace = Duration::from_millis(200);
    config.process.stop_grace = Duration::from_secs(2);
    config.snapshot.progress_interval = Duration::ZERO;
    config.snapshot.shutdown_grace = Duration::from_secs(2);
    for network in Network::ALL {
        config
            .workers
            .deposit_addresses
            .insert(network, DEPOSIT_ADDRESS.to_string());
    }
    config
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub orchestrator: Arc<Orchestrator>,
    pub rpc: Arc<ChainRpc>,
    pub commands: Arc<ScriptCommands>,
}

impl Harness {
    /// A harness that is built but not yet initialized.
    pub fn build(
        dir: tempfile::TempDir,
        config: SupervisorConfig,
        commands: ScriptCommands,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> Self {
        let rpc = Arc::new(ChainRpc::default());
        let commands = Arc::new(commands);
        let adapters = Adapters {
            rpc: rpc.clone(),
            commands: commands.clone(),
            snapshots,
        };
        Self {
            orchestrator: Arc::new(Orchestrator::with_adapters(config, adapters)),
            dir,
            rpc,
            commands,
        }
    }

    /// Defaults with `tweak` applied, initialized.
    pub async fn start_with(
        commands: ScriptCommands,
        snapshots: Arc<dyn SnapshotSource>,
        tweak: impl FnOnce(&mut SupervisorConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        tweak(&mut config);
        let harness = Self::build(dir, config, commands, snapshots);
        harness.orchestrator.initialize().await.unwrap();
        harness
    }

    pub async fn start() -> Self {
        Self::start_with(ScriptCommands::long_running(), Arc::new(FileSource), |_| {}).await
    }

    pub async fn create_node(&self, name: &str, network: Network) -> Node {
        self.orchestrator
            .nodes()
            .unwrap()
            .create_node(NewNode {
                name: name.to_string(),
                network,
                data_path: self.dir.path().join(name),
                ports: None,
                rpc_endpoint: None,
            })
            .await
            .unwrap()
    }

    pub async fn shutdown(&self) {
        self.orchestrator.destroy().await;
    }
}

/// Wait up to five seconds for `check` to hold.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
