//! # Core Domain Entities
//!
//! Records owned by the supervisor.
//!
//! ## Clusters
//!
//! - **Persisted**: `Node`, `Worker` (owned by the local store)
//! - **Ephemeral**: `StatusSample` (health monitor), `SnapshotJob` (snapshot manager)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::network::Network;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Stable identifier of a configured node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

/// Stable identifier of a worker (validator identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

/// Identifier of a snapshot job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// NODE
// =============================================================================

/// Lifecycle of a node's process group.
///
/// ```text
/// Stopped → Starting → Running → Stopping → Stopped
///              │          │
///              └──────────┴──→ Failed ──start──→ Starting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ProcessState {
    /// `Starting` or `Running`.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }

    /// No process exists for the node.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listening ports of one node's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePorts {
    pub coordinator_p2p_tcp: u16,
    pub coordinator_p2p_udp: u16,
    pub coordinator_http_api: u16,
    pub coordinator_http_validator_api: u16,
    pub validator_p2p: u16,
    pub validator_http_api: u16,
    pub validator_ws_api: u16,
}

impl Default for NodePorts {
    fn default() -> Self {
        Self {
            coordinator_p2p_tcp: 13000,
            coordinator_p2p_udp: 12000,
            coordinator_http_api: 3500,
            coordinator_http_validator_api: 4000,
            validator_p2p: 30303,
            validator_http_api: 8545,
            validator_ws_api: 8546,
        }
    }
}

impl NodePorts {
    /// Default local JSON-RPC endpoint for these ports.
    #[must_use]
    pub fn default_rpc_endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.validator_http_api)
    }
}

/// A configured coordinator instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Immutable after creation.
    pub network: Network,
    /// Unique per node.
    pub data_path: PathBuf,
    pub rpc_endpoint: String,
    pub ports: NodePorts,
    pub process_state: ProcessState,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNode {
    pub name: String,
    pub network: Network,
    pub data_path: PathBuf,
    #[serde(default)]
    pub ports: Option<NodePorts>,
    #[serde(default)]
    pub rpc_endpoint: Option<String>,
}

/// Partial update of a node record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub rpc_endpoint: Option<String>,
    #[serde(default)]
    pub ports: Option<NodePorts>,
    /// Always rejected when different from the current network.
    #[serde(default)]
    pub network: Option<Network>,
}

// =============================================================================
// WORKER
// =============================================================================

/// Validator lifecycle. Transitions only move forward; `Removed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Pending,
    Activating,
    Active,
    Deactivating,
    Exited,
    Removed,
}

impl WorkerStatus {
    fn rank(&self) -> u8 {
        match self {
            WorkerStatus::Pending => 0,
            WorkerStatus::Activating => 1,
            WorkerStatus::Active => 2,
            WorkerStatus::Deactivating => 3,
            WorkerStatus::Exited => 4,
            WorkerStatus::Removed => 5,
        }
    }

    /// Whether the chain may move a worker from `self` to `next`.
    ///
    /// `Removed` is never reached through observation; it is a local action.
    #[must_use]
    pub fn can_advance_to(&self, next: WorkerStatus) -> bool {
        *self != WorkerStatus::Removed
            && next != WorkerStatus::Removed
            && next.rank() > self.rank()
    }

    /// Statuses that may be deleted without `force`.
    #[must_use]
    pub fn is_removable(&self) -> bool {
        matches!(self, WorkerStatus::Pending | WorkerStatus::Exited)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Pending => "pending",
            WorkerStatus::Activating => "activating",
            WorkerStatus::Active => "active",
            WorkerStatus::Deactivating => "deactivating",
            WorkerStatus::Exited => "exited",
            WorkerStatus::Removed => "removed",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-chain action kinds a worker can submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Activate,
    Deactivate,
    Withdraw,
}

impl ActionKind {
    /// Status the worker is expected to leave once the chain picks the
    /// action up. `None` when the action never changes status.
    #[must_use]
    pub fn awaited_transition(&self) -> Option<WorkerStatus> {
        match self {
            ActionKind::Activate => Some(WorkerStatus::Pending),
            ActionKind::Deactivate => Some(WorkerStatus::Active),
            ActionKind::Withdraw => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Activate => "activate",
            ActionKind::Deactivate => "deactivate",
            ActionKind::Withdraw => "withdraw",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of a submitted deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositData {
    pub tx_hash: String,
    /// Decimal wei amount.
    pub amount_wei: String,
    pub submitted_at: DateTime<Utc>,
}

/// A validator identity attached to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub node_id: NodeId,
    /// Assigned by the chain once the deposit is processed.
    pub validator_index: Option<u64>,
    /// Hex validator public key, no `0x` prefix.
    pub public_key: String,
    /// Hex address, no `0x` prefix.
    pub withdrawal_address: String,
    /// Hex deposit signature, no `0x` prefix.
    pub signature: String,
    pub status: WorkerStatus,
    pub deposit_data: Option<DepositData>,
    pub created_at: DateTime<Utc>,
}

/// Key material supplied when creating a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub public_key: String,
    pub withdrawal_address: String,
    pub signature: String,
    /// Encrypted validator keystore, written to the node's keystore dir.
    #[serde(default)]
    pub keystore: Option<serde_json::Value>,
    #[serde(default)]
    pub deposit_data: Option<DepositData>,
}

/// Strip an optional `0x` prefix and lowercase.
#[must_use]
pub fn normalize_hex(value: &str) -> String {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
        .to_ascii_lowercase()
}

// =============================================================================
// HEALTH
// =============================================================================

/// What a health check targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum TargetId {
    Node(NodeId),
    Worker(WorkerId),
}

/// Kind of health-check target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Node,
    Worker,
}

impl TargetId {
    #[must_use]
    pub fn kind(&self) -> TargetKind {
        match self {
            TargetId::Node(_) => TargetKind::Node,
            TargetId::Worker(_) => TargetKind::Worker,
        }
    }

    /// Store key, e.g. `node:3`.
    #[must_use]
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetId::Node(id) => write!(f, "node:{id}"),
            TargetId::Worker(id) => write!(f, "worker:{id}"),
        }
    }
}

/// Payload of a health reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusDetail {
    Node {
        sync_height: u64,
        peer_count: u32,
        syncing: bool,
    },
    Worker {
        validator_status: Option<WorkerStatus>,
        validator_index: Option<u64>,
    },
    Error {
        message: String,
    },
}

/// One health reading. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSample {
    pub target_id: TargetId,
    pub target_kind: TargetKind,
    pub timestamp: DateTime<Utc>,
    pub healthy: bool,
    /// Failures in a row for this target, zero after a success.
    pub consecutive_failures: u32,
    pub detail: StatusDetail,
}

impl StatusSample {
    pub fn healthy(target_id: TargetId, detail: StatusDetail) -> Self {
        Self {
            target_id,
            target_kind: target_id.kind(),
            timestamp: Utc::now(),
            healthy: true,
            consecutive_failures: 0,
            detail,
        }
    }

    pub fn unhealthy(target_id: TargetId, message: impl Into<String>, failures: u32) -> Self {
        Self {
            target_id,
            target_kind: target_id.kind(),
            timestamp: Utc::now(),
            healthy: false,
            consecutive_failures: failures,
            detail: StatusDetail::Error {
                message: message.into(),
            },
        }
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Snapshot job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotState {
    Queued,
    Downloading,
    Applying,
    Done,
    Failed,
    Cancelled,
}

impl SnapshotState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SnapshotState::Done | SnapshotState::Failed | SnapshotState::Cancelled
        )
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SnapshotState::Queued => "queued",
            SnapshotState::Downloading => "downloading",
            SnapshotState::Applying => "applying",
            SnapshotState::Done => "done",
            SnapshotState::Failed => "failed",
            SnapshotState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A single download-and-apply operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotJob {
    pub id: JobId,
    pub node_id: NodeId,
    pub source_url: String,
    pub state: SnapshotState,
    pub progress_bytes: u64,
    pub total_bytes: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SnapshotJob {
    pub fn queued(node_id: NodeId, source_url: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            node_id,
            source_url: source_url.into(),
            state: SnapshotState::Queued,
            progress_bytes: 0,
            total_bytes: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}
