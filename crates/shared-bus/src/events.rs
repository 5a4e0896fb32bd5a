//! # Supervisor Events
//!
//! Every event that flows through the bus, and the topic strings they are
//! published under.

use serde::{Deserialize, Serialize};
use shared_types::{
    ActionKind, JobId, NodeId, ProcessState, SnapshotState, StatusSample, WorkerId, WorkerStatus,
};

/// Topic names. These are mirrored verbatim to the presentation layer.
pub mod topics {
    pub const NODE_STATE_CHANGED: &str = "node.stateChanged";
    pub const NODE_FAILED: &str = "node.failed";
    pub const STATUS_UPDATED: &str = "status.updated";
    pub const SNAPSHOT_PROGRESS: &str = "snapshot.progress";
    pub const SNAPSHOT_COMPLETED: &str = "snapshot.completed";
    pub const SNAPSHOT_CORRUPT: &str = "snapshot.corrupt";
    pub const WORKER_STATUS_CHANGED: &str = "worker.statusChanged";
    pub const WORKER_ACTION_SUBMITTED: &str = "worker.actionSubmitted";
    pub const WORKER_ACTION_TIMED_OUT: &str = "worker.actionTimedOut";
    pub const WORKER_REMOVED: &str = "worker.removed";
}

/// All events that can be published to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    // =========================================================================
    // NODE MANAGER
    // =========================================================================
    /// A node moved between process states.
    NodeStateChanged {
        node_id: NodeId,
        from: ProcessState,
        to: ProcessState,
    },

    /// A node's process failed to spawn or exited unexpectedly.
    NodeFailed {
        node_id: NodeId,
        /// Which process of the group failed (`coordinator` / `validator`).
        role: String,
        exit_code: Option<i32>,
        detail: String,
    },

    // =========================================================================
    // STATUS MONITOR
    // =========================================================================
    /// A health reading for a node or worker.
    StatusUpdated(StatusSample),

    // =========================================================================
    // SNAPSHOT MANAGER
    // =========================================================================
    SnapshotProgress {
        job_id: JobId,
        node_id: NodeId,
        state: SnapshotState,
        progress_bytes: u64,
        total_bytes: Option<u64>,
    },

    /// A job reached `done`, `failed` or `cancelled`.
    SnapshotCompleted {
        job_id: JobId,
        node_id: NodeId,
        state: SnapshotState,
        error: Option<String>,
    },

    /// A data directory was found mid-swap after a restart.
    SnapshotCorrupt { node_id: NodeId, data_path: String },

    // =========================================================================
    // WORKER MANAGER
    // =========================================================================
    WorkerStatusChanged {
        worker_id: WorkerId,
        from: WorkerStatus,
        to: WorkerStatus,
    },

    WorkerActionSubmitted {
        worker_id: WorkerId,
        action: ActionKind,
        tx_hash: String,
    },

    /// A submitted action was not reflected on chain within the deadline.
    WorkerActionTimedOut {
        worker_id: WorkerId,
        action: ActionKind,
        tx_hash: String,
        waited_secs: u64,
    },

    WorkerRemoved { worker_id: WorkerId, forced: bool },
}

impl SupervisorEvent {
    /// Topic this event is published under.
    #[must_use]
    pub fn topic(&self) -> &'static str {
        match self {
            SupervisorEvent::NodeStateChanged { .. } => topics::NODE_STATE_CHANGED,
            SupervisorEvent::NodeFailed { .. } => topics::NODE_FAILED,
            SupervisorEvent::StatusUpdated(_) => topics::STATUS_UPDATED,
            SupervisorEvent::SnapshotProgress { .. } => topics::SNAPSHOT_PROGRESS,
            SupervisorEvent::SnapshotCompleted { .. } => topics::SNAPSHOT_COMPLETED,
            SupervisorEvent::SnapshotCorrupt { .. } => topics::SNAPSHOT_CORRUPT,
            SupervisorEvent::WorkerStatusChanged { .. } => topics::WORKER_STATUS_CHANGED,
            SupervisorEvent::WorkerActionSubmitted { .. } => topics::WORKER_ACTION_SUBMITTED,
            SupervisorEvent::WorkerActionTimedOut { .. } => topics::WORKER_ACTION_TIMED_OUT,
            SupervisorEvent::WorkerRemoved { .. } => topics::WORKER_REMOVED,
        }
    }

    /// Component that publishes this event.
    #[must_use]
    pub fn source(&self) -> &'static str {
        match self {
            SupervisorEvent::NodeStateChanged { .. } | SupervisorEvent::NodeFailed { .. } => {
                "node-manager"
            }
            SupervisorEvent::StatusUpdated(_) => "status-monitor",
            SupervisorEvent::SnapshotProgress { .. }
            | SupervisorEvent::SnapshotCompleted { .. }
            | SupervisorEvent::SnapshotCorrupt { .. } => "snapshot-manager",
            SupervisorEvent::WorkerStatusChanged { .. }
            | SupervisorEvent::WorkerActionSubmitted { .. }
            | SupervisorEvent::WorkerActionTimedOut { .. }
            | SupervisorEvent::WorkerRemoved { .. } => "worker-manager",
        }
    }

    /// Shape pushed to the presentation layer.
    #[must_use]
    pub fn to_wire(&self) -> WireEvent {
        WireEvent {
            event: self.topic().to_string(),
            payload: serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// An event as mirrored outward: `{"event": topic, "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub event: String,
    pub payload: serde_json::Value,
}

/// Filter for subscriptions.
///
/// An empty topic list matches everything. A topic ending in `.*` matches
/// every topic under that prefix (`snapshot.*`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub topics: Vec<String>,
}

impl EventFilter {
    /// Match all events.
    #[must_use]
    pub fn all() -> Self {
        Self { topics: Vec::new() }
    }

    /// Match only the given topics.
    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    /// Check whether an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &SupervisorEvent) -> bool {
        self.matches_topic(event.topic())
    }

    #[must_use]
    pub fn matches_topic(&self, topic: &str) -> bool {
        if self.topics.is_empty() {
            return true;
        }
        self.topics.iter().any(|t| match t.strip_suffix(".*") {
            Some(prefix) => topic
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.')),
            None => t == topic,
        })
    }
}
