//! # Node Manager Service
//!
//! Owns the process group of every node. Calls for one node are serialized
//! through that node's slot lock; different nodes never contend.
//!
//! A group is the coordinator followed by the validator. It becomes
//! `Running` only after both survived the startup grace period. From then
//! on a watcher task turns any unexpected exit into `Failed` and tears down
//! the sibling. Failed nodes are never restarted automatically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shared_bus::{EventPublisher, SupervisorEvent};
use shared_types::{
    DataLayout, NewNode, Node, NodeId, NodeUpdate, ProcessState, SupervisorError,
    SupervisorResult, WorkerId,
};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use wf_01_local_store::{LocalStore, NodeFilter};

use crate::adapters::{ExitInfo, ProcessHandle};
use crate::domain::{can_transition, ProcessRole};
use crate::ports::CommandBuilder;

/// Node manager timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeManagerConfig {
    /// How long both processes must stay up before the node is `Running`.
    pub startup_grace: Duration,
    /// How long a process gets to exit after SIGTERM before it is killed.
    pub stop_grace: Duration,
}

impl Default for NodeManagerConfig {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(2),
            stop_grace: Duration::from_secs(10),
        }
    }
}

struct ProcessGroup {
    /// In start order.
    processes: Vec<ProcessHandle>,
    watcher: JoinHandle<()>,
}

#[derive(Default)]
struct NodeSlot {
    group: Option<ProcessGroup>,
    /// Bumped on every successful start so a stale watcher can tell.
    generation: u64,
}

struct Inner {
    store: Arc<LocalStore>,
    bus: Arc<dyn EventPublisher>,
    commands: Arc<dyn CommandBuilder>,
    config: NodeManagerConfig,
    slots: Mutex<HashMap<NodeId, Arc<AsyncMutex<NodeSlot>>>>,
    shut_down: AtomicBool,
}

/// Lifecycle of coordinator/validator processes, one group per node.
#[derive(Clone)]
pub struct NodeManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeManager").finish_non_exhaustive()
    }
}

impl NodeManager {
    pub fn new(
        store: Arc<LocalStore>,
        bus: Arc<dyn EventPublisher>,
        commands: Arc<dyn CommandBuilder>,
        config: NodeManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                commands,
                config,
                slots: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    fn slot(&self, id: NodeId) -> Arc<AsyncMutex<NodeSlot>> {
        self.inner.slots.lock().entry(id).or_default().clone()
    }

    fn ensure_open(&self) -> SupervisorResult<()> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(SupervisorError::Unavailable(
                "node manager is shut down".to_string(),
            ));
        }
        Ok(())
    }

    /// Persist a legal state change and announce it.
    fn transition(&self, id: NodeId, to: ProcessState) -> SupervisorResult<ProcessState> {
        let (_, from) = self.inner.store.modify_node(id, |node, _| {
            let from = node.process_state;
            if from != to && !can_transition(from, to) {
                return Err(SupervisorError::Precondition(format!(
                    "node {id} cannot go from {from} to {to}"
                )));
            }
            node.process_state = to;
            Ok(from)
        })?;
        if from != to {
            self.publish_state(id, from, to);
        }
        Ok(from)
    }

    /// Overwrite a state that no live process backs.
    fn reset_state(&self, id: NodeId, to: ProcessState) -> SupervisorResult<()> {
        let from = self.inner.store.set_process_state(id, to)?;
        if from != to {
            self.publish_state(id, from, to);
        }
        Ok(())
    }

    fn publish_state(&self, node_id: NodeId, from: ProcessState, to: ProcessState) {
        info!(node_id = %node_id, %from, %to, "node state changed");
        self.inner
            .bus
            .publish(SupervisorEvent::NodeStateChanged { node_id, from, to });
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Reconcile persisted states after a restart: no process survives the
    /// supervisor, so anything active is `Stopped` now.
    pub async fn initialize(&self) -> SupervisorResult<usize> {
        let stale = self.inner.store.list_nodes(&NodeFilter::all().process_state(&[
            ProcessState::Starting,
            ProcessState::Running,
            ProcessState::Stopping,
        ]))?;

        for node in &stale {
            self.reset_state(node.id, ProcessState::Stopped)?;
        }
        info!(reconciled = stale.len(), "node manager initialized");
        Ok(stale.len())
    }

    /// Stop every running group. Safe to call more than once.
    pub async fn destroy(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let slots: Vec<(NodeId, Arc<AsyncMutex<NodeSlot>>)> = self
            .inner
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();

        for (id, slot) in slots {
            let mut slot = slot.lock().await;
            if slot.group.is_none() {
                continue;
            }
            if let Err(err) = self.stop_locked(id, &mut slot).await {
                error!(node_id = %id, error = %err, "failed to stop node during shutdown");
            }
        }
        info!("node manager destroyed");
    }

    /// Start a node. A no-op returning the current state when it is
    /// already starting or running.
    pub async fn start(&self, id: NodeId) -> SupervisorResult<ProcessState> {
        self.ensure_open()?;
        let slot = self.slot(id);
        let mut slot = slot.lock().await;
        self.start_locked(id, &mut slot).await
    }

    /// Stop a node. A no-op when it is already stopped or failed.
    pub async fn stop(&self, id: NodeId) -> SupervisorResult<ProcessState> {
        let slot = self.slot(id);
        let mut slot = slot.lock().await;
        self.stop_locked(id, &mut slot).await
    }

    /// Stop then start, without releasing the node lock in between.
    pub async fn restart(&self, id: NodeId) -> SupervisorResult<ProcessState> {
        self.ensure_open()?;
        let slot = self.slot(id);
        let mut slot = slot.lock().await;
        self.stop_locked(id, &mut slot).await?;
        self.start_locked(id, &mut slot).await
    }

    pub fn get_state(&self, id: NodeId) -> SupervisorResult<ProcessState> {
        Ok(self.inner.store.get_node(id)?.process_state)
    }

    async fn start_locked(&self, id: NodeId, slot: &mut NodeSlot) -> SupervisorResult<ProcessState> {
        let current = self.inner.store.get_node(id)?;
        if current.process_state.is_active() && slot.group.is_some() {
            debug!(node_id = %id, state = %current.process_state, "start ignored");
            return Ok(current.process_state);
        }

        // Claimed under the row lock so a snapshot job cannot lease the
        // data directory in between. No group exists here, so an active
        // record is stale and may be restarted too.
        let (node, previous) = self.inner.store.modify_node(id, |node, lease| {
            if let Some(job) = lease {
                return Err(SupervisorError::Conflict(format!(
                    "snapshot job {job} owns the data directory of node {id}"
                )));
            }
            if node.process_state == ProcessState::Stopping {
                return Err(SupervisorError::Conflict(format!("node {id} is stopping")));
            }
            Ok(std::mem::replace(
                &mut node.process_state,
                ProcessState::Starting,
            ))
        })?;
        if previous != ProcessState::Starting {
            self.publish_state(id, previous, ProcessState::Starting);
        }

        let mut processes: Vec<ProcessHandle> = Vec::with_capacity(2);
        for role in ProcessRole::START_ORDER {
            match self.spawn_role(&node, role).await {
                Ok(handle) => processes.push(handle),
                Err(message) => {
                    return Err(self
                        .fail_start(id, processes, role, None, message)
                        .await);
                }
            }
        }

        let watches = exit_watches(&processes);
        if let Ok(Some((role, exit))) =
            tokio::time::timeout(self.inner.config.startup_grace, first_exit(watches)).await
        {
            return Err(self
                .fail_start(id, processes, role, exit.code, exit.detail)
                .await);
        }

        slot.generation += 1;
        let watcher = self.spawn_watcher(id, slot.generation, exit_watches(&processes));
        slot.group = Some(ProcessGroup { processes, watcher });
        self.transition(id, ProcessState::Running)?;
        Ok(ProcessState::Running)
    }

    async fn stop_locked(&self, id: NodeId, slot: &mut NodeSlot) -> SupervisorResult<ProcessState> {
        let node = self.inner.store.get_node(id)?;
        let Some(group) = slot.group.take() else {
            if node.process_state.is_idle() {
                debug!(node_id = %id, state = %node.process_state, "stop ignored");
                return Ok(node.process_state);
            }
            // A record claiming activity without processes behind it.
            self.reset_state(id, ProcessState::Stopped)?;
            return Ok(ProcessState::Stopped);
        };

        group.watcher.abort();
        self.transition(id, ProcessState::Stopping)?;
        self.terminate_all(group.processes).await;
        self.transition(id, ProcessState::Stopped)?;
        Ok(ProcessState::Stopped)
    }

    async fn spawn_role(&self, node: &Node, role: ProcessRole) -> Result<ProcessHandle, String> {
        let spec = self
            .inner
            .commands
            .build(node, role)
            .map_err(|e| e.to_string())?;
        ProcessHandle::spawn(&spec).await.map_err(|e| e.to_string())
    }

    /// Reverse start order.
    async fn terminate_all(&self, processes: Vec<ProcessHandle>) {
        for process in processes.into_iter().rev() {
            process.terminate(self.inner.config.stop_grace).await;
        }
    }

    /// Tear down what was started, mark the node failed and announce it.
    async fn fail_start(
        &self,
        id: NodeId,
        started: Vec<ProcessHandle>,
        role: ProcessRole,
        exit_code: Option<i32>,
        detail: String,
    ) -> SupervisorError {
        warn!(node_id = %id, %role, %detail, "node failed to start");
        self.terminate_all(started).await;
        self.mark_failed(id, role, exit_code, &detail);
        SupervisorError::Process {
            node_id: id.to_string(),
            message: format!("{role}: {detail}"),
        }
    }

    fn mark_failed(&self, node_id: NodeId, role: ProcessRole, exit_code: Option<i32>, detail: &str) {
        if let Err(err) = self.transition(node_id, ProcessState::Failed) {
            error!(node_id = %node_id, error = %err, "cannot record failed state");
        }
        self.inner.bus.publish(SupervisorEvent::NodeFailed {
            node_id,
            role: role.to_string(),
            exit_code,
            detail: detail.to_string(),
        });
    }

    fn spawn_watcher(
        &self,
        id: NodeId,
        generation: u64,
        watches: Vec<(ProcessRole, watch::Receiver<Option<ExitInfo>>)>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Some((role, exit)) = first_exit(watches).await {
                manager.on_unexpected_exit(id, generation, role, exit).await;
            }
        })
    }

    async fn on_unexpected_exit(&self, id: NodeId, generation: u64, role: ProcessRole, exit: ExitInfo) {
        let slot = self.slot(id);
        let mut slot = slot.lock().await;
        if slot.generation != generation {
            return;
        }
        let Some(group) = slot.group.take() else {
            return;
        };

        warn!(node_id = %id, %role, code = ?exit.code, detail = %exit.detail, "process exited unexpectedly");
        // `group.watcher` is this task; dropping the handle detaches it.
        self.terminate_all(group.processes).await;
        self.mark_failed(id, role, exit.code, &exit.detail);
    }

    // =========================================================================
    // RECORDS
    // =========================================================================

    /// Create a node record and its directory skeleton.
    pub async fn create_node(&self, new: NewNode) -> SupervisorResult<Node> {
        self.ensure_open()?;
        let node = self.inner.store.insert_node(new)?;

        let layout = DataLayout::new(&node.data_path);
        for dir in layout.skeleton() {
            if let Err(err) = tokio::fs::create_dir_all(&dir).await {
                warn!(node_id = %node.id, path = %dir.display(), error = %err, "cannot create node directory");
                if let Err(cleanup) = self.inner.store.delete_node(node.id) {
                    error!(node_id = %node.id, error = %cleanup, "cannot roll back node record");
                }
                return Err(SupervisorError::Storage(format!(
                    "cannot create {}: {err}",
                    dir.display()
                )));
            }
        }
        Ok(node)
    }

    /// Delete a stopped or failed node and, atomically, its workers. The
    /// data directory on disk is left alone.
    pub async fn remove_node(&self, id: NodeId) -> SupervisorResult<Vec<WorkerId>> {
        let slot = self.slot(id);
        let guard = slot.lock().await;
        let node = self.inner.store.get_node(id)?;
        if guard.group.is_some() || !node.process_state.is_idle() {
            return Err(SupervisorError::Precondition(format!(
                "node {id} is {}, stop it first",
                node.process_state
            )));
        }

        let removed = self.inner.store.delete_node(id)?;
        for worker_id in &removed {
            self.inner.bus.publish(SupervisorEvent::WorkerRemoved {
                worker_id: *worker_id,
                forced: true,
            });
        }
        drop(guard);
        self.inner.slots.lock().remove(&id);
        Ok(removed)
    }

    /// Rename, re-port or re-point a node. Takes effect on next start.
    pub async fn update_node(&self, id: NodeId, update: NodeUpdate) -> SupervisorResult<Node> {
        let slot = self.slot(id);
        let _guard = slot.lock().await;
        self.inner.store.update_node(id, update)
    }

    pub fn get_node(&self, id: NodeId) -> SupervisorResult<Node> {
        self.inner.store.get_node(id)
    }

    pub fn list_nodes(&self, filter: &NodeFilter) -> SupervisorResult<Vec<Node>> {
        self.inner.store.list_nodes(filter)
    }

    /// Last `lines` of a process's output: the live tail while running,
    /// otherwise the end of its log file.
    pub async fn logs(&self, id: NodeId, role: ProcessRole, lines: usize) -> SupervisorResult<Vec<String>> {
        let node = self.inner.store.get_node(id)?;
        {
            let slot = self.slot(id);
            let slot = slot.lock().await;
            if let Some(process) = slot
                .group
                .as_ref()
                .and_then(|g| g.processes.iter().find(|p| p.role() == role))
            {
                return Ok(process.tail(lines));
            }
        }

        let path = DataLayout::new(&node.data_path).process_log(role.as_str());
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let all: Vec<&str> = content.lines().collect();
                let skip = all.len().saturating_sub(lines);
                Ok(all[skip..].iter().map(|l| l.to_string()).collect())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

fn exit_watches(processes: &[ProcessHandle]) -> Vec<(ProcessRole, watch::Receiver<Option<ExitInfo>>)> {
    processes.iter().map(|p| (p.role(), p.exit_watch())).collect()
}

/// The first process of the group to exit.
async fn first_exit(
    watches: Vec<(ProcessRole, watch::Receiver<Option<ExitInfo>>)>,
) -> Option<(ProcessRole, ExitInfo)> {
    let mut set = JoinSet::new();
    for (role, mut rx) in watches {
        set.spawn(async move {
            let exit = rx.wait_for(Option::is_some).await.ok().and_then(|e| e.clone());
            (role, exit)
        });
    }
    while let Some(joined) = set.join_next().await {
        if let Ok((role, Some(exit))) = joined {
            return Some((role, exit));
        }
    }
    None
}
