//! # Control Surface
//!
//! Newline-delimited JSON over a byte stream (stdin/stdout for `serve`).
//!
//! ```text
//! → {"id": 1, "method": "node.start", "params": {"id": 3}}
//! ← {"id": 1, "result": {"id": 3, "process_state": "running"}}
//! ← {"id": 2, "error": {"kind": "unavailable", "message": "..."}}
//! ← {"event": "node.stateChanged", "payload": {...}}
//! ```
//!
//! Requests are handled concurrently; responses carry the request `id` and
//! may arrive out of order. Bus events are pushed as they happen.

use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_bus::{Subscription, WireEvent};
use shared_types::{
    ActionKind, JobId, KeyMaterial, Network, NewNode, NodeId, NodePorts, NodeUpdate,
    SupervisorError, WorkerId,
};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use wf_01_local_store::{NodeFilter, WorkerFilter};
use wf_02_node_manager::{ProcessRole, LOG_TAIL_LINES};
use wf_03_worker_manager::ActionParams;
use wf_05_snapshot_manager::SnapshotRequest;

use crate::orchestrator::Orchestrator;

/// One request line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControlRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// One output line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ControlMessage {
    Result { id: Value, result: Value },
    Error { id: Value, error: ErrorBody },
    Event(WireEvent),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("unknown method `{0}`")]
    UnknownMethod(String),

    #[error("invalid params for {method}: {message}")]
    InvalidParams { method: String, message: String },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl ControlError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::Malformed(_) => "invalid_request",
            ControlError::UnknownMethod(_) => "unknown_method",
            ControlError::InvalidParams { .. } => "invalid_params",
            ControlError::Supervisor(err) => err.kind().code(),
        }
    }

    fn body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

type ControlResult = Result<Value, ControlError>;

fn params<T: DeserializeOwned>(method: &str, raw: Value) -> Result<T, ControlError> {
    let raw = if raw.is_null() { json!({}) } else { raw };
    serde_json::from_value(raw).map_err(|e| ControlError::InvalidParams {
        method: method.to_string(),
        message: e.to_string(),
    })
}

fn to_json<T: Serialize>(value: T) -> ControlResult {
    serde_json::to_value(value).map_err(|e| ControlError::Supervisor(e.into()))
}

// =============================================================================
// PARAMS
// =============================================================================

#[derive(Deserialize)]
struct IdParams<T> {
    id: T,
}

#[derive(Deserialize)]
struct FilterParams {
    #[serde(default)]
    filter: Value,
}

#[derive(Deserialize)]
struct CreateNodeParams {
    name: String,
    network: Network,
    /// Defaults to `<data_dir>/<name>`.
    #[serde(default)]
    data_path: Option<PathBuf>,
    #[serde(default)]
    ports: Option<NodePorts>,
    #[serde(default)]
    rpc_endpoint: Option<String>,
}

#[derive(Deserialize)]
struct UpdateNodeParams {
    id: NodeId,
    #[serde(flatten)]
    update: NodeUpdate,
}

#[derive(Deserialize)]
struct LogsParams {
    id: NodeId,
    #[serde(default = "default_role")]
    role: String,
    #[serde(default = "default_lines")]
    lines: usize,
}

fn default_role() -> String {
    ProcessRole::Coordinator.as_str().to_string()
}

fn default_lines() -> usize {
    LOG_TAIL_LINES
}

#[derive(Deserialize)]
struct CreateWorkerParams {
    node_id: NodeId,
    key_material: KeyMaterial,
}

#[derive(Deserialize)]
struct WorkerActionParams {
    id: WorkerId,
    action: ActionKind,
    #[serde(default)]
    params: ActionParams,
}

#[derive(Deserialize)]
struct RemoveWorkerParams {
    id: WorkerId,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct StartSnapshotParams {
    node_id: NodeId,
    url: String,
    #[serde(default)]
    expected_size: Option<u64>,
    #[serde(default)]
    sha256: Option<String>,
}

#[derive(Deserialize)]
struct JobParams {
    job_id: JobId,
}

#[derive(Deserialize)]
struct ListJobsParams {
    #[serde(default)]
    node_id: Option<NodeId>,
}

// =============================================================================
// SURFACE
// =============================================================================

/// Request router over a running [`Orchestrator`].
#[derive(Clone)]
pub struct ControlSurface {
    orchestrator: Arc<Orchestrator>,
}

impl ControlSurface {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Handle one input line. Blank lines produce nothing.
    pub async fn handle_line(&self, line: &str) -> Option<ControlMessage> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let request: ControlRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => {
                let error = ControlError::Malformed(err.to_string());
                return Some(ControlMessage::Error {
                    id: Value::Null,
                    error: error.body(),
                });
            }
        };

        debug!(method = %request.method, "control request");
        Some(match self.call(&request.method, request.params).await {
            Ok(result) => ControlMessage::Result {
                id: request.id,
                result,
            },
            Err(err) => {
                debug!(method = %request.method, kind = err.kind(), error = %err, "control request failed");
                ControlMessage::Error {
                    id: request.id,
                    error: err.body(),
                }
            }
        })
    }

    /// Route one call by method name.
    pub async fn call(&self, method: &str, raw: Value) -> ControlResult {
        match method.split_once('.') {
            Some(("node", _)) => self.route_node(method, raw).await,
            Some(("worker", _)) => self.route_worker(method, raw).await,
            Some(("snapshot", _)) => self.route_snapshot(method, raw).await,
            _ => Err(ControlError::UnknownMethod(method.to_string())),
        }
    }

    async fn route_node(&self, method: &str, raw: Value) -> ControlResult {
        let nodes = self.orchestrator.nodes()?;
        match method {
            "node.list" => {
                let p: FilterParams = params(method, raw)?;
                to_json(nodes.list_nodes(&NodeFilter::from_json(&p.filter)?)?)
            }
            "node.get" => {
                let p: IdParams<NodeId> = params(method, raw)?;
                to_json(nodes.get_node(p.id)?)
            }
            "node.start" | "node.stop" | "node.restart" => {
                let p: IdParams<NodeId> = params(method, raw)?;
                let state = match method {
                    "node.start" => nodes.start(p.id).await?,
                    "node.stop" => nodes.stop(p.id).await?,
                    _ => nodes.restart(p.id).await?,
                };
                Ok(json!({ "id": p.id, "process_state": state }))
            }
            "node.create" => {
                let p: CreateNodeParams = params(method, raw)?;
                let data_path = match p.data_path {
                    Some(path) => path,
                    None => self.default_data_path(method, &p.name)?,
                };
                to_json(
                    nodes
                        .create_node(NewNode {
                            name: p.name,
                            network: p.network,
                            data_path,
                            ports: p.ports,
                            rpc_endpoint: p.rpc_endpoint,
                        })
                        .await?,
                )
            }
            "node.update" => {
                let p: UpdateNodeParams = params(method, raw)?;
                to_json(nodes.update_node(p.id, p.update).await?)
            }
            "node.remove" => {
                let p: IdParams<NodeId> = params(method, raw)?;
                let removed = nodes.remove_node(p.id).await?;
                Ok(json!({ "id": p.id, "removed_workers": removed }))
            }
            "node.logs" => {
                let p: LogsParams = params(method, raw)?;
                let role: ProcessRole = p.role.parse()?;
                to_json(nodes.logs(p.id, role, p.lines).await?)
            }
            _ => Err(ControlError::UnknownMethod(method.to_string())),
        }
    }

    fn default_data_path(&self, method: &str, name: &str) -> Result<PathBuf, ControlError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\']);
        if !valid {
            return Err(ControlError::InvalidParams {
                method: method.to_string(),
                message: format!("`{name}` cannot name a data directory; pass data_path"),
            });
        }
        Ok(self.orchestrator.config().data_dir.join(name))
    }

    async fn route_worker(&self, method: &str, raw: Value) -> ControlResult {
        let workers = self.orchestrator.workers()?;
        match method {
            "worker.list" => {
                let p: FilterParams = params(method, raw)?;
                to_json(workers.list_workers(&WorkerFilter::from_json(&p.filter)?)?)
            }
            "worker.get" => {
                let p: IdParams<WorkerId> = params(method, raw)?;
                to_json(workers.get_worker(p.id)?)
            }
            "worker.create" => {
                let p: CreateWorkerParams = params(method, raw)?;
                to_json(workers.create_worker(p.node_id, p.key_material).await?)
            }
            "worker.action" => {
                let p: WorkerActionParams = params(method, raw)?;
                to_json(workers.submit_action(p.id, p.action, p.params).await?)
            }
            "worker.remove" => {
                let p: RemoveWorkerParams = params(method, raw)?;
                to_json(workers.remove_worker(p.id, p.force).await?)
            }
            _ => Err(ControlError::UnknownMethod(method.to_string())),
        }
    }

    async fn route_snapshot(&self, method: &str, raw: Value) -> ControlResult {
        let snapshots = self.orchestrator.snapshots()?;
        match method {
            "snapshot.start" => {
                let p: StartSnapshotParams = params(method, raw)?;
                let request = SnapshotRequest {
                    source_url: p.url,
                    expected_size: p.expected_size,
                    sha256: p.sha256,
                };
                let job_id = snapshots.start_snapshot_job(p.node_id, request)?;
                Ok(json!({ "job_id": job_id }))
            }
            "snapshot.cancel" => {
                let p: JobParams = params(method, raw)?;
                let outcome = snapshots.cancel(p.job_id)?;
                Ok(json!({ "job_id": p.job_id, "outcome": outcome }))
            }
            "snapshot.get" => {
                let p: JobParams = params(method, raw)?;
                to_json(snapshots.get_job(p.job_id)?)
            }
            "snapshot.list" => {
                let p: ListJobsParams = params(method, raw)?;
                to_json(snapshots.list_jobs(p.node_id))
            }
            _ => Err(ControlError::UnknownMethod(method.to_string())),
        }
    }

    /// Serve requests from `input` until EOF, writing responses and pushed
    /// `events` to `output`. Returns after every accepted request has been
    /// answered.
    pub async fn serve<R, W>(&self, input: R, output: W, events: Subscription) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<ControlMessage>();
        let writer = tokio::spawn(write_messages(output, rx));
        let (done_tx, done_rx) = watch::channel(false);
        let forwarder = tokio::spawn(forward_events(events, tx.clone(), done_rx));

        let mut requests = JoinSet::new();
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            let surface = self.clone();
            let tx = tx.clone();
            requests.spawn(async move {
                if let Some(message) = surface.handle_line(&line).await {
                    let _ = tx.send(message);
                }
            });
        }
        while let Some(joined) = requests.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "control request task failed");
            }
        }

        let _ = done_tx.send(true);
        if let Err(err) = forwarder.await {
            warn!(error = %err, "event forwarder failed");
        }
        drop(tx);
        writer.await.map_err(std::io::Error::other)?
    }
}

/// Push bus events until `done`, then flush what is already queued.
async fn forward_events(
    mut events: Subscription,
    tx: mpsc::UnboundedSender<ControlMessage>,
    mut done: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if tx.send(ControlMessage::Event(event.to_wire())).is_err() {
                        return;
                    }
                }
                None => return,
            },
            _ = done.changed() => break,
        }
    }
    while let Ok(Some(event)) = events.try_recv() {
        if tx.send(ControlMessage::Event(event.to_wire())).is_err() {
            return;
        }
    }
    if events.dropped() > 0 {
        warn!(dropped = events.dropped(), "control client fell behind, events were skipped");
    }
}

async fn write_messages<W>(mut output: W, mut rx: mpsc::UnboundedReceiver<ControlMessage>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        output.write_all(&line).await?;
        output.flush().await?;
    }
    Ok(())
}
