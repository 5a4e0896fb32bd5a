//! What one polling cycle checks.

use shared_types::{Node, ProcessState, TargetId, Worker, WorkerStatus};

/// A single health-check target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthTarget {
    Node {
        target: TargetId,
        endpoint: String,
    },
    /// Checked against the owning node's endpoint.
    Worker {
        target: TargetId,
        endpoint: String,
        public_key: String,
    },
}

impl HealthTarget {
    #[must_use]
    pub fn id(&self) -> TargetId {
        match self {
            HealthTarget::Node { target, .. } | HealthTarget::Worker { target, .. } => *target,
        }
    }
}

/// Targets for running nodes and their live workers, nodes first.
#[must_use]
pub fn collect_targets(nodes: &[Node], workers: &[Worker]) -> Vec<HealthTarget> {
    let running: Vec<&Node> = nodes
        .iter()
        .filter(|n| n.process_state == ProcessState::Running)
        .collect();

    let mut targets: Vec<HealthTarget> = running
        .iter()
        .map(|node| HealthTarget::Node {
            target: TargetId::Node(node.id),
            endpoint: node.rpc_endpoint.clone(),
        })
        .collect();

    for worker in workers.iter().filter(|w| w.status != WorkerStatus::Removed) {
        if let Some(node) = running.iter().find(|n| n.id == worker.node_id) {
            targets.push(HealthTarget::Worker {
                target: TargetId::Worker(worker.id),
                endpoint: node.rpc_endpoint.clone(),
                public_key: format!("0x{}", worker.public_key),
            });
        }
    }
    targets
}
