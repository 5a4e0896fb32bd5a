//! Deadlines for submitted actions to show up on chain.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use shared_types::{ActionKind, WorkerId, WorkerStatus};

/// An action waiting for the chain to move the worker on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfirmation {
    pub worker_id: WorkerId,
    pub action: ActionKind,
    pub tx_hash: String,
    /// Status the worker is expected to leave.
    pub awaited: WorkerStatus,
    pub submitted_at: Instant,
    pub deadline: Instant,
}

impl PendingConfirmation {
    #[must_use]
    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.submitted_at)
    }
}

/// At most one pending confirmation per worker; a newer submission replaces
/// the older one.
#[derive(Debug, Default)]
pub struct ConfirmationTracker {
    pending: HashMap<WorkerId, PendingConfirmation>,
}

impl ConfirmationTracker {
    /// Track `action` if it is expected to change the worker's status.
    /// Returns whether a deadline was registered.
    pub fn register(
        &mut self,
        worker_id: WorkerId,
        action: ActionKind,
        tx_hash: String,
        now: Instant,
        timeout: Duration,
    ) -> bool {
        let Some(awaited) = action.awaited_transition() else {
            return false;
        };
        self.pending.insert(
            worker_id,
            PendingConfirmation {
                worker_id,
                action,
                tx_hash,
                awaited,
                submitted_at: now,
                deadline: now + timeout,
            },
        );
        true
    }

    /// The worker was observed in `status`. Returns the confirmation it
    /// settles, if any.
    pub fn observe(&mut self, worker_id: WorkerId, status: WorkerStatus) -> Option<PendingConfirmation> {
        let settled = self
            .pending
            .get(&worker_id)
            .is_some_and(|p| p.awaited.can_advance_to(status));
        if settled {
            self.pending.remove(&worker_id)
        } else {
            None
        }
    }

    /// The confirmation still outstanding for a worker.
    #[must_use]
    pub fn pending(&self, worker_id: WorkerId) -> Option<&PendingConfirmation> {
        self.pending.get(&worker_id)
    }

    pub fn forget(&mut self, worker_id: WorkerId) {
        self.pending.remove(&worker_id);
    }

    /// Remove and return every confirmation past its deadline.
    pub fn expired(&mut self, now: Instant) -> Vec<PendingConfirmation> {
        let overdue: Vec<WorkerId> = self
            .pending
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.worker_id)
            .collect();
        overdue
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
