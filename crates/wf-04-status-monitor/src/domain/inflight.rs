//! Targets with a health check underway.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use shared_types::TargetId;

/// Set of targets currently being checked. A target can be claimed once;
/// the claim ends when its guard drops.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    targets: Arc<Mutex<HashSet<TargetId>>>,
}

impl InFlight {
    /// Claim `target`, or `None` when a check for it is still running.
    #[must_use]
    pub fn try_claim(&self, target: TargetId) -> Option<InFlightGuard> {
        if self.targets.lock().insert(target) {
            Some(InFlightGuard {
                target,
                targets: self.targets.clone(),
            })
        } else {
            None
        }
    }

    #[must_use]
    pub fn contains(&self, target: &TargetId) -> bool {
        self.targets.lock().contains(target)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its target on drop, including when the check is aborted.
#[derive(Debug)]
pub struct InFlightGuard {
    target: TargetId,
    targets: Arc<Mutex<HashSet<TargetId>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.targets.lock().remove(&self.target);
    }
}
