//! Per-node process state machine.
//!
//! ```text
//! Stopped ──start──→ Starting ──grace ok──→ Running ──stop──→ Stopping ──→ Stopped
//!                       │                      │
//!                       └──spawn/crash──→ Failed ←──crash──┘
//! Failed ──start──→ Starting
//! ```

use std::fmt;

use shared_types::ProcessState;

/// Which process of a node's group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    /// Beacon coordinator, started first.
    Coordinator,
    /// `gwat` validator client, started second.
    Validator,
}

impl ProcessRole {
    /// Start order; stop runs it backwards.
    pub const START_ORDER: [ProcessRole; 2] = [ProcessRole::Coordinator, ProcessRole::Validator];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessRole::Coordinator => "coordinator",
            ProcessRole::Validator => "validator",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessRole {
    type Err = shared_types::SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(ProcessRole::Coordinator),
            "validator" | "gwat" => Ok(ProcessRole::Validator),
            other => Err(shared_types::SupervisorError::Precondition(format!(
                "unknown process role {other}"
            ))),
        }
    }
}

/// Whether `from → to` is a legal edge.
#[must_use]
pub fn can_transition(from: ProcessState, to: ProcessState) -> bool {
    use ProcessState::*;
    matches!(
        (from, to),
        (Stopped | Failed, Starting)
            | (Starting, Running)
            | (Starting | Running, Failed)
            | (Starting | Running | Failed, Stopping)
            | (Stopping, Stopped)
    )
}
