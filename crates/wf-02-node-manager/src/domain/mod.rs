//! Pure rules of the node manager: the process state machine, process
//! roles and log redaction.

pub mod logs;
pub mod state;

pub use logs::{redact, LogTail, LOG_TAIL_LINES};
pub use state::{can_transition, ProcessRole};
