//! Snapshot job rules, verification and errors.

pub mod errors;
pub mod job;
pub mod verify;

pub use errors::SnapshotError;
pub use job::{cancel_outcome, CancelOutcome, SnapshotRequest};
pub use verify::Digester;
