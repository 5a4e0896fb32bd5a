//! # Worker Manager
//!
//! Owns validator identities ("workers") attached to nodes and the on-chain
//! actions that move them through their lifecycle:
//!
//! ```text
//! pending ──activate──→ activating → active ──deactivate──→ deactivating → exited
//!                                      └──────── withdraw ────────────────┘
//! ```
//!
//! Submissions go to the owning node's RPC endpoint and return on
//! acceptance. Status only changes when a later health sample reports it,
//! and only forward. An action the chain does not reflect within the
//! confirmation timeout is reported as `worker.actionTimedOut`; nothing is
//! rolled back.

pub mod domain;
pub mod ports;
pub mod service;

pub use domain::{ActionError, ActionParams, ConfirmationTracker, PendingConfirmation};
pub use ports::NodeRpc;
pub use service::{ActionResult, WorkerManager, WorkerManagerConfig};
