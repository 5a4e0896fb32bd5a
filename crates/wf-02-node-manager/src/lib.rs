//! # Node Manager
//!
//! Starts, stops and watches the coordinator and validator (`gwat`)
//! processes of every configured node, and owns node record lifecycle.
//!
//! ## Architecture
//!
//! ```text
//! NodeManager (service)
//!   ├── CommandBuilder (port) ── WaterfallCommands (adapter)
//!   ├── ProcessHandle (adapter: tokio::process child + log capture)
//!   ├── LocalStore (wf-01) ── node records, data-path leases
//!   └── EventPublisher (shared-bus) ── node.stateChanged, node.failed
//! ```
//!
//! ## Guarantees
//!
//! - Calls for one node are serialized; concurrent `start` spawns once.
//! - A node is `Running` only after both processes outlived the startup
//!   grace period.
//! - Any process exit while running fails the whole node and stops its
//!   sibling. There is no automatic restart.
//! - `start` is refused while a snapshot job owns the data directory.

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod service;

pub use adapters::{Bootnodes, ExitInfo, ProcessHandle, SpawnError, WaterfallCommands};
pub use domain::{can_transition, redact, LogTail, ProcessRole, LOG_TAIL_LINES};
pub use ports::{CommandBuilder, LaunchSpec};
pub use service::{NodeManager, NodeManagerConfig};
