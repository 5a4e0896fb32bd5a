//! # Shared Types Crate
//!
//! Single source of truth for the records that flow between supervisor
//! components and out to the presentation layer.
//!
//! ## Contents
//!
//! - `entities` - Node, Worker, StatusSample and SnapshotJob records
//! - `network` - supported chains and their per-network constants
//! - `paths` - deterministic per-node data directory layout
//! - `errors` - the error taxonomy every component converts into

pub mod entities;
pub mod errors;
pub mod network;
pub mod paths;

pub use entities::*;
pub use errors::{ErrorKind, SupervisorError, SupervisorResult};
pub use network::Network;
pub use paths::DataLayout;
