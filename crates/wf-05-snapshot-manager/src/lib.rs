//! # Snapshot Manager
//!
//! Downloads a chain-data archive for a stopped node and swaps it into the
//! node's data directory.
//!
//! - One active job per node. The job holds the node's data lease, so the
//!   node cannot start while the job runs.
//! - Sources: `http(s)://` streams and `file://` paths.
//! - The download is checked against the expected size and an optional
//!   SHA-256 digest before anything live is touched.
//! - Wallet, keystore and node key always survive a swap.
//! - On start-up, directories left mid-swap are reported as corrupt.

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod service;

pub use adapters::{FileSource, HttpSource, SchemeRouter, TarApplier};
pub use domain::{CancelOutcome, SnapshotError, SnapshotRequest};
pub use ports::{SnapshotApplier, SnapshotReader, SnapshotSource};
pub use service::{SnapshotConfig, SnapshotManager};
