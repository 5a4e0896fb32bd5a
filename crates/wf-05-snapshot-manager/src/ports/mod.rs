//! # Outbound Ports
//!
//! Where snapshot archives come from, and how they land on disk.

use std::path::Path;

use async_trait::async_trait;

use crate::domain::SnapshotError;

/// An open archive transfer, read chunk by chunk.
#[async_trait]
pub trait SnapshotReader: Send {
    /// Size announced by the source, if any.
    fn total_bytes(&self) -> Option<u64>;

    /// The next chunk, or `None` at the end.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, SnapshotError>;
}

/// Opens transfers for a URL.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn SnapshotReader>, SnapshotError>;
}

/// Swaps a downloaded archive into a node's data directory. Called on a
/// blocking thread.
pub trait SnapshotApplier: Send + Sync {
    fn apply(&self, root: &Path, archive: &Path) -> Result<(), SnapshotError>;
}
