//! Snapshot errors.

use shared_types::SupervisorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("unsupported snapshot source: {0}")]
    UnsupportedSource(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid archive: {0}")]
    Archive(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,
}

impl SnapshotError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SnapshotError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for SnapshotError {
    fn from(err: reqwest::Error) -> Self {
        SnapshotError::Download(err.to_string())
    }
}

impl From<SnapshotError> for SupervisorError {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::UnsupportedSource(_) => SupervisorError::Precondition(err.to_string()),
            SnapshotError::Download(_) => SupervisorError::Transient(err.to_string()),
            _ => SupervisorError::Storage(err.to_string()),
        }
    }
}
