//! Job requests and cancellation rules.

use serde::{Deserialize, Serialize};
use shared_types::SnapshotState;

/// What to download, and how to check it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub source_url: String,
    /// Expected archive size. The source's content length is used when
    /// absent.
    #[serde(default)]
    pub expected_size: Option<u64>,
    /// Hex SHA-256 of the archive.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl SnapshotRequest {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            expected_size: None,
            sha256: None,
        }
    }

    #[must_use]
    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    #[must_use]
    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The transfer stops at the next chunk boundary.
    Requested,
    /// The job is applying; the request resolves as a no-op when it ends.
    Deferred,
    /// The job had already ended.
    AlreadyFinished,
}

/// How a cancel request is treated in `state`.
#[must_use]
pub fn cancel_outcome(state: SnapshotState) -> CancelOutcome {
    match state {
        SnapshotState::Queued | SnapshotState::Downloading => CancelOutcome::Requested,
        SnapshotState::Applying => CancelOutcome::Deferred,
        SnapshotState::Done | SnapshotState::Failed | SnapshotState::Cancelled => {
            CancelOutcome::AlreadyFinished
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_outcome_by_state() {
        assert_eq!(cancel_outcome(SnapshotState::Queued), CancelOutcome::Requested);
        assert_eq!(cancel_outcome(SnapshotState::Downloading), CancelOutcome::Requested);
        assert_eq!(cancel_outcome(SnapshotState::Applying), CancelOutcome::Deferred);
        assert_eq!(cancel_outcome(SnapshotState::Done), CancelOutcome::AlreadyFinished);
        assert_eq!(cancel_outcome(SnapshotState::Cancelled), CancelOutcome::AlreadyFinished);
    }

    #[test]
    fn test_request_from_json() {
        let request: SnapshotRequest =
            serde_json::from_str(r#"{"source_url": "file:///tmp/s.tar"}"#).unwrap();
        assert_eq!(request, SnapshotRequest::new("file:///tmp/s.tar"));
    }
}
