//! # Error Types
//!
//! The supervisor-wide error taxonomy. Only `FatalStartup` terminates the
//! application; every other kind is returned to the caller as a typed result.

use thiserror::Error;

/// Convenience alias used across the component crates.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Errors surfaced by supervisor components.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// Migration or store-open failure. Aborts startup, no retry.
    #[error("fatal startup error: {0}")]
    FatalStartup(String),

    /// Spawn failure or crash of a node process.
    #[error("process error on node {node_id}: {message}")]
    Process { node_id: String, message: String },

    /// The operation needs a running node that is not running.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The operation violates an entity invariant.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A duplicate concurrent operation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Health-check timeout or RPC hiccup.
    #[error("transient error: {0}")]
    Transient(String),

    /// Malformed query condition.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Unknown entity id.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Backend I/O or serialization failure.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Flat error kind, used on the wire and in events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    FatalStartup,
    Process,
    Unavailable,
    Precondition,
    Conflict,
    Transient,
    UnsupportedOperation,
    NotFound,
    Storage,
}

impl ErrorKind {
    /// Stable snake_case code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::FatalStartup => "fatal_startup",
            ErrorKind::Process => "process",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::UnsupportedOperation => "unsupported_operation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Storage => "storage",
        }
    }
}

impl SupervisorError {
    /// The flat kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::FatalStartup(_) => ErrorKind::FatalStartup,
            SupervisorError::Process { .. } => ErrorKind::Process,
            SupervisorError::Unavailable(_) => ErrorKind::Unavailable,
            SupervisorError::Precondition(_) => ErrorKind::Precondition,
            SupervisorError::Conflict(_) => ErrorKind::Conflict,
            SupervisorError::Transient(_) => ErrorKind::Transient,
            SupervisorError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            SupervisorError::NotFound { .. } => ErrorKind::NotFound,
            SupervisorError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether this error must terminate the application.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, SupervisorError::FatalStartup(_))
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        SupervisorError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<std::io::Error> for SupervisorError {
    fn from(err: std::io::Error) -> Self {
        SupervisorError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SupervisorError {
    fn from(err: serde_json::Error) -> Self {
        SupervisorError::Storage(format!("serialization: {err}"))
    }
}
