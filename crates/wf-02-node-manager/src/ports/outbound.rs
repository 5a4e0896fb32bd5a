//! # Outbound Ports
//!
//! How a node's processes are invoked. The default implementation lives in
//! `adapters::commands`; tests substitute shell one-liners.

use std::path::PathBuf;

use shared_types::{Node, SupervisorResult};

use crate::domain::ProcessRole;

/// Everything needed to spawn one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub role: ProcessRole,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
    /// Captured stdout/stderr are appended here.
    pub log_path: PathBuf,
}

/// Builds the command line for a role of a node.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, node: &Node, role: ProcessRole) -> SupervisorResult<LaunchSpec>;
}
