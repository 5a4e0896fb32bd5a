//! # Waterfall Supervisor Test Suite
//!
//! Cross-component flows run against a real [`node_supervisor::Orchestrator`]
//! with scripted child processes and an in-memory chain.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── support.rs          # Harness, scripted processes, mock chain
//! └── integration/
//!     ├── e2e_supervisor.rs   # Node lifecycle through the orchestrator
//!     ├── worker_flow.rs      # Status observation and actions
//!     ├── snapshot_flow.rs    # Snapshot jobs against node state
//!     └── control_flow.rs     # NDJSON surface with event push
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p wf-tests
//! cargo test -p wf-tests integration::snapshot_flow
//! ```

pub mod integration;
pub mod support;
