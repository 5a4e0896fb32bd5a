//! Cross-component flows.

mod control_flow;
mod e2e_supervisor;
mod snapshot_flow;
mod worker_flow;
