//! # Status Monitor
//!
//! Periodic health checks of every running node and its workers.
//!
//! - A node is checked through `eth_syncing`, `net_peerCount` and
//!   `eth_blockNumber`; a worker through `validator_status` on its node.
//! - At most `max_concurrent_checks` checks run at once, each bounded by
//!   `check_timeout`.
//! - A target is never checked twice at the same time: a busy target is
//!   skipped for the cycle, not queued.
//! - Failures are counted per target and published with `healthy = false`.
//!   They never change process state.

pub mod domain;
pub mod service;

pub use domain::{collect_targets, HealthTarget, InFlight, InFlightGuard};
pub use service::{MonitorConfig, StatusMonitor};
