//! # Node Supervisor
//!
//! Runs Waterfall coordinator/validator processes on the local machine and
//! exposes them to a presentation layer.
//!
//! ## Modules
//!
//! - `config` - defaults, `WF_*` environment variables and CLI flags
//! - `telemetry` - `tracing` subscriber on stderr
//! - `orchestrator` - ordered startup and reverse teardown of all components
//! - `control` - newline-delimited JSON requests and pushed events

pub mod config;
pub mod control;
pub mod orchestrator;
pub mod telemetry;

pub use config::{ConfigError, ConfigOverrides, StoreBackend, SupervisorConfig};
pub use control::{ControlError, ControlMessage, ControlRequest, ControlSurface, ErrorBody};
pub use orchestrator::{open_store, Adapters, Orchestrator, Phase};
pub use telemetry::{init_tracing, TelemetryError};
