//! Target selection and the in-flight set.

pub mod inflight;
pub mod targets;

pub use inflight::{InFlight, InFlightGuard};
pub use targets::{collect_targets, HealthTarget};
