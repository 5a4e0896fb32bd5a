//! Ports of the node manager.

pub mod outbound;

pub use outbound::{CommandBuilder, LaunchSpec};
