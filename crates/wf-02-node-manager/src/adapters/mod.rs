//! Process spawning and command lines.

pub mod commands;
pub mod process;

pub use commands::{Bootnodes, WaterfallCommands};
pub use process::{ExitInfo, ProcessHandle, SpawnError};
