//! Ports of the worker manager.
//!
//! Transactions and validator lookups go through [`NodeRpc`]; the store and
//! the bus are used directly.

pub use shared_rpc::NodeRpc;
