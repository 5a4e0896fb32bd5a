//! # Node RPC
//!
//! Client for the JSON-RPC endpoint each running node exposes locally, and
//! the `NodeRpc` port the worker manager and status monitor depend on.

pub mod client;
pub mod types;

pub use client::{HttpNodeRpc, RpcError};
pub use types::{
    parse_quantity, JsonRpcError, JsonRpcRequest, JsonRpcResponse, NodeHealth, TransactionRequest,
    ValidatorInfo,
};

use async_trait::async_trait;

/// Outbound port to a node's RPC endpoint.
///
/// Implementations must not retry internally; callers own timeouts.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Sync height, peer count and syncing flag of the node.
    async fn node_health(&self, endpoint: &str) -> Result<NodeHealth, RpcError>;

    /// Chain-side view of one validator.
    async fn validator_info(&self, endpoint: &str, public_key: &str)
        -> Result<ValidatorInfo, RpcError>;

    /// Submit a transaction. Returns once the endpoint accepted it, with
    /// the transaction hash.
    async fn send_transaction(
        &self,
        endpoint: &str,
        request: &TransactionRequest,
    ) -> Result<String, RpcError>;
}
