//! HTTP JSON-RPC client for a node's local endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared_types::SupervisorError;
use thiserror::Error;
use tracing::debug;

use crate::types::*;
use crate::NodeRpc;

/// Errors that can occur when talking to a node endpoint.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i32, message: String },
    #[error("Failed to parse response: {0}")]
    Parse(String),
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
}

impl RpcError {
    /// Transport-level failures are worth retrying; RPC errors are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, RpcError::Rpc { .. })
    }
}

impl From<RpcError> for SupervisorError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Rpc { .. } => SupervisorError::Precondition(err.to_string()),
            other => SupervisorError::Transient(other.to_string()),
        }
    }
}

/// `NodeRpc` over HTTP.
///
/// Stateless apart from the request id; the endpoint is passed per call
/// because every node has its own.
pub struct HttpNodeRpc {
    client: Client,
    request_id: AtomicU64,
}

impl HttpNodeRpc {
    pub fn new(timeout: Duration) -> Result<Self, RpcError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(2)))
            .build()
            .map_err(RpcError::Http)?;

        Ok(Self {
            client,
            request_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Call a JSON-RPC method.
    async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        method: &str,
        params: P,
    ) -> Result<R, RpcError> {
        let request = JsonRpcRequest::new(method, params, self.next_id());
        debug!(endpoint, method, id = request.id, "rpc call");

        let response = self
            .client
            .post(endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    RpcError::Connection(format!("Cannot connect to {endpoint}"))
                } else if e.is_timeout() {
                    RpcError::Timeout(format!("{method} at {endpoint}"))
                } else {
                    RpcError::Http(e)
                }
            })?;

        let rpc_response: JsonRpcResponse<R> = response
            .json()
            .await
            .map_err(|e| RpcError::Parse(e.to_string()))?;

        if let Some(error) = rpc_response.error {
            return Err(RpcError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        rpc_response
            .result
            .ok_or_else(|| RpcError::Parse(format!("missing result for {method}")))
    }

    async fn quantity(&self, endpoint: &str, method: &str) -> Result<u64, RpcError> {
        let raw: String = self.call(endpoint, method, [(); 0]).await?;
        parse_quantity(&raw).ok_or_else(|| RpcError::Parse(format!("{method}: bad quantity {raw}")))
    }
}

/// `eth_syncing` yields `false` or an object describing progress.
fn is_syncing(raw: &serde_json::Value) -> bool {
    match raw {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Null => false,
        _ => true,
    }
}

#[async_trait]
impl NodeRpc for HttpNodeRpc {
    async fn node_health(&self, endpoint: &str) -> Result<NodeHealth, RpcError> {
        let syncing: serde_json::Value = self.call(endpoint, "eth_syncing", [(); 0]).await?;
        let peer_count = self.quantity(endpoint, "net_peerCount").await?;
        let sync_height = self.quantity(endpoint, "eth_blockNumber").await?;

        Ok(NodeHealth {
            sync_height,
            peer_count: u32::try_from(peer_count).unwrap_or(u32::MAX),
            syncing: is_syncing(&syncing),
        })
    }

    async fn validator_info(
        &self,
        endpoint: &str,
        public_key: &str,
    ) -> Result<ValidatorInfo, RpcError> {
        let raw: RawValidatorStatus = self
            .call(endpoint, "validator_status", [public_key])
            .await?;
        Ok(raw.into_info())
    }

    async fn send_transaction(
        &self,
        endpoint: &str,
        request: &TransactionRequest,
    ) -> Result<String, RpcError> {
        self.call(endpoint, "eth_sendTransaction", [request]).await
    }
}
