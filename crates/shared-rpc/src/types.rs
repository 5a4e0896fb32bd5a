//! JSON-RPC wire types and the typed results decoded from them.

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use shared_types::WorkerStatus;

/// JSON-RPC request structure
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<T> {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: T,
    pub id: u64,
}

impl<T> JsonRpcRequest<T> {
    pub fn new(method: impl Into<String>, params: T, id: u64) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
            id,
        }
    }
}

/// JSON-RPC response structure
#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse<T> {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: u64,
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC Error {}: {}", self.code, self.message)
    }
}

/// Health of a running node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub sync_height: u64,
    pub peer_count: u32,
    pub syncing: bool,
}

/// Chain-side view of a validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    /// `None` until the chain knows the deposit.
    pub status: Option<WorkerStatus>,
    pub index: Option<u64>,
}

/// Raw `validator_status` result.
#[derive(Debug, Deserialize)]
pub(crate) struct RawValidatorStatus {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub index: Option<serde_json::Value>,
}

impl RawValidatorStatus {
    pub(crate) fn into_info(self) -> ValidatorInfo {
        let index = match self.index {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => parse_quantity(&s).or_else(|| s.parse().ok()),
            _ => None,
        };
        ValidatorInfo {
            status: self.status.as_deref().and_then(map_validator_status),
            index,
        }
    }
}

/// Map the chain's validator status vocabulary onto worker statuses.
pub(crate) fn map_validator_status(raw: &str) -> Option<WorkerStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "pending" | "pending_initialized" | "unknown" => Some(WorkerStatus::Pending),
        "activating" | "pending_queued" | "deposited" => Some(WorkerStatus::Activating),
        "active" | "active_ongoing" => Some(WorkerStatus::Active),
        "exiting" | "active_exiting" | "deactivating" => Some(WorkerStatus::Deactivating),
        "exited" | "exited_unslashed" | "exited_slashed" | "withdrawal_possible"
        | "withdrawal_done" => Some(WorkerStatus::Exited),
        _ => None,
    }
}

/// A transaction to submit through `eth_sendTransaction`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    /// `0x`-prefixed sender address.
    pub from: String,
    /// `0x`-prefixed recipient address.
    pub to: String,
    /// Wei, serialized as a hex quantity.
    pub value: U256,
    /// `0x`-prefixed call data.
    pub data: String,
}

/// Parse a `0x`-prefixed hex quantity.
#[must_use]
pub fn parse_quantity(raw: &str) -> Option<u64> {
    let digits = raw.strip_prefix("0x")?;
    if digits.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(digits, 16).ok()
}
