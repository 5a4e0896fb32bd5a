//! # Worker Transactions
//!
//! Call data and transaction requests for validator actions. Layouts:
//!
//! ```text
//! activate    0xf4 || pubkey || withdrawal address || signature   value = stake
//! deactivate  0xf5 || pubkey                                      value = 0
//! withdraw    0xf6 || pubkey || amount (32-byte big-endian wei)   value = 0
//! ```

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use shared_rpc::TransactionRequest;
use shared_types::{ActionKind, Network, SupervisorError, Worker, WorkerStatus};
use thiserror::Error;

pub const ACTIVATE_OP: u8 = 0xf4;
pub const DEACTIVATE_OP: u8 = 0xf5;
pub const WITHDRAW_OP: u8 = 0xf6;

/// Why a transaction could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("worker {field} is not valid hex")]
    InvalidHex { field: &'static str },

    #[error("invalid amount `{0}`")]
    InvalidAmount(String),

    #[error("withdraw requires an amount")]
    MissingAmount,

    #[error("cannot {action} a worker that is {status}")]
    WrongStatus {
        action: ActionKind,
        status: WorkerStatus,
    },

    #[error("no validator deposit address configured for {0}")]
    NoDepositAddress(Network),
}

impl From<ActionError> for SupervisorError {
    fn from(err: ActionError) -> Self {
        SupervisorError::Precondition(err.to_string())
    }
}

/// Caller-supplied action parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionParams {
    /// Wei, decimal or `0x` hex. Required by `withdraw`.
    #[serde(default)]
    pub amount: Option<String>,
}

impl ActionParams {
    #[must_use]
    pub fn withdraw(amount: impl Into<String>) -> Self {
        Self {
            amount: Some(amount.into()),
        }
    }

    fn amount(&self) -> Result<Option<U256>, ActionError> {
        self.amount.as_deref().map(parse_wei).transpose()
    }
}

/// Parse a wei amount given as decimal or `0x` hex.
pub fn parse_wei(raw: &str) -> Result<U256, ActionError> {
    let trimmed = raw.trim();
    let parsed = match trimmed.strip_prefix("0x") {
        Some(hex) => U256::from_str_radix(hex, 16).ok(),
        None => U256::from_dec_str(trimmed).ok(),
    };
    parsed.ok_or_else(|| ActionError::InvalidAmount(raw.to_string()))
}

/// Statuses an action may be submitted from.
pub fn check_source_status(action: ActionKind, status: WorkerStatus) -> Result<(), ActionError> {
    let allowed = match action {
        ActionKind::Activate => status == WorkerStatus::Pending,
        ActionKind::Deactivate => status == WorkerStatus::Active,
        ActionKind::Withdraw => matches!(status, WorkerStatus::Active | WorkerStatus::Exited),
    };
    if allowed {
        Ok(())
    } else {
        Err(ActionError::WrongStatus { action, status })
    }
}

fn decode(field: &'static str, value: &str) -> Result<Vec<u8>, ActionError> {
    hex::decode(value).map_err(|_| ActionError::InvalidHex { field })
}

/// `0x`-prefixed call data for `action` on `worker`.
pub fn call_data(
    action: ActionKind,
    worker: &Worker,
    params: &ActionParams,
) -> Result<String, ActionError> {
    let public_key = decode("public key", &worker.public_key)?;
    let mut data = Vec::with_capacity(1 + public_key.len() + 96);

    match action {
        ActionKind::Activate => {
            data.push(ACTIVATE_OP);
            data.extend_from_slice(&public_key);
            data.extend(decode("withdrawal address", &worker.withdrawal_address)?);
            data.extend(decode("signature", &worker.signature)?);
        }
        ActionKind::Deactivate => {
            data.push(DEACTIVATE_OP);
            data.extend_from_slice(&public_key);
        }
        ActionKind::Withdraw => {
            let amount = params.amount()?.ok_or(ActionError::MissingAmount)?;
            let mut word = [0u8; 32];
            amount.to_big_endian(&mut word);
            data.push(WITHDRAW_OP);
            data.extend_from_slice(&public_key);
            data.extend_from_slice(&word);
        }
    }
    Ok(format!("0x{}", hex::encode(data)))
}

/// Full transaction for `action`, sent from the worker's withdrawal address
/// to the network's deposit contract.
pub fn build_transaction(
    action: ActionKind,
    worker: &Worker,
    network: Network,
    deposit_address: &str,
    params: &ActionParams,
) -> Result<TransactionRequest, ActionError> {
    check_source_status(action, worker.status)?;
    let value = match action {
        ActionKind::Activate => U256::from(network.stake_amount_wei()),
        ActionKind::Deactivate | ActionKind::Withdraw => U256::zero(),
    };
    Ok(TransactionRequest {
        from: format!("0x{}", worker.withdrawal_address),
        to: with_prefix(deposit_address),
        value,
        data: call_data(action, worker, params)?,
    })
}

fn with_prefix(address: &str) -> String {
    if address.starts_with("0x") {
        address.to_ascii_lowercase()
    } else {
        format!("0x{}", address.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{NodeId, WorkerId};

    fn worker(status: WorkerStatus) -> Worker {
        Worker {
            id: WorkerId(1),
            node_id: NodeId(1),
            validator_index: None,
            public_key: "aabb".into(),
            withdrawal_address: "11".repeat(20),
            signature: "cc".into(),
            status,
            deposit_data: None,
            created_at: Default::default(),
        }
    }

    #[test]
    fn test_activate_transaction() {
        let tx = build_transaction(
            ActionKind::Activate,
            &worker(WorkerStatus::Pending),
            Network::Testnet8,
            "DEADBEEF",
            &ActionParams::default(),
        )
        .unwrap();

        assert_eq!(tx.from, format!("0x{}", "11".repeat(20)));
        assert_eq!(tx.to, "0xdeadbeef");
        assert_eq!(tx.value, U256::from(3_200u64) * U256::exp10(18));
        assert_eq!(tx.data, format!("0xf4aabb{}cc", "11".repeat(20)));
    }

    #[test]
    fn test_deactivate_data() {
        let data = call_data(
            ActionKind::Deactivate,
            &worker(WorkerStatus::Active),
            &ActionParams::default(),
        )
        .unwrap();
        assert_eq!(data, "0xf5aabb");
    }

    #[test]
    fn test_withdraw_encodes_amount_word() {
        let data = call_data(
            ActionKind::Withdraw,
            &worker(WorkerStatus::Exited),
            &ActionParams::withdraw("0x100"),
        )
        .unwrap();
        let expected = format!("0xf6aabb{}0100", "0".repeat(60));
        assert_eq!(data, expected);

        assert_eq!(
            call_data(
                ActionKind::Withdraw,
                &worker(WorkerStatus::Exited),
                &ActionParams::default()
            ),
            Err(ActionError::MissingAmount)
        );
    }

    #[test]
    fn test_source_status_rules() {
        assert!(check_source_status(ActionKind::Activate, WorkerStatus::Pending).is_ok());
        assert!(check_source_status(ActionKind::Activate, WorkerStatus::Active).is_err());
        assert!(check_source_status(ActionKind::Deactivate, WorkerStatus::Active).is_ok());
        assert!(check_source_status(ActionKind::Deactivate, WorkerStatus::Activating).is_err());
        assert!(check_source_status(ActionKind::Withdraw, WorkerStatus::Exited).is_ok());
        assert!(check_source_status(ActionKind::Withdraw, WorkerStatus::Pending).is_err());
    }

    #[test]
    fn test_parse_wei() {
        assert_eq!(parse_wei("1000").unwrap(), U256::from(1000));
        assert_eq!(parse_wei("0xff").unwrap(), U256::from(255));
        assert!(matches!(parse_wei("ten"), Err(ActionError::InvalidAmount(_))));
    }

    #[test]
    fn test_invalid_key_material() {
        let mut w = worker(WorkerStatus::Pending);
        w.signature = "zz".into();
        assert_eq!(
            call_data(ActionKind::Activate, &w, &ActionParams::default()),
            Err(ActionError::InvalidHex { field: "signature" })
        );
    }
}
