//! # Networks
//!
//! The chains a node can be configured for. A node's network is fixed at
//! creation; its chain data is only valid for that network.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::SupervisorError;

/// Wei per whole coin.
pub const WEI_PER_COIN: u128 = 1_000_000_000_000_000_000;

/// A supported chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Testnet8,
    Testnet9,
    Mainnet,
}

impl Network {
    /// All supported networks.
    pub const ALL: [Network; 3] = [Network::Testnet8, Network::Testnet9, Network::Mainnet];

    /// Lowercase name, as used in config keys and serialized records.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Testnet8 => "testnet8",
            Network::Testnet9 => "testnet9",
            Network::Mainnet => "mainnet",
        }
    }

    /// Flag passed to the coordinator binary.
    #[must_use]
    pub fn coordinator_flag(&self) -> &'static str {
        match self {
            Network::Testnet8 => "--testnet8",
            Network::Testnet9 => "--testnet9",
            Network::Mainnet => "--mainnet",
        }
    }

    /// Flag passed to the validator binary.
    #[must_use]
    pub fn validator_flag(&self) -> &'static str {
        // Both binaries currently share the same network switches.
        self.coordinator_flag()
    }

    /// Whole coins a validator must stake to activate.
    #[must_use]
    pub fn stake_amount(&self) -> u64 {
        match self {
            Network::Testnet8 => 3_200,
            Network::Testnet9 | Network::Mainnet => 32_000,
        }
    }

    /// Stake amount in wei.
    #[must_use]
    pub fn stake_amount_wei(&self) -> u128 {
        u128::from(self.stake_amount()) * WEI_PER_COIN
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Network::ALL
            .into_iter()
            .find(|n| n.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| SupervisorError::Precondition(format!("unknown network: {s}")))
    }
}
