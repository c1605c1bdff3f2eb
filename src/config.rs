//! Server configuration: operation timeouts, gas limits and the chains and
//! assets the server accepts.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    message::TimeoutType,
    types::{Address, U256},
};

/// Gas limit used for deposits when predefined gas limits are enabled.
pub const DEPOSIT_GAS_LIMIT: u64 = 300_000;
/// Gas limit used for withdrawals when predefined gas limits are enabled.
pub const WITHDRAW_GAS_LIMIT: u64 = 400_000;
/// Decimals reported for Solana assets without a configured value.
pub const DEFAULT_SOLANA_DECIMALS: u8 = 9;
/// Decimals of native Ether.
pub const ETH_DECIMALS: u8 = 18;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("duplicate chain id {0}")]
    DuplicateChain(U256),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub timeouts: Timeouts,
    pub tx_finality_depth: u64,
    pub predefined_gas_limit: bool,
    pub ethereum: Vec<EthereumChain>,
    pub solana: Vec<SolanaChain>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(with = "secs")]
    pub default: Duration,
    #[serde(with = "secs")]
    pub handle: Duration,
    #[serde(with = "secs")]
    pub fund: Duration,
    #[serde(with = "secs")]
    pub settle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(60),
            handle: Duration::from_secs(300),
            fund: Duration::from_secs(600),
            settle: Duration::from_secs(600),
        }
    }
}

impl Timeouts {
    pub fn get(&self, kind: TimeoutType) -> Duration {
        match kind {
            TimeoutType::Default => self.default,
            TimeoutType::Handle => self.handle,
            TimeoutType::Funding => self.fund,
            TimeoutType::Settle => self.settle,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthereumChain {
    pub name: String,
    #[serde(rename = "chainID")]
    pub chain_id: U256,
    #[serde(default)]
    pub node_url: String,
    #[serde(default)]
    pub adjudicator: Address,
    #[serde(default)]
    pub assets: Vec<EthereumAssetConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EthereumAssetType {
    #[serde(rename = "ETH")]
    Eth,
    #[serde(rename = "ERC20")]
    Erc20,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthereumAssetConfig {
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub asset_type: EthereumAssetType,
    /// Token contract, zero for native Ether.
    #[serde(default)]
    pub address: Address,
    pub asset_holder: Address,
    /// Decimals the token contract reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolanaChain {
    pub name: String,
    #[serde(rename = "chainID")]
    pub chain_id: U256,
    #[serde(default)]
    pub node_url: String,
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub assets: Vec<SolanaAssetConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolanaAssetType {
    #[serde(rename = "SOL")]
    Sol,
    #[serde(rename = "SPL")]
    Spl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolanaAssetConfig {
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub asset_type: SolanaAssetType,
    pub mint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u8>,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = Vec::new();
        for id in self.ethereum.iter().map(|c| c.chain_id) {
            if seen.contains(&id) {
                return Err(ConfigError::DuplicateChain(id));
            }
            seen.push(id);
        }
        Ok(())
    }

    pub fn eth_chain(&self, chain_id: &U256) -> Option<&EthereumChain> {
        self.ethereum.iter().find(|c| &c.chain_id == chain_id)
    }

    pub fn eth_asset(&self, chain_id: &U256, holder: &Address) -> Option<&EthereumAssetConfig> {
        self.eth_chain(chain_id)?
            .assets
            .iter()
            .find(|a| &a.asset_holder == holder)
    }

    pub fn sol_asset(&self, mint: &str) -> Option<&SolanaAssetConfig> {
        self.solana
            .iter()
            .flat_map(|c| c.assets.iter())
            .find(|a| a.mint == mint)
    }

    /// Gas limit for a deposit, zero means the limit is estimated.
    pub fn deposit_gas_limit(&self) -> u64 {
        if self.predefined_gas_limit {
            DEPOSIT_GAS_LIMIT
        } else {
            0
        }
    }

    pub fn withdraw_gas_limit(&self) -> u64 {
        if self.predefined_gas_limit {
            WITHDRAW_GAS_LIMIT
        } else {
            0
        }
    }
}
