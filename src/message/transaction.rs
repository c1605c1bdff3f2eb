use serde::{Deserialize, Serialize};

use crate::types::{Address, Bytes, Signature, U256};

/// An Ethereum transaction prepared by the server and signed and sent by the
/// remote participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthTransaction {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub nonce: u64,
    /// Zero lets the remote wallet estimate.
    pub gas_limit: u64,
    pub data: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<crate::types::Hash>,
}

impl EthTransaction {
    pub fn is_signed(&self) -> bool {
        self.signature.as_ref().is_some_and(|s| !s.is_empty())
    }
}
