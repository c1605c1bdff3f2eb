//! Channel parameters, states and allocations of two-party ledger channels
//! spanning assets on multiple chains.

use serde::{Deserialize, Serialize};

use crate::{
    hashing::{self, Encode, Keccak256Writer},
    types::{Address, ChannelId, Hash, Signature, U256},
};

/// Number of participants of a ledger channel.
pub const PARTICIPANTS: usize = 2;

/// Index of a participant in the channel, `0` is the proposer.
pub type PartIdx = usize;

/// Chain family an asset lives on, numbered like the backend ids of the
/// participants' wallets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendId {
    Ethereum,
    Solana,
}

impl BackendId {
    pub const fn id(self) -> u32 {
        match self {
            BackendId::Ethereum => 1,
            BackendId::Solana => 6,
        }
    }
}

impl TryFrom<u32> for BackendId {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(BackendId::Ethereum),
            6 => Ok(BackendId::Solana),
            other => Err(other),
        }
    }
}

impl Serialize for BackendId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u32(self.id())
    }
}

impl<'de> Deserialize<'de> for BackendId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let id = u32::deserialize(d)?;
        BackendId::try_from(id)
            .map_err(|id| serde::de::Error::custom(format!("unknown backend id {id}")))
    }
}

/// Uniquely identifies an asset by its chain and holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "assetType")]
pub enum Asset {
    Ethereum {
        #[serde(rename = "assetHolder")]
        holder: Address,
        #[serde(rename = "chainID")]
        chain_id: U256,
    },
    Solana {
        mint: String,
    },
}

impl Asset {
    pub fn backend(&self) -> BackendId {
        match self {
            Asset::Ethereum { .. } => BackendId::Ethereum,
            Asset::Solana { .. } => BackendId::Solana,
        }
    }
}

impl Encode for Asset {
    fn encode(&self, w: &mut Keccak256Writer) {
        w.write_u64(self.backend().id() as u64);
        match self {
            Asset::Ethereum { holder, chain_id } => {
                w.write_u256(*chain_id);
                w.write_address(holder);
            }
            Asset::Solana { mint } => w.write_bytes(mint.as_bytes()),
        }
    }
}

/// A channel participant: its L2 identity plus the on-chain accounts it
/// funds and signs with.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub l2: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sol: Option<String>,
}

impl Participant {
    pub fn has_account(&self, backend: BackendId) -> bool {
        match backend {
            BackendId::Ethereum => self.eth.is_some(),
            BackendId::Solana => self.sol.is_some(),
        }
    }
}

impl Encode for Participant {
    fn encode(&self, w: &mut Keccak256Writer) {
        w.write_address(&self.l2);
        w.write_address(&self.eth.unwrap_or_default());
        w.write_bytes(self.sol.as_deref().unwrap_or_default().as_bytes());
    }
}

/// Parameters for this channel, fixed when the proposal is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Params {
    pub challenge_duration: u64,
    pub nonce: U256,
    pub participants: Vec<Participant>,
    pub ledger_channel: bool,
    pub virtual_channel: bool,
}

impl Params {
    pub fn channel_id(&self) -> ChannelId {
        hashing::to_hash(self)
    }
}

impl Encode for Params {
    fn encode(&self, w: &mut Keccak256Writer) {
        w.write_u64(self.challenge_duration);
        w.write_u256(self.nonce);
        w.write_list(&self.participants);
        w.write_bool(self.ledger_channel);
        w.write_bool(self.virtual_channel);
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidBalances {
    #[error("balances have different lengths")]
    LengthMismatch,
    #[error("backend ids do not match the assets")]
    BackendMismatch,
    #[error("{balances} balances for {assets} assets")]
    AssetCount { assets: usize, balances: usize },
}

/// Balances per asset per participant, `balances[asset][participant]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub assets: Vec<Asset>,
    pub balances: Vec<Vec<U256>>,
}

impl Allocation {
    pub fn new(assets: Vec<Asset>, balances: Vec<Vec<U256>>) -> Result<Self, InvalidBalances> {
        if assets.len() != balances.len() {
            return Err(InvalidBalances::AssetCount {
                assets: assets.len(),
                balances: balances.len(),
            });
        }
        if balances.iter().any(|b| b.len() != PARTICIPANTS) {
            return Err(InvalidBalances::LengthMismatch);
        }
        Ok(Self { assets, balances })
    }

    pub fn backends(&self) -> Vec<BackendId> {
        self.assets.iter().map(Asset::backend).collect()
    }

    pub fn total_assets(&self) -> Vec<U256> {
        self.balances
            .iter()
            .map(|b| b.iter().fold(U256::zero(), |acc, v| acc.saturating_add(*v)))
            .collect()
    }

    /// Split into the balances of `idx` and those of the other participant.
    pub fn oriented(&self, idx: PartIdx) -> (Vec<U256>, Vec<U256>) {
        let peer = 1 - idx;
        self.balances
            .iter()
            .map(|b| (b[idx], b[peer]))
            .unzip()
    }
}

impl Encode for Allocation {
    fn encode(&self, w: &mut Keccak256Writer) {
        w.write_list(&self.assets);
        w.write_list(&self.balances);
    }
}

/// Build per-asset balances from the view of participant `idx`.
pub fn make_balances(
    mine: &[U256],
    peer: &[U256],
    idx: PartIdx,
) -> Result<Vec<Vec<U256>>, InvalidBalances> {
    if mine.len() != peer.len() {
        return Err(InvalidBalances::LengthMismatch);
    }
    Ok(mine
        .iter()
        .zip(peer)
        .map(|(m, p)| if idx == 0 { vec![*m, *p] } else { vec![*p, *m] })
        .collect())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidUpdate {
    #[error("update is for a different channel")]
    InvalidChannelId,
    #[error("current state is final")]
    CurrentStateIsFinal,
    #[error("version must increase by one")]
    InvalidVersionNumber,
    #[error("assets of the update do not match")]
    AssetsMismatch,
    #[error("update changes the total amount of funds")]
    TotalAllocationAmountMismatch,
    #[error(transparent)]
    Balances(#[from] InvalidBalances),
}

/// Stores the complete state of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    id: ChannelId,
    version: u64,
    pub outcome: Allocation,
    pub is_final: bool,
}

impl State {
    pub fn new(params: &Params, init_bals: Allocation) -> Self {
        State {
            id: params.channel_id(),
            version: 0,
            outcome: init_bals,
            is_final: false,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Create a new state that will replace this state.
    ///
    /// Id and version are private so a successor can only be made through
    /// here.
    pub fn make_next_state(&self) -> Self {
        State {
            id: self.id,
            version: self.version + 1,
            outcome: self.outcome.clone(),
            is_final: self.is_final,
        }
    }

    pub fn check_valid_transition(&self, new_state: &State) -> Result<(), InvalidUpdate> {
        if new_state.channel_id() != self.channel_id() {
            Err(InvalidUpdate::InvalidChannelId)
        } else if self.is_final {
            Err(InvalidUpdate::CurrentStateIsFinal)
        } else if new_state.version() != self.version() + 1 {
            Err(InvalidUpdate::InvalidVersionNumber)
        } else if new_state.outcome.assets != self.outcome.assets {
            Err(InvalidUpdate::AssetsMismatch)
        } else if new_state.outcome.total_assets() != self.outcome.total_assets() {
            Err(InvalidUpdate::TotalAllocationAmountMismatch)
        } else {
            Ok(())
        }
    }

    /// Hash signed by the participants.
    pub fn hash(&self) -> Hash {
        hashing::to_hash(self)
    }
}

impl Encode for State {
    fn encode(&self, w: &mut Keccak256Writer) {
        w.write_hash(&self.id);
        w.write_u64(self.version);
        self.outcome.encode(w);
        w.write_bool(self.is_final);
    }
}

/// A state together with the signatures of all participants, enough to
/// enforce it on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedState {
    pub params: Params,
    pub state: State,
    pub sigs: Vec<Signature>,
}

impl SignedState {
    pub fn is_complete(&self) -> bool {
        self.sigs.len() == self.params.participants.len()
            && self.sigs.iter().all(|s| !s.is_empty())
            && self.state.channel_id() == self.params.channel_id()
    }
}
