//! Messages exchanged with the remote participants.
//!
//! Every frame is a JSON object `{"type": <tag>, "message": <payload>}`.
//! Requests and responses wrap another message together with a correlation
//! id, everything else is a one-way notification. The set of message types is
//! closed, an unknown tag fails to decode.

mod state;
mod timeout;
mod transaction;

pub use state::ChannelState;
pub use timeout::TimeoutType;
pub use transaction::EthTransaction;

use serde::{Deserialize, Serialize};

use crate::{
    channel::{Asset, SignedState},
    config::{EthereumAssetConfig, SolanaAssetConfig},
    types::{Address, Bytes, ChannelId, ProposalId, Signature, U256},
};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("decoding message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("encoding message: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum::IntoStaticStr)]
#[serde(tag = "type", content = "message")]
pub enum Message {
    Request(Request),
    Response(Response),

    EthereumInitialize(EthereumInitialize),
    SolanaInitialize(SolanaInitialize),
    CrossContractInitialize(CrossContractInitialize),
    Initialized(Initialized),

    GetChains(GetChains),
    GetChainsResponse(GetChainsResponse),
    GetAssets(GetAssets),
    GetAssetsResponse(GetAssetsResponse),
    GetDecimals(GetDecimals),
    GetDecimalsResponse(GetDecimalsResponse),
    GetTimeout(GetTimeout),
    GetTimeoutResponse(GetTimeoutResponse),
    GetQuote(GetQuote),
    GetQuoteResponse(GetQuoteResponse),
    GetBalance(GetBalance),
    GetHubBalance(GetHubBalance),
    GetBalanceResponse(GetBalanceResponse),
    GetFunds(GetFunds),
    GetFundsResponse(GetFundsResponse),

    OpenChannel(OpenChannel),
    UpdateChannel(UpdateChannel),
    ChannelProposal(ChannelProposal),
    ProposalResponse(ProposalResponse),
    ChannelCreated(ChannelCreated),
    CloseChannel(CloseChannel),
    ChannelClosed(ChannelClosed),
    GetChannelInfo(GetChannelInfo),
    ChannelInfo(ChannelInfo),
    GetSignedState(GetSignedState),
    SignedState(SignedState),
    SendSignedState(SignedState),

    #[serde(rename = "SignETHData")]
    SignEthData(SignEthData),
    SignSolData(SignSolData),
    SignResponse(SignResponse),
    #[serde(rename = "SendETHTx")]
    SendEthTx(SendEthTx),
    #[serde(rename = "SendETHTxResponse")]
    SendEthTxResponse(SendEthTxResponse),
    SendSolTx(SendSolTx),
    SendSolTxResponse(SendSolTxResponse),

    Success(Success),
    FundingError(FundingError),
    Error(Error),
}

impl Message {
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        serde_json::from_str(text).map_err(CodecError::Decode)
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::Encode)
    }

    /// The type tag, for logging.
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    pub fn error(err: impl ToString) -> Self {
        Message::Error(Error { error: err.to_string() })
    }

    pub fn success() -> Self {
        Message::Success(Success {})
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub message: Box<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub message: Box<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthereumInitialize {
    pub client_address: Address,
    #[serde(default)]
    pub egoistic_client: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolanaInitialize {
    pub client_address: String,
    #[serde(default)]
    pub egoistic_client: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossContractInitialize {
    #[serde(default)]
    pub eth_client_address: Address,
    #[serde(default)]
    pub sol_client_address: String,
    #[serde(default)]
    pub egoistic_client: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Initialized {
    pub l2_address: Address,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GetChains {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub name: String,
    #[serde(rename = "ID")]
    pub id: U256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetChainsResponse {
    pub chains: Vec<ChainInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetAssets {
    #[serde(rename = "chainIDs")]
    pub chain_ids: Vec<U256>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAssetsResponse {
    pub ethereum_assets: Vec<EthereumAssetConfig>,
    pub solana_assets: Vec<SolanaAssetConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetDecimals {
    pub asset: Asset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetDecimalsResponse {
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTimeout {
    pub timeout_type: TimeoutType,
}

/// Timeout in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetTimeoutResponse {
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetQuote {
    pub from_asset: Asset,
    pub to_asset: Asset,
    pub hub: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetQuoteResponse {
    pub cross_quote: f64,
    pub from_quote: f64,
    pub to_quote: f64,
    pub from_gas: String,
    pub to_gas: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetBalance {
    pub asset: Asset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetHubBalance {
    pub asset: Asset,
    pub hub: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetBalanceResponse {
    pub balance: U256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetFunds {
    pub address: String,
    pub asset: String,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetFundsResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenChannel {
    #[serde(rename = "proposalID")]
    pub proposal_id: ProposalId,
    #[serde(default)]
    pub peer_address_eth: Address,
    #[serde(default)]
    pub peer_address_sol: String,
    pub challenge_duration: u64,
    pub state: ChannelState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateChannel {
    pub id: ChannelId,
    pub state: ChannelState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelProposal {
    #[serde(rename = "ID")]
    pub id: ProposalId,
    pub peer_address_eth: Address,
    pub peer_address_sol: String,
    pub state: ChannelState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reject_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCreated {
    pub id: ChannelId,
    #[serde(rename = "proposalID")]
    pub proposal_id: ProposalId,
    pub idx: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseChannel {
    pub id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdrawal_address: Option<String>,
    #[serde(default)]
    pub force_close: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelClosed {
    pub id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetChannelInfo {
    pub id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub peer_address_eth: Address,
    pub peer_address_sol: String,
    pub state: ChannelState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetSignedState {
    pub id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignEthData {
    pub address: Address,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignSolData {
    pub address: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignResponse {
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendEthTx {
    pub transaction: Option<EthTransaction>,
    #[serde(rename = "chainID")]
    pub chain_id: U256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendEthTxResponse {
    pub transaction: Option<EthTransaction>,
}

/// Solana transactions are opaque to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendSolTx {
    pub transaction: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendSolTxResponse {
    pub transaction: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Success {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingError {
    #[serde(rename = "proposalID")]
    pub proposal_id: ProposalId,
    #[serde(rename = "channelID")]
    pub channel_id: ChannelId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    pub error: String,
}
