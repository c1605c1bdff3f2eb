//! Contract between the Orchestrator and the channel protocol engine.
//!
//! A [Ledger] is shared by the whole process and hands out one
//! [ChannelBackend] per connected participant. The backend runs proposals,
//! funding and disputes and calls back into the Orchestrator through
//! [ProposalHandler] for decisions only the remote participant can make.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use super::{
    Asset, ChannelProposal, ChannelUpdate, LedgerChannelProposal, LedgerChannelProposalAcc,
    Params, Participant, PartIdx, Phase, SignedState, State,
};
use crate::{
    types::{Address, ChannelId, U256},
    wallet::{RemoteWallet, WalletError},
    wire::ConnectionError,
};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("funding channel {channel}: {reason}")]
    Funding { channel: ChannelId, reason: String },
    #[error("invalid update: {0}")]
    InvalidUpdate(#[from] super::InvalidUpdate),
    #[error("invalid signature from participant {0}")]
    Signature(PartIdx),
    #[error("peer {0} not reachable")]
    PeerUnreachable(Address),
    #[error("channel {0} is not open")]
    NotOpen(ChannelId),
    #[error("channel {0} is not concluded")]
    NotConcluded(ChannelId),
    #[error("no {0:?} account")]
    MissingAccount(super::BackendId),
    #[error("unknown token {0}")]
    UnknownToken(Address),
    #[error("backend closed")]
    Closed,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
}

impl BackendError {
    /// Channel a failure happened on, if the channel exists already.
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            BackendError::Funding { channel, .. }
            | BackendError::NotOpen(channel)
            | BackendError::NotConcluded(channel) => Some(*channel),
            _ => None,
        }
    }
}

/// Events of the on-chain adjudicator concerning one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdjudicatorEvent {
    /// A (possibly non-final) state was registered, starting a dispute.
    Registered {
        channel: ChannelId,
        version: u64,
        timeout: Duration,
    },
    /// The channel was concluded, funds can be withdrawn.
    Concluded { channel: ChannelId, version: u64 },
}

impl AdjudicatorEvent {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            AdjudicatorEvent::Registered { channel, .. }
            | AdjudicatorEvent::Concluded { channel, .. } => *channel,
        }
    }
}

/// Process-wide access to the chains: hands out per-participant backends and
/// answers balance queries.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Attach a participant. Its wallet signs and sends all transactions of
    /// the returned backend.
    fn connect(
        &self,
        participant: Participant,
        wallet: RemoteWallet,
    ) -> Result<Arc<dyn ChannelBackend>, BackendError>;

    async fn token_decimals(&self, chain_id: &U256, token: &Address) -> Result<u8, BackendError>;

    async fn balance(&self, asset: &Asset, owner: &Participant) -> Result<U256, BackendError>;
}

/// Channel protocol engine of one participant.
#[async_trait]
pub trait ChannelBackend: Send + Sync {
    /// Propose, then fund. Returns when the channel is open.
    async fn propose_channel(
        &self,
        proposal: LedgerChannelProposal,
    ) -> Result<Arc<dyn Channel>, BackendError>;

    /// Install the receiver of inbound proposals and updates.
    fn handle(&self, handler: Arc<dyn ProposalHandler>);

    async fn close(&self) -> Result<(), BackendError>;
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;
    fn idx(&self) -> PartIdx;
    fn params(&self) -> Params;
    fn state(&self) -> State;
    fn phase(&self) -> Phase;
    /// Latest state with the signatures of all participants.
    fn signed_state(&self) -> SignedState;

    /// Propose `next` to the peer, applied once both signed it.
    async fn update(&self, next: State) -> Result<(), BackendError>;

    /// Conclude the channel on-chain and withdraw. A non-final state is
    /// disputed first. `secondary` is set when reacting to a conclusion
    /// started by the peer.
    async fn settle(&self, secondary: bool) -> Result<(), BackendError>;

    /// Receiver of withdrawn Ethereum funds, defaults to the signing account.
    fn set_withdrawal_receiver(&self, receiver: Address);

    /// Feed adjudicator events to `handler` until the channel is closed.
    async fn watch(&self, handler: Arc<dyn AdjudicatorEventHandler>) -> Result<(), BackendError>;

    /// Release local resources. The channel can not be used afterwards.
    async fn close(&self) -> Result<(), BackendError>;
}

#[async_trait]
pub trait AdjudicatorEventHandler: Send + Sync {
    async fn handle_adjudicator_event(&self, event: AdjudicatorEvent);
}

#[async_trait]
pub trait ProposalHandler: Send + Sync {
    async fn handle_proposal(&self, proposal: ChannelProposal, responder: Box<dyn ProposalResponder>);
    async fn handle_update(
        &self,
        current: State,
        update: ChannelUpdate,
        responder: Box<dyn UpdateResponder>,
    );
}

#[async_trait]
pub trait ProposalResponder: Send {
    /// Accept and wait until the channel is funded.
    async fn accept(
        self: Box<Self>,
        acc: LedgerChannelProposalAcc,
    ) -> Result<Arc<dyn Channel>, BackendError>;
    async fn reject(self: Box<Self>, reason: String) -> Result<(), BackendError>;
}

#[async_trait]
pub trait UpdateResponder: Send {
    async fn accept(self: Box<Self>) -> Result<(), BackendError>;
    async fn reject(self: Box<Self>, reason: String) -> Result<(), BackendError>;
}
