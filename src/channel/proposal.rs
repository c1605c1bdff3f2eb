use rand::Rng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

use super::{Allocation, Params, Participant, State};
use crate::types::{Address, Bytes32, ChannelId, ProposalId, U256};

/// The nonce added by each participant.
///
/// They are combined into a single [U256] using SHA3-256.
pub type NonceShare = Bytes32;

/// Proposal for a two-party ledger channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerChannelProposal {
    pub proposal_id: ProposalId,
    pub challenge_duration: u64,
    pub nonce_share: NonceShare,
    pub init_bals: Allocation,
    /// Accounts of the proposer.
    pub participant: Participant,
    /// L2 addresses of proposer and receiver, in this order.
    pub peers: Vec<Address>,
}

/// Response to accept a [LedgerChannelProposal].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerChannelProposalAcc {
    pub proposal_id: ProposalId,
    pub nonce_share: NonceShare,
    pub participant: Participant,
}

impl LedgerChannelProposal {
    pub fn new<R: Rng>(
        rng: &mut R,
        proposal_id: ProposalId,
        challenge_duration: u64,
        init_bals: Allocation,
        participant: Participant,
        receiver: Address,
    ) -> Self {
        let peers = vec![participant.l2, receiver];
        Self {
            proposal_id,
            challenge_duration,
            nonce_share: rng.gen(),
            init_bals,
            participant,
            peers,
        }
    }

    pub fn accept<R: Rng>(&self, rng: &mut R, participant: Participant) -> LedgerChannelProposalAcc {
        LedgerChannelProposalAcc {
            proposal_id: self.proposal_id,
            nonce_share: rng.gen(),
            participant,
        }
    }

    /// Parameters and initial state once `acc` has been received.
    pub fn build(&self, acc: &LedgerChannelProposalAcc) -> (Params, State) {
        // Go-Perun does NOT use keccak256 here, probably to be less dependent
        // on Ethereum. We do the same here.
        let mut hasher = Sha3_256::new();
        hasher.update(self.nonce_share.0);
        hasher.update(acc.nonce_share.0);
        let nonce = U256::from_big_endian(hasher.finalize().as_slice());

        let params = Params {
            challenge_duration: self.challenge_duration,
            nonce,
            participants: vec![self.participant.clone(), acc.participant.clone()],
            ledger_channel: true,
            virtual_channel: false,
        };
        let init_state = State::new(&params, self.init_bals.clone());
        (params, init_state)
    }
}

/// A proposal as delivered to the receiving participant.
///
/// Only two-party ledger channels are run by the server, other topologies
/// are surfaced so the receiver can refuse them.
#[derive(Debug, Clone)]
pub enum ChannelProposal {
    Ledger(LedgerChannelProposal),
    Virtual { proposal_id: ProposalId, parents: Vec<ChannelId> },
}

impl ChannelProposal {
    pub fn proposal_id(&self) -> ProposalId {
        match self {
            ChannelProposal::Ledger(p) => p.proposal_id,
            ChannelProposal::Virtual { proposal_id, .. } => *proposal_id,
        }
    }
}

/// Update of a channel proposed by participant `actor_idx`.
#[derive(Debug, Clone)]
pub struct ChannelUpdate {
    pub state: State,
    pub actor_idx: super::PartIdx,
}
