use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::{deadline, Client, ClientError};
use crate::{
    channel::{
        ChannelProposal, ChannelUpdate, LedgerChannelProposal, ProposalHandler, ProposalResponder,
        State, UpdateResponder, PARTICIPANTS,
    },
    message::{self, ChannelState, Message, ProposalResponse, UpdateChannel},
    wire::ConnectionError,
};

impl Client {
    /// Ask the participant about a proposal. Returns the reject reason if
    /// it declined.
    async fn ask_proposal(&self, prop: &LedgerChannelProposal) -> Result<Option<String>, ClientError> {
        let proposer = &prop.participant;
        // The receiver is participant 1.
        let req = Message::ChannelProposal(message::ChannelProposal {
            id: prop.proposal_id,
            peer_address_eth: proposer.eth.unwrap_or_default(),
            peer_address_sol: proposer.sol.clone().unwrap_or_default(),
            state: ChannelState::new_oriented(&prop.init_bals, 1, false),
        });
        let resp = self
            .conn
            .request_timeout(req, self.ctx.config.timeouts.fund, "answering proposal")
            .await?;
        proposal_answer(resp)
    }

    async fn ask_update(&self, update: &ChannelUpdate, idx: usize) -> Result<Option<String>, ClientError> {
        let req = Message::UpdateChannel(UpdateChannel {
            id: update.state.channel_id(),
            state: ChannelState::new(&update.state, idx),
        });
        let resp = self
            .conn
            .request_timeout(req, self.ctx.config.timeouts.default, "answering update")
            .await?;
        proposal_answer(resp)
    }

    async fn handle_ledger_proposal(
        &self,
        prop: LedgerChannelProposal,
        responder: Box<dyn ProposalResponder>,
    ) -> Result<(), ClientError> {
        if let Err(err) = self.check_assets(&prop.init_bals.assets) {
            debug!(%err, "rejecting proposal");
            responder.reject(err.to_string()).await?;
            return Ok(());
        }

        let fund = self.ctx.config.timeouts.fund;
        match self.ask_proposal(&prop).await? {
            None => {
                let acc = prop.accept(&mut rand::thread_rng(), self.participant.clone());
                let opened = deadline(fund, "funding channel", responder.accept(acc)).await;
                self.channel_created(prop.proposal_id, opened).await
            }
            Some(reason) => {
                deadline(fund, "rejecting proposal", responder.reject(reason)).await
            }
        }
    }
}

/// `None` if accepted, the reason otherwise.
fn proposal_answer(resp: Message) -> Result<Option<String>, ClientError> {
    match resp {
        Message::ProposalResponse(ProposalResponse {
            accepted: true, ..
        }) => Ok(None),
        Message::ProposalResponse(ProposalResponse { reject_reason, .. }) => Ok(Some(reject_reason)),
        other => Err(ConnectionError::unexpected("ProposalResponse", other).into()),
    }
}

#[async_trait]
impl ProposalHandler for Client {
    async fn handle_proposal(&self, proposal: ChannelProposal, responder: Box<dyn ProposalResponder>) {
        let prop = match proposal {
            ChannelProposal::Ledger(prop) if prop.peers.len() == PARTICIPANTS => prop,
            ChannelProposal::Ledger(prop) => {
                let err = ClientError::UnsupportedTopology(format!("{} peers", prop.peers.len()));
                error!(%err, "channel proposal");
                self.conn.close_with_error(err).await;
                return;
            }
            ChannelProposal::Virtual { proposal_id, .. } => {
                let err = ClientError::UnsupportedTopology("virtual channel".into());
                error!(%err, proposal = %proposal_id, "channel proposal");
                self.conn.close_with_error(err).await;
                return;
            }
        };

        let proposal_id = prop.proposal_id;
        if let Err(err) = self.handle_ledger_proposal(prop, responder).await {
            warn!(proposal = %proposal_id, %err, "handling channel proposal");
        }
    }

    async fn handle_update(
        &self,
        _current: State,
        update: ChannelUpdate,
        responder: Box<dyn UpdateResponder>,
    ) {
        let res = async {
            let ch = self
                .channel(&update.state.channel_id())
                .ok_or(ClientError::ChannelNotFound(update.state.channel_id()))?;
            if ch.params().participants.len() != PARTICIPANTS {
                return Err(ClientError::UnsupportedTopology(format!(
                    "{} participants",
                    ch.params().participants.len()
                )));
            }

            let timeout = self.ctx.config.timeouts.default;
            match self.ask_update(&update, ch.idx()).await? {
                None => deadline(timeout, "accepting update", responder.accept()).await,
                Some(reason) => deadline(timeout, "rejecting update", responder.reject(reason)).await,
            }
        }
        .await;

        // A peer waiting for an answer that never comes stalls the channel.
        if let Err(err) = res {
            error!(%err, "handling channel update, closing connection");
            self.conn.close_with_error(err).await;
        }
    }
}
