use std::{sync::Arc, time::Duration};

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{deadline, Client, ClientError};
use crate::{
    channel::{Channel, LedgerChannelProposal, PARTICIPANTS},
    message::{
        ChannelClosed, ChannelCreated, CloseChannel, FundingError, Message, OpenChannel,
        UpdateChannel,
    },
    types::{Address, ChannelId, ProposalId},
};

/// How often the peer is checked for its end of a new channel.
pub(crate) const PEER_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How long the peer gets to create its end of a new channel.
pub(crate) const PEER_CREATE_TIMEOUT: Duration = Duration::from_secs(60);

impl Client {
    pub(super) async fn open_channel(&self, req: OpenChannel) -> Result<(), ClientError> {
        self.check_assets(&req.state.assets)?;
        // The proposer is always participant 0.
        let alloc = req.state.allocation(0)?;
        let peer = self.find_peer(&req.peer_address_eth, &req.peer_address_sol)?;

        let proposal = LedgerChannelProposal::new(
            &mut rand::thread_rng(),
            req.proposal_id,
            req.challenge_duration,
            alloc,
            self.participant.clone(),
            peer.l2(),
        );
        let timeouts = &self.ctx.config.timeouts;
        let opened = deadline(
            timeouts.handle + timeouts.fund,
            "proposing channel",
            self.backend.propose_channel(proposal),
        )
        .await;
        self.channel_created(req.proposal_id, opened).await
    }

    pub(super) async fn update_channel(&self, req: UpdateChannel) -> Result<(), ClientError> {
        let ch = self.channel(&req.id).ok_or(ClientError::ChannelNotFound(req.id))?;
        let mut next = ch.state().make_next_state();
        next.outcome.balances = req.state.balances(ch.idx())?;
        next.is_final = req.state.is_final;
        deadline(self.ctx.config.timeouts.handle, "updating channel", ch.update(next)).await
    }

    pub(super) async fn close_channel(&self, req: CloseChannel) -> Result<(), ClientError> {
        let ch = self.channel(&req.id).ok_or(ClientError::ChannelNotFound(req.id))?;
        if let Some(addr) = req.withdrawal_address.as_deref().filter(|a| !a.is_empty()) {
            let receiver: Address = addr
                .parse()
                .map_err(|_| ClientError::Rejected(format!("invalid withdrawal address {addr}")))?;
            ch.set_withdrawal_receiver(receiver);
        }

        let timeouts = &self.ctx.config.timeouts;
        let current = ch.state();
        if !req.force_close && !current.is_final {
            let mut last = current.make_next_state();
            last.is_final = true;
            deadline(timeouts.handle, "finalizing channel", ch.update(last)).await?;
        }

        info!(channel = %req.id, "settling channel");
        deadline(timeouts.settle, "settling channel", ch.settle(false)).await?;
        ch.close().await?;
        self.channel_closed(&req.id).await;
        Ok(())
    }

    /// Track a channel the backend opened, or report why it did not.
    ///
    /// Returns once the peer has its end of the channel too, so both sides
    /// learn about the channel at about the same time.
    pub(super) async fn channel_created(
        &self,
        proposal_id: ProposalId,
        opened: Result<Arc<dyn Channel>, ClientError>,
    ) -> Result<(), ClientError> {
        let ch = match opened {
            Ok(ch) => ch,
            Err(err) => {
                let channel_id = match &err {
                    ClientError::Backend(err) => err.channel_id(),
                    _ => None,
                };
                self.funding_error(proposal_id, channel_id.unwrap_or_default(), &err)
                    .await;
                return Err(err);
            }
        };

        let id = ch.id();
        info!(channel = %id, idx = ch.idx(), "channel created");
        self.add_channel(ch.clone());
        if let Some(client) = self.arc() {
            let ch = ch.clone();
            tokio::spawn(async move {
                let res = ch.watch(client).await;
                debug!(channel = %ch.id(), ?res, "watcher returned");
            });
        }

        let params = ch.params();
        if params.participants.len() != PARTICIPANTS {
            return Err(ClientError::UnsupportedTopology(format!(
                "{} participants",
                params.participants.len()
            )));
        }
        let peer_l2 = params.participants[1 - ch.idx()].l2;
        let Some(peer) = self.ctx.registry.get(&peer_l2.to_string()) else {
            warn!(channel = %id, "peer left before confirming the channel");
            return Err(ClientError::PeerNotFound);
        };

        let until = Instant::now() + PEER_CREATE_TIMEOUT;
        let mut tick = interval(PEER_POLL_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if peer.channel(&id).is_some() {
                break;
            }
            if Instant::now() >= until {
                warn!(channel = %id, "timeout waiting for peer to create channel");
                self.funding_error(proposal_id, id, &ClientError::PeerChannelTimeout)
                    .await;
                return Err(ClientError::PeerChannelTimeout);
            }
        }

        let created = Message::ChannelCreated(ChannelCreated {
            id,
            proposal_id,
            idx: ch.idx(),
        });
        if let Err(err) = self.conn.write(&created).await {
            warn!(channel = %id, %err, "sending ChannelCreated");
        }
        Ok(())
    }

    async fn funding_error(&self, proposal_id: ProposalId, channel_id: ChannelId, err: &ClientError) {
        let msg = Message::FundingError(FundingError {
            proposal_id,
            channel_id,
            error: err.to_string(),
        });
        if let Err(err) = self.conn.write(&msg).await {
            warn!(%err, "sending FundingError");
        }
    }

    /// Forget a settled channel and tell the participant. Only the first call
    /// for a channel notifies.
    pub(super) async fn channel_closed(&self, id: &ChannelId) {
        if self.remove_channel(id).is_none() {
            return;
        }
        info!(channel = %id, "channel closed");
        let closed = Message::ChannelClosed(ChannelClosed { id: *id });
        if let Err(err) = self.conn.write(&closed).await {
            warn!(channel = %id, %err, "sending ChannelClosed");
        }
    }
}
