//! Orchestrates the channels of one remote participant.
//!
//! A [Client] is created when a participant registers. It owns the
//! participant's [Connection], serves its requests and answers the channel
//! backend's questions by asking the participant. Every signature and every
//! transaction is made by the participant, the server only keeps the
//! bookkeeping of which channels exist.

mod channel;
mod proposal;
mod request;
#[cfg(test)]
mod tests;

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    channel::{
        AdjudicatorEvent, AdjudicatorEventHandler, Asset, BackendError, Channel, ChannelBackend,
        InvalidBalances, Participant,
    },
    message::{Initialized, Message},
    server::Context,
    types::{Address, ChannelId, U256},
    wire::{Connection, ConnectionError, RequestHandler},
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("unsupported chain {0}")]
    UnsupportedChain(U256),
    #[error("unsupported asset {0}")]
    UnsupportedAsset(String),
    #[error(transparent)]
    InvalidBalances(#[from] InvalidBalances),
    #[error("unsupported channel topology: {0}")]
    UnsupportedTopology(String),
    #[error("peer not found")]
    PeerNotFound,
    #[error("channel {0} not found")]
    ChannelNotFound(ChannelId),
    #[error("hub not found")]
    HubNotFound,
    #[error("timeout: {0}")]
    Timeout(&'static str),
    #[error("{0}")]
    Rejected(String),
    #[error("peer did not create channel in time")]
    PeerChannelTimeout,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Run `fut` with a deadline, mapping expiry to [ClientError::Timeout].
async fn deadline<T, E, F>(timeout: Duration, what: &'static str, fut: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ClientError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res.map_err(Into::into),
        Err(_) => Err(ClientError::Timeout(what)),
    }
}

pub struct Client {
    me: Weak<Client>,
    participant: Participant,
    conn: Arc<Connection>,
    backend: Arc<dyn ChannelBackend>,
    ctx: Arc<Context>,
    channels: RwLock<HashMap<ChannelId, Arc<dyn Channel>>>,
}

impl Client {
    pub fn new(
        participant: Participant,
        conn: Arc<Connection>,
        backend: Arc<dyn ChannelBackend>,
        ctx: Arc<Context>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            participant,
            conn,
            backend,
            ctx,
            channels: RwLock::new(HashMap::new()),
        })
    }

    /// The locally generated identity of the participant.
    pub fn l2(&self) -> Address {
        self.participant.l2
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Serve the participant until its connection closes.
    pub async fn run(self: Arc<Self>) {
        let span = info_span!("client", l2 = %self.l2());
        async move {
            self.backend.handle(self.clone());

            let init = Message::Initialized(Initialized {
                l2_address: self.l2(),
            });
            if let Err(err) = self.conn.write(&init).await {
                warn!(%err, "sending Initialized");
            }
            if let Err(err) = self.conn.handle(self.clone()).await {
                warn!(%err, "connection failed");
            }
            self.shutdown().await;
        }
        .instrument(span)
        .await
    }

    /// Close the channel backend and the connection. Failures are only
    /// logged.
    pub async fn shutdown(&self) {
        if let Err(err) = self.backend.close().await {
            warn!(%err, "closing channel backend");
        }
        self.conn.close().await;
        debug!(l2 = %self.l2(), "client shut down");
    }

    fn arc(&self) -> Option<Arc<Self>> {
        self.me.upgrade()
    }

    pub fn channel(&self, id: &ChannelId) -> Option<Arc<dyn Channel>> {
        self.channels.read().get(id).cloned()
    }

    fn add_channel(&self, ch: Arc<dyn Channel>) {
        self.channels.write().insert(ch.id(), ch);
    }

    fn remove_channel(&self, id: &ChannelId) -> Option<Arc<dyn Channel>> {
        self.channels.write().remove(id)
    }

    /// Every asset must be configured for its chain.
    fn check_assets(&self, assets: &[Asset]) -> Result<(), ClientError> {
        let config = &self.ctx.config;
        for asset in assets {
            match asset {
                Asset::Ethereum { holder, chain_id } => {
                    config
                        .eth_chain(chain_id)
                        .ok_or(ClientError::UnsupportedChain(*chain_id))?;
                    config
                        .eth_asset(chain_id, holder)
                        .ok_or_else(|| ClientError::UnsupportedAsset(holder.to_string()))?;
                }
                Asset::Solana { mint } => {
                    config
                        .sol_asset(mint)
                        .ok_or_else(|| ClientError::UnsupportedAsset(mint.clone()))?;
                }
            }
        }
        Ok(())
    }

    /// Find a registered participant by one of its chain addresses, the
    /// Solana address wins if both are given.
    fn find_peer(&self, eth: &Address, sol: &str) -> Result<Arc<Client>, ClientError> {
        let registry = &self.ctx.registry;
        let mut peer = None;
        if !eth.is_zero() {
            peer = Some(registry.get(&eth.to_string()).ok_or(ClientError::PeerNotFound)?);
        }
        if !sol.is_empty() {
            peer = Some(registry.get(sol).ok_or(ClientError::PeerNotFound)?);
        }
        peer.ok_or(ClientError::PeerNotFound)
    }
}

#[async_trait]
impl RequestHandler for Client {
    async fn handle_request(&self, msg: Message) -> Message {
        let kind = msg.kind();
        debug!(kind, "request");
        match msg {
            Message::OpenChannel(req) => reply(self.open_channel(req).await),
            Message::UpdateChannel(req) => reply(self.update_channel(req).await),
            Message::CloseChannel(req) => reply(self.close_channel(req).await),
            Message::GetChannelInfo(req) => self.get_channel_info(req),
            Message::GetSignedState(req) => self.get_signed_state(req),
            Message::SendSignedState(state) => self.send_signed_state(state),
            Message::GetChains(_) => self.get_chains(),
            Message::GetAssets(req) => self.get_assets(req),
            Message::GetDecimals(req) => self.get_decimals(req).await,
            Message::GetTimeout(req) => self.get_timeout(req),
            Message::GetQuote(req) => self.get_quote(req).await,
            Message::GetHubBalance(req) => self.get_hub_balance(req).await,
            Message::GetBalance(req) => self.get_balance(req).await,
            Message::GetFunds(req) => self.get_funds(req),
            other => Message::error(format!("unexpected request: {}", other.kind())),
        }
    }
}

/// `Success`, or the error as seen by the participant.
fn reply(res: Result<(), ClientError>) -> Message {
    match res {
        Ok(()) => Message::success(),
        Err(err) => {
            debug!(%err, "request failed");
            Message::error(err)
        }
    }
}

#[async_trait]
impl AdjudicatorEventHandler for Client {
    async fn handle_adjudicator_event(&self, event: AdjudicatorEvent) {
        debug!(?event, "adjudicator event");
        let AdjudicatorEvent::Concluded { channel: id, .. } = event else {
            return;
        };
        // Already settled through CloseChannel.
        let Some(ch) = self.channel(&id) else {
            return;
        };
        let settle = ch.settle(true);
        if let Err(err) = deadline(self.ctx.config.timeouts.settle, "settling channel", settle).await {
            warn!(channel = %id, %err, "settling concluded channel");
            return;
        }
        if let Err(err) = ch.close().await {
            warn!(channel = %id, %err, "closing settled channel");
        }
        self.channel_closed(&id).await;
    }
}
