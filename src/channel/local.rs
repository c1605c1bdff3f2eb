//! Channel backend that runs both ends of every channel inside this process.
//!
//! Participants connected to the same [LocalNetwork] reach each other
//! directly, without a peer-to-peer transport. Everything that needs a key
//! (state signatures and transactions) still goes through the participant's
//! [RemoteWallet], and funds move on a [SimulatedChain].

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use futures::future::try_join;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast::error::RecvError, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    AdjudicatorEvent, AdjudicatorEventHandler, Allocation, Asset, BackendError, BackendId, Channel,
    ChannelBackend, ChannelProposal, ChannelUpdate, Ledger, LedgerChannelProposal,
    LedgerChannelProposalAcc, Params, Participant, PartIdx, Phase, ProposalHandler,
    ProposalResponder, SignedState, SimulatedChain, State, UpdateResponder, PARTICIPANTS,
};
use crate::{
    config::{Config, EthereumAssetType, ETH_DECIMALS},
    hashing::{keccak256, Keccak256Writer},
    message::EthTransaction,
    sig::recover_signer,
    types::{Address, Bytes, ChannelId, Hash, Signature, U256},
    wallet::RemoteWallet,
};

struct Shared {
    chain: Arc<SimulatedChain>,
    config: Arc<Config>,
    nodes: RwLock<HashMap<Address, Weak<LocalNode>>>,
}

impl Shared {
    fn node(&self, l2: &Address) -> Option<Arc<LocalNode>> {
        self.nodes.read().get(l2).and_then(Weak::upgrade)
    }
}

/// All participants of this process and the chain they settle on.
#[derive(Clone)]
pub struct LocalNetwork {
    shared: Arc<Shared>,
}

impl LocalNetwork {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            shared: Arc::new(Shared {
                chain: Arc::new(SimulatedChain::default()),
                config,
                nodes: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn chain(&self) -> &Arc<SimulatedChain> {
        &self.shared.chain
    }
}

#[async_trait]
impl Ledger for LocalNetwork {
    fn connect(
        &self,
        participant: Participant,
        wallet: RemoteWallet,
    ) -> Result<Arc<dyn ChannelBackend>, BackendError> {
        let l2 = participant.l2;
        let node = Arc::new_cyclic(|me| LocalNode {
            me: me.clone(),
            shared: self.shared.clone(),
            participant,
            wallet,
            handler: RwLock::new(None),
            channels: Mutex::new(HashMap::new()),
        });
        self.shared.nodes.write().insert(l2, Arc::downgrade(&node));
        debug!(%l2, "participant connected");
        Ok(node)
    }

    async fn token_decimals(&self, chain_id: &U256, token: &Address) -> Result<u8, BackendError> {
        self.shared
            .config
            .eth_chain(chain_id)
            .and_then(|chain| {
                chain
                    .assets
                    .iter()
                    .find(|a| a.asset_type == EthereumAssetType::Erc20 && &a.address == token)
            })
            .map(|a| a.decimals.unwrap_or(ETH_DECIMALS))
            .ok_or(BackendError::UnknownToken(*token))
    }

    async fn balance(&self, asset: &Asset, owner: &Participant) -> Result<U256, BackendError> {
        let owner = owner_of(asset, owner)?;
        Ok(self.shared.chain.balance(asset, &owner))
    }
}

/// On-chain account of `part` that holds `asset`.
fn owner_of(asset: &Asset, part: &Participant) -> Result<String, BackendError> {
    match asset {
        Asset::Ethereum { .. } => part
            .eth
            .map(|a| a.to_string())
            .ok_or(BackendError::MissingAccount(BackendId::Ethereum)),
        Asset::Solana { .. } => part
            .sol
            .clone()
            .ok_or(BackendError::MissingAccount(BackendId::Solana)),
    }
}

/// Identifies the deposit of one participant into one channel.
fn funding_id(channel: ChannelId, part: &Address) -> Hash {
    let mut w = Keccak256Writer::default();
    w.write_hash(&channel);
    w.write_address(part);
    Hash(w.finalize().into())
}

fn address_slot(addr: &Address) -> [u8; 32] {
    let mut slot = [0u8; 32];
    slot[12..].copy_from_slice(&addr.0);
    slot
}

fn calldata(slots: &[[u8; 32]]) -> Bytes {
    Bytes(slots.concat())
}

/// States are signed with the account of the chain the first asset lives on.
fn signing_backend(state: &State) -> BackendId {
    state
        .outcome
        .assets
        .first()
        .map(Asset::backend)
        .unwrap_or(BackendId::Ethereum)
}

fn verify(params: &Params, idx: PartIdx, state: &State, sig: &Signature) -> Result<(), BackendError> {
    let part = &params.participants[idx];
    let valid = match signing_backend(state) {
        BackendId::Ethereum => part.eth.is_some_and(|eth| {
            recover_signer(keccak256(&state.hash().0), sig).is_ok_and(|signer| signer == eth)
        }),
        // Solana signatures are checked by the program on-chain.
        BackendId::Solana => !sig.is_empty(),
    };
    if valid {
        Ok(())
    } else {
        Err(BackendError::Signature(idx))
    }
}

/// Signatures ordered by participant index.
fn ordered(idx: PartIdx, own: Signature, theirs: Signature) -> Vec<Signature> {
    if idx == 0 {
        vec![own, theirs]
    } else {
        vec![theirs, own]
    }
}

/// Backend of one participant.
pub struct LocalNode {
    me: Weak<LocalNode>,
    shared: Arc<Shared>,
    participant: Participant,
    wallet: RemoteWallet,
    handler: RwLock<Option<Arc<dyn ProposalHandler>>>,
    channels: Mutex<HashMap<ChannelId, Arc<LocalChannel>>>,
}

impl LocalNode {
    fn handler(&self) -> Result<Arc<dyn ProposalHandler>, BackendError> {
        self.handler
            .read()
            .clone()
            .ok_or(BackendError::PeerUnreachable(self.participant.l2))
    }

    fn channel(&self, id: &ChannelId) -> Option<Arc<LocalChannel>> {
        self.channels.lock().get(id).cloned()
    }

    async fn sign(&self, state: &State) -> Result<Signature, BackendError> {
        let backend = signing_backend(state);
        let account = self
            .wallet
            .account(backend)
            .ok_or(BackendError::MissingAccount(backend))?;
        Ok(account.sign_data(&state.hash().0).await?)
    }

    /// Sign, fund and register the channel on both sides.
    async fn open(
        &self,
        peer: &Arc<LocalNode>,
        params: Params,
        state: State,
    ) -> Result<(Arc<LocalChannel>, Arc<LocalChannel>), BackendError> {
        for part in &params.participants {
            for backend in state.outcome.backends() {
                if !part.has_account(backend) {
                    return Err(BackendError::MissingAccount(backend));
                }
            }
        }

        let (own_sig, peer_sig) = try_join(self.sign(&state), peer.sign(&state)).await?;
        let sigs = vec![own_sig, peer_sig];
        for (idx, sig) in sigs.iter().enumerate() {
            verify(&params, idx, &state, sig)?;
        }

        let id = params.channel_id();
        let mine = LocalChannel::new(
            self.me.clone(),
            Arc::downgrade(peer),
            0,
            params.clone(),
            state.clone(),
            sigs.clone(),
        );
        let theirs = LocalChannel::new(Arc::downgrade(peer), self.me.clone(), 1, params, state, sigs);

        // Only known to the nodes once funded, an abandoned open leaves
        // nothing behind.
        try_join(self.fund(&mine), peer.fund(&theirs)).await?;
        mine.set_phase(Phase::Open);
        theirs.set_phase(Phase::Open);
        self.channels.lock().insert(id, mine.clone());
        peer.channels.lock().insert(id, theirs.clone());
        info!(channel = %id, "channel open");
        Ok((mine, theirs))
    }

    /// Deposit the own share of every asset, then wait for the peer's.
    async fn fund(&self, ch: &LocalChannel) -> Result<(), BackendError> {
        let outcome = ch.state().outcome;
        let funding = funding_id(ch.id, &self.participant.l2);
        for (asset_idx, asset) in outcome.assets.iter().enumerate() {
            let amount = outcome.balances[asset_idx][ch.idx];
            if amount.is_zero() {
                continue;
            }
            self.deposit(asset, funding, amount)
                .await
                .map_err(|err| BackendError::Funding {
                    channel: ch.id,
                    reason: err.to_string(),
                })?;
            self.shared.chain.deposit(ch.id, asset_idx, ch.idx, amount);
        }
        self.shared.chain.wait_funded(ch.id, &outcome).await;
        Ok(())
    }

    async fn deposit(&self, asset: &Asset, funding: Hash, amount: U256) -> Result<(), BackendError> {
        match asset {
            Asset::Ethereum { holder, chain_id } => {
                let config = &self.shared.config;
                let gas = config.deposit_gas_limit();
                let token = config
                    .eth_asset(chain_id, holder)
                    .filter(|a| a.asset_type == EthereumAssetType::Erc20)
                    .map(|a| a.address);
                let deposit = calldata(&[funding.0, amount.to_be_bytes()]);
                match token {
                    Some(token) => {
                        let approve = calldata(&[address_slot(holder), amount.to_be_bytes()]);
                        self.eth_tx(chain_id, token, U256::zero(), gas, approve).await?;
                        self.eth_tx(chain_id, *holder, U256::zero(), gas, deposit).await
                    }
                    None => self.eth_tx(chain_id, *holder, amount, gas, deposit).await,
                }
            }
            Asset::Solana { mint } => self.sol_tx(format!("deposit {mint} {funding} {amount}")).await,
        }
    }

    async fn withdraw(&self, ch: &LocalChannel, outcome: &Allocation) -> Result<(), BackendError> {
        let funding = funding_id(ch.id, &self.participant.l2);
        for (asset, bals) in outcome.assets.iter().zip(&outcome.balances) {
            let amount = bals[ch.idx];
            if amount.is_zero() {
                continue;
            }
            let receiver = match asset {
                Asset::Ethereum { holder, chain_id } => {
                    let receiver = ch
                        .receiver()
                        .or(self.participant.eth)
                        .ok_or(BackendError::MissingAccount(BackendId::Ethereum))?;
                    let data = calldata(&[funding.0, address_slot(&receiver), amount.to_be_bytes()]);
                    let gas = self.shared.config.withdraw_gas_limit();
                    self.eth_tx(chain_id, *holder, U256::zero(), gas, data).await?;
                    receiver.to_string()
                }
                Asset::Solana { mint } => {
                    let receiver = owner_of(asset, &self.participant)?;
                    self.sol_tx(format!("withdraw {mint} {funding} {amount}")).await?;
                    receiver
                }
            };
            self.shared.chain.credit(asset, &receiver, amount);
            debug!(channel = %ch.id, %receiver, %amount, "withdrawn");
        }
        Ok(())
    }

    /// Submit `state` to the adjudicator of the chain it is signed for.
    async fn adjudicate(&self, op: &str, state: &State) -> Result<(), BackendError> {
        match state.outcome.assets.first() {
            Some(Asset::Ethereum { chain_id, .. }) => {
                let adjudicator = self
                    .shared
                    .config
                    .eth_chain(chain_id)
                    .map(|c| c.adjudicator)
                    .unwrap_or_default();
                let gas = self.shared.config.withdraw_gas_limit();
                let data = calldata(&[state.hash().0]);
                self.eth_tx(chain_id, adjudicator, U256::zero(), gas, data).await
            }
            Some(Asset::Solana { .. }) => {
                self.sol_tx(format!("{op} {} {}", state.channel_id(), state.version()))
                    .await
            }
            None => Ok(()),
        }
    }

    async fn eth_tx(
        &self,
        chain_id: &U256,
        to: Address,
        value: U256,
        gas_limit: u64,
        data: Bytes,
    ) -> Result<(), BackendError> {
        let transactor = self
            .wallet
            .eth_transactor(*chain_id)
            .ok_or(BackendError::MissingAccount(BackendId::Ethereum))?;
        let tx = EthTransaction {
            from: transactor.sender(),
            to,
            value,
            // Filled in by the wallet.
            nonce: 0,
            gas_limit,
            data,
            signature: None,
            hash: None,
        };
        let sent = transactor.sign_send_transaction(tx).await?;
        debug!(%to, signed = sent.is_signed(), "transaction sent");
        Ok(())
    }

    async fn sol_tx(&self, tx: String) -> Result<(), BackendError> {
        let sender = self
            .wallet
            .sol_sender()
            .ok_or(BackendError::MissingAccount(BackendId::Solana))?;
        sender.sign_send_transaction(tx).await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelBackend for LocalNode {
    async fn propose_channel(
        &self,
        proposal: LedgerChannelProposal,
    ) -> Result<Arc<dyn Channel>, BackendError> {
        if proposal.peers.len() != PARTICIPANTS {
            return Err(BackendError::Rejected(format!(
                "{} participants, expected {PARTICIPANTS}",
                proposal.peers.len()
            )));
        }
        let receiver = proposal.peers[1];
        let peer = self
            .shared
            .node(&receiver)
            .ok_or(BackendError::PeerUnreachable(receiver))?;
        let handler = peer.handler()?;

        let (reply, replied) = oneshot::channel();
        let inbound = ChannelProposal::Ledger(proposal.clone());
        tokio::spawn(async move {
            handler
                .handle_proposal(inbound, Box::new(LocalProposalResponder { reply }))
                .await
        });
        let (acc, done) = match replied.await {
            Ok(ProposalReply::Accept { acc, done }) => (acc, done),
            Ok(ProposalReply::Reject(reason)) => return Err(BackendError::Rejected(reason)),
            Err(_) => return Err(BackendError::Rejected("proposal dropped by peer".into())),
        };

        let (params, state) = proposal.build(&acc);
        let id = params.channel_id();
        debug!(channel = %id, proposal = %proposal.proposal_id, "proposal accepted");
        match self.open(&peer, params, state).await {
            Ok((mine, theirs)) => {
                // The peer may have given up waiting.
                let _ = done.send(Ok(theirs));
                Ok(mine)
            }
            Err(err) => {
                let _ = done.send(Err(BackendError::Funding {
                    channel: id,
                    reason: err.to_string(),
                }));
                Err(err)
            }
        }
    }

    fn handle(&self, handler: Arc<dyn ProposalHandler>) {
        *self.handler.write() = Some(handler);
    }

    async fn close(&self) -> Result<(), BackendError> {
        {
            let mut nodes = self.shared.nodes.write();
            if nodes
                .get(&self.participant.l2)
                .is_some_and(|n| n.ptr_eq(&self.me))
            {
                nodes.remove(&self.participant.l2);
            }
        }
        self.handler.write().take();
        let channels: Vec<_> = self.channels.lock().drain().map(|(_, ch)| ch).collect();
        for ch in channels {
            ch.closed.cancel();
        }
        debug!(l2 = %self.participant.l2, "participant disconnected");
        Ok(())
    }
}

enum ProposalReply {
    Accept {
        acc: LedgerChannelProposalAcc,
        done: oneshot::Sender<Result<Arc<LocalChannel>, BackendError>>,
    },
    Reject(String),
}

struct LocalProposalResponder {
    reply: oneshot::Sender<ProposalReply>,
}

#[async_trait]
impl ProposalResponder for LocalProposalResponder {
    async fn accept(
        self: Box<Self>,
        acc: LedgerChannelProposalAcc,
    ) -> Result<Arc<dyn Channel>, BackendError> {
        let (done, opened) = oneshot::channel();
        self.reply
            .send(ProposalReply::Accept { acc, done })
            .map_err(|_| BackendError::Closed)?;
        let channel = opened.await.map_err(|_| BackendError::Closed)??;
        Ok(channel)
    }

    async fn reject(self: Box<Self>, reason: String) -> Result<(), BackendError> {
        self.reply
            .send(ProposalReply::Reject(reason))
            .map_err(|_| BackendError::Closed)
    }
}

struct LocalUpdateResponder {
    channel: Arc<LocalChannel>,
    state: State,
    actor_sig: Signature,
    reply: oneshot::Sender<Result<Signature, String>>,
}

#[async_trait]
impl UpdateResponder for LocalUpdateResponder {
    async fn accept(self: Box<Self>) -> Result<(), BackendError> {
        match self.channel.countersign(self.state, self.actor_sig).await {
            Ok(sig) => self.reply.send(Ok(sig)).map_err(|_| BackendError::Closed),
            Err(err) => {
                let _ = self.reply.send(Err(err.to_string()));
                Err(err)
            }
        }
    }

    async fn reject(self: Box<Self>, reason: String) -> Result<(), BackendError> {
        self.reply
            .send(Err(reason))
            .map_err(|_| BackendError::Closed)
    }
}

struct Inner {
    state: State,
    sigs: Vec<Signature>,
    phase: Phase,
}

/// One participant's end of a channel.
pub struct LocalChannel {
    id: ChannelId,
    idx: PartIdx,
    params: Params,
    node: Weak<LocalNode>,
    peer: Weak<LocalNode>,
    inner: Mutex<Inner>,
    receiver: Mutex<Option<Address>>,
    closed: CancellationToken,
}

impl LocalChannel {
    fn new(
        node: Weak<LocalNode>,
        peer: Weak<LocalNode>,
        idx: PartIdx,
        params: Params,
        state: State,
        sigs: Vec<Signature>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: params.channel_id(),
            idx,
            params,
            node,
            peer,
            inner: Mutex::new(Inner {
                state,
                sigs,
                phase: Phase::Funding,
            }),
            receiver: Mutex::new(None),
            closed: CancellationToken::new(),
        })
    }

    fn node(&self) -> Result<Arc<LocalNode>, BackendError> {
        self.node.upgrade().ok_or(BackendError::Closed)
    }

    fn peer(&self) -> Result<Arc<LocalNode>, BackendError> {
        let l2 = self.params.participants[1 - self.idx].l2;
        self.peer
            .upgrade()
            .ok_or(BackendError::PeerUnreachable(l2))
    }

    fn set_phase(&self, phase: Phase) {
        self.inner.lock().phase = phase;
    }

    fn receiver(&self) -> Option<Address> {
        *self.receiver.lock()
    }

    /// Current state, if the channel is open for updates.
    fn open_state(&self) -> Result<State, BackendError> {
        let inner = self.inner.lock();
        if inner.phase != Phase::Open {
            return Err(BackendError::NotOpen(self.id));
        }
        Ok(inner.state.clone())
    }

    fn apply(&self, next: State, sigs: Vec<Signature>) -> Result<(), BackendError> {
        let mut inner = self.inner.lock();
        inner.state.check_valid_transition(&next)?;
        debug!(channel = %self.id, version = next.version(), "state updated");
        inner.state = next;
        inner.sigs = sigs;
        Ok(())
    }

    /// Accept an update signed by the peer and return the own signature.
    async fn countersign(&self, next: State, actor_sig: Signature) -> Result<Signature, BackendError> {
        let current = self.open_state()?;
        current.check_valid_transition(&next)?;
        verify(&self.params, 1 - self.idx, &next, &actor_sig)?;
        let sig = self.node()?.sign(&next).await?;
        self.apply(next, ordered(self.idx, sig.clone(), actor_sig))?;
        Ok(sig)
    }

    async fn conclude_and_withdraw(&self, node: &LocalNode, secondary: bool) -> Result<(), BackendError> {
        let chain = &node.shared.chain;
        let state = self.inner.lock().state.clone();
        if !secondary && chain.concluded_outcome(self.id).is_none() {
            if !state.is_final {
                node.adjudicate("register", &state).await?;
                if chain.register(&state, self.params.challenge_duration) {
                    info!(channel = %self.id, version = state.version(), "dispute registered");
                    tokio::time::sleep(Duration::from_secs(self.params.challenge_duration)).await;
                }
            }
            node.adjudicate("conclude", &state).await?;
            chain.conclude(&state);
        }

        let outcome = chain
            .concluded_outcome(self.id)
            .ok_or(BackendError::NotConcluded(self.id))?;
        if chain.claim_withdrawal(self.id, self.idx) {
            if let Err(err) = node.withdraw(self, &outcome).await {
                chain.release_withdrawal(self.id, self.idx);
                return Err(err);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn idx(&self) -> PartIdx {
        self.idx
    }

    fn params(&self) -> Params {
        self.params.clone()
    }

    fn state(&self) -> State {
        self.inner.lock().state.clone()
    }

    fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    fn signed_state(&self) -> SignedState {
        let inner = self.inner.lock();
        SignedState {
            params: self.params.clone(),
            state: inner.state.clone(),
            sigs: inner.sigs.clone(),
        }
    }

    async fn update(&self, next: State) -> Result<(), BackendError> {
        let current = self.open_state()?;
        current.check_valid_transition(&next)?;

        let node = self.node()?;
        let peer = self.peer()?;
        let peer_channel = peer
            .channel(&self.id)
            .ok_or(BackendError::PeerUnreachable(peer.participant.l2))?;
        let handler = peer.handler()?;
        let own_sig = node.sign(&next).await?;

        let (reply, replied) = oneshot::channel();
        let update = ChannelUpdate {
            state: next.clone(),
            actor_idx: self.idx,
        };
        let responder = LocalUpdateResponder {
            channel: peer_channel.clone(),
            state: next.clone(),
            actor_sig: own_sig.clone(),
            reply,
        };
        tokio::spawn(async move {
            handler
                .handle_update(peer_channel.state(), update, Box::new(responder))
                .await
        });

        let their_sig = match replied.await {
            Ok(Ok(sig)) => sig,
            Ok(Err(reason)) => return Err(BackendError::Rejected(reason)),
            Err(_) => return Err(BackendError::Rejected("update dropped by peer".into())),
        };
        verify(&self.params, 1 - self.idx, &next, &their_sig)?;
        self.apply(next, ordered(self.idx, own_sig, their_sig))
    }

    async fn settle(&self, secondary: bool) -> Result<(), BackendError> {
        let node = self.node()?;
        let before = {
            let mut inner = self.inner.lock();
            match inner.phase {
                Phase::Closed => return Ok(()),
                Phase::Settling => {
                    debug!(channel = %self.id, "already settling");
                    return Ok(());
                }
                Phase::Proposed | Phase::Funding => return Err(BackendError::NotOpen(self.id)),
                phase => {
                    inner.phase = Phase::Settling;
                    phase
                }
            }
        };
        match self.conclude_and_withdraw(&node, secondary).await {
            Ok(()) => {
                self.set_phase(Phase::Closed);
                info!(channel = %self.id, "channel settled");
                Ok(())
            }
            Err(err) => {
                self.set_phase(before);
                Err(err)
            }
        }
    }

    fn set_withdrawal_receiver(&self, receiver: Address) {
        *self.receiver.lock() = Some(receiver);
    }

    async fn watch(&self, handler: Arc<dyn AdjudicatorEventHandler>) -> Result<(), BackendError> {
        let node = self.node()?;
        let mut events = node.shared.chain.subscribe(self.id);
        drop(node);
        loop {
            let event = tokio::select! {
                _ = self.closed.cancelled() => return Ok(()),
                event = events.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    warn!(channel = %self.id, missed = n, "adjudicator events lagged");
                    continue;
                }
                Err(RecvError::Closed) => return Ok(()),
            };
            {
                let mut inner = self.inner.lock();
                match (&event, inner.phase) {
                    // Our own settlement, nothing to react to.
                    (_, Phase::Settling | Phase::Closed) => continue,
                    (AdjudicatorEvent::Registered { .. }, Phase::Open) => {
                        inner.phase = Phase::Disputed
                    }
                    _ => {}
                }
            }
            handler.handle_adjudicator_event(event).await;
        }
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.cancel();
        if let Ok(node) = self.node() {
            node.channels.lock().remove(&self.id);
        }
        Ok(())
    }
}
