use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex as StdMutex,
};

use tokio::{sync::mpsc, task::JoinHandle, time::Instant};

use super::{channel::PEER_CREATE_TIMEOUT, *};
use crate::{
    channel::{
        local::LocalNetwork, state::tests::eth_asset, Allocation, ChannelProposal, ChannelUpdate,
        LedgerChannelProposal, LedgerChannelProposalAcc, Params, PartIdx, Phase, ProposalHandler,
        ProposalResponder, SignedState, State, UpdateResponder,
    },
    config::tests::test_config,
    message::{
        ChannelClosed, ChannelCreated, ChannelState, CloseChannel, EthereumInitialize, FundingError,
        GetBalanceResponse, GetDecimals, GetDecimalsResponse, GetFunds, GetFundsResponse,
        GetHubBalance, GetQuote, GetTimeout, GetTimeoutResponse, OpenChannel, TimeoutType,
    },
    server::start_client,
    types::Hash,
    wallet::tests::{remote_conn, Scripted},
    wire::conn_pair,
};

struct MockChannel {
    params: Params,
    idx: PartIdx,
    state: StdMutex<State>,
    updates: AtomicUsize,
    settles: AtomicUsize,
}

impl MockChannel {
    fn new(params: Params, idx: PartIdx, is_final: bool) -> Arc<Self> {
        let alloc = Allocation::new(vec![eth_asset()], vec![vec![10.into(), 5.into()]]).unwrap();
        let mut state = State::new(&params, alloc);
        state.is_final = is_final;
        Arc::new(Self {
            params,
            idx,
            state: StdMutex::new(state),
            updates: AtomicUsize::new(0),
            settles: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn id(&self) -> ChannelId {
        self.params.channel_id()
    }
    fn idx(&self) -> PartIdx {
        self.idx
    }
    fn params(&self) -> Params {
        self.params.clone()
    }
    fn state(&self) -> State {
        self.state.lock().unwrap().clone()
    }
    fn phase(&self) -> Phase {
        Phase::Open
    }
    fn signed_state(&self) -> SignedState {
        SignedState {
            params: self.params(),
            state: self.state(),
            sigs: Vec::new(),
        }
    }
    async fn update(&self, next: State) -> Result<(), BackendError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = next;
        Ok(())
    }
    async fn settle(&self, _secondary: bool) -> Result<(), BackendError> {
        self.settles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn set_withdrawal_receiver(&self, _receiver: Address) {}
    async fn watch(&self, _handler: Arc<dyn AdjudicatorEventHandler>) -> Result<(), BackendError> {
        Ok(())
    }
    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Backend that opens a prepared channel.
#[derive(Default)]
struct MockBackend {
    channel: StdMutex<Option<Arc<MockChannel>>>,
    proposals: AtomicUsize,
}

#[async_trait]
impl ChannelBackend for MockBackend {
    async fn propose_channel(
        &self,
        _proposal: LedgerChannelProposal,
    ) -> Result<Arc<dyn Channel>, BackendError> {
        self.proposals.fetch_add(1, Ordering::SeqCst);
        match self.channel.lock().unwrap().clone() {
            Some(ch) => Ok(ch),
            None => Err(BackendError::Rejected("no channel".into())),
        }
    }
    fn handle(&self, _handler: Arc<dyn ProposalHandler>) {}
    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Records how a proposal was answered.
struct Recorder(Arc<StdMutex<Option<String>>>);

#[async_trait]
impl ProposalResponder for Recorder {
    async fn accept(
        self: Box<Self>,
        _acc: LedgerChannelProposalAcc,
    ) -> Result<Arc<dyn Channel>, BackendError> {
        *self.0.lock().unwrap() = Some("accepted".into());
        Err(BackendError::Closed)
    }
    async fn reject(self: Box<Self>, reason: String) -> Result<(), BackendError> {
        *self.0.lock().unwrap() = Some(reason);
        Ok(())
    }
}

/// Must not be used, the update stays unanswered.
struct NoAnswer;

#[async_trait]
impl UpdateResponder for NoAnswer {
    async fn accept(self: Box<Self>) -> Result<(), BackendError> {
        panic!("update accepted");
    }
    async fn reject(self: Box<Self>, reason: String) -> Result<(), BackendError> {
        panic!("update rejected: {reason}");
    }
}

fn context() -> Arc<Context> {
    let config = Arc::new(test_config());
    Context::new(config.clone(), Arc::new(LocalNetwork::new(config)))
}

/// A participant registered through the entry point: its client, the remote
/// end of its connection and the task serving it.
async fn registered(ctx: &Arc<Context>) -> (Arc<Client>, Arc<Connection>, JoinHandle<()>) {
    let (conn, remote) = conn_pair().await;
    let task = tokio::spawn(start_client(conn, ctx.clone()));
    let init = Message::EthereumInitialize(EthereumInitialize {
        client_address: Address([0xa; 20]),
        egoistic_client: false,
    });
    remote.write(&init).await.unwrap();
    let l2 = match remote.read().await.unwrap() {
        Message::Initialized(Initialized { l2_address }) => l2_address,
        other => panic!("expected Initialized, got {other:?}"),
    };
    let client = ctx.registry.get(&l2.to_string()).unwrap();
    (client, remote, task)
}

/// The participant was told `reason`, hung up on and deregistered.
async fn assert_dropped(
    ctx: &Context,
    client: &Client,
    remote: &Connection,
    task: JoinHandle<()>,
    reason: &str,
) {
    assert!(client.conn().is_closed());
    assert_eq!(error_text(remote.read().await.unwrap()), reason);
    task.await.unwrap();
    assert!(ctx.registry.get(&client.l2().to_string()).is_none());
    assert!(ctx.registry.is_empty());
}

fn two_party(client: &Client) -> Params {
    Params {
        challenge_duration: 10,
        nonce: 2.into(),
        participants: vec![
            client.participant().clone(),
            Participant {
                l2: Address([2; 20]),
                eth: Some(Address([0xb; 20])),
                sol: None,
            },
        ],
        ledger_channel: true,
        virtual_channel: false,
    }
}

struct Setup {
    ctx: Arc<Context>,
    client: Arc<Client>,
    backend: Arc<MockBackend>,
    /// Everything the participant receives.
    notes: mpsc::UnboundedReceiver<Message>,
}

impl Setup {
    async fn new() -> Self {
        let ctx = context();
        let (conn, remote) = conn_pair().await;
        let backend = Arc::new(MockBackend::default());
        let participant = Participant {
            l2: Address([1; 20]),
            eth: Some(Address([0xa; 20])),
            sol: None,
        };
        let client = Client::new(participant, conn, backend.clone(), ctx.clone());

        let (tx, notes) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(msg) = remote.read().await {
                if tx.send(msg).is_err() {
                    break;
                }
            }
        });
        Self {
            ctx,
            client,
            backend,
            notes,
        }
    }

    /// Register a peer with Ethereum address `0x0b..0b`.
    async fn peer(&self) -> Arc<Client> {
        let (conn, _remote) = conn_pair().await;
        self.ctx
            .registry
            .register(&self.ctx, Some(Address([0xb; 20])), None, conn)
            .unwrap()
    }

    fn params(&self, peer: &Client) -> Params {
        Params {
            challenge_duration: 10,
            nonce: 1.into(),
            participants: vec![
                self.client.participant().clone(),
                peer.participant().clone(),
            ],
            ledger_channel: true,
            virtual_channel: false,
        }
    }

    /// Next message the participant received, after all earlier writes.
    async fn next_note(&mut self) -> Message {
        self.notes.recv().await.unwrap()
    }

    /// Asserts the participant received nothing since the last note.
    async fn assert_quiet(&mut self) {
        self.client.conn().write(&Message::success()).await.unwrap();
        assert_eq!(self.next_note().await, Message::success());
    }
}

fn open_request(asset: Asset) -> Message {
    Message::OpenChannel(OpenChannel {
        proposal_id: Hash([9; 32]),
        peer_address_eth: Address([0xb; 20]),
        peer_address_sol: String::new(),
        challenge_duration: 10,
        state: ChannelState {
            assets: vec![asset],
            backends: Vec::new(),
            balance: vec![10.into()],
            peer_balance: vec![5.into()],
            is_final: false,
        },
    })
}

fn error_text(msg: Message) -> String {
    match msg {
        Message::Error(err) => err.error,
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn unconfigured_asset_never_reaches_backend() {
    let s = Setup::new().await;
    s.peer().await;

    let unknown_holder = Asset::Ethereum {
        holder: Address([0x99; 20]),
        chain_id: 1337.into(),
    };
    let resp = s.client.handle_request(open_request(unknown_holder)).await;
    assert_eq!(
        error_text(resp),
        "unsupported asset 0x9999999999999999999999999999999999999999"
    );

    let unknown_chain = Asset::Ethereum {
        holder: Address([0x22; 20]),
        chain_id: 1.into(),
    };
    let resp = s.client.handle_request(open_request(unknown_chain)).await;
    assert_eq!(error_text(resp), "unsupported chain 1");
    assert_eq!(s.backend.proposals.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unconfigured_asset_in_proposal_is_rejected_without_asking() {
    let mut s = Setup::new().await;
    let alloc = Allocation::new(
        vec![Asset::Solana {
            mint: "NotAMint".into(),
        }],
        vec![vec![1.into(), 1.into()]],
    )
    .unwrap();
    let proposer = Participant {
        l2: Address([3; 20]),
        eth: None,
        sol: Some("Proposer".into()),
    };
    let prop = LedgerChannelProposal::new(
        &mut rand::thread_rng(),
        Hash([4; 32]),
        10,
        alloc,
        proposer,
        s.client.l2(),
    );

    let answer = Arc::new(StdMutex::new(None));
    s.client
        .handle_proposal(
            ChannelProposal::Ledger(prop),
            Box::new(Recorder(answer.clone())),
        )
        .await;
    assert_eq!(
        answer.lock().unwrap().as_deref(),
        Some("unsupported asset NotAMint")
    );
    // The participant was never asked.
    s.assert_quiet().await;
}

#[tokio::test]
async fn unknown_peer_fails_open() {
    let s = Setup::new().await;
    let resp = s.client.handle_request(open_request(eth_asset())).await;
    assert_eq!(error_text(resp), "peer not found");
    assert_eq!(s.backend.proposals.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn open_confirms_once_peer_has_channel() {
    let mut s = Setup::new().await;
    let peer = s.peer().await;
    let params = s.params(&peer);
    let id = params.channel_id();
    *s.backend.channel.lock().unwrap() = Some(MockChannel::new(params.clone(), 0, false));
    peer.add_channel(MockChannel::new(params, 1, false));

    let resp = s.client.handle_request(open_request(eth_asset())).await;
    assert_eq!(resp, Message::success());
    assert_eq!(
        s.next_note().await,
        Message::ChannelCreated(ChannelCreated {
            id,
            proposal_id: Hash([9; 32]),
            idx: 0,
        })
    );
    assert!(s.client.channel(&id).is_some());
}

#[tokio::test(start_paused = true)]
async fn peer_without_channel_reports_funding_error() {
    let mut s = Setup::new().await;
    let peer = s.peer().await;
    let params = s.params(&peer);
    let id = params.channel_id();
    *s.backend.channel.lock().unwrap() = Some(MockChannel::new(params, 0, false));

    let start = Instant::now();
    let resp = s.client.handle_request(open_request(eth_asset())).await;
    assert!(start.elapsed() >= PEER_CREATE_TIMEOUT);
    assert_eq!(error_text(resp), "peer did not create channel in time");
    assert_eq!(
        s.next_note().await,
        Message::FundingError(FundingError {
            proposal_id: Hash([9; 32]),
            channel_id: id,
            error: "peer did not create channel in time".into(),
        })
    );
    // The own end of the channel stays.
    assert!(s.client.channel(&id).is_some());
}

#[tokio::test]
async fn failed_proposal_reports_funding_error() {
    let mut s = Setup::new().await;
    s.peer().await;

    let resp = s.client.handle_request(open_request(eth_asset())).await;
    assert_eq!(error_text(resp), "rejected: no channel");
    assert_eq!(
        s.next_note().await,
        Message::FundingError(FundingError {
            proposal_id: Hash([9; 32]),
            channel_id: ChannelId::default(),
            error: "rejected: no channel".into(),
        })
    );
}

#[tokio::test]
async fn closing_final_channel_skips_update_and_notifies_once() {
    let mut s = Setup::new().await;
    let peer = s.peer().await;
    let ch = MockChannel::new(s.params(&peer), 0, true);
    let id = ch.id();
    s.client.add_channel(ch.clone());

    let close = Message::CloseChannel(CloseChannel {
        id,
        withdrawal_address: None,
        force_close: false,
    });
    assert_eq!(s.client.handle_request(close).await, Message::success());
    assert_eq!(ch.updates.load(Ordering::SeqCst), 0);
    assert_eq!(ch.settles.load(Ordering::SeqCst), 1);
    assert_eq!(
        s.next_note().await,
        Message::ChannelClosed(ChannelClosed { id })
    );

    // The conclusion seen by the watcher comes late.
    s.client
        .handle_adjudicator_event(AdjudicatorEvent::Concluded {
            channel: id,
            version: 0,
        })
        .await;
    assert_eq!(ch.settles.load(Ordering::SeqCst), 1);
    s.assert_quiet().await;
}

#[tokio::test]
async fn closing_open_channel_finalizes_first() {
    let mut s = Setup::new().await;
    let peer = s.peer().await;
    let ch = MockChannel::new(s.params(&peer), 0, false);
    let id = ch.id();
    s.client.add_channel(ch.clone());

    let close = Message::CloseChannel(CloseChannel {
        id,
        withdrawal_address: None,
        force_close: false,
    });
    assert_eq!(s.client.handle_request(close).await, Message::success());
    assert_eq!(ch.updates.load(Ordering::SeqCst), 1);
    assert!(ch.state().is_final);
    assert_eq!(ch.state().version(), 1);
    assert_eq!(
        s.next_note().await,
        Message::ChannelClosed(ChannelClosed { id })
    );
}

#[tokio::test]
async fn concluded_event_settles_then_close_finds_nothing() {
    let mut s = Setup::new().await;
    let peer = s.peer().await;
    let ch = MockChannel::new(s.params(&peer), 1, false);
    let id = ch.id();
    s.client.add_channel(ch.clone());

    s.client
        .handle_adjudicator_event(AdjudicatorEvent::Concluded {
            channel: id,
            version: 3,
        })
        .await;
    assert_eq!(ch.settles.load(Ordering::SeqCst), 1);
    assert_eq!(
        s.next_note().await,
        Message::ChannelClosed(ChannelClosed { id })
    );

    let close = Message::CloseChannel(CloseChannel {
        id,
        withdrawal_address: None,
        force_close: true,
    });
    let resp = s.client.handle_request(close).await;
    assert_eq!(error_text(resp), format!("channel {id} not found"));
    assert_eq!(ch.settles.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_withdrawal_address_is_refused() {
    let s = Setup::new().await;
    let peer = s.peer().await;
    let ch = MockChannel::new(s.params(&peer), 0, true);
    let id = ch.id();
    s.client.add_channel(ch.clone());

    let close = Message::CloseChannel(CloseChannel {
        id,
        withdrawal_address: Some("nowhere".into()),
        force_close: false,
    });
    let resp = s.client.handle_request(close).await;
    assert_eq!(error_text(resp), "invalid withdrawal address nowhere");
    assert_eq!(ch.settles.load(Ordering::SeqCst), 0);
    assert!(s.client.channel(&id).is_some());
}

#[tokio::test]
async fn timeouts_in_seconds() {
    let s = Setup::new().await;
    for (kind, secs) in [
        (TimeoutType::Default, 5),
        (TimeoutType::Handle, 10),
        (TimeoutType::Funding, 600),
        (TimeoutType::Settle, 600),
    ] {
        let resp = s
            .client
            .handle_request(Message::GetTimeout(GetTimeout { timeout_type: kind }))
            .await;
        assert_eq!(
            resp,
            Message::GetTimeoutResponse(GetTimeoutResponse { timeout: secs })
        );
    }
}

#[tokio::test]
async fn decimals_per_asset_kind() {
    let s = Setup::new().await;
    let cases = [
        (eth_asset(), Some(18)),
        (
            Asset::Ethereum {
                holder: Address([0x44; 20]),
                chain_id: 1337.into(),
            },
            Some(6),
        ),
        (
            Asset::Solana {
                mint: "11111111111111111111111111111111".into(),
            },
            Some(9),
        ),
        (
            Asset::Ethereum {
                holder: Address([0x55; 20]),
                chain_id: 1337.into(),
            },
            None,
        ),
    ];
    for (asset, decimals) in cases {
        let resp = s
            .client
            .handle_request(Message::GetDecimals(GetDecimals { asset }))
            .await;
        match decimals {
            Some(decimals) => assert_eq!(
                resp,
                Message::GetDecimalsResponse(GetDecimalsResponse { decimals })
            ),
            None => assert_eq!(error_text(resp), "asset not found"),
        }
    }
}

#[tokio::test]
async fn funds_are_not_handed_out() {
    let s = Setup::new().await;
    let resp = s
        .client
        .handle_request(Message::GetFunds(GetFunds {
            address: "0x0a".into(),
            asset: "ETH".into(),
            amount: "1".into(),
        }))
        .await;
    assert_eq!(
        resp,
        Message::GetFundsResponse(GetFundsResponse { success: false })
    );
}

#[tokio::test]
async fn hub_requests_are_forwarded() {
    let s = Setup::new().await;
    let hub_addr = Address([0xc; 20]);
    let script = Scripted::new(vec![
        Message::GetBalanceResponse(GetBalanceResponse {
            balance: 42.into(),
        }),
        Message::success(),
    ]);
    let hub_conn = remote_conn(script.clone()).await;
    s.ctx
        .registry
        .register(&s.ctx, Some(hub_addr), None, hub_conn)
        .unwrap();

    let resp = s
        .client
        .handle_request(Message::GetHubBalance(GetHubBalance {
            asset: eth_asset(),
            hub: hub_addr.to_string(),
        }))
        .await;
    assert_eq!(
        resp,
        Message::GetBalanceResponse(GetBalanceResponse {
            balance: 42.into()
        })
    );

    // The hub answers the quote with the wrong message.
    let quote = GetQuote {
        from_asset: eth_asset(),
        to_asset: eth_asset(),
        hub: hub_addr.to_string(),
    };
    let resp = s
        .client
        .handle_request(Message::GetQuote(quote.clone()))
        .await;
    assert_eq!(error_text(resp), "hub did not answer the request properly");
    assert_eq!(
        script.seen.lock().unwrap()[1],
        Message::GetQuote(quote.clone())
    );

    let resp = s
        .client
        .handle_request(Message::GetQuote(GetQuote {
            hub: "0x0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d".into(),
            ..quote
        }))
        .await;
    assert_eq!(error_text(resp), "hub not found");
}

#[tokio::test]
async fn other_messages_are_not_requests() {
    let s = Setup::new().await;
    let resp = s
        .client
        .handle_request(Message::ChannelClosed(ChannelClosed {
            id: ChannelId::default(),
        }))
        .await;
    assert_eq!(error_text(resp), "unexpected request: ChannelClosed");
}

#[tokio::test(start_paused = true)]
async fn unanswered_update_drops_participant() {
    let ctx = context();
    let (client, remote, task) = registered(&ctx).await;
    let ch = MockChannel::new(two_party(&client), 0, false);
    client.add_channel(ch.clone());

    let mut next = ch.state().make_next_state();
    next.outcome.balances[0] = vec![7.into(), 8.into()];
    let update = ChannelUpdate {
        state: next,
        actor_idx: 1,
    };
    let start = Instant::now();
    client
        .handle_update(ch.state(), update, Box::new(NoAnswer))
        .await;
    assert!(start.elapsed() >= ctx.config.timeouts.default);

    match remote.read().await.unwrap() {
        Message::Request(req) => assert_eq!(req.message.kind(), "UpdateChannel"),
        other => panic!("expected Request, got {other:?}"),
    }
    assert_dropped(&ctx, &client, &remote, task, "timeout: answering update").await;
}

#[tokio::test]
async fn update_for_unknown_channel_drops_participant() {
    let ctx = context();
    let (client, remote, task) = registered(&ctx).await;
    let params = two_party(&client);
    let alloc = Allocation::new(vec![eth_asset()], vec![vec![10.into(), 5.into()]]).unwrap();
    let state = State::new(&params, alloc);
    let update = ChannelUpdate {
        state: state.make_next_state(),
        actor_idx: 1,
    };

    client
        .handle_update(state, update, Box::new(NoAnswer))
        .await;
    let reason = format!("channel {} not found", params.channel_id());
    assert_dropped(&ctx, &client, &remote, task, &reason).await;
}

#[tokio::test]
async fn unsupported_topologies_drop_participant() {
    let ctx = context();
    let answer = Arc::new(StdMutex::new(None));

    let (client, remote, task) = registered(&ctx).await;
    let alloc = Allocation::new(vec![eth_asset()], vec![vec![1.into(), 1.into()]]).unwrap();
    let proposer = Participant {
        l2: Address([3; 20]),
        eth: Some(Address([0xc; 20])),
        sol: None,
    };
    let mut prop = LedgerChannelProposal::new(
        &mut rand::thread_rng(),
        Hash([5; 32]),
        10,
        alloc,
        proposer,
        client.l2(),
    );
    prop.peers.push(Address([7; 20]));
    client
        .handle_proposal(
            ChannelProposal::Ledger(prop),
            Box::new(Recorder(answer.clone())),
        )
        .await;
    assert_dropped(
        &ctx,
        &client,
        &remote,
        task,
        "unsupported channel topology: 3 peers",
    )
    .await;

    // The address is free again.
    let (client, remote, task) = registered(&ctx).await;
    let virtual_channel = ChannelProposal::Virtual {
        proposal_id: Hash([6; 32]),
        parents: vec![ChannelId::default()],
    };
    client
        .handle_proposal(virtual_channel, Box::new(Recorder(answer.clone())))
        .await;
    assert_dropped(
        &ctx,
        &client,
        &remote,
        task,
        "unsupported channel topology: virtual channel",
    )
    .await;
    // Neither proposal was answered.
    assert_eq!(*answer.lock().unwrap(), None);
}
