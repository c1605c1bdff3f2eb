//! A server on a local port and scripted participants talking to it.

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use rand::{rngs::StdRng, SeedableRng};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};

use perun_ws::{
    channel::{local::LocalNetwork, Asset},
    config::Config,
    message::{
        ChannelState, EthereumInitialize, Message, ProposalResponse, SendEthTxResponse,
        SignResponse,
    },
    server::{self, Context},
    sig::Signer,
    wire::{Connection, RequestHandler},
    Address, Signature,
};

pub const CHAINS: &str = r#"
[[ethereum]]
name = "Ganache"
chainID = "1337"
adjudicator = "0x1111111111111111111111111111111111111111"

[[ethereum.assets]]
code = "ETH"
name = "Ether"
type = "ETH"
assetHolder = "0x2222222222222222222222222222222222222222"
"#;

/// How long a test waits for anything the server does.
pub const PATIENCE: Duration = Duration::from_secs(30);

pub fn eth() -> Asset {
    Asset::Ethereum {
        holder: "0x2222222222222222222222222222222222222222".parse().unwrap(),
        chain_id: 1337.into(),
    }
}

pub fn eth_state(balance: u64, peer_balance: u64, is_final: bool) -> ChannelState {
    ChannelState {
        assets: vec![eth()],
        backends: Vec::new(),
        balance: vec![balance.into()],
        peer_balance: vec![peer_balance.into()],
        is_final,
    }
}

pub async fn start_server() -> (SocketAddr, Arc<Context>) {
    let config = Arc::new(Config::from_toml_str(CHAINS).unwrap());
    let ctx = Context::new(config.clone(), Arc::new(LocalNetwork::new(config)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, ctx.clone()));
    (addr, ctx)
}

/// What a participant does when the server asks.
pub struct Behavior {
    signer: Signer,
    pub accept_proposals: AtomicBool,
    pub accept_updates: AtomicBool,
    /// Transactions to fail before sending succeeds again.
    pub drop_txs: AtomicUsize,
    pub tx_requests: AtomicUsize,
    pub sent_txs: AtomicUsize,
    notes: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl RequestHandler for Behavior {
    async fn handle_request(&self, msg: Message) -> Message {
        match msg {
            Message::SignEthData(req) => Message::SignResponse(SignResponse {
                signature: self.signer.sign_data(&req.data.0).unwrap(),
            }),
            Message::SendEthTx(req) => {
                self.tx_requests.fetch_add(1, Ordering::SeqCst);
                let dropped = self
                    .drop_txs
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if dropped {
                    return Message::error("connection to node lost");
                }
                self.sent_txs.fetch_add(1, Ordering::SeqCst);
                let mut tx = req.transaction.unwrap();
                tx.signature = Some(Signature(vec![1; 65]));
                Message::SendEthTxResponse(SendEthTxResponse {
                    transaction: Some(tx),
                })
            }
            Message::ChannelProposal(_) => answer(self.accept_proposals.load(Ordering::SeqCst)),
            Message::UpdateChannel(_) => answer(self.accept_updates.load(Ordering::SeqCst)),
            other => Message::error(format!("unexpected {}", other.kind())),
        }
    }

    async fn handle_notification(&self, msg: Message) {
        let _ = self.notes.send(msg);
    }
}

fn answer(accepted: bool) -> Message {
    Message::ProposalResponse(ProposalResponse {
        accepted,
        reject_reason: if accepted {
            String::new()
        } else {
            "not interested".into()
        },
    })
}

pub struct Participant {
    pub conn: Arc<Connection>,
    pub eth: Address,
    pub l2: Address,
    pub behavior: Arc<Behavior>,
    notes: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl Participant {
    /// Connect and send `EthereumInitialize`, without waiting for the answer.
    pub async fn dial(addr: SocketAddr, seed: u64) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        let conn = Connection::new(ws);
        let signer = Signer::new(&mut StdRng::seed_from_u64(seed));
        let eth = signer.address();
        let (tx, notes) = mpsc::unbounded_channel();
        let behavior = Arc::new(Behavior {
            signer,
            accept_proposals: AtomicBool::new(true),
            accept_updates: AtomicBool::new(true),
            drop_txs: AtomicUsize::new(0),
            tx_requests: AtomicUsize::new(0),
            sent_txs: AtomicUsize::new(0),
            notes: tx,
        });
        tokio::spawn({
            let conn = conn.clone();
            let behavior = behavior.clone();
            async move { conn.handle(behavior).await }
        });

        let init = Message::EthereumInitialize(EthereumInitialize {
            client_address: eth,
            egoistic_client: false,
        });
        conn.write(&init).await.unwrap();
        Self {
            conn,
            eth,
            l2: Address::default(),
            behavior,
            notes: Mutex::new(notes),
        }
    }

    /// Connect and wait until registered.
    pub async fn join(addr: SocketAddr, seed: u64) -> Self {
        let mut p = Self::dial(addr, seed).await;
        match p.note().await {
            Message::Initialized(init) => p.l2 = init.l2_address,
            other => panic!("expected Initialized, got {other:?}"),
        }
        p
    }

    pub async fn note(&self) -> Message {
        tokio::time::timeout(PATIENCE, self.notes.lock().await.recv())
            .await
            .expect("no notification in time")
            .expect("connection closed")
    }

    pub async fn request(&self, msg: Message) -> Message {
        self.conn
            .request_timeout(msg, PATIENCE, "test request")
            .await
            .unwrap()
    }
}
