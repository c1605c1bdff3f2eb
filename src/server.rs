//! Websocket entry point.
//!
//! Every accepted socket must start with one of the `Initialize` messages.
//! The participant is then registered and served by its own [Client] until
//! the socket closes.

use std::{io, sync::Arc};

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::{
    channel::Ledger,
    client::Client,
    config::Config,
    message::{CrossContractInitialize, EthereumInitialize, Message, SolanaInitialize},
    registry::Registry,
    types::Address,
    wire::Connection,
};

/// Everything the clients of one server share.
pub struct Context {
    pub config: Arc<Config>,
    pub registry: Registry,
    pub ledger: Arc<dyn Ledger>,
}

impl Context {
    pub fn new(config: Arc<Config>, ledger: Arc<dyn Ledger>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Registry::default(),
            ledger,
        })
    }
}

/// Accept websocket connections until the listener fails.
pub async fn serve(listener: TcpListener, ctx: Arc<Context>) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "listening");
    loop {
        let (stream, remote) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            debug!(%remote, "accepted connection");
            if let Err(err) = accept(stream, ctx).await {
                warn!(%remote, %err, "websocket handshake");
            }
        });
    }
}

async fn accept(
    stream: TcpStream,
    ctx: Arc<Context>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    start_client(Connection::new(ws), ctx).await;
    Ok(())
}

/// Register the participant behind `conn` and serve it until it leaves.
pub async fn start_client(conn: Arc<Connection>, ctx: Arc<Context>) {
    let init = tokio::time::timeout(ctx.config.timeouts.default, conn.read()).await;
    let (eth, sol, egoistic) = match init {
        Ok(Ok(Message::EthereumInitialize(EthereumInitialize {
            client_address,
            egoistic_client,
        }))) => (Some(client_address), None, egoistic_client),
        Ok(Ok(Message::SolanaInitialize(SolanaInitialize {
            client_address,
            egoistic_client,
        }))) => (None, Some(client_address), egoistic_client),
        Ok(Ok(Message::CrossContractInitialize(CrossContractInitialize {
            eth_client_address,
            sol_client_address,
            egoistic_client,
        }))) => (
            Some(eth_client_address),
            Some(sol_client_address),
            egoistic_client,
        ),
        Ok(Ok(other)) => {
            warn!(kind = other.kind(), "expected Initialize");
            conn.close_with_error(format!("expected Initialize, got {}", other.kind()))
                .await;
            return;
        }
        Ok(Err(err)) => {
            debug!(%err, "reading Initialize");
            conn.close().await;
            return;
        }
        Err(_) => {
            conn.close_with_error("timeout: waiting for Initialize").await;
            return;
        }
    };
    debug!(?eth, ?sol, egoistic, "initialize");

    let client = match ctx.registry.register(&ctx, eth, sol, conn.clone()) {
        Ok(client) => client,
        Err(err) => {
            warn!(%err, "registration failed");
            conn.close_with_error(err).await;
            return;
        }
    };

    let registry = ctx.registry.clone();
    let l2: Address = client.l2();
    conn.set_on_close(move || registry.remove(&l2));
    Client::run(client).await;
}
