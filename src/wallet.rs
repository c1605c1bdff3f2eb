//! Accounts whose keys live with the remote participant.
//!
//! Signing data and sending transactions are round trips over the
//! participant's [Connection]. Each round trip is retried once before the
//! failure is reported.

mod account;
mod transactor;

pub use account::{Account, EthAccount, SolAccount};
pub use transactor::{EthTransactor, SolSender};

use std::{future::Future, sync::Arc};

use tracing::warn;

use crate::{
    channel::BackendId,
    types::{Address, U256},
    wire::{Connection, ConnectionError},
};

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("account {0} not authorized")]
    NotAuthorized(Address),
    #[error("client rejected sending tx")]
    TxRejected,
    #[error("sendTx: {0}")]
    SendTx(String),
    #[error("client returned an unsigned signature")]
    EmptySignature,
    #[error(transparent)]
    Connection(ConnectionError),
}

impl From<ConnectionError> for WalletError {
    fn from(err: ConnectionError) -> Self {
        WalletError::Connection(err)
    }
}

/// Wallet of one remote participant, one account per chain family.
#[derive(Clone)]
pub struct RemoteWallet {
    conn: Arc<Connection>,
    eth: Option<Address>,
    sol: Option<String>,
}

impl RemoteWallet {
    pub fn new(conn: Arc<Connection>, eth: Option<Address>, sol: Option<String>) -> Self {
        Self { conn, eth, sol }
    }

    pub fn account(&self, backend: BackendId) -> Option<Arc<dyn Account>> {
        match backend {
            BackendId::Ethereum => self
                .eth
                .map(|addr| Arc::new(EthAccount::new(self.conn.clone(), addr)) as Arc<dyn Account>),
            BackendId::Solana => self.sol.clone().map(|addr| {
                Arc::new(SolAccount::new(self.conn.clone(), addr)) as Arc<dyn Account>
            }),
        }
    }

    pub fn eth_transactor(&self, chain_id: U256) -> Option<EthTransactor> {
        self.eth
            .map(|sender| EthTransactor::new(self.conn.clone(), sender, chain_id))
    }

    pub fn sol_sender(&self) -> Option<SolSender> {
        self.sol
            .clone()
            .map(|addr| SolSender::new(self.conn.clone(), addr))
    }
}

/// Run `op`, and once more if it failed.
pub(crate) async fn retry_once<T, F, Fut>(what: &'static str, mut op: F) -> Result<T, WalletError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WalletError>>,
{
    match op().await {
        Ok(v) => Ok(v),
        Err(err) => {
            warn!(%err, "{what} failed, retrying once");
            op().await
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        message::{EthTransaction, Message, SendEthTxResponse, SignResponse},
        types::{Bytes, Signature},
        wire::{conn_pair, RequestHandler},
    };

    /// Remote side answering from a script, one entry per request.
    pub struct Scripted {
        pub answers: Mutex<Vec<Message>>,
        pub seen: Mutex<Vec<Message>>,
        pub calls: AtomicUsize,
    }

    impl Scripted {
        pub fn new(mut answers: Vec<Message>) -> Arc<Self> {
            answers.reverse();
            Arc::new(Self {
                answers: Mutex::new(answers),
                seen: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RequestHandler for Scripted {
        async fn handle_request(&self, msg: Message) -> Message {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(msg);
            self.answers
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Message::error("script exhausted"))
        }
    }

    /// Server side connection whose peer answers with `remote`.
    pub async fn remote_conn<H: RequestHandler>(remote: Arc<H>) -> Arc<Connection> {
        let (server, client) = conn_pair().await;
        tokio::spawn({
            let server = server.clone();
            async move { server.handle(Arc::new(NoRequests)).await }
        });
        tokio::spawn(async move { client.handle(remote).await });
        server
    }

    struct NoRequests;

    #[async_trait]
    impl RequestHandler for NoRequests {
        async fn handle_request(&self, _msg: Message) -> Message {
            Message::error("not expecting requests")
        }
    }

    fn sig_response() -> Message {
        Message::SignResponse(SignResponse {
            signature: Signature(vec![7; 65]),
        })
    }

    fn tx(from: Address) -> EthTransaction {
        EthTransaction {
            from,
            to: Address([9; 20]),
            value: 1.into(),
            nonce: 0,
            gas_limit: 0,
            data: Bytes::default(),
            signature: None,
            hash: None,
        }
    }

    #[tokio::test]
    async fn sign_retries_once() {
        let script = Scripted::new(vec![Message::error("wallet locked"), sig_response()]);
        let conn = remote_conn(script.clone()).await;
        let wallet = RemoteWallet::new(conn, Some(Address([1; 20])), None);

        let account = wallet.account(BackendId::Ethereum).unwrap();
        let sig = account.sign_data(b"state").await.unwrap();
        assert_eq!(sig, Signature(vec![7; 65]));
        assert_eq!(script.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sign_fails_after_second_attempt() {
        let script = Scripted::new(vec![Message::error("no"), Message::error("still no")]);
        let conn = remote_conn(script.clone()).await;
        let wallet = RemoteWallet::new(conn, Some(Address([1; 20])), None);

        let err = wallet
            .account(BackendId::Ethereum)
            .unwrap()
            .sign_data(b"state")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "still no");
        assert_eq!(script.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn send_tx_retries_then_succeeds() {
        let sender = Address([1; 20]);
        let mut signed = tx(sender);
        signed.signature = Some(Signature(vec![1; 65]));
        let script = Scripted::new(vec![
            Message::error("network hiccup"),
            Message::SendEthTxResponse(SendEthTxResponse {
                transaction: Some(signed.clone()),
            }),
        ]);
        let conn = remote_conn(script.clone()).await;
        let transactor = RemoteWallet::new(conn, Some(sender), None)
            .eth_transactor(1337.into())
            .unwrap();

        let sent = transactor.sign_send_transaction(tx(sender)).await.unwrap();
        assert_eq!(sent, signed);
        assert_eq!(script.calls.load(Ordering::SeqCst), 2);
        match &script.seen.lock().unwrap()[0] {
            Message::SendEthTx(req) => assert_eq!(req.chain_id, 1337.into()),
            other => panic!("unexpected {other:?}"),
        };
    }

    #[tokio::test]
    async fn empty_tx_is_rejection() {
        let sender = Address([1; 20]);
        let empty = Message::SendEthTxResponse(SendEthTxResponse { transaction: None });
        let script = Scripted::new(vec![empty.clone(), empty]);
        let conn = remote_conn(script).await;
        let transactor = RemoteWallet::new(conn, Some(sender), None)
            .eth_transactor(1.into())
            .unwrap();

        let err = transactor.sign_send_transaction(tx(sender)).await.unwrap_err();
        assert!(matches!(err, WalletError::TxRejected));
        assert_eq!(err.to_string(), "client rejected sending tx");
    }

    #[tokio::test]
    async fn foreign_sender_not_authorized() {
        let script = Scripted::new(vec![]);
        let conn = remote_conn(script.clone()).await;
        let transactor = RemoteWallet::new(conn, Some(Address([1; 20])), None)
            .eth_transactor(1.into())
            .unwrap();

        let err = transactor
            .sign_send_transaction(tx(Address([2; 20])))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::NotAuthorized(_)));
        assert_eq!(script.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_accounts() {
        let conn = remote_conn(Scripted::new(vec![])).await;
        let wallet = RemoteWallet::new(conn, None, Some("SolAddr".into()));
        assert!(wallet.account(BackendId::Ethereum).is_none());
        assert!(wallet.eth_transactor(1.into()).is_none());
        assert_eq!(
            wallet.account(BackendId::Solana).unwrap().backend(),
            BackendId::Solana
        );
    }
}
