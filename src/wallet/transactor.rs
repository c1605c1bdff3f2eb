use std::sync::Arc;

use super::{retry_once, WalletError};
use crate::{
    message::{EthTransaction, Message, SendEthTx, SendEthTxResponse, SendSolTx, SendSolTxResponse},
    types::{Address, U256},
    wire::{Connection, ConnectionError},
};

/// Has Ethereum transactions of one account signed and sent by the remote.
pub struct EthTransactor {
    conn: Arc<Connection>,
    sender: Address,
    chain_id: U256,
}

impl EthTransactor {
    pub fn new(conn: Arc<Connection>, sender: Address, chain_id: U256) -> Self {
        Self {
            conn,
            sender,
            chain_id,
        }
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    /// Returns the transaction as sent by the remote, which may have changed
    /// gas or nonce.
    pub async fn sign_send_transaction(
        &self,
        tx: EthTransaction,
    ) -> Result<EthTransaction, WalletError> {
        if tx.from != self.sender {
            return Err(WalletError::NotAuthorized(tx.from));
        }
        let tx = &tx;
        retry_once("SendETHTx", || async move {
            let req = Message::SendEthTx(SendEthTx {
                transaction: Some(tx.clone()),
                chain_id: self.chain_id,
            });
            match self.conn.request(req).await? {
                Message::SendEthTxResponse(SendEthTxResponse {
                    transaction: Some(tx),
                }) => Ok(tx),
                Message::SendEthTxResponse(SendEthTxResponse { transaction: None }) => {
                    Err(WalletError::TxRejected)
                }
                Message::Error(e) => Err(WalletError::SendTx(e.error)),
                other => Err(ConnectionError::unexpected("SendETHTxResponse", other).into()),
            }
        })
        .await
    }
}

/// Has Solana transactions signed and sent by the remote.
pub struct SolSender {
    conn: Arc<Connection>,
    addr: String,
}

impl SolSender {
    pub fn new(conn: Arc<Connection>, addr: String) -> Self {
        Self { conn, addr }
    }

    pub fn address(&self) -> &str {
        &self.addr
    }

    pub async fn sign_send_transaction(&self, tx: String) -> Result<String, WalletError> {
        let tx = &tx;
        retry_once("SendSolTx", || async move {
            let req = Message::SendSolTx(SendSolTx {
                transaction: tx.clone(),
            });
            match self.conn.request(req).await? {
                Message::SendSolTxResponse(SendSolTxResponse { transaction }) if transaction.is_empty() => {
                    Err(WalletError::TxRejected)
                }
                Message::SendSolTxResponse(SendSolTxResponse { transaction }) => Ok(transaction),
                Message::Error(e) => Err(WalletError::SendTx(e.error)),
                other => Err(ConnectionError::unexpected("SendSolTxResponse", other).into()),
            }
        })
        .await
    }
}
