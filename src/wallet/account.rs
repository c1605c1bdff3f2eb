use std::sync::Arc;

use async_trait::async_trait;

use super::{retry_once, WalletError};
use crate::{
    channel::BackendId,
    message::{Message, SignEthData, SignResponse, SignSolData},
    types::{Address, Bytes, Signature},
    wire::{Connection, ConnectionError},
};

/// An account that signs on request of the channel backend.
#[async_trait]
pub trait Account: Send + Sync {
    fn backend(&self) -> BackendId;

    /// Signature over `data` in the chain's native format.
    async fn sign_data(&self, data: &[u8]) -> Result<Signature, WalletError>;
}

fn signature_from(resp: Message) -> Result<Signature, WalletError> {
    match resp {
        Message::SignResponse(SignResponse { signature }) if signature.is_empty() => {
            Err(WalletError::EmptySignature)
        }
        Message::SignResponse(SignResponse { signature }) => Ok(signature),
        other => Err(ConnectionError::unexpected("SignResponse", other).into()),
    }
}

pub struct EthAccount {
    conn: Arc<Connection>,
    addr: Address,
}

impl EthAccount {
    pub fn new(conn: Arc<Connection>, addr: Address) -> Self {
        Self { conn, addr }
    }

    pub fn address(&self) -> Address {
        self.addr
    }
}

#[async_trait]
impl Account for EthAccount {
    fn backend(&self) -> BackendId {
        BackendId::Ethereum
    }

    async fn sign_data(&self, data: &[u8]) -> Result<Signature, WalletError> {
        retry_once("SignETHData", || async move {
            let req = Message::SignEthData(SignEthData {
                address: self.addr,
                data: Bytes(data.to_vec()),
            });
            signature_from(self.conn.request(req).await?)
        })
        .await
    }
}

pub struct SolAccount {
    conn: Arc<Connection>,
    addr: String,
}

impl SolAccount {
    pub fn new(conn: Arc<Connection>, addr: String) -> Self {
        Self { conn, addr }
    }

    pub fn address(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Account for SolAccount {
    fn backend(&self) -> BackendId {
        BackendId::Solana
    }

    async fn sign_data(&self, data: &[u8]) -> Result<Signature, WalletError> {
        retry_once("SignSolData", || async move {
            let req = Message::SignSolData(SignSolData {
                address: self.addr.clone(),
                data: Bytes(data.to_vec()),
            });
            signature_from(self.conn.request(req).await?)
        })
        .await
    }
}
