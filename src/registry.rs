//! Directory of the connected participants.
//!
//! Each participant gets a fresh L2 identity on registration. It can be found
//! by that identity or by any of the chain addresses it registered with, and
//! every chain address belongs to at most one participant.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::info;

use crate::{
    channel::{BackendError, Participant},
    client::Client,
    server::Context,
    sig::Signer,
    types::Address,
    wallet::RemoteWallet,
    wire::Connection,
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("client with same {0} address already registered")]
    AlreadyRegistered(&'static str),
    #[error("no chain address given")]
    NoAddress,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Default)]
struct Inner {
    clients: HashMap<Address, Arc<Client>>,
    /// Chain address to L2 identity.
    l2_addresses: HashMap<String, Address>,
}

/// Shared handle to the directory.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
}

/// Ethereum addresses are looked up in their canonical spelling.
fn normalize(key: &str) -> String {
    match key.parse::<Address>() {
        Ok(addr) => addr.to_string(),
        Err(_) => key.to_string(),
    }
}

impl Registry {
    /// Create the [Client] of a new participant with the given chain
    /// addresses. Zero or empty addresses count as absent.
    pub fn register(
        &self,
        ctx: &Arc<Context>,
        eth: Option<Address>,
        sol: Option<String>,
        conn: Arc<Connection>,
    ) -> Result<Arc<Client>, RegistryError> {
        let eth = eth.filter(|a| !a.is_zero());
        let sol = sol.filter(|s| !s.is_empty());
        if eth.is_none() && sol.is_none() {
            return Err(RegistryError::NoAddress);
        }
        let l2 = Signer::new(&mut rand::rngs::OsRng).address();

        let mut inner = self.inner.write();
        if inner.clients.contains_key(&l2) {
            return Err(RegistryError::AlreadyRegistered("l2"));
        }
        if let Some(eth) = eth {
            if inner.l2_addresses.contains_key(&eth.to_string()) {
                return Err(RegistryError::AlreadyRegistered("ethereum"));
            }
        }
        if let Some(sol) = &sol {
            if inner.l2_addresses.contains_key(sol) {
                return Err(RegistryError::AlreadyRegistered("solana"));
            }
        }

        let participant = Participant {
            l2,
            eth,
            sol: sol.clone(),
        };
        let wallet = RemoteWallet::new(conn.clone(), eth, sol.clone());
        let backend = ctx.ledger.connect(participant.clone(), wallet)?;
        let client = Client::new(participant, conn, backend, ctx.clone());

        inner.clients.insert(l2, client.clone());
        if let Some(eth) = eth {
            inner.l2_addresses.insert(eth.to_string(), l2);
        }
        if let Some(sol) = sol {
            inner.l2_addresses.insert(sol, l2);
        }
        info!(%l2, ?eth, "client registered");
        Ok(client)
    }

    /// Look up a participant by L2 identity or chain address.
    pub fn get(&self, key: &str) -> Option<Arc<Client>> {
        let key = normalize(key);
        let inner = self.inner.read();
        let l2 = match inner.l2_addresses.get(&key) {
            Some(l2) => *l2,
            None => key.parse().ok()?,
        };
        inner.clients.get(&l2).cloned()
    }

    /// Forget the participant with identity `l2` and its chain addresses.
    pub fn remove(&self, l2: &Address) {
        let mut inner = self.inner.write();
        if inner.clients.remove(l2).is_some() {
            inner.l2_addresses.retain(|_, v| v != l2);
            info!(%l2, "client removed");
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
