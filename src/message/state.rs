use serde::{Deserialize, Serialize};

use crate::{
    channel::{make_balances, Allocation, Asset, BackendId, InvalidBalances, PartIdx, State},
    types::U256,
};

/// A channel state as seen by one participant: its own balances and the
/// balances of its peer, per asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelState {
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub backends: Vec<BackendId>,
    pub balance: Vec<U256>,
    pub peer_balance: Vec<U256>,
    #[serde(default)]
    pub is_final: bool,
}

impl ChannelState {
    pub fn new(state: &State, idx: PartIdx) -> Self {
        Self::new_oriented(&state.outcome, idx, state.is_final)
    }

    /// View of `alloc` for participant `idx`.
    pub fn new_oriented(alloc: &Allocation, idx: PartIdx, is_final: bool) -> Self {
        let (balance, peer_balance) = alloc.oriented(idx);
        Self {
            assets: alloc.assets.clone(),
            backends: alloc.backends(),
            balance,
            peer_balance,
            is_final,
        }
    }

    /// Per-asset balances indexed by participant, with the local participant
    /// at `idx`.
    pub fn balances(&self, idx: PartIdx) -> Result<Vec<Vec<U256>>, InvalidBalances> {
        if self.balance.len() != self.assets.len() {
            return Err(InvalidBalances::AssetCount {
                assets: self.assets.len(),
                balances: self.balance.len(),
            });
        }
        make_balances(&self.balance, &self.peer_balance, idx)
    }

    pub fn allocation(&self, idx: PartIdx) -> Result<Allocation, InvalidBalances> {
        if !self.backends.is_empty()
            && self
                .backends
                .iter()
                .zip(&self.assets)
                .any(|(b, a)| *b != a.backend())
        {
            return Err(InvalidBalances::BackendMismatch);
        }
        Allocation::new(self.assets.clone(), self.balances(idx)?)
    }
}
