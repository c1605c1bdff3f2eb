//! In-memory stand-in for the asset holders and adjudicators of all chains.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tracing::debug;

use super::{AdjudicatorEvent, Allocation, Asset, PartIdx, State};
use crate::types::{ChannelId, U256};

const EVENT_BUFFER: usize = 16;

#[derive(Debug, Clone)]
struct Dispute {
    state: State,
    concluded: bool,
}

#[derive(Default)]
struct Books {
    /// Deposits per channel and asset, indexed by participant.
    deposits: HashMap<(ChannelId, usize), Vec<U256>>,
    disputes: HashMap<ChannelId, Dispute>,
    withdrawn: HashSet<(ChannelId, PartIdx)>,
    /// On-chain holdings, keyed by asset and owner address.
    balances: HashMap<(Asset, String), U256>,
}

#[derive(Default)]
pub struct SimulatedChain {
    books: Mutex<Books>,
    deposited: Notify,
    events: Mutex<HashMap<ChannelId, broadcast::Sender<AdjudicatorEvent>>>,
}

impl SimulatedChain {
    pub fn deposit(&self, channel: ChannelId, asset_idx: usize, part: PartIdx, amount: U256) {
        {
            let mut books = self.books.lock();
            let deposits = books
                .deposits
                .entry((channel, asset_idx))
                .or_insert_with(|| vec![U256::zero(); super::PARTICIPANTS]);
            deposits[part] = deposits[part].saturating_add(amount);
        }
        debug!(%channel, asset_idx, part, %amount, "deposit");
        self.deposited.notify_waiters();
    }

    fn is_funded(&self, channel: ChannelId, alloc: &Allocation) -> bool {
        let books = self.books.lock();
        alloc.balances.iter().enumerate().all(|(asset_idx, bals)| {
            let deposits = books.deposits.get(&(channel, asset_idx));
            bals.iter().enumerate().all(|(part, want)| {
                want.is_zero() || deposits.is_some_and(|d| d[part] >= *want)
            })
        })
    }

    /// Wait until every participant deposited its share of `alloc`.
    pub async fn wait_funded(&self, channel: ChannelId, alloc: &Allocation) {
        loop {
            let deposited = self.deposited.notified();
            if self.is_funded(channel, alloc) {
                return;
            }
            deposited.await;
        }
    }

    pub fn subscribe(&self, channel: ChannelId) -> broadcast::Receiver<AdjudicatorEvent> {
        let mut events = self.events.lock();
        // Watchers that are gone leave senders behind.
        events.retain(|_, tx| tx.receiver_count() > 0);
        events
            .entry(channel)
            .or_insert_with(|| broadcast::channel(EVENT_BUFFER).0)
            .subscribe()
    }

    fn emit(&self, event: AdjudicatorEvent) {
        if let Some(tx) = self.events.lock().get(&event.channel_id()) {
            // Nobody watching is fine.
            let _ = tx.send(event);
        }
    }

    /// Register `state` for a dispute. Older states than the registered one
    /// are ignored.
    pub fn register(&self, state: &State, challenge_duration: u64) -> bool {
        let channel = state.channel_id();
        {
            let mut books = self.books.lock();
            match books.disputes.get(&channel) {
                Some(d) if d.concluded || d.state.version() >= state.version() => return false,
                _ => {}
            }
            books.disputes.insert(
                channel,
                Dispute {
                    state: state.clone(),
                    concluded: false,
                },
            );
        }
        self.emit(AdjudicatorEvent::Registered {
            channel,
            version: state.version(),
            timeout: std::time::Duration::from_secs(challenge_duration),
        });
        true
    }

    /// Conclude the channel with `state`, or the registered state if newer.
    /// Only the first conclusion counts.
    pub fn conclude(&self, state: &State) -> bool {
        let channel = state.channel_id();
        let version = {
            let mut books = self.books.lock();
            let dispute = books.disputes.entry(channel).or_insert_with(|| Dispute {
                state: state.clone(),
                concluded: false,
            });
            if dispute.concluded {
                return false;
            }
            if dispute.state.version() < state.version() {
                dispute.state = state.clone();
            }
            dispute.concluded = true;
            dispute.state.version()
        };
        self.emit(AdjudicatorEvent::Concluded { channel, version });
        // Nothing follows a conclusion. Watchers drain the buffered events,
        // then see the channel closed.
        self.events.lock().remove(&channel);
        true
    }

    /// Outcome of a concluded channel.
    pub fn concluded_outcome(&self, channel: ChannelId) -> Option<Allocation> {
        let books = self.books.lock();
        books
            .disputes
            .get(&channel)
            .filter(|d| d.concluded)
            .map(|d| d.state.outcome.clone())
    }

    /// Claim the withdrawal of `part`. Returns false if it already happened.
    pub fn claim_withdrawal(&self, channel: ChannelId, part: PartIdx) -> bool {
        self.books.lock().withdrawn.insert((channel, part))
    }

    pub fn release_withdrawal(&self, channel: ChannelId, part: PartIdx) {
        self.books.lock().withdrawn.remove(&(channel, part));
    }

    pub fn credit(&self, asset: &Asset, owner: &str, amount: U256) {
        let mut books = self.books.lock();
        let balance = books
            .balances
            .entry((asset.clone(), owner.to_string()))
            .or_default();
        *balance = balance.saturating_add(amount);
    }

    pub fn balance(&self, asset: &Asset, owner: &str) -> U256 {
        self.books
            .lock()
            .balances
            .get(&(asset.clone(), owner.to_string()))
            .copied()
            .unwrap_or_default()
    }
}
