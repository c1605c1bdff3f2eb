use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::message::Message;

/// Open outgoing requests, waiting for their response.
#[derive(Debug, Default)]
pub(super) struct PendingRequests {
    slots: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
}

impl PendingRequests {
    pub fn insert(&self, id: u64) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.slots.lock().insert(id, tx);
        rx
    }

    /// Deliver a response. Returns false if nobody waits for `id` (anymore).
    pub fn resolve(&self, id: u64, msg: Message) -> bool {
        match self.slots.lock().remove(&id) {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    pub fn remove(&self, id: u64) {
        self.slots.lock().remove(&id);
    }

    /// Drop all slots, waiters see the connection as closed.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Removes the slot when the waiting request is dropped, e.g. on timeout.
pub(super) struct SlotGuard<'a> {
    pub pending: &'a PendingRequests,
    pub id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}
