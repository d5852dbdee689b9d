//! The asynchronous write buffer between the cache and the stocks.
//!
//! Dirty nodes evicted from the cache are parked here until the single
//! writer thread persists them. The buffer is a map of in-flight owners
//! plus a bounded channel of write orders; the map is authoritative, the
//! channel only drives the writer. A node is findable in the map from the
//! instant it is enqueued until it is either written or recovered by a
//! cache miss, so no reader can slip between "gone from the cache" and
//! "not yet visible in the buffer".

use crate::manager::NodeOwner;
use crate::NodeId;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

/// Orders for the writer thread.
#[derive(Debug)]
pub(crate) enum WriteOrder {
    /// Persist the buffered node with the given id.
    Write(NodeId),
    /// Drain outstanding work and exit.
    Stop,
}

/// The in-flight set of dirty evicted nodes.
#[derive(Debug)]
pub(crate) struct WriteBuffer {
    entries: Mutex<HashMap<NodeId, Arc<NodeOwner>>>,
    orders: crossbeam_channel::Sender<WriteOrder>,
}

impl WriteBuffer {
    /// Creates a buffer whose channel holds at most `capacity` pending
    /// orders; the matching receiver drives the writer thread.
    pub(crate) fn new(capacity: usize) -> (Arc<Self>, crossbeam_channel::Receiver<WriteOrder>) {
        let (orders, receiver) = crossbeam_channel::bounded(capacity.max(1));
        let buffer = Arc::new(Self { entries: Mutex::new(HashMap::new()), orders });
        (buffer, receiver)
    }

    /// Parks `owner` for write-back. Blocks while the order channel is full;
    /// the caller must not hold the buffer, index or list locks.
    pub(crate) fn add(&self, owner: Arc<NodeOwner>) {
        let id = owner.id();
        self.entries.lock().insert(id, owner);
        // A failed send means the writer is gone; the entry then stays put
        // until the next flush writes it synchronously.
        let _ = self.orders.send(WriteOrder::Write(id));
    }

    /// Takes the in-flight node for `id` out of the buffer, if present, and
    /// runs `reinstate` on it while the buffer lock is still held. Restoring
    /// the cache entry inside the callback closes the window in which a
    /// concurrent miss could read a stale record from the stock.
    pub(crate) fn recover<R>(
        &self,
        id: NodeId,
        reinstate: impl FnOnce(&Arc<NodeOwner>) -> R,
    ) -> Option<R> {
        let mut entries = self.entries.lock();
        let owner = entries.remove(&id)?;
        Some(reinstate(&owner))
    }

    /// Drops the in-flight node for `id`, if present. Used when the node is
    /// released while awaiting write-back.
    pub(crate) fn discard(&self, id: NodeId) {
        self.entries.lock().remove(&id);
    }

    /// The in-flight owner for `id`, if any, left in place. The writer and
    /// the flush path use this to pick work without racing recoveries.
    pub(crate) fn peek(&self, id: NodeId) -> Option<Arc<NodeOwner>> {
        self.entries.lock().get(&id).cloned()
    }

    /// The ids of all in-flight nodes.
    pub(crate) fn pending_ids(&self) -> Vec<NodeId> {
        self.entries.lock().keys().copied().collect()
    }

    /// Removes `id` after a completed write, unless a recovery already took
    /// the entry and reinstated it into the cache.
    pub(crate) fn complete(&self, id: NodeId, owner: &Arc<NodeOwner>) {
        let mut entries = self.entries.lock();
        if entries.get(&id).is_some_and(|current| Arc::ptr_eq(current, owner)) {
            entries.remove(&id);
        }
    }

    /// Sends the stop order to the writer thread.
    pub(crate) fn stop(&self) {
        let _ = self.orders.send(WriteOrder::Stop);
    }

    /// The number of in-flight nodes.
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
