//! The node manager: a bounded LRU cache of shared node cells in front of
//! the typed stocks.
//!
//! The manager resolves [NodeReference]s to cache owners and vends the four
//! handle flavors of the underlying [Shared] cell. On a miss the node is
//! loaded through the [NodeSource]; when the cache is full the least
//! recently used entry is evicted. Clean evictees are dropped, dirty ones
//! are parked in the write buffer and persisted by a dedicated writer
//! thread. A concurrent miss for a node that is still in flight recovers
//! the very node object from the buffer instead of reading a stale record
//! from the stock.
//!
//! Lock order is `miss → buffer → index → list`; the miss mutex serializes
//! miss handling, recoveries and evictions, which is what makes the
//! recovery protocol airtight: while it runs, the union of cache and write
//! buffer always contains every live dirty node.
//!
//! [Shared]: crate::Shared

mod buffer;
mod cache;

use crate::{
    shared, AccountNode, BranchNode, ExtensionNode, ForestError, ForestResult, Node, NodeId,
    NodeReference, NodeSource, ValueNode,
};
use buffer::{WriteBuffer, WriteOrder};
use cache::LruList;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread::JoinHandle,
    time::Duration,
};
use tracing::{debug, trace, warn};

/// A cache entry: the owner of one node's shared cell.
///
/// Owners are handed around behind `Arc`s; the cache index holds one strong
/// reference, handles and the write buffer hold further ones. An owner that
/// is evicted from the index is marked invalid so that references caching a
/// pointer to it fall back to an index lookup.
#[derive(Debug)]
pub struct NodeOwner {
    id: NodeId,
    cell: shared::Shared<Node>,
    valid: AtomicBool,
    dirty: AtomicBool,
}

impl NodeOwner {
    fn new(id: NodeId, node: Node, dirty: bool) -> Self {
        Self {
            id,
            cell: shared::Shared::new(node),
            valid: AtomicBool::new(true),
            dirty: AtomicBool::new(dirty),
        }
    }

    /// The id of the owned node.
    pub const fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn cell(&self) -> &shared::Shared<Node> {
        &self.cell
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn set_valid(&self) {
        self.valid.store(true, Ordering::Release);
    }

    fn mark_invalid(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clears the dirty bit, returning whether it was set. The caller must
    /// hold at least a read handle on the cell, so that the state it then
    /// serializes cannot be mutated under it.
    fn claim_clean(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

/// A read handle on a managed node.
#[derive(Debug)]
pub struct NodeReadHandle {
    owner: Arc<NodeOwner>,
    guard: shared::ReadHandle<Node>,
}

impl NodeReadHandle {
    /// The id of the node this handle grants access to.
    pub fn id(&self) -> NodeId {
        self.owner.id()
    }
}

impl std::ops::Deref for NodeReadHandle {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.guard
    }
}

/// A view handle on a managed node; shared like a read handle, but marking
/// access paths that never recompute hashes.
#[derive(Debug)]
pub struct NodeViewHandle {
    owner: Arc<NodeOwner>,
    guard: shared::ViewHandle<Node>,
}

impl NodeViewHandle {
    /// The id of the node this handle grants access to.
    pub fn id(&self) -> NodeId {
        self.owner.id()
    }
}

impl std::ops::Deref for NodeViewHandle {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.guard
    }
}

/// An exclusive write handle on a managed node.
#[derive(Debug)]
pub struct NodeWriteHandle {
    owner: Arc<NodeOwner>,
    guard: shared::WriteHandle<Node>,
}

impl NodeWriteHandle {
    /// The id of the node this handle grants access to.
    pub fn id(&self) -> NodeId {
        self.owner.id()
    }

    /// Marks the node dirty so the next eviction or flush persists it.
    pub fn mark_dirty(&self) {
        self.owner.set_dirty();
    }
}

impl std::ops::Deref for NodeWriteHandle {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.guard
    }
}

impl std::ops::DerefMut for NodeWriteHandle {
    fn deref_mut(&mut self) -> &mut Node {
        &mut self.guard
    }
}

/// A hash handle on a managed node: exclusive against writers and other
/// hashers, shared with readers and views.
#[derive(Debug)]
pub struct NodeHashHandle {
    owner: Arc<NodeOwner>,
    guard: shared::HashHandle<Node>,
}

impl NodeHashHandle {
    /// The id of the node this handle grants access to.
    pub fn id(&self) -> NodeId {
        self.owner.id()
    }

    /// Stores computed hashes through a short exclusive upgrade and marks
    /// the node dirty.
    pub fn write_back(&mut self, update: impl FnOnce(&mut Node)) {
        self.guard.write_back(update);
        self.owner.set_dirty();
    }
}

impl std::ops::Deref for NodeHashHandle {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.guard
    }
}

/// Orders for the background subtree releaser.
#[derive(Debug)]
enum ReleaseOrder {
    /// Release every unfrozen node reachable from the given root.
    Subtree(NodeId),
    /// Exit after processing all earlier orders.
    Stop,
}

/// The bounded node cache and its background machinery.
pub struct NodeManager {
    capacity: usize,
    source: Arc<NodeSource>,
    index: Mutex<HashMap<NodeId, Arc<NodeOwner>>>,
    list: Mutex<LruList>,
    /// Serializes miss handling, buffer recovery and eviction.
    miss: Mutex<()>,
    buffer: Arc<WriteBuffer>,
    empty: Arc<NodeOwner>,
    error: Arc<Mutex<Option<ForestError>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    releases: crossbeam_channel::Sender<ReleaseOrder>,
    releaser: Mutex<Option<JoinHandle<()>>>,
}

impl NodeManager {
    /// Creates a manager over `source` caching at most `capacity` nodes,
    /// with a write-back channel of `write_buffer_capacity` orders.
    ///
    /// The empty node occupies a pinned sentinel outside the capacity
    /// accounting and is never evicted.
    pub fn new(source: NodeSource, capacity: usize, write_buffer_capacity: usize) -> Arc<Self> {
        let source = Arc::new(source);
        let (buffer, orders) = WriteBuffer::new(write_buffer_capacity);
        let error = Arc::new(Mutex::new(None));

        let writer = std::thread::Builder::new()
            .name("grove-node-writer".into())
            .spawn({
                let buffer = Arc::clone(&buffer);
                let source = Arc::clone(&source);
                let error = Arc::clone(&error);
                move || writer_loop(&buffer, &source, &error, &orders)
            })
            .expect("failed to spawn the node writer thread");

        let (releases, release_orders) = crossbeam_channel::unbounded();
        let manager = Arc::new(Self {
            capacity: capacity.max(1),
            source,
            index: Mutex::new(HashMap::new()),
            list: Mutex::new(LruList::default()),
            miss: Mutex::new(()),
            buffer,
            empty: Arc::new(NodeOwner::new(NodeId::EMPTY, Node::Empty, false)),
            error,
            writer: Mutex::new(Some(writer)),
            releases,
            releaser: Mutex::new(None),
        });

        let releaser = std::thread::Builder::new()
            .name("grove-subtree-releaser".into())
            .spawn({
                let manager = Arc::downgrade(&manager);
                move || releaser_loop(&manager, &release_orders)
            })
            .expect("failed to spawn the subtree releaser thread");
        *manager.releaser.lock() = Some(releaser);

        manager
    }

    /// Acquires a read handle for the referenced node.
    pub fn get_read(&self, reference: &NodeReference) -> ForestResult<NodeReadHandle> {
        let owner = self.resolve(reference)?;
        let guard = owner.cell().read();
        Ok(NodeReadHandle { owner, guard })
    }

    /// Acquires a view handle for the referenced node.
    pub fn get_view(&self, reference: &NodeReference) -> ForestResult<NodeViewHandle> {
        let owner = self.resolve(reference)?;
        let guard = owner.cell().view();
        Ok(NodeViewHandle { owner, guard })
    }

    /// Acquires a hash handle for the referenced node.
    pub fn get_hash(&self, reference: &NodeReference) -> ForestResult<NodeHashHandle> {
        let owner = self.resolve(reference)?;
        let guard = owner.cell().hash();
        Ok(NodeHashHandle { owner, guard })
    }

    /// Acquires an exclusive write handle for the referenced node.
    pub fn get_write(&self, reference: &NodeReference) -> ForestResult<NodeWriteHandle> {
        let owner = self.resolve(reference)?;
        let guard = owner.cell().write();
        Ok(NodeWriteHandle { owner, guard })
    }

    /// Creates a branch node; see [Self::create].
    pub fn create_branch(&self, node: BranchNode) -> ForestResult<(NodeReference, NodeWriteHandle)> {
        self.create(Node::Branch(node))
    }

    /// Creates an extension node; see [Self::create].
    pub fn create_extension(
        &self,
        node: ExtensionNode,
    ) -> ForestResult<(NodeReference, NodeWriteHandle)> {
        self.create(Node::Extension(node))
    }

    /// Creates an account node; see [Self::create].
    pub fn create_account(
        &self,
        node: AccountNode,
    ) -> ForestResult<(NodeReference, NodeWriteHandle)> {
        self.create(Node::Account(node))
    }

    /// Creates a value node; see [Self::create].
    pub fn create_value(&self, node: ValueNode) -> ForestResult<(NodeReference, NodeWriteHandle)> {
        self.create(Node::Value(node))
    }

    /// Allocates a stock slot for `node`, inserts it into the cache dirty,
    /// and returns a reference plus an exclusive handle on the fresh node.
    ///
    /// May block behind the write buffer when the insertion evicts a dirty
    /// node while the order channel is full.
    pub fn create(&self, node: Node) -> ForestResult<(NodeReference, NodeWriteHandle)> {
        let _miss = self.miss.lock();
        let id = self.source.reserve(node.kind())?;
        trace!(target: "mpt::manager", %id, "creating node");
        let owner = Arc::new(NodeOwner::new(id, node, true));
        let guard = owner.cell().write();
        let evicted = self.insert_entry(Arc::clone(&owner));
        if let Some(victim) = evicted {
            self.buffer.add(victim);
        }
        let reference = NodeReference::with_owner(id, &owner);
        Ok((reference, NodeWriteHandle { owner, guard }))
    }

    /// Marks the node behind `handle` dirty.
    pub fn update(&self, handle: &NodeWriteHandle) {
        handle.mark_dirty();
    }

    /// Releases the node with the given id: the cache entry, any pending
    /// write-back, and the stock slot.
    ///
    /// # Panics
    /// Releasing the same id twice panics in the backing stock.
    pub fn release(&self, id: NodeId) -> ForestResult<()> {
        assert!(!id.is_empty(), "the empty node is never released");
        let _miss = self.miss.lock();
        trace!(target: "mpt::manager", %id, "releasing node");
        let owner = self.index.lock().remove(&id);
        self.list.lock().remove(id);
        let owner = owner.or_else(|| self.buffer.peek(id));
        match owner {
            Some(owner) => {
                owner.mark_invalid();
                // Holding the cell exclusively fences off a writer that is
                // serializing this very node: it either finished before the
                // slot dies, or finds the buffer entry gone and skips.
                let _guard = owner.cell().write();
                self.buffer.discard(id);
                self.source.delete(id)
            }
            None => {
                self.buffer.discard(id);
                self.source.delete(id)
            }
        }
    }

    /// Schedules the release of every unfrozen node reachable from `root`.
    /// Fire-and-forget: errors latch on the manager error cell.
    pub fn release_trie_async(&self, root: &NodeReference) {
        if root.is_empty() {
            return;
        }
        let _ = self.releases.send(ReleaseOrder::Subtree(root.id()));
    }

    /// Writes all dirty nodes (cached and in-flight) to the stocks, flushes
    /// them, and surfaces any error latched by the background threads.
    ///
    /// Must not be called while node handles are outstanding.
    pub fn flush(&self) -> ForestResult<()> {
        debug!(target: "mpt::manager", cached = self.cached_node_count(), "flushing node manager");
        let mut ids: Vec<NodeId> = self.index.lock().keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let owner = self.index.lock().get(&id).cloned();
            let Some(owner) = owner else { continue };
            self.store_owner(id, &owner)?;
        }

        // Drain the write buffer synchronously rather than waiting for the
        // writer thread; concurrent double-writes are harmless because stock
        // writes are idempotent for a given id.
        for id in self.buffer.pending_ids() {
            let Some(owner) = self.buffer.peek(id) else { continue };
            self.store_owner(id, &owner)?;
            self.buffer.complete(id, &owner);
        }

        self.source.flush()?;
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        Ok(())
    }

    /// Flushes, stops the background threads, and closes the stocks.
    pub fn close(&self) -> ForestResult<()> {
        // Stop the releaser first: queued subtree releases complete before
        // the final flush, later ones are rejected by the closed stocks.
        let _ = self.releases.send(ReleaseOrder::Stop);
        if let Some(handle) = self.releaser.lock().take() {
            let _ = handle.join();
        }

        self.flush()?;

        self.buffer.stop();
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
        // The writer exits only after draining its queue, but a recovery
        // race can leave stragglers; write them here.
        for id in self.buffer.pending_ids() {
            let Some(owner) = self.buffer.peek(id) else { continue };
            self.store_owner(id, &owner)?;
            self.buffer.complete(id, &owner);
        }

        self.source.close()?;
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        Ok(())
    }

    /// The number of cached nodes, excluding the empty sentinel.
    pub fn cached_node_count(&self) -> usize {
        self.index.lock().len()
    }

    /// The length of the LRU list; always equals the index size.
    pub fn lru_len(&self) -> usize {
        self.list.lock().len()
    }

    /// The number of nodes awaiting write-back.
    pub fn write_buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// The node source backing this manager.
    pub fn source(&self) -> &NodeSource {
        &self.source
    }

    /// Takes the error latched by the background threads, if any.
    pub fn take_error(&self) -> Option<ForestError> {
        self.error.lock().take()
    }

    /// An estimate of the heap memory held by the cache and the stocks.
    pub fn memory_footprint(&self) -> usize {
        let per_entry = std::mem::size_of::<Node>()
            + std::mem::size_of::<NodeOwner>()
            + 4 * std::mem::size_of::<usize>();
        self.cached_node_count() * per_entry + self.source.memory_footprint()
    }

    fn latch_error(&self, err: ForestError) {
        warn!(target: "mpt::manager", %err, "latching background error");
        let mut cell = self.error.lock();
        if cell.is_none() {
            *cell = Some(err);
        }
    }

    fn store_owner(&self, id: NodeId, owner: &Arc<NodeOwner>) -> ForestResult<()> {
        let guard = owner.cell().read();
        if owner.claim_clean() {
            if let Err(err) = self.source.store(id, &guard) {
                if is_release_race(&err) {
                    // The node was released while queued for write-back.
                    return Ok(());
                }
                owner.set_dirty();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Resolves a reference to its cache owner, loading through the source
    /// on a miss.
    fn resolve(&self, reference: &NodeReference) -> ForestResult<Arc<NodeOwner>> {
        if reference.is_empty() {
            return Ok(Arc::clone(&self.empty));
        }
        if let Some(owner) = reference.cached_owner() {
            self.list.lock().touch(owner.id());
            return Ok(owner);
        }
        if let Some(owner) = self.lookup(reference.id()) {
            reference.cache_owner(&owner);
            return Ok(owner);
        }
        let owner = self.handle_miss(reference.id())?;
        reference.cache_owner(&owner);
        Ok(owner)
    }

    fn lookup(&self, id: NodeId) -> Option<Arc<NodeOwner>> {
        let owner = self.index.lock().get(&id).cloned()?;
        self.list.lock().touch(id);
        Some(owner)
    }

    /// The miss path: recover the node from the write buffer or load it
    /// from the stock, then insert it into the cache.
    fn handle_miss(&self, id: NodeId) -> ForestResult<Arc<NodeOwner>> {
        let _miss = self.miss.lock();

        // Someone else may have completed the same miss while we waited.
        if let Some(owner) = self.lookup(id) {
            return Ok(owner);
        }

        // Recovery: the cache entry is reinstated while the buffer lock is
        // still held; only then is the buffer entry considered gone.
        let mut evicted = None;
        let recovered = self.buffer.recover(id, |owner| {
            trace!(target: "mpt::manager", %id, "recovering node from the write buffer");
            evicted = self.insert_entry(Arc::clone(owner));
            Arc::clone(owner)
        });
        if let Some(owner) = recovered {
            if let Some(victim) = evicted {
                self.buffer.add(victim);
            }
            return Ok(owner);
        }

        trace!(target: "mpt::manager", %id, "cache miss, loading from stock");
        let node = self.source.load(id)?;
        let owner = Arc::new(NodeOwner::new(id, node, false));
        let evicted = self.insert_entry(Arc::clone(&owner));
        if let Some(victim) = evicted {
            self.buffer.add(victim);
        }
        Ok(owner)
    }

    /// Inserts `owner` into the index and LRU list, evicting the least
    /// recently used entry when over capacity. Returns a dirty evictee for
    /// the caller to park in the write buffer once all locks are dropped.
    fn insert_entry(&self, owner: Arc<NodeOwner>) -> Option<Arc<NodeOwner>> {
        let id = owner.id();
        owner.set_valid();
        let mut index = self.index.lock();
        let mut list = self.list.lock();
        index.insert(id, owner);
        list.push_front(id);

        if list.len() <= self.capacity {
            return None;
        }
        let victim_id = list.pop_back()?;
        let victim = index.remove(&victim_id)?;
        victim.mark_invalid();
        if victim.is_dirty() {
            trace!(target: "mpt::manager", id = %victim_id, "evicting dirty node");
            return Some(victim);
        }
        trace!(target: "mpt::manager", id = %victim_id, "evicting clean node");
        None
    }
}

impl std::fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeManager")
            .field("capacity", &self.capacity)
            .field("cached", &self.cached_node_count())
            .field("in_flight", &self.buffer.len())
            .finish()
    }
}

impl Drop for NodeManager {
    fn drop(&mut self) {
        let _ = self.releases.send(ReleaseOrder::Stop);
        if let Some(handle) = self.releaser.lock().take() {
            let _ = handle.join();
        }
        self.buffer.stop();
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
    }
}

/// The writer thread: persists buffered nodes, never blocking on a node
/// lock. A node whose lock is held is retried later, so a thread that
/// triggers evictions while holding write handles cannot deadlock against
/// the writer even with an order channel of size one.
fn writer_loop(
    buffer: &WriteBuffer,
    source: &NodeSource,
    error: &Mutex<Option<ForestError>>,
    orders: &crossbeam_channel::Receiver<WriteOrder>,
) {
    let mut pending: VecDeque<NodeId> = VecDeque::new();
    let mut stopping = false;

    loop {
        if pending.is_empty() && !stopping {
            match orders.recv() {
                Ok(WriteOrder::Write(id)) => pending.push_back(id),
                Ok(WriteOrder::Stop) | Err(_) => stopping = true,
            }
        }
        loop {
            match orders.try_recv() {
                Ok(WriteOrder::Write(id)) => pending.push_back(id),
                Ok(WriteOrder::Stop) => {
                    stopping = true;
                    break;
                }
                Err(_) => break,
            }
        }

        let mut retry = VecDeque::new();
        while let Some(id) = pending.pop_front() {
            let Some(owner) = buffer.peek(id) else { continue };
            let guard = if stopping {
                // On shutdown no new handles appear; blocking is safe.
                Some(owner.cell().read())
            } else {
                owner.cell().try_read()
            };
            let Some(guard) = guard else {
                retry.push_back(id);
                continue;
            };
            // Re-validate under the guard: a concurrent release or recovery
            // fences on this cell and removes the entry first.
            if !buffer.peek(id).is_some_and(|current| Arc::ptr_eq(&current, &owner)) {
                continue;
            }
            if owner.claim_clean() {
                if let Err(err) = source.store(id, &guard) {
                    // A release may win the race against the write-back; the
                    // node is simply gone then.
                    if !is_release_race(&err) {
                        warn!(target: "mpt::manager", %id, %err, "write-back failed");
                        owner.set_dirty();
                        let mut cell = error.lock();
                        if cell.is_none() {
                            *cell = Some(err);
                        }
                        // Drop the entry regardless: the error is latched,
                        // and retrying forever would wedge the shutdown path.
                    }
                }
            }
            drop(guard);
            buffer.complete(id, &owner);
        }
        pending = retry;

        if stopping && pending.is_empty() {
            break;
        }
        if !stopping && !pending.is_empty() {
            // All pending nodes are locked right now; yield before retrying.
            std::thread::sleep(Duration::from_micros(50));
        }
    }
    debug!(target: "mpt::manager", "node writer stopped");
}

/// The background releaser: walks scheduled subtrees with view handles and
/// releases every unfrozen node bottom-up.
fn releaser_loop(
    manager: &Weak<NodeManager>,
    orders: &crossbeam_channel::Receiver<ReleaseOrder>,
) {
    while let Ok(order) = orders.recv() {
        match order {
            ReleaseOrder::Subtree(root) => {
                let Some(manager) = manager.upgrade() else { break };
                if let Err(err) = release_subtree(&manager, root) {
                    manager.latch_error(err);
                }
            }
            ReleaseOrder::Stop => break,
        }
    }
    debug!(target: "mpt::manager", "subtree releaser stopped");
}

/// Releases every unfrozen node reachable from `id`, bottom-up. Frozen
/// nodes belong to retained history and terminate the walk.
fn release_subtree(manager: &NodeManager, id: NodeId) -> ForestResult<()> {
    if id.is_empty() {
        return Ok(());
    }
    let children = {
        let handle = manager.get_view(&NodeReference::new(id))?;
        if handle.is_frozen() {
            return Ok(());
        }
        child_ids(&handle)
    };
    for child in children {
        release_subtree(manager, child)?;
    }
    manager.release(id)
}

/// Whether a write-back failure means the target slot was concurrently
/// released rather than broken.
fn is_release_race(err: &ForestError) -> bool {
    matches!(
        err,
        ForestError::Stock(
            grove_stock::StockError::BadIndex(_) | grove_stock::StockError::FreedSlot(_)
        )
    )
}

fn child_ids(node: &Node) -> Vec<NodeId> {
    match node {
        Node::Empty | Node::Value(_) => Vec::new(),
        Node::Branch(branch) => branch
            .children
            .iter()
            .filter(|child| !child.is_empty())
            .map(|child| child.id())
            .collect(),
        Node::Extension(extension) => vec![extension.next.id()],
        Node::Account(account) => {
            if account.storage.is_empty() {
                Vec::new()
            } else {
                vec![account.storage.id()]
            }
        }
    }
}
