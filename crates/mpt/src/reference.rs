//! Node references: an id plus a cached pointer to its cache owner.

use crate::{manager::NodeOwner, NodeId};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// A reference to a node, pairing its [NodeId] with a weak, cacheable
/// pointer to the cache entry that owned the node when it was last
/// resolved.
///
/// The owner pointer is a fast path only: it may be stale (the entry was
/// evicted) or absent, in which case resolution falls back to the node
/// manager's index. Equality, ordering and hashing are defined over the id
/// alone.
#[derive(Debug, Default)]
pub struct NodeReference {
    id: NodeId,
    owner: Mutex<Weak<NodeOwner>>,
}

impl NodeReference {
    /// Creates a reference to `id` with no cached owner.
    pub fn new(id: NodeId) -> Self {
        Self { id, owner: Mutex::new(Weak::new()) }
    }

    /// Creates a reference to `id` with `owner` pre-cached.
    pub(crate) fn with_owner(id: NodeId, owner: &Arc<NodeOwner>) -> Self {
        Self { id, owner: Mutex::new(Arc::downgrade(owner)) }
    }

    /// The referenced node id.
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Whether this references the empty node.
    pub const fn is_empty(&self) -> bool {
        self.id.is_empty()
    }

    /// The cached owner, if it is still alive and valid.
    pub(crate) fn cached_owner(&self) -> Option<Arc<NodeOwner>> {
        let owner = self.owner.lock().upgrade()?;
        owner.is_valid().then_some(owner)
    }

    /// Remembers `owner` as the fast path for the next resolution.
    pub(crate) fn cache_owner(&self, owner: &Arc<NodeOwner>) {
        *self.owner.lock() = Arc::downgrade(owner);
    }
}

impl Clone for NodeReference {
    fn clone(&self) -> Self {
        Self { id: self.id, owner: Mutex::new(self.owner.lock().clone()) }
    }
}

impl PartialEq for NodeReference {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeReference {}

impl std::hash::Hash for NodeReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl From<NodeId> for NodeReference {
    fn from(id: NodeId) -> Self {
        Self::new(id)
    }
}

impl std::fmt::Display for NodeReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.id.fmt(f)
    }
}
