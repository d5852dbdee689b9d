//! The five trie node variants.
//!
//! A trie is built from [Branch], [Extension], [Account] and [Value] nodes,
//! with [Node::Empty] standing in for absent subtrees. Account nodes split
//! the key space: above them lives the address trie, below them each
//! account's storage trie of value leaves.
//!
//! Every variant caches its own hash together with a dirty bit, and inner
//! variants additionally cache the hashes of their children. The dirty bits
//! are the hash engine's single source of truth: any mutation that changes a
//! child marks the parent's per-child bit and the parent's own hash dirty.
//!
//! [Branch]: BranchNode
//! [Extension]: ExtensionNode
//! [Account]: AccountNode
//! [Value]: ValueNode

use crate::{AccountInfo, NodeKind, NodeReference, PackedNibbles};
use alloy_primitives::{Address, B256};

/// A node of the trie, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// The absent subtree.
    Empty,
    /// A 16-way inner node.
    Branch(BranchNode),
    /// A path-compression node.
    Extension(ExtensionNode),
    /// An account leaf, rooting the account's storage trie.
    Account(AccountNode),
    /// A storage-slot leaf.
    Value(ValueNode),
}

impl Node {
    /// The kind tag of this node.
    pub const fn kind(&self) -> NodeKind {
        match self {
            Self::Empty => NodeKind::Empty,
            Self::Branch(_) => NodeKind::Branch,
            Self::Extension(_) => NodeKind::Extension,
            Self::Account(_) => NodeKind::Account,
            Self::Value(_) => NodeKind::Value,
        }
    }

    /// Whether this node is frozen. The empty node is always frozen.
    pub const fn is_frozen(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Branch(node) => node.frozen,
            Self::Extension(node) => node.frozen,
            Self::Account(node) => node.frozen,
            Self::Value(node) => node.frozen,
        }
    }

    /// Marks this node frozen. Freezing is one-way.
    pub fn mark_frozen(&mut self) {
        match self {
            Self::Empty => {}
            Self::Branch(node) => node.frozen = true,
            Self::Extension(node) => node.frozen = true,
            Self::Account(node) => node.frozen = true,
            Self::Value(node) => node.frozen = true,
        }
    }
}

/// A 16-way inner node with per-child hash caching.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchNode {
    /// Child subtrees indexed by hex nibble; empty references for vacant
    /// slots.
    pub children: [NodeReference; 16],
    /// Cached child hashes, valid where the matching [Self::dirty_hashes]
    /// bit is clear.
    pub child_hashes: [B256; 16],
    /// Bitset of child slots whose cached hash is stale.
    pub dirty_hashes: u16,
    /// Bitset of child slots known to hold frozen subtrees; used to
    /// short-circuit re-freezing.
    pub frozen_children: u16,
    /// Bitset of child slots whose subtree is small enough to be inlined
    /// into this node's hash preimage (Ethereum-style hashing only).
    pub embedded_children: u16,
    /// This node's cached hash, valid when [Self::hash_dirty] is clear.
    pub hash: B256,
    /// Whether [Self::hash] is stale.
    pub hash_dirty: bool,
    /// Whether this node is immutable.
    pub frozen: bool,
}

impl BranchNode {
    /// Creates a branch with all slots vacant and a dirty hash.
    pub fn new() -> Self {
        Self {
            children: std::array::from_fn(|_| NodeReference::default()),
            child_hashes: [B256::ZERO; 16],
            dirty_hashes: 0,
            frozen_children: 0,
            embedded_children: 0,
            hash: B256::ZERO,
            hash_dirty: true,
            frozen: false,
        }
    }

    /// The number of non-empty children.
    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|child| !child.is_empty()).count()
    }

    /// The slot of the only non-empty child, if exactly one remains.
    pub fn single_child_slot(&self) -> Option<usize> {
        let mut found = None;
        for (slot, child) in self.children.iter().enumerate() {
            if !child.is_empty() {
                if found.is_some() {
                    return None;
                }
                found = Some(slot);
            }
        }
        found
    }

    /// Whether the child in `slot` is recorded frozen.
    pub const fn is_child_frozen(&self, slot: usize) -> bool {
        self.frozen_children & (1 << slot) != 0
    }

    /// Marks the cached hash of `slot` stale, along with this node's own
    /// hash.
    pub fn mark_child_dirty(&mut self, slot: usize) {
        self.dirty_hashes |= 1 << slot;
        self.hash_dirty = true;
    }

    /// Replaces the child in `slot` and marks the affected hashes stale.
    /// A replaced child is no longer known to be frozen.
    pub fn set_child(&mut self, slot: usize, child: NodeReference) {
        self.children[slot] = child;
        self.frozen_children &= !(1 << slot);
        self.mark_child_dirty(slot);
    }

    /// An unfrozen copy of this node, used by copy-on-write mutations.
    /// All children of a frozen branch are frozen, and stay recorded so.
    pub fn unfrozen_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.frozen = false;
        copy.frozen_children = 0xFFFF;
        copy
    }
}

impl Default for BranchNode {
    fn default() -> Self {
        Self::new()
    }
}

/// A path-compression node holding a shared nibble prefix above a branch.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionNode {
    /// The compressed path; never empty.
    pub path: PackedNibbles,
    /// The child below the path; always a branch.
    pub next: NodeReference,
    /// The cached hash of [Self::next], valid when [Self::next_hash_dirty]
    /// is clear.
    pub next_hash: B256,
    /// Whether [Self::next_hash] is stale.
    pub next_hash_dirty: bool,
    /// Whether the child is inlined into this node's hash preimage
    /// (Ethereum-style hashing only).
    pub next_is_embedded: bool,
    /// This node's cached hash, valid when [Self::hash_dirty] is clear.
    pub hash: B256,
    /// Whether [Self::hash] is stale.
    pub hash_dirty: bool,
    /// Whether this node is immutable.
    pub frozen: bool,
}

impl ExtensionNode {
    /// Creates an extension of `path` above `next` with dirty hashes.
    pub fn new(path: PackedNibbles, next: NodeReference) -> Self {
        Self {
            path,
            next,
            next_hash: B256::ZERO,
            next_hash_dirty: true,
            next_is_embedded: false,
            hash: B256::ZERO,
            hash_dirty: true,
            frozen: false,
        }
    }

    /// An unfrozen copy of this node, used by copy-on-write mutations.
    pub fn unfrozen_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.frozen = false;
        copy
    }
}

/// An account leaf: the account record plus the root of its storage trie.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountNode {
    /// The account address.
    pub address: Address,
    /// Nonce, balance and code hash.
    pub info: AccountInfo,
    /// The root of this account's storage trie.
    pub storage: NodeReference,
    /// The cached hash of the storage trie, valid when
    /// [Self::storage_hash_dirty] is clear.
    pub storage_hash: B256,
    /// Whether [Self::storage_hash] is stale.
    pub storage_hash_dirty: bool,
    /// The number of address nibbles below the nearest enclosing branch
    /// slot; maintained only when path-length tracking is configured.
    pub path_length: u8,
    /// This node's cached hash, valid when [Self::hash_dirty] is clear.
    pub hash: B256,
    /// Whether [Self::hash] is stale.
    pub hash_dirty: bool,
    /// Whether this node is immutable.
    pub frozen: bool,
}

impl AccountNode {
    /// Creates an account leaf with no storage and dirty hashes.
    pub fn new(address: Address, info: AccountInfo, path_length: u8) -> Self {
        Self {
            address,
            info,
            storage: NodeReference::default(),
            storage_hash: B256::ZERO,
            storage_hash_dirty: true,
            path_length,
            hash: B256::ZERO,
            hash_dirty: true,
            frozen: false,
        }
    }

    /// An unfrozen copy of this node, used by copy-on-write mutations.
    pub fn unfrozen_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.frozen = false;
        copy
    }
}

/// A storage-slot leaf inside an account's storage trie.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueNode {
    /// The 32-byte storage key.
    pub key: B256,
    /// The 32-byte storage value; never zero for a live leaf.
    pub value: B256,
    /// The number of key nibbles below the nearest enclosing branch slot;
    /// maintained only when path-length tracking is configured.
    pub path_length: u8,
    /// This node's cached hash, valid when [Self::hash_dirty] is clear.
    pub hash: B256,
    /// Whether [Self::hash] is stale.
    pub hash_dirty: bool,
    /// Whether this node is immutable.
    pub frozen: bool,
}

impl ValueNode {
    /// Creates a value leaf with a dirty hash.
    pub fn new(key: B256, value: B256, path_length: u8) -> Self {
        Self { key, value, path_length, hash: B256::ZERO, hash_dirty: true, frozen: false }
    }

    /// An unfrozen copy of this node, used by copy-on-write mutations.
    pub fn unfrozen_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.frozen = false;
        copy
    }
}
