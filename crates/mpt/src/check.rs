//! Structural invariant checks over reachable tries.
//!
//! [check_roots] validates, for every node reachable from the given roots:
//!
//! - branches hold at least two children;
//! - extensions hold a non-empty path and a branch child;
//! - leaves sit on the path their hashed key dictates, and their tracked
//!   path length matches their position;
//! - account leaves appear only in the address trie, value leaves only in
//!   storage tries;
//! - a frozen node's children are frozen;
//! - a cached non-dirty hash equals the recomputed canonical hash;
//! - no node is reachable twice unless it is frozen (sharing is legal only
//!   through freezing).

use crate::{
    hasher::Hasher, ForestError, ForestResult, HashScheme, Node, NodeId, NodeManager,
    NodeReference,
};
use alloy_primitives::keccak256;
use std::collections::HashMap;

pub(crate) struct Checker<'a> {
    manager: &'a NodeManager,
    hasher: Hasher<'a>,
    track_path_lengths: bool,
    hashed_paths: bool,
    /// Nodes already validated, with their frozen state; reaching an
    /// unfrozen node twice is an ownership violation.
    seen: HashMap<NodeId, bool>,
}

impl<'a> Checker<'a> {
    pub(crate) fn new(
        manager: &'a NodeManager,
        scheme: HashScheme,
        track_path_lengths: bool,
        hashed_paths: bool,
    ) -> Self {
        Self {
            manager,
            hasher: Hasher::new(manager, scheme),
            track_path_lengths,
            hashed_paths,
            seen: HashMap::new(),
        }
    }

    fn key_path(&self, key: &[u8]) -> Vec<u8> {
        if self.hashed_paths {
            unpack_nibbles(keccak256(key).as_slice())
        } else {
            unpack_nibbles(key)
        }
    }

    /// Validates every node reachable from `roots`.
    pub(crate) fn check_roots(&mut self, roots: &[NodeReference]) -> ForestResult<()> {
        for root in roots {
            let mut prefix = Vec::with_capacity(64);
            self.check_node(root, &mut prefix, false)?;
        }
        Ok(())
    }

    fn check_node(
        &mut self,
        reference: &NodeReference,
        prefix: &mut Vec<u8>,
        in_storage: bool,
    ) -> ForestResult<()> {
        if reference.is_empty() {
            return Ok(());
        }
        let id = reference.id();
        if let Some(frozen) = self.seen.get(&id) {
            if !frozen {
                return Err(ForestError::corrupt(id, "unfrozen node reachable twice"));
            }
            // A frozen subtree validated once is valid everywhere.
            return Ok(());
        }

        let handle = self.manager.get_read(reference)?;
        self.seen.insert(id, handle.is_frozen());

        match &*handle {
            Node::Empty => Ok(()),
            Node::Branch(branch) => {
                if branch.child_count() < 2 {
                    return Err(ForestError::corrupt(id, "branch with fewer than two children"));
                }
                // A clean own hash over stale child hashes is legal (the
                // node-hash record flavor restores exactly that state); the
                // hash can only be revalidated once the children are clean.
                if !branch.hash_dirty && branch.dirty_hashes == 0 {
                    let expected = self.hasher.node_hash(&handle)?;
                    let Node::Branch(branch) = &*handle else { unreachable!() };
                    if branch.hash != expected {
                        return Err(ForestError::corrupt(id, "cached branch hash mismatch"));
                    }
                }
                let Node::Branch(branch) = &*handle else { unreachable!() };
                let frozen = branch.frozen;
                let children: Vec<(u8, NodeReference)> = (0..16u8)
                    .filter(|slot| !branch.children[*slot as usize].is_empty())
                    .map(|slot| (slot, branch.children[slot as usize].clone()))
                    .collect();
                drop(handle);
                for (slot, child) in children {
                    if frozen && !self.is_frozen(&child)? {
                        return Err(ForestError::corrupt(id, "frozen branch with unfrozen child"));
                    }
                    prefix.push(slot);
                    self.check_node(&child, prefix, in_storage)?;
                    prefix.pop();
                }
                Ok(())
            }
            Node::Extension(extension) => {
                if extension.path.is_empty() {
                    return Err(ForestError::corrupt(id, "extension with an empty path"));
                }
                if extension.next.id().kind() != crate::NodeKind::Branch {
                    return Err(ForestError::corrupt(id, "extension child is not a branch"));
                }
                if !extension.hash_dirty && !extension.next_hash_dirty {
                    let expected = self.hasher.node_hash(&handle)?;
                    let Node::Extension(extension) = &*handle else { unreachable!() };
                    if extension.hash != expected {
                        return Err(ForestError::corrupt(id, "cached extension hash mismatch"));
                    }
                }
                let Node::Extension(extension) = &*handle else { unreachable!() };
                let frozen = extension.frozen;
                let next = extension.next.clone();
                let path = extension.path.unpack();
                drop(handle);
                if frozen && !self.is_frozen(&next)? {
                    return Err(ForestError::corrupt(id, "frozen extension with unfrozen child"));
                }
                prefix.extend_from_slice(&path);
                self.check_node(&next, prefix, in_storage)?;
                prefix.truncate(prefix.len() - path.len());
                Ok(())
            }
            Node::Account(account) => {
                if in_storage {
                    return Err(ForestError::corrupt(id, "account leaf inside a storage trie"));
                }
                let full = self.key_path(account.address.as_slice());
                if !full.starts_with(prefix) {
                    return Err(ForestError::corrupt(id, "account leaf off its key path"));
                }
                if self.track_path_lengths
                    && account.path_length as usize != full.len() - prefix.len()
                {
                    return Err(ForestError::corrupt(id, "account path length mismatch"));
                }
                if !account.hash_dirty && !account.storage_hash_dirty {
                    let expected = self.hasher.node_hash(&handle)?;
                    let Node::Account(account) = &*handle else { unreachable!() };
                    if account.hash != expected {
                        return Err(ForestError::corrupt(id, "cached account hash mismatch"));
                    }
                }
                let Node::Account(account) = &*handle else { unreachable!() };
                let frozen = account.frozen;
                let storage = account.storage.clone();
                drop(handle);
                if frozen && !self.is_frozen(&storage)? {
                    return Err(ForestError::corrupt(id, "frozen account with unfrozen storage"));
                }
                let mut storage_prefix = Vec::with_capacity(64);
                self.check_node(&storage, &mut storage_prefix, true)
            }
            Node::Value(value) => {
                if !in_storage {
                    return Err(ForestError::corrupt(id, "value leaf outside a storage trie"));
                }
                let full = self.key_path(value.key.as_slice());
                if !full.starts_with(prefix) {
                    return Err(ForestError::corrupt(id, "value leaf off its key path"));
                }
                if self.track_path_lengths
                    && value.path_length as usize != full.len() - prefix.len()
                {
                    return Err(ForestError::corrupt(id, "value path length mismatch"));
                }
                if !value.hash_dirty {
                    let expected = self.hasher.node_hash(&handle)?;
                    let Node::Value(value) = &*handle else { unreachable!() };
                    if value.hash != expected {
                        return Err(ForestError::corrupt(id, "cached value hash mismatch"));
                    }
                }
                Ok(())
            }
        }
    }

    fn is_frozen(&self, reference: &NodeReference) -> ForestResult<bool> {
        if reference.is_empty() {
            return Ok(true);
        }
        Ok(self.manager.get_read(reference)?.is_frozen())
    }
}

fn unpack_nibbles(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().flat_map(|byte| [byte >> 4, byte & 0x0F]).collect()
}
