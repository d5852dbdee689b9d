//! The node update algebra: navigation, insertion, deletion and freezing.
//!
//! All mutations run through one generic engine, [TrieOps::set_leaf],
//! parameterized over a [LeafUpdate]: the account trie and the per-account
//! storage tries share the same branch/extension structure and differ only
//! in their leaf kind and leaf semantics. The engine preserves the trie
//! invariants on every path:
//!
//! - a branch keeps at least two children or collapses into the survivor,
//!   folding the branch nibble into a leaf path length or an extension;
//! - extensions keep non-empty paths and branch children; consecutive
//!   extensions are fused;
//! - frozen nodes are never mutated: the engine materializes copies along
//!   the mutated path and leaves the originals to their old roots.
//!
//! Every primitive returns `(reference, changed)`: `changed` is true only
//! when the node behind the passed reference was mutated in place, so a
//! parent knows to mark the child's cached hash stale. A mutation that
//! produced a new node reports the new reference with `changed == false`.

use crate::{
    AccountInfo, AccountNode, BranchNode, ExtensionNode, ForestError, ForestResult, Node,
    NodeKind, NodeManager, NodeReference, NodeWriteHandle, PackedNibbles, ValueNode,
};
use alloy_primitives::{Address, B256};

/// A key's full nibble path from its trie root: the unpacked nibbles of
/// either the (optionally hashed) address or the (optionally hashed)
/// storage key.
pub(crate) type FullPath = Vec<u8>;

/// The outcome classes of an update arriving at a leaf of its own kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafCase {
    /// The leaf stores a different key; the update may split the path.
    Mismatch,
    /// The leaf already holds the target state.
    Noop,
    /// The leaf content changes.
    Update,
    /// The leaf is removed.
    Remove,
}

/// One leaf-level mutation, driving the generic [TrieOps::set_leaf] engine.
pub(crate) trait LeafUpdate {
    /// The leaf kind living in the subtrie this update targets.
    const LEAF_KIND: NodeKind;

    /// Whether a missing key materializes a new leaf.
    fn creates_leaf(&self) -> bool;

    /// How an existing leaf of the right kind is affected.
    fn case_for(&self, node: &Node) -> LeafCase;

    /// The full path of the key stored in an existing leaf.
    fn existing_path(&self, node: &Node) -> FullPath;

    /// A fresh leaf carrying the update's payload.
    fn make_leaf(&self, path_length: u8) -> Node;

    /// Applies the update to an unfrozen leaf in place. Returns whether the
    /// node changed.
    fn apply(&self, ops: &TrieOps<'_>, node: &mut Node) -> ForestResult<bool>;

    /// Produces the updated copy of a frozen leaf, or `None` when the
    /// update turns out not to change it.
    fn apply_copy(&self, ops: &TrieOps<'_>, node: &Node) -> ForestResult<Option<Node>>;

    /// Releases whatever hangs off a leaf that is about to be removed.
    fn release_attachments(&self, ops: &TrieOps<'_>, node: &Node);
}

/// The algebra's execution context: the manager plus the configuration
/// bits the node operations depend on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TrieOps<'a> {
    pub(crate) manager: &'a NodeManager,
    pub(crate) track_path_lengths: bool,
}

enum Step<T> {
    Hit(T),
    Descend(NodeReference, usize),
}

impl<'a> TrieOps<'a> {
    pub(crate) fn new(manager: &'a NodeManager, track_path_lengths: bool) -> Self {
        Self { manager, track_path_lengths }
    }

    fn leaf_path_length(&self, remaining: usize) -> u8 {
        if self.track_path_lengths {
            remaining as u8
        } else {
            0
        }
    }

    /// Looks up the account leaf for `address`, returning its info, storage
    /// root and node id.
    pub(crate) fn find_account(
        &self,
        root: &NodeReference,
        address: &Address,
        path: &[u8],
    ) -> ForestResult<Option<(AccountInfo, NodeReference, crate::NodeId)>> {
        let mut current = root.clone();
        let mut offset = 0usize;
        loop {
            let step = {
                let handle = self.manager.get_read(&current)?;
                match &*handle {
                    Node::Empty => Step::Hit(None),
                    Node::Account(account) => Step::Hit((account.address == *address).then(|| {
                        (account.info, account.storage.clone(), handle.id())
                    })),
                    Node::Branch(branch) => {
                        let Some(nibble) = path.get(offset) else {
                            return Err(ForestError::corrupt(handle.id(), "key exhausted"));
                        };
                        Step::Descend(branch.children[*nibble as usize].clone(), offset + 1)
                    }
                    Node::Extension(extension) => {
                        if extension.path.is_prefix_of(&path[offset..]) {
                            Step::Descend(extension.next.clone(), offset + extension.path.len())
                        } else {
                            Step::Hit(None)
                        }
                    }
                    Node::Value(_) => return Err(ForestError::NotAnAccountLeaf),
                }
            };
            match step {
                Step::Hit(result) => return Ok(result),
                Step::Descend(next, at) => {
                    current = next;
                    offset = at;
                }
            }
        }
    }

    /// Reads the account info stored for `address`.
    pub(crate) fn get_account(
        &self,
        root: &NodeReference,
        address: &Address,
        path: &[u8],
    ) -> ForestResult<(AccountInfo, bool)> {
        Ok(match self.find_account(root, address, path)? {
            Some((info, _, _)) => (info, true),
            None => (AccountInfo::default(), false),
        })
    }

    /// Reads the value stored for `key` in the storage trie under
    /// `storage_root`. Absent slots read as the zero value.
    pub(crate) fn get_value(
        &self,
        storage_root: &NodeReference,
        key: &B256,
        path: &[u8],
    ) -> ForestResult<B256> {
        let mut current = storage_root.clone();
        let mut offset = 0usize;
        loop {
            let step = {
                let handle = self.manager.get_read(&current)?;
                match &*handle {
                    Node::Empty => Step::Hit(B256::ZERO),
                    Node::Value(value) => {
                        Step::Hit(if value.key == *key { value.value } else { B256::ZERO })
                    }
                    Node::Branch(branch) => {
                        let Some(nibble) = path.get(offset) else {
                            return Err(ForestError::corrupt(handle.id(), "key exhausted"));
                        };
                        Step::Descend(branch.children[*nibble as usize].clone(), offset + 1)
                    }
                    Node::Extension(extension) => {
                        if extension.path.is_prefix_of(&path[offset..]) {
                            Step::Descend(extension.next.clone(), offset + extension.path.len())
                        } else {
                            Step::Hit(B256::ZERO)
                        }
                    }
                    Node::Account(_) => return Err(ForestError::NotAnAccountLeaf),
                }
            };
            match step {
                Step::Hit(value) => return Ok(value),
                Step::Descend(next, at) => {
                    current = next;
                    offset = at;
                }
            }
        }
    }

    /// The generic mutation engine. `path` holds the nibbles of the target
    /// key that remain below the referenced node.
    pub(crate) fn set_leaf<U: LeafUpdate>(
        &self,
        root: &NodeReference,
        path: &[u8],
        update: &U,
    ) -> ForestResult<(NodeReference, bool)> {
        let handle = self.manager.get_write(root)?;
        match handle.kind() {
            NodeKind::Empty => {
                drop(handle);
                if !update.creates_leaf() {
                    return Ok((root.clone(), false));
                }
                let leaf = update.make_leaf(self.leaf_path_length(path.len()));
                let (reference, fresh) = self.manager.create(leaf)?;
                drop(fresh);
                Ok((reference, false))
            }
            kind if kind == U::LEAF_KIND => self.set_at_leaf(handle, root, path, update),
            NodeKind::Branch => self.set_below_branch(handle, root, path, update),
            NodeKind::Extension => self.set_below_extension(handle, root, path, update),
            _ => Err(ForestError::NotAnAccountLeaf),
        }
    }

    /// The engine's leaf arm: the update reached a leaf of its own kind.
    fn set_at_leaf<U: LeafUpdate>(
        &self,
        mut handle: NodeWriteHandle,
        root: &NodeReference,
        path: &[u8],
        update: &U,
    ) -> ForestResult<(NodeReference, bool)> {
        let frozen = handle.is_frozen();
        match update.case_for(&handle) {
            LeafCase::Noop => Ok((root.clone(), false)),
            LeafCase::Update => {
                if frozen {
                    let copy = update.apply_copy(self, &handle)?;
                    drop(handle);
                    match copy {
                        None => Ok((root.clone(), false)),
                        Some(copy) => {
                            let (reference, fresh) = self.manager.create(copy)?;
                            drop(fresh);
                            Ok((reference, false))
                        }
                    }
                } else {
                    let changed = update.apply(self, &mut handle)?;
                    if changed {
                        handle.mark_dirty();
                    }
                    Ok((root.clone(), changed))
                }
            }
            LeafCase::Remove => {
                if frozen {
                    // The old root keeps the leaf and everything below it.
                    return Ok((NodeReference::default(), false));
                }
                update.release_attachments(self, &handle);
                drop(handle);
                self.manager.release(root.id())?;
                Ok((NodeReference::default(), false))
            }
            LeafCase::Mismatch => {
                if !update.creates_leaf() {
                    return Ok((root.clone(), false));
                }
                self.split_at_leaf(handle, root, path, update)
            }
        }
    }

    /// Introduces a branch (and possibly an extension above it) at the
    /// first nibble where the new key diverges from an existing leaf.
    fn split_at_leaf<U: LeafUpdate>(
        &self,
        mut handle: NodeWriteHandle,
        root: &NodeReference,
        path: &[u8],
        update: &U,
    ) -> ForestResult<(NodeReference, bool)> {
        let frozen = handle.is_frozen();
        let existing_full = update.existing_path(&handle);
        let depth = existing_full.len() - path.len();
        let existing = &existing_full[depth..];
        let common = common_prefix(path, existing);
        debug_assert!(common < path.len() && common < existing.len());

        // The existing leaf moves one branch level down; its tracked path
        // length shrinks accordingly.
        let existing_ref = if self.track_path_lengths {
            let new_length = (existing.len() - common - 1) as u8;
            if frozen {
                let copy = copy_with_path_length(&handle, new_length);
                drop(handle);
                let (reference, fresh) = self.manager.create(copy)?;
                drop(fresh);
                reference
            } else {
                set_path_length(&mut handle, new_length);
                handle.mark_dirty();
                drop(handle);
                root.clone()
            }
        } else {
            drop(handle);
            root.clone()
        };

        let leaf = update.make_leaf(self.leaf_path_length(path.len() - common - 1));
        let (leaf_ref, fresh) = self.manager.create(leaf)?;
        drop(fresh);

        let mut branch = BranchNode::new();
        let existing_slot = existing[common] as usize;
        branch.set_child(existing_slot, existing_ref.clone());
        branch.set_child(path[common] as usize, leaf_ref);
        if frozen && existing_ref == *root {
            // The untouched frozen leaf is shared with the old root.
            branch.frozen_children |= 1 << existing_slot;
        }
        let (branch_ref, fresh) = self.manager.create_branch(branch)?;
        drop(fresh);

        if common == 0 {
            return Ok((branch_ref, false));
        }
        let extension = ExtensionNode::new(PackedNibbles::pack(&path[..common]), branch_ref);
        let (extension_ref, fresh) = self.manager.create_extension(extension)?;
        drop(fresh);
        Ok((extension_ref, false))
    }

    /// The engine's branch arm: descend one nibble, then apply the child's
    /// outcome, collapsing the branch when only one child remains.
    fn set_below_branch<U: LeafUpdate>(
        &self,
        mut handle: NodeWriteHandle,
        root: &NodeReference,
        path: &[u8],
        update: &U,
    ) -> ForestResult<(NodeReference, bool)> {
        debug_assert!(!path.is_empty(), "key exhausted at a branch");
        let nibble = path[0] as usize;
        let child = {
            let Node::Branch(branch) = &*handle else { unreachable!() };
            branch.children[nibble].clone()
        };

        let (new_child, child_changed) = self.set_leaf(&child, &path[1..], update)?;
        if new_child == child && !child_changed {
            return Ok((root.clone(), false));
        }

        if !handle.is_frozen() {
            let collapse = {
                let Node::Branch(branch) = &mut *handle else { unreachable!() };
                if new_child == child {
                    branch.mark_child_dirty(nibble);
                } else {
                    branch.set_child(nibble, new_child.clone());
                }
                if new_child.is_empty() {
                    branch
                        .single_child_slot()
                        .map(|slot| (slot, branch.children[slot].clone()))
                } else {
                    None
                }
            };
            handle.mark_dirty();
            if let Some((slot, survivor)) = collapse {
                drop(handle);
                let lifted = self.lift_child(slot as u8, &survivor)?;
                self.manager.release(root.id())?;
                return Ok((lifted, false));
            }
            return Ok((root.clone(), true));
        }

        // Frozen branch: never mutated, and a collapse is computed without
        // materializing the intermediate copy.
        debug_assert!(!child_changed, "in-place change below a frozen branch");
        let mut copy = {
            let Node::Branch(branch) = &*handle else { unreachable!() };
            branch.unfrozen_copy()
        };
        copy.set_child(nibble, new_child.clone());
        if new_child.is_empty() {
            if let Some(slot) = copy.single_child_slot() {
                let survivor = copy.children[slot].clone();
                drop(handle);
                let lifted = self.lift_child(slot as u8, &survivor)?;
                return Ok((lifted, false));
            }
        }
        drop(handle);
        let (copy_ref, fresh) = self.manager.create_branch(copy)?;
        drop(fresh);
        Ok((copy_ref, false))
    }

    /// Replaces a collapsed branch by its surviving child, folding the
    /// branch's slot nibble into the survivor.
    fn lift_child(&self, nibble: u8, survivor: &NodeReference) -> ForestResult<NodeReference> {
        let mut handle = self.manager.get_write(survivor)?;
        let frozen = handle.is_frozen();
        match &mut *handle {
            Node::Branch(_) => {
                drop(handle);
                let extension =
                    ExtensionNode::new(PackedNibbles::pack(&[nibble]), survivor.clone());
                let (reference, fresh) = self.manager.create_extension(extension)?;
                drop(fresh);
                Ok(reference)
            }
            Node::Extension(extension) => {
                if frozen {
                    let lifted =
                        ExtensionNode::new(extension.path.prepend(nibble), extension.next.clone());
                    drop(handle);
                    let (reference, fresh) = self.manager.create_extension(lifted)?;
                    drop(fresh);
                    Ok(reference)
                } else {
                    extension.path = extension.path.prepend(nibble);
                    extension.hash_dirty = true;
                    handle.mark_dirty();
                    Ok(survivor.clone())
                }
            }
            Node::Account(_) | Node::Value(_) => {
                if !self.track_path_lengths {
                    return Ok(survivor.clone());
                }
                if frozen {
                    let copy = copy_with_longer_path(&handle, 1);
                    drop(handle);
                    let (reference, fresh) = self.manager.create(copy)?;
                    drop(fresh);
                    Ok(reference)
                } else {
                    add_path_length(&mut handle, 1);
                    handle.mark_dirty();
                    Ok(survivor.clone())
                }
            }
            Node::Empty => Err(ForestError::corrupt(survivor.id(), "empty branch survivor")),
        }
    }

    /// The engine's extension arm.
    fn set_below_extension<U: LeafUpdate>(
        &self,
        mut handle: NodeWriteHandle,
        root: &NodeReference,
        path: &[u8],
        update: &U,
    ) -> ForestResult<(NodeReference, bool)> {
        let (ext_path, next, frozen) = {
            let Node::Extension(extension) = &*handle else { unreachable!() };
            (extension.path, extension.next.clone(), extension.frozen)
        };
        let common = ext_path.common_prefix_len(path);

        if common < ext_path.len() {
            return self.split_extension(handle, root, path, update, common);
        }

        // The whole compressed path matches; recurse below.
        let (new_next, child_changed) = self.set_leaf(&next, &path[common..], update)?;
        if new_next == next {
            if !child_changed {
                return Ok((root.clone(), false));
            }
            debug_assert!(!frozen, "in-place change below a frozen extension");
            let Node::Extension(extension) = &mut *handle else { unreachable!() };
            extension.next_hash_dirty = true;
            extension.hash_dirty = true;
            handle.mark_dirty();
            return Ok((root.clone(), true));
        }

        if new_next.is_empty() {
            drop(handle);
            if !frozen {
                self.manager.release(root.id())?;
            }
            return Ok((NodeReference::default(), false));
        }

        match new_next.id().kind() {
            NodeKind::Branch => {
                if frozen {
                    drop(handle);
                    let (reference, fresh) =
                        self.manager.create_extension(ExtensionNode::new(ext_path, new_next))?;
                    drop(fresh);
                    Ok((reference, false))
                } else {
                    let Node::Extension(extension) = &mut *handle else { unreachable!() };
                    extension.next = new_next;
                    extension.next_hash_dirty = true;
                    extension.hash_dirty = true;
                    handle.mark_dirty();
                    Ok((root.clone(), true))
                }
            }
            NodeKind::Extension => {
                // The branch below collapsed into an extension; fuse the two.
                let (combined, grandchild) = {
                    let child = self.manager.get_read(&new_next)?;
                    let Node::Extension(child) = &*child else { unreachable!() };
                    (ext_path.join(&child.path), child.next.clone())
                };
                if frozen {
                    drop(handle);
                    let (reference, fresh) = self
                        .manager
                        .create_extension(ExtensionNode::new(combined, grandchild))?;
                    drop(fresh);
                    self.manager.release(new_next.id())?;
                    Ok((reference, false))
                } else {
                    let Node::Extension(extension) = &mut *handle else { unreachable!() };
                    extension.path = combined;
                    extension.next = grandchild;
                    extension.next_hash_dirty = true;
                    extension.hash_dirty = true;
                    handle.mark_dirty();
                    drop(handle);
                    self.manager.release(new_next.id())?;
                    Ok((root.clone(), true))
                }
            }
            NodeKind::Account | NodeKind::Value => {
                // The branch below collapsed into a leaf; fold this
                // extension's path into the leaf's tracked length.
                if self.track_path_lengths {
                    let mut leaf = self.manager.get_write(&new_next)?;
                    add_path_length(&mut leaf, ext_path.len() as u8);
                    leaf.mark_dirty();
                }
                drop(handle);
                if !frozen {
                    self.manager.release(root.id())?;
                }
                Ok((new_next, false))
            }
            NodeKind::Empty => unreachable!("empty id handled above"),
        }
    }

    /// Splits an extension at the nibble where the new key diverges from
    /// its compressed path.
    fn split_extension<U: LeafUpdate>(
        &self,
        mut handle: NodeWriteHandle,
        root: &NodeReference,
        path: &[u8],
        update: &U,
        common: usize,
    ) -> ForestResult<(NodeReference, bool)> {
        if !update.creates_leaf() {
            return Ok((root.clone(), false));
        }
        let (ext_path, next, frozen) = {
            let Node::Extension(extension) = &*handle else { unreachable!() };
            (extension.path, extension.next.clone(), extension.frozen)
        };

        let existing_slot = ext_path.get(common) as usize;
        let tail = ext_path.suffix(common + 1);
        let existing_side = if tail.is_empty() {
            next.clone()
        } else {
            let (reference, fresh) =
                self.manager.create_extension(ExtensionNode::new(tail, next.clone()))?;
            drop(fresh);
            reference
        };

        let leaf = update.make_leaf(self.leaf_path_length(path.len() - common - 1));
        let (leaf_ref, fresh) = self.manager.create(leaf)?;
        drop(fresh);

        let mut branch = BranchNode::new();
        branch.set_child(existing_slot, existing_side.clone());
        branch.set_child(path[common] as usize, leaf_ref);
        if frozen && existing_side == next {
            branch.frozen_children |= 1 << existing_slot;
        }
        let (branch_ref, fresh) = self.manager.create_branch(branch)?;
        drop(fresh);

        if common > 0 {
            let prefix = PackedNibbles::pack(&path[..common]);
            if frozen {
                drop(handle);
                let (reference, fresh) =
                    self.manager.create_extension(ExtensionNode::new(prefix, branch_ref))?;
                drop(fresh);
                Ok((reference, false))
            } else {
                let Node::Extension(extension) = &mut *handle else { unreachable!() };
                extension.path = prefix;
                extension.next = branch_ref;
                extension.next_hash_dirty = true;
                extension.hash_dirty = true;
                handle.mark_dirty();
                Ok((root.clone(), true))
            }
        } else {
            drop(handle);
            if !frozen {
                self.manager.release(root.id())?;
            }
            Ok((branch_ref, false))
        }
    }

    /// Freezes the whole subtree under `root`. Branches use their
    /// frozen-children bitset to skip subtrees frozen earlier.
    pub(crate) fn freeze(&self, root: &NodeReference) -> ForestResult<()> {
        if root.is_empty() {
            return Ok(());
        }
        let mut handle = self.manager.get_write(root)?;
        if handle.is_frozen() {
            return Ok(());
        }
        let children: Vec<NodeReference> = match &*handle {
            Node::Branch(branch) => (0..16)
                .filter(|slot| {
                    !branch.children[*slot].is_empty() && !branch.is_child_frozen(*slot)
                })
                .map(|slot| branch.children[slot].clone())
                .collect(),
            Node::Extension(extension) => vec![extension.next.clone()],
            Node::Account(account) => vec![account.storage.clone()],
            Node::Value(_) | Node::Empty => Vec::new(),
        };
        for child in &children {
            self.freeze(child)?;
        }
        handle.mark_frozen();
        if let Node::Branch(branch) = &mut *handle {
            branch.frozen_children = 0xFFFF;
        }
        handle.mark_dirty();
        Ok(())
    }
}

/// Updates the account record stored for one address.
pub(crate) struct AccountWrite<'a> {
    pub(crate) address: Address,
    pub(crate) info: AccountInfo,
    pub(crate) resolve: &'a dyn Fn(&Address) -> FullPath,
}

impl LeafUpdate for AccountWrite<'_> {
    const LEAF_KIND: NodeKind = NodeKind::Account;

    fn creates_leaf(&self) -> bool {
        !self.info.is_empty()
    }

    fn case_for(&self, node: &Node) -> LeafCase {
        let Node::Account(account) = node else { unreachable!() };
        if account.address != self.address {
            LeafCase::Mismatch
        } else if self.info.is_empty() {
            LeafCase::Remove
        } else if account.info == self.info {
            LeafCase::Noop
        } else {
            LeafCase::Update
        }
    }

    fn existing_path(&self, node: &Node) -> FullPath {
        let Node::Account(account) = node else { unreachable!() };
        (self.resolve)(&account.address)
    }

    fn make_leaf(&self, path_length: u8) -> Node {
        Node::Account(AccountNode::new(self.address, self.info, path_length))
    }

    fn apply(&self, _ops: &TrieOps<'_>, node: &mut Node) -> ForestResult<bool> {
        let Node::Account(account) = node else { unreachable!() };
        account.info = self.info;
        account.hash_dirty = true;
        Ok(true)
    }

    fn apply_copy(&self, _ops: &TrieOps<'_>, node: &Node) -> ForestResult<Option<Node>> {
        let Node::Account(account) = node else { unreachable!() };
        let mut copy = account.unfrozen_copy();
        copy.info = self.info;
        copy.hash_dirty = true;
        Ok(Some(Node::Account(copy)))
    }

    fn release_attachments(&self, ops: &TrieOps<'_>, node: &Node) {
        let Node::Account(account) = node else { unreachable!() };
        ops.manager.release_trie_async(&account.storage);
    }
}

/// Updates one storage slot inside an account's storage trie. A zero value
/// removes the slot's leaf.
pub(crate) struct ValueWrite<'a> {
    pub(crate) key: B256,
    pub(crate) value: B256,
    pub(crate) resolve: &'a dyn Fn(&B256) -> FullPath,
}

impl LeafUpdate for ValueWrite<'_> {
    const LEAF_KIND: NodeKind = NodeKind::Value;

    fn creates_leaf(&self) -> bool {
        !self.value.is_zero()
    }

    fn case_for(&self, node: &Node) -> LeafCase {
        let Node::Value(value) = node else { unreachable!() };
        if value.key != self.key {
            LeafCase::Mismatch
        } else if self.value.is_zero() {
            LeafCase::Remove
        } else if value.value == self.value {
            LeafCase::Noop
        } else {
            LeafCase::Update
        }
    }

    fn existing_path(&self, node: &Node) -> FullPath {
        let Node::Value(value) = node else { unreachable!() };
        (self.resolve)(&value.key)
    }

    fn make_leaf(&self, path_length: u8) -> Node {
        Node::Value(ValueNode::new(self.key, self.value, path_length))
    }

    fn apply(&self, _ops: &TrieOps<'_>, node: &mut Node) -> ForestResult<bool> {
        let Node::Value(value) = node else { unreachable!() };
        value.value = self.value;
        value.hash_dirty = true;
        Ok(true)
    }

    fn apply_copy(&self, _ops: &TrieOps<'_>, node: &Node) -> ForestResult<Option<Node>> {
        let Node::Value(value) = node else { unreachable!() };
        let mut copy = value.unfrozen_copy();
        copy.value = self.value;
        copy.hash_dirty = true;
        Ok(Some(Node::Value(copy)))
    }

    fn release_attachments(&self, _ops: &TrieOps<'_>, _node: &Node) {}
}

/// Descends the account trie to one account and applies a [ValueWrite] to
/// its storage trie. A missing account leaves the trie untouched.
pub(crate) struct SlotWrite<'a> {
    pub(crate) address: Address,
    pub(crate) key: B256,
    pub(crate) value: B256,
    pub(crate) value_path: FullPath,
    pub(crate) resolve_account: &'a dyn Fn(&Address) -> FullPath,
    pub(crate) resolve_value: &'a dyn Fn(&B256) -> FullPath,
}

impl SlotWrite<'_> {
    fn value_write(&self) -> ValueWrite<'_> {
        ValueWrite { key: self.key, value: self.value, resolve: self.resolve_value }
    }
}

impl LeafUpdate for SlotWrite<'_> {
    const LEAF_KIND: NodeKind = NodeKind::Account;

    fn creates_leaf(&self) -> bool {
        // Writing a slot of an absent account has no effect.
        false
    }

    fn case_for(&self, node: &Node) -> LeafCase {
        let Node::Account(account) = node else { unreachable!() };
        if account.address != self.address {
            LeafCase::Mismatch
        } else {
            LeafCase::Update
        }
    }

    fn existing_path(&self, node: &Node) -> FullPath {
        let Node::Account(account) = node else { unreachable!() };
        (self.resolve_account)(&account.address)
    }

    fn make_leaf(&self, _path_length: u8) -> Node {
        unreachable!("slot writes never create account leaves")
    }

    fn apply(&self, ops: &TrieOps<'_>, node: &mut Node) -> ForestResult<bool> {
        let Node::Account(account) = node else { unreachable!() };
        let (new_storage, storage_changed) =
            ops.set_leaf(&account.storage, &self.value_path, &self.value_write())?;
        if new_storage != account.storage {
            account.storage = new_storage;
        } else if !storage_changed {
            return Ok(false);
        }
        account.storage_hash_dirty = true;
        account.hash_dirty = true;
        Ok(true)
    }

    fn apply_copy(&self, ops: &TrieOps<'_>, node: &Node) -> ForestResult<Option<Node>> {
        let Node::Account(account) = node else { unreachable!() };
        let (new_storage, storage_changed) =
            ops.set_leaf(&account.storage, &self.value_path, &self.value_write())?;
        debug_assert!(!storage_changed, "in-place change below a frozen account");
        if new_storage == account.storage {
            return Ok(None);
        }
        let mut copy = account.unfrozen_copy();
        copy.storage = new_storage;
        copy.storage_hash_dirty = true;
        copy.hash_dirty = true;
        Ok(Some(Node::Account(copy)))
    }

    fn release_attachments(&self, _ops: &TrieOps<'_>, _node: &Node) {}
}

/// Clears one account's storage trie, releasing the subtree in the
/// background.
pub(crate) struct StorageClear<'a> {
    pub(crate) address: Address,
    pub(crate) resolve_account: &'a dyn Fn(&Address) -> FullPath,
}

impl LeafUpdate for StorageClear<'_> {
    const LEAF_KIND: NodeKind = NodeKind::Account;

    fn creates_leaf(&self) -> bool {
        false
    }

    fn case_for(&self, node: &Node) -> LeafCase {
        let Node::Account(account) = node else { unreachable!() };
        if account.address != self.address {
            LeafCase::Mismatch
        } else if account.storage.is_empty() {
            LeafCase::Noop
        } else {
            LeafCase::Update
        }
    }

    fn existing_path(&self, node: &Node) -> FullPath {
        let Node::Account(account) = node else { unreachable!() };
        (self.resolve_account)(&account.address)
    }

    fn make_leaf(&self, _path_length: u8) -> Node {
        unreachable!("storage clears never create account leaves")
    }

    fn apply(&self, ops: &TrieOps<'_>, node: &mut Node) -> ForestResult<bool> {
        let Node::Account(account) = node else { unreachable!() };
        ops.manager.release_trie_async(&account.storage);
        account.storage = NodeReference::default();
        account.storage_hash_dirty = true;
        account.hash_dirty = true;
        Ok(true)
    }

    fn apply_copy(&self, _ops: &TrieOps<'_>, node: &Node) -> ForestResult<Option<Node>> {
        let Node::Account(account) = node else { unreachable!() };
        // The frozen original keeps its storage; nothing is released.
        let mut copy = account.unfrozen_copy();
        copy.storage = NodeReference::default();
        copy.storage_hash_dirty = true;
        copy.hash_dirty = true;
        Ok(Some(Node::Account(copy)))
    }

    fn release_attachments(&self, _ops: &TrieOps<'_>, _node: &Node) {}
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn set_path_length(node: &mut Node, length: u8) {
    match node {
        Node::Account(account) => {
            account.path_length = length;
            account.hash_dirty = true;
        }
        Node::Value(value) => {
            value.path_length = length;
            value.hash_dirty = true;
        }
        _ => unreachable!("path lengths only live on leaves"),
    }
}

fn add_path_length(node: &mut Node, delta: u8) {
    match node {
        Node::Account(account) => {
            account.path_length += delta;
            account.hash_dirty = true;
        }
        Node::Value(value) => {
            value.path_length += delta;
            value.hash_dirty = true;
        }
        _ => unreachable!("path lengths only live on leaves"),
    }
}

fn copy_with_path_length(node: &Node, length: u8) -> Node {
    let mut copy = match node {
        Node::Account(account) => Node::Account(account.unfrozen_copy()),
        Node::Value(value) => Node::Value(value.unfrozen_copy()),
        _ => unreachable!("path lengths only live on leaves"),
    };
    set_path_length(&mut copy, length);
    copy
}

fn copy_with_longer_path(node: &Node, delta: u8) -> Node {
    let mut copy = match node {
        Node::Account(account) => Node::Account(account.unfrozen_copy()),
        Node::Value(value) => Node::Value(value.unfrozen_copy()),
        _ => unreachable!("path lengths only live on leaves"),
    };
    add_path_length(&mut copy, delta);
    copy
}
