//! The per-block state change set applied by the archive.

use crate::StateResult;
use alloy_primitives::{Address, B256};
use grove_mpt::{AccountInfo, Forest, NodeReference};

/// The changes one block applies to the world state.
///
/// Application order mirrors block processing: deletions first, then
/// storage clears, then account upserts, then slot writes. A deleted and
/// re-created account therefore starts from empty storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockUpdate {
    deleted_accounts: Vec<Address>,
    cleared_storage: Vec<Address>,
    accounts: Vec<(Address, AccountInfo)>,
    slots: Vec<(Address, B256, B256)>,
}

impl BlockUpdate {
    /// An empty change set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the update changes nothing.
    pub fn is_empty(&self) -> bool {
        self.deleted_accounts.is_empty()
            && self.cleared_storage.is_empty()
            && self.accounts.is_empty()
            && self.slots.is_empty()
    }

    /// Deletes the account for `address`, including its storage.
    pub fn delete_account(mut self, address: Address) -> Self {
        self.deleted_accounts.push(address);
        self
    }

    /// Clears the storage trie of `address`.
    pub fn clear_storage(mut self, address: Address) -> Self {
        self.cleared_storage.push(address);
        self
    }

    /// Creates or updates the account record for `address`.
    pub fn set_account(mut self, address: Address, info: AccountInfo) -> Self {
        self.accounts.push((address, info));
        self
    }

    /// Writes one storage slot; a zero value removes the slot.
    pub fn set_slot(mut self, address: Address, key: B256, value: B256) -> Self {
        self.slots.push((address, key, value));
        self
    }

    /// Applies the change set on top of `root`, returning the new root.
    pub(crate) fn apply(&self, forest: &Forest, root: &NodeReference) -> StateResult<NodeReference> {
        let mut root = root.clone();
        for address in &self.deleted_accounts {
            root = forest.delete_account(&root, address)?;
        }
        for address in &self.cleared_storage {
            root = forest.clear_storage(&root, address)?;
        }
        for (address, info) in &self.accounts {
            root = forest.set_account_info(&root, address, *info)?;
        }
        for (address, key, value) in &self.slots {
            root = forest.set_value(&root, address, key, *value)?;
        }
        Ok(root)
    }
}
