//! Structural diffing of two roots.
//!
//! Frozen sharing makes diffing cheap across archive blocks: a subtree
//! reachable from both roots under the same node id is identical by
//! construction and is skipped without being walked.

use crate::{
    AccountInfo, ForestResult, Node, NodeId, NodeManager, NodeReference, NodeVisitor,
    VisitResponse,
};
use alloy_primitives::{Address, B256};
use std::collections::BTreeMap;

/// The difference between one account's state under two roots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountDiff {
    /// The account record under the source root; `None` when absent.
    pub before: Option<AccountInfo>,
    /// The account record under the target root; `None` when absent.
    pub after: Option<AccountInfo>,
    /// Storage slots whose value differs between the roots.
    pub slots: BTreeMap<B256, SlotDiff>,
}

/// One differing storage slot; absent slots read as the zero value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotDiff {
    /// The slot value under the source root.
    pub before: B256,
    /// The slot value under the target root.
    pub after: B256,
}

/// The difference between two roots, keyed by account address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDiff {
    /// All accounts whose record or storage differs.
    pub accounts: BTreeMap<Address, AccountDiff>,
}

impl StateDiff {
    /// Whether the two roots describe the same state.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

struct AccountCollector {
    accounts: BTreeMap<Address, (AccountInfo, NodeReference, NodeId)>,
}

impl NodeVisitor for AccountCollector {
    fn visit(&mut self, node: &Node, info: &crate::NodeInfo) -> VisitResponse {
        if let Node::Account(account) = node {
            self.accounts
                .insert(account.address, (account.info, account.storage.clone(), info.id));
            // Storage tries are compared separately, per account.
            return VisitResponse::Prune;
        }
        VisitResponse::Continue
    }
}

struct ValueCollector {
    values: BTreeMap<B256, B256>,
}

impl NodeVisitor for ValueCollector {
    fn visit(&mut self, node: &Node, _info: &crate::NodeInfo) -> VisitResponse {
        if let Node::Value(value) = node {
            self.values.insert(value.key, value.value);
        }
        VisitResponse::Continue
    }
}

/// Computes the per-account difference between `source` and `target`.
pub(crate) fn state_diff(
    manager: &NodeManager,
    source: &NodeReference,
    target: &NodeReference,
) -> ForestResult<StateDiff> {
    let mut diff = StateDiff::default();
    if source == target {
        return Ok(diff);
    }

    let before = collect_accounts(manager, source)?;
    let after = collect_accounts(manager, target)?;

    let addresses: std::collections::BTreeSet<&Address> =
        before.keys().chain(after.keys()).collect();
    for address in addresses {
        let old = before.get(address);
        let new = after.get(address);

        // The same account node id under both roots means an identical
        // account and storage; sharing is only legal through freezing.
        if let (Some((_, _, old_id)), Some((_, _, new_id))) = (old, new) {
            if old_id == new_id {
                continue;
            }
        }

        let mut entry = AccountDiff {
            before: old.map(|(info, _, _)| *info),
            after: new.map(|(info, _, _)| *info),
            slots: BTreeMap::new(),
        };

        let empty = NodeReference::default();
        let old_storage = old.map_or(&empty, |(_, storage, _)| storage);
        let new_storage = new.map_or(&empty, |(_, storage, _)| storage);
        if old_storage != new_storage {
            let old_values = collect_values(manager, old_storage)?;
            let new_values = collect_values(manager, new_storage)?;
            let keys: std::collections::BTreeSet<&B256> =
                old_values.keys().chain(new_values.keys()).collect();
            for key in keys {
                let before = old_values.get(key).copied().unwrap_or_default();
                let after = new_values.get(key).copied().unwrap_or_default();
                if before != after {
                    entry.slots.insert(*key, SlotDiff { before, after });
                }
            }
        }

        if entry.before != entry.after || !entry.slots.is_empty() {
            diff.accounts.insert(*address, entry);
        }
    }
    Ok(diff)
}

fn collect_accounts(
    manager: &NodeManager,
    root: &NodeReference,
) -> ForestResult<BTreeMap<Address, (AccountInfo, NodeReference, NodeId)>> {
    let mut collector = AccountCollector { accounts: BTreeMap::new() };
    crate::visit::visit_subtree(manager, root, &mut collector)?;
    Ok(collector.accounts)
}

fn collect_values(
    manager: &NodeManager,
    root: &NodeReference,
) -> ForestResult<BTreeMap<B256, B256>> {
    let mut collector = ValueCollector { values: BTreeMap::new() };
    crate::visit::visit_subtree(manager, root, &mut collector)?;
    Ok(collector.values)
}
