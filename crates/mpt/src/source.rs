//! The node source: the four typed stocks behind the node manager.
//!
//! Each mutable node variant is stored in its own [Stock]; the empty node
//! has none. The source translates between tagged [NodeId]s and per-stock
//! slot indices, and stamps the frozen bit onto loaded nodes when the forest
//! runs in immutable mode (everything a reopened archive reads is history).

use crate::{
    AccountNode, BranchNode, ExtensionNode, ForestResult, Node, NodeId, NodeKind, ValueNode,
};
use grove_stock::Stock;
use tracing::trace;

/// The typed persistent backing of a forest.
pub struct NodeSource {
    branches: Box<dyn Stock<BranchNode>>,
    extensions: Box<dyn Stock<ExtensionNode>>,
    accounts: Box<dyn Stock<AccountNode>>,
    values: Box<dyn Stock<ValueNode>>,
    freeze_on_load: bool,
}

impl NodeSource {
    /// Builds a source over the four variant stocks.
    ///
    /// With `freeze_on_load`, every node read from a stock is marked frozen
    /// before it enters the cache.
    pub fn new(
        branches: Box<dyn Stock<BranchNode>>,
        extensions: Box<dyn Stock<ExtensionNode>>,
        accounts: Box<dyn Stock<AccountNode>>,
        values: Box<dyn Stock<ValueNode>>,
        freeze_on_load: bool,
    ) -> Self {
        Self { branches, extensions, accounts, values, freeze_on_load }
    }

    /// Allocates a fresh slot for a node of `kind`.
    pub fn reserve(&self, kind: NodeKind) -> ForestResult<NodeId> {
        let index = match kind {
            NodeKind::Branch => self.branches.reserve()?,
            NodeKind::Extension => self.extensions.reserve()?,
            NodeKind::Account => self.accounts.reserve()?,
            NodeKind::Value => self.values.reserve()?,
            NodeKind::Empty => panic!("the empty node is never allocated"),
        };
        Ok(NodeId::new(kind, index))
    }

    /// Loads the node stored under `id`.
    pub fn load(&self, id: NodeId) -> ForestResult<Node> {
        trace!(target: "mpt::source", %id, "loading node");
        let mut node = match id.kind() {
            NodeKind::Empty => return Ok(Node::Empty),
            NodeKind::Branch => Node::Branch(self.branches.get(id.index())?),
            NodeKind::Extension => Node::Extension(self.extensions.get(id.index())?),
            NodeKind::Account => Node::Account(self.accounts.get(id.index())?),
            NodeKind::Value => Node::Value(self.values.get(id.index())?),
        };
        if self.freeze_on_load {
            node.mark_frozen();
            if let Node::Branch(branch) = &mut node {
                branch.frozen_children = 0xFFFF;
            }
        }
        Ok(node)
    }

    /// Writes `node` to the slot of `id`.
    ///
    /// # Panics
    /// Panics when the node's variant does not match the id's kind; an
    /// id/shape mismatch means the cache or write buffer handed back the
    /// wrong object, which is unrecoverable.
    pub fn store(&self, id: NodeId, node: &Node) -> ForestResult<()> {
        assert_eq!(node.kind(), id.kind(), "node shape does not match id {id}");
        trace!(target: "mpt::source", %id, "storing node");
        match node {
            Node::Empty => {}
            Node::Branch(branch) => self.branches.set(id.index(), branch)?,
            Node::Extension(extension) => self.extensions.set(id.index(), extension)?,
            Node::Account(account) => self.accounts.set(id.index(), account)?,
            Node::Value(value) => self.values.set(id.index(), value)?,
        }
        Ok(())
    }

    /// Deletes the slot of `id`.
    pub fn delete(&self, id: NodeId) -> ForestResult<()> {
        trace!(target: "mpt::source", %id, "deleting node");
        match id.kind() {
            NodeKind::Empty => panic!("the empty node is never released"),
            NodeKind::Branch => self.branches.delete(id.index())?,
            NodeKind::Extension => self.extensions.delete(id.index())?,
            NodeKind::Account => self.accounts.delete(id.index())?,
            NodeKind::Value => self.values.delete(id.index())?,
        }
        Ok(())
    }

    /// Flushes all four stocks.
    pub fn flush(&self) -> ForestResult<()> {
        self.branches.flush()?;
        self.extensions.flush()?;
        self.accounts.flush()?;
        self.values.flush()?;
        Ok(())
    }

    /// Closes all four stocks.
    pub fn close(&self) -> ForestResult<()> {
        self.branches.close()?;
        self.extensions.close()?;
        self.accounts.close()?;
        self.values.close()?;
        Ok(())
    }

    /// The number of live nodes across all stocks.
    pub fn node_count(&self) -> usize {
        self.branches.len() + self.extensions.len() + self.accounts.len() + self.values.len()
    }

    /// An estimate of the heap memory held by the stocks.
    pub fn memory_footprint(&self) -> usize {
        self.branches.memory_footprint()
            + self.extensions.memory_footprint()
            + self.accounts.memory_footprint()
            + self.values.memory_footprint()
    }
}

impl std::fmt::Debug for NodeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSource")
            .field("branches", &self.branches.len())
            .field("extensions", &self.extensions.len())
            .field("accounts", &self.accounts.len())
            .field("values", &self.values.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccountInfo, CodecFlavor, ValueCodec};
    use alloy_primitives::{Address, B256};
    use grove_stock::{InMemoryStock, MemoryStock};

    fn memory_source(freeze_on_load: bool) -> NodeSource {
        NodeSource::new(
            Box::new(InMemoryStock::new()),
            Box::new(InMemoryStock::new()),
            Box::new(InMemoryStock::new()),
            Box::new(InMemoryStock::new()),
            freeze_on_load,
        )
    }

    #[test]
    fn nodes_roundtrip_through_their_stock() {
        let source = memory_source(false);
        let id = source.reserve(NodeKind::Account).unwrap();
        let node =
            Node::Account(AccountNode::new(Address::repeat_byte(1), AccountInfo::default(), 0));
        source.store(id, &node).unwrap();
        assert_eq!(source.load(id).unwrap(), node);
        source.delete(id).unwrap();
    }

    #[test]
    fn freeze_on_load_stamps_nodes() {
        let source = memory_source(true);
        let id = source.reserve(NodeKind::Value).unwrap();
        let node = Node::Value(ValueNode::new(B256::ZERO, B256::with_last_byte(1), 4));
        source.store(id, &node).unwrap();
        assert!(source.load(id).unwrap().is_frozen());
    }

    #[test]
    fn codec_backed_stocks_normalize_on_load() {
        let source = NodeSource::new(
            Box::new(InMemoryStock::new()),
            Box::new(InMemoryStock::new()),
            Box::new(InMemoryStock::new()),
            Box::new(MemoryStock::ephemeral(ValueCodec::new(CodecFlavor::WithChildHashes))),
            false,
        );
        let id = source.reserve(NodeKind::Value).unwrap();
        let mut value = ValueNode::new(B256::with_last_byte(3), B256::with_last_byte(7), 2);
        value.hash = B256::with_last_byte(0xAA);
        value.hash_dirty = false;
        source.store(id, &Node::Value(value)).unwrap();

        // The flavor stores no value-leaf hash, so it comes back dirty.
        let Node::Value(loaded) = source.load(id).unwrap() else { panic!("wrong kind") };
        assert!(loaded.hash_dirty);
    }

    #[test]
    #[should_panic(expected = "shape does not match")]
    fn shape_mismatch_is_fatal() {
        let source = memory_source(false);
        let id = source.reserve(NodeKind::Branch).unwrap();
        let _ = source.store(id, &Node::Value(ValueNode::new(B256::ZERO, B256::ZERO, 0)));
    }
}
