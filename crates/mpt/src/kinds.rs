//! Tagged 64-bit node identifiers.
//!
//! A [NodeId] carries its node kind in the top four bits and the stock slot
//! index in the low 60. The empty node is the all-zero identifier; it has no
//! backing slot. The on-disk form is 4 bytes big-endian with the tag in the
//! top four bits of the word, which caps persistable slot indices at 2^28.

use crate::{ForestError, ForestResult};

const KIND_SHIFT: u32 = 60;
const INDEX_MASK: u64 = (1 << KIND_SHIFT) - 1;

/// The slot-index capacity of the 4-byte on-disk identifier encoding.
pub(crate) const MAX_ENCODABLE_INDEX: u64 = (1 << 28) - 1;

/// The kind of a trie node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// The absent subtree.
    Empty,
    /// A 16-way inner node.
    Branch,
    /// A path-compression node.
    Extension,
    /// An account leaf.
    Account,
    /// A storage-slot leaf.
    Value,
}

impl NodeKind {
    const fn tag(self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::Branch => 1,
            Self::Extension => 2,
            Self::Account => 3,
            Self::Value => 4,
        }
    }

    fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::Empty),
            1 => Some(Self::Branch),
            2 => Some(Self::Extension),
            3 => Some(Self::Account),
            4 => Some(Self::Value),
            _ => None,
        }
    }
}

/// A tagged node identifier.
///
/// Equality and ordering are over the raw 64-bit word, so ids of different
/// kinds never collide even when their slot indices do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// The identifier of the empty node.
    pub const EMPTY: Self = Self(0);

    /// Builds the identifier of a node of `kind` stored at `index`.
    ///
    /// # Panics
    /// Panics when `kind` is [NodeKind::Empty]; the empty node has no slot.
    pub fn new(kind: NodeKind, index: u64) -> Self {
        assert!(kind != NodeKind::Empty, "the empty node has no stock slot");
        debug_assert!(index <= INDEX_MASK);
        Self(kind.tag() << KIND_SHIFT | index)
    }

    /// The kind encoded in this identifier.
    pub fn kind(self) -> NodeKind {
        // The constructor only admits valid tags.
        NodeKind::from_tag(self.0 >> KIND_SHIFT).unwrap_or(NodeKind::Empty)
    }

    /// The stock slot index of this identifier.
    pub const fn index(self) -> u64 {
        self.0 & INDEX_MASK
    }

    /// Whether this is the empty-node identifier.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Encodes the identifier into its 4-byte big-endian on-disk form.
    pub fn to_bytes(self) -> ForestResult<[u8; 4]> {
        let index = self.index();
        if index > MAX_ENCODABLE_INDEX {
            return Err(ForestError::InvalidId(self));
        }
        let word = (self.0 >> KIND_SHIFT << 28) as u32 | index as u32;
        Ok(word.to_be_bytes())
    }

    /// Decodes an identifier from its 4-byte big-endian on-disk form.
    pub fn from_bytes(bytes: [u8; 4]) -> ForestResult<Self> {
        let word = u32::from_be_bytes(bytes);
        let tag = (word >> 28) as u64;
        let index = (word & MAX_ENCODABLE_INDEX as u32) as u64;
        let id = Self(tag << KIND_SHIFT | index);
        match NodeKind::from_tag(tag) {
            Some(NodeKind::Empty) if index != 0 => Err(ForestError::InvalidId(id)),
            Some(_) => Ok(id),
            None => Err(ForestError::InvalidId(id)),
        }
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            NodeKind::Empty => write!(f, "E"),
            NodeKind::Branch => write!(f, "B-{}", self.index()),
            NodeKind::Extension => write!(f, "X-{}", self.index()),
            NodeKind::Account => write!(f, "A-{}", self.index()),
            NodeKind::Value => write!(f, "V-{}", self.index()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_indices_roundtrip() {
        for kind in [NodeKind::Branch, NodeKind::Extension, NodeKind::Account, NodeKind::Value] {
            for index in [0, 1, 42, MAX_ENCODABLE_INDEX] {
                let id = NodeId::new(kind, index);
                assert_eq!(id.kind(), kind);
                assert_eq!(id.index(), index);
            }
        }
    }

    #[test]
    fn empty_is_zero() {
        assert!(NodeId::EMPTY.is_empty());
        assert_eq!(NodeId::EMPTY.kind(), NodeKind::Empty);
        assert_eq!(NodeId::EMPTY.to_bytes().unwrap(), [0; 4]);
    }

    #[test]
    fn ids_of_distinct_kinds_never_collide() {
        let branch = NodeId::new(NodeKind::Branch, 7);
        let value = NodeId::new(NodeKind::Value, 7);
        assert_ne!(branch, value);
        assert_eq!(branch.index(), value.index());
    }

    #[test]
    fn disk_encoding_roundtrips() {
        for kind in [NodeKind::Branch, NodeKind::Extension, NodeKind::Account, NodeKind::Value] {
            let id = NodeId::new(kind, 123_456);
            assert_eq!(NodeId::from_bytes(id.to_bytes().unwrap()).unwrap(), id);
        }
    }

    #[test]
    fn oversized_indices_are_rejected() {
        let id = NodeId::new(NodeKind::Branch, MAX_ENCODABLE_INDEX + 1);
        assert!(matches!(id.to_bytes(), Err(ForestError::InvalidId(_))));
    }

    #[test]
    fn bad_tags_are_rejected() {
        assert!(NodeId::from_bytes([0xF0, 0, 0, 1]).is_err());
        // Empty tag with a non-zero index is malformed.
        assert!(NodeId::from_bytes([0x00, 0, 0, 1]).is_err());
    }
}
