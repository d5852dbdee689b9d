//! Errors for the `grove-mpt` crate.

use crate::NodeId;
use grove_stock::StockError;

/// A [Result] type alias where the error is [ForestError].
pub type ForestResult<T> = Result<T, ForestError>;

/// An error type for forest operations.
///
/// On any error the caller's root remains valid and unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ForestError {
    /// A stock operation failed. Wraps both I/O failures and record-level
    /// decode failures of the backing stores.
    #[error("stock failure: {0}")]
    Stock(#[from] StockError),
    /// A decoded or traversed node violates a structural invariant.
    #[error("corrupt node {id}: {reason}")]
    CorruptNode {
        /// The offending node.
        id: NodeId,
        /// The violated invariant.
        reason: String,
    },
    /// A node identifier cannot be represented in the on-disk format.
    #[error("node id {0} is not encodable")]
    InvalidId(NodeId),
    /// A value operation reached a node that is not part of an account's
    /// storage trie, or a storage walk ran into an account leaf.
    #[error("operation is only legal inside an account's storage trie")]
    NotAnAccountLeaf,
    /// Freezing was requested on a forest opened in mutable mode.
    #[error("freezing requires an immutable forest")]
    FreezeUnsupported,
}

impl ForestError {
    /// Builds a [ForestError::CorruptNode] from an id and any printable
    /// reason.
    pub fn corrupt(id: NodeId, reason: impl ToString) -> Self {
        Self::CorruptNode { id, reason: reason.to_string() }
    }
}
