#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod errors;
pub use errors::{ForestError, ForestResult};

mod kinds;
pub use kinds::{NodeId, NodeKind};

mod account;
pub use account::AccountInfo;

mod path;
pub use path::PackedNibbles;

mod navigator;
pub use navigator::NodePath;

mod shared;
pub use shared::{HashHandle, ReadHandle, Shared, ViewHandle, WriteHandle};

mod node;
pub use node::{AccountNode, BranchNode, ExtensionNode, Node, ValueNode};

mod reference;
pub use reference::NodeReference;

mod codec;
pub use codec::{AccountCodec, BranchCodec, CodecFlavor, ExtensionCodec, ValueCodec};

mod source;
pub use source::NodeSource;

mod manager;
pub use manager::{
    NodeHashHandle, NodeManager, NodeOwner, NodeReadHandle, NodeViewHandle, NodeWriteHandle,
};

mod ops;

mod hasher;
pub use hasher::{HashScheme, HashTable, EMPTY_DIRECT_HASH};

mod visit;
pub use visit::{NodeInfo, NodeVisitor, VisitResponse, VisitWith};

mod check;

mod diff;
pub use diff::{AccountDiff, SlotDiff, StateDiff};

mod forest;
pub use forest::{Forest, ForestConfig, ForestMode, StorageVariant};
