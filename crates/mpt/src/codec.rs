//! Bit-exact, fixed-size record codecs for the four stored node variants.
//!
//! Each codec exists in two flavors, selected at forest-open time:
//!
//! - [CodecFlavor::WithChildHashes]: inner records carry the cached hashes
//!   of their children (plus the per-child dirty mask and embedded bits), so
//!   a reopened forest can hash a node without visiting its subtree.
//! - [CodecFlavor::WithNodeHash]: records carry the node's own hash; child
//!   hashes are re-derived on demand and their dirty bits are set on decode.
//!
//! Hash fields that are dirty at encoding time are zero-filled, and the
//! matching dirty flag travels in a flags byte (or, for branch child hashes,
//! in the persisted dirty mask). Hash fields a flavor omits are marked dirty
//! on decode. Every other field round-trips exactly; the property tests at
//! the bottom of this module pin that down.
//!
//! Frozen bits are not persisted: whether a loaded node is frozen is decided
//! by the forest mode (all nodes of an immutable forest's history are
//! frozen), so the node source stamps them after decoding.

use crate::{
    AccountInfo, AccountNode, BranchNode, ExtensionNode, NodeId, NodeReference, PackedNibbles,
    ValueNode,
};
use alloy_primitives::{Address, B256, U256};
use grove_stock::RecordCodec;

/// The record-format flavor, chosen at forest open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecFlavor {
    /// Records carry cached child hashes.
    #[default]
    WithChildHashes,
    /// Records carry the node's own hash.
    WithNodeHash,
}

const ID_SIZE: usize = 4;
const HASH_SIZE: usize = 32;

fn put_id(out: &mut [u8], at: usize, id: NodeId) -> Result<(), String> {
    let bytes = id.to_bytes().map_err(|e| e.to_string())?;
    out[at..at + ID_SIZE].copy_from_slice(&bytes);
    Ok(())
}

fn take_id(bytes: &[u8], at: usize) -> Result<NodeId, String> {
    let mut word = [0u8; ID_SIZE];
    word.copy_from_slice(&bytes[at..at + ID_SIZE]);
    NodeId::from_bytes(word).map_err(|e| e.to_string())
}

fn put_hash(out: &mut [u8], at: usize, hash: &B256, dirty: bool) {
    if !dirty {
        out[at..at + HASH_SIZE].copy_from_slice(hash.as_slice());
    }
}

fn take_hash(bytes: &[u8], at: usize) -> B256 {
    B256::from_slice(&bytes[at..at + HASH_SIZE])
}

/// The codec for [BranchNode] records.
///
/// Layout with child hashes (580 bytes): 16 child ids, 16 child hashes, the
/// embedded-children mask, the dirty-hash mask. Layout with the node hash
/// (97 bytes): 16 child ids, the node hash, a flags byte.
#[derive(Debug, Clone, Copy)]
pub struct BranchCodec {
    flavor: CodecFlavor,
}

impl BranchCodec {
    /// Creates the codec for the given flavor.
    pub const fn new(flavor: CodecFlavor) -> Self {
        Self { flavor }
    }
}

impl RecordCodec<BranchNode> for BranchCodec {
    fn encoded_size(&self) -> usize {
        match self.flavor {
            CodecFlavor::WithChildHashes => 16 * ID_SIZE + 16 * HASH_SIZE + 2 + 2,
            CodecFlavor::WithNodeHash => 16 * ID_SIZE + HASH_SIZE + 1,
        }
    }

    fn encode(&self, node: &BranchNode, out: &mut [u8]) -> Result<(), String> {
        for (slot, child) in node.children.iter().enumerate() {
            put_id(out, slot * ID_SIZE, child.id())?;
        }
        let base = 16 * ID_SIZE;
        match self.flavor {
            CodecFlavor::WithChildHashes => {
                for (slot, hash) in node.child_hashes.iter().enumerate() {
                    let dirty = node.dirty_hashes & (1 << slot) != 0;
                    put_hash(out, base + slot * HASH_SIZE, hash, dirty);
                }
                let tail = base + 16 * HASH_SIZE;
                out[tail..tail + 2].copy_from_slice(&node.embedded_children.to_be_bytes());
                out[tail + 2..tail + 4].copy_from_slice(&node.dirty_hashes.to_be_bytes());
            }
            CodecFlavor::WithNodeHash => {
                put_hash(out, base, &node.hash, node.hash_dirty);
                out[base + HASH_SIZE] = node.hash_dirty as u8;
            }
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<BranchNode, String> {
        let mut node = BranchNode::new();
        for slot in 0..16 {
            node.children[slot] = NodeReference::new(take_id(bytes, slot * ID_SIZE)?);
        }
        let base = 16 * ID_SIZE;
        match self.flavor {
            CodecFlavor::WithChildHashes => {
                for slot in 0..16 {
                    node.child_hashes[slot] = take_hash(bytes, base + slot * HASH_SIZE);
                }
                let tail = base + 16 * HASH_SIZE;
                node.embedded_children =
                    u16::from_be_bytes([bytes[tail], bytes[tail + 1]]);
                node.dirty_hashes = u16::from_be_bytes([bytes[tail + 2], bytes[tail + 3]]);
                node.hash = B256::ZERO;
                node.hash_dirty = true;
            }
            CodecFlavor::WithNodeHash => {
                node.hash = take_hash(bytes, base);
                node.hash_dirty = bytes[base + HASH_SIZE] & 1 != 0;
                node.dirty_hashes = 0xFFFF;
            }
        }
        Ok(node)
    }
}

/// The codec for [ExtensionNode] records; 70 bytes in both flavors.
#[derive(Debug, Clone, Copy)]
pub struct ExtensionCodec {
    flavor: CodecFlavor,
}

impl ExtensionCodec {
    /// Creates the codec for the given flavor.
    pub const fn new(flavor: CodecFlavor) -> Self {
        Self { flavor }
    }
}

impl RecordCodec<ExtensionNode> for ExtensionCodec {
    fn encoded_size(&self) -> usize {
        32 + 1 + ID_SIZE + HASH_SIZE + 1
    }

    fn encode(&self, node: &ExtensionNode, out: &mut [u8]) -> Result<(), String> {
        let (path_bytes, path_len) = node.path.raw();
        out[..32].copy_from_slice(path_bytes);
        out[32] = path_len;
        put_id(out, 33, node.next.id())?;
        match self.flavor {
            CodecFlavor::WithChildHashes => {
                put_hash(out, 37, &node.next_hash, node.next_hash_dirty);
                out[69] =
                    node.next_hash_dirty as u8 | (node.next_is_embedded as u8) << 1;
            }
            CodecFlavor::WithNodeHash => {
                put_hash(out, 37, &node.hash, node.hash_dirty);
                out[69] = node.hash_dirty as u8;
            }
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<ExtensionNode, String> {
        let mut path_bytes = [0u8; 32];
        path_bytes.copy_from_slice(&bytes[..32]);
        let path = PackedNibbles::from_raw(path_bytes, bytes[32]);
        if path.is_empty() {
            return Err("extension node with an empty path".to_string());
        }

        let next = take_id(bytes, 33)?;
        if next.kind() != crate::NodeKind::Branch {
            return Err(format!("extension child {next} is not a branch"));
        }

        let mut node = ExtensionNode::new(path, NodeReference::new(next));
        match self.flavor {
            CodecFlavor::WithChildHashes => {
                node.next_hash = take_hash(bytes, 37);
                node.next_hash_dirty = bytes[69] & 1 != 0;
                node.next_is_embedded = bytes[69] & 2 != 0;
            }
            CodecFlavor::WithNodeHash => {
                node.hash = take_hash(bytes, 37);
                node.hash_dirty = bytes[69] & 1 != 0;
            }
        }
        Ok(node)
    }
}

/// The codec for [AccountNode] records; 130 bytes in both flavors.
///
/// The flavor decides whether the trailing hash is the storage-trie hash or
/// the node's own hash.
#[derive(Debug, Clone, Copy)]
pub struct AccountCodec {
    flavor: CodecFlavor,
}

impl AccountCodec {
    /// Creates the codec for the given flavor.
    pub const fn new(flavor: CodecFlavor) -> Self {
        Self { flavor }
    }
}

impl RecordCodec<AccountNode> for AccountCodec {
    fn encoded_size(&self) -> usize {
        20 + 8 + 32 + 32 + ID_SIZE + 1 + HASH_SIZE + 1
    }

    fn encode(&self, node: &AccountNode, out: &mut [u8]) -> Result<(), String> {
        out[..20].copy_from_slice(node.address.as_slice());
        out[20..28].copy_from_slice(&node.info.nonce.to_be_bytes());
        out[28..60].copy_from_slice(&node.info.balance.to_be_bytes::<32>());
        out[60..92].copy_from_slice(node.info.code_hash.as_slice());
        put_id(out, 92, node.storage.id())?;
        out[96] = node.path_length;
        match self.flavor {
            CodecFlavor::WithChildHashes => {
                put_hash(out, 97, &node.storage_hash, node.storage_hash_dirty);
                out[129] = node.storage_hash_dirty as u8;
            }
            CodecFlavor::WithNodeHash => {
                put_hash(out, 97, &node.hash, node.hash_dirty);
                out[129] = node.hash_dirty as u8;
            }
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<AccountNode, String> {
        let address = Address::from_slice(&bytes[..20]);
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&bytes[20..28]);
        let mut balance = [0u8; 32];
        balance.copy_from_slice(&bytes[28..60]);
        let info = AccountInfo {
            nonce: u64::from_be_bytes(nonce),
            balance: U256::from_be_bytes(balance),
            code_hash: B256::from_slice(&bytes[60..92]),
        };

        let mut node = AccountNode::new(address, info, bytes[96]);
        node.storage = NodeReference::new(take_id(bytes, 92)?);
        match self.flavor {
            CodecFlavor::WithChildHashes => {
                node.storage_hash = take_hash(bytes, 97);
                node.storage_hash_dirty = bytes[129] & 1 != 0;
            }
            CodecFlavor::WithNodeHash => {
                node.hash = take_hash(bytes, 97);
                node.hash_dirty = bytes[129] & 1 != 0;
                node.storage_hash_dirty = true;
            }
        }
        Ok(node)
    }
}

/// The codec for [ValueNode] records: 65 bytes with child hashes (a value
/// leaf has no children, so nothing beyond the payload is stored), 98 bytes
/// with the node hash.
#[derive(Debug, Clone, Copy)]
pub struct ValueCodec {
    flavor: CodecFlavor,
}

impl ValueCodec {
    /// Creates the codec for the given flavor.
    pub const fn new(flavor: CodecFlavor) -> Self {
        Self { flavor }
    }
}

impl RecordCodec<ValueNode> for ValueCodec {
    fn encoded_size(&self) -> usize {
        match self.flavor {
            CodecFlavor::WithChildHashes => 32 + 32 + 1,
            CodecFlavor::WithNodeHash => 32 + 32 + 1 + HASH_SIZE + 1,
        }
    }

    fn encode(&self, node: &ValueNode, out: &mut [u8]) -> Result<(), String> {
        out[..32].copy_from_slice(node.key.as_slice());
        out[32..64].copy_from_slice(node.value.as_slice());
        out[64] = node.path_length;
        if self.flavor == CodecFlavor::WithNodeHash {
            put_hash(out, 65, &node.hash, node.hash_dirty);
            out[97] = node.hash_dirty as u8;
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<ValueNode, String> {
        let key = B256::from_slice(&bytes[..32]);
        let value = B256::from_slice(&bytes[32..64]);
        let mut node = ValueNode::new(key, value, bytes[64]);
        if self.flavor == CodecFlavor::WithNodeHash {
            node.hash = take_hash(bytes, 65);
            node.hash_dirty = bytes[97] & 1 != 0;
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeKind;
    use proptest::prelude::*;

    fn arb_hash() -> impl Strategy<Value = B256> {
        any::<[u8; 32]>().prop_map(B256::from)
    }

    fn arb_id(kind: NodeKind) -> impl Strategy<Value = NodeId> {
        (0u64..=crate::kinds::MAX_ENCODABLE_INDEX).prop_map(move |index| NodeId::new(kind, index))
    }

    fn arb_child_id() -> impl Strategy<Value = NodeId> {
        prop_oneof![
            Just(NodeId::EMPTY),
            arb_id(NodeKind::Branch),
            arb_id(NodeKind::Extension),
            arb_id(NodeKind::Account),
            arb_id(NodeKind::Value),
        ]
    }

    fn arb_branch() -> impl Strategy<Value = BranchNode> {
        (
            proptest::collection::vec(arb_child_id(), 16),
            proptest::collection::vec(arb_hash(), 16),
            any::<u16>(),
            any::<u16>(),
        )
            .prop_map(|(children, hashes, dirty_hashes, embedded_children)| {
                let mut node = BranchNode::new();
                for (slot, id) in children.into_iter().enumerate() {
                    node.children[slot] = NodeReference::new(id);
                }
                for (slot, hash) in hashes.into_iter().enumerate() {
                    node.child_hashes[slot] = hash;
                }
                node.dirty_hashes = dirty_hashes;
                node.embedded_children = embedded_children;
                node
            })
    }

    fn arb_extension() -> impl Strategy<Value = ExtensionNode> {
        (
            proptest::collection::vec(0u8..16, 1..=64),
            arb_id(NodeKind::Branch),
            arb_hash(),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(path, next, next_hash, next_hash_dirty, next_is_embedded)| {
                let mut node =
                    ExtensionNode::new(PackedNibbles::pack(&path), NodeReference::new(next));
                node.next_hash = next_hash;
                node.next_hash_dirty = next_hash_dirty;
                node.next_is_embedded = next_is_embedded;
                node
            })
    }

    fn arb_account() -> impl Strategy<Value = AccountNode> {
        (
            any::<[u8; 20]>(),
            any::<u64>(),
            any::<[u8; 32]>(),
            arb_hash(),
            prop_oneof![Just(NodeId::EMPTY), arb_id(NodeKind::Branch), arb_id(NodeKind::Value)],
            0u8..=64,
            arb_hash(),
            any::<bool>(),
        )
            .prop_map(
                |(address, nonce, balance, code_hash, storage, path_length, storage_hash, dirty)| {
                    let info = AccountInfo {
                        nonce,
                        balance: U256::from_be_bytes(balance),
                        code_hash,
                    };
                    let mut node = AccountNode::new(Address::from(address), info, path_length);
                    node.storage = NodeReference::new(storage);
                    node.storage_hash = storage_hash;
                    node.storage_hash_dirty = dirty;
                    node
                },
            )
    }

    fn arb_value() -> impl Strategy<Value = ValueNode> {
        (arb_hash(), arb_hash(), 0u8..=64)
            .prop_map(|(key, value, path_length)| ValueNode::new(key, value, path_length))
    }

    proptest! {
        #[test]
        fn branch_roundtrip_with_child_hashes(node in arb_branch()) {
            let codec = BranchCodec::new(CodecFlavor::WithChildHashes);
            let mut bytes = vec![0u8; codec.encoded_size()];
            codec.encode(&node, &mut bytes).unwrap();
            let decoded = codec.decode(&bytes).unwrap();

            prop_assert_eq!(&decoded.children, &node.children);
            prop_assert_eq!(decoded.dirty_hashes, node.dirty_hashes);
            prop_assert_eq!(decoded.embedded_children, node.embedded_children);
            for slot in 0..16 {
                if node.dirty_hashes & (1 << slot) == 0 {
                    prop_assert_eq!(decoded.child_hashes[slot], node.child_hashes[slot]);
                } else {
                    // A dirty child hash is zero-filled on disk.
                    prop_assert_eq!(decoded.child_hashes[slot], B256::ZERO);
                }
            }
            // The own hash is not part of this flavor.
            prop_assert!(decoded.hash_dirty);
        }

        #[test]
        fn branch_roundtrip_with_node_hash(node in arb_branch()) {
            let codec = BranchCodec::new(CodecFlavor::WithNodeHash);
            let mut bytes = vec![0u8; codec.encoded_size()];
            let mut node = node;
            node.hash = B256::with_last_byte(9);
            node.hash_dirty = false;
            codec.encode(&node, &mut bytes).unwrap();
            let decoded = codec.decode(&bytes).unwrap();

            prop_assert_eq!(&decoded.children, &node.children);
            prop_assert_eq!(decoded.hash, node.hash);
            prop_assert!(!decoded.hash_dirty);
            // Child hashes are not part of this flavor.
            prop_assert_eq!(decoded.dirty_hashes, 0xFFFF);
        }

        #[test]
        fn extension_roundtrip(node in arb_extension(), flavor in prop_oneof![
            Just(CodecFlavor::WithChildHashes),
            Just(CodecFlavor::WithNodeHash),
        ]) {
            let codec = ExtensionCodec::new(flavor);
            let mut bytes = vec![0u8; codec.encoded_size()];
            codec.encode(&node, &mut bytes).unwrap();
            let decoded = codec.decode(&bytes).unwrap();

            prop_assert_eq!(decoded.path, node.path);
            prop_assert_eq!(&decoded.next, &node.next);
            match flavor {
                CodecFlavor::WithChildHashes => {
                    prop_assert_eq!(decoded.next_hash_dirty, node.next_hash_dirty);
                    prop_assert_eq!(decoded.next_is_embedded, node.next_is_embedded);
                    if !node.next_hash_dirty {
                        prop_assert_eq!(decoded.next_hash, node.next_hash);
                    }
                    prop_assert!(decoded.hash_dirty);
                }
                CodecFlavor::WithNodeHash => {
                    prop_assert!(decoded.next_hash_dirty);
                }
            }
        }

        #[test]
        fn account_roundtrip(node in arb_account(), flavor in prop_oneof![
            Just(CodecFlavor::WithChildHashes),
            Just(CodecFlavor::WithNodeHash),
        ]) {
            let codec = AccountCodec::new(flavor);
            let mut bytes = vec![0u8; codec.encoded_size()];
            codec.encode(&node, &mut bytes).unwrap();
            let decoded = codec.decode(&bytes).unwrap();

            prop_assert_eq!(decoded.address, node.address);
            prop_assert_eq!(decoded.info, node.info);
            prop_assert_eq!(&decoded.storage, &node.storage);
            prop_assert_eq!(decoded.path_length, node.path_length);
            match flavor {
                CodecFlavor::WithChildHashes => {
                    prop_assert_eq!(decoded.storage_hash_dirty, node.storage_hash_dirty);
                    if !node.storage_hash_dirty {
                        prop_assert_eq!(decoded.storage_hash, node.storage_hash);
                    }
                    prop_assert!(decoded.hash_dirty);
                }
                CodecFlavor::WithNodeHash => {
                    prop_assert!(decoded.storage_hash_dirty);
                }
            }
        }

        #[test]
        fn value_roundtrip(node in arb_value(), flavor in prop_oneof![
            Just(CodecFlavor::WithChildHashes),
            Just(CodecFlavor::WithNodeHash),
        ]) {
            let codec = ValueCodec::new(flavor);
            let mut bytes = vec![0u8; codec.encoded_size()];
            codec.encode(&node, &mut bytes).unwrap();
            let decoded = codec.decode(&bytes).unwrap();

            prop_assert_eq!(decoded.key, node.key);
            prop_assert_eq!(decoded.value, node.value);
            prop_assert_eq!(decoded.path_length, node.path_length);
            prop_assert!(decoded.hash_dirty);
        }
    }

    #[test]
    fn corrupt_extension_records_are_rejected() {
        let codec = ExtensionCodec::new(CodecFlavor::WithChildHashes);
        let bytes = vec![0u8; codec.encoded_size()];
        // All-zero record: empty path and an empty-node child.
        assert!(codec.decode(&bytes).is_err());
    }
}
