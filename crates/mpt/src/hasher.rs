//! The hash engine: computes and caches node hashes bottom-up.
//!
//! Two algorithms are selectable per forest:
//!
//! - [HashScheme::Direct]: a SHA-256 digest over a canonical binary
//!   serialization of each node, where a child contributes its own hash.
//! - [HashScheme::EthereumLike]: Ethereum's MPT hashing: keccak over RLP
//!   node encodings with hex-prefix paths, where a child whose encoding is
//!   shorter than 32 bytes is inlined into the parent instead of hashed.
//!
//! The engine walks with hash handles, so readers and views proceed while
//! hashes are computed; only the short write-back of results excludes them.
//! The per-node dirty bits maintained by the update algebra steer the
//! recursion: a clean subtree is never revisited, which makes a second call
//! with no intervening mutation a no-op.

use crate::{
    AccountNode, ExtensionNode, ForestResult, Node, NodeId, NodeManager, NodeReference, ValueNode,
};
use alloy_primitives::{keccak256, B256, U256};
use alloy_rlp::Encodable;
use alloy_trie::EMPTY_ROOT_HASH;
use sha2::{Digest, Sha256};

/// The hash of an empty subtree under [HashScheme::Direct].
pub const EMPTY_DIRECT_HASH: B256 = B256::ZERO;

/// The hashing algorithm of a forest, fixed at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashScheme {
    /// SHA-256 over canonical node serializations.
    #[default]
    Direct,
    /// Ethereum's keccak-over-RLP trie hashing with embedded small nodes.
    /// Requires path-length tracking on leaves.
    EthereumLike,
}

/// The list of `(node, hash)` pairs produced by one hashing call; archive
/// replays feed it back instead of recomputing.
pub type HashTable = Vec<(NodeId, B256)>;

const PREFIX_EXTENSION_EVEN: u8 = 0;
const PREFIX_EXTENSION_ODD: u8 = 1;
const PREFIX_LEAF_EVEN: u8 = 2;
const PREFIX_LEAF_ODD: u8 = 3;

/// The per-forest hashing engine.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Hasher<'a> {
    manager: &'a NodeManager,
    scheme: HashScheme,
}

/// A child's contribution to its parent's preimage.
enum Contribution {
    /// The subtree is absent.
    Empty,
    /// The child's 32-byte hash.
    Hashed(B256),
    /// The child's raw encoding, inlined (Ethereum-style only).
    Embedded(Vec<u8>),
}

impl<'a> Hasher<'a> {
    pub(crate) const fn new(manager: &'a NodeManager, scheme: HashScheme) -> Self {
        Self { manager, scheme }
    }

    /// The hash of an empty subtree.
    pub(crate) const fn empty_hash(&self) -> B256 {
        match self.scheme {
            HashScheme::Direct => EMPTY_DIRECT_HASH,
            HashScheme::EthereumLike => EMPTY_ROOT_HASH,
        }
    }

    /// Brings every stale hash under `root` up to date and returns the root
    /// hash plus the table of all hashes computed during this call.
    pub(crate) fn update_hashes(
        &self,
        root: &NodeReference,
    ) -> ForestResult<(B256, HashTable)> {
        let mut table = HashTable::new();
        let hash = self.hash_subtree(root, &mut table)?;
        Ok((hash, table))
    }

    fn hash_subtree(&self, reference: &NodeReference, table: &mut HashTable) -> ForestResult<B256> {
        if reference.is_empty() {
            return Ok(self.empty_hash());
        }
        let mut handle = self.manager.get_hash(reference)?;
        let id = handle.id();
        match &*handle {
            Node::Empty => Ok(self.empty_hash()),
            Node::Value(value) => {
                if !value.hash_dirty {
                    return Ok(value.hash);
                }
                let hash = self.hash_bytes(&self.value_preimage(value));
                handle.write_back(|node| {
                    let Node::Value(value) = node else { unreachable!() };
                    value.hash = hash;
                    value.hash_dirty = false;
                });
                table.push((id, hash));
                Ok(hash)
            }
            Node::Account(account) => {
                if !account.hash_dirty && !account.storage_hash_dirty {
                    return Ok(account.hash);
                }
                let storage = account.storage.clone();
                let storage_hash = if account.storage_hash_dirty {
                    self.hash_subtree(&storage, table)?
                } else {
                    account.storage_hash
                };
                let mut preimage_account = account.clone();
                preimage_account.storage_hash = storage_hash;
                let hash = self.hash_bytes(&self.account_preimage(&preimage_account));
                handle.write_back(|node| {
                    let Node::Account(account) = node else { unreachable!() };
                    account.storage_hash = storage_hash;
                    account.storage_hash_dirty = false;
                    account.hash = hash;
                    account.hash_dirty = false;
                });
                table.push((id, hash));
                Ok(hash)
            }
            Node::Extension(extension) => {
                if !extension.hash_dirty && !extension.next_hash_dirty {
                    return Ok(extension.hash);
                }
                let next = extension.next.clone();
                let next_hash = if extension.next_hash_dirty {
                    self.hash_subtree(&next, table)?
                } else {
                    extension.next_hash
                };
                let contribution = self.contribution(&next, next_hash)?;
                let embedded = matches!(contribution, Contribution::Embedded(_));
                let preimage = self.extension_preimage(extension, &contribution);
                let hash = self.hash_bytes(&preimage);
                handle.write_back(|node| {
                    let Node::Extension(extension) = node else { unreachable!() };
                    extension.next_hash = next_hash;
                    extension.next_hash_dirty = false;
                    extension.next_is_embedded = embedded;
                    extension.hash = hash;
                    extension.hash_dirty = false;
                });
                table.push((id, hash));
                Ok(hash)
            }
            Node::Branch(branch) => {
                if !branch.hash_dirty && branch.dirty_hashes == 0 {
                    return Ok(branch.hash);
                }
                let mut child_hashes = branch.child_hashes;
                let mut embedded_children = branch.embedded_children;
                let mut contributions: [Contribution; 16] =
                    std::array::from_fn(|_| Contribution::Empty);
                for slot in 0..16 {
                    let child = branch.children[slot].clone();
                    if child.is_empty() {
                        child_hashes[slot] = self.empty_hash();
                        continue;
                    }
                    if branch.dirty_hashes & (1 << slot) != 0 {
                        child_hashes[slot] = self.hash_subtree(&child, table)?;
                    }
                    let contribution = self.contribution(&child, child_hashes[slot])?;
                    if matches!(contribution, Contribution::Embedded(_)) {
                        embedded_children |= 1 << slot;
                    } else {
                        embedded_children &= !(1 << slot);
                    }
                    contributions[slot] = contribution;
                }
                let preimage = self.branch_preimage(&child_hashes, &contributions);
                let hash = self.hash_bytes(&preimage);
                handle.write_back(|node| {
                    let Node::Branch(branch) = node else { unreachable!() };
                    branch.child_hashes = child_hashes;
                    branch.dirty_hashes = 0;
                    branch.embedded_children = embedded_children;
                    branch.hash = hash;
                    branch.hash_dirty = false;
                });
                table.push((id, hash));
                Ok(hash)
            }
        }
    }

    /// Recomputes a node's hash from its fields and cached child hashes
    /// without touching the trie. Used by the invariant checker to validate
    /// non-dirty cached hashes; the node's child hashes must be clean.
    pub(crate) fn node_hash(&self, node: &Node) -> ForestResult<B256> {
        if matches!(node, Node::Empty) {
            return Ok(self.empty_hash());
        }
        match self.scheme {
            HashScheme::Direct => {
                let preimage = match node {
                    Node::Empty => unreachable!(),
                    Node::Value(value) => self.value_preimage(value),
                    Node::Account(account) => self.account_preimage(account),
                    Node::Extension(extension) => self
                        .extension_preimage(extension, &Contribution::Hashed(extension.next_hash)),
                    Node::Branch(branch) => {
                        let contributions: [Contribution; 16] =
                            std::array::from_fn(|_| Contribution::Empty);
                        self.branch_preimage(&branch.child_hashes, &contributions)
                    }
                };
                Ok(self.hash_bytes(&preimage))
            }
            HashScheme::EthereumLike => Ok(self.hash_bytes(&self.ethereum_encoding(node)?)),
        }
    }

    fn hash_bytes(&self, preimage: &[u8]) -> B256 {
        match self.scheme {
            HashScheme::Direct => {
                B256::from_slice(Sha256::digest(preimage).as_slice())
            }
            HashScheme::EthereumLike => keccak256(preimage),
        }
    }

    /// The contribution of a freshly hashed child to its parent's preimage.
    /// Only the Ethereum scheme ever embeds; children whose encoding reaches
    /// 32 bytes contribute their hash.
    fn contribution(&self, child: &NodeReference, hash: B256) -> ForestResult<Contribution> {
        if child.is_empty() {
            return Ok(Contribution::Empty);
        }
        if self.scheme == HashScheme::Direct {
            return Ok(Contribution::Hashed(hash));
        }
        let encoding = {
            let handle = self.manager.get_read(child)?;
            self.ethereum_encoding(&handle)?
        };
        if encoding.len() < 32 {
            Ok(Contribution::Embedded(encoding))
        } else {
            Ok(Contribution::Hashed(hash))
        }
    }

    /// The RLP encoding of a node under the Ethereum scheme. Cached child
    /// hashes must be clean; the caller hashes bottom-up, so they are.
    fn ethereum_encoding(&self, node: &Node) -> ForestResult<Vec<u8>> {
        match node {
            Node::Empty => Ok(vec![alloy_rlp::EMPTY_STRING_CODE]),
            Node::Value(value) => Ok(self.value_preimage(value)),
            Node::Account(account) => Ok(self.account_preimage(account)),
            Node::Extension(extension) => {
                let contribution = if extension.next_is_embedded {
                    self.contribution(&extension.next, extension.next_hash)?
                } else {
                    Contribution::Hashed(extension.next_hash)
                };
                Ok(self.extension_preimage(extension, &contribution))
            }
            Node::Branch(branch) => {
                let mut contributions: [Contribution; 16] =
                    std::array::from_fn(|_| Contribution::Empty);
                for slot in 0..16 {
                    let child = &branch.children[slot];
                    if child.is_empty() {
                        continue;
                    }
                    contributions[slot] = if branch.embedded_children & (1 << slot) != 0 {
                        self.contribution(child, branch.child_hashes[slot])?
                    } else {
                        Contribution::Hashed(branch.child_hashes[slot])
                    };
                }
                Ok(self.branch_preimage(&branch.child_hashes, &contributions))
            }
        }
    }

    fn value_preimage(&self, value: &ValueNode) -> Vec<u8> {
        match self.scheme {
            HashScheme::Direct => {
                let mut preimage = Vec::with_capacity(65);
                preimage.push(0x04);
                preimage.extend_from_slice(value.key.as_slice());
                preimage.extend_from_slice(value.value.as_slice());
                preimage
            }
            HashScheme::EthereumLike => {
                // The leaf sits on its hashed-key path, like account leaves.
                let hashed = keccak256(value.key.as_slice());
                let path = leaf_path(hashed.as_slice(), value.path_length);
                let hp = hex_prefix(&path, true);

                let mut payload = Vec::new();
                hp.as_slice().encode(&mut payload);
                let mut slot_rlp = Vec::new();
                U256::from_be_slice(value.value.as_slice()).encode(&mut slot_rlp);
                slot_rlp.as_slice().encode(&mut payload);

                wrap_list(payload)
            }
        }
    }

    fn account_preimage(&self, account: &AccountNode) -> Vec<u8> {
        match self.scheme {
            HashScheme::Direct => {
                let mut preimage = Vec::with_capacity(125);
                preimage.push(0x03);
                preimage.extend_from_slice(account.address.as_slice());
                preimage.extend_from_slice(&account.info.nonce.to_be_bytes());
                preimage.extend_from_slice(&account.info.balance.to_be_bytes::<32>());
                preimage.extend_from_slice(account.info.code_hash.as_slice());
                preimage.extend_from_slice(account.storage_hash.as_slice());
                preimage
            }
            HashScheme::EthereumLike => {
                let hashed = keccak256(account.address.as_slice());
                let path = leaf_path(hashed.as_slice(), account.path_length);
                let hp = hex_prefix(&path, true);

                let storage_root = if account.storage.is_empty() {
                    EMPTY_ROOT_HASH
                } else {
                    account.storage_hash
                };
                let mut body = Vec::new();
                account.info.nonce.encode(&mut body);
                account.info.balance.encode(&mut body);
                storage_root.encode(&mut body);
                account.info.code_hash.encode(&mut body);
                let body = wrap_list(body);

                let mut payload = Vec::new();
                hp.as_slice().encode(&mut payload);
                body.as_slice().encode(&mut payload);
                wrap_list(payload)
            }
        }
    }

    fn extension_preimage(&self, extension: &ExtensionNode, next: &Contribution) -> Vec<u8> {
        match self.scheme {
            HashScheme::Direct => {
                let (path_bytes, path_len) = extension.path.raw();
                let mut preimage = Vec::with_capacity(66);
                preimage.push(0x02);
                preimage.extend_from_slice(path_bytes);
                preimage.push(path_len);
                match next {
                    Contribution::Hashed(hash) => preimage.extend_from_slice(hash.as_slice()),
                    Contribution::Empty | Contribution::Embedded(_) => {
                        preimage.extend_from_slice(EMPTY_DIRECT_HASH.as_slice())
                    }
                }
                preimage
            }
            HashScheme::EthereumLike => {
                let hp = hex_prefix(&extension.path.unpack(), false);
                let mut payload = Vec::new();
                hp.as_slice().encode(&mut payload);
                append_contribution(&mut payload, next);
                wrap_list(payload)
            }
        }
    }

    fn branch_preimage(
        &self,
        child_hashes: &[B256; 16],
        contributions: &[Contribution; 16],
    ) -> Vec<u8> {
        match self.scheme {
            HashScheme::Direct => {
                let mut preimage = Vec::with_capacity(1 + 16 * 32);
                preimage.push(0x01);
                for hash in child_hashes {
                    preimage.extend_from_slice(hash.as_slice());
                }
                preimage
            }
            HashScheme::EthereumLike => {
                let mut payload = Vec::new();
                for contribution in contributions {
                    append_contribution(&mut payload, contribution);
                }
                // The 17th slot: branches never terminate a fixed-length key.
                payload.push(alloy_rlp::EMPTY_STRING_CODE);
                wrap_list(payload)
            }
        }
    }
}

/// The last `path_length` nibbles of a hashed key: the part of the path
/// below the leaf's parent slot.
fn leaf_path(hashed_key: &[u8], path_length: u8) -> Vec<u8> {
    let nibbles: Vec<u8> =
        hashed_key.iter().flat_map(|byte| [byte >> 4, byte & 0x0F]).collect();
    nibbles[nibbles.len() - path_length as usize..].to_vec()
}

/// Hex-prefix encoding of a nibble path (Yellow Paper appendix C).
fn hex_prefix(nibbles: &[u8], leaf: bool) -> Vec<u8> {
    let odd = nibbles.len() % 2 == 1;
    let prefix = match (leaf, odd) {
        (false, false) => PREFIX_EXTENSION_EVEN,
        (false, true) => PREFIX_EXTENSION_ODD,
        (true, false) => PREFIX_LEAF_EVEN,
        (true, true) => PREFIX_LEAF_ODD,
    };
    let mut out = Vec::with_capacity(1 + nibbles.len() / 2);
    let mut rest = nibbles;
    if odd {
        out.push(prefix << 4 | nibbles[0]);
        rest = &nibbles[1..];
    } else {
        out.push(prefix << 4);
    }
    for pair in rest.chunks_exact(2) {
        out.push(pair[0] << 4 | pair[1]);
    }
    out
}

fn wrap_list(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    alloy_rlp::Header { list: true, payload_length: payload.len() }.encode(&mut out);
    out.extend_from_slice(&payload);
    out
}

fn append_contribution(payload: &mut Vec<u8>, contribution: &Contribution) {
    match contribution {
        Contribution::Empty => payload.push(alloy_rlp::EMPTY_STRING_CODE),
        Contribution::Hashed(hash) => hash.encode(payload),
        Contribution::Embedded(raw) => payload.extend_from_slice(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeSource;
    use grove_stock::InMemoryStock;

    #[test]
    fn hex_prefix_matches_the_yellow_paper_examples() {
        // Even extension path.
        assert_eq!(hex_prefix(&[1, 2, 3, 4], false), vec![0x00, 0x12, 0x34]);
        // Odd extension path.
        assert_eq!(hex_prefix(&[1, 2, 3], false), vec![0x11, 0x23]);
        // Even leaf path.
        assert_eq!(hex_prefix(&[0xF, 1], true), vec![0x20, 0xF1]);
        // Odd leaf path.
        assert_eq!(hex_prefix(&[0xF], true), vec![0x3F]);
        // Empty leaf path.
        assert_eq!(hex_prefix(&[], true), vec![0x20]);
    }

    #[test]
    fn leaf_path_takes_the_tail() {
        let key = [0x12u8, 0x34];
        assert_eq!(leaf_path(&key, 3), vec![2, 3, 4]);
        assert_eq!(leaf_path(&key, 0), Vec::<u8>::new());
    }

    /// A value leaf's encoded path must come from the tail of the keccak
    /// image of its key, not from the raw key bytes: that is where the leaf
    /// physically sits and what its path length is measured against.
    #[test]
    fn value_preimages_sit_on_the_hashed_key_path() {
        let source = NodeSource::new(
            Box::new(InMemoryStock::new()),
            Box::new(InMemoryStock::new()),
            Box::new(InMemoryStock::new()),
            Box::new(InMemoryStock::new()),
            false,
        );
        let manager = crate::NodeManager::new(source, 8, 2);
        let hasher = Hasher::new(&manager, HashScheme::EthereumLike);

        let key = B256::with_last_byte(0x42);
        let value = ValueNode::new(key, B256::with_last_byte(7), 3);
        let preimage = hasher.value_preimage(&value);

        let hashed = keccak256(key.as_slice());
        let mut payload = Vec::new();
        hex_prefix(&leaf_path(hashed.as_slice(), 3), true).as_slice().encode(&mut payload);
        let mut slot_rlp = Vec::new();
        U256::from_be_slice(value.value.as_slice()).encode(&mut slot_rlp);
        slot_rlp.as_slice().encode(&mut payload);
        assert_eq!(preimage, wrap_list(payload));

        // The raw key and its keccak image give different paths, so an
        // encoding derived from the raw key cannot match.
        assert_ne!(leaf_path(key.as_slice(), 64), leaf_path(hashed.as_slice(), 64));
    }
}
