//! End-to-end tests of the forest: literal scenarios, invariant
//! preservation, persistence round-trips and concurrency.

use alloy_primitives::{Address, B256, U256};
use grove_mpt::{
    AccountInfo, CodecFlavor, Forest, ForestConfig, ForestMode, HashScheme, Node, NodeVisitor,
    StorageVariant, VisitResponse, VisitWith,
};
use std::sync::Arc;

fn address(bytes: &[u8]) -> Address {
    let mut raw = [0u8; 20];
    raw[..bytes.len()].copy_from_slice(bytes);
    Address::new(raw)
}

fn nonce(n: u64) -> AccountInfo {
    AccountInfo { nonce: n, ..Default::default() }
}

fn direct_config() -> ForestConfig {
    ForestConfig::default().with_direct_paths()
}

#[test]
fn reading_the_empty_trie_finds_nothing() {
    let forest = Forest::ephemeral(ForestConfig::default());
    let root = forest.empty_root();
    let (info, exists) = forest.get_account_info(&root, &address(&[0x01])).unwrap();
    assert!(!exists);
    assert!(info.is_empty());
}

#[test]
fn a_single_insert_is_readable() {
    let forest = Forest::ephemeral(ForestConfig::default());
    let addr = address(&[0x01]);
    let root = forest.set_account_info(&forest.empty_root(), &addr, nonce(12)).unwrap();
    assert_eq!(forest.get_account_info(&root, &addr).unwrap(), (nonce(12), true));
    forest.check(&root).unwrap();
}

/// Two addresses sharing the nibble prefix 1-2-3 produce an extension over
/// a branch holding both account leaves.
#[test]
fn common_prefixes_build_an_extension_over_a_branch() {
    let forest = Forest::ephemeral(direct_config());
    let addr_a = address(&[0x12, 0x3A]);
    let addr_b = address(&[0x12, 0x3B]);

    let root = forest.set_account_info(&forest.empty_root(), &addr_a, nonce(1)).unwrap();
    let root = forest.set_account_info(&root, &addr_b, nonce(2)).unwrap();

    struct Shape {
        kinds: Vec<String>,
    }
    impl NodeVisitor for Shape {
        fn visit(&mut self, node: &Node, _info: &grove_mpt::NodeInfo) -> VisitResponse {
            self.kinds.push(match node {
                Node::Extension(extension) => format!("ext:{}", extension.path.len()),
                Node::Branch(branch) => format!("branch:{}", branch.child_count()),
                Node::Account(_) => "account".to_string(),
                Node::Value(_) => "value".to_string(),
                Node::Empty => "empty".to_string(),
            });
            VisitResponse::Continue
        }
    }
    let mut shape = Shape { kinds: Vec::new() };
    forest.visit(&root, &mut shape).unwrap();
    assert_eq!(shape.kinds, vec!["ext:3", "branch:2", "account", "account"]);

    assert_eq!(forest.get_account_info(&root, &addr_a).unwrap(), (nonce(1), true));
    assert_eq!(forest.get_account_info(&root, &addr_b).unwrap(), (nonce(2), true));
    forest.check(&root).unwrap();
}

/// Deleting one of two sibling accounts collapses the branch (and the
/// extension above it) back into a single leaf.
#[test]
fn deleting_a_sibling_collapses_the_branch()  {
    let forest = Forest::ephemeral(direct_config());
    let addr_a = address(&[0x12, 0x3A]);
    let addr_b = address(&[0x12, 0x3B]);

    let root = forest.set_account_info(&forest.empty_root(), &addr_a, nonce(1)).unwrap();
    let root = forest.set_account_info(&root, &addr_b, nonce(2)).unwrap();
    let root = forest.set_account_info(&root, &addr_b, AccountInfo::default()).unwrap();

    let mut kinds = Vec::new();
    let mut collect = VisitWith(|node: &Node, _info: &grove_mpt::NodeInfo| {
        kinds.push(node.kind());
        VisitResponse::Continue
    });
    forest.visit(&root, &mut collect).unwrap();
    drop(collect);
    assert_eq!(kinds, vec![grove_mpt::NodeKind::Account]);

    assert_eq!(forest.get_account_info(&root, &addr_a).unwrap(), (nonce(1), true));
    assert_eq!(forest.get_account_info(&root, &addr_b).unwrap().1, false);
    forest.check(&root).unwrap();
    // The branch, the extension and the deleted leaf are all reclaimed.
    assert_eq!(forest.node_count(), 1);
}

/// Deleting the leaf that split an extension re-fuses the two extension
/// levels into one.
#[test]
fn branch_collapse_under_an_extension_fuses_paths() {
    let forest = Forest::ephemeral(direct_config());
    let addr_a = address(&[0x11, 0x11]);
    let addr_b = address(&[0x11, 0x12]);
    let addr_c = address(&[0x11, 0x21]);

    let root = forest.set_account_info(&forest.empty_root(), &addr_a, nonce(1)).unwrap();
    let root = forest.set_account_info(&root, &addr_b, nonce(2)).unwrap();
    let root = forest.set_account_info(&root, &addr_c, nonce(3)).unwrap();
    forest.check(&root).unwrap();

    let root = forest.set_account_info(&root, &addr_c, AccountInfo::default()).unwrap();

    let mut kinds = Vec::new();
    let mut collect = VisitWith(|node: &Node, _info: &grove_mpt::NodeInfo| {
        kinds.push(match node {
            Node::Extension(extension) => format!("ext:{}", extension.path.len()),
            Node::Branch(branch) => format!("branch:{}", branch.child_count()),
            other => format!("{:?}", other.kind()),
        });
        VisitResponse::Continue
    });
    forest.visit(&root, &mut collect).unwrap();
    drop(collect);
    assert_eq!(kinds, vec!["ext:3", "branch:2", "Account", "Account"]);

    assert_eq!(forest.get_account_info(&root, &addr_a).unwrap(), (nonce(1), true));
    assert_eq!(forest.get_account_info(&root, &addr_b).unwrap(), (nonce(2), true));
    assert!(!forest.get_account_info(&root, &addr_c).unwrap().1);
    forest.check(&root).unwrap();
    assert_eq!(forest.node_count(), 4);
}

#[test]
fn storage_slots_read_back_and_missing_slots_are_zero() {
    let forest = Forest::ephemeral(ForestConfig::default());
    let addr = address(&[0xAA]);
    let info = AccountInfo { nonce: 1, balance: U256::from(1), code_hash: B256::repeat_byte(0xAA) };
    let key = B256::with_last_byte(0x3A);
    let other = B256::with_last_byte(0x3B);

    let root = forest.set_account_info(&forest.empty_root(), &addr, info).unwrap();
    let root = forest.set_value(&root, &addr, &key, B256::with_last_byte(0x01)).unwrap();

    assert_eq!(forest.get_value(&root, &addr, &key).unwrap(), B256::with_last_byte(0x01));
    assert_eq!(forest.get_value(&root, &addr, &other).unwrap(), B256::ZERO);
    forest.check(&root).unwrap();
}

#[test]
fn writing_a_slot_of_an_absent_account_is_a_noop() {
    let forest = Forest::ephemeral(ForestConfig::default());
    let root = forest.empty_root();
    let new_root = forest
        .set_value(&root, &address(&[0x01]), &B256::with_last_byte(1), B256::with_last_byte(2))
        .unwrap();
    assert_eq!(new_root, root);
}

#[test]
fn set_get_roundtrips_across_many_accounts() {
    for hashing in [HashScheme::Direct, HashScheme::EthereumLike] {
        let forest = Forest::ephemeral(ForestConfig::default().with_hashing(hashing));
        let mut root = forest.empty_root();
        for i in 1..=200u64 {
            let addr = address(&i.to_be_bytes());
            root = forest.set_account_info(&root, &addr, nonce(i)).unwrap();
        }
        for i in 1..=200u64 {
            let addr = address(&i.to_be_bytes());
            assert_eq!(forest.get_account_info(&root, &addr).unwrap(), (nonce(i), true));
        }
        forest.check(&root).unwrap();
    }
}

#[test]
fn deleting_an_account_releases_its_storage_exactly_once() {
    let forest = Forest::ephemeral(ForestConfig::default());
    let addr = address(&[0xAA]);
    let mut root = forest.set_account_info(&forest.empty_root(), &addr, nonce(1)).unwrap();
    for i in 1..=8u8 {
        root = forest
            .set_value(&root, &addr, &B256::with_last_byte(i), B256::with_last_byte(i))
            .unwrap();
    }
    assert!(forest.node_count() > 1);

    root = forest.delete_account(&root, &addr).unwrap();
    assert!(root.is_empty());
    // The background releaser drains before close; a double release of any
    // node would panic inside the stocks.
    forest.close().unwrap();
    assert_eq!(forest.node_count(), 0);
}

#[test]
fn hashes_are_deterministic_across_forests() {
    for hashing in [HashScheme::Direct, HashScheme::EthereumLike] {
        let mut hashes = Vec::new();
        for _ in 0..2 {
            let forest = Forest::ephemeral(ForestConfig::default().with_hashing(hashing));
            let mut root = forest.empty_root();
            for i in 1..=50u64 {
                let addr = address(&i.to_be_bytes());
                root = forest.set_account_info(&root, &addr, nonce(i)).unwrap();
                root = forest
                    .set_value(&root, &addr, &B256::with_last_byte(7), B256::with_last_byte(9))
                    .unwrap();
            }
            let (hash, table) = forest.update_hashes_for(&root).unwrap();
            assert!(!table.is_empty());
            // Hashing again without mutations computes nothing new.
            let (again, empty_table) = forest.update_hashes_for(&root).unwrap();
            assert_eq!(again, hash);
            assert!(empty_table.is_empty());
            forest.check(&root).unwrap();
            hashes.push(hash);
        }
        assert_eq!(hashes[0], hashes[1], "scheme {hashing:?} must be deterministic");
    }
}

/// A one-account, one-slot state under the Ethereum-like scheme must hash
/// to the root the Yellow Paper formula gives. The expectation is composed
/// here from first principles (keccak'd key paths, hex-prefix encoding,
/// nested account RLP) rather than through the engine, so a path or
/// composition defect in the hasher cannot cancel itself out.
#[test]
fn ethereum_like_root_matches_the_yellow_paper_formula() {
    use alloy_primitives::keccak256;
    use alloy_rlp::Encodable;

    fn unpack(bytes: &[u8]) -> Vec<u8> {
        bytes.iter().flat_map(|byte| [byte >> 4, byte & 0x0F]).collect()
    }
    // Leaf paths here are full hashed keys, so always even-length.
    fn hex_prefix_leaf(nibbles: &[u8]) -> Vec<u8> {
        assert_eq!(nibbles.len() % 2, 0);
        let mut out = vec![0x20];
        for pair in nibbles.chunks_exact(2) {
            out.push(pair[0] << 4 | pair[1]);
        }
        out
    }
    fn rlp_list(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        alloy_rlp::Header { list: true, payload_length: payload.len() }.encode(&mut out);
        out.extend_from_slice(payload);
        out
    }

    let forest =
        Forest::ephemeral(ForestConfig::default().with_hashing(HashScheme::EthereumLike));
    let addr = address(&[0xAA]);
    let key = B256::with_last_byte(0x07);
    let value = B256::with_last_byte(0x2A);
    let info =
        AccountInfo { nonce: 1, balance: U256::from(100), code_hash: B256::repeat_byte(0x33) };

    let root = forest.set_account_info(&forest.empty_root(), &addr, info).unwrap();
    let root = forest.set_value(&root, &addr, &key, value).unwrap();
    let (state_root, _) = forest.update_hashes_for(&root).unwrap();

    // The storage trie is one leaf on the full hashed-key path.
    let mut slot_rlp = Vec::new();
    U256::from_be_slice(value.as_slice()).encode(&mut slot_rlp);
    let mut leaf = Vec::new();
    hex_prefix_leaf(&unpack(keccak256(key).as_slice())).as_slice().encode(&mut leaf);
    slot_rlp.as_slice().encode(&mut leaf);
    let storage_root = keccak256(rlp_list(&leaf));

    // The account trie is one leaf on the full hashed-address path.
    let mut body = Vec::new();
    info.nonce.encode(&mut body);
    info.balance.encode(&mut body);
    storage_root.encode(&mut body);
    info.code_hash.encode(&mut body);
    let body = rlp_list(&body);
    let mut leaf = Vec::new();
    hex_prefix_leaf(&unpack(keccak256(addr.as_slice()).as_slice())).as_slice().encode(&mut leaf);
    body.as_slice().encode(&mut leaf);
    let expected = keccak256(rlp_list(&leaf));

    assert_eq!(state_root, expected, "the state root must follow Ethereum's trie hashing");
    forest.check(&root).unwrap();
}

#[test]
fn hash_changes_when_state_changes() {
    let forest = Forest::ephemeral(ForestConfig::default());
    let addr = address(&[0x01]);
    let root = forest.set_account_info(&forest.empty_root(), &addr, nonce(1)).unwrap();
    let (before, _) = forest.update_hashes_for(&root).unwrap();
    let root = forest.set_account_info(&root, &addr, nonce(2)).unwrap();
    let (after, _) = forest.update_hashes_for(&root).unwrap();
    assert_ne!(before, after);
}

#[test]
fn frozen_roots_are_immutable() {
    let forest =
        Forest::ephemeral(ForestConfig::default().with_mode(ForestMode::Immutable));
    let addr = address(&[0x01]);
    let other = address(&[0x02]);

    let root0 = forest.empty_root();
    let root1 = forest.set_account_info(&root0, &addr, nonce(1)).unwrap();
    let (hash1, _) = forest.update_hashes_for(&root1).unwrap();
    forest.freeze(&root1).unwrap();

    // Mutations below the frozen root copy-on-write into a new root.
    let root2 = forest.set_account_info(&root1, &addr, nonce(2)).unwrap();
    assert_ne!(root2, root1);
    let root3 = forest.set_account_info(&root2, &other, nonce(3)).unwrap();

    assert_eq!(forest.get_account_info(&root1, &addr).unwrap(), (nonce(1), true));
    assert_eq!(forest.get_account_info(&root2, &addr).unwrap(), (nonce(2), true));
    assert_eq!(forest.get_account_info(&root3, &other).unwrap(), (nonce(3), true));
    let (hash1_again, _) = forest.update_hashes_for(&root1).unwrap();
    assert_eq!(hash1_again, hash1, "the frozen root's hash must not move");

    forest.freeze(&root3).unwrap();
    forest.check_all(&[root1, root3]).unwrap();
}

#[test]
fn freezing_a_mutable_forest_is_rejected() {
    let forest = Forest::ephemeral(ForestConfig::default());
    let root = forest.set_account_info(&forest.empty_root(), &address(&[1]), nonce(1)).unwrap();
    assert!(matches!(forest.freeze(&root), Err(grove_mpt::ForestError::FreezeUnsupported)));
}

#[test]
fn mutable_mode_overwrites_in_place() {
    let forest = Forest::ephemeral(ForestConfig::default());
    let addr = address(&[0x01]);
    let root1 = forest.set_account_info(&forest.empty_root(), &addr, nonce(1)).unwrap();
    let root2 = forest.set_account_info(&root1, &addr, nonce(2)).unwrap();
    assert_eq!(root1, root2, "an in-place update keeps the root reference");
    assert_eq!(forest.get_account_info(&root2, &addr).unwrap(), (nonce(2), true));
}

#[test]
fn diff_reports_account_and_slot_changes() {
    let forest =
        Forest::ephemeral(ForestConfig::default().with_mode(ForestMode::Immutable));
    let addr = address(&[0x01]);
    let key = B256::with_last_byte(5);

    let root1 = forest.set_account_info(&forest.empty_root(), &addr, nonce(1)).unwrap();
    let root1 = forest.set_value(&root1, &addr, &key, B256::with_last_byte(1)).unwrap();
    forest.update_hashes_for(&root1).unwrap();
    forest.freeze(&root1).unwrap();

    let root2 = forest.set_account_info(&root1, &addr, nonce(2)).unwrap();
    let root2 = forest.set_value(&root2, &addr, &key, B256::with_last_byte(9)).unwrap();

    let diff = forest.diff(&root1, &root2).unwrap();
    let entry = diff.accounts.get(&addr).expect("the account differs");
    assert_eq!(entry.before.unwrap(), nonce(1));
    assert_eq!(entry.after.unwrap(), nonce(2));
    let slot = entry.slots.get(&key).expect("the slot differs");
    assert_eq!(slot.before, B256::with_last_byte(1));
    assert_eq!(slot.after, B256::with_last_byte(9));

    assert!(forest.diff(&root1, &root1).unwrap().is_empty());
}

/// Open/insert/close/reopen across every storage variant, both modes and
/// both record flavors.
#[test]
fn states_survive_reopen_in_every_configuration() {
    for storage in
        [StorageVariant::InMemory, StorageVariant::File, StorageVariant::FileWithShadow]
    {
        for mode in [ForestMode::Mutable, ForestMode::Immutable] {
            for flavor in [CodecFlavor::WithChildHashes, CodecFlavor::WithNodeHash] {
                for cache_capacity in [1024, 128 * 1024] {
                    let dir = tempfile::tempdir().unwrap();
                    let config = ForestConfig::default()
                        .with_storage(storage)
                        .with_mode(mode)
                        .with_flavor(flavor)
                        .with_cache_capacity(cache_capacity);

                    let forest = Forest::open(dir.path(), config).unwrap();
                    let mut root = forest.empty_root();
                    for i in 1..=50u64 {
                        let addr = address(&i.to_be_bytes());
                        root = forest.set_account_info(&root, &addr, nonce(i)).unwrap();
                        root = forest
                            .set_value(
                                &root,
                                &addr,
                                &B256::with_last_byte(1),
                                B256::with_last_byte(i as u8),
                            )
                            .unwrap();
                    }
                    forest.update_hashes_for(&root).unwrap();
                    if mode == ForestMode::Immutable {
                        forest.freeze(&root).unwrap();
                    }
                    forest.flush().unwrap();
                    forest.close().unwrap();

                    let reopened = Forest::open(dir.path(), config).unwrap();
                    let root = root.id().into();
                    for i in 1..=50u64 {
                        let addr = address(&i.to_be_bytes());
                        assert_eq!(
                            reopened.get_account_info(&root, &addr).unwrap(),
                            (nonce(i), true),
                            "{storage:?}/{mode:?}/{flavor:?}/{cache_capacity}"
                        );
                        assert_eq!(
                            reopened.get_value(&root, &addr, &B256::with_last_byte(1)).unwrap(),
                            B256::with_last_byte(i as u8)
                        );
                    }
                    reopened.close().unwrap();
                }
            }
        }
    }
}

/// Concurrent readers against a stable root observe consistent data.
#[test]
fn concurrent_reads_are_race_free() {
    let forest = Arc::new(Forest::ephemeral(ForestConfig::default()));
    let mut root = forest.empty_root();
    for i in 1..=100u64 {
        root = forest.set_account_info(&root, &address(&i.to_be_bytes()), nonce(i)).unwrap();
    }
    let root = Arc::new(root);

    let threads: Vec<_> = (0..100)
        .map(|_| {
            let forest = Arc::clone(&forest);
            let root = Arc::clone(&root);
            std::thread::spawn(move || {
                for i in 1..=100u64 {
                    let addr = address(&i.to_be_bytes());
                    assert_eq!(forest.get_account_info(&root, &addr).unwrap(), (nonce(i), true));
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
}

/// Two roots, a single-node cache and a single-order write-buffer channel:
/// ten writer threads must terminate without deadlock and every thread's
/// last write must stick.
#[test]
fn concurrent_writes_survive_heavy_cache_pressure() {
    let forest = Arc::new(
        Forest::ephemeral(
            ForestConfig::default().with_cache_capacity(1).with_write_buffer_capacity(1),
        ),
    );

    // Two independent roots, each pre-populated with five thread-owned
    // accounts so the concurrent phase only performs in-place updates.
    let mut roots = Vec::new();
    for root_index in 0..2u8 {
        let mut root = forest.empty_root();
        for thread in 0..5u8 {
            let addr = address(&[root_index, thread]);
            root = forest.set_account_info(&root, &addr, nonce(1)).unwrap();
        }
        roots.push(Arc::new(root));
    }

    let threads: Vec<_> = (0..10u8)
        .map(|t| {
            let forest = Arc::clone(&forest);
            let root = Arc::clone(&roots[(t % 2) as usize]);
            let addr = address(&[t % 2, t / 2]);
            std::thread::spawn(move || {
                for round in 1..=1000u64 {
                    let updated = forest.set_account_info(&root, &addr, nonce(round)).unwrap();
                    assert_eq!(updated, *root, "in-place updates keep the root");
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    for root_index in 0..2u8 {
        for thread in 0..5u8 {
            let addr = address(&[root_index, thread]);
            let (info, exists) = forest.get_account_info(&roots[root_index as usize], &addr).unwrap();
            assert!(exists);
            assert_eq!(info, nonce(1000), "the last write of each thread must stick");
        }
    }
    forest.close().unwrap();
}

#[test]
fn clear_storage_empties_the_storage_trie() {
    let forest = Forest::ephemeral(ForestConfig::default());
    let addr = address(&[0xAA]);
    let mut root = forest.set_account_info(&forest.empty_root(), &addr, nonce(1)).unwrap();
    for i in 1..=4u8 {
        root = forest
            .set_value(&root, &addr, &B256::with_last_byte(i), B256::with_last_byte(i))
            .unwrap();
    }

    let root = forest.clear_storage(&root, &addr).unwrap();
    for i in 1..=4u8 {
        assert_eq!(forest.get_value(&root, &addr, &B256::with_last_byte(i)).unwrap(), B256::ZERO);
    }
    let (info, exists) = forest.get_account_info(&root, &addr).unwrap();
    assert!(exists);
    assert_eq!(info, nonce(1));
    forest.close().unwrap();
    // Only the account leaf remains after the background release.
    assert_eq!(forest.node_count(), 1);
}

#[test]
fn setting_a_slot_to_zero_deletes_its_leaf() {
    let forest = Forest::ephemeral(ForestConfig::default());
    let addr = address(&[0xAA]);
    let key = B256::with_last_byte(1);
    let root = forest.set_account_info(&forest.empty_root(), &addr, nonce(1)).unwrap();
    let root = forest.set_value(&root, &addr, &key, B256::with_last_byte(3)).unwrap();
    assert_eq!(forest.node_count(), 2);
    let root = forest.set_value(&root, &addr, &key, B256::ZERO).unwrap();
    assert_eq!(forest.get_value(&root, &addr, &key).unwrap(), B256::ZERO);
    assert_eq!(forest.node_count(), 1);
}
