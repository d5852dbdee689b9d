//! The forest: the process-wide container owning the stocks, the node
//! manager, the hash engine and the hashed-path caches.
//!
//! A forest exposes root-indexed operations: every call takes a caller-held
//! [NodeReference] naming one logical state, and mutations hand back the
//! (possibly new) root reference the caller must remember. In
//! [ForestMode::Mutable] the forest maintains a single evolving state and
//! in-place writes release whatever they orphan; in [ForestMode::Immutable]
//! roots are frozen after each logical block and later writes copy-on-write
//! around the shared history.

use crate::{
    check::Checker,
    diff::StateDiff,
    hasher::Hasher,
    ops::{AccountWrite, FullPath, SlotWrite, StorageClear, TrieOps},
    visit,
    AccountCodec, AccountInfo, BranchCodec, CodecFlavor, ExtensionCodec, ForestError,
    ForestResult, HashScheme, HashTable, NodeManager, NodeReference, NodeSource, NodeVisitor,
    ValueCodec,
};
use alloy_primitives::{keccak256, Address, B256};
use grove_stock::{FileStock, MemoryStock, RecordCodec, ShadowStock, Stock};
use lru::LruCache;
use parking_lot::Mutex;
use std::{num::NonZeroUsize, path::Path, sync::Arc};
use tracing::debug;

/// Whether a forest maintains one evolving state or an append-only history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForestMode {
    /// A single live state: writes mutate in place, freezing is rejected.
    #[default]
    Mutable,
    /// A frozen history: roots are frozen per block, writes copy-on-write.
    Immutable,
}

/// Where the stocks keep their records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageVariant {
    /// All records resident in memory, persisted on flush and close.
    #[default]
    InMemory,
    /// Records read and written in place in flat files.
    File,
    /// File-backed records mirrored by an in-memory shadow store that
    /// cross-checks every read.
    FileWithShadow,
}

/// The forest configuration, fixed at open time.
#[derive(Debug, Clone, Copy)]
pub struct ForestConfig {
    /// Live-state or archive semantics.
    pub mode: ForestMode,
    /// The hashing algorithm.
    pub hashing: HashScheme,
    /// The stock backing.
    pub storage: StorageVariant,
    /// The on-disk record flavor.
    pub flavor: CodecFlavor,
    /// The node cache capacity, in nodes.
    pub cache_capacity: usize,
    /// The write-buffer order channel capacity.
    pub write_buffer_capacity: usize,
    /// Whether leaves track the nibble count below their parent slot.
    /// Forced on by [HashScheme::EthereumLike].
    pub track_path_lengths: bool,
    /// Whether keys are hashed before navigation (addresses and storage
    /// keys become keccak images). Forced on by
    /// [HashScheme::EthereumLike].
    pub hashed_paths: bool,
    /// The capacity of each hashed-path cache, in keys.
    pub path_cache_capacity: usize,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            mode: ForestMode::default(),
            hashing: HashScheme::default(),
            storage: StorageVariant::default(),
            flavor: CodecFlavor::default(),
            cache_capacity: 128 * 1024,
            write_buffer_capacity: 1024,
            track_path_lengths: false,
            hashed_paths: true,
            path_cache_capacity: 16 * 1024,
        }
    }
}

impl ForestConfig {
    /// Sets the forest mode.
    pub const fn with_mode(mut self, mode: ForestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the hashing algorithm.
    pub const fn with_hashing(mut self, hashing: HashScheme) -> Self {
        self.hashing = hashing;
        self
    }

    /// Sets the stock backing.
    pub const fn with_storage(mut self, storage: StorageVariant) -> Self {
        self.storage = storage;
        self
    }

    /// Sets the on-disk record flavor.
    pub const fn with_flavor(mut self, flavor: CodecFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    /// Sets the node cache capacity.
    pub const fn with_cache_capacity(mut self, nodes: usize) -> Self {
        self.cache_capacity = nodes;
        self
    }

    /// Sets the write-buffer channel capacity.
    pub const fn with_write_buffer_capacity(mut self, orders: usize) -> Self {
        self.write_buffer_capacity = orders;
        self
    }

    /// Enables path-length tracking on leaves.
    pub const fn with_path_lengths(mut self) -> Self {
        self.track_path_lengths = true;
        self
    }

    /// Navigates by raw key nibbles instead of their keccak images.
    pub const fn with_direct_paths(mut self) -> Self {
        self.hashed_paths = false;
        self
    }

    fn normalized(mut self) -> Self {
        if self.hashing == HashScheme::EthereumLike {
            // Ethereum-style leaf encodings need the remaining-path length
            // and navigate hashed keys.
            self.track_path_lengths = true;
            self.hashed_paths = true;
        }
        self.cache_capacity = self.cache_capacity.max(1);
        self.write_buffer_capacity = self.write_buffer_capacity.max(1);
        self.path_cache_capacity = self.path_cache_capacity.max(1);
        self
    }
}

/// A concurrent, cached, hashable, optionally frozen forest of tries.
pub struct Forest {
    manager: Arc<NodeManager>,
    config: ForestConfig,
    account_paths: Mutex<LruCache<Address, FullPath>>,
    value_paths: Mutex<LruCache<B256, FullPath>>,
}

impl Forest {
    /// Opens a forest inside `directory`, creating the stock files on first
    /// use. Every [StorageVariant] persists across reopen; they differ in
    /// where the working set lives.
    pub fn open(directory: impl AsRef<Path>, config: ForestConfig) -> ForestResult<Self> {
        let config = config.normalized();
        let directory = directory.as_ref();
        debug!(target: "mpt::forest", ?directory, ?config, "opening forest");

        let source = NodeSource::new(
            open_stock(directory, "branches", config, BranchCodec::new(config.flavor))?,
            open_stock(directory, "extensions", config, ExtensionCodec::new(config.flavor))?,
            open_stock(directory, "accounts", config, AccountCodec::new(config.flavor))?,
            open_stock(directory, "values", config, ValueCodec::new(config.flavor))?,
            config.mode == ForestMode::Immutable,
        );
        Ok(Self::with_source(source, config))
    }

    /// Creates a forest whose stocks live purely in memory and vanish with
    /// the process. Intended for tests and throwaway tries.
    pub fn ephemeral(config: ForestConfig) -> Self {
        let config = config.normalized();
        let source = NodeSource::new(
            Box::new(MemoryStock::ephemeral(BranchCodec::new(config.flavor))),
            Box::new(MemoryStock::ephemeral(ExtensionCodec::new(config.flavor))),
            Box::new(MemoryStock::ephemeral(AccountCodec::new(config.flavor))),
            Box::new(MemoryStock::ephemeral(ValueCodec::new(config.flavor))),
            config.mode == ForestMode::Immutable,
        );
        Self::with_source(source, config)
    }

    fn with_source(source: NodeSource, config: ForestConfig) -> Self {
        let manager =
            NodeManager::new(source, config.cache_capacity, config.write_buffer_capacity);
        let paths = NonZeroUsize::new(config.path_cache_capacity).expect("normalized to >= 1");
        Self {
            manager,
            config,
            account_paths: Mutex::new(LruCache::new(paths)),
            value_paths: Mutex::new(LruCache::new(paths)),
        }
    }

    /// The reference of the empty trie, the starting root of every state.
    pub fn empty_root(&self) -> NodeReference {
        NodeReference::default()
    }

    /// This forest's configuration.
    pub const fn config(&self) -> &ForestConfig {
        &self.config
    }

    /// Reads the account record for `address` under `root`.
    pub fn get_account_info(
        &self,
        root: &NodeReference,
        address: &Address,
    ) -> ForestResult<(AccountInfo, bool)> {
        let path = self.account_path(address);
        self.ops().get_account(root, address, &path)
    }

    /// Writes the account record for `address`, returning the new root.
    /// Writing the empty record deletes the account and schedules its
    /// storage trie for background release.
    pub fn set_account_info(
        &self,
        root: &NodeReference,
        address: &Address,
        info: AccountInfo,
    ) -> ForestResult<NodeReference> {
        let path = self.account_path(address);
        let resolve = |address: &Address| self.account_path(address);
        let update = AccountWrite { address: *address, info, resolve: &resolve };
        let (new_root, _) = self.ops().set_leaf(root, &path, &update)?;
        Ok(new_root)
    }

    /// Deletes the account for `address`, returning the new root.
    pub fn delete_account(
        &self,
        root: &NodeReference,
        address: &Address,
    ) -> ForestResult<NodeReference> {
        self.set_account_info(root, address, AccountInfo::default())
    }

    /// Reads the storage slot `key` of `address` under `root`. Absent
    /// accounts and absent slots read as the zero value.
    pub fn get_value(
        &self,
        root: &NodeReference,
        address: &Address,
        key: &B256,
    ) -> ForestResult<B256> {
        let path = self.account_path(address);
        let Some((_, storage, _)) = self.ops().find_account(root, address, &path)? else {
            return Ok(B256::ZERO);
        };
        let value_path = self.value_path(key);
        self.ops().get_value(&storage, key, &value_path)
    }

    /// Writes the storage slot `key` of `address`, returning the new root.
    /// A zero value removes the slot; writing a slot of an absent account
    /// has no effect (the root is returned unchanged).
    pub fn set_value(
        &self,
        root: &NodeReference,
        address: &Address,
        key: &B256,
        value: B256,
    ) -> ForestResult<NodeReference> {
        let path = self.account_path(address);
        let resolve_account = |address: &Address| self.account_path(address);
        let resolve_value = |key: &B256| self.value_path(key);
        let update = SlotWrite {
            address: *address,
            key: *key,
            value,
            value_path: self.value_path(key),
            resolve_account: &resolve_account,
            resolve_value: &resolve_value,
        };
        let (new_root, _) = self.ops().set_leaf(root, &path, &update)?;
        Ok(new_root)
    }

    /// Clears the whole storage trie of `address`, returning the new root.
    /// The subtree is released in the background.
    pub fn clear_storage(
        &self,
        root: &NodeReference,
        address: &Address,
    ) -> ForestResult<NodeReference> {
        let path = self.account_path(address);
        let resolve_account = |address: &Address| self.account_path(address);
        let update = StorageClear { address: *address, resolve_account: &resolve_account };
        let (new_root, _) = self.ops().set_leaf(root, &path, &update)?;
        Ok(new_root)
    }

    /// Brings every stale hash under `root` up to date. Returns the root
    /// hash plus the `(id, hash)` table of everything computed during this
    /// call; a repeated call with no intervening mutation recomputes
    /// nothing.
    pub fn update_hashes_for(&self, root: &NodeReference) -> ForestResult<(B256, HashTable)> {
        self.hasher().update_hashes(root)
    }

    /// The hash of the empty root under this forest's hashing scheme.
    pub fn empty_root_hash(&self) -> B256 {
        self.hasher().empty_hash()
    }

    /// Seeds node hashes from a table produced by an earlier
    /// [Self::update_hashes_for] call, clearing their dirty bits. Replays
    /// use this to skip recomputation; setting hashes never invalidates the
    /// trie. Ids no longer present are skipped.
    pub fn set_hashes(&self, table: &HashTable) -> ForestResult<()> {
        for (id, hash) in table {
            let reference = NodeReference::new(*id);
            let mut handle = match self.manager.get_write(&reference) {
                Ok(handle) => handle,
                Err(ForestError::Stock(_)) => continue,
                Err(err) => return Err(err),
            };
            match &mut *handle {
                crate::Node::Empty => {}
                crate::Node::Branch(branch) => {
                    branch.hash = *hash;
                    branch.hash_dirty = false;
                }
                crate::Node::Extension(extension) => {
                    extension.hash = *hash;
                    extension.hash_dirty = false;
                }
                crate::Node::Account(account) => {
                    account.hash = *hash;
                    account.hash_dirty = false;
                }
                crate::Node::Value(value) => {
                    value.hash = *hash;
                    value.hash_dirty = false;
                }
            }
            handle.mark_dirty();
        }
        Ok(())
    }

    /// Freezes the state under `root`. Only legal on immutable forests.
    pub fn freeze(&self, root: &NodeReference) -> ForestResult<()> {
        if self.config.mode != ForestMode::Immutable {
            return Err(ForestError::FreezeUnsupported);
        }
        self.ops().freeze(root)
    }

    /// Validates all structural invariants reachable from `root`.
    pub fn check(&self, root: &NodeReference) -> ForestResult<()> {
        self.check_all(std::slice::from_ref(root))
    }

    /// Validates all structural invariants reachable from `roots`,
    /// including that no unfrozen node is shared between them.
    pub fn check_all(&self, roots: &[NodeReference]) -> ForestResult<()> {
        let mut checker = Checker::new(
            &self.manager,
            self.config.hashing,
            self.config.track_path_lengths,
            self.config.hashed_paths,
        );
        checker.check_roots(roots)
    }

    /// Computes the per-account difference between two roots.
    pub fn diff(&self, source: &NodeReference, target: &NodeReference) -> ForestResult<StateDiff> {
        crate::diff::state_diff(&self.manager, source, target)
    }

    /// Walks the subtree under `root` depth-first. Returns `false` when the
    /// visitor aborted the traversal.
    pub fn visit(&self, root: &NodeReference, visitor: &mut dyn NodeVisitor) -> ForestResult<bool> {
        visit::visit_subtree(&self.manager, root, visitor)
    }

    /// Renders the subtree under `root` as an indented textual tree.
    pub fn dump(&self, root: &NodeReference) -> ForestResult<String> {
        visit::dump_subtree(&self.manager, root)
    }

    /// Persists all dirty nodes and flushes the stocks. Surfaces errors
    /// latched by the background threads.
    pub fn flush(&self) -> ForestResult<()> {
        self.manager.flush()
    }

    /// Flushes, stops the background threads, and closes the stocks.
    pub fn close(&self) -> ForestResult<()> {
        debug!(target: "mpt::forest", "closing forest");
        self.manager.close()
    }

    /// An estimate of the heap memory held by the forest.
    pub fn memory_footprint(&self) -> usize {
        let path_entry = std::mem::size_of::<Address>() + 64;
        self.manager.memory_footprint()
            + (self.account_paths.lock().len() + self.value_paths.lock().len()) * path_entry
    }

    /// The number of nodes currently cached, excluding the empty sentinel.
    pub fn cached_node_count(&self) -> usize {
        self.manager.cached_node_count()
    }

    /// The number of live nodes across all stocks.
    pub fn node_count(&self) -> usize {
        self.manager.source().node_count()
    }

    fn ops(&self) -> TrieOps<'_> {
        TrieOps::new(&self.manager, self.config.track_path_lengths)
    }

    fn hasher(&self) -> Hasher<'_> {
        Hasher::new(&self.manager, self.config.hashing)
    }

    /// The navigation path of an address; the keccak image is memoized.
    fn account_path(&self, address: &Address) -> FullPath {
        if !self.config.hashed_paths {
            return unpack_nibbles(address.as_slice());
        }
        if let Some(path) = self.account_paths.lock().get(address) {
            return path.clone();
        }
        let path = unpack_nibbles(keccak256(address.as_slice()).as_slice());
        self.account_paths.lock().put(*address, path.clone());
        path
    }

    /// The navigation path of a storage key; the keccak image is memoized.
    fn value_path(&self, key: &B256) -> FullPath {
        if !self.config.hashed_paths {
            return unpack_nibbles(key.as_slice());
        }
        if let Some(path) = self.value_paths.lock().get(key) {
            return path.clone();
        }
        let path = unpack_nibbles(keccak256(key.as_slice()).as_slice());
        self.value_paths.lock().put(*key, path.clone());
        path
    }
}

impl std::fmt::Debug for Forest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forest")
            .field("config", &self.config)
            .field("manager", &self.manager)
            .finish()
    }
}

fn unpack_nibbles(bytes: &[u8]) -> FullPath {
    bytes.iter().flat_map(|byte| [byte >> 4, byte & 0x0F]).collect()
}

fn open_stock<T, C>(
    directory: &Path,
    name: &str,
    config: ForestConfig,
    codec: C,
) -> ForestResult<Box<dyn Stock<T>>>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    C: RecordCodec<T> + Clone + 'static,
{
    let path = directory.join(name);
    Ok(match config.storage {
        StorageVariant::InMemory => Box::new(MemoryStock::open(path, codec)?),
        StorageVariant::File => Box::new(FileStock::open(path, codec)?),
        StorageVariant::FileWithShadow => {
            let primary = FileStock::open(&path, codec.clone())?;
            let shadow = MemoryStock::open(path.join("shadow"), codec)?;
            Box::new(ShadowStock::new(Box::new(primary), Box::new(shadow)))
        }
    })
}
