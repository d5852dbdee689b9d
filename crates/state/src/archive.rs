//! The archive façade: an append-only block history over an immutable
//! forest.

use crate::{BlockUpdate, StateError, StateResult};
use alloy_primitives::{Address, B256};
use grove_mpt::{
    AccountInfo, Forest, ForestConfig, ForestMode, HashTable, NodeId, NodeReference, StateDiff,
};
use parking_lot::{Mutex, RwLock};
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

const ROOTS_FILE: &str = "roots.dat";

/// One record per block: a 4-byte big-endian root node id plus the root
/// hash.
const ROOT_RECORD_SIZE: usize = 4 + 32;

/// The result of sealing one block into the archive.
#[derive(Debug, Clone)]
pub struct SealedBlock {
    /// The block number, counting from zero.
    pub block: u64,
    /// The root hash committing to the block's whole state.
    pub hash: B256,
    /// The `(node, hash)` pairs computed while sealing; feeding them into a
    /// later replay via [Archive::add_block_with_hints] skips the
    /// recomputation.
    pub hashes: HashTable,
}

/// A block-indexed, append-only history of frozen world states.
///
/// Every applied [BlockUpdate] yields a new frozen root; unchanged
/// subtrees are shared with earlier blocks, so any historical block stays
/// queryable at the cost of only the per-block delta. Failures latch in a
/// sticky error cell: after an I/O or corruption error, every subsequent
/// operation fails fast until the archive is reopened and verified.
pub struct Archive {
    forest: Forest,
    directory: PathBuf,
    roots: RwLock<Vec<(NodeReference, B256)>>,
    file: Mutex<File>,
    sticky: Mutex<Option<String>>,
}

impl Archive {
    /// Opens the archive in `directory`, loading the recorded block roots.
    /// The configured mode is forced to [ForestMode::Immutable].
    ///
    /// A truncated trailing record in the roots file is an error: the
    /// archive refuses to guess where its history ends.
    pub fn open(directory: impl AsRef<Path>, config: ForestConfig) -> StateResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        let config = config.with_mode(ForestMode::Immutable);
        let forest = Forest::open(&directory, config)?;

        let path = directory.join(ROOTS_FILE);
        let mut roots = Vec::new();
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            if bytes.len() % ROOT_RECORD_SIZE != 0 {
                return Err(StateError::corrupt("truncated record in roots.dat"));
            }
            for record in bytes.chunks_exact(ROOT_RECORD_SIZE) {
                let mut id_bytes = [0u8; 4];
                id_bytes.copy_from_slice(&record[..4]);
                let id = NodeId::from_bytes(id_bytes)?;
                let hash = B256::from_slice(&record[4..]);
                roots.push((NodeReference::new(id), hash));
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!(target: "state::archive", ?directory, blocks = roots.len(), "opened archive");

        Ok(Self {
            forest,
            directory,
            roots: RwLock::new(roots),
            file: Mutex::new(file),
            sticky: Mutex::new(None),
        })
    }

    /// The number of recorded blocks.
    pub fn block_count(&self) -> u64 {
        self.roots.read().len() as u64
    }

    /// Applies `update` on top of the latest block, freezes the resulting
    /// state and appends it to the history.
    pub fn add_block(&self, update: &BlockUpdate) -> StateResult<SealedBlock> {
        self.add_block_inner(update, None)
    }

    /// Like [Self::add_block], but seeds node hashes from a table produced
    /// by an earlier run before updating, so a replay skips recomputation.
    pub fn add_block_with_hints(
        &self,
        update: &BlockUpdate,
        hints: &HashTable,
    ) -> StateResult<SealedBlock> {
        self.add_block_inner(update, Some(hints))
    }

    fn add_block_inner(
        &self,
        update: &BlockUpdate,
        hints: Option<&HashTable>,
    ) -> StateResult<SealedBlock> {
        self.fail_fast()?;
        let result = (|| {
            let mut roots = self.roots.write();
            let parent =
                roots.last().map_or_else(|| self.forest.empty_root(), |(root, _)| root.clone());

            let root = update.apply(&self.forest, &parent)?;
            if let Some(hints) = hints {
                self.forest.set_hashes(hints)?;
            }
            let (hash, hashes) = self.forest.update_hashes_for(&root)?;
            self.forest.freeze(&root)?;

            let mut record = [0u8; ROOT_RECORD_SIZE];
            record[..4].copy_from_slice(&root.id().to_bytes()?);
            record[4..].copy_from_slice(hash.as_slice());
            self.file.lock().write_all(&record)?;

            let block = roots.len() as u64;
            roots.push((root, hash));
            debug!(target: "state::archive", block, %hash, "sealed block");
            Ok(SealedBlock { block, hash, hashes })
        })();
        self.latch(result)
    }

    /// The root hash recorded for `block`.
    pub fn get_hash(&self, block: u64) -> StateResult<B256> {
        self.fail_fast()?;
        Ok(self.root_of(block)?.1)
    }

    /// Reads the account record for `address` as of `block`.
    pub fn get_account_info(
        &self,
        block: u64,
        address: &Address,
    ) -> StateResult<(AccountInfo, bool)> {
        self.fail_fast()?;
        let (root, _) = self.root_of(block)?;
        self.latch(self.forest.get_account_info(&root, address).map_err(StateError::from))
    }

    /// Reads one storage slot as of `block`; absent slots read as zero.
    pub fn get_storage_value(
        &self,
        block: u64,
        address: &Address,
        key: &B256,
    ) -> StateResult<B256> {
        self.fail_fast()?;
        let (root, _) = self.root_of(block)?;
        self.latch(self.forest.get_value(&root, address, key).map_err(StateError::from))
    }

    /// The per-account difference between two recorded blocks.
    pub fn get_diff(&self, from: u64, to: u64) -> StateResult<StateDiff> {
        self.fail_fast()?;
        let (from_root, _) = self.root_of(from)?;
        let (to_root, _) = self.root_of(to)?;
        self.latch(self.forest.diff(&from_root, &to_root).map_err(StateError::from))
    }

    /// Validates every recorded block: structural invariants over all
    /// roots, exclusive ownership of unfrozen nodes, and the recorded root
    /// hashes against the trie contents.
    pub fn verify(&self) -> StateResult<()> {
        self.fail_fast()?;
        let roots = self.roots.read();
        let references: Vec<NodeReference> =
            roots.iter().map(|(root, _)| root.clone()).collect();
        self.forest.check_all(&references)?;
        for (block, (root, recorded)) in roots.iter().enumerate() {
            let (actual, _) = self.forest.update_hashes_for(root)?;
            if actual != *recorded {
                return Err(StateError::corrupt(format!(
                    "block {block}: recorded hash {recorded} does not match trie hash {actual}"
                )));
            }
        }
        Ok(())
    }

    /// Persists all dirty nodes and the roots file.
    pub fn flush(&self) -> StateResult<()> {
        self.fail_fast()?;
        let result = (|| {
            self.file.lock().sync_data()?;
            self.forest.flush()?;
            Ok(())
        })();
        self.latch(result)
    }

    /// Flushes and closes the underlying forest.
    pub fn close(&self) -> StateResult<()> {
        self.file.lock().sync_data()?;
        self.forest.close()?;
        debug!(target: "state::archive", directory = ?self.directory, "closed archive");
        Ok(())
    }

    /// An estimate of the heap memory held by the archive.
    pub fn memory_footprint(&self) -> usize {
        self.forest.memory_footprint()
            + self.roots.read().len() * (std::mem::size_of::<NodeReference>() + 32)
    }

    fn root_of(&self, block: u64) -> StateResult<(NodeReference, B256)> {
        self.roots
            .read()
            .get(block as usize)
            .map(|(root, hash)| (root.clone(), *hash))
            .ok_or(StateError::InvalidRoot(block))
    }

    fn fail_fast(&self) -> StateResult<()> {
        match &*self.sticky.lock() {
            Some(message) => Err(StateError::Latched(message.clone())),
            None => Ok(()),
        }
    }

    /// Latches I/O and corruption failures so later calls fail fast.
    fn latch<T>(&self, result: StateResult<T>) -> StateResult<T> {
        if let Err(err) = &result {
            match err {
                StateError::Forest(_) | StateError::Io(_) | StateError::Corrupt(_) => {
                    warn!(target: "state::archive", %err, "latching archive error");
                    let mut sticky = self.sticky.lock();
                    if sticky.is_none() {
                        *sticky = Some(err.to_string());
                    }
                }
                _ => {}
            }
        }
        result
    }
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("directory", &self.directory)
            .field("blocks", &self.block_count())
            .finish()
    }
}
