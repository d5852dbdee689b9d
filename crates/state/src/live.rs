//! The live-state façade: one evolving world state over a mutable forest.

use crate::{StateError, StateResult};
use alloy_primitives::{Address, B256};
use grove_mpt::{AccountInfo, Forest, ForestConfig, ForestMode, NodeId, NodeReference};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const META_FILE: &str = "meta.json";

/// The persisted pointer to the current state: the root node plus the root
/// hash it carried when it was last flushed.
#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    /// The root node id in its 4-byte on-disk form.
    root: u32,
    /// The root hash as a 0x-prefixed hex string.
    hash: String,
}

/// A single mutable world state persisted in a directory.
///
/// Every write overwrites the previous state in place; there is no
/// history. The current root is persisted in `meta.json` on flush and
/// close, and reopening verifies that the recorded hash still matches the
/// recomputed one.
pub struct LiveState {
    forest: Forest,
    directory: PathBuf,
    root: Mutex<NodeReference>,
}

impl LiveState {
    /// Opens the live state in `directory`, restoring the persisted root.
    /// The configured mode is forced to [ForestMode::Mutable].
    pub fn open(directory: impl AsRef<Path>, config: ForestConfig) -> StateResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        let config = config.with_mode(ForestMode::Mutable);
        let forest = Forest::open(&directory, config)?;

        let root = match read_metadata(&directory)? {
            None => forest.empty_root(),
            Some(metadata) => {
                let id = NodeId::from_bytes(metadata.root.to_be_bytes())?;
                let root = NodeReference::new(id);
                let recorded: B256 = metadata
                    .hash
                    .parse()
                    .map_err(|_| StateError::corrupt("unparsable root hash in meta.json"))?;
                let (actual, _) = forest.update_hashes_for(&root)?;
                if actual != recorded {
                    return Err(StateError::corrupt(format!(
                        "root hash mismatch: recorded {recorded}, recomputed {actual}"
                    )));
                }
                root
            }
        };
        debug!(target: "state::live", ?directory, %root, "opened live state");
        Ok(Self { forest, directory, root: Mutex::new(root) })
    }

    /// The current root reference.
    pub fn root(&self) -> NodeReference {
        self.root.lock().clone()
    }

    /// Reads the account record for `address`.
    pub fn get_account_info(&self, address: &Address) -> StateResult<(AccountInfo, bool)> {
        Ok(self.forest.get_account_info(&self.root(), address)?)
    }

    /// Creates, updates or (with the empty record) deletes the account.
    pub fn set_account_info(&self, address: &Address, info: AccountInfo) -> StateResult<()> {
        let mut root = self.root.lock();
        *root = self.forest.set_account_info(&root, address, info)?;
        Ok(())
    }

    /// Deletes the account for `address` and its storage.
    pub fn delete_account(&self, address: &Address) -> StateResult<()> {
        self.set_account_info(address, AccountInfo::default())
    }

    /// Reads one storage slot; absent slots read as zero.
    pub fn get_storage_value(&self, address: &Address, key: &B256) -> StateResult<B256> {
        Ok(self.forest.get_value(&self.root(), address, key)?)
    }

    /// Writes one storage slot; a zero value removes the slot.
    pub fn set_storage_value(&self, address: &Address, key: &B256, value: B256) -> StateResult<()> {
        let mut root = self.root.lock();
        *root = self.forest.set_value(&root, address, key, value)?;
        Ok(())
    }

    /// Clears the whole storage trie of `address`.
    pub fn clear_storage(&self, address: &Address) -> StateResult<()> {
        let mut root = self.root.lock();
        *root = self.forest.clear_storage(&root, address)?;
        Ok(())
    }

    /// Brings all hashes up to date and returns the state hash.
    pub fn update_hashes(&self) -> StateResult<B256> {
        let (hash, _) = self.forest.update_hashes_for(&self.root())?;
        Ok(hash)
    }

    /// Validates all structural invariants of the current state.
    pub fn check(&self) -> StateResult<()> {
        Ok(self.forest.check(&self.root())?)
    }

    /// Persists all dirty nodes and the metadata record.
    pub fn flush(&self) -> StateResult<()> {
        let hash = self.update_hashes()?;
        self.forest.flush()?;
        self.write_metadata(hash)?;
        Ok(())
    }

    /// Flushes and closes the underlying forest.
    pub fn close(&self) -> StateResult<()> {
        let hash = self.update_hashes()?;
        self.forest.close()?;
        self.write_metadata(hash)?;
        debug!(target: "state::live", directory = ?self.directory, "closed live state");
        Ok(())
    }

    /// An estimate of the heap memory held by the state.
    pub fn memory_footprint(&self) -> usize {
        self.forest.memory_footprint()
    }

    fn write_metadata(&self, hash: B256) -> StateResult<()> {
        let root = self.root.lock();
        let id_bytes = root.id().to_bytes()?;
        let metadata = Metadata { root: u32::from_be_bytes(id_bytes), hash: hash.to_string() };
        std::fs::write(self.directory.join(META_FILE), serde_json::to_vec_pretty(&metadata)?)?;
        Ok(())
    }
}

impl std::fmt::Debug for LiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveState")
            .field("directory", &self.directory)
            .field("root", &self.root.lock().id())
            .finish()
    }
}

fn read_metadata(directory: &Path) -> StateResult<Option<Metadata>> {
    let path = directory.join(META_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}
