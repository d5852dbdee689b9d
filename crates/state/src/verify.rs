//! Offline verification passes over persisted state directories.
//!
//! Both entry points open the directory read-style (no mutation beyond
//! hash-cache refreshes), walk every recorded root and validate structural
//! invariants and recorded hashes. They are meant to run after a crash or
//! before trusting a copied state directory.

use crate::{Archive, LiveState, StateResult};
use grove_mpt::ForestConfig;
use std::path::Path;
use tracing::info;

/// Verifies an archive directory: every recorded block root must pass all
/// structural checks, no unfrozen node may be shared between roots, and
/// every recorded root hash must match the trie contents.
pub fn verify_archive(directory: impl AsRef<Path>, config: ForestConfig) -> StateResult<()> {
    let archive = Archive::open(directory, config)?;
    archive.verify()?;
    info!(target: "state::verify", blocks = archive.block_count(), "archive verified");
    archive.close()
}

/// Verifies a live-state directory: the persisted root hash must match the
/// recomputed one (checked during open) and the current state must pass
/// all structural checks.
pub fn verify_live(directory: impl AsRef<Path>, config: ForestConfig) -> StateResult<()> {
    let state = LiveState::open(directory, config)?;
    state.check()?;
    info!(target: "state::verify", "live state verified");
    state.close()
}
