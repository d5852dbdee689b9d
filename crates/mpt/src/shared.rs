//! A single-owner smart cell with four handle families.
//!
//! [Shared] wraps a value behind an `Arc<RwLock<_>>` and hands out four
//! kinds of RAII handles, each mapping to a lock mode:
//!
//! - [ReadHandle]: shared; excludes only writers.
//! - [ViewHandle]: mechanically identical to a read handle, but the type
//!   marks handle classes that must never trigger hash recomputation (the
//!   background subtree releaser, dump walks).
//! - [HashHandle]: an upgradable read: excludes writers and other hashers,
//!   coexists with readers and views. Hash results are written back through
//!   a short exclusive upgrade, so reads only serialize on the write-back
//!   itself.
//! - [WriteHandle]: fully exclusive.
//!
//! Handles own the underlying cell (`arc_lock` guards), so they stay valid
//! across cache evictions of the owning entry.

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard},
    RawRwLock, RwLock,
};
use std::sync::Arc;

/// A single-owner cell offering read / view / hash / write handle families.
#[derive(Debug, Default)]
pub struct Shared<T> {
    cell: Arc<RwLock<T>>,
}

impl<T> Shared<T> {
    /// Wraps `value` in a fresh cell.
    pub fn new(value: T) -> Self {
        Self { cell: Arc::new(RwLock::new(value)) }
    }

    /// Acquires a shared read handle. Blocks while a writer is active.
    pub fn read(&self) -> ReadHandle<T> {
        ReadHandle { guard: self.cell.read_arc() }
    }

    /// Acquires a shared read handle without blocking, or returns `None`
    /// when a writer is active.
    pub fn try_read(&self) -> Option<ReadHandle<T>> {
        self.cell.try_read_arc().map(|guard| ReadHandle { guard })
    }

    /// Acquires a view handle. Blocks while a writer is active.
    pub fn view(&self) -> ViewHandle<T> {
        ViewHandle { guard: self.cell.read_arc() }
    }

    /// Acquires a hash handle. Blocks while a writer or another hasher is
    /// active; readers and views may proceed.
    pub fn hash(&self) -> HashHandle<T> {
        HashHandle { guard: Some(self.cell.upgradable_read_arc()) }
    }

    /// Acquires an exclusive write handle.
    pub fn write(&self) -> WriteHandle<T> {
        WriteHandle { guard: self.cell.write_arc() }
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self { cell: Arc::clone(&self.cell) }
    }
}

/// A shared read handle; see [Shared::read].
#[derive(Debug)]
pub struct ReadHandle<T> {
    guard: ArcRwLockReadGuard<RawRwLock, T>,
}

impl<T> std::ops::Deref for ReadHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// A view handle; see [Shared::view].
#[derive(Debug)]
pub struct ViewHandle<T> {
    guard: ArcRwLockReadGuard<RawRwLock, T>,
}

impl<T> std::ops::Deref for ViewHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// An exclusive write handle; see [Shared::write].
#[derive(Debug)]
pub struct WriteHandle<T> {
    guard: ArcRwLockWriteGuard<RawRwLock, T>,
}

impl<T> std::ops::Deref for WriteHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for WriteHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// A hash handle; see [Shared::hash].
#[derive(Debug)]
pub struct HashHandle<T> {
    guard: Option<ArcRwLockUpgradableReadGuard<RawRwLock, T>>,
}

impl<T> HashHandle<T> {
    /// Applies `update` under a short exclusive upgrade, then downgrades
    /// back. Concurrent readers drain before the upgrade and resume after.
    pub fn write_back(&mut self, update: impl FnOnce(&mut T)) {
        let guard = self.guard.take().expect("hash handle already consumed");
        let mut exclusive = ArcRwLockUpgradableReadGuard::upgrade(guard);
        update(&mut exclusive);
        self.guard = Some(ArcRwLockWriteGuard::downgrade_to_upgradable(exclusive));
    }
}

impl<T> std::ops::Deref for HashHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("hash handle already consumed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn read_and_view_coexist() {
        let cell = Shared::new(5u32);
        let read = cell.read();
        let view = cell.view();
        assert_eq!(*read, 5);
        assert_eq!(*view, 5);
    }

    #[test]
    fn hash_coexists_with_readers() {
        let cell = Shared::new(1u32);
        let read = cell.read();
        let hash = cell.hash();
        assert_eq!(*read, *hash);
    }

    #[test]
    fn write_back_is_visible_to_later_readers() {
        let cell = Shared::new(0u32);
        let mut hash = cell.hash();
        hash.write_back(|value| *value = 42);
        assert_eq!(*hash, 42);
        drop(hash);
        assert_eq!(*cell.read(), 42);
    }

    #[test]
    fn writer_waits_for_readers() {
        let cell = Shared::new(0u32);
        let read = cell.read();

        let contender = cell.clone();
        let writer = std::thread::spawn(move || {
            let mut write = contender.write();
            *write = 9;
        });

        // The writer cannot make progress while the read handle lives.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(*read, 0);
        drop(read);

        writer.join().unwrap();
        assert_eq!(*cell.read(), 9);
    }

    #[test]
    fn hashers_exclude_each_other() {
        let cell = Shared::new(0u32);
        let first = cell.hash();

        let contender = cell.clone();
        let second = std::thread::spawn(move || {
            let _hash = contender.hash();
        });

        std::thread::sleep(Duration::from_millis(20));
        assert!(!second.is_finished());
        drop(first);
        second.join().unwrap();
    }
}
