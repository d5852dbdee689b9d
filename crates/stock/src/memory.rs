//! An in-memory [Stock] implementation backed by a `Vec` of slots.

use crate::{Stock, StockError, StockResult};
use std::{
    collections::BTreeSet,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// A volatile [Stock] keeping all records on the heap.
///
/// Used for ephemeral forests and as the shadow side of a
/// [ShadowStock](crate::ShadowStock). Records are cloned out on read.
#[derive(Debug)]
pub struct InMemoryStock<T> {
    inner: Mutex<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    slots: Vec<Option<T>>,
    free: BTreeSet<u64>,
    closed: bool,
}

impl<T> InMemoryStock<T> {
    /// Creates an empty stock.
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { slots: Vec::new(), free: BTreeSet::new(), closed: false }) }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for InMemoryStock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> Stock<T> for InMemoryStock<T> {
    fn reserve(&self) -> StockResult<u64> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StockError::Closed);
        }
        if let Some(index) = inner.free.pop_first() {
            inner.slots[index as usize] = None;
            return Ok(index);
        }
        let index = inner.slots.len() as u64;
        inner.slots.push(None);
        Ok(index)
    }

    fn get(&self, index: u64) -> StockResult<T> {
        let inner = self.lock();
        if inner.closed {
            return Err(StockError::Closed);
        }
        if index as usize >= inner.slots.len() {
            return Err(StockError::BadIndex(index));
        }
        if inner.free.contains(&index) {
            return Err(StockError::FreedSlot(index));
        }
        inner.slots[index as usize].clone().ok_or(StockError::BadIndex(index))
    }

    fn set(&self, index: u64, value: &T) -> StockResult<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StockError::Closed);
        }
        if index as usize >= inner.slots.len() || inner.free.contains(&index) {
            return Err(StockError::BadIndex(index));
        }
        inner.slots[index as usize] = Some(value.clone());
        Ok(())
    }

    fn delete(&self, index: u64) -> StockResult<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StockError::Closed);
        }
        assert!(
            (index as usize) < inner.slots.len() && !inner.free.contains(&index),
            "double delete of stock slot {index}"
        );
        inner.slots[index as usize] = None;
        inner.free.insert(index);
        Ok(())
    }

    fn flush(&self) -> StockResult<()> {
        Ok(())
    }

    fn close(&self) -> StockResult<()> {
        self.lock().closed = true;
        Ok(())
    }

    fn len(&self) -> usize {
        let inner = self.lock();
        inner.slots.len() - inner.free.len()
    }

    fn memory_footprint(&self) -> usize {
        let inner = self.lock();
        inner.slots.capacity() * std::mem::size_of::<Option<T>>()
            + inner.free.len() * std::mem::size_of::<u64>()
    }
}
