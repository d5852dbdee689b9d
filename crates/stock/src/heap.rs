//! A codec-backed [Stock] keeping encoded records on the heap, with optional
//! persistence to the same file layout as [FileStock](crate::FileStock).
//!
//! Unlike [InMemoryStock](crate::InMemoryStock), every record passes through
//! the [RecordCodec] on both write and read, so values are normalized exactly
//! as the file store normalizes them. This makes it the natural shadow side
//! of a [ShadowStock](crate::ShadowStock) and the backing store of fully
//! memory-resident forests.

use crate::{RecordCodec, Stock, StockError, StockResult};
use std::{
    collections::BTreeSet,
    io::Read,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};
use tracing::debug;

/// A [Stock] of encoded records held in memory.
///
/// When opened over a directory, the record file is read fully at open and
/// rewritten on flush/close; without a directory the stock is volatile.
pub struct MemoryStock<T, C> {
    codec: C,
    inner: Mutex<Inner>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

struct Inner {
    directory: Option<PathBuf>,
    /// Encoded records, one slot after another; an unwritten slot is empty.
    records: Vec<Option<Box<[u8]>>>,
    free: BTreeSet<u64>,
    closed: bool,
}

impl<T, C: RecordCodec<T>> MemoryStock<T, C> {
    /// Creates a volatile stock that is dropped with the process.
    pub fn ephemeral(codec: C) -> Self {
        Self {
            codec,
            inner: Mutex::new(Inner {
                directory: None,
                records: Vec::new(),
                free: BTreeSet::new(),
                closed: false,
            }),
            _marker: std::marker::PhantomData,
        }
    }

    /// Opens the stock over `directory`, loading any previously flushed
    /// records into memory.
    pub fn open(directory: impl AsRef<Path>, codec: C) -> StockResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)?;

        let size = codec.encoded_size();
        let mut records = Vec::new();
        let values_path = directory.join("values.dat");
        if values_path.exists() {
            let mut file = std::fs::File::open(values_path)?;
            let mut record = vec![0u8; size];
            loop {
                match file.read_exact(&mut record) {
                    Ok(()) => records.push(Some(record.clone().into_boxed_slice())),
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let reserved = crate::file::read_meta(&directory)?.unwrap_or(records.len() as u64);
        records.resize(reserved as usize, None);
        let free = crate::file::read_free_list(&directory)?;
        debug!(target: "stock", ?directory, reserved, "opened memory stock");

        Ok(Self {
            codec,
            inner: Mutex::new(Inner { directory: Some(directory), records, free, closed: false }),
            _marker: std::marker::PhantomData,
        })
    }

    fn persist(&self, inner: &Inner) -> StockResult<()> {
        let Some(directory) = &inner.directory else {
            return Ok(());
        };
        let size = self.codec.encoded_size();
        let mut bytes = Vec::with_capacity(inner.records.len() * size);
        for record in &inner.records {
            match record {
                Some(record) => bytes.extend_from_slice(record),
                None => bytes.extend(std::iter::repeat(0).take(size)),
            }
        }
        std::fs::write(directory.join("values.dat"), bytes)?;

        let mut free_bytes = Vec::with_capacity(inner.free.len() * 8);
        for index in &inner.free {
            free_bytes.extend_from_slice(&index.to_be_bytes());
        }
        std::fs::write(directory.join("freelist.dat"), free_bytes)?;
        std::fs::write(directory.join("meta.dat"), (inner.records.len() as u64).to_be_bytes())?;
        Ok(())
    }
}

impl<T: Send + Sync, C: RecordCodec<T>> Stock<T> for MemoryStock<T, C> {
    fn reserve(&self) -> StockResult<u64> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StockError::Closed);
        }
        if let Some(index) = inner.free.pop_first() {
            inner.records[index as usize] = None;
            return Ok(index);
        }
        let index = inner.records.len() as u64;
        inner.records.push(None);
        Ok(index)
    }

    fn get(&self, index: u64) -> StockResult<T> {
        let inner = self.lock();
        if inner.closed {
            return Err(StockError::Closed);
        }
        if index as usize >= inner.records.len() {
            return Err(StockError::BadIndex(index));
        }
        if inner.free.contains(&index) {
            return Err(StockError::FreedSlot(index));
        }
        let record = inner.records[index as usize].as_ref().ok_or(StockError::BadIndex(index))?;
        self.codec.decode(record).map_err(|reason| StockError::Codec { index, reason })
    }

    fn set(&self, index: u64, value: &T) -> StockResult<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StockError::Closed);
        }
        if index as usize >= inner.records.len() || inner.free.contains(&index) {
            return Err(StockError::BadIndex(index));
        }
        let mut record = vec![0u8; self.codec.encoded_size()];
        self.codec.encode(value, &mut record).map_err(|reason| StockError::Codec { index, reason })?;
        inner.records[index as usize] = Some(record.into_boxed_slice());
        Ok(())
    }

    fn delete(&self, index: u64) -> StockResult<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StockError::Closed);
        }
        assert!(
            (index as usize) < inner.records.len() && !inner.free.contains(&index),
            "double delete of stock slot {index}"
        );
        inner.records[index as usize] = None;
        inner.free.insert(index);
        Ok(())
    }

    fn flush(&self) -> StockResult<()> {
        let inner = self.lock();
        if inner.closed {
            return Err(StockError::Closed);
        }
        self.persist(&inner)
    }

    fn close(&self) -> StockResult<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Ok(());
        }
        self.persist(&inner)?;
        inner.closed = true;
        Ok(())
    }

    fn len(&self) -> usize {
        let inner = self.lock();
        inner.records.len() - inner.free.len()
    }

    fn memory_footprint(&self) -> usize {
        let inner = self.lock();
        inner.records.len() * (self.codec.encoded_size() + std::mem::size_of::<usize>())
            + inner.free.len() * std::mem::size_of::<u64>()
    }
}

impl<T, C> MemoryStock<T, C> {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T, C> std::fmt::Debug for MemoryStock<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MemoryStock")
            .field("directory", &inner.directory)
            .field("slots", &inner.records.len())
            .finish()
    }
}
