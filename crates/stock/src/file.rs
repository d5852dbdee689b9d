//! A file-backed [Stock] implementation with a persisted free list.
//!
//! Layout inside the stock directory:
//! - `values.dat`: the flat array of fixed-size records.
//! - `freelist.dat`: 8-byte big-endian indices of reclaimed slots.
//! - `meta.dat`: an 8-byte big-endian count of reserved slots.
//!
//! `freelist.dat` and `meta.dat` are rewritten on every flush; `values.dat`
//! is written in place, one record per slot.

use crate::{RecordCodec, Stock, StockError, StockResult};
use std::{
    collections::BTreeSet,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};
use tracing::debug;

/// A persistent [Stock] storing records in a flat file.
///
/// Slot `i` occupies bytes `[i * size, (i + 1) * size)` of `values.dat`,
/// where `size` is the codec's fixed record size. Reserved slots that were
/// never written read back as an error until the first [Stock::set].
pub struct FileStock<T, C> {
    codec: C,
    inner: Mutex<Inner>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

struct Inner {
    directory: PathBuf,
    values: File,
    /// Number of slots handed out, including freed ones.
    reserved: u64,
    /// Number of records that have actually been written to `values.dat`.
    written: u64,
    free: BTreeSet<u64>,
    closed: bool,
}

impl<T, C: RecordCodec<T>> FileStock<T, C> {
    /// Opens the stock inside `directory`, creating the files on first use.
    pub fn open(directory: impl AsRef<Path>, codec: C) -> StockResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)?;

        let values = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(directory.join("values.dat"))?;

        let record_size = codec.encoded_size() as u64;
        let written = values.metadata()?.len() / record_size;
        let reserved = read_meta(&directory)?.unwrap_or(written);
        let free = read_free_list(&directory)?;
        debug!(target: "stock", ?directory, reserved, frees = free.len(), "opened file stock");

        Ok(Self {
            codec,
            inner: Mutex::new(Inner { directory, values, reserved, written, free, closed: false }),
            _marker: std::marker::PhantomData,
        })
    }

    fn write_tables(&self, inner: &Inner) -> StockResult<()> {
        let mut free_bytes = Vec::with_capacity(inner.free.len() * 8);
        for index in &inner.free {
            free_bytes.extend_from_slice(&index.to_be_bytes());
        }
        std::fs::write(inner.directory.join("freelist.dat"), free_bytes)?;
        std::fs::write(inner.directory.join("meta.dat"), inner.reserved.to_be_bytes())?;
        Ok(())
    }
}

pub(crate) fn read_meta(directory: &Path) -> StockResult<Option<u64>> {
    let path = directory.join("meta.dat");
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    if bytes.len() != 8 {
        return Err(StockError::codec(0, "malformed meta.dat"));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes);
    Ok(Some(u64::from_be_bytes(word)))
}

pub(crate) fn read_free_list(directory: &Path) -> StockResult<BTreeSet<u64>> {
    let path = directory.join("freelist.dat");
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    let bytes = std::fs::read(path)?;
    if bytes.len() % 8 != 0 {
        return Err(StockError::codec(0, "malformed freelist.dat"));
    }
    let mut free = BTreeSet::new();
    for chunk in bytes.chunks_exact(8) {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        free.insert(u64::from_be_bytes(word));
    }
    Ok(free)
}

impl<T: Send + Sync, C: RecordCodec<T>> Stock<T> for FileStock<T, C> {
    fn reserve(&self) -> StockResult<u64> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StockError::Closed);
        }
        if let Some(index) = inner.free.pop_first() {
            return Ok(index);
        }
        let index = inner.reserved;
        inner.reserved += 1;
        Ok(index)
    }

    fn get(&self, index: u64) -> StockResult<T> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StockError::Closed);
        }
        if index >= inner.reserved || index >= inner.written {
            return Err(StockError::BadIndex(index));
        }
        if inner.free.contains(&index) {
            return Err(StockError::FreedSlot(index));
        }

        let size = self.codec.encoded_size();
        let mut bytes = vec![0u8; size];
        inner.values.seek(SeekFrom::Start(index * size as u64))?;
        inner.values.read_exact(&mut bytes)?;
        self.codec.decode(&bytes).map_err(|reason| StockError::Codec { index, reason })
    }

    fn set(&self, index: u64, value: &T) -> StockResult<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StockError::Closed);
        }
        if index >= inner.reserved || inner.free.contains(&index) {
            return Err(StockError::BadIndex(index));
        }

        let size = self.codec.encoded_size();
        let mut bytes = vec![0u8; size];
        self.codec.encode(value, &mut bytes).map_err(|reason| StockError::Codec { index, reason })?;

        // A sparse write leaves zero-filled holes below `index`; holes decode
        // as all-zero records until their slot is written.
        inner.values.seek(SeekFrom::Start(index * size as u64))?;
        inner.values.write_all(&bytes)?;
        if index >= inner.written {
            inner.written = index + 1;
        }
        Ok(())
    }

    fn delete(&self, index: u64) -> StockResult<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(StockError::Closed);
        }
        assert!(
            index < inner.reserved && !inner.free.contains(&index),
            "double delete of stock slot {index}"
        );
        inner.free.insert(index);
        Ok(())
    }

    fn flush(&self) -> StockResult<()> {
        let inner = self.lock();
        if inner.closed {
            return Err(StockError::Closed);
        }
        self.write_tables(&inner)?;
        inner.values.sync_data()?;
        Ok(())
    }

    fn close(&self) -> StockResult<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Ok(());
        }
        self.write_tables(&inner)?;
        inner.values.sync_data()?;
        inner.closed = true;
        debug!(target: "stock", directory = ?inner.directory, "closed file stock");
        Ok(())
    }

    fn len(&self) -> usize {
        let inner = self.lock();
        (inner.reserved - inner.free.len() as u64) as usize
    }

    fn memory_footprint(&self) -> usize {
        let inner = self.lock();
        inner.free.len() * std::mem::size_of::<u64>()
    }
}

impl<T, C> FileStock<T, C> {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T, C> std::fmt::Debug for FileStock<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("FileStock")
            .field("directory", &inner.directory)
            .field("reserved", &inner.reserved)
            .field("free", &inner.free.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct U64Codec;

    impl RecordCodec<u64> for U64Codec {
        fn encoded_size(&self) -> usize {
            8
        }

        fn encode(&self, value: &u64, out: &mut [u8]) -> Result<(), String> {
            out.copy_from_slice(&value.to_be_bytes());
            Ok(())
        }

        fn decode(&self, bytes: &[u8]) -> Result<u64, String> {
            let mut word = [0u8; 8];
            word.copy_from_slice(bytes);
            Ok(u64::from_be_bytes(word))
        }
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let stock = FileStock::open(dir.path(), U64Codec).unwrap();
        let a = stock.reserve().unwrap();
        let b = stock.reserve().unwrap();
        stock.set(a, &0xDEAD).unwrap();
        stock.set(b, &0xBEEF).unwrap();
        stock.close().unwrap();

        let stock = FileStock::open(dir.path(), U64Codec).unwrap();
        assert_eq!(stock.get(a).unwrap(), 0xDEAD);
        assert_eq!(stock.get(b).unwrap(), 0xBEEF);
    }

    #[test]
    fn free_list_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let stock = FileStock::open(dir.path(), U64Codec).unwrap();
        let a = stock.reserve().unwrap();
        let _b = stock.reserve().unwrap();
        stock.set(a, &1).unwrap();
        stock.delete(a).unwrap();
        stock.close().unwrap();

        let stock = FileStock::open(dir.path(), U64Codec).unwrap();
        assert!(matches!(stock.get(a), Err(StockError::FreedSlot(_))));
        assert_eq!(stock.reserve().unwrap(), a);
    }

    #[test]
    fn unwritten_slot_reads_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let stock = FileStock::open(dir.path(), U64Codec).unwrap();
        let a = stock.reserve().unwrap();
        assert!(matches!(stock.get(a), Err(StockError::BadIndex(_))));
    }

    #[test]
    fn sparse_write_extends_file() {
        let dir = tempfile::tempdir().unwrap();
        let stock = FileStock::open(dir.path(), U64Codec).unwrap();
        for _ in 0..8 {
            stock.reserve().unwrap();
        }
        stock.set(7, &42).unwrap();
        assert_eq!(stock.get(7).unwrap(), 42);
        // Slots 0..7 were reserved but never written; they read as zeros.
        assert_eq!(stock.get(3).unwrap(), 0);
    }
}
