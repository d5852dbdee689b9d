#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod errors;
pub use errors::{StockError, StockResult};

mod codec;
pub use codec::RecordCodec;

mod memory;
pub use memory::InMemoryStock;

mod heap;
pub use heap::MemoryStock;

mod file;
pub use file::FileStock;

mod shadow;
pub use shadow::ShadowStock;

/// A [Stock] is a typed, id-addressed store of fixed-size records.
///
/// Slots are allocated with [Stock::reserve], which returns a 64-bit index
/// that remains valid until [Stock::delete] reclaims it. Deleted indices may
/// be handed out again by later reservations. Implementations must tolerate
/// at-least-once [Stock::set] for a live index.
///
/// All operations take `&self`; implementations synchronize internally so a
/// stock can be shared across threads behind an `Arc`.
pub trait Stock<T>: Send + Sync {
    /// Allocates a fresh slot and returns its index.
    fn reserve(&self) -> StockResult<u64>;

    /// Reads the record stored at `index` into an owned value.
    fn get(&self, index: u64) -> StockResult<T>;

    /// Overwrites the record stored at `index`.
    fn set(&self, index: u64, value: &T) -> StockResult<()>;

    /// Deletes the record stored at `index`, returning the slot to the free
    /// list.
    ///
    /// # Panics
    /// Deleting an index that is not currently live is a programming error
    /// and panics.
    fn delete(&self, index: u64) -> StockResult<()>;

    /// Persists all pending writes.
    fn flush(&self) -> StockResult<()>;

    /// Flushes and closes the stock. Operations after `close` fail.
    fn close(&self) -> StockResult<()>;

    /// The number of live (reserved, not deleted) slots.
    fn len(&self) -> usize;

    /// Whether the stock holds no live slots.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An estimate of the heap memory held by this stock, in bytes.
    fn memory_footprint(&self) -> usize;
}
