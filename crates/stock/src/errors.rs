//! Errors for the `grove-stock` crate.

/// A [Result] type alias where the error is [StockError].
pub type StockResult<T> = Result<T, StockError>;

/// An error type for [Stock] operations.
///
/// [Stock]: crate::Stock
#[derive(Debug, thiserror::Error)]
pub enum StockError {
    /// An I/O operation on the backing file failed.
    #[error("stock i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A stored record could not be decoded.
    #[error("failed to decode record at index {index}: {reason}")]
    Codec {
        /// The slot index of the bad record.
        index: u64,
        /// Why the record failed to decode.
        reason: String,
    },
    /// An index outside the reserved range was accessed.
    #[error("index {0} is beyond the reserved range")]
    BadIndex(u64),
    /// A freed slot was read before being reserved again.
    #[error("index {0} refers to a freed slot")]
    FreedSlot(u64),
    /// The primary and shadow stores disagree.
    #[error("shadow store mismatch at index {0}")]
    ShadowMismatch(u64),
    /// The stock has been closed.
    #[error("stock is closed")]
    Closed,
}

impl StockError {
    /// Builds a [StockError::Codec] from an index and any printable reason.
    pub fn codec(index: u64, reason: impl ToString) -> Self {
        Self::Codec { index, reason: reason.to_string() }
    }
}
