//! Errors for the `grove-state` crate.

use grove_mpt::ForestError;

/// A [Result] type alias where the error is [StateError].
pub type StateResult<T> = Result<T, StateError>;

/// An error type for state façade operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The underlying forest failed.
    #[error("forest failure: {0}")]
    Forest(#[from] ForestError),
    /// Reading or writing a façade file failed.
    #[error("state i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The metadata record could not be parsed.
    #[error("malformed metadata: {0}")]
    Json(#[from] serde_json::Error),
    /// A block beyond the recorded history was requested.
    #[error("block {0} is beyond the recorded history")]
    InvalidRoot(u64),
    /// A persisted façade record is corrupt (truncated roots file, hash
    /// mismatch on reopen).
    #[error("corrupt state record: {0}")]
    Corrupt(String),
    /// An earlier failure was latched; the archive rejects further work.
    #[error("archive failed earlier: {0}")]
    Latched(String),
}

impl StateError {
    /// Builds a [StateError::Corrupt] from any printable reason.
    pub fn corrupt(reason: impl ToString) -> Self {
        Self::Corrupt(reason.to_string())
    }
}
