//! Error types for the Silt sorting engine.

use thiserror::Error;

/// Result type alias using SortError.
pub type Result<T> = std::result::Result<T, SortError>;

/// Errors that can occur in Silt operations.
#[derive(Debug, Error)]
pub enum SortError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Memory errors
    #[error("memory unavailable: requested {requested} bytes ({used} of {budget} in use)")]
    MemoryUnavailable {
        requested: u64,
        used: u64,
        budget: u64,
    },

    #[error("record too large: {size} bytes (page size {max})")]
    RecordTooLarge { size: usize, max: usize },

    // Spill file errors
    #[error("spill run corrupted: {path}, reason: {reason}")]
    SpillCorrupted { path: String, reason: String },

    // Contract errors
    #[error("sorter iterator already consumed")]
    IteratorConsumed,

    #[error("sorter already closed")]
    SorterClosed,

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),
}
