//! Error and Result types for tickdb operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for tickdb operations.
pub type Result<T> = std::result::Result<T, TickError>;

/// The error type for tickdb operations.
#[derive(Debug, Error)]
pub enum TickError {
    /// Underlying I/O error (open, stat, truncate, mmap, or lock failure).
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Existing column file is too small for its header, or the persisted
    /// count exceeds the capacity implied by the file size.
    #[error("corrupt column header in {path}: {reason}")]
    CorruptHeader {
        /// Path of the offending column file.
        path: PathBuf,
        /// What the validation found.
        reason: String,
    },

    /// Column read past the logical element count.
    #[error("index {index} out of range for count {count}")]
    OutOfRange {
        /// The requested row index.
        index: u64,
        /// The logical element count at the time of the read.
        count: u64,
    },

    /// The background writer failed mid-batch; the series accepts no
    /// further operations.
    #[error("series is poisoned after a background writer failure")]
    SeriesPoisoned,

    /// Another process holds the advisory lock on the symbol directory.
    #[error("symbol directory {path} is locked by another process")]
    SymbolLocked {
        /// The locked symbol directory.
        path: PathBuf,
    },
}
