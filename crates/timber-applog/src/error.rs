//! Append-log error types.

use std::io;
use thiserror::Error;

/// Result type for append-log operations.
pub type AppResult<T> = Result<T, AppLogError>;

/// Errors that can occur during append-log operations.
#[derive(Debug, Error)]
pub enum AppLogError {
    /// I/O error from the underlying files.
    #[error("append log I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: io::Error,
    },

    /// The log was used after `close`.
    #[error("append log is closed")]
    AlreadyClosed,

    /// The log is open in read-only mode and was asked to write.
    #[error("append log is read-only")]
    ReadOnly,

    /// A read reached past the logical end of the log.
    #[error("short read: {requested} bytes at offset {offset}, log size is {size}")]
    ShortRead {
        /// Bytes requested.
        requested: usize,
        /// Read offset.
        offset: u64,
        /// Logical log size.
        size: u64,
    },

    /// `set_offset` was given an offset beyond the logical end.
    #[error("invalid offset {offset}: log size is {size}")]
    InvalidOffset {
        /// Requested offset.
        offset: u64,
        /// Logical log size.
        size: u64,
    },

    /// The on-disk segment files are inconsistent.
    #[error("corrupted append log: {reason}")]
    Corrupted {
        /// What was found to be inconsistent.
        reason: String,
    },

    /// Invalid configuration.
    #[error("append log configuration error: {reason}")]
    Config {
        /// What failed validation.
        reason: String,
    },
}

impl AppLogError {
    /// Creates a corruption error.
    pub fn corrupted(reason: impl Into<String>) -> Self {
        Self::Corrupted {
            reason: reason.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}
