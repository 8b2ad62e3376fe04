//! Tree error types.

use thiserror::Error;
use timber_applog::AppLogError;
use timber_buffer::BufferError;

/// Result type for tree operations.
pub type TreeResult<T> = Result<T, TreeError>;

/// Errors surfaced by the tree and its snapshots.
#[derive(Debug, Error)]
pub enum TreeError {
    // Validation
    /// A caller-supplied argument is invalid.
    #[error("illegal arguments: {0}")]
    IllegalArguments(String),

    /// The timestamp is zero or older than the current root timestamp.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// The requested timestamp lies beyond the root timestamp.
    #[error("stale root timestamp: root is at {root_ts}, requested {requested}")]
    StaleRootTimestamp {
        /// Current root timestamp.
        root_ts: u64,
        /// Timestamp the caller asked for.
        requested: u64,
    },

    /// The entry is too large to be stored inline.
    #[error("max entry size exceeded: {size} bytes (max {max})")]
    MaxEntrySizeExceeded {
        /// Size of the offending entry.
        size: usize,
        /// Largest accepted size.
        max: usize,
    },

    // State
    /// The tree's write lock is held by another writer.
    #[error("tree is locked")]
    TreeLocked,

    /// The tree was used after `close`.
    #[error("tree is already closed")]
    AlreadyClosed,

    /// The tree cannot close while snapshots are open.
    #[error("tree has active snapshots")]
    ActiveSnapshots,

    /// The limit of concurrently open read snapshots was reached.
    #[error("maximum number of active snapshots reached")]
    MaxActiveSnapshots,

    /// The write buffer cannot guarantee enough pages for the insert.
    #[error("write buffer is full")]
    WriteBufferFull,

    /// No persisted root exists yet.
    #[error("no snapshot available")]
    NoSnapshotAvailable,

    /// The tree is open in read-only mode.
    #[error("tree is read-only")]
    ReadOnly,

    // Lookup
    /// The key does not exist (at the requested timestamp range).
    #[error("key not found")]
    KeyNotFound,

    /// The key exists but not at the requested revision.
    #[error("key revision not found")]
    KeyRevisionNotFound,

    // Integrity
    /// The tree log contains inconsistent data.
    #[error("corrupted tree log: {0}")]
    CorruptedTreeLog(String),

    /// A commit or history entry failed validation.
    #[error("corrupted entry: {0}")]
    CorruptedEntry(String),

    /// The index state is internally inconsistent.
    #[error("corrupted index: {0}")]
    CorruptedIndex(String),

    /// A page image failed validation.
    #[error("corrupted page: {0}")]
    CorruptedPage(String),

    /// A page id addresses nothing.
    #[error("invalid page id")]
    InvalidPageId,

    /// Recovery found no valid commit entry.
    #[error("no valid page found")]
    NoValidPageFound,

    // Resource
    /// Every page-cache frame is pinned.
    #[error("page cache exhausted")]
    CacheExhausted,

    /// The watcher's waiter limit was reached.
    #[error("waiter limit exceeded")]
    IndexLimitExceeded,

    /// The operation was cancelled through its token.
    #[error("cancelled")]
    Cancelled,

    /// Append-log failure.
    #[error(transparent)]
    AppLog(#[from] AppLogError),

    /// Several errors occurred while shutting down.
    #[error("multiple errors: {0:?}")]
    Multiple(Vec<TreeError>),
}

impl TreeError {
    /// Creates an `IllegalArguments` error.
    pub fn illegal(reason: impl Into<String>) -> Self {
        Self::IllegalArguments(reason.into())
    }
}

impl From<BufferError> for TreeError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::CacheExhausted => Self::CacheExhausted,
            BufferError::Load { source } => match source.downcast::<TreeError>() {
                Ok(err) => *err,
                Err(source) => match source.downcast::<AppLogError>() {
                    Ok(err) => Self::AppLog(*err),
                    Err(source) => Self::CorruptedIndex(source.to_string()),
                },
            },
        }
    }
}

/// Collects errors from multi-step teardown paths and reduces them to a
/// single result.
#[derive(Debug, Default)]
pub(crate) struct MultiError {
    errors: Vec<TreeError>,
}

impl MultiError {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records the error of a step, if any.
    pub(crate) fn push<T>(&mut self, res: Result<T, impl Into<TreeError>>) {
        if let Err(err) = res {
            self.errors.push(err.into());
        }
    }

    /// Returns `Ok` when no step failed, the sole error when one did,
    /// and `TreeError::Multiple` otherwise.
    pub(crate) fn reduce(mut self) -> TreeResult<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(TreeError::Multiple(self.errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_error_empty() {
        assert!(MultiError::new().reduce().is_ok());
    }

    #[test]
    fn test_multi_error_single() {
        let mut merr = MultiError::new();
        let step: Result<(), TreeError> = Err(TreeError::AlreadyClosed);
        merr.push(step);
        assert!(matches!(merr.reduce(), Err(TreeError::AlreadyClosed)));
    }

    #[test]
    fn test_multi_error_many() {
        let mut merr = MultiError::new();
        let first: Result<(), TreeError> = Err(TreeError::AlreadyClosed);
        let second: Result<(), TreeError> = Err(TreeError::TreeLocked);
        merr.push(first);
        merr.push(second);
        match merr.reduce() {
            Err(TreeError::Multiple(errs)) => assert_eq!(errs.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_buffer_error_downcast() {
        let err: TreeError = BufferError::Load {
            source: Box::new(TreeError::KeyNotFound),
        }
        .into();
        assert!(matches!(err, TreeError::KeyNotFound));

        let err: TreeError = BufferError::CacheExhausted.into();
        assert!(matches!(err, TreeError::CacheExhausted));
    }
}
