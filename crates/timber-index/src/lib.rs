//! # timber-index
//!
//! An embedded, append-only, persistent B+tree index with snapshot
//! isolation and a separately stored value-history log.
//!
//! The tree maps variable-length byte keys to `(value, ts, history)`
//! tuples and supports point lookups, prefix lookups, historical reads
//! by revision or timestamp range, forward scans, and crash-consistent
//! recovery. Writes are copy-on-write: every insert produces new page
//! versions chained back to a new in-memory root, and a flush persists
//! them in post-order followed by a checksummed commit entry.
//!
//! ## Storage layout
//!
//! A tree lives in a directory holding two append logs: `tree/`
//! (fixed-size pages, a commit entry after each batch) and `history/`
//! (variable-length prior-version records). Both logs shard into
//! numbered files. Recovery scans the tree log backward for the latest
//! valid commit entry and truncates both logs to that consistent
//! boundary.
//!
//! ## Sharing
//!
//! Trees share two process-wide resources: a [`PageCache`] holding
//! persisted pages (clock eviction, pinned while in use) and a
//! [`SharedWriteBuffer`] apportioning in-memory mutable pages across
//! writers via per-tree quotas.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod commit;
mod error;
mod history;
mod options;
mod page;
mod snapshot;
mod tree;
mod watcher;
mod writebuf;

pub use error::{TreeError, TreeResult};
pub use options::{AppFactoryFn, AppRemoveFn, DirEntryInfo, Options, ReadDirFn};
pub use page::{Entry, EntryRef};
pub use snapshot::{Snapshot, SnapshotIter, SnapshotMode, TimedValue};
pub use tree::{Tree, HISTORY_LOG_NAME, TREE_LOG_NAME};
pub use watcher::TsHub;
pub use writebuf::{SharedWriteBuffer, WriteBuffer};

pub use timber_buffer::PageCache;
pub use timber_common::constants::OFFSET_NONE;
pub use timber_common::{CancelToken, PageId, TreeId};
