//! The timed B+tree.
//!
//! A tree maps byte keys to `(value, ts, history)` tuples. Writes are
//! copy-on-write: an insert duplicates every page on the root-to-leaf
//! path into the write buffer and publishes a new in-memory root; a
//! flush persists the mutated pages in post-order, rewrites child ids
//! to their assigned log offsets, and seals the batch with a commit
//! entry. Snapshots anchor reads at a published root and are isolated
//! from later inserts.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use timber_applog::{AppendLog, AppendOptions};
use timber_buffer::PageCache;
use timber_common::{CancelToken, PageId, TreeId};

use crate::commit::{self, CommitEntry, COMMIT_ENTRY_SIZE};
use crate::error::{MultiError, TreeError, TreeResult};
use crate::history::HistoryReader;
use crate::options::Options;
use crate::page::{
    self, Entry, EntryRef, PageError, PageMut, PageRef, PrevVersion, LEAF_ENTRY_OVERHEAD,
    LEAF_HEADER_SIZE, SLOT_SIZE,
};
use crate::snapshot::{Snapshot, TimedValue};
use crate::writebuf::WriteBuffer;

/// Name of the base tree log directory.
pub const TREE_LOG_NAME: &str = "tree";
/// Name of the history log directory.
pub const HISTORY_LOG_NAME: &str = "history";

const TREE_FILE_EXT: &str = "t";
const HISTORY_FILE_EXT: &str = "hx";

/// Position, length and checksum of the last archived history entry.
///
/// Retained across batches so every commit entry carries a valid
/// truncation point for the history log, even when a batch archives
/// nothing.
#[derive(Debug, Clone, Copy)]
struct HistoryAnchor {
    off: u64,
    len: usize,
    checksum: u32,
}

/// Writer-side state, guarded by the tree's lock.
pub(crate) struct TreeWrite {
    pub(crate) wb: WriteBuffer,
    head_history: PageId,
    tail_history: PageId,
    /// Projected history-log offset of the next archived byte: log size
    /// at open plus everything buffered since. Offsets handed to leaf
    /// entries are therefore final.
    history_write_off: u64,
    last_history_entry: Option<HistoryAnchor>,
    depth: usize,
    n_splits: u64,
    mutated: bool,
}

struct InsertOutcome {
    split: bool,
    new_page_id: PageId,
    split_page_id: PageId,
    sep_key: Vec<u8>,
}

impl InsertOutcome {
    fn no_split(new_page_id: PageId) -> Self {
        Self {
            split: false,
            new_page_id,
            split_page_id: PageId::NONE,
            sep_key: Vec::new(),
        }
    }
}

struct FlushAcc {
    pages: u64,
    bytes: u64,
    stale: u32,
    root_id: PageId,
}

impl Default for FlushAcc {
    fn default() -> Self {
        Self {
            pages: 0,
            bytes: 0,
            stale: 0,
            root_id: PageId::NONE,
        }
    }
}

struct Recovered {
    commit: CommitEntry,
    root_off: u64,
    history_end: u64,
    anchor: Option<HistoryAnchor>,
}

/// An embedded, append-only, copy-on-write B+tree index.
pub struct Tree {
    path: PathBuf,
    id: TreeId,
    page_size: usize,
    max_entry_size: usize,

    pub(crate) inner: RwLock<TreeWrite>,
    pub(crate) pg_buf: Arc<PageCache>,
    pub(crate) tree_app: Arc<dyn AppendLog>,
    pub(crate) history_app: Arc<dyn AppendLog>,

    root_id: AtomicU64,
    last_snapshot_id: AtomicU64,
    root_ts: AtomicU64,
    last_snapshot_ts: AtomicU64,
    indexed_entry_count: AtomicU32,
    num_pages: AtomicU64,
    stale_pages: AtomicU32,
    snapshot_count: Arc<AtomicU64>,
    unsynced_bytes: Arc<AtomicU64>,
    closed: AtomicBool,
    compacting: AtomicBool,

    sync_thld: u64,
    compaction_thld: f32,
    max_active_snapshots: usize,
    read_only: bool,
}

impl Tree {
    /// Opens the tree stored under `path`, recovering the latest valid
    /// snapshot.
    ///
    /// Snapshot directories (`tree_<ts>`) are tried newest first; a
    /// candidate that fails recovery is removed and the next one tried.
    /// When no candidate works the base `tree` log is opened, and an
    /// empty tree is produced when that holds no valid commit entry.
    pub fn open(path: impl AsRef<Path>, mut opts: Options) -> TreeResult<Self> {
        opts.validate()?;
        let path = path.as_ref().to_path_buf();

        let history_app = (opts.app_factory)(&path, HISTORY_LOG_NAME, &app_opts(&opts, HISTORY_FILE_EXT))?;
        let tree_app_opts = app_opts(&opts, TREE_FILE_EXT);

        // Newest snapshot directories first.
        let mut candidates: Vec<(String, u64)> = (opts.read_dir)(&path)
            .map_err(|err| TreeError::AppLog(err.into()))?
            .into_iter()
            .filter(|e| e.is_dir)
            .filter_map(|e| {
                let ts = snapshot_dir_ts(&e.name)?;
                Some((e.name, ts))
            })
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let mut attempts = 0;
        for (name, _) in candidates {
            let tree_app = match (opts.app_factory)(&path, &name, &tree_app_opts) {
                Ok(app) => app,
                Err(_) => {
                    attempts += 1;
                    continue;
                }
            };
            match Self::build(&path, tree_app, Arc::clone(&history_app), &mut opts, true) {
                Ok(tree) => return Ok(tree),
                Err(_) => {
                    attempts += 1;
                    if !opts.read_only {
                        let _ = (opts.app_remove)(&path, &name);
                    }
                }
            }
        }

        if attempts > 0 {
            warn!(
                path = %path.display(),
                attempts,
                "no snapshot could be recovered"
            );
        }

        let tree_app = (opts.app_factory)(&path, TREE_LOG_NAME, &tree_app_opts)?;
        Self::build(&path, tree_app, history_app, &mut opts, false)
    }

    /// Opens the tree over caller-provided logs.
    pub fn open_with(
        path: impl AsRef<Path>,
        tree_app: Arc<dyn AppendLog>,
        history_app: Arc<dyn AppendLog>,
        mut opts: Options,
    ) -> TreeResult<Self> {
        Self::build(path.as_ref(), tree_app, history_app, &mut opts, false)
    }

    fn build(
        path: &Path,
        tree_app: Arc<dyn AppendLog>,
        history_app: Arc<dyn AppendLog>,
        opts: &mut Options,
        require_commit: bool,
    ) -> TreeResult<Self> {
        opts.validate()?;
        let page_size = opts.page_size();
        let max_entry_size = page_size / 2;

        let recovered = match recover_state(
            tree_app.as_ref(),
            history_app.as_ref(),
            page_size,
            max_entry_size,
        ) {
            Ok(state) => Some(state),
            Err(TreeError::NoValidPageFound) if !require_commit => None,
            Err(err) => return Err(err),
        };

        match &recovered {
            Some(state) => {
                tree_app.set_offset(state.root_off + COMMIT_ENTRY_SIZE as u64)?;
                history_app.set_offset(state.history_end)?;
            }
            None => {
                tree_app.set_offset(0)?;
                history_app.set_offset(0)?;
            }
        }

        let depth = match &recovered {
            Some(state) => measure_depth(tree_app.as_ref(), page_size, state.root_off)?,
            None => 0,
        };

        let history_size = history_app.size()?;
        let write_buffer = opts
            .write_buffer
            .take()
            .ok_or_else(|| TreeError::illegal("options were already consumed"))?;

        let tree = Self {
            path: path.to_path_buf(),
            id: opts.id,
            page_size,
            max_entry_size,
            inner: RwLock::new(TreeWrite {
                wb: write_buffer,
                head_history: PageId::NONE,
                tail_history: PageId::NONE,
                history_write_off: history_size,
                last_history_entry: recovered.as_ref().and_then(|s| s.anchor),
                depth,
                n_splits: 0,
                mutated: false,
            }),
            pg_buf: Arc::clone(&opts.page_buffer),
            tree_app,
            history_app,
            root_id: AtomicU64::new(PageId::NONE.as_u64()),
            last_snapshot_id: AtomicU64::new(PageId::NONE.as_u64()),
            root_ts: AtomicU64::new(0),
            last_snapshot_ts: AtomicU64::new(0),
            indexed_entry_count: AtomicU32::new(0),
            num_pages: AtomicU64::new(0),
            stale_pages: AtomicU32::new(0),
            snapshot_count: Arc::new(AtomicU64::new(0)),
            unsynced_bytes: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
            compacting: AtomicBool::new(false),
            sync_thld: opts.sync_thld,
            compaction_thld: opts.compaction_thld,
            max_active_snapshots: opts.max_active_snapshots,
            read_only: opts.read_only,
        };

        if let Some(state) = recovered {
            let root = PageId::from_offset(state.root_off);
            tree.root_id.store(root.as_u64(), Ordering::SeqCst);
            tree.last_snapshot_id.store(root.as_u64(), Ordering::SeqCst);
            tree.root_ts.store(state.commit.ts, Ordering::SeqCst);
            tree.last_snapshot_ts.store(state.commit.ts, Ordering::SeqCst);
            tree.indexed_entry_count
                .store(state.commit.indexed_entry_count, Ordering::SeqCst);
            tree.num_pages.store(state.commit.total_pages, Ordering::SeqCst);
            tree.stale_pages
                .store(state.commit.stale_pages, Ordering::SeqCst);
        }
        Ok(tree)
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Inserts an entry.
    ///
    /// `entry.ts` must be positive and no older than the current root
    /// timestamp. The call fails with [`TreeError::TreeLocked`] instead
    /// of blocking when another writer holds the tree.
    pub fn insert(&self, entry: Entry) -> TreeResult<()> {
        self.check_open()?;
        if self.read_only {
            return Err(TreeError::ReadOnly);
        }
        if entry.key.is_empty() {
            return Err(TreeError::illegal("key must not be empty"));
        }
        if entry.ts == 0 {
            return Err(TreeError::InvalidTimestamp(
                "timestamp must be greater than zero".to_string(),
            ));
        }
        if entry.ts < self.ts() {
            return Err(TreeError::InvalidTimestamp(
                "attempt to insert a value with an older timestamp".to_string(),
            ));
        }
        if entry.value.len() > self.max_entry_size {
            return Err(TreeError::MaxEntrySizeExceeded {
                size: entry.value.len(),
                max: self.max_entry_size,
            });
        }
        let record = LEAF_ENTRY_OVERHEAD + entry.key.len() + entry.value.len();
        if record + SLOT_SIZE + LEAF_HEADER_SIZE > self.page_size {
            return Err(TreeError::MaxEntrySizeExceeded {
                size: record,
                max: self.page_size - SLOT_SIZE - LEAF_HEADER_SIZE,
            });
        }

        let Some(mut inner) = self.inner.try_write() else {
            return Err(TreeError::TreeLocked);
        };

        // Worst case every page on the path splits, plus a new root and
        // one sibling; the insert must not start unless that is covered.
        let needed = inner.depth + 2;
        if !inner.wb.grow(needed) {
            return Err(TreeError::WriteBufferFull);
        }

        let root = self.root_page_id();
        let res = self.insert_at(&mut inner, root, &entry, 0)?;

        if res.split {
            inner.n_splits += 1;
            inner.depth += 1;

            // Neither half of the old root is the root anymore.
            PageMut::new(inner.wb.tree_page_mut(res.new_page_id)?).clear_root();
            PageMut::new(inner.wb.tree_page_mut(res.split_page_id)?).clear_root();

            let new_root = inner.wb.alloc_inner_page()?;
            let root_page = inner.wb.tree_page_mut(new_root)?;
            let mut pm = PageMut::new(root_page);
            pm.inner_set_child(0, res.new_page_id);
            pm.inner_insert_key(&res.sep_key, res.split_page_id)
                .map_err(|_| TreeError::CorruptedIndex("fresh root page overflowed".to_string()))?;
            pm.set_root();

            self.root_id.store(new_root.as_u64(), Ordering::SeqCst);
        } else {
            self.root_id.store(res.new_page_id.as_u64(), Ordering::SeqCst);
        }

        self.root_ts.store(entry.ts, Ordering::SeqCst);
        inner.mutated = true;
        Ok(())
    }

    fn insert_at(
        &self,
        inner: &mut TreeWrite,
        id: PageId,
        e: &Entry,
        depth: usize,
    ) -> TreeResult<InsertOutcome> {
        if !id.is_valid() {
            return self.insert_empty(inner, e);
        }

        let new_id = inner.wb.get_or_dup(id, |dst| self.dup_page(id, dst))?;

        let (is_leaf, child) = {
            let pg = PageRef::new(inner.wb.tree_page(new_id)?);
            if pg.is_leaf() {
                (true, (0, PageId::NONE))
            } else {
                (false, pg.inner_search(&e.key))
            }
        };
        if is_leaf {
            return self.insert_leaf(inner, new_id, e, depth);
        }
        let (child_idx, child_id) = child;

        let res = self.insert_at(inner, child_id, e, depth + 1)?;
        if res.split {
            let full = {
                let pg = inner.wb.tree_page_mut(new_id)?;
                match PageMut::new(pg).inner_insert_key(&res.sep_key, res.split_page_id) {
                    Ok(()) => false,
                    Err(PageError::Full) => true,
                    Err(err) => return Err(corrupted_page(err)),
                }
            };

            if full {
                inner.n_splits += 1;
                let split_id = inner.wb.alloc_inner_page()?;
                let (left, right) = inner.wb.tree_pages_mut2(new_id, split_id)?;
                let lifted = page::split_inner(
                    left,
                    right,
                    child_idx,
                    res.new_page_id,
                    &res.sep_key,
                    res.split_page_id,
                );
                return Ok(InsertOutcome {
                    split: true,
                    new_page_id: new_id,
                    split_page_id: split_id,
                    sep_key: lifted,
                });
            }
        }
        PageMut::new(inner.wb.tree_page_mut(new_id)?).inner_set_child(child_idx, res.new_page_id);

        Ok(InsertOutcome::no_split(new_id))
    }

    fn insert_empty(&self, inner: &mut TreeWrite, e: &Entry) -> TreeResult<InsertOutcome> {
        let id = inner.wb.alloc_leaf_page()?;
        let pg = inner.wb.tree_page_mut(id)?;
        let mut pm = PageMut::new(pg);
        pm.leaf_insert(e)
            .map_err(|_| TreeError::CorruptedIndex("entry does not fit a fresh leaf".to_string()))?;
        pm.set_root();

        inner.depth = 1;
        Ok(InsertOutcome::no_split(id))
    }

    fn insert_leaf(
        &self,
        inner: &mut TreeWrite,
        pg_id: PageId,
        e: &Entry,
        depth: usize,
    ) -> TreeResult<InsertOutcome> {
        let inserted = {
            let pg = inner.wb.tree_page_mut(pg_id)?;
            PageMut::new(pg).leaf_insert(e)
        };
        match inserted {
            Err(PageError::Full) => return self.split_leaf_page(inner, pg_id, e),
            Err(err) => return Err(corrupted_page(err)),
            Ok(None) => {}
            Ok(Some(prev)) => {
                let hc = prev.hc + 1;
                let hoff = self.archive_entry(inner, &prev)?;
                let pg = inner.wb.tree_page_mut(pg_id)?;
                PageMut::new(pg)
                    .leaf_update_history(&e.key, hoff, hc)
                    .map_err(corrupted_page)?;
            }
        }

        inner.depth = depth + 1;
        Ok(InsertOutcome::no_split(pg_id))
    }

    fn split_leaf_page(
        &self,
        inner: &mut TreeWrite,
        pg_id: PageId,
        e: &Entry,
    ) -> TreeResult<InsertOutcome> {
        inner.n_splits += 1;

        let split_id = inner.wb.alloc_leaf_page()?;

        // Archive the displaced version before the split; doing it after
        // could land the replacement and the history link on different
        // pages.
        let prev = {
            let pg = inner.wb.tree_page_mut(pg_id)?;
            PageMut::new(pg).leaf_remove(&e.key)
        };

        let mut moved = e.clone();
        if let Some(prev) = prev {
            moved.hoff = self.archive_entry(inner, &prev)?;
            moved.hc = prev.hc + 1;
        }

        let (left, right) = inner.wb.tree_pages_mut2(pg_id, split_id)?;
        let sep_key = page::split_leaf(left, right, &moved);

        Ok(InsertOutcome {
            split: true,
            new_page_id: pg_id,
            split_page_id: split_id,
            sep_key,
        })
    }

    /// Appends the displaced version to the in-memory history chain and
    /// returns its (projected) history-log offset.
    fn archive_entry(&self, inner: &mut TreeWrite, prev: &PrevVersion) -> TreeResult<u64> {
        if !inner.head_history.is_valid() {
            let id = inner.wb.alloc_history_page()?;
            inner.head_history = id;
            inner.tail_history = id;
        }

        let tail = inner.tail_history;
        let appended = inner
            .wb
            .history_page_mut(tail)?
            .append(prev.hoff, prev.ts, &prev.value);
        let len = match appended {
            Ok(len) => len,
            Err(PageError::Full) => {
                let new_id = inner.wb.alloc_history_page()?;
                inner.wb.history_page_mut(tail)?.set_next(new_id);
                inner.tail_history = new_id;
                inner
                    .wb
                    .history_page_mut(new_id)?
                    .append(prev.hoff, prev.ts, &prev.value)
                    .map_err(|_| {
                        TreeError::CorruptedIndex(
                            "history entry does not fit a fresh page".to_string(),
                        )
                    })?
            }
            Err(err) => return Err(corrupted_page(err)),
        };

        let off = inner.history_write_off;
        inner.history_write_off += len as u64;

        let checksum = {
            let data = inner.wb.history_page(inner.tail_history)?.data();
            crc32c::crc32c(&data[data.len() - len..])
        };
        inner.last_history_entry = Some(HistoryAnchor { off, len, checksum });

        Ok(off)
    }

    /// Bumps the root timestamp without inserting.
    ///
    /// Used when the external ledger committed transactions that
    /// produced no indexable entries for this tree. Does not mark the
    /// tree mutated: an entry-free batch has nothing to flush.
    pub fn advance(&self, ts: u64, entry_count: u32) -> TreeResult<()> {
        self.check_open()?;
        if self.read_only {
            return Err(TreeError::ReadOnly);
        }

        let Some(_inner) = self.inner.try_write() else {
            return Err(TreeError::TreeLocked);
        };

        let root_ts = self.ts();
        if ts == root_ts {
            return Ok(());
        }
        if ts < root_ts {
            return Err(TreeError::InvalidTimestamp(
                "cannot advance to an older timestamp".to_string(),
            ));
        }

        self.root_ts.store(ts, Ordering::SeqCst);
        self.indexed_entry_count.store(entry_count, Ordering::SeqCst);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Flush
    // ---------------------------------------------------------------------

    /// Persists all in-memory mutations and publishes a new snapshot
    /// root. Blocks until the write lock is available.
    pub fn flush(&self) -> TreeResult<()> {
        self.check_open()?;
        let mut inner = self.inner.write();
        self.flush_to_tree_log(&mut inner)
    }

    /// Like [`Tree::flush`] but fails with [`TreeError::TreeLocked`]
    /// instead of blocking.
    pub fn try_flush(&self) -> TreeResult<()> {
        self.check_open()?;
        let Some(mut inner) = self.inner.try_write() else {
            return Err(TreeError::TreeLocked);
        };
        self.flush_to_tree_log(&mut inner)
    }

    /// Flushes and releases every write-buffer page back to the shared
    /// arena.
    pub fn flush_reset(&self) -> TreeResult<()> {
        self.check_open()?;
        let mut inner = self.inner.write();
        let res = self.flush_to_tree_log(&mut inner);
        if res.is_err() {
            // The batch is dropped: revert to the last persisted root so
            // published state never points into the freed write buffer.
            self.root_id
                .store(self.last_snapshot_id.load(Ordering::SeqCst), Ordering::SeqCst);
            self.root_ts
                .store(self.last_snapshot_ts.load(Ordering::SeqCst), Ordering::SeqCst);
            inner.head_history = PageId::NONE;
            inner.tail_history = PageId::NONE;
            inner.mutated = false;
            if let Ok(size) = self.history_app.size() {
                inner.history_write_off = size;
            }
        }
        inner.wb.reset();
        res
    }

    fn flush_to_tree_log(&self, inner: &mut TreeWrite) -> TreeResult<()> {
        if !inner.mutated {
            info!(path = %self.path.display(), "flushing not needed");
            return Ok(());
        }

        info!(path = %self.path.display(), ts = self.ts(), "starting flush");

        let history_bytes = self.flush_history(inner)?;

        let root = self.root_page_id();
        let res = self.flush_subtree(inner, root)?;

        let total_pages = self.num_pages.fetch_add(res.pages, Ordering::SeqCst) + res.pages;
        let stale_pages = self.stale_pages.fetch_add(res.stale, Ordering::SeqCst) + res.stale;

        let commit = CommitEntry {
            ts: self.ts(),
            hlog_last_entry_off: inner.last_history_entry.map_or(0, |a| a.off),
            hlog_last_entry_checksum: inner.last_history_entry.map_or(0, |a| a.checksum),
            total_pages,
            stale_pages,
            indexed_entry_count: self.indexed_entry_count(),
        };
        let mut buf = [0u8; COMMIT_ENTRY_SIZE];
        commit::put_commit_entry(&commit, &mut buf);
        self.tree_app.append(&buf)?;
        self.tree_app.flush()?;

        self.root_id.store(res.root_id.as_u64(), Ordering::SeqCst);
        self.last_snapshot_id
            .store(res.root_id.as_u64(), Ordering::SeqCst);
        self.last_snapshot_ts.store(self.ts(), Ordering::SeqCst);

        inner.mutated = false;

        info!(path = %self.path.display(), "flush completed");

        self.maybe_sync(history_bytes + res.bytes + COMMIT_ENTRY_SIZE as u64);
        Ok(())
    }

    /// Appends the buffered history chain to the history log.
    fn flush_history(&self, inner: &mut TreeWrite) -> TreeResult<u64> {
        let mut current = inner.head_history;
        let mut bytes = 0u64;

        while current.is_valid() {
            let hp = inner.wb.history_page(current)?;
            let (_, n) = self.history_app.append(hp.data())?;
            bytes += n as u64;
            current = hp.next();
        }

        if bytes > 0 {
            self.history_app.flush()?;
        }

        // Clear the chain as soon as it is in the log so a failed tree
        // flush retried later cannot append it twice.
        inner.head_history = PageId::NONE;
        inner.tail_history = PageId::NONE;
        Ok(bytes)
    }

    /// Persists the subtree rooted at `id` in post-order, rewriting
    /// in-memory child ids to the offsets assigned as pages land in the
    /// log. Returns the persistent id of `id` itself.
    fn flush_subtree(&self, inner: &mut TreeWrite, id: PageId) -> TreeResult<FlushAcc> {
        if !id.is_mem_page() {
            return Err(TreeError::CorruptedIndex(
                "attempted to flush a non in-memory page".to_string(),
            ));
        }

        let (copied, children) = {
            let pg = PageRef::new(inner.wb.tree_page(id)?);
            let children = if pg.is_leaf() {
                Vec::new()
            } else {
                (0..=pg.num_entries()).map(|i| (i, pg.inner_child(i))).collect()
            };
            (pg.is_copied(), children)
        };

        let mut acc = FlushAcc::default();
        for (i, child) in children {
            if !child.is_mem_page() {
                continue;
            }
            let child_acc = self.flush_subtree(inner, child)?;
            PageMut::new(inner.wb.tree_page_mut(id)?).inner_set_child(i, child_acc.root_id);
            acc.pages += child_acc.pages;
            acc.bytes += child_acc.bytes;
            acc.stale += child_acc.stale;
        }

        if copied {
            acc.stale += 1;
        }

        let pg = inner.wb.tree_page_mut(id)?;
        PageMut::new(&mut *pg).clear_copied();
        let (off, n) = self.tree_app.append(pg)?;

        acc.pages += 1;
        acc.bytes += n as u64;
        acc.root_id = PageId::from_offset(off + self.page_size as u64);
        Ok(acc)
    }

    fn maybe_sync(&self, bytes: u64) {
        let unsynced = self.unsynced_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if unsynced < self.sync_thld {
            return;
        }

        let tree_app = Arc::clone(&self.tree_app);
        let history_app = Arc::clone(&self.history_app);
        let unsynced_bytes = Arc::clone(&self.unsynced_bytes);
        let snapshot_count = Arc::clone(&self.snapshot_count);
        let path = self.path.display().to_string();

        std::thread::spawn(move || {
            // Holding a snapshot keeps the compactor from swapping the
            // log files underneath the sync.
            snapshot_count.fetch_add(1, Ordering::SeqCst);

            if let Err(err) = history_app.sync() {
                warn!(path = %path, error = %err, "unable to sync history log");
            }
            if let Err(err) = tree_app.sync() {
                warn!(path = %path, error = %err, "unable to sync tree log");
            }
            unsynced_bytes.store(0, Ordering::Release);

            snapshot_count.fetch_sub(1, Ordering::SeqCst);
        });
    }

    // ---------------------------------------------------------------------
    // Snapshots and reads
    // ---------------------------------------------------------------------

    /// Opens a snapshot of the current in-memory state.
    ///
    /// The snapshot holds the tree's shared lock for its lifetime, so
    /// writers fail with [`TreeError::TreeLocked`] while it is open.
    pub fn write_snapshot(&self) -> TreeResult<Snapshot<'_>> {
        self.check_open()?;
        let guard = self.inner.read();
        let root = self.root_page_id();
        let ts = self.ts();
        Ok(Snapshot::new_write(self, guard, root, ts))
    }

    /// Opens a lock-free snapshot of the last persisted root.
    pub fn read_snapshot(&self) -> TreeResult<Snapshot<'_>> {
        self.check_open()?;
        let root = PageId::new(self.last_snapshot_id.load(Ordering::SeqCst));
        if !root.is_valid() {
            return Err(TreeError::NoSnapshotAvailable);
        }
        let ts = self.last_snapshot_ts.load(Ordering::SeqCst);
        self.make_read_snapshot(root, ts)
    }

    /// Opens a read snapshot anchored at `ts`, flushing first when the
    /// persisted state is older. With `ts == 0` the snapshot anchors at
    /// the latest persisted timestamp.
    pub fn snapshot_at_ts(&self, cancel: &CancelToken, ts: u64) -> TreeResult<Snapshot<'_>> {
        let (root, snap_ts) = self.ensure_latest_snapshot_contains(cancel, ts)?;
        let at = if ts == 0 { snap_ts } else { ts };
        self.make_read_snapshot(root, at)
    }

    /// Opens a read snapshot guaranteed to include everything up to
    /// `ts`, flushing first when needed.
    pub fn snapshot_must_include_ts(
        &self,
        cancel: &CancelToken,
        ts: u64,
    ) -> TreeResult<Snapshot<'_>> {
        let (root, snap_ts) = self.ensure_latest_snapshot_contains(cancel, ts)?;
        self.make_read_snapshot(root, snap_ts)
    }

    fn ensure_latest_snapshot_contains(
        &self,
        cancel: &CancelToken,
        ts: u64,
    ) -> TreeResult<(PageId, u64)> {
        self.check_open()?;
        if cancel.is_cancelled() {
            return Err(TreeError::Cancelled);
        }

        let mut inner = self.inner.write();
        if cancel.is_cancelled() {
            return Err(TreeError::Cancelled);
        }

        let root_ts = self.ts();
        if root_ts < ts {
            return Err(TreeError::StaleRootTimestamp {
                root_ts,
                requested: ts,
            });
        }

        let last = PageId::new(self.last_snapshot_id.load(Ordering::SeqCst));
        let flush_needed =
            !last.is_valid() || (ts > 0 && self.last_snapshot_ts.load(Ordering::SeqCst) < ts);
        if flush_needed {
            self.flush_to_tree_log(&mut inner)?;
        }

        let root = PageId::new(self.last_snapshot_id.load(Ordering::SeqCst));
        if !root.is_valid() {
            return Err(TreeError::NoSnapshotAvailable);
        }
        Ok((root, self.last_snapshot_ts.load(Ordering::SeqCst)))
    }

    fn make_read_snapshot(&self, root: PageId, ts: u64) -> TreeResult<Snapshot<'_>> {
        let mut count = self.snapshot_count.load(Ordering::SeqCst);
        loop {
            if count >= self.max_active_snapshots as u64 {
                return Err(TreeError::MaxActiveSnapshots);
            }
            match self.snapshot_count.compare_exchange_weak(
                count,
                count + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(seen) => count = seen,
            }
        }
        Ok(Snapshot::new_read(self, root, ts))
    }

    /// Point lookup against the current in-memory state.
    ///
    /// Returns `(value, ts, hc)`.
    pub fn get(&self, key: &[u8]) -> TreeResult<(Vec<u8>, u64, u64)> {
        let snap = self.write_snapshot()?;
        snap.get(key)
    }

    /// Runs `f` over the entry for `key` without copying it out.
    pub fn use_entry<R>(
        &self,
        key: &[u8],
        f: impl FnOnce(EntryRef<'_>) -> TreeResult<R>,
    ) -> TreeResult<R> {
        let snap = self.write_snapshot()?;
        snap.use_entry(key, f)
    }

    /// Returns the smallest entry whose key starts with `prefix` and
    /// differs from `neq`, as `(key, value, ts, hc)`.
    pub fn get_with_prefix(
        &self,
        prefix: &[u8],
        neq: &[u8],
    ) -> TreeResult<(Vec<u8>, Vec<u8>, u64, u64)> {
        let snap = self.write_snapshot()?;
        snap.get_with_prefix(prefix, neq)
    }

    /// Returns the newest revision of `key` whose timestamp lies in
    /// `[initial_ts, final_ts]`, as `(value, ts, revision)`.
    pub fn get_between(
        &self,
        key: &[u8],
        initial_ts: u64,
        final_ts: u64,
    ) -> TreeResult<(Vec<u8>, u64, u64)> {
        let snap = self.read_snapshot()?;
        snap.get_between(key, initial_ts, final_ts)
    }

    /// Lists revisions of `key` against the last persisted snapshot.
    pub fn history(
        &self,
        key: &[u8],
        offset: u64,
        desc: bool,
        limit: usize,
    ) -> TreeResult<(Vec<TimedValue>, u64)> {
        let snap = match self.read_snapshot() {
            Ok(snap) => snap,
            Err(TreeError::NoSnapshotAvailable) => return Err(TreeError::KeyNotFound),
            Err(err) => return Err(err),
        };
        snap.history(key, offset, desc, limit)
    }

    /// Reads revision `version` of `key` (1-based; `hc + 1` names the
    /// current revision) against the last persisted snapshot. Returns
    /// `(value, ts)`.
    pub fn get_revision(&self, key: &[u8], version: u64) -> TreeResult<(Vec<u8>, u64)> {
        self.check_open()?;
        if version == 0 {
            return Err(TreeError::illegal("revision numbers start at 1"));
        }

        let root = PageId::new(self.last_snapshot_id.load(Ordering::SeqCst));
        if !root.is_valid() {
            return Err(TreeError::KeyNotFound);
        }
        let ts = self.last_snapshot_ts.load(Ordering::SeqCst);
        let snap = Snapshot::new_read_uncounted(self, root, ts);

        let (cur_ts, hoff, hc, value) =
            snap.use_entry(key, |e| Ok((e.ts, e.hoff, e.hc, e.value.to_vec())))?;

        if version == hc + 1 {
            return Ok((value, cur_ts));
        }
        if version > hc {
            return Err(TreeError::KeyRevisionNotFound);
        }

        let hops = (hc - version) as usize;
        let reader = HistoryReader::new(self.history_app.as_ref(), self.max_entry_size);
        let entry = reader.revision_at(hoff, hops)?;
        Ok((entry.value, entry.ts))
    }

    // ---------------------------------------------------------------------
    // Lifecycle and introspection
    // ---------------------------------------------------------------------

    /// Flushes, syncs and closes both logs.
    ///
    /// Fails with [`TreeError::ActiveSnapshots`] while read snapshots
    /// are open. Teardown steps all run; their errors are aggregated.
    pub fn close(&self) -> TreeResult<()> {
        self.check_open()?;
        let mut inner = self.inner.write();

        if self.active_snapshots() > 0 {
            return Err(TreeError::ActiveSnapshots);
        }

        if !self.read_only {
            self.flush_to_tree_log(&mut inner)?;
        }
        self.closed.store(true, Ordering::SeqCst);

        let mut merr = MultiError::new();
        merr.push(self.history_app.sync());
        merr.push(self.tree_app.sync());
        merr.push(self.history_app.close());
        merr.push(self.tree_app.close());
        merr.reduce()
    }

    /// The tree id.
    pub fn id(&self) -> TreeId {
        self.id
    }

    /// The directory this tree lives in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current root timestamp.
    pub fn ts(&self) -> u64 {
        self.root_ts.load(Ordering::SeqCst)
    }

    /// The page size used by this tree.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The largest accepted inline value.
    pub fn max_entry_size(&self) -> usize {
        self.max_entry_size
    }

    /// Number of levels from the root to the leaves.
    pub fn depth(&self) -> usize {
        self.inner.read().depth
    }

    /// Page splits performed since open.
    pub fn splits(&self) -> u64 {
        self.inner.read().n_splits
    }

    /// Entries the external ledger reported as indexed.
    pub fn indexed_entry_count(&self) -> u32 {
        self.indexed_entry_count.load(Ordering::SeqCst)
    }

    /// Pages appended to the tree log so far.
    pub fn num_pages(&self) -> u64 {
        self.num_pages.load(Ordering::SeqCst)
    }

    /// Persisted pages no longer reachable from the latest root.
    pub fn stale_pages(&self) -> u32 {
        self.stale_pages.load(Ordering::SeqCst)
    }

    /// Fraction of persisted pages that are stale.
    pub fn stale_page_percentage(&self) -> f32 {
        let total = self.num_pages();
        if total == 0 {
            return 0.0;
        }
        self.stale_pages() as f32 / total as f32
    }

    /// Whether the stale-page ratio crossed the compaction threshold.
    pub fn compaction_required(&self) -> bool {
        !self.compacting.load(Ordering::SeqCst)
            && self.stale_page_percentage() >= self.compaction_thld
    }

    /// Open read snapshots (background syncs count while running).
    pub fn active_snapshots(&self) -> u64 {
        self.snapshot_count.load(Ordering::SeqCst)
    }

    pub(crate) fn release_snapshot(&self) {
        self.snapshot_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn check_open(&self) -> TreeResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TreeError::AlreadyClosed);
        }
        Ok(())
    }

    fn root_page_id(&self) -> PageId {
        PageId::new(self.root_id.load(Ordering::SeqCst))
    }

    /// Copies the persisted page `id` into `dst` through the shared
    /// page cache.
    fn dup_page(&self, id: PageId, dst: &mut [u8]) -> TreeResult<()> {
        self.pg_buf
            .use_page(
                self.id,
                id,
                |frame| self.read_page_from_log(frame, id).map_err(box_err),
                |bytes| dst.copy_from_slice(bytes),
            )
            .map_err(TreeError::from)
    }

    /// Pins the persisted page `id` and runs `f` over it.
    pub(crate) fn with_persisted_page<R>(
        &self,
        id: PageId,
        f: impl FnOnce(PageRef<'_>) -> TreeResult<R>,
    ) -> TreeResult<R> {
        self.pg_buf
            .use_page(
                self.id,
                id,
                |frame| self.read_page_from_log(frame, id).map_err(box_err),
                |bytes| f(PageRef::new(bytes)),
            )
            .map_err(TreeError::from)?
    }

    fn read_page_from_log(&self, dst: &mut [u8], id: PageId) -> TreeResult<()> {
        if !id.is_valid() || id.is_mem_page() {
            return Err(TreeError::InvalidPageId);
        }
        let end = id.as_u64();
        if end < self.page_size as u64 {
            return Err(TreeError::InvalidPageId);
        }
        self.tree_app.read_at(dst, end - self.page_size as u64)?;
        PageRef::parse(dst).map_err(corrupted_page)?;
        Ok(())
    }
}

fn app_opts(opts: &Options, ext: &str) -> AppendOptions {
    AppendOptions::new()
        .with_file_size(opts.file_size)
        .with_file_mode(opts.file_mode)
        .with_write_buffer_size(opts.app_write_buffer_size)
        .with_read_only(opts.read_only)
        .with_file_ext(ext)
}

/// Parses `tree_<ts>` snapshot directory names.
fn snapshot_dir_ts(name: &str) -> Option<u64> {
    let mut parts = name.split('_');
    if parts.next() != Some(TREE_LOG_NAME) {
        return None;
    }
    let ts = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(ts)
}

fn recover_state(
    tree_app: &dyn AppendLog,
    history_app: &dyn AppendLog,
    page_size: usize,
    max_entry_size: usize,
) -> TreeResult<Recovered> {
    let (commit, root_off) = commit::find_last_valid_commit(tree_app)?;

    if root_off < page_size as u64 {
        return Err(TreeError::CorruptedTreeLog(
            "committed root page lies outside the log".to_string(),
        ));
    }
    let mut buf = vec![0u8; page_size];
    tree_app.read_at(&mut buf, root_off - page_size as u64)?;
    let pg = PageRef::parse(&buf).map_err(corrupted_page)?;
    if !pg.is_root() {
        return Err(TreeError::CorruptedTreeLog(
            "expected a valid root page".to_string(),
        ));
    }

    let (history_end, anchor) =
        if commit.hlog_last_entry_off == 0 && commit.hlog_last_entry_checksum == 0 {
            (0, None)
        } else {
            let reader = HistoryReader::new(history_app, max_entry_size);
            let raw = reader.read_raw_entry(commit.hlog_last_entry_off)?;
            if crc32c::crc32c(&raw) != commit.hlog_last_entry_checksum {
                return Err(TreeError::CorruptedEntry(
                    "history anchor checksum mismatch".to_string(),
                ));
            }
            (
                commit.hlog_last_entry_off + raw.len() as u64,
                Some(HistoryAnchor {
                    off: commit.hlog_last_entry_off,
                    len: raw.len(),
                    checksum: commit.hlog_last_entry_checksum,
                }),
            )
        };

    Ok(Recovered {
        commit,
        root_off,
        history_end,
        anchor,
    })
}

/// Walks the leftmost path of the recovered tree to restore its depth,
/// which the insert path needs for write-buffer sizing.
fn measure_depth(tree_app: &dyn AppendLog, page_size: usize, root_off: u64) -> TreeResult<usize> {
    let mut buf = vec![0u8; page_size];
    let mut end = root_off;
    let mut depth = 0usize;

    loop {
        if end < page_size as u64 {
            return Err(TreeError::CorruptedTreeLog(
                "child page lies outside the log".to_string(),
            ));
        }
        tree_app.read_at(&mut buf, end - page_size as u64)?;
        let pg = PageRef::parse(&buf).map_err(corrupted_page)?;
        depth += 1;
        if pg.is_leaf() {
            return Ok(depth);
        }
        let child = pg.inner_child(0);
        if child.is_mem_page() || !child.is_valid() {
            return Err(TreeError::CorruptedTreeLog(
                "persisted inner page references an in-memory child".to_string(),
            ));
        }
        end = child.as_u64();
    }
}

fn corrupted_page(err: PageError) -> TreeError {
    match err {
        PageError::Corrupted(reason) => TreeError::CorruptedPage(reason),
        PageError::Full => TreeError::CorruptedIndex("unexpected page overflow".to_string()),
    }
}

fn box_err(err: TreeError) -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(err)
}
