//! Snapshots: read views anchored at a fixed root.
//!
//! A **write snapshot** pins the current in-memory root and holds the
//! tree's shared lock, so it observes every completed insert and blocks
//! writers for its lifetime. A **read snapshot** pins the last
//! persisted root and is entirely lock-free: traversal goes through the
//! shared page cache, so a concurrently running writer or flush never
//! changes what the snapshot sees.

use parking_lot::RwLockReadGuard;
use timber_common::constants::OFFSET_NONE;
use timber_common::PageId;

use crate::error::{TreeError, TreeResult};
use crate::history::HistoryReader;
use crate::page::{Entry, EntryRef, PageRef};
use crate::tree::{Tree, TreeWrite};

/// How a snapshot anchors its root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Anchored at the last persisted root; lock-free.
    Read,
    /// Anchored at the current in-memory root; holds the shared lock.
    Write,
}

/// One revision of a key, as returned by [`Snapshot::history`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedValue {
    /// The value of this revision.
    pub value: Vec<u8>,
    /// The timestamp it was written at.
    pub ts: u64,
}

/// A read-only view of the tree at a fixed `(root, ts)`.
pub struct Snapshot<'t> {
    tree: &'t Tree,
    root_id: PageId,
    ts: u64,
    mode: SnapshotMode,
    guard: Option<RwLockReadGuard<'t, TreeWrite>>,
    counted: bool,
}

impl<'t> Snapshot<'t> {
    pub(crate) fn new_write(
        tree: &'t Tree,
        guard: RwLockReadGuard<'t, TreeWrite>,
        root_id: PageId,
        ts: u64,
    ) -> Self {
        Self {
            tree,
            root_id,
            ts,
            mode: SnapshotMode::Write,
            guard: Some(guard),
            counted: false,
        }
    }

    pub(crate) fn new_read(tree: &'t Tree, root_id: PageId, ts: u64) -> Self {
        Self {
            tree,
            root_id,
            ts,
            mode: SnapshotMode::Read,
            guard: None,
            counted: true,
        }
    }

    /// A read snapshot that does not count against the active-snapshot
    /// limit; used for internal short-lived descents.
    pub(crate) fn new_read_uncounted(tree: &'t Tree, root_id: PageId, ts: u64) -> Self {
        Self {
            tree,
            root_id,
            ts,
            mode: SnapshotMode::Read,
            guard: None,
            counted: false,
        }
    }

    /// The timestamp this snapshot is anchored at.
    pub fn ts(&self) -> u64 {
        self.ts
    }

    /// Whether this is a read or a write snapshot.
    pub fn mode(&self) -> SnapshotMode {
        self.mode
    }

    /// Runs `f` over the page named by `id`.
    ///
    /// In-memory ids resolve through the write buffer (write snapshots
    /// only); persistent ids resolve through the shared page cache.
    fn with_page<R>(
        &self,
        id: PageId,
        f: impl FnOnce(PageRef<'_>) -> TreeResult<R>,
    ) -> TreeResult<R> {
        if id.is_mem_page() {
            let Some(guard) = &self.guard else {
                return Err(TreeError::InvalidPageId);
            };
            let bytes = guard.wb.tree_page(id)?;
            return f(PageRef::new(bytes));
        }
        self.tree.with_persisted_page(id, f)
    }

    /// Descends to the leaf covering `key`.
    ///
    /// Parent pages are released before the child is visited, so at
    /// most one page is pinned at a time.
    fn find_leaf(&self, key: &[u8]) -> TreeResult<PageId> {
        let mut id = self.root_id;
        if !id.is_valid() {
            return Err(TreeError::KeyNotFound);
        }
        loop {
            let next = self.with_page(id, |pg| {
                Ok(if pg.is_leaf() {
                    None
                } else {
                    Some(pg.inner_search(key).1)
                })
            })?;
            match next {
                None => return Ok(id),
                Some(child) => id = child,
            }
        }
    }

    /// Runs `f` over the entry stored for `key`.
    pub fn use_entry<R>(
        &self,
        key: &[u8],
        f: impl FnOnce(EntryRef<'_>) -> TreeResult<R>,
    ) -> TreeResult<R> {
        let leaf = self.find_leaf(key)?;
        self.with_page(leaf, |pg| match pg.leaf_search(key) {
            Ok(i) => f(pg.leaf_entry(i)),
            Err(_) => Err(TreeError::KeyNotFound),
        })
    }

    /// Point lookup. Returns `(value, ts, hc)`.
    pub fn get(&self, key: &[u8]) -> TreeResult<(Vec<u8>, u64, u64)> {
        self.use_entry(key, |e| Ok((e.value.to_vec(), e.ts, e.hc)))
    }

    /// Returns the smallest entry whose key starts with `prefix` and
    /// differs from `neq`, as `(key, value, ts, hc)`.
    pub fn get_with_prefix(
        &self,
        prefix: &[u8],
        neq: &[u8],
    ) -> TreeResult<(Vec<u8>, Vec<u8>, u64, u64)> {
        let mut iter = self.iter();
        iter.seek(prefix)?;
        while let Some(e) = iter.next()? {
            if !e.key.starts_with(prefix) {
                break;
            }
            if e.key == neq {
                continue;
            }
            return Ok((e.key, e.value, e.ts, e.hc));
        }
        Err(TreeError::KeyNotFound)
    }

    /// Returns the newest revision of `key` with a timestamp in
    /// `[initial_ts, final_ts]`, as `(value, ts, revision)`.
    pub fn get_between(
        &self,
        key: &[u8],
        initial_ts: u64,
        final_ts: u64,
    ) -> TreeResult<(Vec<u8>, u64, u64)> {
        if initial_ts > final_ts {
            return Err(TreeError::illegal("initial_ts must not exceed final_ts"));
        }

        let (cur_ts, hoff, hc, value) =
            self.use_entry(key, |e| Ok((e.ts, e.hoff, e.hc, e.value.to_vec())))?;

        if cur_ts <= final_ts {
            if cur_ts >= initial_ts {
                return Ok((value, cur_ts, hc + 1));
            }
            // The newest revision predates the range; nothing qualifies.
            return Err(TreeError::KeyNotFound);
        }

        let reader = HistoryReader::new(self.tree.history_app.as_ref(), self.tree.max_entry_size());
        let mut off = hoff;
        let mut revision = hc;
        while off != OFFSET_NONE && revision >= 1 {
            let entry = reader.read_entry(off)?;
            if entry.ts < initial_ts {
                break;
            }
            if entry.ts <= final_ts {
                return Ok((entry.value, entry.ts, revision));
            }
            off = entry.prev_offset;
            revision -= 1;
        }
        Err(TreeError::KeyNotFound)
    }

    /// Lists revisions of `key`.
    ///
    /// `offset` skips revisions from the newest (descending) or oldest
    /// (ascending) end; at most `limit` revisions are returned together
    /// with the total revision count.
    pub fn history(
        &self,
        key: &[u8],
        offset: u64,
        desc: bool,
        limit: usize,
    ) -> TreeResult<(Vec<TimedValue>, u64)> {
        let (cur_ts, hoff, hc, value) =
            self.use_entry(key, |e| Ok((e.ts, e.hoff, e.hc, e.value.to_vec())))?;
        let total = hc + 1;

        if offset >= total || limit == 0 {
            return Ok((Vec::new(), total));
        }
        let count = limit.min((total - offset) as usize);

        // Work in newest-first positions; an ascending request maps its
        // window onto the far end of the chain.
        let start = if desc {
            offset
        } else {
            total - offset - count as u64
        };
        let end = start + count as u64;

        let reader = HistoryReader::new(self.tree.history_app.as_ref(), self.tree.max_entry_size());
        let mut out = Vec::with_capacity(count);
        let mut off = hoff;
        for pos in 0..end {
            if pos == 0 {
                if pos >= start {
                    out.push(TimedValue {
                        value: value.clone(),
                        ts: cur_ts,
                    });
                }
                continue;
            }
            if off == OFFSET_NONE {
                break;
            }
            let entry = reader.read_entry(off)?;
            off = entry.prev_offset;
            if pos >= start {
                out.push(TimedValue {
                    value: entry.value,
                    ts: entry.ts,
                });
            }
        }

        if !desc {
            out.reverse();
        }
        Ok((out, total))
    }

    /// Returns a forward iterator positioned before the first entry.
    pub fn iter(&self) -> SnapshotIter<'_, 't> {
        SnapshotIter {
            snap: self,
            stack: Vec::new(),
            primed: false,
        }
    }
}

impl Drop for Snapshot<'_> {
    fn drop(&mut self) {
        if self.counted {
            self.tree.release_snapshot();
        }
    }
}

enum Visit {
    Entry(Entry),
    Descend(PageId),
    Pop,
}

/// Forward scan over a snapshot.
///
/// The iterator keeps a stack of `(page, slot)` positions; pages are
/// re-pinned per step, so a long scan never starves the page cache.
pub struct SnapshotIter<'s, 't> {
    snap: &'s Snapshot<'t>,
    stack: Vec<(PageId, usize)>,
    primed: bool,
}

impl SnapshotIter<'_, '_> {
    /// Positions the iterator at the first key `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> TreeResult<()> {
        self.stack.clear();
        self.primed = true;

        let mut id = self.snap.root_id;
        if !id.is_valid() {
            return Ok(());
        }
        loop {
            enum Step {
                Leaf(usize),
                Inner(usize, PageId),
            }
            let step = self.snap.with_page(id, |pg| {
                Ok(if pg.is_leaf() {
                    let slot = match pg.leaf_search(key) {
                        Ok(i) | Err(i) => i,
                    };
                    Step::Leaf(slot)
                } else {
                    let (idx, child) = pg.inner_search(key);
                    Step::Inner(idx, child)
                })
            })?;
            match step {
                Step::Leaf(slot) => {
                    self.stack.push((id, slot));
                    return Ok(());
                }
                Step::Inner(idx, child) => {
                    self.stack.push((id, idx + 1));
                    id = child;
                }
            }
        }
    }

    /// Returns the next entry, or `None` once the snapshot is
    /// exhausted.
    pub fn next(&mut self) -> TreeResult<Option<Entry>> {
        if !self.primed {
            self.seek(&[])?;
        }

        loop {
            let Some(&(id, idx)) = self.stack.last() else {
                return Ok(None);
            };

            let visit = self.snap.with_page(id, |pg| {
                Ok(if pg.is_leaf() {
                    if idx < pg.num_entries() {
                        Visit::Entry(pg.leaf_entry(idx).to_entry())
                    } else {
                        Visit::Pop
                    }
                } else if idx <= pg.num_entries() {
                    Visit::Descend(pg.inner_child(idx))
                } else {
                    Visit::Pop
                })
            })?;

            match visit {
                Visit::Entry(entry) => {
                    if let Some(top) = self.stack.last_mut() {
                        top.1 += 1;
                    }
                    return Ok(Some(entry));
                }
                Visit::Descend(child) => {
                    if let Some(top) = self.stack.last_mut() {
                        top.1 += 1;
                    }
                    self.stack.push((child, 0));
                }
                Visit::Pop => {
                    self.stack.pop();
                }
            }
        }
    }
}
