//! The shared page cache.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use timber_common::{PageId, TreeId};

use crate::clock::ClockSweep;
use crate::error::{BufferError, BufferResult};
use crate::frame::{Frame, FrameKey};

/// Error type produced by page loaders.
pub type LoadError = Box<dyn std::error::Error + Send + Sync>;

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from a resident frame.
    pub hits: u64,
    /// Lookups that had to load the page.
    pub misses: u64,
    /// Resident pages displaced to make room.
    pub evictions: u64,
}

/// Fixed-capacity cache of persistent tree pages.
///
/// Lookups pin the frame for the lifetime of the returned [`PageRead`];
/// eviction only ever touches unpinned frames. The eviction protocol
/// orders itself against readers through each frame's key lock: readers
/// pin while holding the key lock shared, the evictor re-checks the pin
/// count while holding it exclusively.
pub struct PageCache {
    page_size: usize,
    frames: Vec<Arc<Frame>>,
    table: RwLock<HashMap<FrameKey, usize>>,
    clock: ClockSweep,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl PageCache {
    /// Creates a cache with `num_frames` frames of `page_size` bytes.
    #[must_use]
    pub fn new(num_frames: usize, page_size: usize) -> Self {
        let frames = (0..num_frames)
            .map(|_| Arc::new(Frame::new(page_size)))
            .collect();
        Self {
            page_size,
            frames,
            table: RwLock::new(HashMap::with_capacity(num_frames)),
            clock: ClockSweep::new(num_frames),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Creates a cache sized to roughly `bytes` of page memory.
    #[must_use]
    pub fn with_capacity_bytes(bytes: usize, page_size: usize) -> Self {
        Self::new((bytes / page_size).max(1), page_size)
    }

    /// Returns the page size of the cached frames.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the number of frames.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if the page is resident.
    pub fn contains(&self, tree: TreeId, page_id: PageId) -> bool {
        self.table.read().contains_key(&(tree, page_id))
    }

    /// Returns a snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Pins and returns the page, loading it on a miss.
    ///
    /// `loader` fills the frame with the page's bytes; it runs at most
    /// once per call and only on a miss. Fails with
    /// [`BufferError::CacheExhausted`] when every frame is pinned.
    pub fn get(
        &self,
        tree: TreeId,
        page_id: PageId,
        mut loader: impl FnMut(&mut [u8]) -> Result<(), LoadError>,
    ) -> BufferResult<PageRead> {
        let key = (tree, page_id);

        loop {
            let cached = self.table.read().get(&key).copied();
            if let Some(index) = cached {
                let frame = &self.frames[index];
                if frame.pin_if_keyed(key) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(PageRead::new(Arc::clone(frame)));
                }
                // The frame was re-used for another page between the
                // table lookup and the key check; look again.
                continue;
            }

            let mut table = self.table.write();
            if table.contains_key(&key) {
                // Raced with another loader for the same page.
                drop(table);
                continue;
            }

            let Some(index) = self.clock.find_victim(&self.frames) else {
                return Err(BufferError::CacheExhausted);
            };
            let frame = &self.frames[index];

            let mut frame_key = frame.key.write();
            if frame.is_pinned() {
                // A reader pinned the frame after the sweep looked at
                // it; start over rather than tearing its page out.
                drop(frame_key);
                drop(table);
                continue;
            }

            if let Some(old_key) = frame_key.take() {
                table.remove(&old_key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }

            let mut data = frame.data.write();
            if let Err(source) = loader(&mut data) {
                *frame_key = None;
                return Err(BufferError::Load { source });
            }

            *frame_key = Some(key);
            frame.pin();
            table.insert(key, index);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(PageRead::new(Arc::clone(frame)));
        }
    }

    /// Pins the page, runs `f` over its bytes and releases the pin.
    pub fn use_page<R>(
        &self,
        tree: TreeId,
        page_id: PageId,
        loader: impl FnMut(&mut [u8]) -> Result<(), LoadError>,
        f: impl FnOnce(&[u8]) -> R,
    ) -> BufferResult<R> {
        let page = self.get(tree, page_id, loader)?;
        let result = f(&page.data());
        Ok(result)
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("capacity", &self.capacity())
            .field("page_size", &self.page_size)
            .field("resident", &self.table.read().len())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Pinned read access to a cached page.
///
/// The frame stays pinned (and therefore resident) until the guard is
/// dropped.
#[derive(Debug)]
pub struct PageRead {
    frame: Arc<Frame>,
}

impl PageRead {
    fn new(frame: Arc<Frame>) -> Self {
        Self { frame }
    }

    /// Returns the page bytes.
    #[inline]
    pub fn data(&self) -> impl Deref<Target = [u8]> + '_ {
        FrameDataRef {
            guard: self.frame.data.read(),
        }
    }
}

impl Drop for PageRead {
    fn drop(&mut self) {
        self.frame.unpin();
    }
}

struct FrameDataRef<'a> {
    guard: parking_lot::RwLockReadGuard<'a, Box<[u8]>>,
}

impl Deref for FrameDataRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}
