//! Cache frame: one page-sized slot with a pin count and clock metadata.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;
use timber_common::{PageId, TreeId};

/// Cache key: a persistent page of a specific tree.
pub(crate) type FrameKey = (TreeId, PageId);

/// A frame holds one cached page.
///
/// The pin count and clock reference bit are atomic so the hot paths
/// stay lock-free; the key and the page bytes sit behind locks that
/// order eviction against readers (see `cache.rs` for the protocol).
#[derive(Debug)]
pub(crate) struct Frame {
    /// Page bytes; write-locked only while a loader fills the frame.
    pub(crate) data: RwLock<Box<[u8]>>,
    /// The page currently held, if any.
    pub(crate) key: RwLock<Option<FrameKey>>,
    pin_count: AtomicU32,
    ref_bit: AtomicBool,
}

impl Frame {
    pub(crate) fn new(page_size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            key: RwLock::new(None),
            pin_count: AtomicU32::new(0),
            ref_bit: AtomicBool::new(false),
        }
    }

    /// Increments the pin count and gives the frame a second chance.
    #[inline]
    pub(crate) fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
        self.ref_bit.store(true, Ordering::Release);
    }

    /// Decrements the pin count.
    #[inline]
    pub(crate) fn unpin(&self) {
        let old = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "unpinned a frame with pin_count = 0");
    }

    #[inline]
    pub(crate) fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub(crate) fn ref_bit(&self) -> bool {
        self.ref_bit.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn clear_ref_bit(&self) {
        self.ref_bit.store(false, Ordering::Release);
    }

    /// Pins the frame if it still holds `key`.
    ///
    /// The pin is taken while the key lock is held, so a concurrent
    /// eviction either completes before this check (key mismatch, no
    /// pin) or observes the pin and skips the frame.
    pub(crate) fn pin_if_keyed(&self, key: FrameKey) -> bool {
        let guard = self.key.read();
        if *guard == Some(key) {
            self.pin();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_unpin() {
        let frame = Frame::new(256);
        assert!(!frame.is_pinned());

        frame.pin();
        assert!(frame.is_pinned());
        assert!(frame.ref_bit());

        frame.unpin();
        assert!(!frame.is_pinned());
    }

    #[test]
    fn test_pin_if_keyed() {
        let frame = Frame::new(256);
        let key = (TreeId::new(1), PageId::from_offset(256));

        assert!(!frame.pin_if_keyed(key));

        *frame.key.write() = Some(key);
        assert!(frame.pin_if_keyed(key));
        assert!(frame.is_pinned());

        let other = (TreeId::new(2), PageId::from_offset(256));
        assert!(!frame.pin_if_keyed(other));
    }
}
