//! Cancellation token for blocking APIs.
//!
//! Blocking operations (snapshot waits, indexing waits) accept a
//! [`CancelToken`] and return promptly once it is cancelled. Waiters park
//! on their own condition variables; the token keeps a waker per blocked
//! site so that `cancel` can wake all of them without knowing their lock
//! structure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A waker invoked when the token is cancelled.
///
/// Wakers must be cheap and must not block for long; a typical waker
/// briefly takes the waiter's mutex and notifies its condition variable.
pub type Waker = Arc<dyn Fn() + Send + Sync>;

struct TokenInner {
    cancelled: AtomicBool,
    wakers: Mutex<Vec<Option<Waker>>>,
}

/// A cloneable cancellation token.
///
/// All clones observe the same cancellation state.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Creates a new, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns true once `cancel` has been called.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancels the token and wakes every registered waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);

        // Snapshot the wakers before invoking them: a waker takes the
        // waiter's own lock, and holding ours across that would invert
        // lock order with `register_waker`.
        let wakers: Vec<Waker> = self.inner.wakers.lock().iter().flatten().cloned().collect();
        for waker in wakers {
            waker();
        }
    }

    /// Registers a waker; returns a slot handle for `unregister_waker`.
    ///
    /// The waker only fires from `cancel`. A waiter must therefore
    /// register first and then re-check `is_cancelled` before parking:
    /// a cancellation that lands in between either sets the flag for
    /// that check or runs the waker.
    pub fn register_waker(&self, waker: Waker) -> usize {
        let mut wakers = self.inner.wakers.lock();
        if let Some(free) = wakers.iter().position(Option::is_none) {
            wakers[free] = Some(waker);
            free
        } else {
            wakers.push(Some(waker));
            wakers.len() - 1
        }
    }

    /// Removes a previously registered waker.
    pub fn unregister_waker(&self, slot: usize) {
        let mut wakers = self.inner.wakers.lock();
        if slot < wakers.len() {
            wakers[slot] = None;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
