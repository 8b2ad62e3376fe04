//! Timestamp watcher: publish/wait coordination for indexing progress.
//!
//! The component driving a tree publishes "indexed up to `ts`" through
//! [`TsHub::done_up_to`]; callers that need the index to reach a
//! timestamp park in [`TsHub::wait_for`]. Waiters are bounded and honor
//! cancellation tokens with prompt wake-up.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use timber_common::CancelToken;

use crate::error::{TreeError, TreeResult};

struct HubState {
    done_ts: u64,
    waiting: usize,
    closed: bool,
}

struct HubInner {
    state: Mutex<HubState>,
    cond: Condvar,
}

/// A timestamp watch hub.
#[derive(Clone)]
pub struct TsHub {
    inner: Arc<HubInner>,
    max_waitees: usize,
}

impl TsHub {
    /// Creates a hub whose published timestamp starts at `initial_ts`.
    #[must_use]
    pub fn new(initial_ts: u64, max_waitees: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState {
                    done_ts: initial_ts,
                    waiting: 0,
                    closed: false,
                }),
                cond: Condvar::new(),
            }),
            max_waitees,
        }
    }

    /// Returns the latest published timestamp.
    pub fn done_ts(&self) -> u64 {
        self.inner.state.lock().done_ts
    }

    /// Returns the number of parked waiters.
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiting
    }

    /// Publishes progress up to `ts` and wakes satisfied waiters.
    ///
    /// The published timestamp is monotone; moving it backward is an
    /// error.
    pub fn done_up_to(&self, ts: u64) -> TreeResult<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(TreeError::AlreadyClosed);
        }
        if ts < state.done_ts {
            return Err(TreeError::illegal(
                "published timestamp cannot move backward",
            ));
        }
        state.done_ts = ts;
        self.inner.cond.notify_all();
        Ok(())
    }

    /// Blocks until the published timestamp reaches `ts`.
    ///
    /// Returns [`TreeError::Cancelled`] when `cancel` fires,
    /// [`TreeError::IndexLimitExceeded`] when the waiter cap is hit and
    /// [`TreeError::AlreadyClosed`] when the hub shuts down.
    pub fn wait_for(&self, ts: u64, cancel: &CancelToken) -> TreeResult<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(TreeError::AlreadyClosed);
        }
        if state.done_ts >= ts {
            return Ok(());
        }
        if state.waiting >= self.max_waitees {
            return Err(TreeError::IndexLimitExceeded);
        }
        state.waiting += 1;

        // The waker takes the state lock before notifying, so a cancel
        // arriving between the flag check and the wait cannot be lost.
        let hub = Arc::clone(&self.inner);
        let waker_slot = cancel.register_waker(Arc::new(move || {
            let _state = hub.state.lock();
            hub.cond.notify_all();
        }));

        let result = loop {
            if cancel.is_cancelled() {
                break Err(TreeError::Cancelled);
            }
            if state.closed {
                break Err(TreeError::AlreadyClosed);
            }
            if state.done_ts >= ts {
                break Ok(());
            }
            self.inner.cond.wait(&mut state);
        };

        state.waiting -= 1;
        drop(state);
        cancel.unregister_waker(waker_slot);
        result
    }

    /// Shuts the hub down, waking every waiter with `AlreadyClosed`.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        self.inner.cond.notify_all();
    }
}

impl std::fmt::Debug for TsHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TsHub")
            .field("done_ts", &state.done_ts)
            .field("waiting", &state.waiting)
            .field("closed", &state.closed)
            .finish()
    }
}
