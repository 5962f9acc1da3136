//! IRQ Handling - Edge interrupt to blocked reader handoff
//!
//! An [`InterruptSynchronizer`] is a single-slot notification between an
//! edge-triggered interrupt and the readers of one device. The interrupt side
//! only sets an atomic flag and wakes the queue; the reader side sleeps until
//! the flag is set and clears it on the way out.
//!
//! ```text
//!  Idle --[edge: signal()]--> Pending --[wait_and_drain()]--> Idle
//! ```
//!
//! Edges that arrive while the slot is already pending coalesce: only the
//! presence of at least one edge is remembered, never the count.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;

use crate::line::IrqHandler;
use crate::{DriverError, Result};

/// Which level transitions raise the interrupt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeTrigger {
    /// Low to high
    Rising,
    /// High to low
    #[default]
    Falling,
    /// Any transition
    Both,
}

impl EdgeTrigger {
    /// Does a transition from `from` to `to` qualify?
    pub fn matches(self, from: bool, to: bool) -> bool {
        match self {
            EdgeTrigger::Rising => !from && to,
            EdgeTrigger::Falling => from && !to,
            EdgeTrigger::Both => from != to,
        }
    }
}

/// External cancellation signal for a blocking wait
///
/// Clones share the same flag, so the owner of a blocked read (for example a
/// process being torn down) can cancel it from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Single-slot edge notification shared by one interrupt and its readers
pub struct InterruptSynchronizer {
    /// Set only by `signal`, cleared only by the reader that wins the drain
    ready: AtomicBool,
    closed: AtomicBool,
    waiters: AtomicUsize,
    edges: AtomicU64,
    queue: Mutex<()>,
    wake: Condvar,
    /// Interval at which sleeping readers re-check their cancel token
    poll: Duration,
}

impl InterruptSynchronizer {
    /// Create an idle synchronizer
    ///
    /// # Arguments
    /// * `poll` - how often a sleeping reader re-checks its [`CancelToken`]
    pub fn new(poll: Duration) -> Self {
        Self {
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
            edges: AtomicU64::new(0),
            queue: Mutex::new(()),
            wake: Condvar::new(),
            poll,
        }
    }

    /// Record an edge and wake every waiter
    ///
    /// Never allocates. It briefly takes the queue lock, which readers only
    /// hold to check the pending flag, so the wait is bounded.
    pub fn signal(&self) {
        self.edges.fetch_add(1, Ordering::Relaxed);
        self.ready.store(true, Ordering::Release);

        // Taking the queue lock orders this store against a reader that has
        // checked the flag but not yet gone to sleep.
        drop(self.queue.lock().unwrap_or_else(PoisonError::into_inner));
        self.wake.notify_all();
    }

    /// Block until an edge is pending, then consume it
    ///
    /// # Errors
    /// [`DriverError::Cancelled`] if `cancel` fires or the synchronizer is
    /// closed while waiting. A pending edge is left untouched in that case.
    pub fn wait_and_drain(&self, cancel: &CancelToken) -> Result<()> {
        let mut guard = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let _waiting = WaiterGuard::enter(&self.waiters);

        loop {
            if self.closed.load(Ordering::Acquire) || cancel.is_cancelled() {
                return Err(DriverError::Cancelled);
            }

            if self
                .ready
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }

            guard = match self.wake.wait_timeout(guard, self.poll) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Cancel every current and future waiter
    ///
    /// Used at detach so no reader stays parked on a device being torn down.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        drop(self.queue.lock().unwrap_or_else(PoisonError::into_inner));
        self.wake.notify_all();
    }

    /// Build an interrupt handler that signals this synchronizer
    pub fn handler(self: &Arc<Self>) -> IrqHandler {
        let sync = Arc::clone(self);
        Arc::new(move || sync.signal())
    }

    pub fn is_pending(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of readers currently parked in `wait_and_drain`
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Total edges signalled since creation
    pub fn edges(&self) -> u64 {
        self.edges.load(Ordering::Relaxed)
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

static_assertions::assert_impl_all!(InterruptSynchronizer: Send, Sync);
static_assertions::assert_impl_all!(CancelToken: Send, Sync);
