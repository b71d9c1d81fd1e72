//! Ordered-admission monitor serializing operations by seqno.
//!
//! Each slot must be entered in strict ascending order; `leave` advances
//! the monitor's position and admits the next waiter. Slots a node will
//! never process are skipped with `self_cancel`. All waits are awaits, so
//! every monitor wait is also a cancellation point.

use std::collections::BTreeSet;
use std::sync::Mutex as StdMutex;

use tokio::sync::watch;

use crate::base::{Seqno, SEQNO_ILL};
use crate::utils::SyncrepError;

/// Default admission window: how far ahead of the last-left position a
/// slot may be before `would_block` reports overflow.
pub const DEFAULT_MONITOR_CAPACITY: i64 = 1 << 16;

struct MonitorInner {
    /// Seqnos self-cancelled ahead of the current position.
    cancelled: BTreeSet<Seqno>,
}

/// An ordered-admission monitor over a single seqno axis.
pub struct OrderMonitor {
    name: &'static str,
    capacity: i64,
    inner: StdMutex<MonitorInner>,

    /// Last seqno that has left the monitor; broadcast to waiters.
    last_left: watch::Sender<Seqno>,
}

/// Entered slot handle. Leaves the slot on drop, so the slot is released
/// on every exit path.
pub struct SlotGuard<'a> {
    monitor: &'a OrderMonitor,
    seqno: Seqno,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.monitor.slot_left(self.seqno);
    }
}

impl SlotGuard<'_> {
    #[inline]
    pub fn seqno(&self) -> Seqno {
        self.seqno
    }
}

impl OrderMonitor {
    pub fn new(name: &'static str, capacity: i64) -> Self {
        let (last_left, _) = watch::channel(SEQNO_ILL);
        OrderMonitor {
            name,
            capacity,
            inner: StdMutex::new(MonitorInner {
                cancelled: BTreeSet::new(),
            }),
            last_left,
        }
    }

    /// Last seqno that has left this monitor.
    #[inline]
    pub fn last_left(&self) -> Seqno {
        *self.last_left.borrow()
    }

    /// Wait until all slots before `seqno` have left, then occupy it.
    /// Entering a slot at or before the current position is an ordering
    /// invariant violation and aborts.
    pub async fn enter(
        &self,
        seqno: Seqno,
    ) -> Result<SlotGuard<'_>, SyncrepError> {
        let mut rx = self.last_left.subscribe();
        let left = rx
            .wait_for(|left| *left >= seqno - 1)
            .await
            .map_err(|_| SyncrepError::msg("monitor closed"))?;
        if *left != seqno - 1 {
            pf_error!(
                self.name;
                "monitor position {} already past entered slot {}",
                *left, seqno
            );
            panic!("ordered monitor admission violated");
        }
        Ok(SlotGuard {
            monitor: self,
            seqno,
        })
    }

    /// Wait until every slot up to and including `seqno` has left.
    pub async fn drain(&self, seqno: Seqno) -> Result<(), SyncrepError> {
        let mut rx = self.last_left.subscribe();
        rx.wait_for(|left| *left >= seqno)
            .await
            .map_err(|_| SyncrepError::msg("monitor closed"))?;
        Ok(())
    }

    /// Mark `seqno` as processed without entering it. The slot is skipped
    /// when its turn comes.
    pub fn self_cancel(&self, seqno: Seqno) {
        let mut inner = self.inner.lock().unwrap();
        if self.last_left() >= seqno {
            // already past; nothing to skip
            return;
        }
        inner.cancelled.insert(seqno);
        self.absorb_cancelled(&mut inner);
    }

    /// Whether occupying `seqno` would exceed the admission window.
    pub fn would_block(&self, seqno: Seqno) -> bool {
        seqno - self.last_left() > self.capacity
    }

    /// Set the monitor position. `SEQNO_ILL` clears the monitor; any other
    /// value may only raise the position. Lowering it is an invariant
    /// violation and aborts, hence position resets go through the two-step
    /// clear-then-set form.
    pub fn set_initial_position(&self, seqno: Seqno) {
        let mut inner = self.inner.lock().unwrap();
        if seqno == SEQNO_ILL {
            inner.cancelled.clear();
            self.last_left.send_replace(SEQNO_ILL);
            return;
        }
        let left = self.last_left();
        if left > seqno {
            pf_error!(
                self.name;
                "refusing to move monitor position backwards: {} -> {}",
                left, seqno
            );
            panic!("ordered monitor moved backwards");
        }
        inner.cancelled = inner.cancelled.split_off(&(seqno + 1));
        self.last_left.send_replace(seqno);
    }

    /// Advance past `seqno` and any contiguously cancelled successors.
    fn slot_left(&self, seqno: Seqno) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert_eq!(self.last_left() + 1, seqno);
        self.last_left.send_replace(seqno);
        self.absorb_cancelled(&mut inner);
    }

    fn absorb_cancelled(&self, inner: &mut MonitorInner) {
        let mut left = self.last_left();
        while inner.cancelled.remove(&(left + 1)) {
            left += 1;
        }
        if left != self.last_left() {
            self.last_left.send_replace(left);
        }
    }
}
