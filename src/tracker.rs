//! Request trackers: shadow structures mapping completed descriptor slots
//! back to user callbacks.
//!
//! Two shapes, per the data model: one index-parallel to the descriptor
//! ring (MM and ST-H2C, O(1) lookup by descriptor index, no locking since
//! writers publish at `sw_index` and the reader only ever advances at
//! `hw_index`), and one bounded FIFO queue (ST-C2H, since a receive
//! request's length is not known to correspond to a single descriptor
//! slot ahead of time).

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::error::{QdmaError, Result};

/// Opaque, caller-defined token threaded back through to the completion
/// callback untouched.
pub type UserPriv = usize;

/// Outcome delivered to a request's completion callback.
pub type Completion = core::result::Result<(), crate::error::QdmaError>;

pub type CompletionCb = Box<dyn FnOnce(Completion, UserPriv) + Send>;

/// Completion callback for an ST-C2H receive request: in addition to the
/// outcome, it receives the ordered list of fragments satisfying the
/// request (empty on anything but `Ok`).
pub type RxCompletionCb = Box<dyn FnOnce(Completion, UserPriv, &[crate::fragment::Fragment]) + Send>;

/// Index-parallel tracker for MM and ST-H2C completion servicing.
///
/// One slot per descriptor-ring slot. Only the descriptor carrying a
/// request's EOP has a registered callback; non-EOP slots are always
/// `None`.
pub struct IndexParallelTracker {
    slots: Vec<Option<(CompletionCb, UserPriv)>>,
}

impl IndexParallelTracker {
    pub fn new(capacity: u32) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        slots.resize_with(capacity as usize, || None);
        Self { slots }
    }

    /// Records the callback for the EOP descriptor at `idx`.
    pub fn set(&mut self, idx: u32, cb: CompletionCb, priv_: UserPriv) {
        self.slots[idx as usize] = Some((cb, priv_));
    }

    /// Takes and clears the callback at `idx`, if any.
    pub fn take(&mut self, idx: u32) -> Option<(CompletionCb, UserPriv)> {
        self.slots[idx as usize].take()
    }

    /// Invokes and clears every still-registered callback with `outcome`,
    /// in ascending slot order; used on `stop()` to cancel pending work.
    pub fn cancel_all(&mut self, outcome: crate::error::QdmaError) {
        for slot in self.slots.iter_mut() {
            if let Some((cb, priv_)) = slot.take() {
                cb(Err(outcome), priv_);
            }
        }
    }
}

struct RxEntry {
    requested_len: u32,
    cb: RxCompletionCb,
    priv_: UserPriv,
}

/// Bounded SPSC queue tracker for ST-C2H receive requests.
///
/// Capacity equals the descriptor-ring capacity; the enqueue path is the
/// producer (under the queue's enqueue lock) and the poll thread is the
/// sole consumer.
pub struct RxRequestTracker {
    entries: VecDeque<RxEntry>,
    capacity: usize,
}

impl RxRequestTracker {
    pub fn new(capacity: u32) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity as usize),
            capacity: capacity as usize,
        }
    }

    /// Appends a new receive request. `requested_len == 0` is legal and
    /// is satisfied by exactly one fragment regardless of its length.
    pub fn push(&mut self, requested_len: u32, cb: RxCompletionCb, priv_: UserPriv) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(QdmaError::ResourceExhausted("ST-C2H request tracker full"));
        }
        self.entries.push_back(RxEntry {
            requested_len,
            cb,
            priv_,
        });
        Ok(())
    }

    /// The length requested by the oldest pending request, if any.
    pub fn peek_len(&self) -> Option<u32> {
        self.entries.front().map(|e| e.requested_len)
    }

    /// Removes and returns the oldest pending request's callback/priv.
    pub fn pop(&mut self) -> Option<(RxCompletionCb, UserPriv)> {
        self.entries.pop_front().map(|e| (e.cb, e.priv_))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Invokes and clears every pending request with `outcome`, oldest
    /// first; used on `stop()`.
    pub fn cancel_all(&mut self, outcome: crate::error::QdmaError) {
        while let Some(entry) = self.entries.pop_front() {
            (entry.cb)(Err(outcome), entry.priv_, &[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn index_tracker_only_eop_slot_fires() {
        let mut tracker = IndexParallelTracker::new(4);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        tracker.set(
            2,
            Box::new(move |res, _priv| {
                assert!(res.is_ok());
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        );
        assert!(tracker.take(0).is_none());
        assert!(tracker.take(1).is_none());
        let (cb, priv_) = tracker.take(2).unwrap();
        cb(Ok(()), priv_);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(tracker.take(2).is_none());
    }

    #[test]
    fn rx_tracker_rejects_push_past_capacity() {
        let mut tracker = RxRequestTracker::new(2);
        assert!(tracker.push(128, Box::new(|_, _, _| {}), 0).is_ok());
        assert!(tracker.push(128, Box::new(|_, _, _| {}), 0).is_ok());
        assert!(tracker.push(128, Box::new(|_, _, _| {}), 0).is_err());
    }

    #[test]
    fn rx_tracker_is_fifo() {
        let mut tracker = RxRequestTracker::new(4);
        tracker.push(64, Box::new(|_, _, _| {}), 1).unwrap();
        tracker.push(128, Box::new(|_, _, _| {}), 2).unwrap();
        assert_eq!(tracker.peek_len(), Some(64));
        let (_, p) = tracker.pop().unwrap();
        assert_eq!(p, 1);
        assert_eq!(tracker.peek_len(), Some(128));
    }
}
