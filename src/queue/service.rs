//! Shared completion-servicing loop for MM and ST-H2C rings (§4.5).
//!
//! Both directions of an MM queue and the H2C side of an ST queue use the
//! same index-parallel tracker and the same iterate-to-`wb_status.cidx`
//! loop; only the descriptor shape differs, so the servicing logic itself
//! lives here once.

use crate::hwops::{Direction, HwOps};
use crate::ring::{RingBuffer, RingEntry};
use crate::tracker::IndexParallelTracker;

/// Whether a service pass drained the ring fully or should be re-run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceResult {
    Finished,
    Continue,
}

/// Services up to `budget` newly-completed slots between the ring's
/// current `hw_index` and the device-reported `wb_status.cidx`.
///
/// Returns [`ServiceResult::Finished`] iff every slot up to the snapshot
/// taken at entry was serviced and no further descriptors had posted in
/// the meantime; otherwise [`ServiceResult::Continue`] so the caller
/// re-runs the pass.
pub fn service_completions<T: RingEntry>(
    ring: &mut RingBuffer<T>,
    tracker: &mut IndexParallelTracker,
    budget: u32,
) -> (ServiceResult, u32) {
    ring.sync_read();
    let wb = ring.wb_status();
    let old_cidx = ring.hw_index();
    let new_cidx = wb.cidx as u32;
    let n = ring.index_delta(old_cidx, new_cidx).min(budget);

    let mut idx = old_cidx;
    let mut completed = 0u32;
    for _ in 0..n {
        if let Some((cb, priv_)) = tracker.take(idx) {
            cb(Ok(()), priv_);
            completed += 1;
        }
        idx = ring.advance(idx, 1);
    }
    ring.set_hw_index(idx);

    let result = if idx == new_cidx {
        ServiceResult::Finished
    } else {
        ServiceResult::Continue
    };
    (result, completed)
}

pub(crate) fn write_pidx_if_dirty<T: RingEntry>(
    ring: &RingBuffer<T>,
    hwops: &dyn HwOps,
    qid: u16,
    dir: Direction,
    descriptors_written: u32,
) {
    if descriptors_written > 0 {
        ring.publish();
        hwops.write_pidx(qid, dir, ring.sw_index() as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DmaAllocator, DmaBuffer};
    use crate::error::Result;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec;
    use core::cell::UnsafeCell;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

    #[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
    #[repr(C)]
    struct Desc {
        addr: u64,
    }

    struct HeapBuffer {
        data: UnsafeCell<alloc::vec::Vec<u8>>,
    }
    unsafe impl Send for HeapBuffer {}
    unsafe impl Sync for HeapBuffer {}
    impl DmaBuffer for HeapBuffer {
        fn len(&self) -> usize {
            unsafe { (*self.data.get()).len() }
        }
        fn phys_addr(&self) -> u64 {
            0
        }
        fn as_ptr(&self) -> *const u8 {
            unsafe { (*self.data.get()).as_ptr() }
        }
        fn as_mut_ptr(&mut self) -> *mut u8 {
            self.data.get_mut().as_mut_ptr()
        }
    }
    struct HeapAllocator;
    impl DmaAllocator for HeapAllocator {
        fn alloc_coherent(&self, len: usize, _align: usize) -> Result<Box<dyn DmaBuffer>> {
            Ok(Box::new(HeapBuffer {
                data: UnsafeCell::new(vec![0u8; len]),
            }))
        }
    }

    #[test]
    fn services_up_to_device_reported_cidx() {
        let mut ring = RingBuffer::<Desc>::create(8, &HeapAllocator).unwrap();
        let mut tracker = IndexParallelTracker::new(8);
        let fired = Arc::new(AtomicUsize::new(0));
        for i in 0..3u32 {
            let f = fired.clone();
            tracker.set(
                i,
                Box::new(move |res, _| {
                    assert!(res.is_ok());
                    f.fetch_add(1, Ordering::SeqCst);
                }),
                0,
            );
        }

        ring.test_poke_wb_status(crate::ring::WbStatus {
            pidx: 0,
            cidx: 3,
            color: 0,
            irq_state: 0,
            ..Default::default()
        });

        let (result, completed) = service_completions(&mut ring, &mut tracker, 2048);
        assert_eq!(result, ServiceResult::Finished);
        assert_eq!(completed, 3);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(ring.hw_index(), 3);
    }

    #[test]
    fn budget_caps_a_single_pass() {
        let mut ring = RingBuffer::<Desc>::create(8, &HeapAllocator).unwrap();
        let mut tracker = IndexParallelTracker::new(8);
        for i in 0..5u32 {
            tracker.set(i, Box::new(|_, _| {}), 0);
        }
        ring.test_poke_wb_status(crate::ring::WbStatus {
            pidx: 0,
            cidx: 5,
            color: 0,
            irq_state: 0,
            ..Default::default()
        });

        let (result, completed) = service_completions(&mut ring, &mut tracker, 2);
        assert_eq!(result, ServiceResult::Continue);
        assert_eq!(completed, 2);
        assert_eq!(ring.hw_index(), 2);
    }
}
