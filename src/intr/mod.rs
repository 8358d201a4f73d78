// SPDX-License-Identifier: MPL-2.0

//! `InterruptManager` (C8): maps interrupt vectors to queues in three
//! modes and (un)masks MSI-X entries. Per-function vector layout is one
//! Error vector (Master PF only, not modeled here — out of scope per the
//! error-monitoring Non-goal), `user_msix_max` User vectors forwarded
//! untouched, then the data vectors this manager owns (§4.8).

pub mod coalescing;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::dma::DmaAllocator;
use crate::error::Result;
use crate::hwops::{Direction, HwOps};

use coalescing::InterruptCoalescingRing;

/// How completions are delivered to the poll engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptMode {
    /// No interrupts; the poll engine is the only completion path.
    Poll,
    /// Each queue is assigned its own (shared, least-loaded) data
    /// vector; the vector's ISR dispatches every queue linked to it.
    DirectIrq,
    /// A vector is assigned per [`InterruptCoalescingRing`]; queues
    /// reference the ring by its absolute interrupt-queue index.
    CoalescedIrq,
}

/// One data vector's bookkeeping: a DirectIrq load counter, or the
/// coalescing ring it owns in CoalescedIrq mode.
struct DataVector {
    weight: AtomicU32,
    ring: Option<Mutex<InterruptCoalescingRing>>,
}

/// Vector-to-queue mapping and MSI-X mask control.
pub struct InterruptManager {
    mode: InterruptMode,
    base_vector: u16,
    vectors: Vec<DataVector>,
}

impl InterruptManager {
    /// Allocates `data_msix_max` data vectors starting just past
    /// `user_msix_max` (the function's reserved User-vector range). In
    /// CoalescedIrq mode each data vector gets its own coalescing ring;
    /// the caller is expected to size `data_msix_max` to
    /// `IND_INTR_MAX_DATA_VECTORS` for that mode, but this type does not
    /// itself enforce a specific count.
    pub fn new(mode: InterruptMode, user_msix_max: u16, data_msix_max: u16, allocator: &dyn DmaAllocator) -> Result<Self> {
        let mut vectors = Vec::with_capacity(data_msix_max as usize);
        for _ in 0..data_msix_max {
            let ring = if mode == InterruptMode::CoalescedIrq {
                Some(Mutex::new(InterruptCoalescingRing::create(allocator)?))
            } else {
                None
            };
            vectors.push(DataVector {
                weight: AtomicU32::new(0),
                ring,
            });
        }
        Ok(Self {
            mode,
            base_vector: user_msix_max,
            vectors,
        })
    }

    pub fn mode(&self) -> InterruptMode {
        self.mode
    }

    /// Assigns a vector to a queue entering `start()`, per §4.8.
    /// Returns `None` in Poll mode, or if no data vectors are
    /// configured.
    pub fn assign(&self, qid: u16) -> Option<u16> {
        match self.mode {
            InterruptMode::Poll => None,
            InterruptMode::DirectIrq => {
                let (idx, slot) = self
                    .vectors
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, v)| v.weight.load(Ordering::Relaxed))?;
                slot.weight.fetch_add(1, Ordering::Relaxed);
                Some(self.base_vector + idx as u16)
            }
            InterruptMode::CoalescedIrq => {
                if self.vectors.is_empty() {
                    return None;
                }
                let idx = qid as usize % self.vectors.len();
                Some(self.base_vector + idx as u16)
            }
        }
    }

    /// Releases a vector handed out by [`Self::assign`], decrementing
    /// its DirectIrq load counter. A no-op in the other two modes, since
    /// CoalescedIrq vectors are a fixed, shared assignment and Poll mode
    /// never hands one out.
    pub fn release(&self, vector: u16) {
        if self.mode != InterruptMode::DirectIrq {
            return;
        }
        if let Some(slot) = self.vector_slot(vector) {
            slot.weight.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn vector_slot(&self, vector: u16) -> Option<&DataVector> {
        vector.checked_sub(self.base_vector).and_then(|i| self.vectors.get(i as usize))
    }

    /// Drains the coalescing ring behind `vector` (CoalescedIrq mode
    /// only), invoking `dispatch(qid, direction)` for each posted entry,
    /// then writes the vector's CIDX register to the new read position.
    /// A no-op for vectors outside CoalescedIrq mode or out of range.
    pub fn service_coalescing_vector(&self, vector: u16, hwops: &dyn HwOps, mut dispatch: impl FnMut(u16, Direction)) {
        let Some(slot) = self.vector_slot(vector) else {
            return;
        };
        let Some(ring) = &slot.ring else {
            return;
        };
        let mut ring = ring.lock();
        let drained = ring.drain(&mut dispatch);
        if drained > 0 {
            hwops.write_intr_cidx(vector, ring.cidx() as u16);
        }
    }

    /// Current read position of the coalescing ring behind `vector`, for
    /// introspection (`intring_dump`). `None` outside CoalescedIrq mode.
    pub fn coalescing_ring_cidx(&self, vector: u16) -> Option<u32> {
        let slot = self.vector_slot(vector)?;
        let ring = slot.ring.as_ref()?;
        Some(ring.lock().cidx())
    }

    pub fn mask(&self, hwops: &dyn HwOps, vector: u16) {
        hwops.set_msix_mask(vector, true);
    }

    pub fn unmask(&self, hwops: &dyn HwOps, vector: u16) {
        hwops.set_msix_mask(vector, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceCapabilities;
    use crate::dma::DmaBuffer;
    use crate::error::Result as QResult;
    use crate::hwops::{CmptContext, PrefetchContext, Qid2VecContext, SwContext};
    use alloc::boxed::Box;
    use alloc::vec;
    use alloc::vec::Vec as AVec;
    use core::cell::UnsafeCell;
    use core::sync::atomic::AtomicBool;

    struct HeapBuffer {
        data: UnsafeCell<AVec<u8>>,
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
        fn alloc_coherent(&self, len: usize, _align: usize) -> QResult<Box<dyn DmaBuffer>> {
            Ok(Box::new(HeapBuffer {
                data: UnsafeCell::new(vec![0u8; len]),
            }))
        }
    }

    struct RecordingHwOps {
        masked: AtomicBool,
    }
    impl HwOps for RecordingHwOps {
        fn program_sw_context(&self, _: u16, _: Direction, _: &SwContext) -> QResult<()> {
            Ok(())
        }
        fn program_qid2vec_context(&self, _: u16, _: Direction, _: &Qid2VecContext) -> QResult<()> {
            Ok(())
        }
        fn program_cmpt_context(&self, _: u16, _: &CmptContext) -> QResult<()> {
            Ok(())
        }
        fn program_prefetch_context(&self, _: u16, _: &PrefetchContext) -> QResult<()> {
            Ok(())
        }
        fn clear_context(&self, _: u16, _: Direction) -> QResult<()> {
            Ok(())
        }
        fn invalidate_context(&self, _: u16, _: Direction) -> QResult<()> {
            Ok(())
        }
        fn write_pidx(&self, _: u16, _: Direction, _: u16) {}
        fn write_cmpt_cidx(&self, _: u16, _: u16) {}
        fn write_intr_cidx(&self, _: u16, _: u16) {}
        fn write_fmap(&self, _: u16, _: u16, _: u16) -> QResult<()> {
            Ok(())
        }
        fn read_global_csr(&self) -> crate::hwops::GlobalCsr {
            crate::hwops::GlobalCsr {
                ring_size: [8; 16],
                c2h_timer_count: [0; 16],
                c2h_threshold_count: [0; 16],
                c2h_buf_size: [2048; 16],
                writeback_interval: 0,
            }
        }
        fn device_capabilities(&self) -> DeviceCapabilities {
            DeviceCapabilities::all()
        }
        fn device_version(&self) -> u32 {
            1
        }
        fn read_pending_check(&self, _: u16, _: Direction) -> Option<bool> {
            None
        }
        fn set_msix_mask(&self, _: u16, mask: bool) {
            self.masked.store(mask, Ordering::SeqCst);
        }
    }

    #[test]
    fn poll_mode_never_assigns_a_vector() {
        let mgr = InterruptManager::new(InterruptMode::Poll, 1, 4, &HeapAllocator).unwrap();
        assert_eq!(mgr.assign(0), None);
    }

    #[test]
    fn direct_irq_assigns_least_loaded_vector() {
        let mgr = InterruptManager::new(InterruptMode::DirectIrq, 1, 2, &HeapAllocator).unwrap();
        let v0 = mgr.assign(0).unwrap();
        let v1 = mgr.assign(1).unwrap();
        assert_ne!(v0, v1);
        let v2 = mgr.assign(2).unwrap();
        // Third assignment must land back on whichever vector has fewer
        // queues (both have one after the first two assigns, so either
        // is legal, but it must stay within the allocated range).
        assert!(v2 == v0 || v2 == v1);
        mgr.release(v0);
        let v3 = mgr.assign(3).unwrap();
        assert_eq!(v3, v0);
    }

    #[test]
    fn coalesced_irq_distributes_queues_round_robin_and_services_ring() {
        let mgr = InterruptManager::new(InterruptMode::CoalescedIrq, 0, 2, &HeapAllocator).unwrap();
        let v_even = mgr.assign(0).unwrap();
        let v_odd = mgr.assign(1).unwrap();
        assert_ne!(v_even, v_odd);
        assert_eq!(mgr.assign(2).unwrap(), v_even);

        if let Some(slot) = mgr.vector_slot(v_even) {
            slot.ring.as_ref().unwrap().lock().test_write_entry(0, 0, Direction::H2c, 1);
        }

        let hwops = RecordingHwOps { masked: AtomicBool::new(false) };
        let mut seen = AVec::new();
        mgr.service_coalescing_vector(v_even, &hwops, |qid, dir| seen.push((qid, dir)));
        assert_eq!(seen, vec![(0, Direction::H2c)]);
    }

    #[test]
    fn mask_unmask_forward_to_hwops() {
        let mgr = InterruptManager::new(InterruptMode::DirectIrq, 0, 1, &HeapAllocator).unwrap();
        let hwops = RecordingHwOps { masked: AtomicBool::new(false) };
        mgr.mask(&hwops, 0);
        assert!(hwops.masked.load(Ordering::SeqCst));
        mgr.unmask(&hwops, 0);
        assert!(!hwops.masked.load(Ordering::SeqCst));
    }
}
