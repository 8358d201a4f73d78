// SPDX-License-Identifier: MPL-2.0

//! C2H (card-to-host) processing.
//!
//! MM C2H reuses [`crate::queue::h2c::RequestQueue`] verbatim: the same
//! explicit scatter-gather descriptor model, just with the device as the
//! source and the caller's buffer as the destination (§4.2). ST C2H is a
//! different shape entirely — a fixed pool of driver-prefilled buffers, a
//! completion (CMPT) ring the device writes per-packet metadata into, a
//! [`PacketFragmentQueue`] of reassembled fragments, and length-aware
//! request matching (§4.4).

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::dma::DmaBuffer;
use crate::error::QdmaError;
use crate::fragment::{Fragment, PacketFragmentQueue};
use crate::hwops::HwOps;
use crate::queue::service::ServiceResult;
use crate::ring::{DynRing, RingBuffer};
use crate::tracker::{RxCompletionCb, RxRequestTracker, UserPriv};
use bit_field::BitField;
use smallvec::SmallVec;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of consumed C2H descriptors after which the buffer-ring PIDX is
/// batch-written back to the device (§4.4 step 5 / scenario 4).
pub const C2H_PIDX_BATCH: u32 = 16;

/// Buffer-ring descriptor: the physical address of one driver-owned,
/// fixed-size receive buffer.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct StC2hDescriptor {
    pub addr: u64,
}

/// View over one raw completion-ring entry's leading header bytes.
///
/// Every `cmpt_sz` (8/16/32/64 byte) completion format shares this same
/// leading layout; the remaining bytes are side-band (UDD) payload,
/// expressed as a sized tail rather than the inheritance hierarchy
/// (`c2h_wb_header_8B ⊂ 16B ⊂ ... ⊂ 64B`) this was generalized from.
pub struct CmptHeaderView<'a> {
    bytes: &'a [u8],
}

impl<'a> CmptHeaderView<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Color bit, low nibble of byte 0 (masked uniformly across every
    /// `cmpt_sz`, per the original source's 8-byte-format masking rule).
    pub fn color(&self) -> bool {
        self.bytes[0].get_bit(0)
    }

    pub fn desc_error(&self) -> bool {
        self.bytes[0].get_bit(1)
    }

    pub fn data_frmt(&self) -> bool {
        self.bytes[0].get_bit(2)
    }

    pub fn desc_used(&self) -> bool {
        self.bytes[0].get_bit(3)
    }

    pub fn length(&self) -> u32 {
        u16::from_le_bytes([self.bytes[2], self.bytes[3]]) as u32
    }
}

/// Extracts the UDD bytes carried in a raw completion entry.
///
/// Non-Versal IP packs the color/error/desc-used flags into byte 0's low
/// nibble, shared with UDD data, so the low nibble is masked off before
/// the byte is handed back as UDD payload. Versal hard IP reserves a full
/// 3-byte header disjoint from UDD, so those bytes are simply skipped.
pub fn extract_udd(entry: &[u8], versal_hard_ip: bool) -> Vec<u8> {
    if versal_hard_ip {
        entry[3.min(entry.len())..].to_vec()
    } else {
        let mut v = entry.to_vec();
        if let Some(b0) = v.first_mut() {
            *b0 &= 0xF0;
        }
        v
    }
}

/// ST C2H reassembly and request-matching engine.
pub struct StC2hEngine {
    desc_ring: RingBuffer<StC2hDescriptor>,
    cmpt_ring: DynRing,
    buffers: Vec<Box<dyn DmaBuffer>>,
    frag_queue: PacketFragmentQueue,
    rx_tracker: RxRequestTracker,
    udd_only_cb: Option<Box<dyn Fn(u16, &[u8]) + Send + Sync>>,
    c2h_buff_size: u32,
    consumed_since_pidx: u32,
    versal_hard_ip: bool,
    failed: Option<QdmaError>,
    last_udd: Option<Vec<u8>>,
}

impl StC2hEngine {
    pub fn new(
        desc_ring: RingBuffer<StC2hDescriptor>,
        cmpt_ring: DynRing,
        buffers: Vec<Box<dyn DmaBuffer>>,
        c2h_buff_size: u32,
        versal_hard_ip: bool,
    ) -> Self {
        let cmpt_capacity = cmpt_ring.capacity();
        let rx_capacity = desc_ring.capacity();
        Self {
            desc_ring,
            cmpt_ring,
            buffers,
            frag_queue: PacketFragmentQueue::new(cmpt_capacity),
            rx_tracker: RxRequestTracker::new(rx_capacity),
            udd_only_cb: None,
            c2h_buff_size,
            consumed_since_pidx: 0,
            versal_hard_ip,
            failed: None,
            last_udd: None,
        }
    }

    pub fn set_udd_only_cb(&mut self, cb: Box<dyn Fn(u16, &[u8]) + Send + Sync>) {
        self.udd_only_cb = Some(cb);
    }

    /// Appends a receive request; `requested_len == 0` is legal and is
    /// satisfied by exactly one fragment regardless of that fragment's
    /// length.
    pub fn enqueue_rx(&mut self, requested_len: u32, cb: RxCompletionCb, priv_: UserPriv) -> crate::error::Result<()> {
        self.rx_tracker.push(requested_len, cb, priv_)
    }

    pub fn last_udd(&self) -> Option<&[u8]> {
        self.last_udd.as_deref()
    }

    pub fn desc_ring_capacity(&self) -> u32 {
        self.desc_ring.capacity()
    }

    pub fn desc_ring_phys_addr(&self) -> u64 {
        self.desc_ring.phys_addr()
    }

    pub fn cmpt_ring_phys_addr(&self) -> u64 {
        self.cmpt_ring.phys_addr()
    }

    pub fn cmpt_ring_capacity(&self) -> u32 {
        self.cmpt_ring.capacity()
    }

    /// `(capacity, sw_index, hw_index, free_entries)` of the buffer
    /// (descriptor) ring, for `queue_desc_dump`.
    pub fn desc_ring_dump(&self) -> (u32, u32, u32, u32) {
        (
            self.desc_ring.capacity(),
            self.desc_ring.sw_index(),
            self.desc_ring.hw_index(),
            self.desc_ring.free_entries(),
        )
    }

    /// Populates every descriptor slot with the physical address of the
    /// driver-prefilled receive buffer at that index, per §4.6's
    /// "buffer slots are prefilled ... at queue start" rule.
    pub fn prefill_buffers(&mut self) {
        // One slot stays permanently reserved (invariant I2), so only
        // `capacity - 1` buffers are posted up front.
        let usable = self.desc_ring.capacity() - 1;
        for idx in 0..usable {
            let addr = self.buffers[idx as usize].phys_addr();
            self.desc_ring.write_slot(idx, &StC2hDescriptor { addr });
        }
        self.desc_ring.publish();
    }

    /// Drains newly posted completion entries, reassembling them into
    /// [`Fragment`]s and advancing the buffer ring, per §4.4 steps 1-5.
    pub fn reassemble(&mut self, qid: u16, hwops: &dyn HwOps) {
        if self.failed.is_some() {
            return;
        }

        self.cmpt_ring.sync_read();
        let wb = self.cmpt_ring.wb_status();
        let new_pidx = wb.pidx as u32;
        let old = self.cmpt_ring.hw_index();
        let mut idx = old;

        while idx != new_pidx {
            let entry = self.cmpt_ring.entry(idx).to_vec();
            let hdr = CmptHeaderView::new(&entry);

            if hdr.data_frmt() || hdr.desc_error() {
                self.failed = Some(QdmaError::HardwareError(
                    "completion entry reported desc_error or unexpected data_frmt",
                ));
                self.rx_tracker.cancel_all(self.failed.unwrap());
                break;
            }

            if !hdr.desc_used() {
                let udd = extract_udd(&entry, self.versal_hard_ip);
                if let Some(cb) = &self.udd_only_cb {
                    cb(qid, &udd);
                }
                self.last_udd = Some(udd);
            } else {
                let length = hdr.length();
                let n_fragments = if length == 0 {
                    1
                } else {
                    length.div_ceil(self.c2h_buff_size)
                };
                let udd = extract_udd(&entry, self.versal_hard_ip);
                self.last_udd = Some(udd.clone());
                let udd_arc: alloc::sync::Arc<[u8]> = alloc::sync::Arc::from(udd.into_boxed_slice());

                for i in 0..n_fragments {
                    let frag_len = if i + 1 == n_fragments {
                        length - i * self.c2h_buff_size
                    } else {
                        self.c2h_buff_size
                    };
                    let slot = self.desc_ring.hw_index();
                    let data_va = self
                        .buffers
                        .get(slot as usize)
                        .map(|b| b.as_ptr())
                        .unwrap_or(core::ptr::null());

                    let frag = Fragment {
                        data_va,
                        udd_va: if i == 0 { Some(udd_arc.clone()) } else { None },
                        length: frag_len,
                        sop: i == 0,
                        eop: i + 1 == n_fragments,
                        packet_type: 0,
                    };
                    if self.frag_queue.push(frag).is_err() {
                        // Completion ring and fragment queue share capacity
                        // by construction (§4.4); this should never fire.
                        break;
                    }

                    self.desc_ring.set_hw_index(self.desc_ring.advance(slot, 1));
                    self.consumed_since_pidx += 1;
                    if self.consumed_since_pidx >= C2H_PIDX_BATCH {
                        self.flush_pidx(qid, hwops);
                    }
                }
            }

            idx = self.cmpt_ring.advance(idx, 1);
        }

        self.cmpt_ring.set_hw_index(idx);
        self.cmpt_ring.publish();
        hwops.write_cmpt_cidx(qid, idx as u16);
    }

    fn flush_pidx(&mut self, qid: u16, hwops: &dyn HwOps) {
        if self.consumed_since_pidx == 0 {
            return;
        }
        self.desc_ring.publish();
        hwops.write_pidx(qid, crate::hwops::Direction::C2h, self.desc_ring.hw_index() as u16);
        self.consumed_since_pidx = 0;
    }

    /// Matches reassembled fragments against pending receive requests per
    /// §4.4's request-matching rule: a zero-length request consumes
    /// exactly one fragment; otherwise fragments are consumed in order
    /// until their lengths sum to at least the requested length.
    pub fn match_requests(&mut self, qid: u16, hwops: &dyn HwOps) -> (ServiceResult, u32) {
        let mut completed = 0u32;
        if let Some(err) = self.failed {
            self.rx_tracker.cancel_all(err);
            return (ServiceResult::Finished, completed);
        }

        loop {
            let Some(requested_len) = self.rx_tracker.peek_len() else {
                self.flush_pidx(qid, hwops);
                return (ServiceResult::Finished, completed);
            };

            if requested_len == 0 {
                if self.frag_queue.is_empty() {
                    self.flush_pidx(qid, hwops);
                    return (ServiceResult::Continue, completed);
                }
                let frag = self.frag_queue.pop().unwrap();
                let (cb, priv_) = self.rx_tracker.pop().unwrap();
                cb(Ok(()), priv_, &[frag]);
                completed += 1;
                continue;
            }

            if (self.frag_queue.available_bytes() as u64) < requested_len as u64 {
                self.flush_pidx(qid, hwops);
                return (ServiceResult::Continue, completed);
            }

            // Most coalesced packets span a small, fixed handful of
            // completion entries; inline storage avoids a heap allocation
            // on this per-packet hot path.
            let mut collected: SmallVec<[Fragment; 4]> = SmallVec::new();
            let mut total = 0u64;
            while total < requested_len as u64 {
                let frag = self.frag_queue.pop().expect("checked available_bytes above");
                total += frag.length as u64;
                collected.push(frag);
            }
            let (cb, priv_) = self.rx_tracker.pop().unwrap();
            cb(Ok(()), priv_, &collected);
            completed += 1;
        }
    }

    pub fn cancel_all(&mut self) {
        self.rx_tracker.cancel_all(QdmaError::Cancelled);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DmaAllocator, DmaBuffer};
    use crate::error::Result as QResult;
    use alloc::sync::Arc;
    use alloc::vec;
    use core::cell::UnsafeCell;
    use core::sync::atomic::{AtomicU64, Ordering};

    struct HeapBuffer {
        data: UnsafeCell<Vec<u8>>,
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

    struct NullHwOps;
    impl HwOps for NullHwOps {
        fn program_sw_context(&self, _: u16, _: crate::hwops::Direction, _: &crate::hwops::SwContext) -> crate::error::Result<()> {
            Ok(())
        }
        fn program_qid2vec_context(&self, _: u16, _: crate::hwops::Direction, _: &crate::hwops::Qid2VecContext) -> crate::error::Result<()> {
            Ok(())
        }
        fn program_cmpt_context(&self, _: u16, _: &crate::hwops::CmptContext) -> crate::error::Result<()> {
            Ok(())
        }
        fn program_prefetch_context(&self, _: u16, _: &crate::hwops::PrefetchContext) -> crate::error::Result<()> {
            Ok(())
        }
        fn clear_context(&self, _: u16, _: crate::hwops::Direction) -> crate::error::Result<()> {
            Ok(())
        }
        fn invalidate_context(&self, _: u16, _: crate::hwops::Direction) -> crate::error::Result<()> {
            Ok(())
        }
        fn write_pidx(&self, _: u16, _: crate::hwops::Direction, _: u16) {}
        fn write_cmpt_cidx(&self, _: u16, _: u16) {}
        fn write_intr_cidx(&self, _: u16, _: u16) {}
        fn write_fmap(&self, _: u16, _: u16, _: u16) -> crate::error::Result<()> {
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
        fn device_capabilities(&self) -> crate::config::DeviceCapabilities {
            crate::config::DeviceCapabilities::all()
        }
        fn device_version(&self) -> u32 {
            1
        }
        fn read_pending_check(&self, _: u16, _: crate::hwops::Direction) -> Option<bool> {
            None
        }
        fn set_msix_mask(&self, _: u16, _: bool) {}
    }

    fn make_engine(ring_capacity: u32, cmpt_stride: usize, c2h_buff_size: u32) -> StC2hEngine {
        let desc_ring = RingBuffer::<StC2hDescriptor>::create(ring_capacity, &HeapAllocator).unwrap();
        let cmpt_ring = DynRing::create(ring_capacity, cmpt_stride, &HeapAllocator).unwrap();
        let mut buffers: Vec<Box<dyn DmaBuffer>> = Vec::new();
        for _ in 0..ring_capacity {
            buffers.push(Box::new(HeapBuffer {
                data: UnsafeCell::new(vec![0u8; c2h_buff_size as usize]),
            }));
        }
        StC2hEngine::new(desc_ring, cmpt_ring, buffers, c2h_buff_size, false)
    }

    fn cmpt_entry_bytes(stride: usize, length: u32, desc_used: bool) -> Vec<u8> {
        let mut bytes = vec![0u8; stride];
        if desc_used {
            bytes[0] |= 0x08;
        }
        let len_bytes = (length as u16).to_le_bytes();
        bytes[2] = len_bytes[0];
        bytes[3] = len_bytes[1];
        bytes
    }

    #[test]
    fn rx_coalescing_four_requests_two_completion_entries() {
        // c2h_buff_size=2048, two completion entries of length 4096 each
        // (crossing two buffers), four pending 2048-byte requests.
        let mut engine = make_engine(8, 16, 2048);
        let totals: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));
        for _ in 0..4 {
            let t = totals.clone();
            engine
                .enqueue_rx(
                    2048,
                    Box::new(move |res, _priv, frags| {
                        assert!(res.is_ok());
                        let sum: u32 = frags.iter().map(|f| f.length).sum();
                        t.fetch_add(sum as u64, Ordering::SeqCst);
                    }),
                    0,
                )
                .unwrap();
        }

        let stride = engine.cmpt_ring.stride();
        engine.cmpt_ring.test_write_entry(0, &cmpt_entry_bytes(stride, 4096, true));
        engine.cmpt_ring.test_write_entry(1, &cmpt_entry_bytes(stride, 4096, true));
        engine.cmpt_ring.test_poke_wb_status(crate::ring::WbStatus {
            pidx: 2,
            cidx: 0,
            color: 0,
            irq_state: 0,
            ..Default::default()
        });

        let hwops = NullHwOps;
        engine.reassemble(0, &hwops);
        let (result, completed) = engine.match_requests(0, &hwops);
        assert_eq!(result, ServiceResult::Finished);
        assert_eq!(completed, 4);
        assert_eq!(totals.load(Ordering::SeqCst), 4 * 2048);
    }

    #[test]
    fn header_masks_low_nibble_uniformly() {
        let entry = [0b0000_1111u8, 0, 4, 0, 0, 0, 0, 0];
        let hdr = CmptHeaderView::new(&entry);
        assert!(hdr.color());
        assert!(hdr.desc_error());
        assert!(hdr.data_frmt());
        assert!(hdr.desc_used());
        assert_eq!(hdr.length(), 4);
    }

    #[test]
    fn extract_udd_masks_on_non_versal_skips_on_versal() {
        let entry = [0xFFu8, 1, 2, 3, 4, 5];
        let non_versal = extract_udd(&entry, false);
        assert_eq!(non_versal[0], 0xF0);
        assert_eq!(&non_versal[1..], &entry[1..]);

        let versal = extract_udd(&entry, true);
        assert_eq!(versal, &entry[3..]);
    }
}
