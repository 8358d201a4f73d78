// SPDX-License-Identifier: MPL-2.0

//! H2C (host-to-card) request processing, shared by MM and ST-H2C rings,
//! and reused for MM-C2H since that direction uses the same explicit
//! scatter-gather descriptor model (§4.2, §4.3).
//!
//! A single [`RequestQueue`] owns either an MM or an ST-H2C descriptor
//! ring and services a FIFO of [`H2cRequest`]s against it, splitting each
//! scatter-gather element into descriptors bounded by a per-descriptor
//! maximum and, when an element exceeds that maximum, further chunked at
//! the [`SG_FRAG_LEN`] boundary.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use spin::Mutex;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::hwops::{Direction, HwOps};
use crate::queue::service::{write_pidx_if_dirty, ServiceResult};
use crate::ring::RingBuffer;
use crate::tracker::{CompletionCb, IndexParallelTracker, UserPriv};

/// Maximum bytes a single MM descriptor may carry.
pub const MM_MAX_DESC_LEN: u32 = 65_535;
/// Maximum bytes a single ST descriptor may carry.
pub const ST_MAX_DESC_LEN: u32 = 65_535;
/// Sub-chunk size (15 x 4 KiB) used when a scatter-gather element exceeds
/// the per-descriptor maximum.
pub const SG_FRAG_LEN: u32 = 61_440;
/// Bound on requests serviced per poll pass, to cap per-queue unfairness.
pub const MAX_REQ_SERVICE_CNT: u32 = 10;

/// One element of a caller-supplied scatter-gather list.
#[derive(Clone, Copy, Debug)]
pub struct SgElement {
    pub addr: u64,
    pub len: u32,
}

/// MM descriptor: source/destination address pair, length, and SOP/EOP/
/// valid flags.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MmDescriptor {
    pub src_addr: u64,
    pub dst_addr: u64,
    pub length: u32,
    pub flags: u32,
}

/// ST H2C descriptor: a single host address plus length/payload-length
/// and SOP/EOP flags (no destination field; the device-side address is
/// implied by the queue's hardware context).
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct StH2cDescriptor {
    pub addr: u64,
    pub length: u16,
    pub pld_len: u16,
    pub flags: u32,
}

const FLAG_SOP: u32 = 1 << 0;
const FLAG_EOP: u32 = 1 << 1;
const FLAG_VALID: u32 = 1 << 2;

/// A queued MM or ST-H2C request awaiting (possibly partial) service.
pub struct H2cRequest {
    pub sg_list: Vec<SgElement>,
    /// Destination (H2C) or source (MM-C2H) device offset; unused for ST.
    pub device_offset: u64,
    pub cb: Option<CompletionCb>,
    pub priv_: UserPriv,
    sg_index: usize,
    offset_in_element: u32,
    bytes_emitted: u64,
    any_descriptor_emitted: bool,
}

impl H2cRequest {
    pub fn new(sg_list: Vec<SgElement>, device_offset: u64, cb: CompletionCb, priv_: UserPriv) -> Self {
        Self {
            sg_list,
            device_offset,
            cb: Some(cb),
            priv_,
            sg_index: 0,
            offset_in_element: 0,
            bytes_emitted: 0,
            any_descriptor_emitted: false,
        }
    }

    fn total_len(&self) -> u64 {
        self.sg_list.iter().map(|e| e.len as u64).sum()
    }
}

/// Either descriptor ring shape an H2C-shaped engine may own.
pub enum H2cRing {
    Mm(RingBuffer<MmDescriptor>),
    St(RingBuffer<StH2cDescriptor>),
}

impl H2cRing {
    pub fn free_entries(&self) -> u32 {
        match self {
            H2cRing::Mm(r) => r.free_entries(),
            H2cRing::St(r) => r.free_entries(),
        }
    }

    pub fn sw_index(&self) -> u32 {
        match self {
            H2cRing::Mm(r) => r.sw_index(),
            H2cRing::St(r) => r.sw_index(),
        }
    }

    pub fn capacity(&self) -> u32 {
        match self {
            H2cRing::Mm(r) => r.capacity(),
            H2cRing::St(r) => r.capacity(),
        }
    }

    pub fn hw_index(&self) -> u32 {
        match self {
            H2cRing::Mm(r) => r.hw_index(),
            H2cRing::St(r) => r.hw_index(),
        }
    }
}

/// Shared FIFO request processor for MM (either direction) and ST-H2C.
pub struct RequestQueue {
    pub ring: H2cRing,
    pub tracker: IndexParallelTracker,
    pending: Mutex<VecDeque<H2cRequest>>,
    /// Write-combine doorbell batching (`QueueConfig::pidx_batch_threshold`):
    /// descriptors published since the last PIDX doorbell write, across
    /// however many service passes it took to reach the threshold.
    pidx_batch_threshold: u32,
    pending_pidx_writes: u32,
}

impl RequestQueue {
    pub fn new(ring: H2cRing, pidx_batch_threshold: u32) -> Self {
        let capacity = ring.capacity();
        Self {
            ring,
            tracker: IndexParallelTracker::new(capacity),
            pending: Mutex::new(VecDeque::new()),
            pidx_batch_threshold: pidx_batch_threshold.max(1),
            pending_pidx_writes: 0,
        }
    }

    /// Appends `req` to the FIFO. Called from the caller's thread, not the
    /// poll thread; guarded by a short spinlock per §5.
    pub fn enqueue(&self, req: H2cRequest) {
        self.pending.lock().push_back(req);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Cancels every pending request (FIFO entries plus anything already
    /// tracked against in-flight descriptors) with
    /// [`crate::error::QdmaError::Cancelled`], invoked on `stop()`.
    pub fn cancel_all(&mut self) {
        let mut pending = self.pending.lock();
        while let Some(mut req) = pending.pop_front() {
            if let Some(cb) = req.cb.take() {
                cb(Err(crate::error::QdmaError::Cancelled), req.priv_);
            }
        }
        drop(pending);
        self.tracker.cancel_all(crate::error::QdmaError::Cancelled);
    }

    /// Services up to [`MAX_REQ_SERVICE_CNT`] requests from the head of
    /// the FIFO, splitting each into descriptors per §4.2/§4.3, and writes
    /// PIDX once at the end of the pass if any descriptor was published.
    pub fn process(&mut self, hwops: &dyn HwOps, qid: u16, dir: Direction) -> ServiceResult {
        let start_sw = self.ring.sw_index();
        let mut serviced = 0u32;

        loop {
            if serviced >= MAX_REQ_SERVICE_CNT {
                return if self.pending.lock().is_empty() {
                    ServiceResult::Finished
                } else {
                    ServiceResult::Continue
                };
            }

            let mut pending = self.pending.lock();
            let Some(req) = pending.front_mut() else {
                drop(pending);
                // No more work queued behind this pass: force out any
                // batched PIDX write now rather than leaving it stranded
                // until some future request arrives to trigger it.
                self.finish_pass(hwops, qid, dir, start_sw, true);
                return ServiceResult::Finished;
            };
            let outcome = self.emit_one(req);
            match outcome {
                EmitOutcome::RanOutOfSlots => {
                    drop(pending);
                    self.finish_pass(hwops, qid, dir, start_sw, false);
                    return ServiceResult::Continue;
                }
                EmitOutcome::RequestDone => {
                    let mut req = pending.pop_front().unwrap();
                    drop(pending);
                    // EOP already recorded its callback in the tracker;
                    // nothing else to do with `req` but let it drop. The
                    // callback itself fires later, at completion time.
                    let _ = req.cb.take();
                    serviced += 1;
                }
            }
        }
    }

    /// Accumulates this pass's newly-published descriptor count and rings
    /// the PIDX doorbell once `pidx_batch_threshold` is reached, or
    /// immediately if `force` (the pass drained the FIFO with nothing
    /// left to trigger a later flush).
    fn finish_pass(&mut self, hwops: &dyn HwOps, qid: u16, dir: Direction, start_sw: u32, force: bool) {
        let written = self.ring.sw_index().wrapping_sub(start_sw) % self.ring.capacity().max(1);
        self.pending_pidx_writes += written;
        if self.pending_pidx_writes == 0 {
            return;
        }
        if force || self.pending_pidx_writes >= self.pidx_batch_threshold {
            let to_write = self.pending_pidx_writes;
            self.pending_pidx_writes = 0;
            match &self.ring {
                H2cRing::Mm(r) => write_pidx_if_dirty(r, hwops, qid, dir, to_write),
                H2cRing::St(r) => write_pidx_if_dirty(r, hwops, qid, dir, to_write),
            }
        }
    }

    fn emit_one(&mut self, req: &mut H2cRequest) -> EmitOutcome {
        // Zero-length ST request: a single sop=eop=1,length=0 descriptor.
        let is_zero_length = req.sg_list.is_empty() || req.total_len() == 0;
        if is_zero_length && !req.any_descriptor_emitted {
            if self.ring.free_entries() == 0 {
                return EmitOutcome::RanOutOfSlots;
            }
            self.write_descriptor(req, 0, true, true);
            req.any_descriptor_emitted = true;
            return EmitOutcome::RequestDone;
        }

        let total = req.total_len();
        while req.sg_index < req.sg_list.len() {
            if self.ring.free_entries() == 0 {
                return EmitOutcome::RanOutOfSlots;
            }
            let elem = req.sg_list[req.sg_index];
            let remaining_in_elem = elem.len - req.offset_in_element;
            let max_desc_len = match &self.ring {
                H2cRing::Mm(_) => MM_MAX_DESC_LEN,
                H2cRing::St(_) => ST_MAX_DESC_LEN,
            };
            let chunk = if remaining_in_elem > max_desc_len {
                SG_FRAG_LEN.min(remaining_in_elem)
            } else {
                remaining_in_elem
            };

            let sop = !req.any_descriptor_emitted;
            let is_last_chunk_of_elem = chunk == remaining_in_elem;
            let is_last_elem = req.sg_index == req.sg_list.len() - 1;
            let would_complete = req.bytes_emitted + chunk as u64 == total;
            let eop = is_last_elem && is_last_chunk_of_elem && would_complete;

            self.write_descriptor(req, chunk, sop, eop);
            req.any_descriptor_emitted = true;
            req.bytes_emitted += chunk as u64;
            req.offset_in_element += chunk;
            if req.offset_in_element >= elem.len {
                req.sg_index += 1;
                req.offset_in_element = 0;
            }

            if eop {
                return EmitOutcome::RequestDone;
            }
        }
        // Reached here only if sg_list was fully walked without an eop
        // flag firing, which cannot happen for a well-formed request.
        EmitOutcome::RequestDone
    }

    fn write_descriptor(&mut self, req: &mut H2cRequest, chunk: u32, sop: bool, eop: bool) {
        let mut flags = FLAG_VALID;
        if sop {
            flags |= FLAG_SOP;
        }
        if eop {
            flags |= FLAG_EOP;
        }

        match &mut self.ring {
            H2cRing::Mm(ring) => {
                let idx = ring.sw_index();
                let host_addr = req
                    .sg_list
                    .get(req.sg_index)
                    .map(|e| e.addr + req.offset_in_element as u64)
                    .unwrap_or(0);
                let device_addr = req.device_offset + req.bytes_emitted;
                let desc = MmDescriptor {
                    src_addr: host_addr,
                    dst_addr: device_addr,
                    length: chunk,
                    flags,
                };
                ring.write_slot(idx, &desc);
                if eop {
                    if let Some(cb) = req.cb.take() {
                        self.tracker.set(idx, cb, req.priv_);
                    }
                }
            }
            H2cRing::St(ring) => {
                let idx = ring.sw_index();
                let addr = req
                    .sg_list
                    .get(req.sg_index)
                    .map(|e| e.addr + req.offset_in_element as u64)
                    .unwrap_or(0);
                let desc = StH2cDescriptor {
                    addr,
                    length: chunk as u16,
                    pld_len: chunk as u16,
                    flags,
                };
                ring.write_slot(idx, &desc);
                if eop {
                    if let Some(cb) = req.cb.take() {
                        self.tracker.set(idx, cb, req.priv_);
                    }
                }
            }
        }
    }
}

enum EmitOutcome {
    RanOutOfSlots,
    RequestDone,
}

/// Swaps source/destination for MM-C2H: the device is the source, the
/// scatter-gather list is the destination. Used by [`crate::queue::c2h`]
/// when building `H2cRequest`s for an MM C2H queue so [`RequestQueue`]'s
/// descriptor writer can stay direction-agnostic at the field level (the
/// wire layout always has `src_addr`/`dst_addr`; only which one is "host"
/// changes).
pub fn mm_c2h_request(sg_list: Vec<SgElement>, device_offset: u64, cb: CompletionCb, priv_: UserPriv) -> H2cRequest {
    H2cRequest::new(sg_list, device_offset, cb, priv_)
}
