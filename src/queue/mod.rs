// SPDX-License-Identifier: MPL-2.0

//! `QueuePair`: the queue identity (C5).
//!
//! Owns one H2C and one C2H sub-queue (C4), the lifecycle state machine,
//! hardware context programming, the enqueue API, and completion
//! servicing. MM queues and ST queues share the H2C-direction request
//! processor ([`h2c::RequestQueue`]); MM also reuses it for C2H, while
//! ST-C2H uses the reassembly/matching engine in [`c2h`].

pub mod c2h;
pub mod h2c;
pub mod service;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};

use crate::config::{QueueConfig, QueueKind};
use crate::dma::DmaAllocator;
use crate::error::{QdmaError, Result};
use crate::hwops::{CmptContext, Direction, HwOps, PrefetchContext, Qid2VecContext, SwContext};
use crate::platform::{Notify, Platform};
use crate::ring::{DynRing, RingBuffer};
use crate::tracker::{CompletionCb, RxCompletionCb, UserPriv};

use c2h::{StC2hDescriptor, StC2hEngine};
use h2c::{H2cRequest, H2cRing, RequestQueue, SgElement};
use service::{service_completions, ServiceResult};

/// Per-direction completion-servicing budget (§4.5).
pub const COMPLETION_BUDGET: u32 = 2048;
/// Deterministic quiesce wait on `stop()`, per §5 (~2 ms).
pub const STOP_QUIESCE_US: u32 = 2_000;

/// The queue lifecycle: `Available -> Added -> Started -> Busy -> Added`.
/// Transitions are compare-exchanges on an atomic; any other transition
/// is rejected with [`QdmaError::InvalidState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueState {
    Available = 0,
    Added = 1,
    Started = 2,
    Busy = 3,
}

impl QueueState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => QueueState::Available,
            1 => QueueState::Added,
            2 => QueueState::Started,
            _ => QueueState::Busy,
        }
    }
}

/// Per-queue submitted/completed counters (§10.6 supplement: the DPDK PMD
/// stats callback's counterpart, kept even though spec.md's Non-goals
/// don't name statistics — ambient observability is carried regardless).
#[derive(Default)]
pub struct QueueStats {
    pub h2c_submitted: AtomicU64,
    pub h2c_completed: AtomicU64,
    pub c2h_submitted: AtomicU64,
    pub c2h_completed: AtomicU64,
}

enum C2hEngine {
    Mm(RequestQueue),
    St(StC2hEngine),
}

/// The queue identity: one H2C and one C2H sub-queue, a state machine,
/// and the HW-context-programming operations that bring it up and down.
pub struct QueuePair {
    pub index: u16,
    pub index_abs: u16,
    pub kind: QueueKind,
    pub name: String,
    state: AtomicU8,
    vector: AtomicU16,
    config: QueueConfig,
    h2c: Option<RequestQueue>,
    c2h: Option<C2hEngine>,
    /// MM completion (writeback-style) ring, allocated only when
    /// `en_mm_cmpl` is set; backs `read_mm_cmpt_data`.
    mm_cmpt_ring: Option<DynRing>,
    notify: Option<Arc<dyn Notify>>,
    pub stats: QueueStats,
}

impl QueuePair {
    pub fn new(index: u16, index_abs: u16, name: String) -> Self {
        Self {
            index,
            index_abs,
            kind: QueueKind::Mm,
            name,
            state: AtomicU8::new(QueueState::Available as u8),
            vector: AtomicU16::new(u16::MAX),
            config: QueueConfig::default(),
            h2c: None,
            c2h: None,
            mm_cmpt_ring: None,
            notify: None,
            stats: QueueStats::default(),
        }
    }

    pub fn state(&self) -> QueueState {
        QueueState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: QueueState, to: QueueState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| QdmaError::InvalidState("queue is not in the state required for this transition"))
    }

    pub fn vector(&self) -> Option<u16> {
        match self.vector.load(Ordering::Acquire) {
            u16::MAX => None,
            v => Some(v),
        }
    }

    /// Allocates rings, trackers, and (for ST C2H) receive buffers, and
    /// clears the queue's hardware contexts. `Available -> Added`.
    pub fn add(&mut self, config: QueueConfig, hwops: &dyn HwOps, allocator: &dyn DmaAllocator) -> Result<()> {
        if self.state() != QueueState::Available {
            return Err(QdmaError::InvalidState("add() requires the queue to be Available"));
        }

        config.validate(hwops.device_capabilities())?;
        let csr = hwops.read_global_csr();
        let h2c_capacity = csr.ring_size[config.h2c_ring_sz_index as usize].max(2);
        let c2h_capacity = csr.ring_size[config.c2h_ring_sz_index as usize].max(2);

        let h2c_ring = match config.kind {
            QueueKind::Mm => H2cRing::Mm(RingBuffer::create(h2c_capacity, allocator)?),
            QueueKind::St => H2cRing::St(RingBuffer::create(h2c_capacity, allocator)?),
        };
        let h2c_queue = RequestQueue::new(h2c_ring, config.pidx_batch_threshold);

        let c2h_engine = match config.kind {
            QueueKind::Mm => {
                let ring = H2cRing::Mm(RingBuffer::create(c2h_capacity, allocator)?);
                C2hEngine::Mm(RequestQueue::new(ring, config.pidx_batch_threshold))
            }
            QueueKind::St => {
                let desc_ring = RingBuffer::<StC2hDescriptor>::create(c2h_capacity, allocator)?;
                let cmpt_ring = DynRing::create(c2h_capacity, config.cmpt_sz.as_bytes(), allocator)?;
                let buf_size = csr.c2h_buf_size[config.c2h_buff_sz_index as usize].max(64);
                let mut buffers: Vec<Box<dyn crate::dma::DmaBuffer>> = Vec::with_capacity(c2h_capacity as usize);
                for _ in 0..c2h_capacity {
                    buffers.push(allocator.alloc_coherent(buf_size as usize, 4096)?);
                }
                C2hEngine::St(StC2hEngine::new(desc_ring, cmpt_ring, buffers, buf_size, config.versal_hard_ip))
            }
        };

        let mm_cmpt_ring = if config.kind == QueueKind::Mm && config.en_mm_cmpl {
            Some(DynRing::create(c2h_capacity, config.cmpt_sz.as_bytes(), allocator)?)
        } else {
            None
        };

        hwops.clear_context(self.index_abs, Direction::H2c)?;
        hwops.clear_context(self.index_abs, Direction::C2h)?;

        self.kind = config.kind;
        self.config = config;
        self.h2c = Some(h2c_queue);
        self.c2h = Some(c2h_engine);
        self.mm_cmpt_ring = mm_cmpt_ring;
        self.transition(QueueState::Available, QueueState::Added)?;
        log::info!("qdma: queue {} added ({:?})", self.index_abs, self.kind);
        Ok(())
    }

    /// Programs hardware contexts and seeds CSR PIDX/CIDX per §4.6.
    /// `Added -> Started`. Context-programming failures roll the queue
    /// back to `Added`.
    pub fn start(&mut self, hwops: &dyn HwOps, fnc_id: u16, vector: Option<u16>, notify: Arc<dyn Notify>) -> Result<()> {
        if self.state() != QueueState::Added {
            return Err(QdmaError::InvalidState("start() requires the queue to be Added"));
        }

        match self.program_contexts(hwops, fnc_id, vector) {
            Ok(()) => {
                self.vector.store(vector.unwrap_or(u16::MAX), Ordering::Release);
                self.notify = Some(notify);
                self.transition(QueueState::Added, QueueState::Started)?;
                log::info!("qdma: queue {} started (vector={:?})", self.index_abs, vector);
                Ok(())
            }
            Err(e) => {
                // Roll back whatever was already programmed; best effort.
                let _ = hwops.clear_context(self.index_abs, Direction::H2c);
                let _ = hwops.clear_context(self.index_abs, Direction::C2h);
                log::warn!("qdma: queue {} failed to start: {e}", self.index_abs);
                Err(e)
            }
        }
    }

    fn program_contexts(&mut self, hwops: &dyn HwOps, fnc_id: u16, vector: Option<u16>) -> Result<()> {
        let is_mm = matches!(self.kind, QueueKind::Mm);

        if let Some(h2c) = &self.h2c {
            let ring_base_phys = h2c_ring_phys(&h2c.ring);
            let ctx = SwContext {
                pidx: 0,
                qen: true,
                wbi_chk: true,
                fnc_id,
                rngsz_idx: self.config.h2c_ring_sz_index,
                desc_sz: self.config.sw_desc_sz,
                bypass: self.config.desc_bypass_en,
                mm_chn: 0,
                wbk_en: true,
                irq_en: vector.is_some(),
                is_mm,
                ring_base_phys,
                vector: vector.unwrap_or(0),
                intr_aggr: false,
            };
            hwops.program_sw_context(self.index_abs, Direction::H2c, &ctx)?;
            hwops.program_qid2vec_context(
                self.index_abs,
                Direction::H2c,
                &Qid2VecContext { vector: vector.unwrap_or(0), coalescing: false },
            )?;
            hwops.write_pidx(self.index_abs, Direction::H2c, 0);
        }

        match &mut self.c2h {
            Some(C2hEngine::Mm(rq)) => {
                let ring_base_phys = h2c_ring_phys(&rq.ring);
                let ctx = SwContext {
                    pidx: 0,
                    qen: true,
                    wbi_chk: true,
                    fnc_id,
                    rngsz_idx: self.config.c2h_ring_sz_index,
                    desc_sz: self.config.sw_desc_sz,
                    bypass: self.config.desc_bypass_en,
                    mm_chn: 0,
                    wbk_en: true,
                    irq_en: vector.is_some(),
                    is_mm,
                    ring_base_phys,
                    vector: vector.unwrap_or(0),
                    intr_aggr: false,
                };
                hwops.program_sw_context(self.index_abs, Direction::C2h, &ctx)?;

                if let Some(cmpt_ring) = &self.mm_cmpt_ring {
                    let cmpt_ctx = CmptContext {
                        en_stat_desc: true,
                        trig_mode: self.config.trig_mode,
                        counter_idx: self.config.c2h_th_cnt_index,
                        timer_idx: self.config.c2h_timer_cnt_index,
                        ringsz_idx: self.config.c2h_ring_sz_index,
                        ovf_chk_dis: self.config.cmpl_ovf_dis,
                        color: true,
                        pidx: 0,
                        valid: true,
                        desc_sz: self.config.cmpt_sz,
                        base_phys: cmpt_ring.phys_addr(),
                    };
                    hwops.program_cmpt_context(self.index_abs, &cmpt_ctx)?;
                    hwops.write_pidx(self.index_abs, Direction::C2h, (rq.ring.capacity() - 1) as u16);
                    hwops.write_cmpt_cidx(self.index_abs, 0);
                } else {
                    hwops.write_pidx(self.index_abs, Direction::C2h, 0);
                }
            }
            Some(C2hEngine::St(engine)) => {
                let ctx = SwContext {
                    pidx: 0,
                    qen: true,
                    wbi_chk: true,
                    fnc_id,
                    rngsz_idx: self.config.c2h_ring_sz_index,
                    desc_sz: self.config.sw_desc_sz,
                    bypass: self.config.desc_bypass_en,
                    mm_chn: 0,
                    wbk_en: true,
                    irq_en: vector.is_some(),
                    is_mm: false,
                    ring_base_phys: engine.desc_ring_phys_addr(),
                    vector: vector.unwrap_or(0),
                    intr_aggr: false,
                };
                hwops.program_sw_context(self.index_abs, Direction::C2h, &ctx)?;

                let cmpt_ctx = CmptContext {
                    en_stat_desc: true,
                    trig_mode: self.config.trig_mode,
                    counter_idx: self.config.c2h_th_cnt_index,
                    timer_idx: self.config.c2h_timer_cnt_index,
                    ringsz_idx: self.config.c2h_ring_sz_index,
                    ovf_chk_dis: self.config.cmpl_ovf_dis,
                    color: true,
                    pidx: 0,
                    valid: true,
                    desc_sz: self.config.cmpt_sz,
                    base_phys: engine.cmpt_ring_phys_addr(),
                };
                hwops.program_cmpt_context(self.index_abs, &cmpt_ctx)?;

                let pfch_ctx = PrefetchContext {
                    buf_sz_idx: self.config.c2h_buff_sz_index,
                    valid: true,
                    pfch_en: self.config.pfch_en,
                    bypass: self.config.pfch_bypass_en,
                };
                hwops.program_prefetch_context(self.index_abs, &pfch_ctx)?;

                engine.prefill_buffers();
                hwops.write_pidx(self.index_abs, Direction::C2h, engine.desc_ring_capacity() - 1);
                hwops.write_cmpt_cidx(self.index_abs, 0);
            }
            None => {}
        }

        Ok(())
    }

    /// Quiesces the queue and invalidates its hardware contexts.
    /// `Started -> Busy -> Added`. Best-effort: context-invalidation
    /// errors are logged, not propagated, so the transition always
    /// completes.
    pub fn stop(&mut self, hwops: &dyn HwOps, platform: &dyn Platform) -> Result<()> {
        self.transition(QueueState::Started, QueueState::Busy)?;

        self.wait_quiesce(hwops, platform);

        if let Some(h2c) = &mut self.h2c {
            h2c.cancel_all();
        }
        match &mut self.c2h {
            Some(C2hEngine::Mm(rq)) => rq.cancel_all(),
            Some(C2hEngine::St(engine)) => engine.cancel_all(),
            None => {}
        }

        for dir in [Direction::H2c, Direction::C2h] {
            if let Err(e) = hwops.invalidate_context(self.index_abs, dir) {
                log::warn!("qdma: queue {} failed to invalidate {:?} context on stop: {e}", self.index_abs, dir);
            }
        }

        self.vector.store(u16::MAX, Ordering::Release);
        self.notify = None;
        self.transition(QueueState::Busy, QueueState::Added)?;
        log::info!("qdma: queue {} stopped", self.index_abs);
        Ok(())
    }

    fn wait_quiesce(&self, hwops: &dyn HwOps, platform: &dyn Platform) {
        let budget = STOP_QUIESCE_US;
        let step = 2u32;
        let mut waited = 0u32;
        while waited < budget {
            let h2c_idle = hwops.read_pending_check(self.index_abs, Direction::H2c).unwrap_or(true);
            let c2h_idle = hwops.read_pending_check(self.index_abs, Direction::C2h).unwrap_or(true);
            if h2c_idle && c2h_idle {
                break;
            }
            platform.delay_us(step);
            waited += step;
        }
    }

    /// Frees rings/trackers/buffers and returns the queue to `Available`.
    pub fn remove(&mut self, hwops: &dyn HwOps) -> Result<()> {
        self.transition(QueueState::Added, QueueState::Busy)?;
        let _ = hwops.clear_context(self.index_abs, Direction::H2c);
        let _ = hwops.clear_context(self.index_abs, Direction::C2h);
        self.h2c = None;
        self.c2h = None;
        self.mm_cmpt_ring = None;
        self.transition(QueueState::Busy, QueueState::Available)?;
        log::info!("qdma: queue {} removed", self.index_abs);
        Ok(())
    }

    fn require_started(&self) -> Result<()> {
        if self.state() != QueueState::Started {
            return Err(QdmaError::InvalidState("queue must be Started to enqueue"));
        }
        Ok(())
    }

    /// `enqueue_mm_request` (§6): valid for MM queues in either direction.
    pub fn enqueue_mm_request(
        &self,
        dir: Direction,
        sg_list: Vec<SgElement>,
        device_offset: u64,
        cb: CompletionCb,
        priv_: UserPriv,
    ) -> Result<()> {
        self.require_started()?;
        if !matches!(self.kind, QueueKind::Mm) {
            return Err(QdmaError::InvalidParameter("enqueue_mm_request on a non-MM queue"));
        }
        let req = H2cRequest::new(sg_list, device_offset, cb, priv_);
        match dir {
            Direction::H2c => {
                self.h2c.as_ref().expect("Started implies h2c is Some").enqueue(req);
                self.stats.h2c_submitted.fetch_add(1, Ordering::Relaxed);
            }
            Direction::C2h => match &self.c2h {
                Some(C2hEngine::Mm(rq)) => {
                    rq.enqueue(req);
                    self.stats.c2h_submitted.fetch_add(1, Ordering::Relaxed);
                }
                _ => return Err(QdmaError::InvalidState("MM C2H completion ring not configured")),
            },
        }
        if let Some(n) = &self.notify {
            n.notify();
        }
        Ok(())
    }

    /// `enqueue_st_tx_request` (§6): ST H2C only.
    pub fn enqueue_st_tx_request(&self, sg_list: Vec<SgElement>, cb: CompletionCb, priv_: UserPriv) -> Result<()> {
        self.require_started()?;
        if !matches!(self.kind, QueueKind::St) {
            return Err(QdmaError::InvalidParameter("enqueue_st_tx_request on a non-ST queue"));
        }
        let req = H2cRequest::new(sg_list, 0, cb, priv_);
        self.h2c.as_ref().expect("Started implies h2c is Some").enqueue(req);
        self.stats.h2c_submitted.fetch_add(1, Ordering::Relaxed);
        if let Some(n) = &self.notify {
            n.notify();
        }
        Ok(())
    }

    /// `enqueue_st_rx_request` (§6): ST C2H only. `length == 0` is legal.
    pub fn enqueue_st_rx_request(&mut self, length: u32, cb: RxCompletionCb, priv_: UserPriv) -> Result<()> {
        self.require_started()?;
        match &mut self.c2h {
            Some(C2hEngine::St(engine)) => {
                engine.enqueue_rx(length, cb, priv_)?;
                self.stats.c2h_submitted.fetch_add(1, Ordering::Relaxed);
                if let Some(n) = &self.notify {
                    n.notify();
                }
                Ok(())
            }
            _ => Err(QdmaError::InvalidParameter("enqueue_st_rx_request on a non-ST queue")),
        }
    }

    /// Retrieves the UDD bytes carried by the most recently processed
    /// completion entry.
    pub fn retrieve_last_st_udd_data(&self) -> Option<Vec<u8>> {
        match &self.c2h {
            Some(C2hEngine::St(engine)) => engine.last_udd().map(|b| b.to_vec()),
            _ => None,
        }
    }

    /// Reads the next unconsumed MM completion-ring entry into `out`,
    /// valid only when `en_mm_cmpl` was set on `add()`. Returns the number
    /// of bytes copied, capped at `out.len()` and the configured `cmpt_sz`.
    pub fn read_mm_cmpt_data(&mut self, out: &mut [u8]) -> Result<usize> {
        let ring = self
            .mm_cmpt_ring
            .as_mut()
            .ok_or(QdmaError::InvalidState("MM completion ring not enabled for this queue"))?;
        ring.sync_read();
        let wb = ring.wb_status();
        let cidx = ring.hw_index();
        if cidx == wb.pidx as u32 {
            return Ok(0);
        }
        let entry = ring.entry(cidx);
        let n = entry.len().min(out.len());
        out[..n].copy_from_slice(&entry[..n]);
        ring.set_hw_index(ring.advance(cidx, 1));
        Ok(n)
    }

    /// Services the H2C direction's request FIFO and completion ring.
    pub fn service_h2c(&mut self, hwops: &dyn HwOps) -> ServiceResult {
        let index_abs = self.index_abs;
        let Some(h2c) = &mut self.h2c else {
            return ServiceResult::Finished;
        };
        let process_result = h2c.process(hwops, index_abs, Direction::H2c);
        let (service_result, completed) = match &mut h2c.ring {
            H2cRing::Mm(ring) => service_completions(ring, &mut h2c.tracker, COMPLETION_BUDGET),
            H2cRing::St(ring) => service_completions(ring, &mut h2c.tracker, COMPLETION_BUDGET),
        };
        if completed > 0 {
            self.stats.h2c_completed.fetch_add(completed as u64, Ordering::Relaxed);
        }
        combine(process_result, service_result)
    }

    /// Services the C2H direction: for MM, the same FIFO+completion model
    /// as H2C; for ST, reassembly followed by request matching (§4.4).
    pub fn service_c2h(&mut self, hwops: &dyn HwOps) -> ServiceResult {
        let index_abs = self.index_abs;
        match &mut self.c2h {
            Some(C2hEngine::Mm(rq)) => {
                let process_result = rq.process(hwops, index_abs, Direction::C2h);
                let (service_result, completed) = match &mut rq.ring {
                    H2cRing::Mm(ring) => service_completions(ring, &mut rq.tracker, COMPLETION_BUDGET),
                    H2cRing::St(ring) => service_completions(ring, &mut rq.tracker, COMPLETION_BUDGET),
                };
                if completed > 0 {
                    self.stats.c2h_completed.fetch_add(completed as u64, Ordering::Relaxed);
                }
                combine(process_result, service_result)
            }
            Some(C2hEngine::St(engine)) => {
                engine.reassemble(index_abs, hwops);
                let (result, completed) = engine.match_requests(index_abs, hwops);
                if completed > 0 {
                    self.stats.c2h_completed.fetch_add(completed as u64, Ordering::Relaxed);
                }
                result
            }
            None => ServiceResult::Finished,
        }
    }

    /// `(capacity, sw_index, hw_index, free_entries)` for each direction's
    /// ring that currently exists, for `Driver::queue_desc_dump`.
    pub fn ring_dumps(&self) -> (Option<(u32, u32, u32, u32)>, Option<(u32, u32, u32, u32)>) {
        let dump = |ring: &H2cRing| (ring.capacity(), ring.sw_index(), ring.hw_index(), ring.free_entries());
        let h2c = self.h2c.as_ref().map(|h2c| dump(&h2c.ring));
        let c2h = match &self.c2h {
            Some(C2hEngine::Mm(rq)) => Some(dump(&rq.ring)),
            Some(C2hEngine::St(engine)) => Some(engine.desc_ring_dump()),
            None => None,
        };
        (h2c, c2h)
    }
}

fn h2c_ring_phys(ring: &H2cRing) -> u64 {
    match ring {
        H2cRing::Mm(r) => r.phys_addr(),
        H2cRing::St(r) => r.phys_addr(),
    }
}

fn combine(a: ServiceResult, b: ServiceResult) -> ServiceResult {
    if a == ServiceResult::Finished && b == ServiceResult::Finished {
        ServiceResult::Finished
    } else {
        ServiceResult::Continue
    }
}
