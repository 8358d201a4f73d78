// SPDX-License-Identifier: MPL-2.0

//! `Driver`: the top-level facade a CLI/IOCTL surface (out of scope for
//! this crate) would sit on top of (§6).
//!
//! Wires together the per-function [`Function`] identity, the
//! [`ResourceManager`]'s queue-window allocation, the [`InterruptManager`],
//! the [`ThreadManager`] poll engine, and a fixed array of [`QueuePair`]s
//! behind one lock apiece, matching the source's one-array-of-queues-per-
//! function layout without the raw pointer bookkeeping. Queues and the
//! hardware vtable are held behind `Arc` so the poll ops registered with
//! [`ThreadManager`] can close over them without borrowing `Driver`.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::{DeviceCapabilities, QueueConfig, QueueKind};
use crate::dma::DmaAllocator;
use crate::error::{QdmaError, Result};
use crate::hwops::{Direction, GlobalCsr, HwOps};
use crate::intr::{InterruptManager, InterruptMode};
use crate::mmio::Mmio;
use crate::platform::{Notify, Platform};
use crate::queue::service::ServiceResult;
use crate::queue::{h2c::SgElement, QueuePair, QueueState};
use crate::registry::{DeviceRegistry, Function};
use crate::resource::ResourceManager;
use crate::thread::{PollOpId, ThreadManager};
use crate::tracker::{CompletionCb, RxCompletionCb, UserPriv};

/// Which BAR a raw `read_bar`/`write_bar` call targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarKind {
    Config,
    User,
    Bypass,
}

/// Length/presence of each BAR, for `get_bar_info`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BarInfo {
    pub config_len: usize,
    pub user_len: Option<usize>,
    pub bypass_len: Option<usize>,
}

/// Static configuration a host passes to [`Driver::init`]: BAR handles,
/// the `HwOps`/`Platform`/`DmaAllocator` trait objects, this function's
/// identity, and its queue window.
///
/// `resource` and `registry` are shared, not owned: a host managing
/// several functions of the same device (PF plus its VFs) constructs one
/// [`ResourceManager`] and one [`DeviceRegistry`] per device at driver
/// load and passes clones of the same `Arc`s into every function's
/// `Driver::init`, so window-overlap checks and function lookup span the
/// whole device rather than just one function.
pub struct DriverConfig {
    pub function_id: u16,
    pub is_master_pf: bool,
    pub mode: InterruptMode,
    pub qbase: u16,
    pub qmax: u16,
    pub resource: Arc<ResourceManager>,
    pub registry: Arc<DeviceRegistry>,
    pub user_msix_max: u16,
    pub data_msix_max: u16,
    pub hwops: Arc<dyn HwOps>,
    pub platform: Arc<dyn Platform>,
    pub allocator: Arc<dyn DmaAllocator>,
    pub config_bar: Box<dyn Mmio>,
    pub user_bar: Option<Box<dyn Mmio>>,
    pub bypass_bar: Option<Box<dyn Mmio>>,
    pub make_notify: Box<dyn Fn() -> Arc<dyn Notify>>,
}

struct RegisteredQueue {
    queue: Mutex<QueuePair>,
    h2c_op: Mutex<Option<PollOpId>>,
    c2h_op: Mutex<Option<PollOpId>>,
}

/// Per-queue, per-function counters surfaced by `get_qstats_info`.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueStatsSnapshot {
    pub h2c_submitted: u64,
    pub h2c_completed: u64,
    pub c2h_submitted: u64,
    pub c2h_completed: u64,
}

/// Point-in-time dump of a ring's index state, for `queue_desc_dump`.
#[derive(Clone, Copy, Debug)]
pub struct RingDump {
    pub capacity: u32,
    pub sw_index: u32,
    pub hw_index: u32,
    pub free_entries: u32,
}

/// The top-level driver facade (§6's Driver API): device lifecycle, raw
/// BAR access, queue lifecycle, the `enqueue_*` family, and introspection
/// calls. Framework glue (probe/attach, IRQ registration) stays on the
/// host side; this type is what that glue drives.
pub struct Driver {
    function: Arc<Function>,
    hwops: Arc<dyn HwOps>,
    platform: Arc<dyn Platform>,
    allocator: Arc<dyn DmaAllocator>,
    config_bar: Box<dyn Mmio>,
    user_bar: Option<Box<dyn Mmio>>,
    bypass_bar: Option<Box<dyn Mmio>>,
    resource: Arc<ResourceManager>,
    registry: Arc<DeviceRegistry>,
    intr: InterruptManager,
    threads: ThreadManager,
    qbase: u16,
    queues: Mutex<Vec<Arc<RegisteredQueue>>>,
}

impl Driver {
    /// Device lifecycle: registers the function's queue window and its
    /// identity record, builds the interrupt manager and poll-engine
    /// thread pool, and allocates one (empty, `Available`) [`QueuePair`]
    /// per slot in `[qbase, qbase + qmax)`. Does not bring the function
    /// online; see [`Self::open`].
    pub fn init(cfg: DriverConfig) -> Result<Self> {
        cfg.resource.register_function(cfg.function_id, cfg.qbase, cfg.qmax)?;

        let function = Arc::new(Function::new(cfg.function_id, cfg.is_master_pf, cfg.mode));
        if let Err(e) = cfg.registry.register(function.clone()) {
            cfg.resource.unregister_function(cfg.function_id);
            return Err(e);
        }

        let intr = InterruptManager::new(cfg.mode, cfg.user_msix_max, cfg.data_msix_max, cfg.allocator.as_ref())?;
        let threads = ThreadManager::new(cfg.platform.as_ref(), cfg.make_notify);
        let queues = Self::build_queues(cfg.function_id, cfg.qbase, cfg.qmax);

        Ok(Self {
            function,
            hwops: cfg.hwops,
            platform: cfg.platform,
            allocator: cfg.allocator,
            config_bar: cfg.config_bar,
            user_bar: cfg.user_bar,
            bypass_bar: cfg.bypass_bar,
            resource: cfg.resource,
            registry: cfg.registry,
            intr,
            threads,
            qbase: cfg.qbase,
            queues: Mutex::new(queues),
        })
    }

    /// Builds one (empty, `Available`) [`QueuePair`] per slot in
    /// `[qbase, qbase + qmax)`. Shared by `init` and `set_qmax`'s
    /// post-resize rebuild so the per-queue array always matches the
    /// function's live queue window.
    fn build_queues(function_id: u16, qbase: u16, qmax: u16) -> Vec<Arc<RegisteredQueue>> {
        (0..qmax)
            .map(|i| {
                Arc::new(RegisteredQueue {
                    queue: Mutex::new(QueuePair::new(i, qbase + i, alloc::format!("qdma{}qp{}", function_id, i))),
                    h2c_op: Mutex::new(None),
                    c2h_op: Mutex::new(None),
                })
            })
            .collect()
    }

    /// Programs the FMAP register for this function's queue window and
    /// transitions the function `Init/Offline -> Online`.
    pub fn open(&self) -> Result<()> {
        let (qbase, qmax) = self
            .resource
            .window(self.function.function_id)
            .ok_or(QdmaError::InvalidState("function not registered"))?;
        self.hwops.write_fmap(self.function.function_id, qbase, qmax)?;
        self.function.cache_csr(self.hwops.read_global_csr());
        self.function.go_online()
    }

    /// Stops and removes every queue still in an active state, then
    /// transitions the function `Online -> Offline` and tears down the
    /// poll-engine thread pool.
    pub fn close(&self) -> Result<()> {
        for rq in self.queues.lock().iter() {
            let state = rq.queue.lock().state();
            match state {
                QueueState::Started => {
                    self.unregister_poll_ops(rq);
                    rq.queue.lock().stop(self.hwops.as_ref(), self.platform.as_ref())?;
                    rq.queue.lock().remove(self.hwops.as_ref())?;
                }
                QueueState::Added => {
                    rq.queue.lock().remove(self.hwops.as_ref())?;
                }
                _ => {}
            }
        }
        self.function.go_offline()?;
        self.threads.shutdown();
        Ok(())
    }

    pub fn is_queue_in_range(&self, qid: u16) -> bool {
        self.index_of(qid).is_some()
    }

    /// Range check driven off the *live* per-queue array rather than a
    /// value fixed at `init` time: `set_qmax` rebuilds that array to span
    /// the resized `[qbase, qbase + qmax)` window, so this tracks grows
    /// and shrinks alike.
    fn index_of(&self, qid: u16) -> Option<usize> {
        let idx = qid.checked_sub(self.qbase)?;
        if (idx as usize) < self.queues.lock().len() {
            Some(idx as usize)
        } else {
            None
        }
    }

    fn queue(&self, qid: u16) -> Result<Arc<RegisteredQueue>> {
        let idx = self
            .index_of(qid)
            .ok_or(QdmaError::InvalidParameter("qid out of this function's range"))?;
        self.queues
            .lock()
            .get(idx)
            .cloned()
            .ok_or(QdmaError::InvalidParameter("qid out of this function's range"))
    }

    pub fn get_queues_state(&self, qid: u16) -> Result<QueueState> {
        Ok(self.queue(qid)?.queue.lock().state())
    }

    /// `add_queue` (§6): allocates rings/trackers/buffers and clears HW
    /// contexts. `Available -> Added`.
    pub fn add_queue(&self, qid: u16, config: QueueConfig) -> Result<()> {
        let rq = self.queue(qid)?;
        let cmpt = matches!(config.kind, QueueKind::St) || config.en_mm_cmpl;
        rq.queue.lock().add(config, self.hwops.as_ref(), self.allocator.as_ref())?;
        self.resource.adjust_active(self.function.function_id, cmpt, 1)
    }

    /// `start_queue` (§6): assigns an interrupt vector (skipped in Poll
    /// mode), registers the direction poll ops with the thread manager,
    /// and programs HW contexts. `Added -> Started`.
    pub fn start_queue(&self, qid: u16) -> Result<()> {
        let rq = self.queue(qid)?.clone();
        let vector = self.intr.assign(qid);

        let h2c_for_notify = rq.clone();
        let c2h_for_notify = rq.clone();
        let hwops_h2c = self.hwops.clone();
        let hwops_c2h = self.hwops.clone();
        let h2c_op: crate::thread::PollOp = Box::new(move || {
            matches!(h2c_for_notify.queue.lock().service_h2c(hwops_h2c.as_ref()), ServiceResult::Continue)
        });
        let c2h_op: crate::thread::PollOp = Box::new(move || {
            matches!(c2h_for_notify.queue.lock().service_c2h(hwops_c2h.as_ref()), ServiceResult::Continue)
        });
        let (h2c_id, c2h_id, notify) = self.threads.register_paired(h2c_op, c2h_op);

        let result = rq.queue.lock().start(self.hwops.as_ref(), self.function.function_id, vector, notify);
        match result {
            Ok(()) => {
                *rq.h2c_op.lock() = Some(h2c_id);
                *rq.c2h_op.lock() = Some(c2h_id);
                Ok(())
            }
            Err(e) => {
                self.threads.unregister(h2c_id);
                self.threads.unregister(c2h_id);
                if let Some(v) = vector {
                    self.intr.release(v);
                }
                Err(e)
            }
        }
    }

    fn unregister_poll_ops(&self, rq: &RegisteredQueue) {
        if let Some(id) = rq.h2c_op.lock().take() {
            self.threads.unregister(id);
        }
        if let Some(id) = rq.c2h_op.lock().take() {
            self.threads.unregister(id);
        }
    }

    /// `stop_queue` (§6): quiesces the queue, cancels pending requests
    /// with [`QdmaError::Cancelled`], invalidates HW contexts, and
    /// releases the interrupt vector. `Started -> Added`.
    pub fn stop_queue(&self, qid: u16) -> Result<()> {
        let rq = self.queue(qid)?;
        let vector = rq.queue.lock().vector();
        self.unregister_poll_ops(&rq);
        rq.queue.lock().stop(self.hwops.as_ref(), self.platform.as_ref())?;
        if let Some(v) = vector {
            self.intr.release(v);
        }
        Ok(())
    }

    /// `remove_queue` (§6): frees rings/trackers/buffers and decrements
    /// resource counters. `Added -> Available`.
    pub fn remove_queue(&self, qid: u16) -> Result<()> {
        let rq = self.queue(qid)?;
        let cmpt = matches!(rq.queue.lock().kind, QueueKind::St);
        rq.queue.lock().remove(self.hwops.as_ref())?;
        self.resource.adjust_active(self.function.function_id, cmpt, -1)
    }

    pub fn enqueue_mm_request(
        &self,
        qid: u16,
        dir: Direction,
        sg_list: Vec<SgElement>,
        device_offset: u64,
        cb: CompletionCb,
        priv_: UserPriv,
    ) -> Result<()> {
        self.queue(qid)?.queue.lock().enqueue_mm_request(dir, sg_list, device_offset, cb, priv_)
    }

    pub fn enqueue_st_tx_request(&self, qid: u16, sg_list: Vec<SgElement>, cb: CompletionCb, priv_: UserPriv) -> Result<()> {
        self.queue(qid)?.queue.lock().enqueue_st_tx_request(sg_list, cb, priv_)
    }

    /// `enqueue_st_rx_request` (§6): `length == 0` is legal.
    pub fn enqueue_st_rx_request(&self, qid: u16, length: u32, cb: RxCompletionCb, priv_: UserPriv) -> Result<()> {
        self.queue(qid)?.queue.lock().enqueue_st_rx_request(length, cb, priv_)
    }

    /// `retrieve_st_udd_data` (§6): parses UDD bytes out of a raw
    /// completion entry the caller has already read (e.g. from
    /// `queue_desc_dump`), applying the same non-Versal-mask /
    /// Versal-skip rule `StC2hEngine::reassemble` uses internally.
    pub fn retrieve_st_udd_data(&self, _qid: u16, cmpt_entry: &[u8], versal_hard_ip: bool, out: &mut [u8]) -> Result<usize> {
        let udd = crate::queue::c2h::extract_udd(cmpt_entry, versal_hard_ip);
        let n = udd.len().min(out.len());
        out[..n].copy_from_slice(&udd[..n]);
        Ok(n)
    }

    /// `retrieve_last_st_udd_data` (§6): the UDD bytes carried by the
    /// most recently reassembled completion entry on this queue.
    pub fn retrieve_last_st_udd_data(&self, qid: u16, out: &mut [u8]) -> Result<usize> {
        let q = self.queue(qid)?.queue.lock();
        let Some(udd) = q.retrieve_last_st_udd_data() else {
            return Ok(0);
        };
        let n = udd.len().min(out.len());
        out[..n].copy_from_slice(&udd[..n]);
        Ok(n)
    }

    /// `read_mm_cmpt_data` (§6): valid only if the MM completion ring was
    /// enabled in both HW capability and `QueueConfig::en_mm_cmpl`.
    pub fn read_mm_cmpt_data(&self, qid: u16, out: &mut [u8]) -> Result<usize> {
        self.queue(qid)?.queue.lock().read_mm_cmpt_data(out)
    }

    pub fn get_qstats_info(&self, qid: u16) -> Result<QueueStatsSnapshot> {
        use core::sync::atomic::Ordering;
        let q = self.queue(qid)?.queue.lock();
        Ok(QueueStatsSnapshot {
            h2c_submitted: q.stats.h2c_submitted.load(Ordering::Relaxed),
            h2c_completed: q.stats.h2c_completed.load(Ordering::Relaxed),
            c2h_submitted: q.stats.c2h_submitted.load(Ordering::Relaxed),
            c2h_completed: q.stats.c2h_completed.load(Ordering::Relaxed),
        })
    }

    pub fn device_version_info(&self) -> u32 {
        self.hwops.device_version()
    }

    pub fn get_dev_capabilities_info(&self) -> DeviceCapabilities {
        self.hwops.device_capabilities()
    }

    pub fn read_csr_conf(&self) -> GlobalCsr {
        self.function.cached_csr().unwrap_or_else(|| self.hwops.read_global_csr())
    }

    /// `intring_dump` (§6): current read position of the coalescing ring
    /// behind `vector`, `None` outside `CoalescedIrq` mode.
    pub fn intring_dump(&self, vector: u16) -> Option<u32> {
        self.intr.coalescing_ring_cidx(vector)
    }

    pub fn get_bar_info(&self) -> BarInfo {
        BarInfo {
            config_len: self.config_bar.len(),
            user_len: self.user_bar.as_ref().map(|b| b.len()),
            bypass_len: self.bypass_bar.as_ref().map(|b| b.len()),
        }
    }

    fn bar(&self, which: BarKind) -> Result<&dyn Mmio> {
        match which {
            BarKind::Config => Ok(self.config_bar.as_ref()),
            BarKind::User => self
                .user_bar
                .as_deref()
                .ok_or(QdmaError::NotSupported("user BAR not mapped")),
            BarKind::Bypass => self
                .bypass_bar
                .as_deref()
                .ok_or(QdmaError::NotSupported("bypass BAR not mapped")),
        }
    }

    pub fn read_bar(&self, which: BarKind, offset: usize) -> Result<u32> {
        let bar = self.bar(which)?;
        if offset + 4 > bar.len() {
            return Err(QdmaError::InvalidParameter("BAR read out of range"));
        }
        Ok(bar.read32(offset))
    }

    pub fn write_bar(&self, which: BarKind, offset: usize, value: u32) -> Result<()> {
        let bar = self.bar(which)?;
        if offset + 4 > bar.len() {
            return Err(QdmaError::InvalidParameter("BAR write out of range"));
        }
        bar.write32(offset, value);
        Ok(())
    }

    /// `get_reg_info`/`regdump` (§6): a raw dump of `len` bytes (as
    /// 32-bit words) from the config BAR starting at `offset`, for
    /// diagnostic tooling.
    pub fn regdump(&self, offset: usize, len: usize) -> Vec<u32> {
        let words = len / 4;
        (0..words).map(|i| self.config_bar.read32(offset + i * 4)).collect()
    }

    /// `queue_desc_dump` (§6): a point-in-time snapshot of a ring's index
    /// state. Returns `(h2c, c2h)`, either side `None` if that direction
    /// has no ring (only an un-`add`ed queue returns `(None, None)`).
    pub fn queue_desc_dump(&self, qid: u16) -> Result<(Option<RingDump>, Option<RingDump>)> {
        let q = self.queue(qid)?.queue.lock();
        let to_dump = |t: (u32, u32, u32, u32)| RingDump {
            capacity: t.0,
            sw_index: t.1,
            hw_index: t.2,
            free_entries: t.3,
        };
        let (h2c, c2h) = q.ring_dumps();
        Ok((h2c.map(to_dump), c2h.map(to_dump)))
    }

    /// `queue_dump_context` (§6): a textual summary of the queue's
    /// identity and state, since the underlying HW context fields live
    /// behind the opaque `HwOps` vtable and are not independently
    /// readable back by this crate.
    pub fn queue_dump_context(&self, qid: u16) -> Result<String> {
        let q = self.queue(qid)?.queue.lock();
        Ok(alloc::format!(
            "qid={} kind={:?} state={:?} vector={:?}",
            q.index_abs,
            q.kind,
            q.state(),
            q.vector()
        ))
    }

    /// `set_qmax` (§6/§4.10): offlines the function, updates its window,
    /// re-applies FMAP, rebuilds the per-queue array to the new window,
    /// and comes back online. Fails without touching state if the
    /// function has any active queue.
    ///
    /// `dev_update` rejects the resize while any queue in `[qbase,
    /// qbase + qmax)` is outside `Available` (§4.10's active-queue
    /// counters are incremented by `add_queue` and only decremented by
    /// `remove_queue`), so every `RegisteredQueue` is safely replaceable
    /// once it succeeds — there is no in-flight state in the old array
    /// worth preserving.
    pub fn set_qmax(&self, new_qmax: u16) -> Result<()> {
        self.function.go_offline()?;
        let result = self.resource.dev_update(self.function.function_id, new_qmax).and_then(|()| {
            let (qbase, qmax) = self.resource.window(self.function.function_id).expect("just updated");
            self.hwops.write_fmap(self.function.function_id, qbase, qmax)
        });
        if result.is_ok() {
            *self.queues.lock() = Self::build_queues(self.function.function_id, self.qbase, new_qmax);
        }
        // Best effort: come back online regardless of whether the update
        // itself succeeded, so a rejected resize leaves the function in
        // the same operable state it started in.
        let _ = self.function.go_online();
        result
    }
}

/// Driver unload: releases this function's queue window and identity
/// record from the shared `ResourceManager`/`DeviceRegistry` so another
/// `Driver::init` for the same `function_id` (or a future reload of this
/// one) can register again. `open`/`close` only toggle online/offline
/// state and leave both registrations intact, so a function can be
/// closed and reopened without losing its window.
impl Drop for Driver {
    fn drop(&mut self) {
        self.resource.unregister_function(self.function.function_id);
        self.registry.unregister(self.function.function_id);
    }
}
