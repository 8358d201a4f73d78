//! `HwOps`: the abstract device-register vtable.
//!
//! Vendor register-layout tables are out of scope for this crate; every
//! concrete register offset and bitfield shape lives behind an
//! implementation of this trait, one per IP family, the same role
//! `qdma_get_hw_access` plays in the source this was distilled from, but
//! expressed as a borrow of a trait object rather than a C vtable.

use crate::config::{CmptSize, DescSize, TrigMode};
use crate::error::Result;

/// Direction of a DMA ring relative to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    H2c,
    C2h,
}

/// Software-context fields programmed on queue start, one per direction.
#[derive(Clone, Copy, Debug)]
pub struct SwContext {
    pub pidx: u16,
    pub qen: bool,
    pub wbi_chk: bool,
    pub fnc_id: u16,
    pub rngsz_idx: u8,
    pub desc_sz: DescSize,
    pub bypass: bool,
    pub mm_chn: u8,
    pub wbk_en: bool,
    pub irq_en: bool,
    pub is_mm: bool,
    pub ring_base_phys: u64,
    pub vector: u16,
    pub intr_aggr: bool,
}

/// Per-direction qid-to-vector context, only present on devices whose
/// `HwOps` exposes it.
#[derive(Clone, Copy, Debug)]
pub struct Qid2VecContext {
    pub vector: u16,
    pub coalescing: bool,
}

/// Completion (CMPT) ring context.
#[derive(Clone, Copy, Debug)]
pub struct CmptContext {
    pub en_stat_desc: bool,
    pub trig_mode: TrigMode,
    pub counter_idx: u8,
    pub timer_idx: u8,
    pub ringsz_idx: u8,
    pub ovf_chk_dis: bool,
    pub color: bool,
    pub pidx: u16,
    pub valid: bool,
    pub desc_sz: CmptSize,
    pub base_phys: u64,
}

/// ST-C2H prefetch context.
#[derive(Clone, Copy, Debug)]
pub struct PrefetchContext {
    pub buf_sz_idx: u8,
    pub valid: bool,
    pub pfch_en: bool,
    pub bypass: bool,
}

/// The 16-entry CSR tables shared by all queues on the device.
#[derive(Clone, Copy, Debug)]
pub struct GlobalCsr {
    pub ring_size: [u32; 16],
    pub c2h_timer_count: [u32; 16],
    pub c2h_threshold_count: [u32; 16],
    pub c2h_buf_size: [u32; 16],
    pub writeback_interval: u32,
}

/// Abstract device-register operations.
///
/// Implementations are expected to serialize multi-register indirect
/// context accesses themselves or rely on the caller holding the
/// process-wide register-access lock described in the concurrency model;
/// this crate's queue code always calls through while holding that lock.
pub trait HwOps: Send + Sync {
    /// Programs the software context for `qid`/`dir`. Fails with
    /// [`crate::error::QdmaError::HardwareError`] if the indirect-context
    /// write does not read back as programmed.
    fn program_sw_context(&self, qid: u16, dir: Direction, ctx: &SwContext) -> Result<()>;

    /// Programs the qid2vec context, if this IP family exposes one.
    fn program_qid2vec_context(&self, qid: u16, dir: Direction, ctx: &Qid2VecContext) -> Result<()>;

    /// Programs the completion-ring context.
    fn program_cmpt_context(&self, qid: u16, ctx: &CmptContext) -> Result<()>;

    /// Programs the ST-C2H prefetch context.
    fn program_prefetch_context(&self, qid: u16, ctx: &PrefetchContext) -> Result<()>;

    /// Clears (zeroes) the named context without marking it invalid; used
    /// during rollback of a failed `start()` and during `add()` before
    /// first programming.
    fn clear_context(&self, qid: u16, dir: Direction) -> Result<()>;

    /// Invalidates the named context so the device may no longer touch
    /// the ring; used on `stop()`/`remove()`. Distinct from `clear` per
    /// the design notes: invalidation is a stronger guarantee than zero.
    fn invalidate_context(&self, qid: u16, dir: Direction) -> Result<()>;

    /// Writes the producer index doorbell for `qid`/`dir`.
    fn write_pidx(&self, qid: u16, dir: Direction, pidx: u16);

    /// Writes the completion-ring consumer index doorbell for `qid`.
    fn write_cmpt_cidx(&self, qid: u16, cidx: u16);

    /// Writes the consumer index doorbell for the coalescing ring behind
    /// `vector`, used only in CoalescedIrq mode (§4.7).
    fn write_intr_cidx(&self, vector: u16, cidx: u16);

    /// Writes the FMAP register (per-function `qbase`/`qmax` window).
    fn write_fmap(&self, function_id: u16, qbase: u16, qmax: u16) -> Result<()>;

    /// Reads the device's global CSR tables.
    fn read_global_csr(&self) -> GlobalCsr;

    /// Reads the device's advertised capability bits.
    fn device_capabilities(&self) -> crate::config::DeviceCapabilities;

    /// Reads a vendor-defined version/revision identifier.
    fn device_version(&self) -> u32;

    /// Polls the ST-C2H "all descriptors consumed" indirect-context bit
    /// used to shorten the deterministic stop-quiesce wait. Returns
    /// `None` on hardware that does not expose the bit, in which case the
    /// caller falls back to the plain timed wait.
    fn read_pending_check(&self, qid: u16, dir: Direction) -> Option<bool>;

    /// Masks (`mask = true`) or unmasks the MSI-X table entry for
    /// `vector` at offset `0x2000`, stride `0x0c`, bit 0.
    fn set_msix_mask(&self, vector: u16, mask: bool);
}
