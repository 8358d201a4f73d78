//! `RingBuffer<T>`: a fixed-capacity DMA-coherent descriptor ring with a
//! trailing writeback-status cell.
//!
//! The trailing cell lives in the same coherent allocation as the
//! descriptor array so a single DMA mapping covers both; this mirrors the
//! `AvailRing`/`UsedRing` plus explicit fence barriers used elsewhere in
//! this codebase for virtqueue access, generalized from a fixed MMIO
//! layout to an arbitrary descriptor type and capacity.

use alloc::boxed::Box;
use core::marker::PhantomData;
use core::sync::atomic::{fence, Ordering};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::dma::{DmaAllocator, DmaBuffer};
use crate::error::{QdmaError, Result};

/// Trailing writeback-status cell: the device's report of its own
/// producer/consumer indices and a wrap color bit.
#[derive(Clone, Copy, Debug, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct WbStatus {
    pub pidx: u16,
    pub cidx: u16,
    pub color: u8,
    pub irq_state: u8,
    _reserved: [u8; 2],
}

/// A descriptor or completion-entry type storable directly in a ring.
///
/// Every concrete descriptor/completion layout in this crate derives
/// the zerocopy traits so it can be read from and written into coherent
/// memory without a copy through an intermediate representation.
pub trait RingEntry: FromBytes + IntoBytes + KnownLayout + Immutable + Copy {}
impl<T: FromBytes + IntoBytes + KnownLayout + Immutable + Copy> RingEntry for T {}

/// Fixed-capacity ring of `T` plus its trailing [`WbStatus`] cell, backed
/// by one DMA-coherent allocation.
pub struct RingBuffer<T: RingEntry> {
    buf: Box<dyn DmaBuffer>,
    /// Total physical slot count; always a power of two. One slot is
    /// permanently reserved so `sw_index == hw_index` is unambiguously
    /// "empty" (invariant I2).
    capacity: u32,
    sw_index: u32,
    hw_index: u32,
    _marker: PhantomData<T>,
}

impl<T: RingEntry> RingBuffer<T> {
    /// Allocates `capacity * size_of::<T>() + size_of::<WbStatus>()` bytes
    /// of coherent memory, zeroed, aligned to 4 KiB (invariant I1).
    ///
    /// `capacity` must be a power of two; this is the total number of
    /// physical slots, of which `capacity - 1` are usable at any time.
    pub fn create(capacity: u32, allocator: &dyn DmaAllocator) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(QdmaError::InvalidParameter("ring capacity must be a nonzero power of two"));
        }
        let desc_bytes = core::mem::size_of::<T>();
        let total_len = (capacity as usize)
            .checked_mul(desc_bytes)
            .and_then(|n| n.checked_add(core::mem::size_of::<WbStatus>()))
            .ok_or(QdmaError::InvalidParameter("ring allocation size overflow"))?;

        let buf = allocator.alloc_coherent(total_len, 4096)?;

        Ok(Self {
            buf,
            capacity,
            sw_index: 0,
            hw_index: 0,
            _marker: PhantomData,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn sw_index(&self) -> u32 {
        self.sw_index
    }

    pub fn hw_index(&self) -> u32 {
        self.hw_index
    }

    pub fn set_hw_index(&mut self, idx: u32) {
        self.hw_index = idx;
    }

    /// `(hw_index - sw_index - 1) mod capacity`: free producer slots
    /// (invariant I2).
    pub fn free_entries(&self) -> u32 {
        (self.hw_index.wrapping_sub(self.sw_index).wrapping_sub(1)) % self.capacity
    }

    /// Modular advance of `idx` by `n` slots.
    pub fn advance(&self, idx: u32, n: u32) -> u32 {
        (idx + n) % self.capacity
    }

    /// Forward distance from `start` to `end`, modulo capacity.
    pub fn index_delta(&self, start: u32, end: u32) -> u32 {
        (end + self.capacity - start) % self.capacity
    }

    fn desc_ptr(&self, idx: u32) -> *const T {
        debug_assert!(idx < self.capacity);
        let byte_off = idx as usize * core::mem::size_of::<T>();
        unsafe { self.buf.as_ptr().add(byte_off) as *const T }
    }

    fn desc_mut_ptr(&mut self, idx: u32) -> *mut T {
        debug_assert!(idx < self.capacity);
        let byte_off = idx as usize * core::mem::size_of::<T>();
        unsafe { self.buf.as_mut_ptr().add(byte_off) as *mut T }
    }

    /// Writes `entry` at `idx` and advances `sw_index` by one slot.
    ///
    /// Does not itself perform the write-memory-barrier or the PIDX MMIO
    /// write (invariant I3); callers batch those once per poll pass, see
    /// [`Self::publish`].
    pub fn write_slot(&mut self, idx: u32, entry: &T) {
        unsafe { self.desc_mut_ptr(idx).write_volatile(*entry) };
        self.sw_index = self.advance(idx, 1);
    }

    /// Issues the write-memory-barrier that must precede a PIDX MMIO
    /// write, per invariant I3.
    pub fn publish(&self) {
        fence(Ordering::Release);
    }

    /// Reads the descriptor/completion entry at `idx` without advancing
    /// any index. Callers must have already issued [`Self::sync_read`].
    pub fn read_slot(&self, idx: u32) -> T {
        unsafe { self.desc_ptr(idx).read_volatile() }
    }

    /// Issues the read-memory-barrier that must precede consuming
    /// completion payload, per invariant I3.
    pub fn sync_read(&self) {
        fence(Ordering::Acquire);
    }

    /// Reads the trailing writeback-status cell. Always preceded by a
    /// read barrier since the device is the sole writer.
    pub fn wb_status(&self) -> WbStatus {
        let off = self.capacity as usize * core::mem::size_of::<T>();
        let ptr = unsafe { self.buf.as_ptr().add(off) as *const WbStatus };
        self.sync_read();
        unsafe { ptr.read_volatile() }
    }

    pub fn phys_addr(&self) -> u64 {
        self.buf.phys_addr()
    }

    /// Overwrites the trailing writeback cell directly, bypassing the
    /// device. Exists only so tests can simulate a device writing a new
    /// `cidx`/`color` without a real completion path.
    #[cfg(test)]
    pub fn test_poke_wb_status(&mut self, status: WbStatus) {
        let off = self.capacity as usize * core::mem::size_of::<T>();
        let ptr = unsafe { self.buf.as_mut_ptr().add(off) as *mut WbStatus };
        unsafe { ptr.write_volatile(status) };
    }
}

/// A ring whose entry stride is only known at runtime: the completion
/// ring's entry width varies with `cmpt_sz` (8/16/32/64 bytes), all
/// sharing a common 8-byte header with a sized tail of side-band (UDD)
/// bytes — a common header type plus a sized-tail slice, rather than the
/// inheritance hierarchy (`c2h_wb_header_8B ⊂ 16B ⊂ 32B ⊂ 64B`) this was
/// generalized from.
pub struct DynRing {
    buf: Box<dyn DmaBuffer>,
    capacity: u32,
    stride: usize,
    sw_index: u32,
    hw_index: u32,
}

impl DynRing {
    pub fn create(capacity: u32, stride: usize, allocator: &dyn DmaAllocator) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(QdmaError::InvalidParameter("ring capacity must be a nonzero power of two"));
        }
        let total_len = (capacity as usize)
            .checked_mul(stride)
            .and_then(|n| n.checked_add(core::mem::size_of::<WbStatus>()))
            .ok_or(QdmaError::InvalidParameter("ring allocation size overflow"))?;
        let buf = allocator.alloc_coherent(total_len, 4096)?;
        Ok(Self {
            buf,
            capacity,
            stride,
            sw_index: 0,
            hw_index: 0,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn sw_index(&self) -> u32 {
        self.sw_index
    }

    pub fn hw_index(&self) -> u32 {
        self.hw_index
    }

    pub fn set_sw_index(&mut self, idx: u32) {
        self.sw_index = idx;
    }

    pub fn set_hw_index(&mut self, idx: u32) {
        self.hw_index = idx;
    }

    pub fn advance(&self, idx: u32, n: u32) -> u32 {
        (idx + n) % self.capacity
    }

    pub fn index_delta(&self, start: u32, end: u32) -> u32 {
        (end + self.capacity - start) % self.capacity
    }

    /// Byte slice of the entry at `idx`: `stride` bytes, header first.
    pub fn entry(&self, idx: u32) -> &[u8] {
        debug_assert!(idx < self.capacity);
        let off = idx as usize * self.stride;
        unsafe { core::slice::from_raw_parts(self.buf.as_ptr().add(off), self.stride) }
    }

    pub fn sync_read(&self) {
        fence(Ordering::Acquire);
    }

    pub fn publish(&self) {
        fence(Ordering::Release);
    }

    pub fn wb_status(&self) -> WbStatus {
        let off = self.capacity as usize * self.stride;
        let ptr = unsafe { self.buf.as_ptr().add(off) as *const WbStatus };
        self.sync_read();
        unsafe { ptr.read_volatile() }
    }

    pub fn phys_addr(&self) -> u64 {
        self.buf.phys_addr()
    }

    /// Overwrites the entry at `idx` with raw bytes, bypassing the
    /// device. Exists only so tests can simulate a device writing a
    /// completion entry without a real completion path.
    #[cfg(test)]
    pub fn test_write_entry(&mut self, idx: u32, bytes: &[u8]) {
        debug_assert!(idx < self.capacity);
        debug_assert_eq!(bytes.len(), self.stride);
        let off = idx as usize * self.stride;
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.buf.as_mut_ptr().add(off), self.stride);
        }
    }

    /// Overwrites the trailing writeback cell directly, bypassing the
    /// device. Exists only so tests can simulate a device writing a new
    /// `pidx`/`color` without a real completion path.
    #[cfg(test)]
    pub fn test_poke_wb_status(&mut self, status: WbStatus) {
        let off = self.capacity as usize * self.stride;
        let ptr = unsafe { self.buf.as_mut_ptr().add(off) as *mut WbStatus };
        unsafe { ptr.write_volatile(status) };
    }
}
