//! Raw MMIO capability consumed by the core.
//!
//! BAR mapping itself is framework glue and stays out of this crate; the
//! core only needs to read and write fixed-width values at a byte offset
//! within a BAR once it has been mapped by the host.

/// A single memory-mapped I/O region (one PCI BAR).
///
/// Implementors back this with a real mapping (`ioremap`-equivalent) on a
/// live device, or an in-memory buffer in tests.
pub trait Mmio: Send + Sync {
    /// Reads a 32-bit register at `offset` bytes from the BAR's base.
    fn read32(&self, offset: usize) -> u32;

    /// Writes a 32-bit register at `offset` bytes from the BAR's base.
    fn write32(&self, offset: usize, value: u32);

    /// Reads a 64-bit register at `offset` bytes from the BAR's base.
    ///
    /// The default implementation performs two 32-bit accesses (low word
    /// first), which is correct for registers documented as safe to split;
    /// callers needing an atomic 64-bit access should override this.
    fn read64(&self, offset: usize) -> u64 {
        let lo = self.read32(offset) as u64;
        let hi = self.read32(offset + 4) as u64;
        lo | (hi << 32)
    }

    /// Writes a 64-bit register at `offset` bytes from the BAR's base.
    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }

    /// Total length of this BAR in bytes, for bounds-checked pass-through
    /// access (`read_bar`/`write_bar`).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
