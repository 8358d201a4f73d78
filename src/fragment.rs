//! `PacketFragmentQueue`: a bounded SPSC queue of ST-C2H packet fragments
//! awaiting request matching.
//!
//! Capacity equals the completion-ring capacity, since reassembly can
//! push at most one fragment per completion entry before request matching
//! drains it. The queue is deliberately ignorant of payload contents
//! beyond length, SOP/EOP, and the side-band UDD pointer — interpreting
//! payload is explicitly out of scope.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::error::{QdmaError, Result};

/// One reassembled fragment: a contiguous buffer delivered by a single
/// completion entry.
///
/// `udd_va` is reference-counted rather than a raw pointer: the UDD bytes
/// it refers to are extracted (and, on non-Versal IP, masked) into a
/// freshly allocated buffer at reassembly time, not read directly out of
/// the completion ring, so nothing else keeps that buffer alive across
/// the poll passes a fragment may sit queued through before request
/// matching consumes it.
#[derive(Clone, Debug)]
pub struct Fragment {
    pub data_va: *const u8,
    pub udd_va: Option<Arc<[u8]>>,
    pub length: u32,
    pub sop: bool,
    pub eop: bool,
    /// Opaque descriptor/packet-type tag carried through from the
    /// completion header, never interpreted by this crate.
    pub packet_type: u8,
}

// Fragments are plain (pointer, metadata) tuples handed off between the
// single reassembly producer and the single request-matching consumer on
// the same queue; neither thread retains a `Fragment` past that handoff.
unsafe impl Send for Fragment {}

pub struct PacketFragmentQueue {
    entries: VecDeque<Fragment>,
    capacity: usize,
    available_bytes: u64,
}

impl PacketFragmentQueue {
    pub fn new(capacity: u32) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity as usize),
            capacity: capacity as usize,
            available_bytes: 0,
        }
    }

    /// Pushes a freshly reassembled fragment. Fails with
    /// `ResourceExhausted` if the queue is at capacity, which should never
    /// happen since the completion ring that feeds this queue is bounded
    /// to the same capacity and is drained in lockstep.
    pub fn push(&mut self, fragment: Fragment) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(QdmaError::ResourceExhausted("packet fragment queue full"));
        }
        self.available_bytes += fragment.length as u64;
        self.entries.push_back(fragment);
        Ok(())
    }

    pub fn available_fragments(&self) -> usize {
        self.entries.len()
    }

    pub fn available_bytes(&self) -> u64 {
        self.available_bytes
    }

    /// Removes and returns the oldest fragment, if any.
    pub fn pop(&mut self) -> Option<Fragment> {
        let frag = self.entries.pop_front();
        if let Some(f) = &frag {
            self.available_bytes -= f.length as u64;
        }
        frag
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(length: u32, sop: bool, eop: bool) -> Fragment {
        Fragment {
            data_va: core::ptr::null(),
            udd_va: None,
            length,
            sop,
            eop,
            packet_type: 0,
        }
    }

    #[test]
    fn tracks_available_bytes_across_push_and_pop() {
        let mut q = PacketFragmentQueue::new(4);
        q.push(frag(2048, true, false)).unwrap();
        q.push(frag(2048, false, true)).unwrap();
        assert_eq!(q.available_bytes(), 4096);
        assert_eq!(q.available_fragments(), 2);
        q.pop().unwrap();
        assert_eq!(q.available_bytes(), 2048);
    }

    #[test]
    fn rejects_push_past_capacity() {
        let mut q = PacketFragmentQueue::new(1);
        q.push(frag(64, true, true)).unwrap();
        assert!(q.push(frag(64, true, true)).is_err());
    }
}
