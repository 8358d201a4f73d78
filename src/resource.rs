// SPDX-License-Identifier: MPL-2.0

//! `ResourceManager` (C10): process-wide QID allocator per function, with
//! a master `(qbase=0, qmax=TOTAL_Q)` record and per-function
//! sub-allocations (§3 Global Resource, §4.10).
//!
//! Centralizes what the source tracks as a loose global plus per-function
//! counters into a single value guarded by one mutex, matching §5's
//! "acquisition is under a single process-wide mutex".

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::error::{QdmaError, Result};

/// Per-function active-queue counters gating `dev_update`/`set_qmax`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FunctionActiveCounts {
    pub h2c_active: u32,
    pub c2h_active: u32,
    pub cmpt_active: u32,
}

impl FunctionActiveCounts {
    pub fn total(&self) -> u32 {
        self.h2c_active + self.c2h_active + self.cmpt_active
    }
}

#[derive(Clone, Copy, Debug)]
struct FunctionWindow {
    qbase: u16,
    qmax: u16,
    active: FunctionActiveCounts,
}

struct Inner {
    total_q: u16,
    functions: BTreeMap<u16, FunctionWindow>,
}

/// Master record per PCIe bus range (`qbase=0, qmax=TOTAL_Q`) plus
/// per-function sub-allocations.
pub struct ResourceManager {
    inner: Mutex<Inner>,
}

impl ResourceManager {
    pub fn new(total_q: u16) -> Self {
        Self {
            inner: Mutex::new(Inner { total_q, functions: BTreeMap::new() }),
        }
    }

    pub fn total_q(&self) -> u16 {
        self.inner.lock().total_q
    }

    /// Registers `function_id`'s `(qbase, qmax)` window, failing if it
    /// overflows the device's `total_q` or overlaps another function's
    /// window.
    pub fn register_function(&self, function_id: u16, qbase: u16, qmax: u16) -> Result<()> {
        let mut inner = self.inner.lock();
        if qbase as u32 + qmax as u32 > inner.total_q as u32 {
            return Err(QdmaError::ResourceExhausted("function queue window exceeds device qmax"));
        }
        for (other_id, window) in inner.functions.iter() {
            if *other_id == function_id {
                continue;
            }
            let overlaps = (qbase as u32) < (window.qbase as u32 + window.qmax as u32)
                && (window.qbase as u32) < (qbase as u32 + qmax as u32);
            if overlaps {
                return Err(QdmaError::ResourceExhausted("function queue window overlaps another function"));
            }
        }
        inner.functions.insert(function_id, FunctionWindow { qbase, qmax, active: FunctionActiveCounts::default() });
        Ok(())
    }

    pub fn unregister_function(&self, function_id: u16) {
        self.inner.lock().functions.remove(&function_id);
    }

    pub fn window(&self, function_id: u16) -> Option<(u16, u16)> {
        self.inner.lock().functions.get(&function_id).map(|w| (w.qbase, w.qmax))
    }

    pub fn active_counts(&self, function_id: u16) -> FunctionActiveCounts {
        self.inner.lock().functions.get(&function_id).map(|w| w.active).unwrap_or_default()
    }

    /// Keeps the per-function counters in step with queue lifecycle
    /// (§4.6: "increment resource-manager active-queue counters" on
    /// `add()`, "decrement resource counters" on `remove()`). `delta` is
    /// `+1`/`-1`; `cmpt` additionally adjusts `cmpt_active` when the
    /// queue has a completion ring enabled.
    pub fn adjust_active(&self, function_id: u16, cmpt: bool, delta: i32) -> Result<()> {
        let mut inner = self.inner.lock();
        let window = inner
            .functions
            .get_mut(&function_id)
            .ok_or(QdmaError::InvalidParameter("unknown function id"))?;
        let step = |counter: &mut u32| {
            if delta >= 0 {
                *counter += delta as u32;
            } else {
                *counter = counter.saturating_sub((-delta) as u32);
            }
        };
        step(&mut window.active.h2c_active);
        step(&mut window.active.c2h_active);
        if cmpt {
            step(&mut window.active.cmpt_active);
        }
        Ok(())
    }

    /// `dev_update` (§4.10): fails if the function has any active
    /// queues, or if the new window would overflow `total_q`.
    pub fn dev_update(&self, function_id: u16, new_qmax: u16) -> Result<()> {
        let mut inner = self.inner.lock();
        let total_q = inner.total_q;
        let window = inner
            .functions
            .get_mut(&function_id)
            .ok_or(QdmaError::InvalidParameter("unknown function id"))?;
        if window.active.total() > 0 {
            return Err(QdmaError::ResourceExhausted("function has active queues"));
        }
        if window.qbase as u32 + new_qmax as u32 > total_q as u32 {
            return Err(QdmaError::ResourceExhausted("requested qmax exceeds device capacity"));
        }
        window.qmax = new_qmax;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_overlapping_windows() {
        let rm = ResourceManager::new(16);
        rm.register_function(0, 0, 8).unwrap();
        assert!(rm.register_function(1, 4, 8).is_err());
        assert!(rm.register_function(1, 8, 8).is_ok());
    }

    #[test]
    fn dev_update_blocked_by_active_queues() {
        let rm = ResourceManager::new(16);
        rm.register_function(0, 0, 4).unwrap();
        for _ in 0..4 {
            rm.adjust_active(0, false, 1).unwrap();
        }
        let before = rm.window(0).unwrap();
        assert!(rm.dev_update(0, 2).is_err());
        assert_eq!(rm.window(0).unwrap(), before);

        for _ in 0..4 {
            rm.adjust_active(0, false, -1).unwrap();
        }
        assert!(rm.dev_update(0, 2).is_ok());
        assert_eq!(rm.window(0).unwrap(), (0, 2));
    }

    #[test]
    fn dev_update_rejects_window_overflow() {
        let rm = ResourceManager::new(8);
        rm.register_function(0, 0, 4).unwrap();
        assert!(rm.dev_update(0, 16).is_err());
    }
}
