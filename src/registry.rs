// SPDX-License-Identifier: MPL-2.0

//! `DeviceRegistry`/`Function` (§3's Device/Function entity).
//!
//! Centralizes what the source holds as global singletons
//! (`qdma_dev_list_head`, `qdma_active_pf_count`) into a single value
//! with compare-exchange-based registration, replacing "first PF wins
//! by racing" per §9's design notes.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use crate::error::{QdmaError, Result};
use crate::hwops::GlobalCsr;
use crate::intr::InterruptMode;

/// Device-wide lifecycle state, gating `open()`/`close()`/`set_qmax`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    Init = 0,
    Online = 1,
    Offline = 2,
}

impl DeviceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => DeviceState::Init,
            1 => DeviceState::Online,
            _ => DeviceState::Offline,
        }
    }
}

/// One PCIe function's identity and device-wide state (§3 Device/Function).
/// BAR handles, `HwOps`, and per-queue state live on [`crate::driver::Driver`];
/// this type is the lifecycle/identity record the driver registers and
/// checks against.
pub struct Function {
    pub function_id: u16,
    pub is_master_pf: bool,
    pub mode: InterruptMode,
    state: AtomicU8,
    csr: Mutex<Option<GlobalCsr>>,
}

impl Function {
    pub fn new(function_id: u16, is_master_pf: bool, mode: InterruptMode) -> Self {
        Self {
            function_id,
            is_master_pf,
            mode,
            state: AtomicU8::new(DeviceState::Init as u8),
            csr: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn cache_csr(&self, csr: GlobalCsr) {
        *self.csr.lock() = Some(csr);
    }

    pub fn cached_csr(&self) -> Option<GlobalCsr> {
        *self.csr.lock()
    }

    /// `Init/Offline -> Online`, used by `open()` and the final step of
    /// `set_qmax`.
    pub fn go_online(&self) -> Result<()> {
        if self.state() == DeviceState::Online {
            return Err(QdmaError::InvalidState("function already online"));
        }
        self.state.store(DeviceState::Online as u8, Ordering::Release);
        Ok(())
    }

    /// `Online -> Offline`, used by `close()` and the first step of
    /// `set_qmax`.
    pub fn go_offline(&self) -> Result<()> {
        if self.state() != DeviceState::Online {
            return Err(QdmaError::InvalidState("function is not online"));
        }
        self.state.store(DeviceState::Offline as u8, Ordering::Release);
        Ok(())
    }
}

/// Process-wide registry of known functions, behind one lock.
pub struct DeviceRegistry {
    functions: Mutex<BTreeMap<u16, Arc<Function>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self { functions: Mutex::new(BTreeMap::new()) }
    }

    /// Registers `function`, failing if its `function_id` is already
    /// present. The single lock makes this a true compare-and-insert,
    /// unlike the source's unsynchronized global list insertion.
    pub fn register(&self, function: Arc<Function>) -> Result<()> {
        let mut functions = self.functions.lock();
        if functions.contains_key(&function.function_id) {
            return Err(QdmaError::InvalidState("function id already registered"));
        }
        functions.insert(function.function_id, function);
        Ok(())
    }

    pub fn unregister(&self, function_id: u16) -> Option<Arc<Function>> {
        self.functions.lock().remove(&function_id)
    }

    pub fn get(&self, function_id: u16) -> Option<Arc<Function>> {
        self.functions.lock().get(&function_id).cloned()
    }

    pub fn master_pf(&self) -> Option<Arc<Function>> {
        self.functions.lock().values().find(|f| f.is_master_pf).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_duplicate_function_id() {
        let registry = DeviceRegistry::new();
        registry.register(Arc::new(Function::new(0, true, InterruptMode::Poll))).unwrap();
        assert!(registry.register(Arc::new(Function::new(0, false, InterruptMode::Poll))).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn function_lifecycle_rejects_out_of_order_transitions() {
        let f = Function::new(0, true, InterruptMode::Poll);
        assert!(f.go_offline().is_err());
        f.go_online().unwrap();
        assert!(f.go_online().is_err());
        f.go_offline().unwrap();
        assert_eq!(f.state(), DeviceState::Offline);
    }

    #[test]
    fn master_pf_lookup_finds_the_right_function() {
        let registry = DeviceRegistry::new();
        registry.register(Arc::new(Function::new(0, false, InterruptMode::Poll))).unwrap();
        registry.register(Arc::new(Function::new(1, true, InterruptMode::Poll))).unwrap();
        assert_eq!(registry.master_pf().unwrap().function_id, 1);
    }
}
