//! The `queue_config` surface and device capability bits.

use bitflags::bitflags;

use crate::error::{QdmaError, Result};

bitflags! {
    /// Feature bits reported by the device, gating which `QueueConfig`
    /// options are legal to request.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceCapabilities: u32 {
        /// Streaming (ST) traffic is supported.
        const ST = 1 << 0;
        /// Memory-mapped (MM) traffic is supported.
        const MM = 1 << 1;
        /// Descriptor bypass mode is available.
        const DESC_BYPASS = 1 << 2;
        /// ST-C2H prefetch is available.
        const PREFETCH = 1 << 3;
        /// Prefetch bypass is available.
        const PREFETCH_BYPASS = 1 << 4;
        /// MM completion (CMPT) ring is available.
        const MM_CMPT = 1 << 5;
        /// 64-byte descriptors are available (bypass-only designs).
        const DESC_64B = 1 << 6;
        /// `UserTimerCount` trigger mode is available.
        const TRIG_USER_TIMER_COUNT = 1 << 7;
        /// Completion-overflow-disable is available.
        const CMPL_OVF_DIS = 1 << 8;
    }
}

/// When the device fires a completion notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrigMode {
    Disable,
    Every,
    UserCount,
    User,
    UserTimer,
    UserTimerCount,
}

/// Queue traffic shape: streaming or memory-mapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Mm,
    St,
}

/// Completion-entry width, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmptSize {
    Bytes8,
    Bytes16,
    Bytes32,
    Bytes64,
}

impl CmptSize {
    pub fn as_bytes(self) -> usize {
        match self {
            CmptSize::Bytes8 => 8,
            CmptSize::Bytes16 => 16,
            CmptSize::Bytes32 => 32,
            CmptSize::Bytes64 => 64,
        }
    }
}

/// Descriptor width, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescSize {
    Bytes8,
    Bytes16,
    Bytes32,
    Bytes64,
}

impl DescSize {
    pub fn as_bytes(self) -> usize {
        match self {
            DescSize::Bytes8 => 8,
            DescSize::Bytes16 => 16,
            DescSize::Bytes32 => 32,
            DescSize::Bytes64 => 64,
        }
    }
}

/// Per-queue configuration passed to `add_queue`.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub kind: QueueKind,
    pub h2c_ring_sz_index: u8,
    pub c2h_ring_sz_index: u8,
    pub c2h_buff_sz_index: u8,
    pub c2h_th_cnt_index: u8,
    pub c2h_timer_cnt_index: u8,
    pub cmpt_sz: CmptSize,
    pub trig_mode: TrigMode,
    pub sw_desc_sz: DescSize,
    pub desc_bypass_en: bool,
    pub pfch_en: bool,
    pub pfch_bypass_en: bool,
    pub cmpl_ovf_dis: bool,
    pub en_mm_cmpl: bool,
    /// Number of PIDX-bearing descriptors to accumulate before the H2C
    /// (and MM-C2H) side rings the PIDX doorbell, generalizing the
    /// ST-C2H side's fixed `C2H_PIDX_BATCH` to a per-queue, configurable
    /// write-combine knob. Must be `>= 1`; the default of `1` rings the
    /// doorbell at the end of every service pass with outstanding
    /// descriptors, i.e. unbatched.
    pub pidx_batch_threshold: u32,
    /// Selects the UDD byte layout for this queue's completion entries:
    /// non-Versal IP masks the low nibble of byte 0 (shared with the
    /// color/error/desc-used flags), Versal hard IP reserves a disjoint
    /// 3-byte header and UDD starts at byte 3 (§6).
    pub versal_hard_ip: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: QueueKind::Mm,
            h2c_ring_sz_index: 0,
            c2h_ring_sz_index: 0,
            c2h_buff_sz_index: 0,
            c2h_th_cnt_index: 0,
            c2h_timer_cnt_index: 0,
            cmpt_sz: CmptSize::Bytes8,
            trig_mode: TrigMode::Every,
            sw_desc_sz: DescSize::Bytes32,
            desc_bypass_en: false,
            pfch_en: false,
            pfch_bypass_en: false,
            cmpl_ovf_dis: false,
            en_mm_cmpl: false,
            pidx_batch_threshold: 1,
            versal_hard_ip: false,
        }
    }
}

impl QueueConfig {
    /// Validates this configuration against the device's advertised
    /// capability bits, per §4.6's `add()` capability checks.
    pub fn validate(&self, caps: DeviceCapabilities) -> Result<()> {
        match self.kind {
            QueueKind::St if !caps.contains(DeviceCapabilities::ST) => {
                return Err(QdmaError::NotSupported("ST traffic not supported by device"));
            }
            QueueKind::Mm if !caps.contains(DeviceCapabilities::MM) => {
                return Err(QdmaError::NotSupported("MM traffic not supported by device"));
            }
            _ => {}
        }

        if self.h2c_ring_sz_index > 15 || self.c2h_ring_sz_index > 15 {
            return Err(QdmaError::InvalidParameter("ring size index out of range 0..=15"));
        }

        if self.pidx_batch_threshold == 0 {
            return Err(QdmaError::InvalidParameter("pidx_batch_threshold must be >= 1"));
        }

        if self.desc_bypass_en && !caps.contains(DeviceCapabilities::DESC_BYPASS) {
            return Err(QdmaError::NotSupported("descriptor bypass not supported by device"));
        }

        if matches!(self.sw_desc_sz, DescSize::Bytes64) && !self.desc_bypass_en {
            return Err(QdmaError::InvalidParameter(
                "64-byte descriptors require descriptor bypass",
            ));
        }
        if matches!(self.sw_desc_sz, DescSize::Bytes64) && !caps.contains(DeviceCapabilities::DESC_64B) {
            return Err(QdmaError::NotSupported("64-byte descriptors not supported by this IP"));
        }

        if self.pfch_en && !caps.contains(DeviceCapabilities::PREFETCH) {
            return Err(QdmaError::NotSupported("prefetch not supported by device"));
        }
        if self.pfch_bypass_en && !caps.contains(DeviceCapabilities::PREFETCH_BYPASS) {
            return Err(QdmaError::NotSupported("prefetch bypass not supported by device"));
        }

        if self.en_mm_cmpl && matches!(self.kind, QueueKind::Mm) && !caps.contains(DeviceCapabilities::MM_CMPT) {
            return Err(QdmaError::NotSupported("MM completion ring not supported by device"));
        }

        if matches!(self.trig_mode, TrigMode::UserTimerCount)
            && !caps.contains(DeviceCapabilities::TRIG_USER_TIMER_COUNT)
        {
            return Err(QdmaError::NotSupported("UserTimerCount trigger mode not supported by device"));
        }

        if self.cmpl_ovf_dis && !caps.contains(DeviceCapabilities::CMPL_OVF_DIS) {
            return Err(QdmaError::NotSupported("completion overflow disable not supported by device"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates_against_minimal_caps() {
        let caps = DeviceCapabilities::MM;
        assert!(QueueConfig::default().validate(caps).is_ok());
    }

    #[test]
    fn st_rejected_without_capability() {
        let caps = DeviceCapabilities::MM;
        let cfg = QueueConfig {
            kind: QueueKind::St,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(caps),
            Err(QdmaError::NotSupported("ST traffic not supported by device"))
        );
    }

    #[test]
    fn bypass_descriptor_size_requires_bypass_enabled() {
        let caps = DeviceCapabilities::MM | DeviceCapabilities::DESC_64B;
        let cfg = QueueConfig {
            sw_desc_sz: DescSize::Bytes64,
            desc_bypass_en: false,
            ..Default::default()
        };
        assert!(cfg.validate(caps).is_err());
    }

    #[test]
    fn zero_pidx_batch_threshold_rejected() {
        let caps = DeviceCapabilities::MM;
        let cfg = QueueConfig {
            pidx_batch_threshold: 0,
            ..Default::default()
        };
        assert!(cfg.validate(caps).is_err());
    }

    #[test]
    fn ring_index_out_of_range_rejected() {
        let caps = DeviceCapabilities::MM;
        let cfg = QueueConfig {
            h2c_ring_sz_index: 16,
            ..Default::default()
        };
        assert!(cfg.validate(caps).is_err());
    }
}
