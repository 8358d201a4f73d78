//! Error taxonomy for the DMA engine core.

use core::fmt;

/// The error kinds a queue operation can fail with.
///
/// Mirrors the taxonomy a host driver surfaces to callers: a closed,
/// driver-scoped set rather than a POSIX errno mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QdmaError {
    /// Out-of-range qid, null callback/sg_list, or a config that violates
    /// a device capability bit.
    InvalidParameter(&'static str),
    /// Operation not legal for the queue's current state.
    InvalidState(&'static str),
    /// No free descriptors, no free vectors, or out of buffers.
    ResourceExhausted(&'static str),
    /// A completion entry reported an error, or a context program/read
    /// failed.
    HardwareError(&'static str),
    /// Delivered to a request's callback when its queue is stopped.
    Cancelled,
    /// The writeback monitor did not observe the expected CIDX in time.
    Timeout,
    /// Feature absent on this device/IP variant.
    NotSupported(&'static str),
}

impl fmt::Display for QdmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QdmaError::InvalidParameter(m) => write!(f, "invalid parameter: {m}"),
            QdmaError::InvalidState(m) => write!(f, "invalid state: {m}"),
            QdmaError::ResourceExhausted(m) => write!(f, "resource exhausted: {m}"),
            QdmaError::HardwareError(m) => write!(f, "hardware error: {m}"),
            QdmaError::Cancelled => write!(f, "request cancelled"),
            QdmaError::Timeout => write!(f, "timed out"),
            QdmaError::NotSupported(m) => write!(f, "not supported: {m}"),
        }
    }
}

pub type Result<T> = core::result::Result<T, QdmaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_message() {
        let e = QdmaError::InvalidParameter("qid out of range");
        assert_eq!(format!("{e}"), "invalid parameter: qid out of range");
    }
}
