// Licensed under the Apache-2.0 license

use crate::fault::FaultKind;
use crate::layout::RegionKind;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemError {
    #[error("access of {len} bytes at 0x{offset:x} exceeds region of 0x{size:x} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("word access at unaligned offset 0x{0:x}")]
    Unaligned(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("boot descriptor magic mismatch")]
    BadMagic,
    #[error("IPC protocol version mismatch: expected 0x{expected:x}, found 0x{found:x}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("IPC region holds 0x{available:x} bytes, map area needs 0x{required:x}")]
    RegionTooSmall { required: usize, available: usize },
    #[error("{0:?} region lies outside shared memory")]
    InvalidRegion(RegionKind),
    #[error("IPC map header declares an unusable ring geometry")]
    InvalidGeometry,
    #[error(transparent)]
    Memory(#[from] MemError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvtError {
    #[error("event channel full")]
    ChannelFull,
    #[error("no free interrupt line")]
    NoFreeLine,
    #[error("event index {index} out of range for {capacity} slots")]
    IndexCorrupt { index: u32, capacity: u32 },
    #[error(transparent)]
    Memory(#[from] MemError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    #[error("payload of {len} bytes exceeds slot capacity of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("data channel full")]
    ChannelFull,
    #[error("data index {index} out of range for {capacity} slots")]
    IndexCorrupt { index: u32, capacity: u32 },
    #[error("slot declares {len} bytes, capacity is {max}")]
    InvalidLength { len: u32, max: usize },
    #[error("data-ready event not raised: {0}")]
    Signal(EvtError),
    #[error(transparent)]
    Memory(#[from] MemError),
}

impl From<EvtError> for DataError {
    fn from(err: EvtError) -> Self {
        match err {
            EvtError::IndexCorrupt { index, capacity } => {
                DataError::IndexCorrupt { index, capacity }
            }
            EvtError::Memory(err) => DataError::Memory(err),
            other => DataError::Signal(other),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no response within {0:?}")]
pub struct TimeoutError(pub Duration);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("reset control failed: {0}")]
    Reset(String),
    #[error("access window rejected: base 0x{base:x} size 0x{size:x}")]
    AccessWindow { base: usize, size: usize },
    #[error("hub power control failed: {0}")]
    Power(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("firmware slot {0} is empty")]
    Missing(u32),
    #[error("firmware image in slot {0} failed verification")]
    Verification(u32),
    #[error("firmware download failed: {0}")]
    Download(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("hub is not running")]
    NotRunning,
    #[error("hub reset in progress")]
    ResetInProgress,
    #[error("hub reset failed")]
    ResetFailed,
    #[error("hub did not answer the alive check")]
    NotResponding,
    #[error("{event} is not valid in state {state}")]
    InvalidTransition { state: String, event: String },
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Event(#[from] EvtError),
    #[error(transparent)]
    Memory(#[from] MemError),
}

/// Error seen by transport clients. Carries only what a client needs to
/// decide between retrying, waiting for recovery and giving up.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel busy, retry later")]
    Busy,
    #[error("timed out")]
    Timeout,
    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("channel cannot be used in this direction")]
    InvalidChannel,
    #[error("hub unavailable, waiting for recovery")]
    Unavailable,
    #[error("hub failed, firmware reload required")]
    Fatal,
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Busy | TransportError::Timeout)
    }
}

impl From<LifecycleError> for TransportError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotRunning
            | LifecycleError::ResetInProgress
            | LifecycleError::NotResponding => TransportError::Unavailable,
            _ => TransportError::Fatal,
        }
    }
}

impl DataError {
    /// Fault reported to the lifecycle for a failed write, if any.
    pub fn write_fault(&self) -> Option<FaultKind> {
        match self {
            DataError::PayloadTooLarge { .. } => None,
            DataError::ChannelFull | DataError::InvalidLength { .. } => Some(FaultKind::WriteFail),
            DataError::Signal(_) => Some(FaultKind::EventLost),
            DataError::IndexCorrupt { .. } | DataError::Memory(_) => Some(FaultKind::Critical),
        }
    }

    /// Fault reported to the lifecycle for a failed read.
    pub fn read_fault(&self) -> FaultKind {
        match self {
            DataError::IndexCorrupt { .. } | DataError::Memory(_) => FaultKind::Critical,
            _ => FaultKind::ReadFail,
        }
    }
}

impl EvtError {
    pub fn fault(&self) -> FaultKind {
        match self {
            EvtError::ChannelFull | EvtError::NoFreeLine => FaultKind::EventLost,
            EvtError::IndexCorrupt { .. } | EvtError::Memory(_) => FaultKind::Critical,
        }
    }
}
