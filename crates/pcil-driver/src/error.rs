use pcil_camac::status::{
    CAM_BADARG, CAM_COMMERR, CAM_HANDSHAKE, CAM_INTERRUPTED, CAM_MEMERR, CAM_NOMEM,
    CAM_NOTINIT, CAM_SELFTEST, CAM_SHUTDOWN,
};
use pcil_camac::VmsStatus;
use thiserror::Error;

use crate::memory::MemoryError;

pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// A blocking wait was cancelled by its caller.
    #[error("wait interrupted")]
    Interrupted,

    /// The virtual address map has no run of free entries large enough.
    #[error("no free virtual address map entries for {pages} pages")]
    NoSpace { pages: usize },

    #[error("payload of {len} bytes exceeds inline capacity of {capacity}")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("device not initialized")]
    NotInitialized,

    #[error("self-test failed: expected 0x{expected:08x}, read 0x{actual:08x}")]
    SelfTest { expected: u32, actual: u32 },

    #[error("handshake timed out waiting for protocol step {step}")]
    HandshakeTimeout { step: u32 },

    #[error("communication area echo mismatch: wrote 0x{expected:08x}, read 0x{actual:08x}")]
    EchoMismatch { expected: u32, actual: u32 },

    /// The remote side executed the request and reported failure.
    #[error("remote execution failed with status 0x{exec_status:08x}")]
    CommunicationError { exec_status: u32 },

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("caller buffer fault at 0x{vaddr:x}")]
    Fault { vaddr: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("driver is shutting down")]
    ShutDown,

    #[error("failed to start worker thread: {0}")]
    WorkerSpawn(String),
}

impl DriverError {
    /// Status word handed back to package-API callers.
    pub fn vms_status(&self) -> VmsStatus {
        match self {
            DriverError::Interrupted => CAM_INTERRUPTED,
            DriverError::NoSpace { .. } | DriverError::WorkerSpawn(_) => CAM_NOMEM,
            DriverError::PayloadTooLarge { .. }
            | DriverError::InvalidConfig(_)
            | DriverError::InvalidArgument(_) => CAM_BADARG,
            DriverError::NotInitialized => CAM_NOTINIT,
            DriverError::SelfTest { .. } => CAM_SELFTEST,
            DriverError::HandshakeTimeout { .. } | DriverError::EchoMismatch { .. } => {
                CAM_HANDSHAKE
            }
            DriverError::CommunicationError { .. } => CAM_COMMERR,
            DriverError::Memory(_) | DriverError::Fault { .. } => CAM_MEMERR,
            DriverError::ShutDown => CAM_SHUTDOWN,
        }
    }

    /// Bring-up failures leave the device unusable until re-initialized.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::SelfTest { .. }
                | DriverError::HandshakeTimeout { .. }
                | DriverError::EchoMismatch { .. }
        )
    }
}
