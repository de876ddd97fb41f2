//! CAMAC protocol words and the package-building API.
//!
//! Device support code talks to a crate through packages: allocate one, add
//! operations (each addressed by a [`ControlWord`]), execute it through a
//! [`PackageExecutor`], inspect the per-operation [`CompletionStatus`] words and
//! the returned [`VmsStatus`], then delete it.

#![forbid(unsafe_code)]

pub mod cstat;
pub mod ctlw;
pub mod package;
pub mod status;

use thiserror::Error;

pub use cstat::{CompletionStatus, CstatFlags};
pub use ctlw::{ControlWord, CtlwFlags, FunctionKind, QMode};
pub use package::{
    decode_packet, io, DecodedPacket, ErrorMask, OpData, OpHandle, Package, PackageExecutor,
    PacketOp, PriorityHint,
};
pub use status::{message, Severity, VmsStatus};

pub type Result<T> = std::result::Result<T, CamError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CamError {
    #[error("{field} {value} out of range (max {max})")]
    FieldOutOfRange {
        field: &'static str,
        value: u8,
        max: u8,
    },

    #[error("package already holds {max} operations")]
    PackageFull { max: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
}
