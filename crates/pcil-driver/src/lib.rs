//! Host side of the PCIL/FECC message-passing engine.
//!
//! Two device blocks, one per priority, each own a command ring, a response
//! ring, a pool of message frames and a pool of flow blocks. Callers issue
//! requests through [`DeviceBlock::transmit_and_wait`] (usually via
//! [`Driver`]); a bottom-half worker per priority drains responses and wakes
//! them. Caller buffers reach the remote DMA engine through the virtual
//! address map in [`vam`].
//!
//! [`sim`] contains an in-process controller used by the tests and the CLI.

#![forbid(unsafe_code)]

pub mod bringup;
pub mod channel;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod flow;
pub mod hw;
pub mod layout;
pub mod listener;
pub mod memory;
pub mod message;
pub mod queue;
pub mod request;
pub mod ring;
pub mod sim;
pub mod vam;

pub use bringup::CommLayout;
pub use channel::{Channel, PriorityClass, Route};
pub use config::{DriverConfig, FirmwareImages, RingGeometry};
pub use device::{DeviceBlock, DeviceSnapshot, DeviceStatistics, Location, PriorityLayout};
pub use dispatch::{DispatchState, MessageKind};
pub use driver::{Driver, DriverStatistics};
pub use error::{DriverError, Result};
pub use hw::{InterruptHandler, InterruptLine, Platform, RegisterWindow};
pub use listener::{Listener, ListenerId};
pub use memory::{CallerSpace, DmaRegion, MemoryError, PhysicalMemory, SharedRam};
pub use message::{Frame, Opcode, OpcodeWord, OpFlags, ResponseId};
pub use request::{CancelToken, DmaDescriptor, InlineBuffer, Reply, Request};
pub use vam::{Mapping, Vam};

use pcil_camac::PriorityHint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 2] = [Priority::High, Priority::Low];
}

impl From<PriorityHint> for Priority {
    fn from(hint: PriorityHint) -> Self {
        match hint {
            PriorityHint::High => Priority::High,
            PriorityHint::Low => Priority::Low,
        }
    }
}
