//! Seams between the driver and the hardware it runs against.

use std::sync::Arc;

use crate::memory::{CallerSpace, DmaRegion, PhysicalMemory};

/// The controller's 32-bit register window.
pub trait RegisterWindow: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);
}

/// Interrupt handler installed by the driver; runs in interrupt context and
/// must not block.
pub type InterruptHandler = Arc<dyn Fn() + Send + Sync>;

/// The controller's interrupt line.
pub trait InterruptLine: Send + Sync {
    fn attach(&self, handler: InterruptHandler);
    fn detach(&self);
}

/// Everything a driver instance needs from its environment.
#[derive(Clone)]
pub struct Platform {
    pub registers: Arc<dyn RegisterWindow>,
    pub interrupt: Arc<dyn InterruptLine>,
    pub memory: Arc<dyn PhysicalMemory>,
    /// Physically contiguous memory reserved for rings, frames, the
    /// communication area and the address map.
    pub dma: DmaRegion,
    pub caller: Arc<dyn CallerSpace>,
}
