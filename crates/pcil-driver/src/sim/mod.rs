//! In-process stand-in for the PCIL board and its FECC.

mod caller_space;
mod crate_model;
mod fecc;

pub use caller_space::SimCallerSpace;
pub use crate_model::{CrateModel, Module};
pub use fecc::{
    Fecc, ReceivedMessage, EXEC_BAD_FUNCTION, EXEC_BAD_OPCODE, EXEC_BAD_PACKET, EXEC_DMA_FAULT,
    REMOTE_MEMORY_BYTES, SELF_TEST_FAILED, VERSION,
};

use std::sync::Arc;

use crate::hw::Platform;
use crate::memory::{DmaRegion, PhysicalMemory, SharedRam};

#[derive(Debug, Clone, Copy)]
pub struct BoardConfig {
    pub ram_size: usize,
    /// Reserved for the driver's rings, frames and tables.
    pub dma: DmaRegion,
    /// Pages handed out to caller buffers.
    pub caller_pool: DmaRegion,
    pub page_size: u64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            ram_size: 8 << 20,
            dma: DmaRegion {
                base: 0x1_0000,
                len: 2 << 20,
            },
            caller_pool: DmaRegion {
                base: 4 << 20,
                len: 4 << 20,
            },
            page_size: 4096,
        }
    }
}

/// RAM, controller and caller space wired together.
pub struct Board {
    pub config: BoardConfig,
    pub memory: Arc<SharedRam>,
    pub fecc: Arc<Fecc>,
    pub caller: Arc<SimCallerSpace>,
}

impl Board {
    pub fn new(config: BoardConfig) -> std::io::Result<Self> {
        let memory = Arc::new(SharedRam::new(config.ram_size));
        let physical: Arc<dyn PhysicalMemory> = memory.clone();
        let fecc = Fecc::start(Arc::clone(&physical))?;
        let caller = Arc::new(SimCallerSpace::new(
            physical,
            config.caller_pool,
            config.page_size,
        ));
        Ok(Self {
            config,
            memory,
            fecc,
            caller,
        })
    }

    pub fn platform(&self) -> Platform {
        Platform {
            registers: self.fecc.clone(),
            interrupt: self.fecc.clone(),
            memory: self.memory.clone(),
            dma: self.config.dma,
            caller: self.caller.clone(),
        }
    }
}
