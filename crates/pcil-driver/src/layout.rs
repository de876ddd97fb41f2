//! Host/device layout contract: register offsets, communication area, ring
//! elements and message frames.
//!
//! Both the driver and the emulated controller in [`crate::sim`] are built on
//! these constants; a real controller firmware must agree with them.

/// `b"PCIL"` as a little-endian `u32`.
pub const COMM_MAGIC: u32 = 0x4C49_4350;

/// Communication area ABI version.
pub const COMM_VERSION: u32 = 1;

/// Register window offsets (32-bit registers).
pub mod regs {
    /// Write [`super::BOOT_ASSERT`] to start the controller's boot ROM.
    pub const BOOT_CONTROL: u32 = 0x00;
    /// Reads [`super::SELF_TEST_PASSED`] once boot finished cleanly.
    pub const SELF_TEST: u32 = 0x04;
    /// Physical address of the communication area (handshake step 1).
    pub const COMM_AREA: u32 = 0x08;
    /// Current handshake step as seen by the controller.
    pub const PROTOCOL_STEP: u32 = 0x0C;
    /// Controller's echo of [`COMM_AREA`].
    pub const ECHO: u32 = 0x10;
    /// Physical base of the virtual address map table.
    pub const PAGE_TABLE_BASE: u32 = 0x14;
    pub const COMMAND: u32 = 0x18;
    pub const DOORBELL_HIGH: u32 = 0x1C;
    pub const DOORBELL_LOW: u32 = 0x20;
    /// Pending interrupt sources, see [`super::INT_HIGH`] / [`super::INT_LOW`].
    pub const INTERRUPT_TYPE: u32 = 0x24;
    pub const INTERRUPT_ACK_HIGH: u32 = 0x28;
    pub const INTERRUPT_ACK_LOW: u32 = 0x2C;
    /// Firmware download: physical address and length of the staged image,
    /// then the target written to [`FIRMWARE_LOAD`].
    pub const FIRMWARE_ADDR: u32 = 0x30;
    pub const FIRMWARE_LEN: u32 = 0x34;
    pub const FIRMWARE_LOAD: u32 = 0x38;
}

pub const BOOT_ASSERT: u32 = 0x0000_0001;
pub const SELF_TEST_PASSED: u32 = 0x0000_C0DE;

pub const STEP_RESET: u32 = 0;
/// Controller latched the communication area address ("host" step).
pub const STEP_HOST_ACK: u32 = 1;
/// Controller read the ring geometry and is polling ("port" step).
pub const STEP_RUNNING: u32 = 2;

pub const CMD_GO: u32 = 0x0000_0001;

pub const FIRMWARE_LOCAL: u32 = 1;
pub const FIRMWARE_REMOTE: u32 = 2;

pub const INT_HIGH: u32 = 1 << 0;
pub const INT_LOW: u32 = 1 << 1;

/// Ring element word: bit 31 set while the device owns the slot.
pub const RING_OWN: u32 = 0x8000_0000;
pub const RING_M_ADDR: u32 = !RING_OWN;
pub const RING_ELEMENT_BYTES: u64 = 4;

/// Communication area word offsets (each a little-endian `u32`).
pub mod comm {
    pub const MAGIC: u64 = 0;
    pub const VERSION: u64 = 4;
    /// First per-priority block; the high priority block comes first.
    pub const PRIORITY_BASE: u64 = 8;
    pub const PRIORITY_BYTES: u64 = 16;
    pub const CMD_BASE: u64 = 0;
    pub const CMD_LEN: u64 = 4;
    pub const RSP_BASE: u64 = 8;
    pub const RSP_LEN: u64 = 12;
    pub const VAM_BASE: u64 = PRIORITY_BASE + 2 * PRIORITY_BYTES;
    pub const VAM_ENTRIES: u64 = VAM_BASE + 4;
    /// log2 of the page size synthetic addresses are built from.
    pub const PAGE_SHIFT: u64 = VAM_ENTRIES + 4;
    pub const BYTES: u64 = PAGE_SHIFT + 4;
}

/// Message frame byte offsets.
pub mod frame {
    pub const SIZE: u64 = 0;
    pub const OPCODE: u64 = 4;
    pub const RSPID: u64 = 8;
    pub const EXEC_STATUS: u64 = 12;
    pub const DMA_SIZE: u64 = 16;
    pub const DMA_OFFSET: u64 = 20;
    pub const DMA_ADDR: u64 = 24;
    pub const PAYLOAD_SIZE: u64 = 32;
    pub const RESERVED: u64 = 36;
    pub const PAYLOAD: u64 = 40;
    pub const HEADER_BYTES: usize = PAYLOAD as usize;
    pub const BYTES: usize = 512;
    pub const PAYLOAD_CAPACITY: usize = BYTES - HEADER_BYTES;
    pub const ALIGN: u64 = 16;
}

/// Tag marking a DMA address as synthetic (virtual address map) rather than
/// physical.
pub const VAM_TAG: u64 = 0x8000_0000;
pub const VAM_ENTRY_BYTES: u64 = 4;

/// Everything the device-visible address space can hold: ring words carry 31
/// address bits and synthetic addresses reserve bit 31.
pub const MAX_PHYSICAL: u64 = VAM_TAG;
