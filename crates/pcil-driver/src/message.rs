//! Message frames: opcodes, response identifiers and the wire codec.

use bitflags::bitflags;

use crate::layout::frame;
use crate::memory::{MemoryError, PhysicalMemory};

pub const OPCODE_M_CODE: u32 = 0x0000_00FF;
pub const OPCODE_M_FLAGS: u32 = 0x0000_FF00;
pub const OPCODE_V_FUNCTION: u32 = 16;
pub const OPCODE_M_FUNCTION: u32 = 0x00FF_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Legacy CAMAC protocol emulation.
    EmulateLegacy = 1,
    /// Application message, host to remote.
    SendToRemote = 2,
    /// Application message, remote to host (unsolicited).
    SendFromRemote = 3,
    RemoteMemoryAccess = 4,
    DiagnosticLocal = 5,
    DiagnosticRemote = 6,
    /// CAMAC packages executed by the bus-master emulation.
    BusMasterEmulate = 7,
    ErrorReport = 8,
}

impl Opcode {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Opcode::EmulateLegacy,
            2 => Opcode::SendToRemote,
            3 => Opcode::SendFromRemote,
            4 => Opcode::RemoteMemoryAccess,
            5 => Opcode::DiagnosticLocal,
            6 => Opcode::DiagnosticRemote,
            7 => Opcode::BusMasterEmulate,
            8 => Opcode::ErrorReport,
            _ => return None,
        })
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpFlags: u32 {
        /// Set by the remote side when the message is a finished reply.
        const REMOTE_COMPLETE = 1 << 8;
        /// Bus-master read: the inline payload is filled by the device.
        const BM_READ = 1 << 9;
        /// Pattern traffic.
        const PATTERN = 1 << 10;
    }
}

impl OpFlags {
    /// Bits a caller may not set on a request; they only have meaning on replies.
    pub const STATUS: OpFlags = OpFlags::REMOTE_COMPLETE;
}

/// Opcode word as carried in a frame: code, flags and a function selector
/// used by diagnostic requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpcodeWord {
    pub opcode: Opcode,
    pub flags: OpFlags,
    pub function: u8,
}

impl OpcodeWord {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            flags: OpFlags::empty(),
            function: 0,
        }
    }

    pub fn with_flags(mut self, flags: OpFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_function(mut self, function: u8) -> Self {
        self.function = function;
        self
    }

    pub fn encode(self) -> u32 {
        self.opcode as u32
            | (self.flags.bits() & OPCODE_M_FLAGS)
            | ((self.function as u32) << OPCODE_V_FUNCTION)
    }

    /// Decodes a raw word; unknown opcode codes come back as the raw value.
    pub fn decode(raw: u32) -> Result<Self, u32> {
        let opcode = Opcode::from_code((raw & OPCODE_M_CODE) as u8).ok_or(raw)?;
        Ok(Self {
            opcode,
            flags: OpFlags::from_bits_truncate(raw & OPCODE_M_FLAGS),
            function: ((raw & OPCODE_M_FUNCTION) >> OPCODE_V_FUNCTION) as u8,
        })
    }

    pub fn is_remote_complete(self) -> bool {
        self.flags.contains(OpFlags::REMOTE_COMPLETE)
    }
}

/// Flow block index plus the block's use count at issue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResponseId {
    pub index: u16,
    pub use_count: u16,
}

impl ResponseId {
    pub const fn new(index: u16, use_count: u16) -> Self {
        Self { index, use_count }
    }

    pub const fn to_bits(self) -> u32 {
        self.index as u32 | (self.use_count as u32) << 16
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self {
            index: bits as u16,
            use_count: (bits >> 16) as u16,
        }
    }
}

/// Decoded message frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub opcode: u32,
    pub rspid: u32,
    pub exec_status: u32,
    pub dma_size: u32,
    pub dma_offset: u32,
    pub dma_addr: u64,
    /// Declared inline payload size. For bus-master reads this is the number
    /// of bytes requested while `payload` stays empty.
    pub payload_size: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Transfer size: fixed header plus declared payload.
    pub fn transfer_size(&self) -> u32 {
        frame::HEADER_BYTES as u32 + self.payload_size
    }

    pub fn write_to(&self, memory: &dyn PhysicalMemory, paddr: u64) -> Result<(), MemoryError> {
        let mut header = [0u8; frame::HEADER_BYTES];
        put_u32(&mut header, frame::SIZE, self.transfer_size());
        put_u32(&mut header, frame::OPCODE, self.opcode);
        put_u32(&mut header, frame::RSPID, self.rspid);
        put_u32(&mut header, frame::EXEC_STATUS, self.exec_status);
        put_u32(&mut header, frame::DMA_SIZE, self.dma_size);
        put_u32(&mut header, frame::DMA_OFFSET, self.dma_offset);
        header[frame::DMA_ADDR as usize..frame::DMA_ADDR as usize + 8]
            .copy_from_slice(&self.dma_addr.to_le_bytes());
        put_u32(&mut header, frame::PAYLOAD_SIZE, self.payload_size);
        put_u32(&mut header, frame::RESERVED, 0);
        memory.write(paddr, &header)?;

        let len = self.payload.len().min(frame::PAYLOAD_CAPACITY);
        memory.write(paddr + frame::PAYLOAD, &self.payload[..len])
    }

    pub fn read_from(memory: &dyn PhysicalMemory, paddr: u64) -> Result<Self, MemoryError> {
        let mut header = [0u8; frame::HEADER_BYTES];
        memory.read(paddr, &mut header)?;

        let payload_size = get_u32(&header, frame::PAYLOAD_SIZE);
        let len = (payload_size as usize).min(frame::PAYLOAD_CAPACITY);
        let mut payload = vec![0u8; len];
        memory.read(paddr + frame::PAYLOAD, &mut payload)?;

        let mut dma_addr = [0u8; 8];
        dma_addr.copy_from_slice(&header[frame::DMA_ADDR as usize..frame::DMA_ADDR as usize + 8]);

        Ok(Self {
            opcode: get_u32(&header, frame::OPCODE),
            rspid: get_u32(&header, frame::RSPID),
            exec_status: get_u32(&header, frame::EXEC_STATUS),
            dma_size: get_u32(&header, frame::DMA_SIZE),
            dma_offset: get_u32(&header, frame::DMA_OFFSET),
            dma_addr: u64::from_le_bytes(dma_addr),
            payload_size,
            payload,
        })
    }
}

fn put_u32(buf: &mut [u8], offset: u64, val: u32) {
    let offset = offset as usize;
    buf[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
}

fn get_u32(buf: &[u8], offset: u64) -> u32 {
    let offset = offset as usize;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SharedRam;

    #[test]
    fn opcode_word_keeps_fields_apart() {
        let word = OpcodeWord::new(Opcode::DiagnosticRemote)
            .with_flags(OpFlags::REMOTE_COMPLETE | OpFlags::BM_READ)
            .with_function(0x42);
        let raw = word.encode();
        assert_eq!(raw & OPCODE_M_CODE, 6);
        assert_eq!(raw & OPCODE_M_FUNCTION, 0x42 << 16);
        assert_eq!(OpcodeWord::decode(raw), Ok(word));
    }

    #[test]
    fn unknown_opcode_code_is_returned_raw() {
        assert_eq!(OpcodeWord::decode(0x0000_01FE), Err(0x0000_01FE));
        assert_eq!(OpcodeWord::decode(0), Err(0));
    }

    #[test]
    fn response_id_packs_index_low() {
        let id = ResponseId::new(2, 7);
        assert_eq!(id.to_bits(), 0x0007_0002);
        assert_eq!(ResponseId::from_bits(0x0007_0002), id);
    }

    #[test]
    fn frame_payload_is_clamped_to_capacity_on_read() {
        let ram = SharedRam::new(4096);
        let f = Frame {
            opcode: OpcodeWord::new(Opcode::SendToRemote).encode(),
            rspid: ResponseId::new(1, 1).to_bits(),
            dma_addr: 0x8000_1234,
            payload_size: 3,
            payload: vec![9, 8, 7],
            ..Frame::default()
        };
        f.write_to(&ram, 0x100).unwrap();
        assert_eq!(ram.read_u32(0x100).unwrap(), frame::HEADER_BYTES as u32 + 3);
        assert_eq!(Frame::read_from(&ram, 0x100).unwrap(), f);

        ram.write_u32(0x100 + frame::PAYLOAD_SIZE, 0xFFFF).unwrap();
        let clamped = Frame::read_from(&ram, 0x100).unwrap();
        assert_eq!(clamped.payload.len(), frame::PAYLOAD_CAPACITY);
    }
}
