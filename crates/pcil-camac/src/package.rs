//! Package building: allocate, add operations, execute, delete.
//!
//! A package is serialized into two parts before it is handed to an executor:
//!
//! - the *packet*, a compact operation list small enough to travel inline in a
//!   message frame;
//! - the *region*, a status/data area the remote side writes into by DMA. Each
//!   operation owns a CSTAT word followed by its data bytes (padded to 4).
//!
//! Packet layout (all little-endian `u32`):
//! - op count
//! - region length in bytes
//! - per operation: control word, `bcnt | emask << 16`, region offset

use bitflags::bitflags;

use crate::ctlw::{ControlWord, CtlwFlags};
use crate::cstat::{CompletionStatus, CstatFlags};
use crate::status::{
    VmsStatus, CAM_BADARG, CAM_CTO, CAM_NOX, CAM_NOQ, CAM_OKOK, CAM_PKGFULL,
};
use crate::{CamError, Result};

pub const PACKET_HEADER_BYTES: usize = 8;
pub const PACKET_OP_BYTES: usize = 12;
pub const CSTAT_BYTES: usize = 4;

bitflags! {
    /// Conditions that turn an operation's completion into a package failure.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ErrorMask: u16 {
        const NOX = 1 << 0;
        const NOQ = 1 << 1;
        const TIMEOUT = 1 << 2;
    }
}

impl Default for ErrorMask {
    fn default() -> Self {
        ErrorMask::NOX | ErrorMask::TIMEOUT
    }
}

/// Which ring a package should travel on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityHint {
    #[default]
    Low,
    High,
}

/// Data carried by one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpData {
    /// No data phase (control functions).
    None,
    /// Read up to this many bytes.
    Read(u16),
    /// Write these bytes.
    Write(Vec<u8>),
}

impl OpData {
    fn byte_count(&self) -> usize {
        match self {
            OpData::None => 0,
            OpData::Read(n) => *n as usize,
            OpData::Write(data) => data.len(),
        }
    }
}

/// Something that can carry a serialized package to the crate and back.
pub trait PackageExecutor {
    /// Executes `packet`, letting the remote side fill `region`. Returns the
    /// transport-level status; per-operation results live in `region`.
    fn execute(&self, priority: PriorityHint, packet: &[u8], region: &mut [u8]) -> VmsStatus;
}

/// Index of an operation inside its package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHandle(usize);

#[derive(Debug)]
struct PackageOp {
    ctlw: ControlWord,
    emask: ErrorMask,
    data: OpData,
    status: CompletionStatus,
    result: Vec<u8>,
}

/// Operation list as decoded from a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketOp {
    pub ctlw: ControlWord,
    pub bcnt: u16,
    pub emask: ErrorMask,
    pub region_offset: u32,
}

impl PacketOp {
    pub fn data_offset(&self) -> usize {
        self.region_offset as usize + CSTAT_BYTES
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub ops: Vec<PacketOp>,
    pub region_len: usize,
}

#[derive(Debug)]
pub struct Package {
    max_ops: usize,
    priority: PriorityHint,
    ops: Vec<PackageOp>,
}

impl Package {
    /// Allocates an empty package able to hold `max_ops` operations.
    pub fn alloc(max_ops: usize, priority: Option<PriorityHint>) -> Result<Self> {
        if max_ops == 0 {
            return Err(CamError::InvalidArgument("package needs room for at least one op"));
        }
        Ok(Self {
            max_ops,
            priority: priority.unwrap_or_default(),
            ops: Vec::with_capacity(max_ops),
        })
    }

    pub fn priority(&self) -> PriorityHint {
        self.priority
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Appends one operation.
    pub fn add(&mut self, ctlw: ControlWord, data: OpData, emask: ErrorMask) -> Result<OpHandle> {
        if self.ops.len() >= self.max_ops {
            return Err(CamError::PackageFull { max: self.max_ops });
        }
        let bcnt = data.byte_count();
        if bcnt > u16::MAX as usize {
            return Err(CamError::InvalidArgument("byte count does not fit in 16 bits"));
        }
        if bcnt % ctlw.word_bytes() != 0 {
            return Err(CamError::InvalidArgument(
                "byte count is not a multiple of the word size",
            ));
        }

        self.ops.push(PackageOp {
            ctlw,
            emask,
            data,
            status: CompletionStatus::default(),
            result: Vec::new(),
        });
        Ok(OpHandle(self.ops.len() - 1))
    }

    /// Executes the package and folds every operation's CSTAT against its
    /// error mask. The first failing operation decides the returned status.
    pub fn go(&mut self, executor: &dyn PackageExecutor) -> VmsStatus {
        if self.ops.is_empty() {
            return CAM_BADARG;
        }

        let (packet, mut region) = self.encode();
        let status = executor.execute(self.priority, &packet, &mut region);
        if !status.is_success() {
            return status;
        }

        let mut offset = 0usize;
        let mut verdict = CAM_OKOK;
        for op in &mut self.ops {
            let bcnt = op.data.byte_count();
            let cstat = read_u32(&region, offset).unwrap_or_default();
            op.status = CompletionStatus::from_bits(cstat);
            op.result = match op.data {
                OpData::Read(_) => region[offset + CSTAT_BYTES..offset + CSTAT_BYTES + bcnt].to_vec(),
                _ => Vec::new(),
            };
            offset += op_region_len(bcnt);

            if verdict.is_success() {
                verdict = judge(op.status, op.emask);
            }
        }
        verdict
    }

    /// Completion status of an executed operation.
    pub fn status(&self, op: OpHandle) -> Option<CompletionStatus> {
        self.ops.get(op.0).map(|op| op.status)
    }

    /// Bytes read by an executed read operation.
    pub fn data(&self, op: OpHandle) -> Option<&[u8]> {
        self.ops.get(op.0).map(|op| op.result.as_slice())
    }

    /// Releases the package. Dropping it has the same effect.
    pub fn delete(self) {}

    fn encode(&self) -> (Vec<u8>, Vec<u8>) {
        let region_len: usize = self
            .ops
            .iter()
            .map(|op| op_region_len(op.data.byte_count()))
            .sum();

        let mut packet = Vec::with_capacity(PACKET_HEADER_BYTES + self.ops.len() * PACKET_OP_BYTES);
        packet.extend_from_slice(&(self.ops.len() as u32).to_le_bytes());
        packet.extend_from_slice(&(region_len as u32).to_le_bytes());

        let mut region = vec![0u8; region_len];
        let mut offset = 0usize;
        let last = self.ops.len() - 1;
        for (i, op) in self.ops.iter().enumerate() {
            let mut flags = op.ctlw.flags();
            flags.set(CtlwFlags::MPC, i != last);
            let ctlw = op.ctlw.with_flags(flags);
            let bcnt = op.data.byte_count() as u32;

            packet.extend_from_slice(&ctlw.bits().to_le_bytes());
            packet.extend_from_slice(&(bcnt | (op.emask.bits() as u32) << 16).to_le_bytes());
            packet.extend_from_slice(&(offset as u32).to_le_bytes());

            if let OpData::Write(data) = &op.data {
                region[offset + CSTAT_BYTES..offset + CSTAT_BYTES + data.len()].copy_from_slice(data);
            }
            offset += op_region_len(bcnt as usize);
        }
        (packet, region)
    }
}

/// Single-operation shortcut: build, execute and tear down a one-op package.
pub fn io(
    executor: &dyn PackageExecutor,
    priority: PriorityHint,
    ctlw: ControlWord,
    data: OpData,
    emask: ErrorMask,
) -> Result<(VmsStatus, CompletionStatus, Vec<u8>)> {
    let mut package = Package::alloc(1, Some(priority))?;
    let op = package.add(ctlw, data, emask)?;
    let status = package.go(executor);
    let cstat = package.status(op).unwrap_or_default();
    let data = package.data(op).map(<[u8]>::to_vec).unwrap_or_default();
    package.delete();
    Ok((status, cstat, data))
}

/// Parses a packet produced by [`Package::go`]. Used by the remote side.
pub fn decode_packet(packet: &[u8]) -> Result<DecodedPacket> {
    let count = read_u32(packet, 0).ok_or(CamError::MalformedPacket("truncated header"))? as usize;
    let region_len =
        read_u32(packet, 4).ok_or(CamError::MalformedPacket("truncated header"))? as usize;
    if packet.len() < PACKET_HEADER_BYTES + count * PACKET_OP_BYTES {
        return Err(CamError::MalformedPacket("operation list shorter than op count"));
    }

    let mut ops = Vec::with_capacity(count);
    for i in 0..count {
        let base = PACKET_HEADER_BYTES + i * PACKET_OP_BYTES;
        let ctlw = ControlWord::from_bits(read_u32(packet, base).unwrap_or_default());
        let word1 = read_u32(packet, base + 4).unwrap_or_default();
        let region_offset = read_u32(packet, base + 8).unwrap_or_default();
        let bcnt = (word1 & 0xFFFF) as u16;

        if region_offset as usize + op_region_len(bcnt as usize) > region_len {
            return Err(CamError::MalformedPacket("operation overruns the region"));
        }
        ops.push(PacketOp {
            ctlw,
            bcnt,
            emask: ErrorMask::from_bits_truncate((word1 >> 16) as u16),
            region_offset,
        });
    }
    Ok(DecodedPacket { ops, region_len })
}

/// Size the region reserves for an operation with `bcnt` data bytes.
pub const fn op_region_len(bcnt: usize) -> usize {
    CSTAT_BYTES + ((bcnt + 3) & !3)
}

/// Packet size for a package with `ops` operations.
pub const fn packet_len(ops: usize) -> usize {
    PACKET_HEADER_BYTES + ops * PACKET_OP_BYTES
}

fn judge(status: CompletionStatus, emask: ErrorMask) -> VmsStatus {
    let flags = status.flags();
    if flags.contains(CstatFlags::TIMEOUT) && emask.contains(ErrorMask::TIMEOUT) {
        return CAM_CTO;
    }
    if !flags.contains(CstatFlags::X) && emask.contains(ErrorMask::NOX) {
        return CAM_NOX;
    }
    if !flags.contains(CstatFlags::Q) && emask.contains(ErrorMask::NOQ) {
        return CAM_NOQ;
    }
    CAM_OKOK
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

impl From<CamError> for VmsStatus {
    fn from(err: CamError) -> Self {
        match err {
            CamError::PackageFull { .. } => CAM_PKGFULL,
            _ => CAM_BADARG,
        }
    }
}
