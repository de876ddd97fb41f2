//! Hardware-visible memory and caller address spaces.
//!
//! Everything the device can see (rings, message frames, the communication
//! area, the virtual address map) lives behind [`PhysicalMemory`]. Caller
//! buffers live in a [`CallerSpace`]: virtual addresses backed by physical
//! pages that need not be contiguous.

use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use crate::error::{DriverError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("physical access out of range: paddr=0x{paddr:x} len={len} size=0x{size:x}")]
    OutOfRange { paddr: u64, len: usize, size: u64 },
}

/// Physical memory shared between host and device.
///
/// Receivers are `&self` because the host and the device access it from
/// different threads.
pub trait PhysicalMemory: Send + Sync {
    fn size(&self) -> u64;

    fn read(&self, paddr: u64, buf: &mut [u8]) -> std::result::Result<(), MemoryError>;

    fn write(&self, paddr: u64, buf: &[u8]) -> std::result::Result<(), MemoryError>;

    fn read_u32(&self, paddr: u64) -> std::result::Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&self, paddr: u64, val: u32) -> std::result::Result<(), MemoryError> {
        self.write(paddr, &val.to_le_bytes())
    }

    fn read_u64(&self, paddr: u64) -> std::result::Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&self, paddr: u64, val: u64) -> std::result::Result<(), MemoryError> {
        self.write(paddr, &val.to_le_bytes())
    }
}

/// Flat RAM image guarded by a mutex.
pub struct SharedRam {
    bytes: Mutex<Vec<u8>>,
}

impl SharedRam {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0u8; size]),
        }
    }
}

impl PhysicalMemory for SharedRam {
    fn size(&self) -> u64 {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner).len() as u64
    }

    fn read(&self, paddr: u64, buf: &mut [u8]) -> std::result::Result<(), MemoryError> {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        let range = check_range(bytes.len() as u64, paddr, buf.len())?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write(&self, paddr: u64, buf: &[u8]) -> std::result::Result<(), MemoryError> {
        let mut bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        let range = check_range(bytes.len() as u64, paddr, buf.len())?;
        bytes[range].copy_from_slice(buf);
        Ok(())
    }
}

fn check_range(
    size: u64,
    paddr: u64,
    len: usize,
) -> std::result::Result<std::ops::Range<usize>, MemoryError> {
    let end = paddr
        .checked_add(len as u64)
        .filter(|end| *end <= size)
        .ok_or(MemoryError::OutOfRange { paddr, len, size })?;
    Ok(paddr as usize..end as usize)
}

/// A caller's virtual address space.
pub trait CallerSpace: Send + Sync {
    fn page_size(&self) -> u64;

    /// Physical address of the page holding `vaddr`, page-aligned.
    fn physical_page(&self, vaddr: u64) -> Option<u64>;

    /// Reserves `len` bytes of caller memory usable as a DMA target.
    fn alloc(&self, len: usize) -> Result<u64>;

    fn release(&self, vaddr: u64);
}

/// Copies out of caller memory one page at a time.
pub fn copy_from_caller(
    space: &dyn CallerSpace,
    memory: &dyn PhysicalMemory,
    vaddr: u64,
    dst: &mut [u8],
) -> Result<()> {
    walk_caller(space, vaddr, dst.len(), |paddr, range| {
        memory.read(paddr, &mut dst[range]).map_err(DriverError::from)
    })
}

/// Copies into caller memory one page at a time.
pub fn copy_to_caller(
    space: &dyn CallerSpace,
    memory: &dyn PhysicalMemory,
    vaddr: u64,
    src: &[u8],
) -> Result<()> {
    walk_caller(space, vaddr, src.len(), |paddr, range| {
        memory.write(paddr, &src[range]).map_err(DriverError::from)
    })
}

fn walk_caller(
    space: &dyn CallerSpace,
    vaddr: u64,
    len: usize,
    mut f: impl FnMut(u64, std::ops::Range<usize>) -> Result<()>,
) -> Result<()> {
    let page = space.page_size();
    let mut done = 0usize;
    while done < len {
        let va = vaddr + done as u64;
        let offset = va & (page - 1);
        let chunk = ((page - offset) as usize).min(len - done);
        let frame = space
            .physical_page(va)
            .ok_or(DriverError::Fault { vaddr: va })?;
        f(frame + offset, done..done + chunk)?;
        done += chunk;
    }
    Ok(())
}

/// A physically contiguous block handed to the driver for its own use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    pub base: u64,
    pub len: u64,
}

/// Bump allocator carving aligned blocks out of a [`DmaRegion`].
#[derive(Debug)]
pub(crate) struct RegionAllocator {
    next: u64,
    end: u64,
}

impl RegionAllocator {
    pub(crate) fn new(region: DmaRegion) -> Self {
        Self {
            next: region.base,
            end: region.base + region.len,
        }
    }

    pub(crate) fn take(&mut self, len: u64, align: u64) -> Result<u64> {
        debug_assert!(align.is_power_of_two());
        let start = (self.next + (align - 1)) & !(align - 1);
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.end)
            .ok_or(DriverError::InvalidConfig("DMA region too small for the configured geometry"))?;
        self.next = end;
        Ok(start)
    }
}
