//! Fixed-length command/response rings of hardware-visible element words.
//!
//! Each slot is one `u32` in physical memory: [`RING_OWN`] plus the physical
//! address of a message frame. The host sets the ownership bit when it hands a
//! slot over and the device clears it when it is done; that transition is the
//! only completion signal polled for.
//!
//! Insert and poll positions are free-running counters; the slot is always
//! `counter & (len - 1)`.

use std::sync::atomic::{fence, Ordering};

use crate::layout::{RING_ELEMENT_BYTES, RING_M_ADDR, RING_OWN};
use crate::memory::{MemoryError, PhysicalMemory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    Command,
    Response,
}

#[derive(Debug)]
pub struct Ring {
    kind: RingKind,
    base: u64,
    mask: u32,
    insert: u32,
    poll: u32,
    outstanding: u32,
    /// Message index recorded per slot while the slot is outstanding.
    contents: Box<[Option<u16>]>,
}

impl Ring {
    /// `len` must be a power of two.
    pub fn new(kind: RingKind, base: u64, len: u16) -> Self {
        assert!(len.is_power_of_two(), "ring length must be a power of two");
        Self {
            kind,
            base,
            mask: len as u32 - 1,
            insert: 0,
            poll: 0,
            outstanding: 0,
            contents: vec![None; len as usize].into_boxed_slice(),
        }
    }

    pub fn kind(&self) -> RingKind {
        self.kind
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> u16 {
        (self.mask + 1) as u16
    }

    pub fn outstanding(&self) -> u16 {
        self.outstanding as u16
    }

    pub fn has_room(&self) -> bool {
        self.outstanding <= self.mask
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding == 0
    }

    /// Slot the next insert lands in.
    pub fn insert_slot(&self) -> u16 {
        (self.insert & self.mask) as u16
    }

    pub fn poll_slot(&self) -> u16 {
        (self.poll & self.mask) as u16
    }

    /// Physical address of a slot's element word.
    pub fn element_addr(&self, slot: u16) -> u64 {
        self.base + slot as u64 * RING_ELEMENT_BYTES
    }

    /// Message indices currently outstanding, oldest first.
    pub fn iter_outstanding(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        (0..self.outstanding).filter_map(move |i| {
            let slot = (self.poll.wrapping_add(i) & self.mask) as u16;
            self.contents[slot as usize].map(|msg| (slot, msg))
        })
    }

    /// Hands `frame_paddr` to the device in the next slot. Returns the slot.
    ///
    /// The caller checks [`Ring::has_room`] first; a full ring is a logic error.
    pub fn insert(
        &mut self,
        memory: &dyn PhysicalMemory,
        message: u16,
        frame_paddr: u64,
    ) -> Result<u16, MemoryError> {
        assert!(self.has_room(), "{:?} ring overrun", self.kind);
        debug_assert_eq!(frame_paddr as u32 & RING_OWN, 0);

        let slot = self.insert_slot();
        // Frame contents must be visible before the ownership flip.
        fence(Ordering::SeqCst);
        memory.write_u32(self.element_addr(slot), (frame_paddr as u32 & RING_M_ADDR) | RING_OWN)?;
        fence(Ordering::SeqCst);

        self.contents[slot as usize] = Some(message);
        self.insert = self.insert.wrapping_add(1);
        self.outstanding += 1;
        Ok(slot)
    }

    /// Retires the oldest outstanding slot if the device has released it.
    /// Returns the slot and the message recorded there.
    pub fn poll(&mut self, memory: &dyn PhysicalMemory) -> Result<Option<(u16, u16)>, MemoryError> {
        if self.outstanding == 0 {
            return Ok(None);
        }
        let slot = self.poll_slot();
        let word = memory.read_u32(self.element_addr(slot))?;
        if word & RING_OWN != 0 {
            return Ok(None);
        }
        fence(Ordering::SeqCst);

        let message = self.contents[slot as usize]
            .take()
            .expect("outstanding ring slot has no recorded message");
        self.poll = self.poll.wrapping_add(1);
        self.outstanding -= 1;
        Ok(Some((slot, message)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SharedRam;

    fn release(ram: &SharedRam, ring: &Ring, slot: u16) {
        let addr = ring.element_addr(slot);
        let word = ram.read_u32(addr).unwrap();
        ram.write_u32(addr, word & !RING_OWN).unwrap();
    }

    #[test]
    fn poll_waits_for_ownership_to_clear() {
        let ram = SharedRam::new(4096);
        let mut ring = Ring::new(RingKind::Command, 0x100, 4);
        assert_eq!(ring.insert(&ram, 5, 0x800).unwrap(), 0);
        assert_eq!(ram.read_u32(0x100).unwrap(), 0x800 | RING_OWN);

        assert_eq!(ring.poll(&ram).unwrap(), None);
        release(&ram, &ring, 0);
        assert_eq!(ring.poll(&ram).unwrap(), Some((0, 5)));
        assert!(ring.is_idle());
        assert_eq!(ring.poll(&ram).unwrap(), None);
    }

    #[test]
    fn wraps_with_masked_indices() {
        let ram = SharedRam::new(4096);
        let mut ring = Ring::new(RingKind::Command, 0, 8);
        for m in 0..8u16 {
            assert_eq!(ring.insert(&ram, m, 0x400 + m as u64 * 16).unwrap(), m);
        }
        assert!(!ring.has_room());
        assert_eq!(ring.outstanding(), 8);

        for slot in 0..3 {
            release(&ram, &ring, slot);
        }
        for m in 8..11u16 {
            assert_eq!(ring.poll(&ram).unwrap().map(|(_, msg)| msg), Some(m - 8));
            let slot = ring.insert(&ram, m, 0x400 + m as u64 * 16).unwrap();
            assert_eq!(slot, m - 8);
            assert_eq!(ring.outstanding(), 8);
        }

        let live: Vec<_> = ring.iter_outstanding().map(|(_, m)| m).collect();
        assert_eq!(live, vec![3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    #[should_panic(expected = "ring overrun")]
    fn insert_into_full_ring_panics() {
        let ram = SharedRam::new(256);
        let mut ring = Ring::new(RingKind::Response, 0, 1);
        ring.insert(&ram, 0, 0x40).unwrap();
        let _ = ring.insert(&ram, 1, 0x80);
    }
}
