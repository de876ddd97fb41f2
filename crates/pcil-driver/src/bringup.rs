//! One-time controller bring-up: firmware, boot, self-test, communication
//! area handshake, page table and "go".

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{DriverConfig, FirmwareImages, RingGeometry};
use crate::device::PriorityLayout;
use crate::error::{DriverError, Result};
use crate::hw::RegisterWindow;
use crate::layout::{
    comm, frame, regs, BOOT_ASSERT, CMD_GO, COMM_MAGIC, COMM_VERSION, FIRMWARE_LOCAL,
    FIRMWARE_REMOTE, MAX_PHYSICAL, RING_ELEMENT_BYTES, SELF_TEST_PASSED, STEP_HOST_ACK,
    STEP_RUNNING, VAM_ENTRY_BYTES,
};
use crate::memory::{DmaRegion, PhysicalMemory, RegionAllocator};
use crate::Priority;

const STEP_POLL: Duration = Duration::from_millis(1);

/// Placement of every host/device shared structure inside the DMA region.
#[derive(Debug, Clone)]
pub struct CommLayout {
    pub comm_area: u64,
    pub vam_table: u64,
    pub high: PriorityLayout,
    pub low: PriorityLayout,
    /// Staging buffer for firmware images, if any were configured.
    pub firmware_staging: Option<u64>,
}

impl CommLayout {
    pub fn plan(config: &DriverConfig, region: DmaRegion) -> Result<Self> {
        if region.base + region.len > MAX_PHYSICAL {
            return Err(DriverError::InvalidConfig(
                "DMA region lies outside the device-visible window",
            ));
        }
        let mut alloc = RegionAllocator::new(region);
        let comm_area = alloc.take(comm::BYTES, frame::ALIGN)?;
        let vam_table = alloc.take(config.vam_entries as u64 * VAM_ENTRY_BYTES, frame::ALIGN)?;
        let high = plan_priority(&mut alloc, config.high)?;
        let low = plan_priority(&mut alloc, config.low)?;

        let staging_len = config
            .firmware
            .as_ref()
            .map(|fw| fw.local.len().max(fw.remote.len()))
            .unwrap_or(0);
        let firmware_staging = match staging_len {
            0 => None,
            len => Some(alloc.take(len as u64, frame::ALIGN)?),
        };

        Ok(Self {
            comm_area,
            vam_table,
            high,
            low,
            firmware_staging,
        })
    }

    pub fn priority(&self, priority: Priority) -> &PriorityLayout {
        match priority {
            Priority::High => &self.high,
            Priority::Low => &self.low,
        }
    }
}

fn plan_priority(alloc: &mut RegionAllocator, geometry: RingGeometry) -> Result<PriorityLayout> {
    let command_base = alloc.take(geometry.command_len as u64 * RING_ELEMENT_BYTES, frame::ALIGN)?;
    let response_base = alloc.take(geometry.response_len as u64 * RING_ELEMENT_BYTES, frame::ALIGN)?;
    let frames = (0..geometry.messages)
        .map(|_| alloc.take(frame::BYTES as u64, frame::ALIGN))
        .collect::<Result<Vec<_>>>()?;
    Ok(PriorityLayout {
        command_base,
        response_base,
        frames,
    })
}

pub(crate) struct BringUp<'a> {
    pub(crate) config: &'a DriverConfig,
    pub(crate) registers: &'a dyn RegisterWindow,
    pub(crate) memory: &'a dyn PhysicalMemory,
    pub(crate) layout: &'a CommLayout,
}

impl BringUp<'_> {
    /// Runs everything up to, but not including, "go".
    pub(crate) fn handshake(&self) -> Result<()> {
        if let (Some(images), Some(staging)) = (&self.config.firmware, self.layout.firmware_staging) {
            self.download_firmware(images, staging)?;
        }

        self.registers.write32(regs::BOOT_CONTROL, BOOT_ASSERT);
        thread::sleep(self.config.boot_delay);

        let actual = self.registers.read32(regs::SELF_TEST);
        if actual != SELF_TEST_PASSED {
            tracing::error!(
                expected = format_args!("0x{SELF_TEST_PASSED:08x}"),
                actual = format_args!("0x{actual:08x}"),
                "controller self-test failed"
            );
            return Err(DriverError::SelfTest {
                expected: SELF_TEST_PASSED,
                actual,
            });
        }

        self.clear_rings()?;
        self.write_comm_area()?;
        let expected = self.layout.comm_area as u32;
        self.registers.write32(regs::COMM_AREA, expected);
        self.wait_for_step(STEP_HOST_ACK)?;
        let actual = self.registers.read32(regs::ECHO);
        if actual != expected {
            tracing::error!(
                expected = format_args!("0x{expected:08x}"),
                actual = format_args!("0x{actual:08x}"),
                "communication area echo mismatch"
            );
            return Err(DriverError::EchoMismatch { expected, actual });
        }

        self.registers
            .write32(regs::PAGE_TABLE_BASE, self.layout.vam_table as u32);
        Ok(())
    }

    /// Issues "go" and waits for the controller's low-priority interrupt on
    /// the armed rendezvous.
    pub(crate) fn go(&self, rendezvous: Receiver<()>) -> Result<()> {
        self.registers.write32(regs::COMMAND, CMD_GO);
        match rendezvous.recv_timeout(self.config.handshake_timeout) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return Err(DriverError::HandshakeTimeout { step: STEP_RUNNING });
            }
        }
        let step = self.registers.read32(regs::PROTOCOL_STEP);
        if step != STEP_RUNNING {
            return Err(DriverError::HandshakeTimeout { step: STEP_RUNNING });
        }
        tracing::info!(comm_area = format_args!("0x{:x}", self.layout.comm_area), "controller running");
        Ok(())
    }

    fn download_firmware(&self, images: &FirmwareImages, staging: u64) -> Result<()> {
        for (target, image) in [(FIRMWARE_LOCAL, &images.local), (FIRMWARE_REMOTE, &images.remote)] {
            if image.is_empty() {
                continue;
            }
            self.memory.write(staging, image)?;
            self.registers.write32(regs::FIRMWARE_ADDR, staging as u32);
            self.registers.write32(regs::FIRMWARE_LEN, image.len() as u32);
            self.registers.write32(regs::FIRMWARE_LOAD, target);
            tracing::debug!(target, len = image.len(), "firmware image downloaded");
        }
        Ok(())
    }

    fn clear_rings(&self) -> Result<()> {
        for (layout, geometry) in [
            (&self.layout.high, self.config.high),
            (&self.layout.low, self.config.low),
        ] {
            let command = vec![0u8; geometry.command_len as usize * RING_ELEMENT_BYTES as usize];
            self.memory.write(layout.command_base, &command)?;
            let response = vec![0u8; geometry.response_len as usize * RING_ELEMENT_BYTES as usize];
            self.memory.write(layout.response_base, &response)?;
        }
        Ok(())
    }

    fn write_comm_area(&self) -> Result<()> {
        let base = self.layout.comm_area;
        self.memory.write_u32(base + comm::MAGIC, COMM_MAGIC)?;
        self.memory.write_u32(base + comm::VERSION, COMM_VERSION)?;
        for (i, (layout, geometry)) in [
            (&self.layout.high, self.config.high),
            (&self.layout.low, self.config.low),
        ]
        .into_iter()
        .enumerate()
        {
            let block = base + comm::PRIORITY_BASE + i as u64 * comm::PRIORITY_BYTES;
            self.memory
                .write_u32(block + comm::CMD_BASE, layout.command_base as u32)?;
            self.memory
                .write_u32(block + comm::CMD_LEN, geometry.command_len as u32)?;
            self.memory
                .write_u32(block + comm::RSP_BASE, layout.response_base as u32)?;
            self.memory
                .write_u32(block + comm::RSP_LEN, geometry.response_len as u32)?;
        }
        self.memory
            .write_u32(base + comm::VAM_BASE, self.layout.vam_table as u32)?;
        self.memory
            .write_u32(base + comm::VAM_ENTRIES, self.config.vam_entries as u32)?;
        self.memory
            .write_u32(base + comm::PAGE_SHIFT, self.config.page_shift())?;
        Ok(())
    }

    fn wait_for_step(&self, step: u32) -> Result<()> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        while self.registers.read32(regs::PROTOCOL_STEP) != step {
            if Instant::now() >= deadline {
                tracing::error!(step, "handshake step timed out");
                return Err(DriverError::HandshakeTimeout { step });
            }
            thread::sleep(STEP_POLL);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_keeps_structures_disjoint_and_aligned() {
        let config = DriverConfig::default();
        let region = DmaRegion {
            base: 0x1_0000,
            len: 0x10_0000,
        };
        let layout = CommLayout::plan(&config, region).unwrap();

        let mut spans = vec![
            (layout.comm_area, comm::BYTES),
            (layout.vam_table, config.vam_entries as u64 * VAM_ENTRY_BYTES),
        ];
        for (p, g) in [(&layout.high, config.high), (&layout.low, config.low)] {
            spans.push((p.command_base, g.command_len as u64 * RING_ELEMENT_BYTES));
            spans.push((p.response_base, g.response_len as u64 * RING_ELEMENT_BYTES));
            assert_eq!(p.frames.len(), g.messages as usize);
            spans.extend(p.frames.iter().map(|f| (*f, frame::BYTES as u64)));
        }
        spans.sort();
        for pair in spans.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
        assert!(spans.iter().all(|(addr, _)| addr % frame::ALIGN == 0));
        assert_eq!(layout.firmware_staging, None);
    }

    #[test]
    fn plan_rejects_small_region() {
        let config = DriverConfig::default();
        let region = DmaRegion {
            base: 0x1000,
            len: 0x1000,
        };
        assert!(matches!(
            CommLayout::plan(&config, region),
            Err(DriverError::InvalidConfig(_))
        ));
    }

    #[test]
    fn plan_reserves_firmware_staging() {
        let config = DriverConfig {
            firmware: Some(FirmwareImages {
                local: vec![1; 300],
                remote: vec![2; 700],
            }),
            ..DriverConfig::default()
        };
        let region = DmaRegion {
            base: 0,
            len: 0x10_0000,
        };
        let layout = CommLayout::plan(&config, region).unwrap();
        assert!(layout.firmware_staging.is_some());
    }
}
