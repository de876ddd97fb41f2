use std::time::Duration;

use crate::error::{DriverError, Result};
use crate::Priority;

/// Ring and pool sizes for one priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    /// Command ring length; a power of two.
    pub command_len: u16,
    /// Response ring length; a power of two.
    pub response_len: u16,
    /// Message frames owned by this priority. Must exceed `response_len`,
    /// since the response ring is pre-loaded at bring-up.
    pub messages: u16,
    /// Flow blocks; a power of two so response-identifier indices can be masked.
    pub flows: u16,
}

impl RingGeometry {
    /// Frames left for commands once the response ring is pre-loaded.
    pub fn command_messages(&self) -> u16 {
        self.messages - self.response_len
    }

    fn validate(&self) -> Result<()> {
        if !self.command_len.is_power_of_two() || !self.response_len.is_power_of_two() {
            return Err(DriverError::InvalidConfig("ring lengths must be powers of two"));
        }
        if self.command_len > 1 << 14 || self.response_len > 1 << 14 {
            return Err(DriverError::InvalidConfig("ring lengths are limited to 16384"));
        }
        if self.messages <= self.response_len {
            return Err(DriverError::InvalidConfig(
                "message pool must be larger than the response ring",
            ));
        }
        if !self.flows.is_power_of_two() {
            return Err(DriverError::InvalidConfig("flow pool size must be a power of two"));
        }
        Ok(())
    }
}

/// Firmware images downloaded before boot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FirmwareImages {
    /// Image for the local PCI coprocessor.
    pub local: Vec<u8>,
    /// Image for the remote front-end controller.
    pub remote: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub high: RingGeometry,
    pub low: RingGeometry,
    /// Entries in the virtual address map table.
    pub vam_entries: usize,
    /// Page size of caller address spaces; a power of two.
    pub page_size: u64,
    /// How long to wait for each handshake step.
    pub handshake_timeout: Duration,
    /// Delay between asserting boot and reading the self-test register.
    pub boot_delay: Duration,
    /// Blocked callers re-check cancellation at this interval.
    pub wait_poll_interval: Duration,
    pub firmware: Option<FirmwareImages>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            high: RingGeometry {
                command_len: 16,
                response_len: 16,
                messages: 48,
                flows: 32,
            },
            low: RingGeometry {
                command_len: 32,
                response_len: 32,
                messages: 96,
                flows: 64,
            },
            vam_entries: 1024,
            page_size: 4096,
            handshake_timeout: Duration::from_secs(2),
            boot_delay: Duration::from_millis(5),
            wait_poll_interval: Duration::from_millis(20),
            firmware: None,
        }
    }
}

impl DriverConfig {
    pub fn geometry(&self, priority: Priority) -> RingGeometry {
        match priority {
            Priority::High => self.high,
            Priority::Low => self.low,
        }
    }

    pub fn page_shift(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    pub fn validate(&self) -> Result<()> {
        self.high.validate()?;
        self.low.validate()?;
        if !self.page_size.is_power_of_two() || self.page_size < 512 {
            return Err(DriverError::InvalidConfig(
                "page size must be a power of two of at least 512",
            ));
        }
        if self.vam_entries == 0 {
            return Err(DriverError::InvalidConfig("virtual address map needs entries"));
        }
        if (self.vam_entries as u64) * self.page_size > crate::layout::VAM_TAG {
            return Err(DriverError::InvalidConfig(
                "virtual address map spans more than the synthetic address window",
            ));
        }
        if self.wait_poll_interval.is_zero() {
            return Err(DriverError::InvalidConfig("wait poll interval must be non-zero"));
        }
        Ok(())
    }
}
