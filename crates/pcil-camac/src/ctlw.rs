//! CAMAC control word (CCTLW).
//!
//! Bit layout (32-bit, little-endian when serialized):
//!
//! | bits  | field                                   |
//! |-------|-----------------------------------------|
//! | 0-3   | subaddress (A)                          |
//! | 4-6   | reserved, must be zero                  |
//! | 7-11  | module / slot address (N)               |
//! | 12-15 | crate address (C)                       |
//! | 16-20 | function code (F)                       |
//! | 21-23 | reserved, must be zero                  |
//! | 24-31 | [`CtlwFlags`]                           |
//!
//! The layout is shared with the remote controller and must not change.

use bitflags::bitflags;

use crate::{CamError, Result};

pub const CCTLW_V_A: u32 = 0;
pub const CCTLW_M_A: u32 = 0x0000_000F;
pub const CCTLW_V_N: u32 = 7;
pub const CCTLW_M_N: u32 = 0x0000_0F80;
pub const CCTLW_V_C: u32 = 12;
pub const CCTLW_M_C: u32 = 0x0000_F000;
pub const CCTLW_V_F: u32 = 16;
pub const CCTLW_M_F: u32 = 0x001F_0000;
pub const CCTLW_M_FLAGS: u32 = 0xFF00_0000;
pub const CCTLW_M_RESERVED: u32 = 0x00E0_0070;

pub const MAX_CRATE: u8 = 15;
pub const MAX_SLOT: u8 = 31;
pub const MAX_SUBADDRESS: u8 = 15;
pub const MAX_FUNCTION: u8 = 31;

bitflags! {
    /// Transfer-mode flags carried in the top byte of the control word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CtlwFlags: u32 {
        /// Pack 24-bit data words (otherwise 16-bit).
        const P24 = 1 << 24;
        /// Scan the module address after each transfer.
        const SCAN_SLOT = 1 << 25;
        /// Scan the subaddress after each transfer.
        const SCAN_SUBADDRESS = 1 << 26;
        /// Increment the data address for every word (block transfer).
        const INCREMENT = 1 << 27;
        /// Q-mode bit 1: stop the transfer on the first missing Q.
        const QM1 = 1 << 28;
        /// Q-mode bit 2: repeat each transfer until Q is seen.
        const QM2 = 1 << 29;
        /// Terminate the transfer on a missing X.
        const XM = 1 << 30;
        /// More operations follow in this package.
        const MPC = 1 << 31;
    }
}

/// How a multi-word transfer treats the Q response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QMode {
    /// Transfer every word regardless of Q.
    Ignore,
    /// Stop on the first missing Q.
    StopOnNoQ,
    /// Repeat each word until Q is seen (bounded by the crate timeout).
    RepeatUntilQ,
    /// Advance the scan on missing Q.
    Scan,
}

impl QMode {
    pub fn from_flags(flags: CtlwFlags) -> Self {
        match (flags.contains(CtlwFlags::QM1), flags.contains(CtlwFlags::QM2)) {
            (false, false) => QMode::Ignore,
            (true, false) => QMode::StopOnNoQ,
            (false, true) => QMode::RepeatUntilQ,
            (true, true) => QMode::Scan,
        }
    }

    pub fn flags(self) -> CtlwFlags {
        match self {
            QMode::Ignore => CtlwFlags::empty(),
            QMode::StopOnNoQ => CtlwFlags::QM1,
            QMode::RepeatUntilQ => CtlwFlags::QM2,
            QMode::Scan => CtlwFlags::QM1 | CtlwFlags::QM2,
        }
    }
}

/// Category of a CAMAC function code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// F0-F7.
    Read,
    /// F16-F23.
    Write,
    /// F8-F15 and F24-F31.
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct ControlWord(u32);

impl ControlWord {
    /// Builds a control word from its address fields, rejecting out-of-range values.
    pub fn new(crate_addr: u8, slot: u8, subaddress: u8, function: u8) -> Result<Self> {
        check_field("crate", crate_addr, MAX_CRATE)?;
        check_field("slot", slot, MAX_SLOT)?;
        check_field("subaddress", subaddress, MAX_SUBADDRESS)?;
        check_field("function", function, MAX_FUNCTION)?;

        Ok(Self(
            ((subaddress as u32) << CCTLW_V_A)
                | ((slot as u32) << CCTLW_V_N)
                | ((crate_addr as u32) << CCTLW_V_C)
                | ((function as u32) << CCTLW_V_F),
        ))
    }

    /// Reinterprets a raw wire word. Reserved bits are cleared.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & !CCTLW_M_RESERVED)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn with_flags(self, flags: CtlwFlags) -> Self {
        Self((self.0 & !CCTLW_M_FLAGS) | flags.bits())
    }

    pub fn with_q_mode(self, mode: QMode) -> Self {
        let flags = (self.flags() - (CtlwFlags::QM1 | CtlwFlags::QM2)) | mode.flags();
        self.with_flags(flags)
    }

    pub const fn subaddress(self) -> u8 {
        ((self.0 & CCTLW_M_A) >> CCTLW_V_A) as u8
    }

    pub const fn slot(self) -> u8 {
        ((self.0 & CCTLW_M_N) >> CCTLW_V_N) as u8
    }

    pub const fn crate_addr(self) -> u8 {
        ((self.0 & CCTLW_M_C) >> CCTLW_V_C) as u8
    }

    pub const fn function(self) -> u8 {
        ((self.0 & CCTLW_M_F) >> CCTLW_V_F) as u8
    }

    pub fn flags(self) -> CtlwFlags {
        CtlwFlags::from_bits_truncate(self.0)
    }

    pub fn q_mode(self) -> QMode {
        QMode::from_flags(self.flags())
    }

    pub fn function_kind(self) -> FunctionKind {
        match self.function() {
            0..=7 => FunctionKind::Read,
            16..=23 => FunctionKind::Write,
            _ => FunctionKind::Control,
        }
    }

    /// Bytes per transferred data word.
    pub fn word_bytes(self) -> usize {
        if self.flags().contains(CtlwFlags::P24) {
            4
        } else {
            2
        }
    }
}

fn check_field(field: &'static str, value: u8, max: u8) -> Result<()> {
    if value > max {
        return Err(CamError::FieldOutOfRange { field, value, max });
    }
    Ok(())
}
