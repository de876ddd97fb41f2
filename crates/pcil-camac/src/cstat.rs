//! CAMAC completion status word (CSTAT), written by the remote controller for
//! every operation of a package.
//!
//! | bits  | field                                    |
//! |-------|------------------------------------------|
//! | 0-13  | remaining word count                     |
//! | 14-22 | [`CstatFlags`]                           |
//! | 23-27 | module / slot echo                       |
//! | 28-31 | crate echo                               |

use bitflags::bitflags;

pub const CSTAT_M_WC: u32 = 0x0000_3FFF;
pub const CSTAT_V_N: u32 = 23;
pub const CSTAT_M_N: u32 = 0x0F80_0000;
pub const CSTAT_V_C: u32 = 28;
pub const CSTAT_M_C: u32 = 0xF000_0000;

/// Largest remaining-word-count the 14-bit field can hold.
pub const MAX_WORD_COUNT: u16 = CSTAT_M_WC as u16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CstatFlags: u32 {
        /// Look-at-me attention request from the addressed module.
        const LAM = 1 << 14;
        /// Hardware error summary.
        const ERR = 1 << 15;
        const Q = 1 << 16;
        const X = 1 << 17;
        /// Operation finished.
        const DONE = 1 << 18;
        /// Crate did not answer in time.
        const TIMEOUT = 1 << 19;
        /// Terminated by word count exhaustion.
        const WCNT = 1 << 20;
        /// Terminated by scan exhaustion.
        const SCAN = 1 << 21;
        /// Terminated by the Q/X mode rules.
        const MODE = 1 << 22;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct CompletionStatus(u32);

impl CompletionStatus {
    pub fn new(crate_addr: u8, slot: u8) -> Self {
        Self((((crate_addr as u32) << CSTAT_V_C) & CSTAT_M_C) | (((slot as u32) << CSTAT_V_N) & CSTAT_M_N))
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn with_flags(self, flags: CstatFlags) -> Self {
        Self(self.0 | flags.bits())
    }

    /// Sets the remaining word count, saturating at the field width.
    pub fn with_remaining(self, words: u32) -> Self {
        let wc = words.min(CSTAT_M_WC);
        Self((self.0 & !CSTAT_M_WC) | wc)
    }

    pub fn flags(self) -> CstatFlags {
        CstatFlags::from_bits_truncate(self.0)
    }

    pub const fn remaining(self) -> u16 {
        (self.0 & CSTAT_M_WC) as u16
    }

    pub const fn crate_addr(self) -> u8 {
        ((self.0 & CSTAT_M_C) >> CSTAT_V_C) as u8
    }

    pub const fn slot(self) -> u8 {
        ((self.0 & CSTAT_M_N) >> CSTAT_V_N) as u8
    }

    pub fn x(self) -> bool {
        self.flags().contains(CstatFlags::X)
    }

    pub fn q(self) -> bool {
        self.flags().contains(CstatFlags::Q)
    }

    pub fn done(self) -> bool {
        self.flags().contains(CstatFlags::DONE)
    }
}
