//! VMS-style 32-bit condition values and the CAMAC facility message table.
//!
//! ```text
//!  31   28 27          16 15            3 2    0
//! +-------+--------------+---------------+------+
//! |control|   facility   |  message no.  | sev  |
//! +-------+--------------+---------------+------+
//! ```
//!
//! The low bit of the severity field is set for every successful status.

use core::fmt;

pub const STS_M_SEVERITY: u32 = 0x0000_0007;
pub const STS_M_SUCCESS: u32 = 0x0000_0001;
pub const STS_V_MSG_NO: u32 = 3;
pub const STS_M_MSG_NO: u32 = 0x0000_FFF8;
pub const STS_V_FAC_NO: u32 = 16;
pub const STS_M_FAC_NO: u32 = 0x0FFF_0000;
pub const STS_M_CONTROL: u32 = 0xF000_0000;

/// Facility code of every status produced by this workspace.
pub const CAM_FACILITY: u16 = 0x0803;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Success,
    Error,
    Informational,
    Severe,
}

impl Severity {
    pub const fn code(self) -> u32 {
        match self {
            Severity::Warning => 0,
            Severity::Success => 1,
            Severity::Error => 2,
            Severity::Informational => 3,
            Severity::Severe => 4,
        }
    }

    pub const fn from_code(code: u32) -> Self {
        match code & STS_M_SEVERITY {
            0 => Severity::Warning,
            1 => Severity::Success,
            2 => Severity::Error,
            3 => Severity::Informational,
            _ => Severity::Severe,
        }
    }

    fn letter(self) -> char {
        match self {
            Severity::Warning => 'W',
            Severity::Success => 'S',
            Severity::Error => 'E',
            Severity::Informational => 'I',
            Severity::Severe => 'F',
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct VmsStatus(u32);

impl VmsStatus {
    pub const fn new(facility: u16, msg_no: u16, severity: Severity) -> Self {
        Self(
            (((facility as u32) << STS_V_FAC_NO) & STS_M_FAC_NO)
                | (((msg_no as u32) << STS_V_MSG_NO) & STS_M_MSG_NO)
                | severity.code(),
        )
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_success(self) -> bool {
        self.0 & STS_M_SUCCESS != 0
    }

    pub const fn severity(self) -> Severity {
        Severity::from_code(self.0)
    }

    pub const fn facility(self) -> u16 {
        ((self.0 & STS_M_FAC_NO) >> STS_V_FAC_NO) as u16
    }

    pub const fn msg_no(self) -> u16 {
        ((self.0 & STS_M_MSG_NO) >> STS_V_MSG_NO) as u16
    }

    /// Human-readable text in `%FAC-S-IDENT, text` form.
    pub fn message(self) -> String {
        message(self)
    }
}

impl fmt::Debug for VmsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VmsStatus(0x{:08x})", self.0)
    }
}

impl fmt::Display for VmsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&message(*self))
    }
}

struct MessageEntry {
    ident: &'static str,
    severity: Severity,
    text: &'static str,
}

const fn entry(ident: &'static str, severity: Severity, text: &'static str) -> MessageEntry {
    MessageEntry {
        ident,
        severity,
        text,
    }
}

/// Indexed by message number; slot 0 is unused.
const CAM_MESSAGES: [MessageEntry; 16] = [
    entry("NOMSG", Severity::Severe, "no message for this status"),
    entry("OKOK", Severity::Success, "successful completion"),
    entry("NOX", Severity::Warning, "no X response from module"),
    entry("NOQ", Severity::Warning, "no Q response from module"),
    entry("CTO", Severity::Error, "crate timeout"),
    entry("BADARG", Severity::Error, "invalid argument"),
    entry("NOMEM", Severity::Error, "no free mapping space"),
    entry("COMMERR", Severity::Error, "remote controller reported execution failure"),
    entry("INTERRUPTED", Severity::Warning, "wait interrupted before completion"),
    entry("NOTINIT", Severity::Severe, "controller not initialized"),
    entry("SELFTEST", Severity::Severe, "controller self-test failed"),
    entry("HANDSHAKE", Severity::Severe, "controller handshake failed"),
    entry("MEMERR", Severity::Error, "DMA memory access failed"),
    entry("SHUTDOWN", Severity::Error, "driver is shutting down"),
    entry("PKGFULL", Severity::Error, "package operation limit reached"),
    entry("BADPKG", Severity::Error, "malformed package"),
];

const fn cam(msg_no: u16) -> VmsStatus {
    VmsStatus::new(CAM_FACILITY, msg_no, CAM_MESSAGES[msg_no as usize].severity)
}

pub const CAM_OKOK: VmsStatus = cam(1);
pub const CAM_NOX: VmsStatus = cam(2);
pub const CAM_NOQ: VmsStatus = cam(3);
pub const CAM_CTO: VmsStatus = cam(4);
pub const CAM_BADARG: VmsStatus = cam(5);
pub const CAM_NOMEM: VmsStatus = cam(6);
pub const CAM_COMMERR: VmsStatus = cam(7);
pub const CAM_INTERRUPTED: VmsStatus = cam(8);
pub const CAM_NOTINIT: VmsStatus = cam(9);
pub const CAM_SELFTEST: VmsStatus = cam(10);
pub const CAM_HANDSHAKE: VmsStatus = cam(11);
pub const CAM_MEMERR: VmsStatus = cam(12);
pub const CAM_SHUTDOWN: VmsStatus = cam(13);
pub const CAM_PKGFULL: VmsStatus = cam(14);
pub const CAM_BADPKG: VmsStatus = cam(15);

/// Maps any status word to text. Statuses from other facilities, or with a
/// message number outside the table, get a generic `NOMSG` line carrying the
/// raw value.
pub fn message(status: VmsStatus) -> String {
    let msg_no = status.msg_no() as usize;
    if status.facility() != CAM_FACILITY || msg_no == 0 || msg_no >= CAM_MESSAGES.len() {
        return format!(
            "%CAM-{}-NOMSG, message number 0x{:08x}",
            status.severity().letter(),
            status.bits()
        );
    }

    let entry = &CAM_MESSAGES[msg_no];
    format!(
        "%CAM-{}-{}, {}",
        status.severity().letter(),
        entry.ident,
        entry.text
    )
}
