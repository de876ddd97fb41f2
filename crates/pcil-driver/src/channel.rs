//! Logical channels callers address the controller through.

use crate::message::{Opcode, OpFlags};
use crate::Priority;

/// Diagnostic function selectors carried in the opcode word.
pub mod diag {
    pub const COUNTER_READ: u8 = 1;
    pub const REGISTER_LOAD: u8 = 2;
    pub const VERSION_READ: u8 = 3;
    pub const MEMORY_DUMP: u8 = 4;
    pub const MEMORY_LOAD: u8 = 5;
    pub const CPU_STATS_READ: u8 = 6;
    pub const LINK_COUNTERS_READ: u8 = 7;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriorityClass {
    High,
    Low,
    /// Pattern traffic; shares the high-priority rings.
    Pattern,
}

impl PriorityClass {
    pub fn priority(self) -> Priority {
        match self {
            PriorityClass::High | PriorityClass::Pattern => Priority::High,
            PriorityClass::Low => Priority::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    LegacyLow,
    LegacyHigh,
    BusMasterLow,
    BusMasterHigh,
    BusMasterRead,
    SendLow,
    SendHigh,
    ReceiveLow,
    ReceiveHigh,
    PatternSend,
    CounterRead,
    RegisterLoad,
    MemoryDump,
    MemoryLoad,
    VersionRead,
    CpuStatsRead,
    LinkCountersRead,
}

/// How a channel's requests are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub class: PriorityClass,
    pub opcode: Opcode,
    pub flags: OpFlags,
    pub function: u8,
}

impl Channel {
    pub const ALL: [Channel; 17] = [
        Channel::LegacyLow,
        Channel::LegacyHigh,
        Channel::BusMasterLow,
        Channel::BusMasterHigh,
        Channel::BusMasterRead,
        Channel::SendLow,
        Channel::SendHigh,
        Channel::ReceiveLow,
        Channel::ReceiveHigh,
        Channel::PatternSend,
        Channel::CounterRead,
        Channel::RegisterLoad,
        Channel::MemoryDump,
        Channel::MemoryLoad,
        Channel::VersionRead,
        Channel::CpuStatsRead,
        Channel::LinkCountersRead,
    ];

    pub fn route(self) -> Route {
        use PriorityClass::{High, Low, Pattern};

        let (class, opcode, flags, function) = match self {
            Channel::LegacyLow => (Low, Opcode::EmulateLegacy, OpFlags::empty(), 0),
            Channel::LegacyHigh => (High, Opcode::EmulateLegacy, OpFlags::empty(), 0),
            Channel::BusMasterLow => (Low, Opcode::BusMasterEmulate, OpFlags::empty(), 0),
            Channel::BusMasterHigh => (High, Opcode::BusMasterEmulate, OpFlags::empty(), 0),
            Channel::BusMasterRead => (Low, Opcode::BusMasterEmulate, OpFlags::BM_READ, 0),
            Channel::SendLow => (Low, Opcode::SendToRemote, OpFlags::empty(), 0),
            Channel::SendHigh => (High, Opcode::SendToRemote, OpFlags::empty(), 0),
            // Receives are the host's half of a remote-initiated exchange: a
            // read-style request the remote answers from its outbound queue.
            Channel::ReceiveLow => (Low, Opcode::SendToRemote, OpFlags::BM_READ, 0),
            Channel::ReceiveHigh => (High, Opcode::SendToRemote, OpFlags::BM_READ, 0),
            Channel::PatternSend => (Pattern, Opcode::SendToRemote, OpFlags::PATTERN, 0),
            Channel::CounterRead => (Low, Opcode::DiagnosticLocal, OpFlags::BM_READ, diag::COUNTER_READ),
            Channel::RegisterLoad => (Low, Opcode::DiagnosticLocal, OpFlags::empty(), diag::REGISTER_LOAD),
            Channel::VersionRead => (Low, Opcode::DiagnosticLocal, OpFlags::BM_READ, diag::VERSION_READ),
            Channel::MemoryDump => (Low, Opcode::DiagnosticRemote, OpFlags::BM_READ, diag::MEMORY_DUMP),
            Channel::MemoryLoad => (Low, Opcode::DiagnosticRemote, OpFlags::empty(), diag::MEMORY_LOAD),
            Channel::CpuStatsRead => (Low, Opcode::DiagnosticRemote, OpFlags::BM_READ, diag::CPU_STATS_READ),
            Channel::LinkCountersRead => {
                (Low, Opcode::DiagnosticRemote, OpFlags::BM_READ, diag::LINK_COUNTERS_READ)
            }
        };
        let flags = if class == Pattern {
            flags | OpFlags::PATTERN
        } else {
            flags
        };
        Route {
            class,
            opcode,
            flags,
            function,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_rides_the_high_rings_with_its_flag() {
        let route = Channel::PatternSend.route();
        assert_eq!(route.class.priority(), Priority::High);
        assert!(route.flags.contains(OpFlags::PATTERN));
    }

    #[test]
    fn no_channel_sets_reply_only_bits() {
        for channel in Channel::ALL {
            let route = channel.route();
            assert!(!route.flags.intersects(OpFlags::STATUS), "{channel:?}");
            assert!(route.opcode != Opcode::SendFromRemote && route.opcode != Opcode::ErrorReport);
        }
    }

    #[test]
    fn diagnostics_carry_distinct_functions() {
        let mut seen: Vec<u8> = Channel::ALL
            .iter()
            .map(|c| c.route())
            .filter(|r| matches!(r.opcode, Opcode::DiagnosticLocal | Opcode::DiagnosticRemote))
            .map(|r| r.function)
            .collect();
        let n = seen.len();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), n);
        assert_eq!(n, 7);
    }
}
