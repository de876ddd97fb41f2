//! In-memory CAMAC crates the emulated controller executes packages against.

use std::collections::HashMap;

use pcil_camac::{CompletionStatus, ControlWord, CstatFlags, CtlwFlags, FunctionKind, QMode};

const SUBADDRESSES: usize = 16;
/// 24-bit CAMAC data path.
const DATA_MASK: u32 = 0x00FF_FFFF;

/// F8: test look-at-me.
const F_TEST_LAM: u8 = 8;
/// F9: clear module.
const F_CLEAR: u8 = 9;
/// F10: clear look-at-me.
const F_CLEAR_LAM: u8 = 10;

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub registers: [u32; SUBADDRESSES],
    pub lam: bool,
    /// Subaddresses that answer without Q.
    pub no_q: u16,
}

#[derive(Debug, Default)]
pub struct CrateModel {
    modules: HashMap<(u8, u8), Module>,
}

impl CrateModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, crate_addr: u8, slot: u8) -> &mut Module {
        self.modules.entry((crate_addr, slot)).or_default()
    }

    pub fn module(&self, crate_addr: u8, slot: u8) -> Option<&Module> {
        self.modules.get(&(crate_addr, slot))
    }

    /// Executes one operation. `data` is the operation's data area; reads fill
    /// it and writes consume it, one word per `ctlw.word_bytes()`.
    pub fn execute(&mut self, ctlw: ControlWord, data: &mut [u8]) -> CompletionStatus {
        let status = CompletionStatus::new(ctlw.crate_addr(), ctlw.slot());
        let Some(module) = self.modules.get_mut(&(ctlw.crate_addr(), ctlw.slot())) else {
            return status
                .with_flags(CstatFlags::DONE)
                .with_remaining((data.len() / ctlw.word_bytes()) as u32);
        };

        let mut flags = CstatFlags::X | CstatFlags::DONE;
        if module.lam {
            flags |= CstatFlags::LAM;
        }

        let word_bytes = ctlw.word_bytes();
        let words = data.len() / word_bytes;
        let step = ctlw
            .flags()
            .intersects(CtlwFlags::INCREMENT | CtlwFlags::SCAN_SUBADDRESS);
        let mut sub = ctlw.subaddress() as usize;
        let mut done = 0;

        match ctlw.function_kind() {
            FunctionKind::Read | FunctionKind::Write if words == 0 => {
                flags |= q_flag(module, sub);
            }
            FunctionKind::Read | FunctionKind::Write => {
                let read = ctlw.function_kind() == FunctionKind::Read;
                while done < words {
                    let q = q_flag(module, sub);
                    if q.is_empty() && ctlw.q_mode() == QMode::StopOnNoQ {
                        break;
                    }
                    flags |= q;
                    let chunk = &mut data[done * word_bytes..(done + 1) * word_bytes];
                    if read {
                        let value = module.registers[sub];
                        chunk.copy_from_slice(&value.to_le_bytes()[..word_bytes]);
                    } else {
                        let mut bytes = [0u8; 4];
                        bytes[..word_bytes].copy_from_slice(chunk);
                        module.registers[sub] = u32::from_le_bytes(bytes) & DATA_MASK;
                    }
                    done += 1;
                    if step {
                        sub = (sub + 1) % SUBADDRESSES;
                    }
                }
            }
            FunctionKind::Control => {
                match ctlw.function() {
                    F_TEST_LAM => {
                        if module.lam {
                            flags |= CstatFlags::Q;
                        }
                    }
                    F_CLEAR => {
                        module.registers = [0; SUBADDRESSES];
                        flags |= CstatFlags::Q;
                    }
                    F_CLEAR_LAM => {
                        module.lam = false;
                        flags.remove(CstatFlags::LAM);
                        flags |= CstatFlags::Q;
                    }
                    _ => flags |= CstatFlags::Q,
                }
                done = words;
            }
        }

        if done < words {
            flags |= CstatFlags::WCNT;
        }
        status
            .with_flags(flags)
            .with_remaining((words - done) as u32)
    }
}

fn q_flag(module: &Module, sub: usize) -> CstatFlags {
    if module.no_q & (1 << sub) != 0 {
        CstatFlags::empty()
    } else {
        CstatFlags::Q
    }
}
