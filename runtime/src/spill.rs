//! Register spill/restore sequences.
//!
//! These moves are an ABI: the runtime classifies an unknown pc by matching
//! the exact bytes of a spill, so the emitter produces exactly one canonical
//! encoding per `(mode, register, storage, addr16)` and the recognizer is
//! the same table read backwards. Keep [`emit_spill_or_restore`] and
//! [`decode_spill`] in lockstep.
//!
//! Encodings, from shortest to longest:
//!
//! | mode | storage | reg   | bytes |
//! |------|---------|-------|-------|
//! | x86  | mcontext| xax   | `A3/A1 disp32` |
//! | x86  | mcontext| other | `89/8B /r(disp32) disp32` |
//! | x86  | tls     | xax   | `[67] 64 A3/A1 disp16/32` |
//! | x86  | tls     | other | `[67] 64 89/8B /r disp16/32` |
//! | x64  | tls     | xax   | `67 65 48 A3/A1 disp32` |
//! | x64  | tls     | other | `65 48 89/8B /r sib disp32` |
//!
//! On x64 everything goes through TLS and the xax form always carries the
//! address-size prefix (it shortens the absolute moffs to 32 bits).

use crate::formats::{
    ADDR_PREFIX, MOV_MEM2REG_OPCODE, MOV_MEM2XAX_OPCODE, MOV_REG2MEM_OPCODE, MOV_XAX2MEM_OPCODE,
    REX_W_PREFIX,
};
use fraglink_asm_x64::{modrm, reg, CodeSink, IsaMode, SEG_FS, SEG_GS};

/// Where a spill lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillStorage {
    /// A segment-addressed thread-local scratch slot.
    Tls,
    /// An absolute mcontext field (32-bit gencode only).
    Mcontext,
}

/// Size classes for layout arithmetic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillReg {
    /// XAX gets the short absolute-moffs form.
    Xax,
    /// Everything else takes a ModR/M byte.
    Other,
}

/// One spill or restore, fully described.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpillDescriptor {
    pub mode: IsaMode,
    /// Hardware encoding; must be below 8 (gencode never spills r8-r15 via
    /// this path).
    pub reg: u8,
    /// Spill (register to memory) vs. restore.
    pub spill: bool,
    pub storage: SpillStorage,
    /// TLS offset, or the absolute address for mcontext storage.
    pub offs: u32,
    /// 16-bit displacement via the address-size prefix (x86 TLS only).
    pub addr16: bool,
}

/// Deterministic byte length of the sequence [`emit_spill_or_restore`]
/// produces. The exit-stub layout constants are built from this.
#[must_use]
pub const fn size_of_spill(
    mode: IsaMode,
    reg: SpillReg,
    storage: SpillStorage,
    addr16: bool,
) -> usize {
    match (mode, storage) {
        (IsaMode::X64, _) => match reg {
            SpillReg::Xax => 8,
            SpillReg::Other => 9,
        },
        (IsaMode::X86, SpillStorage::Tls) => {
            let base = match reg {
                SpillReg::Xax => 3, // seg + opcode + 2-byte disp, adjusted below
                SpillReg::Other => 4,
            };
            if addr16 {
                base + 2 // addr prefix + disp16 (one byte shorter than disp32)
            } else {
                base + 3 // disp32
            }
        }
        (IsaMode::X86, SpillStorage::Mcontext) => match reg {
            SpillReg::Xax => 5,
            SpillReg::Other => 6,
        },
    }
}

fn opcode_for(reg: u8, spill: bool) -> u8 {
    if reg == reg::RAX {
        if spill {
            MOV_XAX2MEM_OPCODE
        } else {
            MOV_MEM2XAX_OPCODE
        }
    } else if spill {
        MOV_REG2MEM_OPCODE
    } else {
        MOV_MEM2REG_OPCODE
    }
}

/// Emit the canonical byte sequence for `desc` into `sink`.
pub fn emit_spill_or_restore(sink: &mut impl CodeSink, desc: &SpillDescriptor) {
    debug_assert!(desc.reg < 8);
    let opcode = opcode_for(desc.reg, desc.spill);
    match desc.mode {
        IsaMode::X64 => {
            debug_assert!(desc.storage == SpillStorage::Tls);
            if desc.reg == reg::RAX {
                sink.put1(ADDR_PREFIX);
                sink.put1(SEG_GS);
                sink.put1(REX_W_PREFIX);
                sink.put1(opcode);
            } else {
                sink.put1(SEG_GS);
                sink.put1(REX_W_PREFIX);
                sink.put1(opcode);
                sink.put1(modrm(0, desc.reg, 0b100));
                sink.put1(0x25); // SIB: absolute disp32
            }
            sink.put4(desc.offs);
        }
        IsaMode::X86 => match desc.storage {
            SpillStorage::Tls => {
                if desc.addr16 {
                    sink.put1(ADDR_PREFIX);
                }
                sink.put1(SEG_FS);
                sink.put1(opcode);
                if desc.reg != reg::RAX {
                    // rm 110 is disp16 under the address-size prefix, rm 101
                    // is disp32 without it
                    sink.put1(modrm(0, desc.reg, if desc.addr16 { 0b110 } else { 0b101 }));
                }
                if desc.addr16 {
                    sink.put2(desc.offs as u16);
                } else {
                    sink.put4(desc.offs);
                }
            }
            SpillStorage::Mcontext => {
                debug_assert!(!desc.addr16);
                sink.put1(opcode);
                if desc.reg != reg::RAX {
                    sink.put1(modrm(0, desc.reg, 0b101));
                }
                sink.put4(desc.offs);
            }
        },
    }
}

/// Convenience: emit into a fresh buffer.
#[must_use]
pub fn spill_bytes(desc: &SpillDescriptor) -> Vec<u8> {
    let mut out = Vec::new();
    emit_spill_or_restore(&mut out, desc);
    debug_assert_eq!(
        out.len(),
        size_of_spill(
            desc.mode,
            if desc.reg == reg::RAX {
                SpillReg::Xax
            } else {
                SpillReg::Other
            },
            desc.storage,
            desc.addr16
        )
    );
    out
}

/// Decode a canonical spill/restore at the start of `bytes`. Returns the
/// descriptor and its length, or `None` if the bytes are not one.
#[must_use]
pub fn decode_spill(bytes: &[u8], mode: IsaMode) -> Option<(SpillDescriptor, usize)> {
    let mut at = 0;
    let next = |at: &mut usize| -> Option<u8> {
        let b = bytes.get(*at).copied();
        *at += 1;
        b
    };
    let mut b = next(&mut at)?;
    let addr16 = b == ADDR_PREFIX;
    if addr16 {
        b = next(&mut at)?;
    }
    let seg = match mode {
        IsaMode::X64 => SEG_GS,
        IsaMode::X86 => SEG_FS,
    };
    let tls = b == seg;
    if tls {
        b = next(&mut at)?;
    }
    match mode {
        IsaMode::X64 => {
            if !tls || b != REX_W_PREFIX {
                return None;
            }
            b = next(&mut at)?;
            let (reg, spill) = match b {
                MOV_XAX2MEM_OPCODE => (reg::RAX, true),
                MOV_MEM2XAX_OPCODE => (reg::RAX, false),
                MOV_REG2MEM_OPCODE | MOV_MEM2REG_OPCODE => {
                    let m = next(&mut at)?;
                    if m & 0xc7 != 0x04 || next(&mut at)? != 0x25 {
                        return None;
                    }
                    ((m >> 3) & 7, b == MOV_REG2MEM_OPCODE)
                }
                _ => return None,
            };
            // the canonical xax form carries the addr prefix, others don't
            if (reg == reg::RAX) != addr16 {
                return None;
            }
            let offs = u32::from_le_bytes(bytes.get(at..at + 4)?.try_into().ok()?);
            at += 4;
            Some((
                SpillDescriptor {
                    mode,
                    reg,
                    spill,
                    storage: SpillStorage::Tls,
                    offs,
                    addr16: false,
                },
                at,
            ))
        }
        IsaMode::X86 => {
            if addr16 && !tls {
                return None;
            }
            let (reg, spill) = match b {
                MOV_XAX2MEM_OPCODE => (reg::RAX, true),
                MOV_MEM2XAX_OPCODE => (reg::RAX, false),
                MOV_REG2MEM_OPCODE | MOV_MEM2REG_OPCODE => {
                    let m = next(&mut at)?;
                    let want_rm = if addr16 { 0b110 } else { 0b101 };
                    if m & 0xc7 != want_rm {
                        return None;
                    }
                    ((m >> 3) & 7, b == MOV_REG2MEM_OPCODE)
                }
                _ => return None,
            };
            let offs = if addr16 {
                let raw: [u8; 2] = bytes.get(at..at + 2)?.try_into().ok()?;
                at += 2;
                u32::from(u16::from_le_bytes(raw))
            } else {
                let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
                at += 4;
                u32::from_le_bytes(raw)
            };
            Some((
                SpillDescriptor {
                    mode,
                    reg,
                    spill,
                    storage: if tls {
                        SpillStorage::Tls
                    } else {
                        SpillStorage::Mcontext
                    },
                    offs,
                    addr16,
                },
                at,
            ))
        }
    }
}

/// Whether `bytes` begin with the canonical TLS spill of `reg` to `offs`.
#[must_use]
pub fn is_raw_tls_spill(bytes: &[u8], mode: IsaMode, reg: u8, offs: u16) -> bool {
    match decode_spill(bytes, mode) {
        Some((d, _)) => {
            d.spill && d.storage == SpillStorage::Tls && d.reg == reg && d.offs == u32::from(offs)
        }
        None => false,
    }
}
