//! Wire-format constants.
//!
//! Every raw opcode, prefix byte, and fixed instruction length that emitted
//! gencode and the byte-level recognizers agree on lives here, so the whole
//! ABI between emitter and decoder is auditable in one place. Stub layout
//! arithmetic derives from these plus the spill-sequence sizes in
//! [`crate::spill`].

use crate::spill::{self, SpillStorage};
use fraglink_asm_x64::IsaMode;

/// Patchable displacements are 4 bytes, even on x64.
pub const CTI_PATCH_SIZE: usize = 4;

/// `jmp rel32`.
pub const JMP_OPCODE: u8 = 0xe9;
/// `jmp rel8`.
pub const JMP_SHORT_OPCODE: u8 = 0xeb;
/// `call rel32`.
pub const CALL_OPCODE: u8 = 0xe8;
/// First byte of a two-byte `jcc rel32`.
pub const JCC_BYTE1: u8 = 0x0f;
/// Second-byte range of `jcc rel32`.
pub const JCC_BYTE2_START: u8 = 0x80;
pub const JCC_BYTE2_END: u8 = 0x8f;
/// Static branch-hint prefixes, valid only on `jcc`.
pub const PREFIX_JCC_NOT_TAKEN: u8 = 0x2e;
pub const PREFIX_JCC_TAKEN: u8 = 0x3e;
/// Address-size prefix, used with `jecxz`/`loop*` and 16-bit displacements.
pub const ADDR_PREFIX: u8 = 0x67;
/// Opcode range of `loopne`/`loope`/`loop`/`jecxz`.
pub const LOOP_OPCODE_START: u8 = 0xe0;
pub const LOOP_OPCODE_END: u8 = 0xe3;

pub const JMP_LONG_LENGTH: usize = 5;
pub const JMP_SHORT_LENGTH: usize = 2;
/// `jcc rel32` without a branch hint.
pub const CBR_LONG_LENGTH: usize = 6;
/// A mangled `jecxz`/`loop*`: the short cti over a `jmp rel8` over a
/// `jmp rel32`, excluding any address-size prefix.
pub const CTI_SHORT_REWRITE_LENGTH: usize = 9;

/// Raw move opcodes the spill sequencer and its recognizer share.
pub const MOV_XAX2MEM_OPCODE: u8 = 0xa3;
pub const MOV_MEM2XAX_OPCODE: u8 = 0xa1;
pub const MOV_REG2MEM_OPCODE: u8 = 0x89;
pub const MOV_MEM2REG_OPCODE: u8 = 0x8b;
pub const MOV_IMM2MEM_OPCODE: u8 = 0xc7;
/// Base of the `mov imm -> reg` opcode family (`0xb8 + reg`).
pub const MOV_IMM2REG_BASE: u8 = 0xb8;

pub const REX_W_PREFIX: u8 = 0x48;

pub const LAHF_OPCODE: u8 = 0x9f;
pub const SAHF_OPCODE: u8 = 0x9e;
/// `add $imm8, %al`, used to reconstruct OF from a prior `seto %al`.
pub const ADD_AL_OPCODE: u8 = 0x04;
/// The immediate that makes `add %al` overflow exactly when OF was set.
pub const RESTORE_OF_IMM: u8 = 0x7f;
/// `seto %al` length and the `sahf` length, as prefix-size building blocks.
pub const PREFIX_SIZE_RESTORE_OF: usize = 2;
pub const PREFIX_SIZE_FIVE_EFLAGS: usize = 1;

/// `mov imm -> reg` instruction length at pointer width.
#[must_use]
pub const fn mov_imm2reg_size(mode: IsaMode) -> usize {
    match mode {
        IsaMode::X64 => 10, // REX.W + opcode + imm64
        IsaMode::X86 => 5,  // opcode + imm32
    }
}

/// Fine-grain direct exit stub:
/// `spill xax ; mov &linkstub -> xax ; jmp target`.
#[must_use]
pub const fn direct_stub_size(mode: IsaMode) -> usize {
    spill::size_of_spill(mode, spill::SpillReg::Xax, SpillStorage::Tls, true)
        + mov_imm2reg_size(mode)
        + JMP_LONG_LENGTH
}

/// Fine-grain indirect exit stub (non-inline):
/// `spill xbx ; mov &linkstub -> xbx ; jmp ibl-entry`.
#[must_use]
pub const fn indirect_stub_size(mode: IsaMode) -> usize {
    spill::size_of_spill(mode, spill::SpillReg::Other, SpillStorage::Tls, true)
        + mov_imm2reg_size(mode)
        + JMP_LONG_LENGTH
}

/// Coarse-grain entrance stub: direct stores of the target tag into TLS
/// (two 32-bit halves on x64, one addr16 store on x86) plus the ending jmp.
#[must_use]
pub const fn entrance_stub_size(mode: IsaMode) -> usize {
    match mode {
        // 2 x (gs-prefix + opcode + modrm + sib + disp32 + imm32)
        IsaMode::X64 => 2 * 12 + JMP_LONG_LENGTH,
        // addr16-prefix + fs-prefix + opcode + modrm + disp16 + imm32
        IsaMode::X86 => 10 + JMP_LONG_LENGTH,
    }
}
