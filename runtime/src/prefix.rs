//! Fragment entry prefixes.
//!
//! An indirect-branch-target prefix undoes what the lookup gencode did to
//! find the fragment: it reconstructs OF from the earlier `seto %al`,
//! restores the low five flags with `sahf`, and reloads XAX and XCX from
//! their scratch slots. After it runs, application state is exactly what the
//! exiting fragment left in the save slots, as if no lookup had happened.

use crate::config::RuntimeConfig;
use crate::error::{EmitError, Result};
use crate::formats::{
    ADD_AL_OPCODE, PREFIX_SIZE_FIVE_EFLAGS, PREFIX_SIZE_RESTORE_OF, RESTORE_OF_IMM, SAHF_OPCODE,
};
use crate::fragment::{Fragment, FragmentFlags};
use crate::spill::{
    emit_spill_or_restore, size_of_spill, SpillDescriptor, SpillReg, SpillStorage,
};
use crate::tls::TlsSlot;
use crate::CodeCache;
use fraglink_asm_x64::{reg, CodeSink};

/// `mov %r8 -> %rax` / `mov %r9 -> %rcx`, the x86-to-x64 restore forms.
const SIZE64_MOV_R8_TO_XAX: usize = 3;

fn restore_xax_size(config: &RuntimeConfig) -> usize {
    if config.x86_to_x64_ibl_opt {
        SIZE64_MOV_R8_TO_XAX
    } else {
        size_of_spill(config.mode, SpillReg::Xax, SpillStorage::Tls, false)
    }
}

fn restore_xcx_size(config: &RuntimeConfig) -> usize {
    if config.x86_to_x64_ibl_opt {
        SIZE64_MOV_R8_TO_XAX
    } else {
        size_of_spill(config.mode, SpillReg::Other, SpillStorage::Tls, false)
    }
}

/// Whether fragments with these flags get the full indirect-branch-target
/// prefix. Coarse-grain fragments carry their prefixes in their own unit.
#[must_use]
pub fn use_ibt_prefix(flags: &FragmentFlags) -> bool {
    !flags.coarse_grain
}

/// Size of the indirect-branch-target prefix for `flags`.
#[must_use]
pub fn fragment_ibt_prefix_size(config: &RuntimeConfig, flags: &FragmentFlags) -> usize {
    let base = restore_xax_size(config) + restore_xcx_size(config);
    if flags.writes_eflags_6 {
        base
    } else if flags.writes_eflags_of {
        base + PREFIX_SIZE_FIVE_EFLAGS
    } else {
        base + PREFIX_SIZE_RESTORE_OF + PREFIX_SIZE_FIVE_EFLAGS
    }
}

/// Predicted prefix size for layout purposes, before the prefix is emitted.
#[must_use]
pub fn fragment_prefix_size(config: &RuntimeConfig, flags: &FragmentFlags) -> usize {
    if use_ibt_prefix(flags) {
        fragment_ibt_prefix_size(config, flags)
    } else if config.bb_prefixes {
        restore_xcx_size(config)
    } else {
        0
    }
}

fn append_restore_register(config: &RuntimeConfig, out: &mut Vec<u8>, r: u8) {
    debug_assert!(r == reg::RAX || r == reg::RCX);
    if config.x86_to_x64_ibl_opt {
        // mov %r8 -> %rax: 49 8b c0 / mov %r9 -> %rcx: 49 8b c9
        let src = if r == reg::RAX { reg::R8 } else { reg::R9 };
        out.put1(0x49);
        out.put1(0x8b);
        out.put1(0xc0 | (r << 3) | (src & 7));
    } else {
        let slot = if r == reg::RAX {
            TlsSlot::PrefixXax
        } else {
            TlsSlot::XcxSpill
        };
        emit_spill_or_restore(
            out,
            &SpillDescriptor {
                mode: config.mode,
                reg: r,
                spill: false,
                storage: SpillStorage::Tls,
                offs: u32::from(slot.offset(config.mode)),
                addr16: false,
            },
        );
    }
}

/// Emit the prefix at `f.start_pc` and set `f.prefix_size`.
pub fn emit_fragment_prefix(
    config: &RuntimeConfig,
    cache: &CodeCache,
    f: &mut Fragment,
) -> Result<()> {
    if f.prefix_size != 0 {
        return Err(EmitError::InvalidFragmentState { tag: f.tag });
    }
    let mut out = Vec::new();
    if use_ibt_prefix(&f.flags) {
        if !f.flags.writes_eflags_6 {
            if !f.flags.writes_eflags_of {
                // we did a seto on %al, so adding 0x7f overflows exactly
                // when OF was set (7f not ff: add sets OF for signed
                // operands, CF for unsigned)
                out.put1(ADD_AL_OPCODE);
                out.put1(RESTORE_OF_IMM);
            }
            out.put1(SAHF_OPCODE);
        }
        append_restore_register(config, &mut out, reg::RAX);
        append_restore_register(config, &mut out, reg::RCX);
        debug_assert_eq!(out.len(), fragment_ibt_prefix_size(config, &f.flags));
    } else if config.bb_prefixes {
        append_restore_register(config, &mut out, reg::RCX);
    }
    debug_assert_eq!(out.len(), fragment_prefix_size(config, &f.flags));
    log::debug!(
        "prefix for F{:#x}: {} bytes at {:#x}",
        f.tag,
        out.len(),
        f.start_pc
    );
    cache.write_bytes(f.start_pc, &out);
    f.prefix_size = u8::try_from(out.len()).map_err(|_| EmitError::EncodingImpossible)?;
    Ok(())
}
