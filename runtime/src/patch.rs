//! Atomic retargeting of live branches: linking and unlinking.
//!
//! A patch is always one 4-byte displacement store. For inline-lookup stubs
//! the unlink ordering matters: the stub's ending jmp is redirected first so
//! the unlinked path can detect the race, then the exit CTI is pointed at
//! the unlink entry inside the stub (see the race notes in [`crate::ibl`]).

use crate::cache::CodeCache;
use crate::config::RuntimeConfig;
use crate::emit::{insert_relative_target, pc_relative_target};
use crate::error::{EmitError, Result};
use crate::formats::{
    ADDR_PREFIX, CALL_OPCODE, CBR_LONG_LENGTH, CTI_SHORT_REWRITE_LENGTH, JCC_BYTE1,
    JCC_BYTE2_END, JCC_BYTE2_START, JMP_LONG_LENGTH, JMP_OPCODE, JMP_SHORT_LENGTH,
    JMP_SHORT_OPCODE, LOOP_OPCODE_END, LOOP_OPCODE_START, PREFIX_JCC_NOT_TAKEN,
    PREFIX_JCC_TAKEN,
};
use crate::fragment::Fragment;
use crate::gencode::Gencode;
use crate::linkstub::LinkStub;
use crate::stub::{exit_stub_size, ibl_source_for};
use crate::CachePc;

/// Locate the 4-byte displacement of the long CTI at `branch_pc`, walking
/// any branch-hint or address-size prefix.
pub fn exit_cti_disp_pc(cache: &CodeCache, branch_pc: CachePc) -> Result<CachePc> {
    let mut pc = branch_pc;
    let mut opcode = cache.read_u8(pc);
    if opcode == PREFIX_JCC_TAKEN || opcode == PREFIX_JCC_NOT_TAKEN {
        // branch hints are only valid on jcc; mangling strips them elsewhere
        pc += 1;
        opcode = cache.read_u8(pc);
        if opcode != JCC_BYTE1 {
            return Err(EmitError::PatchTargetUnrecognized { pc: branch_pc });
        }
    }
    if opcode == ADDR_PREFIX {
        // used with jecxz/loop*
        pc += 1;
        opcode = cache.read_u8(pc);
    }
    let end = if (LOOP_OPCODE_START..=LOOP_OPCODE_END).contains(&opcode) {
        // a mangled jecxz/loop*: the target rel32 is the last 4 bytes of the
        // 9-byte rewrite
        pc + CTI_SHORT_REWRITE_LENGTH
    } else if opcode == JCC_BYTE1 {
        let second = cache.read_u8(pc + 1);
        if !(JCC_BYTE2_START..=JCC_BYTE2_END).contains(&second) {
            return Err(EmitError::PatchTargetUnrecognized { pc: branch_pc });
        }
        pc + CBR_LONG_LENGTH
    } else if opcode == JMP_OPCODE || opcode == CALL_OPCODE {
        pc + JMP_LONG_LENGTH
    } else {
        return Err(EmitError::PatchTargetUnrecognized { pc: branch_pc });
    };
    Ok(end - 4)
}

/// Retarget the branch at `branch_pc` to `target_pc` with one atomic store.
pub fn patch_branch(
    cache: &CodeCache,
    branch_pc: CachePc,
    target_pc: CachePc,
    hot_patch: bool,
) -> Result<()> {
    let disp_pc = exit_cti_disp_pc(cache, branch_pc)?;
    insert_relative_target(cache, disp_pc, target_pc, hot_patch)?;
    Ok(())
}

/// The cache is assumed self-reachable on x86: rel32 covers it.
#[must_use]
pub fn exit_cti_reaches_target(
    _f: &Fragment,
    _l: &LinkStub,
    _target_pc: CachePc,
) -> bool {
    true
}

/// Skip a branch-hint prefix and the long cbr to find the fallthrough exit
/// CTI that follows it.
#[must_use]
pub fn cbr_fallthrough_exit_cti(cache: &CodeCache, prev_cti_pc: CachePc) -> CachePc {
    let mut pc = prev_cti_pc;
    let first = cache.read_u8(pc);
    if first == PREFIX_JCC_TAKEN || first == PREFIX_JCC_NOT_TAKEN {
        pc += 1;
    }
    pc + CBR_LONG_LENGTH
}

/// If `code_pc` holds a `jmp rel32`, return its target as if the jmp were
/// located at `app_loc`.
#[must_use]
pub fn is_jmp_rel32(cache: &CodeCache, code_pc: CachePc, app_loc: u64) -> Option<u64> {
    if cache.read_u8(code_pc) != JMP_OPCODE {
        return None;
    }
    let disp = i64::from(cache.read_i32(code_pc + 1));
    Some(app_loc.wrapping_add(JMP_LONG_LENGTH as u64).wrapping_add(disp as u64))
}

/// If `code_pc` holds a `jmp rel8`, return its target as if the jmp were
/// located at `app_loc`.
#[must_use]
pub fn is_jmp_rel8(cache: &CodeCache, code_pc: CachePc, app_loc: u64) -> Option<u64> {
    if cache.read_u8(code_pc) != JMP_SHORT_OPCODE {
        return None;
    }
    let disp = i64::from(cache.read_u8(code_pc + 1) as i8);
    Some(app_loc.wrapping_add(JMP_SHORT_LENGTH as u64).wrapping_add(disp as u64))
}

/// Link a direct exit straight to `target_pc` (a fragment's normal entry).
pub fn link_direct_exit(
    cache: &CodeCache,
    _f: &Fragment,
    l: &LinkStub,
    target_pc: CachePc,
    hot_patch: bool,
) -> Result<()> {
    debug_assert!(l.is_direct());
    patch_branch(cache, l.cti_pc, target_pc, hot_patch)?;
    l.linked.set(true);
    log::debug!("linked direct exit at {:#x} -> {target_pc:#x}", l.cti_pc);
    Ok(())
}

/// Unlink a direct exit: the CTI goes back to its stub, which leads to the
/// fcache-return path.
pub fn unlink_direct_exit(cache: &CodeCache, _f: &Fragment, l: &LinkStub) -> Result<()> {
    debug_assert!(l.is_direct());
    patch_branch(cache, l.cti_pc, l.stub_pc, true)?;
    l.linked.set(false);
    Ok(())
}

/// Link an indirect exit to the linked entry of its lookup routine.
///
/// For inline stubs the link is published by the single patch of the exit
/// CTI (after, in the non-atomic mode, retargeting the stub's ending jmp,
/// which a racing executor tolerates via the XCX encoding).
pub fn link_indirect_exit(
    config: &RuntimeConfig,
    gencode: &Gencode,
    cache: &CodeCache,
    f: &Fragment,
    l: &LinkStub,
    hot_patch: bool,
) -> Result<()> {
    let bt = l.branch_type().expect("indirect exit");
    let ibl = gencode.ibl(ibl_source_for(&f.flags), bt);
    if ibl.head_is_inlined {
        if !config.atomic_inlined_linking {
            insert_relative_target(
                cache,
                l.stub_pc + ibl.inline_linkedjmp_offs,
                ibl.linked_entry,
                hot_patch,
            )?;
        }
        patch_branch(cache, l.cti_pc, l.stub_pc, hot_patch)?;
    } else {
        let size = exit_stub_size(config, gencode, &f.flags, l);
        let disp_pc = l.stub_pc + size - 4;
        let cur = pc_relative_target(cache, disp_pc);
        let linked = gencode
            .linked_entry_for(cur)
            .ok_or(EmitError::PatchTargetUnrecognized { pc: disp_pc })?;
        insert_relative_target(cache, disp_pc, linked, hot_patch)?;
    }
    l.linked.set(true);
    Ok(())
}

/// Unlink an indirect exit, race-safely.
///
/// The ending jmp is redirected to the unlinked lookup entry first; only
/// then is the exit CTI pointed at the stub's unlink entry, so an executor
/// that took either branch mid-unlink still reaches a valid path.
pub fn unlink_indirect_exit(
    config: &RuntimeConfig,
    gencode: &Gencode,
    cache: &CodeCache,
    f: &Fragment,
    l: &LinkStub,
) -> Result<()> {
    debug_assert!(!f.flags.coarse_grain);
    // target is always the same, so an unlinked exit needs nothing
    if !l.linked.get() {
        return Ok(());
    }
    let bt = l.branch_type().expect("indirect exit");
    let ibl = gencode.ibl(ibl_source_for(&f.flags), bt);
    if !config.atomic_inlined_linking || !ibl.head_is_inlined {
        let size = exit_stub_size(config, gencode, &f.flags, l);
        let disp_pc = l.stub_pc + size - 4;
        let cur = pc_relative_target(cache, disp_pc);
        let unlinked = gencode
            .unlinked_entry_for(cur)
            .ok_or(EmitError::PatchTargetUnrecognized { pc: disp_pc })?;
        insert_relative_target(cache, disp_pc, unlinked, true)?;
    }
    if ibl.head_is_inlined {
        patch_branch(cache, l.cti_pc, l.stub_pc + ibl.inline_unlink_offs, true)?;
    }
    l.linked.set(false);
    Ok(())
}

/// Recover an indirect exit's stub pc by decoding its exit CTI, adjusting
/// for the unlink-entry offset when the stub is currently unlinked.
#[must_use]
pub fn indirect_linkstub_stub_pc(
    config: &RuntimeConfig,
    gencode: &Gencode,
    cache: &CodeCache,
    f: &Fragment,
    l: &LinkStub,
) -> Option<CachePc> {
    let cti = l.cti_pc;
    let first = cache.read_u8(cti);
    let mut stub = if first == JCC_BYTE1 {
        // a trace may exit through a jne to the stub
        pc_relative_target(cache, cti + 2)
    } else if first == JMP_OPCODE {
        pc_relative_target(cache, cti + 1)
    } else {
        // frozen coarse units keep no jmp to the stub
        debug_assert!(f.flags.coarse_grain);
        cti
    };
    if !l.linked.get() {
        let ibl = gencode.ibl(ibl_source_for(&f.flags), l.branch_type()?);
        if ibl.head_is_inlined {
            stub -= ibl.inline_unlink_offs;
        }
    }
    Some(stub)
}
