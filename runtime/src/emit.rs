//! Low-level displacement and jump placement.
//!
//! The 4-byte relative displacement is the unit of live-code mutation: a
//! single store of one, through the writable alias, retargets a branch while
//! other threads may be executing it. That only holds if the displacement is
//! contained in one cache line, which [`insert_relative_jump`] refuses to
//! violate and [`crate::pad`] arranges for patchable exits.

use crate::cache::CodeCache;
use crate::error::{EmitError, Result};
use crate::formats::JMP_OPCODE;
use crate::CachePc;
use std::sync::atomic::{compiler_fence, AtomicU32, Ordering};

/// Whether the 4 bytes at `pc` sit inside one cache line.
#[must_use]
pub fn patch_site_contained(pc: CachePc, line_size: usize) -> bool {
    pc / line_size == (pc + 3) / line_size
}

/// Store a 4-byte value as a single store through the writable alias.
///
/// When the site is 4-aligned this is a release store; otherwise it is a
/// single unaligned store, which stays atomic for observers as long as the
/// site does not straddle a cache line (the caller has checked that).
fn store_4(cache: &CodeCache, pc: CachePc, value: u32) {
    let ptr = cache.writable_addr(pc);
    unsafe {
        if (ptr as usize) % 4 == 0 {
            (*ptr.cast::<AtomicU32>()).store(value, Ordering::Release);
        } else {
            compiler_fence(Ordering::Release);
            ptr.cast::<u32>().write_unaligned(value);
            compiler_fence(Ordering::SeqCst);
        }
    }
}

/// Write the 4-byte pc-relative offset of `target` at `pc` and return the pc
/// past it.
///
/// The store is atomic with respect to a thread executing the surrounding
/// code, provided both the before and after states are valid and the site
/// does not straddle a cache line. `hot_patch` asserts another thread may be
/// executing `[pc, pc+4)` right now; reach beyond 32 bits is an error — a
/// caller that can produce longer reach must indirect instead.
pub fn insert_relative_target(
    cache: &CodeCache,
    pc: CachePc,
    target: CachePc,
    hot_patch: bool,
) -> Result<CachePc> {
    let disp = (target as i64) - (pc as i64 + 4);
    let disp = i32::try_from(disp)
        .map_err(|_| EmitError::DisplacementOutOfRange { from: pc, to: target })?;
    if hot_patch && !patch_site_contained(pc, cache.line_size()) {
        return Err(EmitError::CacheLineStraddle { pc });
    }
    store_4(cache, pc, disp as u32);
    Ok(pc + 4)
}

/// Write `jmp rel32` to `target` at `pc` and return the pc past it.
pub fn insert_relative_jump(
    cache: &CodeCache,
    pc: CachePc,
    target: CachePc,
    hot_patch: bool,
) -> Result<CachePc> {
    cache.write_bytes(pc, &[JMP_OPCODE]);
    let disp_pc = pc + 1;
    if hot_patch && !patch_site_contained(disp_pc, cache.line_size()) {
        return Err(EmitError::CacheLineStraddle { pc: disp_pc });
    }
    insert_relative_target(cache, disp_pc, target, false)?;
    Ok(disp_pc + 4)
}

/// Decode the absolute target of the rel32 displacement at `disp_pc`.
#[must_use]
pub fn pc_relative_target(cache: &CodeCache, disp_pc: CachePc) -> CachePc {
    let disp = cache.read_i32(disp_pc);
    (disp_pc as i64 + 4 + i64::from(disp)) as CachePc
}
