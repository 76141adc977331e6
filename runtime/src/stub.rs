//! Exit stub emission.
//!
//! Every fragment exit branches to a short trampoline that parks enough
//! state for the runtime to identify the edge, then leaves for the linked
//! target, a lookup routine, or the fcache-return path:
//!
//! ```text
//! direct:     spill %xax ; mov &linkstub -> %xax ; jmp target
//! indirect:   spill %xbx ; mov &linkstub -> %xbx ; jmp lookup-entry
//! inline ibl: a patched copy of the lookup-head template
//! entrance:   mov tag -> tls (two 32-bit stores on x64) ; jmp coarse-return
//! ```
//!
//! Indirect stubs travel through XBX because the lookup saves flags into XAX
//! with `lahf`; direct stubs use XAX and stay one byte shorter. The exact
//! bytes are load-bearing: `entrance_stub_target_tag` and the TLS-spill
//! recognizer decode them later.

use crate::config::RuntimeConfig;
use crate::emit::{insert_relative_jump, insert_relative_target, pc_relative_target};
use crate::error::Result;
use crate::formats::{
    direct_stub_size, entrance_stub_size, indirect_stub_size, JMP_LONG_LENGTH, JMP_OPCODE,
    MOV_IMM2MEM_OPCODE, MOV_IMM2REG_BASE, REX_W_PREFIX,
};
use crate::fragment::{Fragment, FragmentFlags};
use crate::gencode::Gencode;
use crate::linkstub::{IblSourceKind, LinkStub, LinkStubKind};
use crate::patch::patch_branch;
use crate::spill::{emit_spill_or_restore, SpillDescriptor, SpillStorage};
use crate::tls::TlsSlot;
use crate::{AppTag, CachePc, CodeCache};
use fraglink_asm_x64::{reg, CodeSink, IsaMode, SEG_FS, SEG_GS};

/// Which lookup-routine row serves fragments with these flags.
#[must_use]
pub fn ibl_source_for(flags: &FragmentFlags) -> IblSourceKind {
    if flags.coarse_grain {
        IblSourceKind::Coarse
    } else if flags.is_trace {
        IblSourceKind::Trace
    } else {
        IblSourceKind::Bb
    }
}

/// Byte size of the stub `emit_exit_stub` will produce for this exit.
#[must_use]
pub fn exit_stub_size(
    config: &RuntimeConfig,
    gencode: &Gencode,
    flags: &FragmentFlags,
    l: &LinkStub,
) -> usize {
    match l.kind {
        LinkStubKind::Direct { .. } => {
            if flags.coarse_grain {
                entrance_stub_size(config.mode)
            } else {
                direct_stub_size(config.mode)
            }
        }
        LinkStubKind::Indirect { branch_type } => {
            let ibl = gencode.ibl(ibl_source_for(flags), branch_type);
            if ibl.head_is_inlined {
                ibl.inline_stub_length
            } else {
                indirect_stub_size(config.mode)
            }
        }
    }
}

fn append_mov_imm_ptr(config: &RuntimeConfig, out: &mut Vec<u8>, r: u8, value: u64) {
    match config.mode {
        IsaMode::X64 => {
            out.put1(REX_W_PREFIX);
            out.put1(MOV_IMM2REG_BASE | r);
            out.put8(value);
        }
        IsaMode::X86 => {
            // 32-bit runtimes keep linkstubs (and run apps) below 4GB
            out.put1(MOV_IMM2REG_BASE | r);
            out.put4(value as u32);
        }
    }
}

fn append_tls_spill(config: &RuntimeConfig, out: &mut Vec<u8>, r: u8, slot: TlsSlot) {
    emit_spill_or_restore(
        out,
        &SpillDescriptor {
            mode: config.mode,
            reg: r,
            spill: true,
            storage: SpillStorage::Tls,
            offs: u32::from(slot.offset(config.mode)),
            addr16: true,
        },
    );
}

/// Emit the exit stub for `(f, l)` at `l.stub_pc`; returns its size.
///
/// The stub starts unlinked, except coarse-grain indirect exits, which are
/// always linked.
pub fn emit_exit_stub(
    config: &RuntimeConfig,
    gencode: &Gencode,
    cache: &CodeCache,
    f: &Fragment,
    l: &LinkStub,
) -> Result<usize> {
    let stub_pc = l.stub_pc;
    log::debug!(
        "exit stub for F{:#x} ({:?}) at {stub_pc:#x}",
        f.tag,
        l.kind
    );
    match l.kind {
        LinkStubKind::Direct { target_tag } => {
            if f.flags.coarse_grain {
                emit_entrance_stub(config, gencode, cache, stub_pc, target_tag)
            } else {
                let mut out = Vec::new();
                append_tls_spill(config, &mut out, reg::RAX, TlsSlot::DirectStubSpill);
                append_mov_imm_ptr(config, &mut out, reg::RAX, l.addr() as u64);
                cache.write_bytes(stub_pc, &out);
                let end =
                    insert_relative_jump(cache, stub_pc + out.len(), gencode.fcache_return(), false)?;
                l.linked.set(false);
                debug_assert_eq!(end - stub_pc, direct_stub_size(config.mode));
                Ok(end - stub_pc)
            }
        }
        LinkStubKind::Indirect { branch_type } => {
            let source = ibl_source_for(&f.flags);
            let ibl = gencode.ibl(source, branch_type);
            if ibl.head_is_inlined {
                return emit_inlined_ibl_stub(config, gencode, cache, f, l, stub_pc);
            }
            let (exit_target, starts_linked) = if f.flags.coarse_grain {
                (gencode.coarse_ibl_prefix(branch_type), true)
            } else {
                (ibl.unlinked_entry, false)
            };
            let mut out = Vec::new();
            append_tls_spill(config, &mut out, reg::RBX, TlsSlot::IndirectStubSpill);
            // coarse fragments have no linkstub; the source tag rides instead
            let value = if f.flags.coarse_grain {
                f.tag
            } else {
                l.addr() as u64
            };
            append_mov_imm_ptr(config, &mut out, reg::RBX, value);
            cache.write_bytes(stub_pc, &out);
            let end = insert_relative_jump(cache, stub_pc + out.len(), exit_target, false)?;
            l.linked.set(starts_linked);
            debug_assert_eq!(end - stub_pc, indirect_stub_size(config.mode));
            Ok(end - stub_pc)
        }
    }
}

/// Copy the inline lookup template and patch in this exit's particulars.
/// The stub is created in the unlinked state: the exit CTI targets the
/// unlink entry inside the stub.
fn emit_inlined_ibl_stub(
    config: &RuntimeConfig,
    gencode: &Gencode,
    cache: &CodeCache,
    f: &Fragment,
    l: &LinkStub,
    stub_pc: CachePc,
) -> Result<usize> {
    let ibl = gencode.ibl(ibl_source_for(&f.flags), l.branch_type().expect("indirect"));
    debug_assert!(ibl.head_is_inlined);
    cache.write_bytes(stub_pc, &ibl.inline_template);

    patch_branch(cache, l.cti_pc, stub_pc + ibl.inline_unlink_offs, false)?;

    if config.atomic_inlined_linking {
        insert_relative_target(
            cache,
            stub_pc + ibl.inline_linkedjmp_offs,
            ibl.linked_entry,
            false,
        )?;
        insert_relative_target(
            cache,
            stub_pc + ibl.inline_unlinkedjmp_offs,
            ibl.unlinked_entry,
            false,
        )?;
    } else {
        // one ending jmp serves both states; it starts out unlinked
        insert_relative_target(
            cache,
            stub_pc + ibl.inline_linkedjmp_offs,
            ibl.unlinked_entry,
            false,
        )?;
    }

    let l_imm = (l.addr() as u64) as u32;
    cache.write_bytes(stub_pc + ibl.inline_linkstub_first_offs, &l_imm.to_le_bytes());
    if config.atomic_inlined_linking {
        cache.write_bytes(
            stub_pc + ibl.inline_linkstub_second_offs,
            &l_imm.to_le_bytes(),
        );
    }
    l.linked.set(false);
    Ok(ibl.inline_stub_length)
}

/// Emit a coarse-grain entrance stub: store the target tag into TLS (two
/// 32-bit halves on x64), then jump to the coarse fcache-return prefix.
/// The ending jmp starts exactly `JMP_LONG_LENGTH` bytes before the stub
/// end so `entrance_stub_jmp` can find it by subtraction.
fn emit_entrance_stub(
    config: &RuntimeConfig,
    gencode: &Gencode,
    cache: &CodeCache,
    stub_pc: CachePc,
    target_tag: AppTag,
) -> Result<usize> {
    let mut out = Vec::new();
    let slot = u32::from(TlsSlot::DirectStubSpill.offset(config.mode));
    match config.mode {
        IsaMode::X64 => {
            // no 8-byte immediate-to-memory form: split the tag into two
            // 32-bit stores, low half first; the stores only become
            // reachable through the ending jmp and the tag never changes
            // after emission
            for (off, half) in [
                (slot, target_tag as u32),
                (slot + 4, (target_tag >> 32) as u32),
            ] {
                out.put1(SEG_GS);
                out.put1(MOV_IMM2MEM_OPCODE);
                out.put1(0x04); // modrm: no base, SIB follows
                out.put1(0x25); // SIB: absolute disp32
                out.put4(off);
                out.put4(half);
            }
        }
        IsaMode::X86 => {
            out.put1(crate::formats::ADDR_PREFIX);
            out.put1(SEG_FS);
            out.put1(MOV_IMM2MEM_OPCODE);
            out.put1(0x06); // modrm: disp16
            out.put2(slot as u16);
            debug_assert!(u32::try_from(target_tag).is_ok());
            out.put4(target_tag as u32);
        }
    }
    cache.write_bytes(stub_pc, &out);
    let end = insert_relative_jump(
        cache,
        stub_pc + out.len(),
        gencode.fcache_return_coarse_prefix(),
        false,
    )?;
    debug_assert_eq!(end - stub_pc, entrance_stub_size(config.mode));
    Ok(end - stub_pc)
}

/// Pc of the ending `jmp` of an entrance stub, located by the stub's
/// leading byte (GS prefix on x64, addr-size prefix on x86).
#[must_use]
pub fn entrance_stub_jmp(cache: &CodeCache, stub: CachePc) -> CachePc {
    let size = if cache.read_u8(stub) == SEG_GS {
        entrance_stub_size(IsaMode::X64)
    } else {
        entrance_stub_size(IsaMode::X86)
    };
    stub + size - JMP_LONG_LENGTH
}

/// Decode the jmp target of an entrance stub.
#[must_use]
pub fn entrance_stub_jmp_target(cache: &CodeCache, stub: CachePc) -> CachePc {
    pc_relative_target(cache, entrance_stub_jmp(cache, stub) + 1)
}

/// Decode the target tag an entrance stub stores.
#[must_use]
pub fn entrance_stub_target_tag(cache: &CodeCache, stub: CachePc) -> AppTag {
    if cache.read_u8(stub) == SEG_GS {
        let lo = cache.read_i32(stub + 8) as u32;
        let hi = cache.read_i32(stub + 12 + 8) as u32;
        (u64::from(hi) << 32) | u64::from(lo)
    } else {
        u64::from(cache.read_i32(stub + 6) as u32)
    }
}

/// Whether the bytes at `stub` look like an entrance stub (as opposed to a
/// fragment body or a coarse indirect stub).
#[must_use]
pub fn coarse_is_entrance_stub(cache: &CodeCache, stub: CachePc) -> bool {
    let first = cache.read_u8(stub);
    if first != SEG_GS && first != crate::formats::ADDR_PREFIX {
        return false;
    }
    cache.read_u8(entrance_stub_jmp(cache, stub)) == JMP_OPCODE
}
