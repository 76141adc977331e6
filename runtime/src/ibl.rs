//! Indirect-branch lookup gencode.
//!
//! Two artifacts per `(branch type, source kind)`: a shared lookup routine,
//! and (for sources configured to inline) a byte-exact stub template whose
//! hit path runs inside the exit stub and whose miss path falls into the
//! shared routine.
//!
//! Register protocol at the non-inline linked entry: XBX carries the
//! linkstub pointer (source tag for coarse), XCX carries the application
//! target. Flags are saved with `lahf`/`seto %al` around the probe and
//! restored by the target fragment's prefix on a hit, or on the miss path
//! before leaving for fcache-return.
//!
//! Unlinking an inline stub under non-atomic linking is detected by the
//! executing thread via the low byte of XCX: the stub's unlink path parks
//! the tag and sets `%cl = 1`; the shared unlinked entry discriminates an
//! intentional unlink (`movzx` then `loop`, both flags-safe) from a stale
//! in-flight lookup that lost the race, which retries as a plain miss.

use crate::config::{RuntimeConfig, TableAccess};
use crate::context::{
    dc_coarse_ib_src_offset, dc_gpr_offset, dc_next_tag_offset, dc_table_struct_offset,
};
use crate::error::Result;
use crate::linkstub::{IblBranchType, IblSourceKind};
use crate::tls::TlsSlot;
use crate::{CachePc, CodeCache};
use fraglink_asm_x64::{cc, reg, Assembler, IsaMode, Label, Mem};

/// Distinguished `start_pc` of the probe-terminating sentinel entry.
pub const SENTINEL_START_PC: u64 = 1;

/// A lookup-table entry as the emitted probe reads it: tag then start pc,
/// adjacent, at the table word width. An empty slot has tag 0; a tombstone
/// has tag 0 with the target-delete entry as its start pc.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct IblEntry {
    pub tag: u64,
    pub start_pc: u64,
}

impl IblEntry {
    #[must_use]
    pub fn empty() -> Self {
        Self { tag: 0, start_pc: 0 }
    }

    #[must_use]
    pub fn sentinel() -> Self {
        Self {
            tag: 0,
            start_pc: SENTINEL_START_PC,
        }
    }
}

/// One emitted lookup routine and, when inlined, its stub template.
#[derive(Debug)]
pub struct IblCode {
    pub branch_type: IblBranchType,
    pub source_kind: IblSourceKind,
    pub routine_start: CachePc,
    pub routine_len: usize,
    /// Entry for linked exits (equals `routine_start`).
    pub linked_entry: CachePc,
    /// Entry unlinked exits are pointed at.
    pub unlinked_entry: CachePc,
    /// Where a dying table entry's start pc is redirected.
    pub target_delete_entry: CachePc,
    /// x64 trace fast path: entry past the flag save.
    pub trace_cmp_entry: Option<CachePc>,
    /// Unlinked counterpart of the trace fast path.
    pub trace_cmp_unlinked: Option<CachePc>,

    pub head_is_inlined: bool,
    /// Byte-exact template the exit-stub builder copies.
    pub inline_template: Vec<u8>,
    pub inline_stub_length: usize,
    /// Patch points within a copied template.
    pub inline_linkstub_first_offs: usize,
    pub inline_linkstub_second_offs: usize,
    pub inline_linkedjmp_offs: usize,
    pub inline_unlinkedjmp_offs: usize,
    pub inline_unlink_offs: usize,
}

struct TableRefs {
    mask: Mem,
    table: Mem,
}

fn table_refs(config: &RuntimeConfig, bt: IblBranchType) -> TableRefs {
    match config.table_access {
        TableAccess::Tls => TableRefs {
            mask: Mem::Tls {
                offs: TlsSlot::Mask(bt).offset(config.mode),
            },
            table: Mem::Tls {
                offs: TlsSlot::Table(bt).offset(config.mode),
            },
        },
        TableAccess::ThreadStruct {
            mask_offs,
            table_offs,
        } => TableRefs {
            mask: Mem::BaseDisp {
                base: reg::RDI,
                disp: mask_offs,
            },
            table: Mem::BaseDisp {
                base: reg::RDI,
                disp: table_offs,
            },
        },
    }
}

fn tls(config: &RuntimeConfig, slot: TlsSlot) -> Mem {
    Mem::Tls {
        offs: slot.offset(config.mode),
    }
}

/// `hash & mask` is pre-shifted by the per-type offset; turn it into a byte
/// offset into the table by doubling (or shifting right) as needed.
fn append_hash_scale(a: &mut Assembler, config: &RuntimeConfig, bt: IblBranchType) {
    let log2sz = config.ibl_entry_size().trailing_zeros() as u8;
    let offs = config.hash_offset(bt);
    if offs <= log2sz {
        for _ in 0..(log2sz - offs) {
            a.add_rr(reg::RCX, reg::RCX);
        }
    } else {
        a.shr_r_imm8(reg::RCX, offs - log2sz);
    }
}

fn append_save_eflags(a: &mut Assembler, config: &RuntimeConfig) {
    if config.x86_to_x64_ibl_opt {
        a.mov_rr(reg::R8, reg::RAX);
    } else {
        a.mov_mem_r(tls(config, TlsSlot::PrefixXax), reg::RAX);
    }
    a.lahf();
    a.seto_al();
}

fn append_restore_eflags(a: &mut Assembler, config: &RuntimeConfig) {
    a.add_al_imm8(0x7f);
    a.sahf();
    if config.x86_to_x64_ibl_opt {
        a.mov_rr(reg::RAX, reg::R8);
    } else {
        a.mov_r_mem(reg::RAX, tls(config, TlsSlot::PrefixXax));
    }
}

/// The hit tail: restore app XBX and jump through the entry's start pc to
/// the target fragment's IBT entry (its prefix restores the rest).
fn append_ibl_found(a: &mut Assembler, config: &RuntimeConfig, start_offs: i32) {
    a.mov_r_mem(reg::RBX, tls(config, TlsSlot::IndirectStubSpill));
    if matches!(config.table_access, TableAccess::ThreadStruct { .. }) {
        a.mov_r_mem(reg::RDI, tls(config, TlsSlot::XdiSpill));
    }
    a.jmp_mem(Mem::BaseDisp {
        base: reg::RCX,
        disp: start_offs,
    });
}

/// The probe head: save flags, park the linkstub riding in XBX, hash the
/// target in XCX into a table pointer, and compare tags. On return the
/// assembler sits at the hit path, with misses branched to `miss`.
fn append_ibl_head(
    a: &mut Assembler,
    config: &RuntimeConfig,
    bt: IblBranchType,
    compare_tag: Label,
    miss: Label,
    trace_cmp: Option<Label>,
) {
    append_save_eflags(a, config);
    if let Some(l) = trace_cmp {
        a.bind(l);
    }
    let thread_struct = matches!(config.table_access, TableAccess::ThreadStruct { .. });
    if thread_struct {
        a.mov_mem_r(tls(config, TlsSlot::XdiSpill), reg::RDI);
        a.mov_r_mem(reg::RDI, tls(config, TlsSlot::DcontextBase));
    }
    if config.x86_to_x64_ibl_opt {
        a.mov_rr(reg::R10, reg::RBX);
    } else {
        a.mov_mem_r(tls(config, TlsSlot::LinkstubSpill), reg::RBX);
    }
    // keep the tag in xbx; the copy in xcx becomes the probe pointer
    a.mov_rr(reg::RBX, reg::RCX);
    let refs = if thread_struct {
        a.mov_r_mem(reg::RDI, Mem::BaseDisp { base: reg::RDI, disp: dc_table_struct_offset() });
        table_refs(config, bt)
    } else {
        table_refs(config, bt)
    };
    a.and_r_mem(reg::RCX, refs.mask);
    append_hash_scale(a, config, bt);
    if thread_struct {
        // keep the table base in xdi for the sentinel wraparound
        a.mov_r_mem(reg::RDI, refs.table);
        a.add_rr(reg::RCX, reg::RDI);
    } else {
        a.add_r_mem(reg::RCX, refs.table);
    }
    a.bind(compare_tag);
    append_compare_and_branch(a, config, miss);
}

/// `cmp [probe].tag, xbx ; jne miss`, plus the upper-half zero check when
/// 32-bit gencode probes the 64-bit table.
fn append_compare_and_branch(a: &mut Assembler, config: &RuntimeConfig, miss: Label) {
    a.cmp_mem_r(Mem::BaseDisp { base: reg::RCX, disp: 0 }, reg::RBX);
    a.jcc_short_label(cc::NZ, miss);
    if config.x86_mode_on_x64_table() {
        a.cmp_mem_imm8(Mem::BaseDisp { base: reg::RCX, disp: 4 }, 0);
        a.jcc_short_label(cc::NZ, miss);
    }
}

/// Emit the shared lookup routine for `(bt, source)` at `pc`.
///
/// `inline_head` builds the variant entered from inline stubs: the routine
/// starts directly at the miss loop. `deleted_linkstub_addr` is parked for
/// the dispatcher when a lookup lands on a tombstoned entry;
/// `sourceless_linkstub_addr` replaces the per-exit linkstub for sources
/// that do not carry one (coarse).
pub fn emit_indirect_branch_lookup(
    config: &RuntimeConfig,
    cache: &CodeCache,
    pc: CachePc,
    fcache_return_pc: CachePc,
    bt: IblBranchType,
    source: IblSourceKind,
    inline_head: bool,
    deleted_linkstub_addr: usize,
    sourceless_linkstub_addr: Option<usize>,
) -> Result<IblCode> {
    let mode = config.mode;
    let word = config.table_mode.ptr_size() as i32;
    let entry_size = config.ibl_entry_size() as i32;
    let thread_struct = matches!(config.table_access, TableAccess::ThreadStruct { .. });
    let trace_cmp_applicable = mode == IsaMode::X64 && source == IblSourceKind::Trace;

    let mut a = Assembler::new(mode, pc);
    let compare_tag = a.new_label();
    let next_fragment = a.new_label();
    let fragment_not_found = a.new_label();
    let sentinel_check = a.new_label();
    let trace_cmp = if trace_cmp_applicable && !inline_head {
        Some(a.new_label())
    } else {
        None
    };

    let mut trace_cmp_entry = None;
    let mut trace_cmp_unlinked = None;
    let mut unlinked_entry = 0;

    if inline_head {
        // entered from a stub's miss jmp with flags saved, xbx = tag,
        // xcx = probe pointer, linkstub already parked
        debug_assert!(!thread_struct, "inline heads address tables through TLS");
    } else {
        append_ibl_head(&mut a, config, bt, compare_tag, next_fragment, trace_cmp);
        append_ibl_found(&mut a, config, word);
    }

    // miss loop: an empty slot ends the probe, a live mismatch advances
    a.bind(next_fragment);
    a.cmp_mem_imm8(Mem::BaseDisp { base: reg::RCX, disp: 0 }, 0);
    if config.ibl_sentinel_check {
        a.jcc_short_label(cc::Z, sentinel_check);
    } else {
        a.jcc_label(cc::Z, fragment_not_found);
    }
    a.lea(reg::RCX, reg::RCX, entry_size);
    if inline_head {
        a.bind(compare_tag);
        append_compare_and_branch(&mut a, config, next_fragment);
        append_ibl_found(&mut a, config, word);
    } else {
        a.jmp_short_label(compare_tag);
    }

    if config.ibl_sentinel_check {
        a.bind(sentinel_check);
        a.cmp_mem_imm8(
            Mem::BaseDisp { base: reg::RCX, disp: word },
            SENTINEL_START_PC as i8,
        );
        a.jcc_short_label(cc::NZ, fragment_not_found);
        // wrap to the table start and keep probing
        if thread_struct {
            a.mov_rr(reg::RCX, reg::RDI);
        } else {
            a.mov_r_mem(reg::RCX, table_refs(config, bt).table);
        }
        a.jmp_label(compare_tag);
    }

    // target-delete entry: reached through a tombstone's start pc with all
    // app state except the prefix-restored registers; massage it to look
    // like a miss
    let target_delete_entry = a.cur_pc();
    a.mov_mem_r(tls(config, TlsSlot::IndirectStubSpill), reg::RBX);
    if config.x86_to_x64_ibl_opt {
        a.mov_r_imm(reg::R10, deleted_linkstub_addr as u64);
    } else if mode == IsaMode::X64 {
        a.mov_r_imm(reg::RBX, deleted_linkstub_addr as u64);
        a.mov_mem_r(tls(config, TlsSlot::LinkstubSpill), reg::RBX);
    } else {
        a.mov_mem_imm32(tls(config, TlsSlot::LinkstubSpill), deleted_linkstub_addr as u32);
    }
    // the dying entry's tag rides to the miss path so it lands in next_tag
    a.mov_r_mem(reg::RBX, Mem::BaseDisp { base: reg::RCX, disp: 0 });

    // fragment-not-found: tag back into xcx, state unwound, off to
    // fcache-return pretending to be a direct exit
    a.bind(fragment_not_found);
    a.mov_rr(reg::RCX, reg::RBX);
    let mut old_unlinked: Option<Label> = None;
    if inline_head {
        append_restore_eflags(&mut a, config);
        if config.atomic_inlined_linking {
            unlinked_entry = a.cur_pc();
        } else {
            let l = a.new_label();
            a.bind(l);
            old_unlinked = Some(l);
        }
    }
    if config.x86_to_x64_ibl_opt {
        a.mov_rr(reg::RBX, reg::R10);
    } else {
        a.mov_r_mem(reg::RBX, tls(config, TlsSlot::LinkstubSpill));
    }
    if thread_struct {
        // the head's borrow of xdi (table base) ends here, so the unlinked
        // entries below can be reached with xdi still the app's
        a.mov_r_mem(reg::RDI, tls(config, TlsSlot::XdiSpill));
    }
    if !inline_head {
        if trace_cmp_applicable {
            trace_cmp_unlinked = Some(a.cur_pc());
        }
        append_restore_eflags(&mut a, config);
        unlinked_entry = a.cur_pc();
    }
    a.mov_mem_r(tls(config, TlsSlot::XdiSpill), reg::RDI);
    a.mov_r_mem(reg::RDI, tls(config, TlsSlot::DcontextBase));
    a.mov_mem_r(Mem::BaseDisp { base: reg::RDI, disp: dc_gpr_offset(reg::RAX) }, reg::RAX);
    if source == IblSourceKind::Coarse {
        // no per-exit linkstub: park the source tag for the dispatcher
        a.mov_mem_r(
            Mem::BaseDisp { base: reg::RDI, disp: dc_coarse_ib_src_offset() },
            reg::RBX,
        );
    }
    a.mov_mem_r(Mem::BaseDisp { base: reg::RDI, disp: dc_next_tag_offset() }, reg::RCX);
    if let Some(addr) = sourceless_linkstub_addr {
        a.mov_r_imm(reg::RAX, addr as u64);
    } else {
        a.mov_rr(reg::RAX, reg::RBX);
    }
    a.mov_r_mem(reg::RBX, tls(config, TlsSlot::IndirectStubSpill));
    // fcache-return wants app xax in the direct-stub slot; juggle via xcx,
    // whose value is already parked in next_tag
    a.mov_r_mem(reg::RCX, Mem::BaseDisp { base: reg::RDI, disp: dc_gpr_offset(reg::RAX) });
    a.mov_mem_r(tls(config, TlsSlot::DirectStubSpill), reg::RCX);
    if config.x86_to_x64_ibl_opt {
        a.mov_rr(reg::RCX, reg::R9);
    } else {
        a.mov_r_mem(reg::RCX, tls(config, TlsSlot::XcxSpill));
    }
    a.mov_r_mem(reg::RDI, tls(config, TlsSlot::XdiSpill));
    a.jmp_pc(fcache_return_pc);

    if inline_head && !config.atomic_inlined_linking {
        // unlinked entry with race detection: cl == 1 means an intentional
        // unlink parked the tag; anything else is a lookup that lost the
        // patching race and retries as a miss (loop leaves flags alone)
        unlinked_entry = a.cur_pc();
        a.movzx_r_r8(reg::RCX, reg::RCX);
        a.loop_label(fragment_not_found);
        a.mov_r_mem(reg::RCX, tls(config, TlsSlot::IndirectStubSpill));
        a.mov_mem_r(tls(config, TlsSlot::IndirectStubSpill), reg::RBX);
        a.jmp_short_label(old_unlinked.expect("bound above"));
    }

    if trace_cmp.is_some() {
        // the post-flags entry sits right past spill + lahf + seto
        let flag_save_len = if config.x86_to_x64_ibl_opt { 3 } else { 9 } + 1 + 3;
        trace_cmp_entry = Some(pc + flag_save_len);
    }

    let bytes = a.finish();
    cache.write_bytes(pc, &bytes);
    log::debug!(
        "ibl[{bt:?}/{source:?}] at {pc:#x}: {} bytes, unlinked={unlinked_entry:#x}, \
         target_delete={target_delete_entry:#x}",
        bytes.len()
    );
    Ok(IblCode {
        branch_type: bt,
        source_kind: source,
        routine_start: pc,
        routine_len: bytes.len(),
        linked_entry: pc,
        unlinked_entry,
        target_delete_entry,
        trace_cmp_entry,
        trace_cmp_unlinked,
        head_is_inlined: false,
        inline_template: Vec::new(),
        inline_stub_length: 0,
        inline_linkstub_first_offs: 0,
        inline_linkstub_second_offs: 0,
        inline_linkedjmp_offs: 0,
        inline_unlinkedjmp_offs: 0,
        inline_unlink_offs: 0,
    })
}

/// Build the inline stub template for `ibl` and record its patch offsets.
///
/// The template is 32-bit-only: it stores the linkstub pointer as a 32-bit
/// immediate. Its hit path mirrors the shared head; its miss and unlink
/// paths park the linkstub and fall into the shared routine, which was
/// emitted with `inline_head`.
pub fn emit_inline_ibl_stub(config: &RuntimeConfig, ibl: &mut IblCode) -> Result<()> {
    debug_assert!(config.mode == IsaMode::X86, "inline stubs are 32-bit-only");
    debug_assert!(
        matches!(config.table_access, TableAccess::Tls),
        "inline stubs address tables through TLS"
    );
    let word = config.table_mode.ptr_size() as i32;
    let mut a = Assembler::new(IsaMode::X86, 0);
    let miss = a.new_label();

    append_save_eflags(&mut a, config);
    a.mov_mem_r(tls(config, TlsSlot::IndirectStubSpill), reg::RBX);
    a.mov_rr(reg::RBX, reg::RCX);
    let refs = table_refs(config, ibl.branch_type);
    a.and_r_mem(reg::RCX, refs.mask);
    append_hash_scale(&mut a, config, ibl.branch_type);
    a.add_r_mem(reg::RCX, refs.table);
    append_compare_and_branch(&mut a, config, miss);
    append_ibl_found(&mut a, config, word);

    // unlink entry: the exit CTI points here while the stub is unlinked
    let unlink_offs = a.offset();
    let mut linkstub_second_offs = 0;
    let mut unlinkedjmp_offs = 0;
    if config.atomic_inlined_linking {
        // duplicate the miss path so linking is a single CTI patch
        a.mov_mem_r(tls(config, TlsSlot::IndirectStubSpill), reg::RBX);
        a.mov_mem_imm32(tls(config, TlsSlot::LinkstubSpill), 0);
        linkstub_second_offs = a.offset() - 4;
        unlinkedjmp_offs = a.jmp_disp32_placeholder();
    } else {
        // park the tag and flag the unlink in cl for the shared routine
        a.mov_mem_r(tls(config, TlsSlot::IndirectStubSpill), reg::RCX);
        a.mov_r8_imm8(reg::RCX, 1);
    }

    a.bind(miss);
    a.mov_mem_imm32(tls(config, TlsSlot::LinkstubSpill), 0);
    let linkstub_first_offs = a.offset() - 4;
    let linkedjmp_offs = a.jmp_disp32_placeholder();

    let template = a.finish();
    ibl.head_is_inlined = true;
    ibl.inline_stub_length = template.len();
    ibl.inline_template = template;
    ibl.inline_linkstub_first_offs = linkstub_first_offs;
    ibl.inline_linkstub_second_offs = linkstub_second_offs;
    ibl.inline_linkedjmp_offs = linkedjmp_offs;
    ibl.inline_unlinkedjmp_offs = unlinkedjmp_offs;
    ibl.inline_unlink_offs = unlink_offs;
    Ok(())
}
