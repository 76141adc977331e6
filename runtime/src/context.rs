//! Per-thread runtime state and the cache-boundary context switches.
//!
//! The boundary is a message-passing interface materialized in the dcontext:
//! entering the cache consumes the target pc from its TLS slot with all
//! application state restored; leaving the cache deposits the linkstub of
//! the exiting edge in `last_exit` (and XAX) and the application target in
//! `next_tag`, with the full register file saved in the mcontext.
//!
//! Field offsets are taken from the structs themselves, so the emitted
//! gencode cannot drift from the Rust-side layout.

use crate::config::{RuntimeConfig, SimdPolicy};
use crate::error::Result;
use crate::tls::TlsSlot;
use crate::{CachePc, CodeCache};
use fraglink_asm_x64::{cc, reg, Assembler, IsaMode, Mem};
use memoffset::offset_of;

/// Application machine state, saved on every transition out of the cache.
#[repr(C)]
#[derive(Debug)]
pub struct Mcontext {
    /// General-purpose registers, indexed by hardware encoding.
    pub gprs: [u64; 16],
    pub xflags: u64,
    /// One 64-byte slot per SIMD register; SSE saves use the low 16 bytes.
    pub simd: [[u8; 64]; 16],
    pub opmask: [u64; 8],
}

/// Per-thread runtime state the emitted gencode reads and writes.
#[repr(C)]
#[derive(Debug)]
pub struct Dcontext {
    pub mcontext: Mcontext,
    /// Application target of the last cache exit.
    pub next_tag: u64,
    /// Linkstub identifying the exiting edge.
    pub last_exit: u64,
    /// Source tag of a coarse-grain indirect exit.
    pub coarse_ib_src: u64,
    /// Stack the dispatcher runs on.
    pub dstack: u64,
    /// Per-thread lookup-table struct (private-table configurations).
    pub table_struct: u64,
}

impl Mcontext {
    /// An all-zero register file.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            gprs: [0; 16],
            xflags: 0,
            simd: [[0; 64]; 16],
            opmask: [0; 8],
        }
    }
}

impl Dcontext {
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            mcontext: Mcontext::zeroed(),
            next_tag: 0,
            last_exit: 0,
            coarse_ib_src: 0,
            dstack: 0,
            table_struct: 0,
        }
    }
}

fn i32_of(off: usize) -> i32 {
    i32::try_from(off).expect("dcontext offsets fit in disp32")
}

/// Offset of a saved GPR within the dcontext.
#[must_use]
pub fn dc_gpr_offset(enc: u8) -> i32 {
    i32_of(offset_of!(Dcontext, mcontext) + offset_of!(Mcontext, gprs) + 8 * usize::from(enc))
}

#[must_use]
pub fn dc_xflags_offset() -> i32 {
    i32_of(offset_of!(Dcontext, mcontext) + offset_of!(Mcontext, xflags))
}

#[must_use]
pub fn dc_simd_offset(i: u8) -> i32 {
    i32_of(offset_of!(Dcontext, mcontext) + offset_of!(Mcontext, simd) + 64 * usize::from(i))
}

#[must_use]
pub fn dc_opmask_offset(i: u8) -> i32 {
    i32_of(offset_of!(Dcontext, mcontext) + offset_of!(Mcontext, opmask) + 8 * usize::from(i))
}

#[must_use]
pub fn dc_next_tag_offset() -> i32 {
    i32_of(offset_of!(Dcontext, next_tag))
}

#[must_use]
pub fn dc_last_exit_offset() -> i32 {
    i32_of(offset_of!(Dcontext, last_exit))
}

#[must_use]
pub fn dc_coarse_ib_src_offset() -> i32 {
    i32_of(offset_of!(Dcontext, coarse_ib_src))
}

#[must_use]
pub fn dc_dstack_offset() -> i32 {
    i32_of(offset_of!(Dcontext, dstack))
}

#[must_use]
pub fn dc_table_struct_offset() -> i32 {
    i32_of(offset_of!(Dcontext, table_struct))
}

/// Number of caller-saved XMM registers preserved across the boundary.
#[must_use]
pub fn num_simd_sse_saved(mode: IsaMode) -> u8 {
    match mode {
        IsaMode::X64 => 6,
        IsaMode::X86 => 8,
    }
}

fn dc(base_disp: i32) -> Mem {
    Mem::BaseDisp {
        base: reg::RDI,
        disp: base_disp,
    }
}

fn tls(mode: IsaMode, slot: TlsSlot) -> Mem {
    Mem::Tls {
        offs: slot.offset(mode),
    }
}

/// Borrow XDI: spill the application value and load the dcontext.
fn append_get_dcontext(a: &mut Assembler, mode: IsaMode) {
    a.mov_mem_r(tls(mode, TlsSlot::XdiSpill), reg::RDI);
    a.mov_r_mem(reg::RDI, tls(mode, TlsSlot::DcontextBase));
}

/// Save or restore the SIMD file, dispatching to a ZMM path at run time
/// when the AVX-512 policy is in effect.
fn append_simd(a: &mut Assembler, config: &RuntimeConfig, save: bool) {
    let n_sse = num_simd_sse_saved(config.mode);
    match config.simd {
        SimdPolicy::None => {}
        SimdPolicy::Sse => {
            for i in 0..n_sse {
                let mem = dc(dc_simd_offset(i));
                if save {
                    a.movdqa_mem_x(mem, i);
                } else {
                    a.movdqa_x_mem(i, mem);
                }
            }
        }
        SimdPolicy::Avx512 { in_use_flag } => {
            // no processor has AVX-512 without SSE; both paths are emitted
            // and the in-use byte picks one per switch
            debug_assert!(config.mode == IsaMode::X64);
            let zmm_path = a.new_label();
            let done = a.new_label();
            a.cmp_mem8_imm8(Mem::RipRel { target: in_use_flag }, 0);
            a.jcc_label(cc::NZ, zmm_path);
            for i in 0..n_sse {
                let mem = dc(dc_simd_offset(i));
                if save {
                    a.movdqa_mem_x(mem, i);
                } else {
                    a.movdqa_x_mem(i, mem);
                }
            }
            a.jmp_label(done);
            a.bind(zmm_path);
            for i in 0..16 {
                let mem = dc(dc_simd_offset(i));
                if save {
                    a.vmovdqa64_mem_z(mem, i);
                } else {
                    a.vmovdqa64_z_mem(i, mem);
                }
            }
            for i in 0..8 {
                let mem = dc(dc_opmask_offset(i));
                if save {
                    a.kmovw_mem_k(mem, i);
                } else {
                    a.kmovw_k_mem(i, mem);
                }
            }
            a.bind(done);
        }
    }
}

/// Call a hook with the scratch the surrounding sequence still needs saved.
fn append_hook_call(a: &mut Assembler, hook: Option<usize>) {
    if let Some(target) = hook {
        a.push_r(reg::RDI);
        a.push_r(reg::RSI);
        a.push_r(reg::RAX);
        a.call_pc(target);
        a.pop_r(reg::RAX);
        a.pop_r(reg::RSI);
        a.pop_r(reg::RDI);
    }
}

/// Emitted cache-boundary routines.
#[derive(Debug)]
pub struct ContextSwitchRoutines {
    pub fcache_enter: CachePc,
    pub fcache_return: CachePc,
    /// Entry for coarse entrance stubs: recovers the tag from TLS, fakes a
    /// sourceless linkstub, then joins the common save path.
    pub fcache_return_coarse: CachePc,
    /// First pc past the emitted routines.
    pub end_pc: CachePc,
}

const GPR_SAVE_ORDER: [u8; 5] = [reg::RCX, reg::RDX, reg::RSI, reg::RBP, reg::RSP];

/// Emit fcache-return, its coarse-entry prefix, and fcache-enter at `pc`.
///
/// `coarse_linkstub_addr` is the sourceless linkstub faked for coarse
/// direct exits. These sequences cannot fail at run time; emission fails
/// only if an encoding is impossible, which is fatal upstream.
pub fn emit_context_switch_routines(
    config: &RuntimeConfig,
    cache: &CodeCache,
    pc: CachePc,
    coarse_linkstub_addr: usize,
) -> Result<ContextSwitchRoutines> {
    let mode = config.mode;
    let x64 = mode == IsaMode::X64;
    let mut a = Assembler::new(mode, pc);

    // ---- fcache_return ----
    // entry: XAX = &linkstub, app XAX parked in the direct-stub spill slot
    let fcache_return = a.cur_pc();
    append_get_dcontext(&mut a, mode);
    a.mov_mem_r(dc(dc_gpr_offset(reg::RBX)), reg::RBX);
    a.mov_r_mem(reg::RBX, tls(mode, TlsSlot::DirectStubSpill));
    a.mov_mem_r(dc(dc_gpr_offset(reg::RAX)), reg::RBX);
    a.mov_r_mem(reg::RBX, tls(mode, TlsSlot::XdiSpill));
    a.mov_mem_r(dc(dc_gpr_offset(reg::RDI)), reg::RBX);
    let join = a.new_label();
    a.bind(join);
    for r in GPR_SAVE_ORDER {
        a.mov_mem_r(dc(dc_gpr_offset(r)), r);
    }
    if x64 {
        for r in reg::R8..=reg::R15 {
            a.mov_mem_r(dc(dc_gpr_offset(r)), r);
        }
    }
    a.mov_mem_r(dc(dc_last_exit_offset()), reg::RAX);
    // flags are too hard to read without a stack; the app stack briefly
    // holds them, as the original runtime does
    a.pushf();
    a.pop_r(reg::RBX);
    a.mov_mem_r(dc(dc_xflags_offset()), reg::RBX);
    // clear DF and IF so the app's state cannot confuse the runtime
    a.push_imm8(0);
    a.popf();
    append_simd(&mut a, config, true);
    append_hook_call(&mut a, config.cache_exit_hook);
    a.mov_r_mem(reg::RSP, dc(dc_dstack_offset()));
    if !x64 {
        a.push_r(reg::RDI); // cdecl argument: the dcontext
    }
    a.call_pc(config.dispatch_fn); // never returns

    // ---- fcache_return_coarse ----
    // entry: nothing spilled; the entrance stub stored the target tag in
    // the direct-stub spill slot
    let fcache_return_coarse = a.cur_pc();
    append_get_dcontext(&mut a, mode);
    a.mov_mem_r(dc(dc_gpr_offset(reg::RBX)), reg::RBX);
    a.mov_r_mem(reg::RBX, tls(mode, TlsSlot::DirectStubSpill));
    a.mov_mem_r(dc(dc_next_tag_offset()), reg::RBX);
    a.mov_mem_r(dc(dc_gpr_offset(reg::RAX)), reg::RAX);
    a.mov_r_mem(reg::RBX, tls(mode, TlsSlot::XdiSpill));
    a.mov_mem_r(dc(dc_gpr_offset(reg::RDI)), reg::RBX);
    a.mov_r_imm(reg::RAX, coarse_linkstub_addr as u64);
    a.jmp_label(join);

    // ---- fcache_enter ----
    // extern "C" fn(*mut Dcontext); target pc is in the enter-target slot
    let fcache_enter = a.cur_pc();
    if !x64 {
        a.mov_r_mem(
            reg::RDI,
            Mem::BaseDisp {
                base: reg::RSP,
                disp: 4,
            },
        );
    }
    append_hook_call(&mut a, config.cache_enter_hook);
    append_simd(&mut a, config, false);
    // flags first, while still on the runtime stack
    a.push_mem(dc(dc_xflags_offset()));
    a.popf();
    if x64 {
        for r in reg::R8..=reg::R15 {
            a.mov_r_mem(r, dc(dc_gpr_offset(r)));
        }
    }
    a.mov_r_mem(reg::RAX, dc(dc_gpr_offset(reg::RAX)));
    a.mov_r_mem(reg::RBX, dc(dc_gpr_offset(reg::RBX)));
    for r in GPR_SAVE_ORDER {
        a.mov_r_mem(r, dc(dc_gpr_offset(r)));
    }
    // the base register goes last
    a.mov_r_mem(reg::RDI, dc(dc_gpr_offset(reg::RDI)));
    a.jmp_mem(tls(mode, TlsSlot::EnterTarget));

    let bytes = a.finish();
    cache.write_bytes(pc, &bytes);
    let routines = ContextSwitchRoutines {
        fcache_enter,
        fcache_return,
        fcache_return_coarse,
        end_pc: pc + bytes.len(),
    };
    log::debug!(
        "context switches at {pc:#x}: return={:#x} coarse={:#x} enter={:#x}",
        routines.fcache_return,
        routines.fcache_return_coarse,
        routines.fcache_enter
    );
    Ok(routines)
}
