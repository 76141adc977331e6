//! Immutable configuration threaded through emission.
//!
//! There is no global option state: everything the emitters specialize on is
//! carried in a [`RuntimeConfig`] value built once at runtime start.

use crate::linkstub::IblBranchType;
use fraglink_asm_x64::IsaMode;

/// How lookup gencode reaches the hash mask and table base.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableAccess {
    /// Per-branch-type TLS slots hold the mask and table base directly
    /// (shared tables).
    Tls,
    /// A per-thread table struct is reached through the dcontext; gencode
    /// borrows XDI to chase the pointers (private tables).
    ThreadStruct {
        /// Offset of the per-branch-type mask within the table struct.
        mask_offs: i32,
        /// Offset of the per-branch-type table base within the table struct.
        table_offs: i32,
    },
}

/// SIMD save/restore regime for the context-switch routines, decided at
/// emit time.
#[derive(Clone, Copy, Debug)]
pub enum SimdPolicy {
    /// Save/restore nothing.
    None,
    /// Save/restore the caller-saved XMM registers (xmm0-5 on x64, xmm0-7 on
    /// 32-bit).
    Sse,
    /// Emit both an SSE path and a ZMM/opmask path, dispatched at run time
    /// on a global in-use byte at this absolute address.
    Avx512 { in_use_flag: usize },
}

/// Which fragment sources get the lookup head inlined into their exit stubs.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineIblPolicy {
    pub bb: bool,
    pub trace: bool,
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Gencode encoding mode. `X86` gencode on a 64-bit runtime probes the
    /// 64-bit table with upper-half tag checks.
    pub mode: IsaMode,
    /// The runtime's table word width; differs from `mode` only for 32-bit
    /// gencode under a 64-bit runtime.
    pub table_mode: IsaMode,
    /// Cache-line granule for patchable-displacement alignment.
    pub cache_line_size: usize,
    /// Inline the lookup head into indirect exit stubs (32-bit gencode
    /// only; the inline template stores 32-bit linkstub immediates).
    pub inline_ibl: InlineIblPolicy,
    /// Publish inline-stub links with a single patch. When false, the stub
    /// carries the race encoding (low byte of XCX set to 1 on unlink) and
    /// the shared routine's unlinked path discriminates with `movzx`+`loop`.
    pub atomic_inlined_linking: bool,
    /// Emit the in-gencode sentinel check and wraparound; when false a miss
    /// on an empty slot exits to the dispatcher directly.
    pub ibl_sentinel_check: bool,
    pub table_access: TableAccess,
    /// Per-branch-type hash-mask shift (the mask keeps bits `[shift..]`).
    pub ibl_hash_offset: [u8; 3],
    /// Give non-IBT fragments an XCX-restore prefix.
    pub bb_prefixes: bool,
    /// Spill XAX/XCX/XBX to R8/R9/R10 instead of TLS in lookup gencode
    /// (x86-to-x64 translation mode; requires a 64-bit runtime).
    pub x86_to_x64_ibl_opt: bool,
    pub simd: SimdPolicy,
    /// Called after the cache-enter routine has the dcontext, before state
    /// restore.
    pub cache_enter_hook: Option<usize>,
    /// Called by the cache-exit routine after state save.
    pub cache_exit_hook: Option<usize>,
    /// `extern "C" fn(*mut Dcontext) -> !`: the dispatcher the cache-exit
    /// routine hands control to.
    pub dispatch_fn: usize,
}

impl RuntimeConfig {
    /// A configuration with the defaults the tests and embedding runtimes
    /// start from; `dispatch_fn` must still be filled in.
    #[must_use]
    pub fn new(mode: IsaMode) -> Self {
        Self {
            mode,
            table_mode: mode,
            cache_line_size: 64,
            inline_ibl: InlineIblPolicy::default(),
            atomic_inlined_linking: true,
            ibl_sentinel_check: true,
            table_access: TableAccess::Tls,
            ibl_hash_offset: [0; 3],
            bb_prefixes: true,
            x86_to_x64_ibl_opt: false,
            simd: SimdPolicy::Sse,
            cache_enter_hook: None,
            cache_exit_hook: None,
            dispatch_fn: 0,
        }
    }

    #[must_use]
    pub fn hash_offset(&self, bt: IblBranchType) -> u8 {
        self.ibl_hash_offset[bt.index()]
    }

    /// Lookup-table entry size: a `{tag, start_pc}` pair at the table word
    /// width.
    #[must_use]
    pub fn ibl_entry_size(&self) -> usize {
        2 * self.table_mode.ptr_size()
    }

    /// Whether this gencode probes a 64-bit table with 32-bit registers and
    /// must reject tags with nonzero upper halves.
    #[must_use]
    pub fn x86_mode_on_x64_table(&self) -> bool {
        self.mode == IsaMode::X86 && self.table_mode == IsaMode::X64
    }
}
