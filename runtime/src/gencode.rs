//! Process-wide generated-code descriptors.
//!
//! `Gencode` owns everything emitted once at runtime start: the context
//! switches, one lookup routine per `(source kind, branch type)` cell, the
//! per-type coarse prefixes, and the sourceless linkstubs the lookup tails
//! fake when no per-exit descriptor exists. Routine entry points are fixed
//! for the process lifetime; only the documented per-stub patch points ever
//! change after emission.

use crate::config::{RuntimeConfig, TableAccess};
use crate::context::{emit_context_switch_routines, ContextSwitchRoutines};
use crate::emit::insert_relative_jump;
use crate::error::Result;
use crate::ibl::{emit_indirect_branch_lookup, emit_inline_ibl_stub, IblCode};
use crate::linkstub::{IblBranchType, IblSourceKind, LinkStub, LinkStubKind};
use crate::{CachePc, CodeCache};
use fraglink_asm_x64::IsaMode;

/// Linkstubs that stand in when an exit has no descriptor of its own.
#[derive(Debug)]
pub struct SentinelLinkStubs {
    /// Parked when a lookup lands on a tombstoned table entry, so trace
    /// building can handle the unknown last exit.
    pub ibl_deleted: Box<LinkStub>,
    /// Faked for coarse-grain direct exits.
    pub coarse_direct: Box<LinkStub>,
    /// Faked for coarse-grain indirect exits, per branch type.
    pub coarse_indirect: [Box<LinkStub>; 3],
}

impl SentinelLinkStubs {
    fn new() -> Self {
        let ind = |bt| {
            Box::new(LinkStub::new(
                LinkStubKind::Indirect { branch_type: bt },
                0,
                0,
            ))
        };
        Self {
            ibl_deleted: ind(IblBranchType::IndirectJump),
            coarse_direct: Box::new(LinkStub::new(
                LinkStubKind::Direct { target_tag: 0 },
                0,
                0,
            )),
            coarse_indirect: [
                ind(IblBranchType::Return),
                ind(IblBranchType::IndirectCall),
                ind(IblBranchType::IndirectJump),
            ],
        }
    }
}

#[derive(Debug)]
pub struct Gencode {
    pub mode: IsaMode,
    routines: ContextSwitchRoutines,
    /// Indexed `source * 3 + branch_type`.
    ibl: Vec<IblCode>,
    /// Per-branch-type jmp pads coarse indirect stubs target.
    coarse_prefix: [CachePc; 3],
    pub sentinels: SentinelLinkStubs,
    /// First free pc past the emitted gencode.
    pub end_pc: CachePc,
}

fn align16(pc: CachePc) -> CachePc {
    (pc + 15) & !15
}

impl Gencode {
    /// Emit all shared routines into `cache` starting at `pc`.
    pub fn emit(config: &RuntimeConfig, cache: &CodeCache, pc: CachePc) -> Result<Gencode> {
        let sentinels = SentinelLinkStubs::new();
        let routines =
            emit_context_switch_routines(config, cache, pc, sentinels.coarse_direct.addr())?;
        let mut cursor = align16(routines.end_pc);

        let mut ibl = Vec::with_capacity(9);
        for source in IblSourceKind::ALL {
            for bt in IblBranchType::ALL {
                let inline = match source {
                    IblSourceKind::Bb => config.inline_ibl.bb,
                    IblSourceKind::Trace => config.inline_ibl.trace,
                    IblSourceKind::Coarse => false,
                } && config.mode == IsaMode::X86
                    && matches!(config.table_access, TableAccess::Tls);
                let sourceless = if source == IblSourceKind::Coarse {
                    Some(sentinels.coarse_indirect[bt.index()].addr())
                } else {
                    None
                };
                let mut code = emit_indirect_branch_lookup(
                    config,
                    cache,
                    cursor,
                    routines.fcache_return,
                    bt,
                    source,
                    inline,
                    sentinels.ibl_deleted.addr(),
                    sourceless,
                )?;
                cursor = align16(code.routine_start + code.routine_len);
                if inline {
                    emit_inline_ibl_stub(config, &mut code)?;
                }
                ibl.push(code);
            }
        }

        let mut coarse_prefix = [0; 3];
        for bt in IblBranchType::ALL {
            coarse_prefix[bt.index()] = cursor;
            let linked = ibl[IblSourceKind::Coarse.index() * 3 + bt.index()].linked_entry;
            cursor = insert_relative_jump(cache, cursor, linked, false)?;
        }

        log::info!(
            "gencode emitted: [{pc:#x}, {:#x}), {} lookup routines",
            cursor,
            ibl.len()
        );
        Ok(Gencode {
            mode: config.mode,
            routines,
            ibl,
            coarse_prefix,
            sentinels,
            end_pc: align16(cursor),
        })
    }

    #[must_use]
    pub fn ibl(&self, source: IblSourceKind, bt: IblBranchType) -> &IblCode {
        &self.ibl[source.index() * 3 + bt.index()]
    }

    /// Where fine-grain direct exit stubs initially jump.
    #[must_use]
    pub fn fcache_return(&self) -> CachePc {
        self.routines.fcache_return
    }

    /// Where coarse entrance stubs jump.
    #[must_use]
    pub fn fcache_return_coarse_prefix(&self) -> CachePc {
        self.routines.fcache_return_coarse
    }

    /// The cache-entry routine, `extern "C" fn(*mut Dcontext)`.
    #[must_use]
    pub fn fcache_enter(&self) -> CachePc {
        self.routines.fcache_enter
    }

    /// The per-type pad coarse indirect stubs jump through.
    #[must_use]
    pub fn coarse_ibl_prefix(&self, bt: IblBranchType) -> CachePc {
        self.coarse_prefix[bt.index()]
    }

    /// Translate a lookup entry point to its linked counterpart.
    #[must_use]
    pub fn linked_entry_for(&self, pc: CachePc) -> Option<CachePc> {
        for code in &self.ibl {
            if pc == code.linked_entry || pc == code.unlinked_entry {
                return Some(code.linked_entry);
            }
            if Some(pc) == code.trace_cmp_entry || Some(pc) == code.trace_cmp_unlinked {
                return code.trace_cmp_entry;
            }
        }
        None
    }

    /// Translate a lookup entry point to its unlinked counterpart.
    #[must_use]
    pub fn unlinked_entry_for(&self, pc: CachePc) -> Option<CachePc> {
        for code in &self.ibl {
            if pc == code.linked_entry || pc == code.unlinked_entry {
                return Some(code.unlinked_entry);
            }
            if Some(pc) == code.trace_cmp_entry || Some(pc) == code.trace_cmp_unlinked {
                return code.trace_cmp_unlinked;
            }
        }
        None
    }
}
