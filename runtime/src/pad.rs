//! NOP padding for patchable exit branches.
//!
//! A patchable displacement must not straddle a cache line or the patching
//! store stops being atomic. This pass walks a fragment's instruction list
//! before encoding and either shifts the fragment start (once, while still
//! within one line of the first patchable offset) or inserts a NOP of the
//! exact needed length in front of the offending exit.
//!
//! The decoder IR stays opaque to this crate; the list model here carries
//! only what the pass needs: lengths, exit-CTI classification, and offset
//! bookkeeping.

use crate::config::RuntimeConfig;
use crate::formats::{CBR_LONG_LENGTH, CTI_PATCH_SIZE, CTI_SHORT_REWRITE_LENGTH, JMP_LONG_LENGTH};
use crate::fragment::Fragment;
use crate::prefix::fragment_prefix_size;
use crate::CachePc;
use smallvec::SmallVec;

/// The long exit-CTI encodings whose final 4 bytes are patchable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtiForm {
    /// `jmp rel32`.
    Jmp,
    /// `jcc rel32`, optionally behind a branch-hint prefix.
    Jcc { hint: bool },
    /// A mangled `jecxz`/`loop*`: short cti + `jmp rel8` + `jmp rel32`.
    ShortRewrite { addr_prefix: bool },
}

impl CtiForm {
    #[must_use]
    pub fn len(self) -> usize {
        match self {
            CtiForm::Jmp => JMP_LONG_LENGTH,
            CtiForm::Jcc { hint } => CBR_LONG_LENGTH + usize::from(hint),
            CtiForm::ShortRewrite { addr_prefix } => {
                CTI_SHORT_REWRITE_LENGTH + usize::from(addr_prefix)
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum InstKind {
    Regular,
    Nop,
    ExitCti { patchable: bool, form: CtiForm },
}

/// One instruction as the padding pass sees it.
#[derive(Clone, Copy, Debug)]
pub struct Inst {
    pub kind: InstKind,
    pub len: u8,
    /// Offset within the fragment body, filled in when `emitting`.
    pub offset: u32,
    /// Set when a NOP was inserted directly before this exit.
    pub padded: bool,
}

impl Inst {
    #[must_use]
    pub fn regular(len: u8) -> Self {
        Self {
            kind: InstKind::Regular,
            len,
            offset: 0,
            padded: false,
        }
    }

    #[must_use]
    pub fn exit_cti(form: CtiForm, patchable: bool) -> Self {
        Self {
            kind: InstKind::ExitCti { patchable, form },
            len: form.len() as u8,
            offset: 0,
            padded: false,
        }
    }

    fn nop(len: usize) -> Self {
        Self {
            kind: InstKind::Nop,
            len: len as u8,
            offset: 0,
            padded: false,
        }
    }
}

/// An editable instruction list for one fragment body.
#[derive(Debug, Default)]
pub struct InstList {
    pub insts: SmallVec<[Inst; 16]>,
}

impl InstList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, inst: Inst) {
        self.insts.push(inst);
    }

    /// Total encoded length.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.insts.iter().map(|i| usize::from(i.len)).sum()
    }
}

/// If the patchable displacement of `cti` placed at `pc` is properly
/// contained, returns 0; else the number of bytes the instruction would need
/// to shift forward.
#[must_use]
pub fn patchable_exit_cti_align_offs(config: &RuntimeConfig, cti_len: usize, pc: CachePc) -> usize {
    let disp_pc = pc + cti_len - CTI_PATCH_SIZE;
    let rem = disp_pc % config.cache_line_size;
    if rem + CTI_PATCH_SIZE > config.cache_line_size {
        config.cache_line_size - rem
    } else {
        0
    }
}

/// Insert NOP padding so no patchable exit displacement straddles a cache
/// line. Returns the number of bytes the caller should shift the fragment's
/// start pc by (0 unless the one-time shift optimization fired). When
/// `emitting`, fills in each instruction's `offset` field.
pub fn nop_pad_ilist(
    config: &RuntimeConfig,
    f: &Fragment,
    ilist: &mut InstList,
    emitting: bool,
) -> u32 {
    debug_assert!(f.flags.pad_jmps);
    let mut starting_pc = f.start_pc + fragment_prefix_size(config, &f.flags);
    let mut offset: usize = 0;
    let mut first_patch_offset: Option<usize> = None;
    let mut start_shift: usize = 0;

    let mut i = 0;
    while i < ilist.insts.len() {
        let inst = ilist.insts[i];
        if let InstKind::ExitCti {
            patchable: true,
            form,
        } = inst.kind
        {
            let nop_len =
                patchable_exit_cti_align_offs(config, form.len(), starting_pc + offset);
            let first = *first_patch_offset.get_or_insert(offset);
            if nop_len > 0 {
                // Prefer shifting the whole fragment over a NOP before the
                // first exit, while every patch site checked so far is still
                // within one line of the first patchable offset (a cbr that
                // mangles into two patchable exits stays safe: they are less
                // than a line apart).
                if f.flags.pad_jmps_shift_start
                    && offset + usize::from(inst.len) - first < config.cache_line_size
                {
                    debug_assert_eq!(start_shift, 0, "start shifted twice");
                    start_shift = nop_len;
                    starting_pc += nop_len;
                } else {
                    log::trace!(
                        "padding exit at body offset {offset:#x} with {nop_len}-byte nop"
                    );
                    ilist.insts[i].padded = true;
                    let mut nop = Inst::nop(nop_len);
                    if emitting {
                        nop.offset = offset as u32;
                    }
                    ilist.insts.insert(i, nop);
                    offset += nop_len;
                    i += 1;
                }
                debug_assert_eq!(
                    patchable_exit_cti_align_offs(config, form.len(), starting_pc + offset),
                    0
                );
            }
        }
        if emitting {
            ilist.insts[i].offset = offset as u32;
        }
        offset += usize::from(ilist.insts[i].len);
        i += 1;
    }
    start_shift as u32
}
