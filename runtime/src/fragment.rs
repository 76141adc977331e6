//! Fragments: units of translated application code in the cache.

use crate::{AppTag, CachePc};
use fraglink_asm_x64::IsaMode;

/// Per-fragment attributes the exit/link machinery cares about.
#[derive(Clone, Copy, Debug)]
pub struct FragmentFlags {
    /// Encoding mode of the fragment's code.
    pub mode: IsaMode,
    /// Trace (vs. basic block); selects the lookup-routine row and the
    /// prefix policy.
    pub is_trace: bool,
    /// Shared across threads.
    pub shared: bool,
    /// Packaged without per-exit linkstubs; uses entrance stubs.
    pub coarse_grain: bool,
    /// The body rewrites all six status flags before any exit, so the prefix
    /// need not restore them.
    pub writes_eflags_6: bool,
    /// The body rewrites OF (but not necessarily the other five).
    pub writes_eflags_of: bool,
    /// Align patchable exit displacements by NOP padding.
    pub pad_jmps: bool,
    /// Allow the one-time start-pc shift instead of a leading NOP.
    pub pad_jmps_shift_start: bool,
}

impl FragmentFlags {
    #[must_use]
    pub fn new(mode: IsaMode) -> Self {
        Self {
            mode,
            is_trace: false,
            shared: false,
            coarse_grain: false,
            writes_eflags_6: false,
            writes_eflags_of: false,
            pad_jmps: true,
            pad_jmps_shift_start: false,
        }
    }
}

/// A fragment under construction or in service.
#[derive(Debug)]
pub struct Fragment {
    /// Application pc this fragment translates.
    pub tag: AppTag,
    /// First cache byte of the fragment (prefix included).
    pub start_pc: CachePc,
    /// Total cache bytes, prefix included.
    pub size: u32,
    pub flags: FragmentFlags,
    /// Distance from `start_pc` to the normal entry; set once by the prefix
    /// builder.
    pub prefix_size: u8,
}

impl Fragment {
    #[must_use]
    pub fn new(tag: AppTag, start_pc: CachePc, size: u32, flags: FragmentFlags) -> Self {
        Self {
            tag,
            start_pc,
            size,
            flags,
            prefix_size: 0,
        }
    }

    /// Entry used when arriving from an indirect-branch lookup: the prefix
    /// start, so flags and scratch registers get restored.
    #[must_use]
    pub fn ibt_entry(&self) -> CachePc {
        self.start_pc
    }

    /// Entry used by linked direct exits: past the prefix.
    #[must_use]
    pub fn normal_entry(&self) -> CachePc {
        self.start_pc + usize::from(self.prefix_size)
    }

    /// First byte past the fragment.
    #[must_use]
    pub fn end_pc(&self) -> CachePc {
        self.start_pc + self.size as usize
    }
}
