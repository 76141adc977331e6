//! Thread-local scratch layout.
//!
//! Gencode addresses a per-thread scratch region through a segment override
//! (FS for 32-bit gencode, GS for 64-bit). The slot assignments here are a
//! protocol between the emitters and the runtime reader: which slot holds
//! which value is encoded in the instructions the emitters produce and must
//! be mirrored exactly by anything inspecting a suspended thread.

use crate::linkstub::IblBranchType;
use fraglink_asm_x64::IsaMode;

/// Named thread-local scratch slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsSlot {
    /// App XAX around a direct exit; also the app-XAX hand-off slot the
    /// fcache-return path reads.
    DirectStubSpill,
    /// App XBX around an indirect exit.
    IndirectStubSpill,
    /// App XCX, spilled by indirect-branch mangling before the exit.
    XcxSpill,
    /// The linkstub pointer (or coarse source tag) parked by lookup gencode.
    LinkstubSpill,
    /// App XDI while gencode borrows XDI for the dcontext.
    XdiSpill,
    /// The thread's dcontext address (maintained by the runtime).
    DcontextBase,
    /// App XAX around the lookup's flag save; restored by fragment prefixes.
    PrefixXax,
    /// Target pc consumed by the tail of the cache-enter routine.
    EnterTarget,
    /// Per-branch-type hash mask for the lookup table.
    Mask(IblBranchType),
    /// Per-branch-type lookup-table base.
    Table(IblBranchType),
}

impl TlsSlot {
    fn index(self) -> u16 {
        match self {
            TlsSlot::DirectStubSpill => 0,
            TlsSlot::IndirectStubSpill => 1,
            TlsSlot::XcxSpill => 2,
            TlsSlot::LinkstubSpill => 3,
            TlsSlot::XdiSpill => 4,
            TlsSlot::DcontextBase => 5,
            TlsSlot::PrefixXax => 6,
            TlsSlot::EnterTarget => 7,
            TlsSlot::Mask(bt) => 8 + 2 * bt.index() as u16,
            TlsSlot::Table(bt) => 9 + 2 * bt.index() as u16,
        }
    }

    /// Byte offset of this slot from the segment base.
    #[must_use]
    pub fn offset(self, mode: IsaMode) -> u16 {
        self.index() * mode.ptr_size() as u16
    }
}

/// Number of scratch words in the region.
pub const TLS_SLOT_COUNT: usize = 14;

/// A test- and runtime-visible image of the scratch region, word-indexed the
/// same way the emitted segment-override displacements are.
#[repr(C)]
#[derive(Debug)]
pub struct TlsRegion {
    pub slots: [u64; TLS_SLOT_COUNT],
}

impl TlsRegion {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: [0; TLS_SLOT_COUNT],
        }
    }
}

impl Default for TlsRegion {
    fn default() -> Self {
        Self::new()
    }
}
