//! Per-exit descriptors.
//!
//! A linkstub describes one exit from a fragment: which kind of control
//! transfer leaves through it, where its exit CTI and exit stub live, and
//! whether it is currently linked. The emitted stub materializes the address
//! of this struct into a register so the dispatcher can identify the exiting
//! edge after a cache exit.

use crate::{AppTag, CachePc};
use std::cell::Cell;

/// The indirect-branch classes that get their own lookup routines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IblBranchType {
    Return,
    IndirectCall,
    IndirectJump,
}

impl IblBranchType {
    pub const ALL: [IblBranchType; 3] = [
        IblBranchType::Return,
        IblBranchType::IndirectCall,
        IblBranchType::IndirectJump,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            IblBranchType::Return => 0,
            IblBranchType::IndirectCall => 1,
            IblBranchType::IndirectJump => 2,
        }
    }
}

/// The source-fragment axis of the lookup-routine matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IblSourceKind {
    Bb,
    Trace,
    Coarse,
}

impl IblSourceKind {
    pub const ALL: [IblSourceKind; 3] =
        [IblSourceKind::Bb, IblSourceKind::Trace, IblSourceKind::Coarse];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            IblSourceKind::Bb => 0,
            IblSourceKind::Trace => 1,
            IblSourceKind::Coarse => 2,
        }
    }
}

/// What kind of exit a linkstub describes.
#[derive(Clone, Copy, Debug)]
pub enum LinkStubKind {
    /// A direct branch to a known application target.
    Direct { target_tag: AppTag },
    /// An indirect branch resolved through the lookup routine for its class.
    Indirect { branch_type: IblBranchType },
}

/// A per-exit descriptor, exclusively owned by its fragment.
///
/// The linkstub must not move while any emitted stub references it; owners
/// keep it boxed for its whole lifetime.
#[derive(Debug)]
pub struct LinkStub {
    pub kind: LinkStubKind,
    /// Pc of the exit CTI inside the fragment body.
    pub cti_pc: CachePc,
    /// Pc of the exit stub.
    pub stub_pc: CachePc,
    /// Current link state; stubs are created unlinked except coarse-grain
    /// indirect exits.
    pub linked: Cell<bool>,
}

impl LinkStub {
    #[must_use]
    pub fn new(kind: LinkStubKind, cti_pc: CachePc, stub_pc: CachePc) -> Self {
        Self {
            kind,
            cti_pc,
            stub_pc,
            linked: Cell::new(false),
        }
    }

    #[must_use]
    pub fn is_direct(&self) -> bool {
        matches!(self.kind, LinkStubKind::Direct { .. })
    }

    #[must_use]
    pub fn is_indirect(&self) -> bool {
        matches!(self.kind, LinkStubKind::Indirect { .. })
    }

    #[must_use]
    pub fn branch_type(&self) -> Option<IblBranchType> {
        match self.kind {
            LinkStubKind::Indirect { branch_type } => Some(branch_type),
            LinkStubKind::Direct { .. } => None,
        }
    }

    #[must_use]
    pub fn target_tag(&self) -> Option<AppTag> {
        match self.kind {
            LinkStubKind::Direct { target_tag } => Some(target_tag),
            LinkStubKind::Indirect { .. } => None,
        }
    }

    /// The address emitted stubs materialize to identify this exit.
    #[must_use]
    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }
}
