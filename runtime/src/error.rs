//! Error taxonomy for emission and patching.
//!
//! Everything here is an internal invariant from the embedding runtime's
//! point of view: callers treat these as fatal and route them to their own
//! fatal-error path. They are surfaced as `Result` rather than asserted so
//! the embedder decides.

use crate::CachePc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmitError {
    /// The requested instruction has no legal encoding in the current mode.
    #[error("no legal encoding in the current mode")]
    EncodingImpossible,

    /// A relative displacement does not fit in 32 bits. Callers that might
    /// produce long reach must use indirection instead.
    #[error("displacement from {from:#x} to {to:#x} exceeds 32 bits")]
    DisplacementOutOfRange { from: CachePc, to: CachePc },

    /// A 4-byte patch site would straddle a cache line, making the patching
    /// store non-atomic.
    #[error("patch site at {pc:#x} straddles a cache line")]
    CacheLineStraddle { pc: CachePc },

    /// The branch patcher could not decode the prefix sequence of the CTI at
    /// `pc`.
    #[error("unrecognized control-transfer encoding at {pc:#x}")]
    PatchTargetUnrecognized { pc: CachePc },

    /// A fragment was handed to an operation in the wrong build phase.
    #[error("fragment with tag {tag:#x} is in the wrong build phase")]
    InvalidFragmentState { tag: u64 },
}

pub type Result<T> = std::result::Result<T, EmitError>;
