//! Fragment-exit, linking, and indirect-branch-lookup engine for an x86/x64
//! code cache.
//!
//! A dynamic instrumentation runtime copies application basic blocks
//! ("fragments") into a software-managed code cache and rewrites their
//! control-transfer instructions so control flow stays under runtime
//! supervision. This crate owns the hardest-edged slice of that machinery:
//!
//! - per-exit trampolines ("exit stubs") and the coarse-grain entrance-stub
//!   variant ([`stub`]);
//! - atomic retargeting of live branches for linking and unlinking
//!   ([`patch`], [`emit`]);
//! - NOP padding so every patchable displacement sits inside one cache line
//!   ([`pad`]);
//! - fragment entry prefixes that restore flags and scratch registers
//!   ([`prefix`]);
//! - the shared and inlined indirect-branch-lookup gencode ([`ibl`]);
//! - the full context switches in and out of the cache ([`context`]).
//!
//! All emitted byte sequences are wire formats: live code and byte-level
//! recognizers depend on them, so each emitter produces exactly one canonical
//! encoding (see [`formats`] and [`spill`]).

pub mod cache;
pub mod config;
pub mod context;
pub mod emit;
pub mod error;
pub mod formats;
pub mod fragment;
pub mod gencode;
pub mod ibl;
pub mod linkstub;
pub mod pad;
pub mod patch;
pub mod prefix;
pub mod spill;
pub mod stub;
pub mod tls;

pub use fraglink_asm_x64::IsaMode;

/// An address inside the code cache.
pub type CachePc = usize;

/// An application pc, used as the tag identifying a fragment.
pub type AppTag = u64;

pub use cache::CodeCache;
pub use config::RuntimeConfig;
pub use error::{EmitError, Result};
pub use fragment::{Fragment, FragmentFlags};
pub use gencode::Gencode;
pub use linkstub::{IblBranchType, IblSourceKind, LinkStub, LinkStubKind};
