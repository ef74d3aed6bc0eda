//! Error types for the profiler and the guarded allocation tracker
//!
//! Two failure families exist:
//! - Corruption-class errors from the memory tracker (`MemoryError`). These are
//!   fatal for the offending block: the caller has already scribbled over
//!   tracker metadata, so no recovery is attempted and the block is left in
//!   the live registry.
//! - I/O errors while writing reports (`ProfilerError`).
//!
//! Contract violations (unbalanced scope exit, negative reentrancy depth) are
//! caller bugs and panic instead of returning an error.

use crate::memory::{AllocKind, AllocSite};
use std::fmt;
use thiserror::Error;

/// Which side of the payload a clobbered guard word sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardRegion {
    /// Guard words before the payload (buffer underrun).
    Before,
    /// Guard words after the payload (buffer overrun).
    After,
}

impl fmt::Display for GuardRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardRegion::Before => write!(f, "pre-payload"),
            GuardRegion::After => write!(f, "post-payload"),
        }
    }
}

/// Errors raised by the guarded allocation tracker
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("allocation header signature mismatch at {address:#x} (block is not ours or its header was clobbered)")]
    SignatureMismatch { address: usize },

    #[error("{region} guard word {index} clobbered on block allocated at {site}")]
    GuardClobbered {
        region: GuardRegion,
        index: usize,
        site: AllocSite,
    },

    #[error("mismatching allocator and deallocator: allocated as {allocated}, freed as {freed} (block from {site})")]
    KindMismatch {
        allocated: AllocKind,
        freed: AllocKind,
        site: AllocSite,
    },

    #[error("deallocation of unknown block at {address:#x} (double free or foreign pointer)")]
    UnknownBlock { address: usize },
}

/// Errors raised by the profiler context itself
#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProfilerError>;
