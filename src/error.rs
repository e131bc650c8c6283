//! # Kernel Errors
//!
//! Recoverable failures returned to callers. Invariant violations (double
//! insert, double free, zero-sized request, corrupted free list) are not
//! represented here: they panic, and on the target `panic-halt` stops the
//! core before the corruption can spread.

use thiserror::Error;

use crate::memory::RegionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// No free block in the region is large enough for the request.
    #[error("out of memory in {region:?}: {requested} bytes requested")]
    OutOfMemory { region: RegionId, requested: usize },

    /// The region was never handed to the allocator.
    #[error("memory region {0:?} is not configured")]
    RegionNotConfigured(RegionId),

    /// Every thread slot is in use.
    #[error("thread limit reached")]
    ThreadLimit,

    /// The handle names a thread that has already retired.
    #[error("stale thread handle")]
    StaleHandle,

    /// `kernel::init` has not run yet.
    #[error("kernel not initialized")]
    NotInitialized,
}

pub type KernelResult<T> = Result<T, KernelError>;
