//! Error types for allocator operations

use thiserror::Error;

use crate::AllocatorMode;

/// Recoverable allocator failures
///
/// Contract violations (resizing a pool block, closing checkpoints out of
/// order, freeing a foreign pointer) are not represented here: they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The allocator has no room left for the request
    #[error("{allocator} out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        allocator: &'static str,
        requested: usize,
        available: usize,
    },

    /// The platform allocator could not satisfy the request
    #[error("platform allocation of {size} bytes aligned to {align} failed")]
    Platform { size: usize, align: usize },

    /// The allocator does not implement this operation
    #[error("{allocator} does not support {mode:?}")]
    Unsupported {
        allocator: &'static str,
        mode: AllocatorMode,
    },
}

impl AllocError {
    /// True for out-of-memory and platform failures
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, AllocError::OutOfMemory { .. } | AllocError::Platform { .. })
    }
}

/// Result type alias
pub type AllocResult<T> = core::result::Result<T, AllocError>;
