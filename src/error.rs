//! Error types for shmheap.

use thiserror::Error;

/// Result type alias using shmheap's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shmheap operations.
///
/// The taxonomy is small and exhaustive: every failure an allocator or
/// backend can surface maps to exactly one of these kinds. `OutOfMemory`
/// is a normal return — the caller may free other memory and retry — and
/// is guaranteed not to corrupt allocator state.
#[derive(Error, Debug)]
pub enum Error {
    /// No free list served the request and the heap cursor would exceed
    /// its maximum offset.
    #[error("out of memory: no free list or heap space serves the request")]
    OutOfMemory,

    /// The OS refused to create, map, or extend the backing region.
    #[error("shared memory creation failed: {0}")]
    ShmemCreateFailed(String),

    /// Attach was called on a backend variant that does not support it.
    #[error("attach not supported by this memory backend")]
    ShmemNotSupported,

    /// A raw pointer or offset lies outside the allocator's data region.
    #[error("pointer is not within the allocator's data region")]
    PtrNotInAllocator,

    /// Free was called with a null pointer or a pointer whose allocator
    /// id does not match this allocator.
    #[error("invalid free: null pointer or mismatched allocator id")]
    InvalidFree,

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
