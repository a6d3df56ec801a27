//! # shmheap
//!
//! Shared-memory allocator core for inter-process and host/device data
//! exchange.
//!
//! shmheap provides a family of memory backends that reserve a
//! contiguous mappable region accessible from multiple processes, and a
//! family of allocators that carve that region into user requests while
//! staying *position-independent*: every pointer stored inside the
//! region is an offset, so any attaching process sees the same data
//! structures at a different virtual address.
//!
//! ## Features
//!
//! - **Position-independent pointers**: `(AllocatorId, offset)` pairs
//!   that resolve in any attached process
//! - **Buddy-style allocator**: small-object arena, size-classed free
//!   lists, monotonic bump heap, O(1) free
//! - **Multi-process attach**: a second process re-derives allocator
//!   state from the mapped bytes alone
//! - **Sub-allocation**: any allocator can serve as the backend for
//!   another allocator
//! - **Linux-native**: POSIX shared memory and fd-exportable unified
//!   regions via rustix
//!
//! ## Quick Start
//!
//! ```rust
//! use shmheap::prelude::*;
//! use shmheap::backend::BackendId;
//!
//! # fn main() -> shmheap::Result<()> {
//! // Owner: reserve a region and embed a buddy allocator in it.
//! let mut backend = HeapBackend::init(BackendId::new(0, 0), 16 << 20)?;
//! let alloc = backend.make_allocator::<BuddyAllocator>()?;
//!
//! // Allocate, use, free.
//! let ctx = MemContext::unbound();
//! let block = alloc.allocate::<u64>(&ctx, 1024)?;
//! alloc.free(&ctx, block)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod allocator;
pub mod backend;
pub mod error;
pub mod heap;
pub mod ptr;
pub mod registry;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::allocator::{
        ArenaAllocator, BuddyAllocator, MemContext, OffsetAllocator, ScopedMemContext,
        ShmAllocator, ThreadId, TypedAllocator,
    };
    pub use crate::backend::{
        ArrayBackend, GpuUnifiedBackend, HeapBackend, MemoryBackend, SharedMemoryBackend,
    };
    pub use crate::error::{Error, Result};
    pub use crate::ptr::{AllocatorId, FullPtr, OffsetPointer, Pointer};
}

pub use error::{Error, Result};
