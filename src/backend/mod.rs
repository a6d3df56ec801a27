//! Memory backends.
//!
//! A backend owns a contiguous mappable byte region; allocators live
//! inside it. Every variant lays the region out the same way:
//!
//! ```text
//! ┌────────────────────┬──────────────────┬──────────────────────────┐
//! │ BackendHeader      │ pad to 4 KiB     │ data region (data_size)  │
//! └────────────────────┴──────────────────┴──────────────────────────┘
//! ```
//!
//! The header is written once by the owner and treated as read-only by
//! attachers; it is the sole source of truth that lets a second process
//! discover the region's layout. Variants differ only in where the bytes
//! come from:
//!
//! - [`HeapBackend`]: ordinary process-local allocation, attach unsupported
//! - [`SharedMemoryBackend`]: named POSIX shared memory, multi-process
//! - [`GpuUnifiedBackend`]: host/device-coherent region, multi-process
//! - [`ArrayBackend`]: a span carved out of another allocator
//!   (sub-allocation)

mod array;
mod heap;
mod shared;
mod unified;

pub use array::ArrayBackend;
pub use heap::HeapBackend;
pub use shared::SharedMemoryBackend;
pub use unified::GpuUnifiedBackend;

use crate::allocator::ShmAllocator;
use crate::error::{Error, Result};
use crate::ptr::AllocatorId;
use crate::registry;

/// Alignment of the data region after the header.
pub const DATA_ALIGNMENT: usize = 4096;

/// Minimum backend size enforced by `init`; smaller requests are rounded
/// up.
pub const MIN_BACKEND_SIZE: usize = 1024 * 1024;

/// The identifier for a memory backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BackendId {
    /// Typically some sort of process or node id.
    pub major: i32,
    /// Process-local slot.
    pub minor: i32,
}

impl BackendId {
    /// Create an id from its two halves.
    #[inline]
    pub const fn new(major: i32, minor: i32) -> Self {
        Self { major, minor }
    }

    /// Pack into the on-region u64 representation.
    #[inline]
    pub const fn to_u64(self) -> u64 {
        ((self.major as u32 as u64) << 32) | (self.minor as u32 as u64)
    }

    /// Unpack from the on-region representation.
    #[inline]
    pub const fn from_u64(raw: u64) -> Self {
        Self {
            major: (raw >> 32) as u32 as i32,
            minor: raw as u32 as i32,
        }
    }
}

/// Header flag: the region has been initialized by an owner.
pub const FLAG_INITIALIZED: u32 = 1 << 0;
/// Header flag: this process owns the region's lifetime.
pub const FLAG_OWNED: u32 = 1 << 1;

/// The on-region backend header (little-endian, stable layout).
///
/// Field offsets are part of the cross-process binary contract:
/// `id` at 0, `md_size` at 8, `data_size` at 16, `data_id` at 24,
/// `flags` at 32.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BackendHeader {
    /// Backend id (major/minor packed).
    pub id: u64,
    /// Size of this header.
    pub md_size: u64,
    /// Size of the data region in bytes.
    pub data_size: u64,
    /// Offset of the embedded allocator object within the data region,
    /// or -1 if none.
    pub data_id: i64,
    /// Flag bits (`FLAG_INITIALIZED`, `FLAG_OWNED`).
    pub flags: u32,
}

impl BackendHeader {
    /// Build a freshly-initialized header for an owner.
    pub fn new(id: BackendId, data_size: usize, owned: bool) -> Self {
        let mut flags = FLAG_INITIALIZED;
        if owned {
            flags |= FLAG_OWNED;
        }
        Self {
            id: id.to_u64(),
            md_size: std::mem::size_of::<BackendHeader>() as u64,
            data_size: data_size as u64,
            data_id: -1,
            flags,
        }
    }

    /// Whether an owner has initialized this region.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.flags & FLAG_INITIALIZED != 0
    }

    /// Whether the writing process owned the region.
    #[inline]
    pub fn is_owned(&self) -> bool {
        self.flags & FLAG_OWNED != 0
    }

    /// The backend id recorded in the header.
    #[inline]
    pub fn backend_id(&self) -> BackendId {
        BackendId::from_u64(self.id)
    }
}

/// A contiguous span of mapped memory handed to an allocator: the
/// synthetic backend descriptor used both by real backends (their data
/// region) and by sub-allocation (a span of the parent's region).
#[derive(Clone, Copy, Debug)]
pub struct RegionSpan {
    /// First byte of the span in this process.
    pub base: *mut u8,
    /// Length of the span in bytes.
    pub len: usize,
}

impl RegionSpan {
    /// Create a span from raw parts.
    #[inline]
    pub const fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }
}

/// Common contract for memory backends.
///
/// Allocators capture `(id, base, capacity)` once at init, so nothing on
/// the hot allocation path dispatches through this trait.
pub trait MemoryBackend {
    /// The backend's identifier.
    fn id(&self) -> BackendId;

    /// The on-region header.
    fn header(&self) -> &BackendHeader;

    /// Mutable access to the header (owner only).
    fn header_mut(&mut self) -> &mut BackendHeader;

    /// First byte of the user-usable data region.
    fn data(&self) -> *mut u8;

    /// Length of the data region in bytes.
    fn data_capacity(&self) -> usize;

    /// Release the process-local mapping without affecting other
    /// attachers.
    fn detach(&mut self);

    /// Remove the underlying resource.
    fn destroy(&mut self);

    /// Construct an allocator of type `A` inline at `data[0]` and record
    /// its position in the header so attachers can find it.
    fn make_allocator<A: ShmAllocator>(&mut self) -> Result<A>
    where
        Self: Sized,
    {
        let id = AllocatorId::new(self.id().major, self.id().minor);
        let region = RegionSpan::new(self.data(), self.data_capacity());
        let alloc = A::init(id, region)?;
        self.header_mut().data_id = 0;
        registry::register(id, region.base, region.len);
        Ok(alloc)
    }

    /// Rebind to the allocator already embedded in the region. Never
    /// reinitializes on-region state.
    fn attach_allocator<A: ShmAllocator>(&self) -> Result<A>
    where
        Self: Sized,
    {
        let hdr = self.header();
        if !hdr.is_initialized() || hdr.data_id < 0 {
            return Err(Error::ShmemCreateFailed(
                "no allocator embedded in backend region".into(),
            ));
        }
        let off = hdr.data_id as usize;
        if off >= self.data_capacity() {
            return Err(Error::ShmemCreateFailed(format!(
                "allocator offset {} exceeds data capacity {}",
                off,
                self.data_capacity()
            )));
        }
        let id = AllocatorId::new(self.id().major, self.id().minor);
        // SAFETY: off < data_capacity, checked above.
        let base = unsafe { self.data().add(off) };
        let region = RegionSpan::new(base, self.data_capacity() - off);
        let alloc = A::attach(id, region)?;
        registry::register(id, region.base, region.len);
        Ok(alloc)
    }
}
