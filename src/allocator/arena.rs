//! Arena (bump) allocator.

use super::{MemContext, OffsetAllocator, ShmAllocator};
use crate::backend::RegionSpan;
use crate::error::{Error, Result};
use crate::heap::AtomicHeap;
use crate::ptr::{AllocatorId, OffsetPointer};

/// On-region arena state.
#[repr(C)]
struct ArenaShared {
    /// First byte available to the cursor (right after this struct).
    data_start: u64,
    heap: AtomicHeap,
}

/// Pure bump allocator over a backend span.
///
/// Allocation advances a cursor; `free` is a no-op; [`reset`]
/// (ArenaAllocator::reset) rewinds the whole arena at once. Useful for
/// phase-scoped scratch memory and as the simplest allocator to embed in
/// a sub-allocated span.
///
/// # Example
///
/// ```rust
/// use shmheap::allocator::{ArenaAllocator, MemContext, OffsetAllocator};
/// use shmheap::backend::{BackendId, HeapBackend, MemoryBackend};
///
/// let mut backend = HeapBackend::init(BackendId::new(0, 0), 1 << 20).unwrap();
/// let arena = backend.make_allocator::<ArenaAllocator>().unwrap();
/// let ctx = MemContext::unbound();
///
/// let a = arena.allocate_offset(&ctx, 100).unwrap();
/// let b = arena.allocate_offset(&ctx, 200).unwrap();
/// assert_eq!(b.get() - a.get(), 100);
/// ```
pub struct ArenaAllocator {
    id: AllocatorId,
    base: *mut u8,
    capacity: usize,
    shared: *mut ArenaShared,
}

// SAFETY: the handle is plain data; cursor mutation goes through the
// atomic heap.
unsafe impl Send for ArenaAllocator {}
unsafe impl Sync for ArenaAllocator {}

impl ArenaAllocator {
    fn shared(&self) -> &ArenaShared {
        // SAFETY: `shared` points into the live mapping captured at
        // init/attach.
        unsafe { &*self.shared }
    }

    /// Bytes consumed so far (cursor position relative to the first
    /// usable byte).
    pub fn heap_offset(&self) -> u64 {
        let sh = self.shared();
        sh.heap.offset() - sh.data_start
    }

    /// Bytes left before the arena is full.
    pub fn remaining(&self) -> u64 {
        self.shared().heap.remaining()
    }

    /// Rewind the cursor to the start of the arena.
    ///
    /// Every previously returned offset becomes dangling; only sound
    /// when the caller owns all outstanding allocations.
    pub fn reset(&self) {
        let sh = self.shared();
        sh.heap.reset(sh.data_start);
    }
}

impl ShmAllocator for ArenaAllocator {
    fn init(id: AllocatorId, region: RegionSpan) -> Result<Self> {
        let state_size = std::mem::size_of::<ArenaShared>();
        if region.len < state_size {
            return Err(Error::ShmemCreateFailed(format!(
                "region of {} bytes cannot hold arena state ({} bytes)",
                region.len, state_size
            )));
        }
        let data_start = state_size as u64;
        let state = ArenaShared {
            data_start,
            heap: AtomicHeap::new(data_start, region.len as u64),
        };
        let shared = region.base as *mut ArenaShared;
        // SAFETY: region.base is 8-aligned and the length check covers
        // the state.
        unsafe { std::ptr::write(shared, state) };
        Ok(Self {
            id,
            base: region.base,
            capacity: region.len,
            shared,
        })
    }

    fn attach(id: AllocatorId, region: RegionSpan) -> Result<Self> {
        let state_size = std::mem::size_of::<ArenaShared>();
        if region.len < state_size {
            return Err(Error::ShmemCreateFailed(
                "region too small to hold arena state".into(),
            ));
        }
        let shared = region.base as *mut ArenaShared;
        // SAFETY: the owner placed the state at the region start.
        let data_start = unsafe { (*shared).data_start };
        if data_start != state_size as u64 {
            return Err(Error::ShmemCreateFailed(
                "region does not contain arena allocator state".into(),
            ));
        }
        Ok(Self {
            id,
            base: region.base,
            capacity: region.len,
            shared,
        })
    }
}

impl OffsetAllocator for ArenaAllocator {
    fn id(&self) -> AllocatorId {
        self.id
    }

    fn base(&self) -> *mut u8 {
        self.base
    }

    fn data_size(&self) -> usize {
        self.capacity
    }

    fn allocate_offset(&self, _ctx: &MemContext, size: usize) -> Result<OffsetPointer> {
        let off = self.shared().heap.allocate(size as u64, 1)?;
        Ok(OffsetPointer::new(off))
    }

    fn aligned_allocate_offset(
        &self,
        _ctx: &MemContext,
        size: usize,
        align: usize,
    ) -> Result<OffsetPointer> {
        debug_assert!(align.is_power_of_two());
        let off = self.shared().heap.allocate(size as u64, align as u64)?;
        Ok(OffsetPointer::new(off))
    }

    fn free_offset(&self, _ctx: &MemContext, _off: OffsetPointer) -> Result<()> {
        // Arena memory is reclaimed wholesale via reset().
        Ok(())
    }

    fn allocated_bytes(&self) -> usize {
        self.heap_offset() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::TypedAllocator;
    use crate::backend::{BackendId, HeapBackend, MemoryBackend};

    fn arena_on(backend: &mut HeapBackend) -> ArenaAllocator {
        backend.make_allocator::<ArenaAllocator>().unwrap()
    }

    #[test]
    fn test_sequential_offsets() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 1 << 20).unwrap();
        let arena = arena_on(&mut backend);
        let ctx = MemContext::unbound();

        let p1 = arena.allocate_offset(&ctx, 100).unwrap();
        let p2 = arena.allocate_offset(&ctx, 200).unwrap();
        let p3 = arena.allocate_offset(&ctx, 300).unwrap();

        assert_eq!(p2.get() - p1.get(), 100);
        assert_eq!(p3.get() - p2.get(), 200);
        assert_eq!(arena.heap_offset(), 600);
    }

    #[test]
    fn test_aligned_offsets() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 1 << 20).unwrap();
        let arena = arena_on(&mut backend);
        let ctx = MemContext::unbound();

        let p1 = arena.aligned_allocate_offset(&ctx, 100, 64).unwrap();
        assert_eq!(p1.get() % 64, 0);

        let p2 = arena.aligned_allocate_offset(&ctx, 50, 64).unwrap();
        assert_eq!(p2.get() % 64, 0);

        // A 1-byte allocation then an aligned one skips to the next
        // boundary.
        let p3 = arena.allocate_offset(&ctx, 1).unwrap();
        let p4 = arena.aligned_allocate_offset(&ctx, 1, 64).unwrap();
        assert!(p4.get() > p3.get());
        assert_eq!(p4.get() % 64, 0);
    }

    #[test]
    fn test_reset_rewinds_cursor() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 1 << 20).unwrap();
        let arena = arena_on(&mut backend);
        let ctx = MemContext::unbound();

        arena.allocate_offset(&ctx, 100).unwrap();
        arena.allocate_offset(&ctx, 200).unwrap();
        assert_eq!(arena.heap_offset(), 300);

        arena.reset();
        assert_eq!(arena.heap_offset(), 0);

        let p = arena.allocate_offset(&ctx, 50).unwrap();
        assert_eq!(arena.heap_offset(), 50);
        assert_eq!(p.get(), std::mem::size_of::<ArenaShared>() as u64);
    }

    #[test]
    fn test_out_of_memory_at_boundary() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 1 << 20).unwrap();
        let arena = arena_on(&mut backend);
        let ctx = MemContext::unbound();

        let room = arena.remaining() as usize;
        arena.allocate_offset(&ctx, room - 100).unwrap();
        assert!(arena.allocate_offset(&ctx, 100).is_ok());
        assert!(matches!(
            arena.allocate_offset(&ctx, 1),
            Err(Error::OutOfMemory)
        ));
    }

    #[test]
    fn test_free_is_noop() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 1 << 20).unwrap();
        let arena = arena_on(&mut backend);
        let ctx = MemContext::unbound();

        let p1 = arena.allocate::<u32>(&ctx, 40).unwrap();
        let p2 = arena.allocate::<u32>(&ctx, 80).unwrap();
        let before = arena.heap_offset();

        arena.free(&ctx, p1).unwrap();
        arena.free(&ctx, p2).unwrap();
        assert_eq!(arena.heap_offset(), before);
    }

    #[test]
    fn test_remaining_space_accounting() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 1 << 20).unwrap();
        let arena = arena_on(&mut backend);
        let ctx = MemContext::unbound();

        let total = arena.remaining();
        arena.allocate_offset(&ctx, 300).unwrap();
        assert_eq!(arena.remaining(), total - 300);

        arena.allocate_offset(&ctx, 200).unwrap();
        assert_eq!(arena.remaining(), total - 500);

        arena.reset();
        assert_eq!(arena.remaining(), total);
    }
}
