//! Allocators.
//!
//! Two capability traits split the allocator API the way the layers use
//! it:
//!
//! - [`OffsetAllocator`]: the low-level core — offsets in, offsets out.
//!   Each concrete allocator implements exactly this.
//! - [`TypedAllocator`]: the high-level [`FullPtr`]-returning API,
//!   provided as default methods over any `OffsetAllocator` (including
//!   sub-allocator creation).
//!
//! [`ShmAllocator`] is the embedding contract backends use to place an
//! allocator inside a region and to rebind to one placed by another
//! process.

mod arena;
mod buddy;

pub use arena::ArenaAllocator;
pub use buddy::BuddyAllocator;

use crate::backend::{ArrayBackend, BackendId, MemoryBackend, RegionSpan};
use crate::error::{Error, Result};
use crate::ptr::{AllocatorId, FullPtr, OffsetPointer, Pointer};
use crate::registry;

/// Identifier of a thread as carried in a [`MemContext`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// The null thread id.
    #[inline]
    pub const fn null() -> Self {
        Self(u32::MAX)
    }

    /// Check whether this is the null thread id.
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == u32::MAX
    }
}

/// Per-thread token carried through every allocation call.
///
/// Currently holds only a thread id, used to pick thread-local storage
/// for thread-sharded allocators; allocators that ignore sharding still
/// accept and forward it.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemContext {
    /// The calling thread, or null when unsharded.
    pub tid: Option<ThreadId>,
}

impl MemContext {
    /// A context bound to a thread id.
    #[inline]
    pub const fn new(tid: ThreadId) -> Self {
        Self { tid: Some(tid) }
    }

    /// A context with no thread binding.
    #[inline]
    pub const fn unbound() -> Self {
        Self { tid: None }
    }
}

/// The low-level allocator capability: offsets in, offsets out.
pub trait OffsetAllocator {
    /// The allocator's identity.
    fn id(&self) -> AllocatorId;

    /// Base of the allocator's region in this process.
    fn base(&self) -> *mut u8;

    /// Length of the allocator's region in bytes.
    fn data_size(&self) -> usize;

    /// Allocate `size` bytes; returns the offset of the usable bytes.
    fn allocate_offset(&self, ctx: &MemContext, size: usize) -> Result<OffsetPointer>;

    /// Allocate `size` bytes whose offset is `align`-aligned
    /// (`align` must be a power of two).
    fn aligned_allocate_offset(
        &self,
        ctx: &MemContext,
        size: usize,
        align: usize,
    ) -> Result<OffsetPointer>;

    /// Return a previously allocated offset to the allocator.
    fn free_offset(&self, ctx: &MemContext, off: OffsetPointer) -> Result<()>;

    /// Bytes currently allocated but not yet freed (0 unless the
    /// `track-size` feature is enabled and the allocator tracks).
    fn allocated_bytes(&self) -> usize;

    /// Create thread-local storage for the context's thread.
    fn create_tls(&self, _ctx: &mut MemContext) {}

    /// Release thread-local storage for the context's thread.
    fn free_tls(&self, _ctx: &MemContext) {}
}

/// The high-level, [`FullPtr`]-returning allocator API, available on
/// every [`OffsetAllocator`].
pub trait TypedAllocator: OffsetAllocator {
    /// Allocate `size` bytes and return both pointer halves.
    fn allocate<T>(&self, ctx: &MemContext, size: usize) -> Result<FullPtr<T>> {
        let off = self.allocate_offset(ctx, size)?;
        // SAFETY: allocate_offset returns an offset inside the region.
        let ptr = unsafe { self.base().add(off.get() as usize) } as *mut T;
        Ok(FullPtr::new(ptr, Pointer::new(self.id(), off)))
    }

    /// Allocate `size` bytes at `align` alignment.
    fn aligned_allocate<T>(
        &self,
        ctx: &MemContext,
        size: usize,
        align: usize,
    ) -> Result<FullPtr<T>> {
        let off = self.aligned_allocate_offset(ctx, size, align)?;
        // SAFETY: as above.
        let ptr = unsafe { self.base().add(off.get() as usize) } as *mut T;
        Ok(FullPtr::new(ptr, Pointer::new(self.id(), off)))
    }

    /// Allocate uninitialized space for `count` objects of type `T`.
    fn allocate_objs<T>(&self, ctx: &MemContext, count: usize) -> Result<FullPtr<T>> {
        self.aligned_allocate::<T>(
            ctx,
            count * std::mem::size_of::<T>(),
            std::mem::align_of::<T>(),
        )
    }

    /// Free a previously allocated pointer.
    ///
    /// Fails with [`Error::InvalidFree`] when the pointer is null or its
    /// allocator id does not match this allocator.
    fn free<T>(&self, ctx: &MemContext, p: FullPtr<T>) -> Result<()> {
        if p.is_null() || p.shm.alloc_id != self.id() {
            return Err(Error::InvalidFree);
        }
        self.free_offset(ctx, p.shm.off)
    }

    /// Whether a raw pointer lies within this allocator's region.
    fn contains_ptr<T>(&self, ptr: *const T) -> bool {
        let addr = ptr as usize;
        let start = self.base() as usize;
        addr >= start && addr < start + self.data_size()
    }

    /// Reconstruct a [`FullPtr`] from a raw pointer produced by this
    /// allocator. Fails with [`Error::PtrNotInAllocator`] otherwise.
    fn full_ptr_from_raw<T>(&self, ptr: *const T) -> Result<FullPtr<T>> {
        FullPtr::from_raw_in(self.id(), self.base(), self.data_size(), ptr)
    }

    /// Reconstruct a [`FullPtr`] from its process-independent half.
    /// Fails with [`Error::PtrNotInAllocator`] when the offset exceeds
    /// the region.
    fn full_ptr_from_shm<T>(&self, shm: Pointer) -> Result<FullPtr<T>> {
        if shm.is_null() || shm.off.get() >= self.data_size() as u64 {
            return Err(Error::PtrNotInAllocator);
        }
        // SAFETY: offset bounds-checked above.
        let ptr = unsafe { self.base().add(shm.off.get() as usize) } as *mut T;
        Ok(FullPtr::new(ptr, shm))
    }

    /// Carve a child allocator out of this allocator's region.
    ///
    /// The parent reserves a span of `size` bytes, wraps it in a
    /// synthetic backend descriptor, and initializes `A` over it. The
    /// child's id reuses the parent's `major` with the caller-chosen
    /// `sub_id` as `minor`.
    fn create_sub_allocator<A: ShmAllocator>(
        &self,
        ctx: &MemContext,
        sub_id: i32,
        size: usize,
    ) -> Result<A> {
        let span = self.allocate::<u8>(ctx, size)?;
        let mut backend = ArrayBackend::new(
            BackendId::new(self.id().major, sub_id),
            RegionSpan::new(span.ptr, size),
        );
        match backend.make_allocator::<A>() {
            Ok(alloc) => Ok(alloc),
            Err(e) => {
                let _ = self.free_offset(ctx, span.shm.off);
                Err(e)
            }
        }
    }

    /// Return a child allocator's span to this allocator.
    ///
    /// Exactly `free(FullPtr(child_span))`, guarded by the parent's
    /// containment check.
    fn free_sub_allocator<A: ShmAllocator>(&self, ctx: &MemContext, sub: A) -> Result<()> {
        let span = self.full_ptr_from_raw::<u8>(sub.base())?;
        registry::unregister(sub.id());
        self.free(ctx, span)
    }
}

impl<A: OffsetAllocator + ?Sized> TypedAllocator for A {}

/// The embedding contract between backends and allocators.
///
/// `init` places a fresh allocator's state at the start of a region;
/// `attach` rebinds to state another process already placed there,
/// mutating nothing on-region.
pub trait ShmAllocator: OffsetAllocator + Sized {
    /// Place a fresh allocator into `region` (owner path).
    fn init(id: AllocatorId, region: RegionSpan) -> Result<Self>;

    /// Rebind to the allocator already embedded in `region`.
    fn attach(id: AllocatorId, region: RegionSpan) -> Result<Self>;
}

/// RAII scope that binds a thread's context to an allocator.
///
/// Acquires thread-local storage on entry and releases it on every exit
/// path, including unwinding.
pub struct ScopedMemContext<'a, A: OffsetAllocator> {
    alloc: &'a A,
    ctx: MemContext,
}

impl<'a, A: OffsetAllocator> ScopedMemContext<'a, A> {
    /// Enter a scope for `tid` on `alloc`.
    pub fn new(alloc: &'a A, tid: ThreadId) -> Self {
        let mut ctx = MemContext::new(tid);
        alloc.create_tls(&mut ctx);
        Self { alloc, ctx }
    }

    /// The context to pass through allocation calls.
    #[inline]
    pub fn ctx(&self) -> &MemContext {
        &self.ctx
    }
}

impl<A: OffsetAllocator> Drop for ScopedMemContext<'_, A> {
    fn drop(&mut self) {
        self.alloc.free_tls(&self.ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Demonstration allocator: never allocates, counts TLS calls.
    struct NullAllocator {
        id: AllocatorId,
        tls_creates: Cell<u32>,
        tls_frees: Cell<u32>,
    }

    impl NullAllocator {
        fn new() -> Self {
            Self {
                id: AllocatorId::new(0, 0),
                tls_creates: Cell::new(0),
                tls_frees: Cell::new(0),
            }
        }
    }

    impl OffsetAllocator for NullAllocator {
        fn id(&self) -> AllocatorId {
            self.id
        }

        fn base(&self) -> *mut u8 {
            std::ptr::null_mut()
        }

        fn data_size(&self) -> usize {
            0
        }

        fn allocate_offset(&self, _: &MemContext, _: usize) -> Result<OffsetPointer> {
            Err(Error::OutOfMemory)
        }

        fn aligned_allocate_offset(
            &self,
            _: &MemContext,
            _: usize,
            _: usize,
        ) -> Result<OffsetPointer> {
            Err(Error::OutOfMemory)
        }

        fn free_offset(&self, _: &MemContext, _: OffsetPointer) -> Result<()> {
            Ok(())
        }

        fn allocated_bytes(&self) -> usize {
            0
        }

        fn create_tls(&self, _ctx: &mut MemContext) {
            self.tls_creates.set(self.tls_creates.get() + 1);
        }

        fn free_tls(&self, _ctx: &MemContext) {
            self.tls_frees.set(self.tls_frees.get() + 1);
        }
    }

    #[test]
    fn test_free_null_is_invalid() {
        let alloc = NullAllocator::new();
        let ctx = MemContext::unbound();
        assert!(matches!(
            alloc.free(&ctx, FullPtr::<u8>::null()),
            Err(Error::InvalidFree)
        ));
    }

    #[test]
    fn test_free_foreign_id_is_invalid() {
        let alloc = NullAllocator::new();
        let ctx = MemContext::unbound();
        let foreign = FullPtr::<u8>::new(
            std::ptr::NonNull::dangling().as_ptr(),
            Pointer::new(AllocatorId::new(42, 42), OffsetPointer::new(0)),
        );
        assert!(matches!(
            alloc.free(&ctx, foreign),
            Err(Error::InvalidFree)
        ));
    }

    #[test]
    fn test_scoped_context_releases_on_exit() {
        let alloc = NullAllocator::new();
        {
            let scope = ScopedMemContext::new(&alloc, ThreadId(3));
            assert_eq!(scope.ctx().tid, Some(ThreadId(3)));
            assert_eq!(alloc.tls_creates.get(), 1);
            assert_eq!(alloc.tls_frees.get(), 0);
        }
        assert_eq!(alloc.tls_frees.get(), 1);
    }

    #[test]
    fn test_scoped_context_releases_on_panic() {
        let alloc = NullAllocator::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = ScopedMemContext::new(&alloc, ThreadId(0));
            panic!("abnormal exit");
        }));
        assert!(result.is_err());
        assert_eq!(alloc.tls_frees.get(), 1);
    }

    #[test]
    fn test_thread_id_null() {
        assert!(ThreadId::null().is_null());
        assert!(!ThreadId(0).is_null());
    }
}
