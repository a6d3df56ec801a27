//! Process-local heap backend.

use std::alloc::Layout;
use std::ptr::NonNull;

use super::{
    BackendHeader, BackendId, MemoryBackend, DATA_ALIGNMENT, MIN_BACKEND_SIZE,
};
use crate::error::{Error, Result};

/// A backend whose region comes from an ordinary heap allocation.
///
/// The simplest variant, suitable for single-process use and tests.
/// It cannot be attached from another process: [`MemoryBackend::detach`]
/// and attach-style construction fail with
/// [`Error::ShmemNotSupported`](crate::Error::ShmemNotSupported).
///
/// # Example
///
/// ```rust
/// use shmheap::backend::{BackendId, HeapBackend, MemoryBackend};
///
/// let backend = HeapBackend::init(BackendId::new(0, 0), 1024 * 1024).unwrap();
/// assert!(backend.data_capacity() >= 1024 * 1024);
/// ```
pub struct HeapBackend {
    id: BackendId,
    /// Start of the allocation (header page); `None` after release.
    region: Option<NonNull<u8>>,
    total_size: usize,
}

impl HeapBackend {
    /// Allocate and initialize a region of at least `size` data bytes
    /// (rounded up to the 1 MiB minimum).
    pub fn init(id: BackendId, size: usize) -> Result<Self> {
        let size = size.max(MIN_BACKEND_SIZE);
        let total_size = DATA_ALIGNMENT + size;

        let layout = Layout::from_size_align(total_size, DATA_ALIGNMENT)
            .map_err(|e| Error::ShmemCreateFailed(e.to_string()))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let region = NonNull::new(ptr)
            .ok_or_else(|| Error::ShmemCreateFailed("heap allocation failed".into()))?;

        // SAFETY: the allocation is DATA_ALIGNMENT-aligned and large
        // enough for the header.
        unsafe {
            std::ptr::write(
                region.as_ptr() as *mut BackendHeader,
                BackendHeader::new(id, size, true),
            );
        }

        Ok(Self {
            id,
            region: Some(region),
            total_size,
        })
    }

    /// Attach is not supported for process-local regions.
    pub fn attach(_url: &str) -> Result<Self> {
        Err(Error::ShmemNotSupported)
    }

    fn release(&mut self) {
        if let Some(region) = self.region.take() {
            let layout = Layout::from_size_align(self.total_size, DATA_ALIGNMENT)
                .expect("layout was valid at init");
            // SAFETY: region came from alloc_zeroed with this layout and
            // has not been freed (take() guards double-free).
            unsafe { std::alloc::dealloc(region.as_ptr(), layout) };
        }
    }

    fn region(&self) -> NonNull<u8> {
        self.region.expect("backend region already released")
    }
}

impl MemoryBackend for HeapBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn header(&self) -> &BackendHeader {
        // SAFETY: the header was written at init and the region is live.
        unsafe { &*(self.region().as_ptr() as *const BackendHeader) }
    }

    fn header_mut(&mut self) -> &mut BackendHeader {
        // SAFETY: as above; &mut self gives exclusive access.
        unsafe { &mut *(self.region().as_ptr() as *mut BackendHeader) }
    }

    fn data(&self) -> *mut u8 {
        // SAFETY: the allocation is total_size >= DATA_ALIGNMENT bytes.
        unsafe { self.region().as_ptr().add(DATA_ALIGNMENT) }
    }

    fn data_capacity(&self) -> usize {
        self.total_size - DATA_ALIGNMENT
    }

    fn detach(&mut self) {
        // No other process can hold this region, so detaching releases it.
        self.release();
    }

    fn destroy(&mut self) {
        self.release();
    }
}

impl Drop for HeapBackend {
    fn drop(&mut self) {
        self.release();
    }
}

// SAFETY: the region is a plain allocation; all mutation of shared
// allocator state inside it goes through atomics.
unsafe impl Send for HeapBackend {}
unsafe impl Sync for HeapBackend {}
