//! GPU-unified memory backend.
//!
//! Exposes a region that is coherent between the host and a GPU: the
//! same virtual region is valid on both sides, with no staging copies.
//! On Linux this is a shared mapping whose file descriptor can be
//! imported by device drivers (DMA-BUF style import of an fd-backed
//! buffer); launching kernels against it is the concern of GPU runtime
//! code, not this crate.

use rustix::fd::{AsFd, BorrowedFd};

use super::{BackendHeader, BackendId, MemoryBackend, SharedMemoryBackend};
use crate::error::Result;

/// A memory backend whose region is visible to both the host and a GPU.
///
/// Behaves exactly like [`SharedMemoryBackend`] for init/attach/detach/
/// destroy (same named URL, same header contract, same two-step attach),
/// and additionally exposes the region's file descriptor for device
/// import plus a [`prefault`](GpuUnifiedBackend::prefault) helper so
/// first-touch page faults do not land inside a latency-sensitive
/// transfer.
pub struct GpuUnifiedBackend {
    inner: SharedMemoryBackend,
}

impl GpuUnifiedBackend {
    /// Create and initialize a named unified region of at least `size`
    /// data bytes.
    pub fn init(id: BackendId, size: usize, url: &str) -> Result<Self> {
        Ok(Self {
            inner: SharedMemoryBackend::init(id, size, url)?,
        })
    }

    /// Attach to a unified region initialized by another process.
    pub fn attach(url: &str) -> Result<Self> {
        Ok(Self {
            inner: SharedMemoryBackend::attach(url)?,
        })
    }

    /// The shared-memory name this backend was created or attached with.
    pub fn url(&self) -> &str {
        self.inner.url()
    }

    /// Touch every page of the region so physical memory is resident
    /// before the first device access.
    pub fn prefault(&self) {
        let page_size = rustix::param::page_size();
        let ptr = self.data();
        for offset in (0..self.data_capacity()).step_by(page_size) {
            // SAFETY: offset < data_capacity; volatile read prevents the
            // loop from being optimized away.
            unsafe {
                std::ptr::read_volatile(ptr.add(offset));
            }
        }
    }
}

impl MemoryBackend for GpuUnifiedBackend {
    fn id(&self) -> BackendId {
        self.inner.id()
    }

    fn header(&self) -> &BackendHeader {
        self.inner.header()
    }

    fn header_mut(&mut self) -> &mut BackendHeader {
        self.inner.header_mut()
    }

    fn data(&self) -> *mut u8 {
        self.inner.data()
    }

    fn data_capacity(&self) -> usize {
        self.inner.data_capacity()
    }

    fn detach(&mut self) {
        self.inner.detach();
    }

    fn destroy(&mut self) {
        self.inner.destroy();
    }
}

impl AsFd for GpuUnifiedBackend {
    /// The fd backing the region, for import by a device driver.
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_url(tag: &str) -> String {
        format!("/shmheap-gpu-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn test_unified_init_and_prefault() {
        let url = unique_url("prefault");
        let backend =
            GpuUnifiedBackend::init(BackendId::new(0, 1), 2 * 1024 * 1024, &url).unwrap();
        backend.prefault();
        assert_eq!(backend.data_capacity(), 2 * 1024 * 1024);
    }

    #[test]
    fn test_unified_attach_shares_pages() {
        let url = unique_url("attach");
        let owner =
            GpuUnifiedBackend::init(BackendId::new(0, 1), 1024 * 1024, &url).unwrap();
        let peer = GpuUnifiedBackend::attach(&url).unwrap();

        // SAFETY: both mappings cover the full data region.
        unsafe {
            std::ptr::write(owner.data(), 0x5A);
            assert_eq!(std::ptr::read(peer.data()), 0x5A);
        }
    }
}
