//! POSIX shared-memory backend.
//!
//! A named shared memory object mapped contiguously. The owner creates
//! and sizes the object; any number of other processes attach by name.
//! Attach cannot know the region's total size a priori, so it maps the
//! header page first, reads the true `data_size`, unmaps, then remaps the
//! full `header + data` region.

use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::Mode;
use rustix::mm::{MapFlags, ProtFlags};
use rustix::shm::OFlags;
use std::ptr::NonNull;

use super::{
    BackendHeader, BackendId, MemoryBackend, DATA_ALIGNMENT, MIN_BACKEND_SIZE,
};
use crate::error::{Error, Result};

/// A memory backend backed by named POSIX shared memory.
///
/// The primary backend for multi-process use: a second process opens the
/// same name and maps the same physical pages, then re-derives allocator
/// state from the mapped bytes alone.
///
/// # Example
///
/// ```rust,ignore
/// use shmheap::backend::{BackendId, MemoryBackend, SharedMemoryBackend};
/// use shmheap::allocator::BuddyAllocator;
///
/// // Owner process
/// let mut backend =
///     SharedMemoryBackend::init(BackendId::new(0, 0), 128 << 20, "/my-region")?;
/// let alloc = backend.make_allocator::<BuddyAllocator>()?;
///
/// // Another process
/// let peer = SharedMemoryBackend::attach("/my-region")?;
/// let alloc = peer.attach_allocator::<BuddyAllocator>()?;
/// ```
pub struct SharedMemoryBackend {
    id: BackendId,
    fd: Option<OwnedFd>,
    /// Base of the full mapping (header page included); `None` once
    /// detached.
    base: Option<NonNull<u8>>,
    total_size: usize,
    url: String,
    owner: bool,
}

impl SharedMemoryBackend {
    /// Create and initialize a named region of at least `size` data
    /// bytes (rounded up to the 1 MiB minimum).
    ///
    /// Any stale object with the same name is unlinked first. Fails with
    /// [`Error::ShmemCreateFailed`] if the OS refuses the region.
    pub fn init(id: BackendId, size: usize, url: &str) -> Result<Self> {
        let size = size.max(MIN_BACKEND_SIZE);
        let total_size = DATA_ALIGNMENT + size;

        // A previous owner may have crashed without unlinking.
        let _ = rustix::shm::unlink(url);

        let fd = rustix::shm::open(
            url,
            OFlags::CREATE | OFlags::EXCL | OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| Error::ShmemCreateFailed(format!("shm_open {url}: {e}")))?;

        rustix::fs::ftruncate(&fd, total_size as u64)
            .map_err(|e| Error::ShmemCreateFailed(format!("ftruncate {url}: {e}")))?;

        let base = map_region(&fd, total_size)?;

        // SAFETY: the mapping is page-aligned and large enough for the
        // header.
        unsafe {
            std::ptr::write(
                base.as_ptr() as *mut BackendHeader,
                BackendHeader::new(id, size, true),
            );
        }

        tracing::debug!(url, total_size, "initialized shared-memory backend");

        Ok(Self {
            id,
            fd: Some(fd),
            base: Some(base),
            total_size,
            url: url.to_string(),
            owner: true,
        })
    }

    /// Attach to a region initialized by another process.
    ///
    /// Fails if the name is unknown, the header is uninitialized, or the
    /// mapping cannot be extended to the owner's data size.
    pub fn attach(url: &str) -> Result<Self> {
        let fd = rustix::shm::open(url, OFlags::RDWR, Mode::empty())
            .map_err(|e| Error::ShmemCreateFailed(format!("shm_open {url}: {e}")))?;

        // Step 1: map only the header page to learn the true size.
        let probe = map_region(&fd, DATA_ALIGNMENT)?;
        // SAFETY: the probe mapping covers the header.
        let header = unsafe { *(probe.as_ptr() as *const BackendHeader) };
        // SAFETY: probe came from map_region with this length.
        unsafe {
            let _ = rustix::mm::munmap(probe.as_ptr().cast(), DATA_ALIGNMENT);
        }

        if !header.is_initialized() {
            return Err(Error::ShmemCreateFailed(format!(
                "{url}: backend header not initialized"
            )));
        }

        // Step 2: remap the full header + data region.
        let total_size = DATA_ALIGNMENT + header.data_size as usize;
        let base = map_region(&fd, total_size)?;

        tracing::debug!(url, total_size, "attached shared-memory backend");

        Ok(Self {
            id: header.backend_id(),
            fd: Some(fd),
            base: Some(base),
            total_size,
            url: url.to_string(),
            owner: false,
        })
    }

    /// The shared-memory name this backend was created or attached with.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn unmap(&mut self) {
        if let Some(base) = self.base.take() {
            // SAFETY: base/total_size describe a live mapping created by
            // map_region; take() guards double-unmap.
            unsafe {
                let _ = rustix::mm::munmap(base.as_ptr().cast(), self.total_size);
            }
        }
        self.fd = None;
    }

    fn base(&self) -> NonNull<u8> {
        self.base.expect("backend mapping already released")
    }
}

fn map_region(fd: &OwnedFd, len: usize) -> Result<NonNull<u8>> {
    // SAFETY: we request a fresh kernel-chosen mapping of a valid fd.
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| Error::ShmemCreateFailed(format!("mmap: {e}")))?
    };
    NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| Error::ShmemCreateFailed("mmap returned null".into()))
}

impl MemoryBackend for SharedMemoryBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn header(&self) -> &BackendHeader {
        // SAFETY: the mapping is live and starts with the header.
        unsafe { &*(self.base().as_ptr() as *const BackendHeader) }
    }

    fn header_mut(&mut self) -> &mut BackendHeader {
        // SAFETY: as above; &mut self gives exclusive access in this
        // process, and the header contract makes attachers read-only.
        unsafe { &mut *(self.base().as_ptr() as *mut BackendHeader) }
    }

    fn data(&self) -> *mut u8 {
        // SAFETY: total_size >= DATA_ALIGNMENT.
        unsafe { self.base().as_ptr().add(DATA_ALIGNMENT) }
    }

    fn data_capacity(&self) -> usize {
        self.total_size - DATA_ALIGNMENT
    }

    fn detach(&mut self) {
        self.unmap();
    }

    fn destroy(&mut self) {
        self.unmap();
        if let Err(e) = rustix::shm::unlink(&self.url) {
            tracing::warn!(url = %self.url, error = %e, "shm_unlink failed");
        }
    }
}

impl Drop for SharedMemoryBackend {
    fn drop(&mut self) {
        if self.base.is_some() {
            if self.owner {
                self.destroy();
            } else {
                self.detach();
            }
        }
    }
}

impl AsFd for SharedMemoryBackend {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_ref().expect("backend fd already released").as_fd()
    }
}

// SAFETY: the mapping is shared read-write by design; mutation of
// allocator state inside it goes through atomics, and the kernel
// reference-counts the fd.
unsafe impl Send for SharedMemoryBackend {}
unsafe impl Sync for SharedMemoryBackend {}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_url(tag: &str) -> String {
        format!("/shmheap-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn test_init_writes_header() {
        let url = unique_url("hdr");
        let backend =
            SharedMemoryBackend::init(BackendId::new(1, 0), 2 * 1024 * 1024, &url).unwrap();

        let hdr = backend.header();
        assert!(hdr.is_initialized());
        assert!(hdr.is_owned());
        assert_eq!(hdr.data_size, 2 * 1024 * 1024);
        assert_eq!(hdr.data_id, -1);
        assert_eq!(backend.data_capacity(), 2 * 1024 * 1024);
    }

    #[test]
    fn test_attach_recovers_owner_layout() {
        let url = unique_url("attach");
        let backend =
            SharedMemoryBackend::init(BackendId::new(4, 2), 3 * 1024 * 1024, &url).unwrap();

        let peer = SharedMemoryBackend::attach(&url).unwrap();
        assert_eq!(peer.id(), BackendId::new(4, 2));
        assert_eq!(peer.data_capacity(), backend.data_capacity());

        // Writes through one mapping are visible through the other.
        // SAFETY: both mappings cover the full data region.
        unsafe {
            std::ptr::write(backend.data().add(100), 0xAB);
            assert_eq!(std::ptr::read(peer.data().add(100)), 0xAB);
        }
    }

    #[test]
    fn test_attach_unknown_name_fails() {
        assert!(matches!(
            SharedMemoryBackend::attach("/shmheap-test-does-not-exist"),
            Err(Error::ShmemCreateFailed(_))
        ));
    }

    #[test]
    fn test_detach_leaves_region_for_others() {
        let url = unique_url("detach");
        let backend =
            SharedMemoryBackend::init(BackendId::new(0, 0), 1024 * 1024, &url).unwrap();

        let mut peer = SharedMemoryBackend::attach(&url).unwrap();
        peer.detach();

        // The owner's mapping is unaffected.
        assert!(backend.header().is_initialized());
    }

    #[test]
    fn test_destroy_unlinks_name() {
        let url = unique_url("destroy");
        let mut backend =
            SharedMemoryBackend::init(BackendId::new(0, 0), 1024 * 1024, &url).unwrap();
        backend.destroy();

        assert!(SharedMemoryBackend::attach(&url).is_err());
    }
}
