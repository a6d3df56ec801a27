//! Span-backed backend for sub-allocation.

use super::{BackendHeader, BackendId, MemoryBackend, RegionSpan};
use crate::error::{Error, Result};

/// A synthetic backend over a caller-provided span of memory.
///
/// This is how one allocator serves as the backend for another: the
/// parent reserves a span of its own data region, wraps it in an
/// `ArrayBackend`, and hands it to the child's initializer via
/// [`MemoryBackend::make_allocator`]. The descriptor itself lives in the
/// struct, not in the span — the span belongs entirely to the child.
///
/// There is no OS resource behind it, so `detach` and `destroy` are
/// no-ops and attach-by-name is unsupported.
pub struct ArrayBackend {
    id: BackendId,
    header: BackendHeader,
    span: RegionSpan,
}

impl ArrayBackend {
    /// Wrap a span as a backend. The span must remain valid and
    /// unaliased for as long as any allocator built on it is in use.
    pub fn new(id: BackendId, span: RegionSpan) -> Self {
        Self {
            id,
            header: BackendHeader::new(id, span.len, false),
            span,
        }
    }

    /// Attach is not supported for span-backed regions.
    pub fn attach(_url: &str) -> Result<Self> {
        Err(Error::ShmemNotSupported)
    }
}

impl MemoryBackend for ArrayBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn header(&self) -> &BackendHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut BackendHeader {
        &mut self.header
    }

    fn data(&self) -> *mut u8 {
        self.span.base
    }

    fn data_capacity(&self) -> usize {
        self.span.len
    }

    fn detach(&mut self) {}

    fn destroy(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_backend_exposes_span() {
        let mut buf = vec![0u8; 4096];
        let span = RegionSpan::new(buf.as_mut_ptr(), buf.len());
        let backend = ArrayBackend::new(BackendId::new(7, 1), span);

        assert_eq!(backend.data(), buf.as_mut_ptr());
        assert_eq!(backend.data_capacity(), 4096);
        assert_eq!(backend.header().data_size, 4096);
    }

    #[test]
    fn test_array_backend_attach_not_supported() {
        assert!(matches!(
            ArrayBackend::attach("/x"),
            Err(Error::ShmemNotSupported)
        ));
    }
}
