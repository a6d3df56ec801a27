//! Position-independent pointers.
//!
//! Every pointer stored inside a backend region is an offset, so any
//! attaching process sees the same data structures at a different virtual
//! address. Three reference types build on each other:
//!
//! - [`OffsetPointer`]: an offset into one backend's data region
//! - [`Pointer`]: `(AllocatorId, OffsetPointer)` — the canonical
//!   cross-process reference
//! - [`FullPtr`]: a transient process-local `(raw pointer, Pointer)` pair
//!   produced by every allocation
//!
//! The cross-process types derive `rkyv` traits so they can travel over
//! IPC channels; the raw half of a [`FullPtr`] never leaves the process
//! that produced it.

use crate::error::{Error, Result};

/// The top bit of an offset, reserved as a user-settable mark for
/// lock-free algorithms.
pub const MARK_BIT: u64 = 1 << 63;

/// Offset value encoding null. Offset 0 is a valid location, so null is
/// all-ones instead.
pub const NULL_OFFSET: u64 = u64::MAX;

/// The identifier for an allocator.
///
/// A 64-bit value split into a backend identifier (`major`) and a
/// per-backend slot (`minor`). The same region always produces the same
/// `AllocatorId`, so ids are stable across processes. The sentinel
/// `(-1, -1)` means null / unbound.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct AllocatorId {
    /// Backend identifier.
    pub major: i32,
    /// Per-backend slot (sub-allocator id).
    pub minor: i32,
}

impl AllocatorId {
    /// Create an id from its two halves.
    #[inline]
    pub const fn new(major: i32, minor: i32) -> Self {
        Self { major, minor }
    }

    /// The null id `(-1, -1)`.
    #[inline]
    pub const fn null() -> Self {
        Self {
            major: -1,
            minor: -1,
        }
    }

    /// Check whether this is the null id.
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.major == -1 && self.minor == -1
    }

    /// Pack both halves into a single u64 (the on-region representation).
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

impl std::fmt::Display for AllocatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// An offset into a backend's data region.
///
/// Null is encoded as `u64::MAX`, never 0: offset 0 is a legal allocation
/// result. The top bit is reserved as a user mark for lock-free
/// algorithms; [`OffsetPointer::get`] strips it, arithmetic on the raw
/// value preserves it.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct OffsetPointer(pub u64);

impl OffsetPointer {
    /// Create an offset pointer from a raw offset.
    #[inline]
    pub const fn new(off: u64) -> Self {
        Self(off)
    }

    /// The null offset.
    #[inline]
    pub const fn null() -> Self {
        Self(NULL_OFFSET)
    }

    /// Check whether this is the null offset.
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == NULL_OFFSET
    }

    /// The offset value with the mark bit stripped.
    #[inline]
    pub const fn get(&self) -> u64 {
        self.0 & !MARK_BIT
    }

    /// The raw value, mark bit included.
    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Return a copy with the mark bit set.
    #[inline]
    pub const fn mark(&self) -> Self {
        Self(self.0 | MARK_BIT)
    }

    /// Return a copy with the mark bit cleared.
    #[inline]
    pub const fn unmark(&self) -> Self {
        Self(self.0 & !MARK_BIT)
    }

    /// Check whether the mark bit is set.
    #[inline]
    pub const fn is_marked(&self) -> bool {
        self.0 & MARK_BIT != 0
    }

    /// Resolve against a base address. Returns `None` for null.
    ///
    /// The caller is responsible for `base` being the start of a region
    /// long enough to contain the offset; dereferencing the result is on
    /// them.
    #[inline]
    pub fn resolve(&self, base: *mut u8) -> Option<*mut u8> {
        if self.is_null() {
            None
        } else {
            Some(base.wrapping_add(self.get() as usize))
        }
    }
}

impl std::ops::Add<u64> for OffsetPointer {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl std::ops::Sub<u64> for OffsetPointer {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: u64) -> Self {
        Self(self.0 - rhs)
    }
}

impl std::fmt::Display for OffsetPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Atomic variant of [`OffsetPointer`] sharing the same 8-byte on-region
/// representation.
#[repr(transparent)]
#[derive(Debug)]
pub struct AtomicOffsetPointer(std::sync::atomic::AtomicU64);

impl AtomicOffsetPointer {
    /// Create from a non-atomic offset.
    #[inline]
    pub const fn new(off: OffsetPointer) -> Self {
        Self(std::sync::atomic::AtomicU64::new(off.0))
    }

    /// Atomically load the current offset.
    #[inline]
    pub fn load(&self, order: std::sync::atomic::Ordering) -> OffsetPointer {
        OffsetPointer(self.0.load(order))
    }

    /// Atomically store a new offset.
    #[inline]
    pub fn store(&self, off: OffsetPointer, order: std::sync::atomic::Ordering) {
        self.0.store(off.0, order);
    }

    /// Atomically compare-and-swap the offset.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: OffsetPointer,
        new: OffsetPointer,
        success: std::sync::atomic::Ordering,
        failure: std::sync::atomic::Ordering,
    ) -> std::result::Result<OffsetPointer, OffsetPointer> {
        self.0
            .compare_exchange_weak(current.0, new.0, success, failure)
            .map(OffsetPointer)
            .map_err(OffsetPointer)
    }
}

/// A process-independent pointer: the allocator's identity plus the
/// offset within that allocator's region.
///
/// Resolving a `Pointer` requires a per-process registry mapping
/// [`AllocatorId`] to a base address (see [`crate::registry`]).
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct Pointer {
    /// Allocator the pointer comes from.
    pub alloc_id: AllocatorId,
    /// Offset within the allocator's region.
    pub off: OffsetPointer,
}

impl Pointer {
    /// Create a pointer from its halves.
    #[inline]
    pub const fn new(alloc_id: AllocatorId, off: OffsetPointer) -> Self {
        Self { alloc_id, off }
    }

    /// The null pointer.
    #[inline]
    pub const fn null() -> Self {
        Self {
            alloc_id: AllocatorId::null(),
            off: OffsetPointer::null(),
        }
    }

    /// Check whether this is the null pointer.
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.alloc_id.is_null()
    }

    /// Resolve against a base address. Returns `None` for null.
    #[inline]
    pub fn resolve(&self, base: *mut u8) -> Option<*mut u8> {
        if self.is_null() {
            None
        } else {
            self.off.resolve(base)
        }
    }

    /// Return a copy with the mark bit set.
    #[inline]
    pub const fn mark(&self) -> Self {
        Self {
            alloc_id: self.alloc_id,
            off: self.off.mark(),
        }
    }

    /// Return a copy with the mark bit cleared.
    #[inline]
    pub const fn unmark(&self) -> Self {
        Self {
            alloc_id: self.alloc_id,
            off: self.off.unmark(),
        }
    }

    /// Check whether the mark bit is set.
    #[inline]
    pub const fn is_marked(&self) -> bool {
        self.off.is_marked()
    }
}

impl std::ops::Add<u64> for Pointer {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self {
            alloc_id: self.alloc_id,
            off: self.off + rhs,
        }
    }
}

impl std::ops::Sub<u64> for Pointer {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: u64) -> Self {
        Self {
            alloc_id: self.alloc_id,
            off: self.off - rhs,
        }
    }
}

impl std::fmt::Display for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.alloc_id, self.off)
    }
}

/// A transient pair of a raw process-local pointer and its
/// process-independent [`Pointer`].
///
/// Produced by every allocation and consumed by every free. The raw half
/// is valid only in the producing process; the `shm` half survives
/// serialization.
#[derive(Debug)]
pub struct FullPtr<T = u8> {
    /// Raw pointer, valid only within this process.
    pub ptr: *mut T,
    /// Process-independent half.
    pub shm: Pointer,
}

impl<T> FullPtr<T> {
    /// Create from both halves.
    #[inline]
    pub const fn new(ptr: *mut T, shm: Pointer) -> Self {
        Self { ptr, shm }
    }

    /// The null full pointer.
    #[inline]
    pub const fn null() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            shm: Pointer::null(),
        }
    }

    /// Check whether this pointer is null.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null() || self.shm.is_null()
    }

    /// Reinterpret as a full pointer to another type.
    #[inline]
    pub const fn cast<U>(&self) -> FullPtr<U> {
        FullPtr {
            ptr: self.ptr as *mut U,
            shm: self.shm,
        }
    }

    /// A reference to the pointee.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null, properly aligned for `T`, and no
    /// mutable reference to the same memory may exist.
    #[inline]
    pub unsafe fn as_ref(&self) -> &T {
        // SAFETY: caller upholds validity and aliasing.
        unsafe { &*self.ptr }
    }

    /// A mutable reference to the pointee.
    ///
    /// # Safety
    ///
    /// The pointer must be non-null, properly aligned for `T`, and the
    /// caller must have exclusive access to the memory.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn as_mut(&self) -> &mut T {
        // SAFETY: caller upholds validity and exclusivity.
        unsafe { &mut *self.ptr }
    }

    /// Return a copy with the mark bit set on the shared half.
    #[inline]
    pub fn mark(&self) -> Self {
        Self {
            ptr: self.ptr,
            shm: self.shm.mark(),
        }
    }

    /// Return a copy with the mark bit cleared on the shared half.
    #[inline]
    pub fn unmark(&self) -> Self {
        Self {
            ptr: self.ptr,
            shm: self.shm.unmark(),
        }
    }

    /// Check whether the mark bit is set on the shared half.
    #[inline]
    pub fn is_marked(&self) -> bool {
        self.shm.is_marked()
    }

    /// Reconstruct from a raw pointer within a known region.
    ///
    /// Fails with [`Error::PtrNotInAllocator`] when `ptr` does not lie
    /// within `[base, base + len)`.
    pub fn from_raw_in(alloc_id: AllocatorId, base: *mut u8, len: usize, ptr: *const T) -> Result<Self> {
        let addr = ptr as usize;
        let start = base as usize;
        if addr < start || addr >= start + len {
            return Err(Error::PtrNotInAllocator);
        }
        Ok(Self {
            ptr: ptr as *mut T,
            shm: Pointer::new(alloc_id, OffsetPointer::new((addr - start) as u64)),
        })
    }
}

impl<T> Clone for FullPtr<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FullPtr<T> {}

impl<T> PartialEq for FullPtr<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.shm == other.shm
    }
}

impl<T> Eq for FullPtr<T> {}
