//! Per-process allocator registry.
//!
//! Resolving a [`Pointer`] requires knowing where the owning allocator's
//! region is mapped in *this* process. The registry is a process-wide map
//! from [`AllocatorId`] to that base address, populated when a backend
//! makes or attaches an allocator and torn down with the process. Reads
//! dominate writes by orders of magnitude, hence a single reader-writer
//! lock.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use crate::error::{Error, Result};
use crate::ptr::{AllocatorId, Pointer};

/// A registered allocator mapping: base address and region length in
/// this process.
#[derive(Clone, Copy, Debug)]
struct Registration {
    base: *mut u8,
    len: usize,
}

// SAFETY: the registration only describes a mapping; the memory behind it
// is shared read-write by design and all mutation goes through the
// allocator's own synchronization.
unsafe impl Send for Registration {}
unsafe impl Sync for Registration {}

fn registry() -> &'static RwLock<HashMap<AllocatorId, Registration>> {
    static REGISTRY: OnceLock<RwLock<HashMap<AllocatorId, Registration>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register (or re-register) an allocator's mapping for this process.
///
/// Called by `make_allocator` / `attach_allocator`; re-registration
/// overwrites, which is what an attach-after-restart wants.
pub fn register(id: AllocatorId, base: *mut u8, len: usize) {
    let mut map = registry().write().expect("allocator registry poisoned");
    map.insert(id, Registration { base, len });
}

/// Remove an allocator's mapping from this process's registry.
pub fn unregister(id: AllocatorId) {
    let mut map = registry().write().expect("allocator registry poisoned");
    map.remove(&id);
}

/// Check whether an allocator id is registered in this process.
pub fn is_registered(id: AllocatorId) -> bool {
    let map = registry().read().expect("allocator registry poisoned");
    map.contains_key(&id)
}

/// Resolve a process-independent pointer to a raw address in this
/// process.
///
/// Fails with [`Error::PtrNotInAllocator`] when the pointer is null, its
/// allocator is not registered here, or the offset exceeds the registered
/// region length.
pub fn resolve(ptr: &Pointer) -> Result<*mut u8> {
    if ptr.is_null() {
        return Err(Error::PtrNotInAllocator);
    }
    let map = registry().read().expect("allocator registry poisoned");
    let reg = map.get(&ptr.alloc_id).ok_or(Error::PtrNotInAllocator)?;
    let off = ptr.off.get();
    if off >= reg.len as u64 {
        return Err(Error::PtrNotInAllocator);
    }
    // SAFETY: off < len, so the result stays inside the registered
    // mapping.
    Ok(unsafe { reg.base.add(off as usize) })
}
