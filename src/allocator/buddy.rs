//! Buddy-style free-list allocator.
//!
//! The main allocator: a small-object arena, power-of-two size-classed
//! free lists for small blocks, coarser size-classed free lists for
//! large blocks, and a monotonically growing bump heap feeding both.
//! Freeing never coalesces — the design trades some fragmentation for
//! O(1) free and simple cross-process list state.
//!
//! All state lives inside the backend region (`BuddyShared`), so any
//! attached process operates on the same lists through its own mapping.
//! The heap cursor is lock-free; list and arena mutation is serialized
//! by a coarse in-region spin lock, which keeps working across process
//! boundaries where an OS mutex would not.
//!
//! # Block layout
//!
//! ```text
//! ┌──────────────────┬──────────────────────────────────────┐
//! │ BuddyPage (16 B) │ user data                            │
//! │ next, size       │                                      │
//! └──────────────────┴──────────────────────────────────────┘
//! ^                  ^
//! block start        offset handed to the user
//! ```
//!
//! `size` records the total block length including the header, for free
//! and in-user blocks alike. Two blocks in the same large class may have
//! different recorded sizes; every consumer reads the header rather than
//! inferring from the class.

use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::{MemContext, OffsetAllocator, ShmAllocator};
use crate::backend::RegionSpan;
use crate::error::{Error, Result};
use crate::heap::AtomicHeap;
use crate::ptr::{AllocatorId, OffsetPointer};

/// log2 of the smallest small-object class (1 KiB).
pub const SMALL_MIN_LOG2: u32 = 10;
/// log2 of the largest small-object class (16 KiB).
pub const SMALL_MAX_LOG2: u32 = 14;

const SMALL_MIN: u64 = 1 << SMALL_MIN_LOG2;
const SMALL_MAX: u64 = 1 << SMALL_MAX_LOG2;
const NUM_SMALL_CLASSES: usize = (SMALL_MAX_LOG2 - SMALL_MIN_LOG2 + 1) as usize;
const NUM_LARGE_CLASSES: usize = 49;
const PAGE_HEADER: u64 = std::mem::size_of::<BuddyPage>() as u64;
const ARENA_CAPACITY: u64 = 1 << 20;
const NULL_OFF: u64 = u64::MAX;
const HEAP_ALIGN: u64 = 8;

/// On-region header at the start of every block, free or in-user.
///
/// `size` is the total block length including these 16 bytes; `next`
/// links free blocks within one class list (`u64::MAX` ends a list).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BuddyPage {
    /// Offset of the next free block in the same list.
    pub next: u64,
    /// Total block length including this header.
    pub size: u64,
}

/// On-region allocator state, placed at the start of the allocator's
/// region and shared by every attached process.
#[repr(C)]
struct BuddyShared {
    /// Offset of this state within the backend's data region.
    this_off: u64,
    /// First byte available to the heap (right after this struct).
    data_start: u64,
    heap: AtomicHeap,
    /// Small-arena bump cursor and limit (offsets; mutated under `lock`).
    arena_cur: AtomicU64,
    arena_end: AtomicU64,
    small_heads: [AtomicU64; NUM_SMALL_CLASSES],
    large_heads: [AtomicU64; NUM_LARGE_CLASSES],
    total_alloc: AtomicU64,
    lock: AtomicU32,
}

/// Process-local handle to a buddy allocator embedded in a region.
///
/// Cheap to rebind: attachers construct a new handle over their own
/// mapping without touching on-region state.
pub struct BuddyAllocator {
    id: AllocatorId,
    base: *mut u8,
    capacity: usize,
    shared: *mut BuddyShared,
}

// SAFETY: the handle itself is plain data; all mutation of the region it
// points to goes through atomics or the in-region spin lock.
unsafe impl Send for BuddyAllocator {}
unsafe impl Sync for BuddyAllocator {}

struct LockGuard<'a> {
    lock: &'a AtomicU32,
}

impl<'a> LockGuard<'a> {
    fn acquire(lock: &'a AtomicU32) -> Self {
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        Self { lock }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(0, Ordering::Release);
    }
}

#[inline]
fn small_class(round: u64) -> usize {
    debug_assert!(round.is_power_of_two());
    (round.ilog2() - SMALL_MIN_LOG2) as usize
}

/// Class whose every resident block can serve its index's request size.
/// `None` when the data part is below the minimum class.
#[inline]
fn small_class_for_data(data: u64) -> Option<usize> {
    if data < SMALL_MIN {
        return None;
    }
    Some(((data.ilog2() - SMALL_MIN_LOG2) as usize).min(NUM_SMALL_CLASSES - 1))
}

#[inline]
fn large_class(total: u64) -> usize {
    ((total.ilog2()).saturating_sub(SMALL_MAX_LOG2 + 1) as usize).min(NUM_LARGE_CLASSES - 1)
}

impl BuddyAllocator {
    fn shared(&self) -> &BuddyShared {
        // SAFETY: `shared` points into the live mapping captured at
        // init/attach.
        unsafe { &*self.shared }
    }

    fn lock(&self) -> LockGuard<'_> {
        LockGuard::acquire(&self.shared().lock)
    }

    /// Raw pointer to the block header at `off`.
    ///
    /// # Safety
    ///
    /// `off + 16` must lie within the region.
    unsafe fn page_ptr(&self, off: u64) -> *mut BuddyPage {
        // SAFETY: bound upheld by the caller.
        unsafe { self.base.add(off as usize) as *mut BuddyPage }
    }

    fn read_page(&self, off: u64) -> BuddyPage {
        // SAFETY: offsets stored in lists and headers stay in-region by
        // construction.
        unsafe { ptr::read(self.page_ptr(off)) }
    }

    fn write_page(&self, off: u64, page: BuddyPage) {
        // SAFETY: as in read_page.
        unsafe { ptr::write(self.page_ptr(off), page) }
    }

    fn set_next(&self, off: u64, next: u64) {
        // SAFETY: as in read_page; only the link field is touched.
        unsafe { ptr::addr_of_mut!((*self.page_ptr(off)).next).write(next) }
    }

    // List operations. Callers hold the region lock.

    fn push_free(&self, head: &AtomicU64, off: u64, total: u64) {
        self.write_page(
            off,
            BuddyPage {
                next: head.load(Ordering::Relaxed),
                size: total,
            },
        );
        head.store(off, Ordering::Relaxed);
    }

    fn pop_free(&self, head: &AtomicU64) -> Option<(u64, u64)> {
        let off = head.load(Ordering::Relaxed);
        if off == NULL_OFF {
            return None;
        }
        let page = self.read_page(off);
        head.store(page.next, Ordering::Relaxed);
        Some((off, page.size))
    }

    /// Unlink the first block in the list whose recorded size covers
    /// `need_total`. Blocks in one class can differ in size, so the
    /// stored size decides, not the class.
    fn unlink_first_fit(&self, head: &AtomicU64, need_total: u64) -> Option<(u64, u64)> {
        let mut prev = NULL_OFF;
        let mut cur = head.load(Ordering::Relaxed);
        while cur != NULL_OFF {
            let page = self.read_page(cur);
            if page.size >= need_total {
                if prev == NULL_OFF {
                    head.store(page.next, Ordering::Relaxed);
                } else {
                    self.set_next(prev, page.next);
                }
                return Some((cur, page.size));
            }
            prev = cur;
            cur = page.next;
        }
        None
    }

    /// Queue a split remainder into the list its size belongs to.
    ///
    /// A remainder of 16 bytes or fewer cannot hold a node and is never
    /// written; one whose data part falls below the minimum small class
    /// has no home list and is likewise left unreachable.
    fn add_remainder(&self, off: u64, total: u64) {
        if total <= PAGE_HEADER {
            return;
        }
        let data = total - PAGE_HEADER;
        if data > SMALL_MAX {
            self.push_free(&self.shared().large_heads[large_class(total)], off, total);
        } else if let Some(idx) = small_class_for_data(data) {
            self.push_free(&self.shared().small_heads[idx], off, total);
        }
    }

    /// Ascending search over the small classes, starting at `class`.
    fn take_small(&self, class: usize) -> Option<(u64, u64)> {
        let sh = self.shared();
        for idx in class..NUM_SMALL_CLASSES {
            if let Some(hit) = self.pop_free(&sh.small_heads[idx]) {
                return Some(hit);
            }
        }
        None
    }

    /// Bump a block of `round` data bytes out of the small arena.
    fn arena_take(&self, round: u64) -> Option<u64> {
        let sh = self.shared();
        let need = PAGE_HEADER + round;
        let cur = sh.arena_cur.load(Ordering::Relaxed);
        let end = sh.arena_end.load(Ordering::Relaxed);
        if cur + need > end {
            return None;
        }
        sh.arena_cur.store(cur + need, Ordering::Relaxed);
        self.write_page(
            cur,
            BuddyPage {
                next: NULL_OFF,
                size: need,
            },
        );
        Some(cur)
    }

    /// Carve a fresh small arena: from the heap when it still has room
    /// (shrinking to whatever remains, so a nearly-full heap can still
    /// serve), else out of a freed large page, whose leftover goes back
    /// to the free lists rather than leaking.
    fn repopulate_small_arena(&self, round: u64) -> bool {
        let sh = self.shared();
        let need = PAGE_HEADER + round;

        let remaining = sh.heap.remaining().saturating_sub(HEAP_ALIGN);
        let want = ARENA_CAPACITY.min(remaining);
        if want >= need {
            if let Ok(off) = sh.heap.allocate(want, HEAP_ALIGN) {
                sh.arena_cur.store(off, Ordering::Relaxed);
                sh.arena_end.store(off + want, Ordering::Relaxed);
                return true;
            }
        }

        for idx in 0..NUM_LARGE_CLASSES {
            if let Some((off, total)) = self.unlink_first_fit(&sh.large_heads[idx], need) {
                let mut take = total.min(ARENA_CAPACITY);
                if total - take <= PAGE_HEADER {
                    take = total;
                }
                if take < total {
                    self.add_remainder(off + take, total - take);
                }
                sh.arena_cur.store(off, Ordering::Relaxed);
                sh.arena_end.store(off + take, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    fn allocate_small(&self, size: u64) -> Result<u64> {
        let round = size.max(SMALL_MIN).next_power_of_two();
        let class = small_class(round);
        let _guard = self.lock();

        if let Some((off, total)) = self.take_small(class) {
            self.track_add(total);
            return Ok(off + PAGE_HEADER);
        }
        if let Some(off) = self.arena_take(round) {
            self.track_add(PAGE_HEADER + round);
            return Ok(off + PAGE_HEADER);
        }
        if self.repopulate_small_arena(round) {
            // Retry the full ascending search: repopulation may have
            // queued a remainder into any bucket, not just the exact
            // class.
            if let Some((off, total)) = self.take_small(class) {
                self.track_add(total);
                return Ok(off + PAGE_HEADER);
            }
            if let Some(off) = self.arena_take(round) {
                self.track_add(PAGE_HEADER + round);
                return Ok(off + PAGE_HEADER);
            }
        }
        Err(Error::OutOfMemory)
    }

    fn allocate_large(&self, size: u64) -> Result<u64> {
        let total = size + PAGE_HEADER;
        let class = large_class(total);
        let _guard = self.lock();

        for idx in class..NUM_LARGE_CLASSES {
            if let Some((off, page_total)) =
                self.unlink_first_fit(&self.shared().large_heads[idx], total)
            {
                let rem = page_total - total;
                let block_total = if rem > PAGE_HEADER {
                    self.add_remainder(off + total, rem);
                    total
                } else {
                    // A sliver that cannot hold a node stays attached to
                    // the block and comes back whole on free.
                    page_total
                };
                self.write_page(
                    off,
                    BuddyPage {
                        next: NULL_OFF,
                        size: block_total,
                    },
                );
                self.track_add(block_total);
                return Ok(off + PAGE_HEADER);
            }
        }

        let off = self.shared().heap.allocate(total, HEAP_ALIGN)?;
        self.write_page(
            off,
            BuddyPage {
                next: NULL_OFF,
                size: total,
            },
        );
        self.track_add(total);
        Ok(off + PAGE_HEADER)
    }

    fn track_add(&self, n: u64) {
        if cfg!(feature = "track-size") {
            self.shared().total_alloc.fetch_add(n, Ordering::Relaxed);
        }
    }

    fn track_sub(&self, n: u64) {
        if cfg!(feature = "track-size") {
            self.shared().total_alloc.fetch_sub(n, Ordering::Relaxed);
        }
    }

    /// Current heap cursor, for diagnostics.
    pub fn heap_offset(&self) -> u64 {
        self.shared().heap.offset()
    }

    /// Bytes of virgin heap space left, for diagnostics.
    pub fn heap_remaining(&self) -> u64 {
        self.shared().heap.remaining()
    }
}

impl ShmAllocator for BuddyAllocator {
    fn init(id: AllocatorId, region: RegionSpan) -> Result<Self> {
        let state_size = std::mem::size_of::<BuddyShared>();
        if region.len < state_size {
            return Err(Error::ShmemCreateFailed(format!(
                "region of {} bytes cannot hold allocator state ({} bytes)",
                region.len, state_size
            )));
        }

        let data_start = state_size as u64;
        let usable = region.len as u64 - data_start;
        // A region that cannot hold even one block header gets an
        // exhausted heap: nothing past the state is ever written, and
        // every allocation reports out-of-memory.
        let heap_max = if usable <= PAGE_HEADER {
            data_start
        } else {
            region.len as u64
        };

        let state = BuddyShared {
            this_off: 0,
            data_start,
            heap: AtomicHeap::new(data_start, heap_max),
            arena_cur: AtomicU64::new(0),
            arena_end: AtomicU64::new(0),
            small_heads: std::array::from_fn(|_| AtomicU64::new(NULL_OFF)),
            large_heads: std::array::from_fn(|_| AtomicU64::new(NULL_OFF)),
            total_alloc: AtomicU64::new(0),
            lock: AtomicU32::new(0),
        };

        let shared = region.base as *mut BuddyShared;
        // SAFETY: region.base is at least 8-aligned (page-aligned
        // backend data, or an 8-aligned parent allocation) and the
        // length check above covers the state.
        unsafe { ptr::write(shared, state) };

        Ok(Self {
            id,
            base: region.base,
            capacity: region.len,
            shared,
        })
    }

    fn attach(id: AllocatorId, region: RegionSpan) -> Result<Self> {
        let state_size = std::mem::size_of::<BuddyShared>();
        if region.len < state_size {
            return Err(Error::ShmemCreateFailed(
                "region too small to hold allocator state".into(),
            ));
        }
        let shared = region.base as *mut BuddyShared;
        // SAFETY: the owner placed the state at the region start; we
        // only rebind the local pointers.
        let (this_off, data_start) = unsafe { ((*shared).this_off, (*shared).data_start) };
        if this_off != 0 || data_start != state_size as u64 {
            return Err(Error::ShmemCreateFailed(
                "region does not contain buddy allocator state".into(),
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

impl OffsetAllocator for BuddyAllocator {
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
        let size = size as u64;
        let user = if size <= SMALL_MAX {
            self.allocate_small(size)?
        } else {
            self.allocate_large(size)?
        };
        Ok(OffsetPointer::new(user))
    }

    fn aligned_allocate_offset(
        &self,
        ctx: &MemContext,
        size: usize,
        align: usize,
    ) -> Result<OffsetPointer> {
        debug_assert!(align.is_power_of_two());
        if align as u64 <= HEAP_ALIGN {
            return self.allocate_offset(ctx, size);
        }
        // Free lists do not preserve alignment classes; aligned requests
        // go straight to the heap with the header leading the payload.
        let _guard = self.lock();
        let start = self
            .shared()
            .heap
            .allocate_leading(PAGE_HEADER, size as u64, align as u64)?;
        let total = size as u64 + PAGE_HEADER;
        self.write_page(
            start,
            BuddyPage {
                next: NULL_OFF,
                size: total,
            },
        );
        self.track_add(total);
        Ok(OffsetPointer::new(start + PAGE_HEADER))
    }

    fn free_offset(&self, _ctx: &MemContext, off: OffsetPointer) -> Result<()> {
        if off.is_null() {
            return Err(Error::InvalidFree);
        }
        let user = off.get();
        if user < PAGE_HEADER || user > self.capacity as u64 {
            return Err(Error::InvalidFree);
        }
        let start = user - PAGE_HEADER;
        let page = self.read_page(start);
        let total = page.size;
        if total <= PAGE_HEADER || start + total > self.capacity as u64 {
            return Err(Error::InvalidFree);
        }
        let data = total - PAGE_HEADER;

        let _guard = self.lock();
        if data > SMALL_MAX {
            self.push_free(&self.shared().large_heads[large_class(total)], start, total);
        } else if let Some(idx) = small_class_for_data(data) {
            self.push_free(&self.shared().small_heads[idx], start, total);
        } else {
            // No allocation path produces a block below the minimum
            // class; the header is not ours.
            return Err(Error::InvalidFree);
        }
        self.track_sub(total);
        Ok(())
    }

    fn allocated_bytes(&self) -> usize {
        self.shared().total_alloc.load(Ordering::Relaxed) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::TypedAllocator;
    use crate::backend::{ArrayBackend, BackendId, HeapBackend, MemoryBackend, RegionSpan};
    use crate::ptr::FullPtr;

    const MB: usize = 1024 * 1024;
    const KB: usize = 1024;

    fn buddy_on(backend: &mut HeapBackend) -> BuddyAllocator {
        backend.make_allocator::<BuddyAllocator>().unwrap()
    }

    fn fill(p: &FullPtr<u8>, len: usize, byte: u8) {
        // SAFETY: the block is at least `len` bytes and exclusively ours.
        unsafe { std::ptr::write_bytes(p.ptr, byte, len) };
    }

    #[test]
    fn test_alloc_free_immediate_small() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 128 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        for i in 0..10_000 {
            let p = alloc.allocate::<u8>(&ctx, KB).unwrap();
            fill(&p, KB, (i & 0xFF) as u8);
            alloc.free(&ctx, p).unwrap();
        }
        assert_eq!(alloc.allocated_bytes(), 0);
    }

    #[test]
    fn test_alloc_free_immediate_medium() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 128 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        for _ in 0..1000 {
            let p = alloc.allocate::<u8>(&ctx, 64 * KB).unwrap();
            alloc.free(&ctx, p).unwrap();
        }
        assert_eq!(alloc.allocated_bytes(), 0);
    }

    #[test]
    fn test_alloc_free_immediate_large() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 128 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        for _ in 0..100 {
            let p = alloc.allocate::<u8>(&ctx, MB).unwrap();
            alloc.free(&ctx, p).unwrap();
        }
        assert_eq!(alloc.allocated_bytes(), 0);
    }

    #[test]
    fn test_batch_alloc_free() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 128 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        for _ in 0..100 {
            let batch: Vec<_> = (0..100)
                .map(|_| alloc.allocate::<u8>(&ctx, 4096).unwrap())
                .collect();
            for p in batch {
                alloc.free(&ctx, p).unwrap();
            }
        }
        assert_eq!(alloc.allocated_bytes(), 0);
    }

    #[test]
    fn test_reverse_order_free_round_trip() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 128 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        for _ in 0..2 {
            let mut ptrs: Vec<_> = (0..10_000)
                .map(|_| alloc.allocate::<u8>(&ctx, KB).unwrap())
                .collect();
            while let Some(p) = ptrs.pop() {
                alloc.free(&ctx, p).unwrap();
            }
            assert_eq!(alloc.allocated_bytes(), 0);
        }
    }

    #[test]
    fn test_large_then_small() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 128 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        let large: Vec<_> = (0..100)
            .map(|_| alloc.allocate::<u8>(&ctx, MB).unwrap())
            .collect();
        for p in large {
            alloc.free(&ctx, p).unwrap();
        }

        let small: Vec<_> = (0..1000)
            .map(|_| alloc.allocate::<u8>(&ctx, 128).unwrap())
            .collect();
        assert_eq!(small.len(), 1000);
        for p in small {
            alloc.free(&ctx, p).unwrap();
        }
        assert_eq!(alloc.allocated_bytes(), 0);
    }

    /// A freed 512 KiB block must serve a later 300 KiB request from a
    /// lower class through the ascending search, not fall through to the
    /// heap.
    #[test]
    fn test_large_search_ascends_classes() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 4 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        let mut drained = Vec::new();
        loop {
            match alloc.allocate::<u8>(&ctx, 512 * KB) {
                Ok(p) => drained.push(p),
                Err(_) => break,
            }
        }
        assert!(!drained.is_empty());

        let freed = drained.pop().unwrap();
        let freed_off = freed.shm.off;
        alloc.free(&ctx, freed).unwrap();

        // The 300 KiB class list is empty; the block must come out of
        // the 512 KiB entry, at the same offset.
        let p = alloc.allocate::<u8>(&ctx, 300 * KB).unwrap();
        assert_eq!(p.shm.off, freed_off);
        fill(&p, 300 * KB, 0xAB);

        alloc.free(&ctx, p).unwrap();
        for p in drained {
            alloc.free(&ctx, p).unwrap();
        }
    }

    /// A failed oversized allocation must leave the allocator fully
    /// usable (heap rollback).
    #[test]
    fn test_failed_huge_allocation_recovers() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 8 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        let mut drained = Vec::new();
        while let Ok(p) = alloc.allocate::<u8>(&ctx, MB) {
            drained.push(p);
        }

        let cursor_before = alloc.heap_offset();
        assert!(matches!(
            alloc.allocate::<u8>(&ctx, 64 * MB),
            Err(Error::OutOfMemory)
        ));
        assert_eq!(alloc.heap_offset(), cursor_before);

        let freed = drained.pop().unwrap();
        alloc.free(&ctx, freed).unwrap();

        let p = alloc.allocate::<u8>(&ctx, KB).unwrap();
        fill(&p, KB, 0xCD);
        alloc.free(&ctx, p).unwrap();

        for p in drained {
            alloc.free(&ctx, p).unwrap();
        }
    }

    /// Splitting a free page with a remainder of exactly one header must
    /// not write a node (the zero-data-size corruption).
    #[test]
    fn test_header_sized_remainder_does_not_corrupt() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 16 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        // Non-power-of-two so the list stores the exact size; splitting
        // it for a 128 KiB request leaves exactly 16 bytes.
        let odd = 128 * KB + PAGE_HEADER as usize;
        let big = alloc.allocate::<u8>(&ctx, odd).unwrap();
        let big_off = big.shm.off;
        fill(&big, odd, 0xAA);
        alloc.free(&ctx, big).unwrap();

        let p = alloc.allocate::<u8>(&ctx, 128 * KB).unwrap();
        assert_eq!(p.shm.off, big_off);
        fill(&p, 128 * KB, 0xBB);
        alloc.free(&ctx, p).unwrap();

        let q = alloc.allocate::<u8>(&ctx, 4096).unwrap();
        fill(&q, 4096, 0xCC);
        alloc.free(&ctx, q).unwrap();
        assert_eq!(alloc.allocated_bytes(), 0);
    }

    /// With the heap exhausted, the small arena refills from a freed
    /// large page and the page's remainder stays allocatable.
    #[test]
    fn test_arena_refill_returns_page_remainder() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 8 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        // One big block to free later, then exhaust the heap down to
        // less than a minimum small block with descending drains.
        let big = alloc.allocate::<u8>(&ctx, 4 * MB).unwrap();
        let mut drained = Vec::new();
        let mut size = MB;
        while size > 16 * KB {
            while let Ok(p) = alloc.allocate::<u8>(&ctx, size) {
                drained.push(p);
            }
            size /= 2;
        }
        assert!(alloc.heap_remaining() <= 32 * KB as u64 + PAGE_HEADER);

        // The freed 4 MiB block is the only free page available.
        alloc.free(&ctx, big).unwrap();

        // Small requests force arena refills from that page; the arena
        // takes 1 MiB at a time, so the remainder must flow back into
        // the free lists.
        let mut small = Vec::new();
        for i in 0..200 {
            let p = alloc.allocate::<u8>(&ctx, KB).unwrap();
            fill(&p, KB, i as u8);
            small.push(p);
        }

        // Without the remainder the 4 MiB page would be gone entirely
        // after one refill and this 2 MiB request would fail.
        let recovered = alloc.allocate::<u8>(&ctx, 2 * MB).unwrap();
        alloc.free(&ctx, recovered).unwrap();

        for p in small {
            alloc.free(&ctx, p).unwrap();
        }
        for p in drained {
            alloc.free(&ctx, p).unwrap();
        }
    }

    /// An allocator placed with almost no space after its state must
    /// initialize without writing past the region and fail all
    /// allocations cleanly.
    #[test]
    fn test_tiny_region_initializes_exhausted() {
        let state = std::mem::size_of::<BuddyShared>();
        let mut buf = vec![0u64; (state + 8) / 8 + 4];
        let canary_idx = buf.len() - 1;
        buf[canary_idx] = 0xDEAD_BEEF_DEAD_BEEF;

        // Only 8 bytes of data space after the allocator state.
        let span = RegionSpan::new(buf.as_mut_ptr() as *mut u8, state + 8);
        let mut backend = ArrayBackend::new(BackendId::new(0, 0), span);
        let alloc = backend.make_allocator::<BuddyAllocator>().unwrap();

        let ctx = MemContext::unbound();
        assert!(matches!(
            alloc.allocate::<u8>(&ctx, 32),
            Err(Error::OutOfMemory)
        ));
        assert!(matches!(
            alloc.allocate::<u8>(&ctx, 64 * KB),
            Err(Error::OutOfMemory)
        ));

        // Nothing was written past the end of the span.
        assert_eq!(buf[canary_idx], 0xDEAD_BEEF_DEAD_BEEF);
    }

    /// With heap and arena exhausted, a freed small block of a larger
    /// class must serve a smaller request via the ascending search —
    /// both on the first pass and on the post-refill retry.
    #[test]
    fn test_small_search_ascends_classes() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 4 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        let saved = alloc.allocate::<u8>(&ctx, 2 * KB).unwrap();
        let saved_off = saved.shm.off;
        fill(&saved, 2 * KB, 0x11);

        let mut drained = Vec::new();
        while let Ok(p) = alloc.allocate::<u8>(&ctx, 64) {
            drained.push(p);
        }

        // The freed 2 KiB block lands in a higher class than the 64 B
        // request rounds to.
        alloc.free(&ctx, saved).unwrap();

        let p = alloc.allocate::<u8>(&ctx, 64).unwrap();
        assert_eq!(p.shm.off, saved_off);
        fill(&p, 64, 0x22);
        alloc.free(&ctx, p).unwrap();

        for p in drained {
            alloc.free(&ctx, p).unwrap();
        }
    }

    /// Two blocks in the same large class with different recorded sizes:
    /// the search must trust the stored size, not the class.
    #[test]
    fn test_large_class_mixed_sizes() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 16 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        let a = alloc.allocate::<u8>(&ctx, 200 * KB).unwrap();
        let b = alloc.allocate::<u8>(&ctx, 150 * KB).unwrap();
        let a_off = a.shm.off;

        // Same class (floor_log2 of both totals is 17), freed so that
        // the smaller block heads the list.
        alloc.free(&ctx, a).unwrap();
        alloc.free(&ctx, b).unwrap();

        // 180 KiB does not fit the 150 KiB head; the walk must skip to
        // the 200 KiB block.
        let p = alloc.allocate::<u8>(&ctx, 180 * KB).unwrap();
        assert_eq!(p.shm.off, a_off);
        alloc.free(&ctx, p).unwrap();
    }

    #[test]
    fn test_aligned_allocate() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 16 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        for align in [64usize, 256, 4096] {
            let p = alloc.aligned_allocate::<u8>(&ctx, 1000, align).unwrap();
            assert_eq!(p.ptr as usize % align, 0);
            assert_eq!(p.shm.off.get() as usize % align, 0);
            alloc.free(&ctx, p).unwrap();
        }
        assert_eq!(alloc.allocated_bytes(), 0);
    }

    #[test]
    fn test_free_null_and_foreign_rejected() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 2 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        assert!(matches!(
            alloc.free(&ctx, FullPtr::<u8>::null()),
            Err(Error::InvalidFree)
        ));

        let p = alloc.allocate::<u8>(&ctx, KB).unwrap();
        let mut foreign = p;
        foreign.shm.alloc_id = AllocatorId::new(99, 99);
        assert!(matches!(alloc.free(&ctx, foreign), Err(Error::InvalidFree)));
        alloc.free(&ctx, p).unwrap();
    }

    #[test]
    fn test_attach_rebinds_live_state() {
        let mut backend = HeapBackend::init(BackendId::new(3, 0), 8 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        let p = alloc.allocate::<u8>(&ctx, 4096).unwrap();
        fill(&p, 4096, 0x77);

        let attached = backend.attach_allocator::<BuddyAllocator>().unwrap();
        assert_eq!(attached.id(), alloc.id());

        // The attached handle frees what the first handle allocated.
        let same = attached.full_ptr_from_shm::<u8>(p.shm).unwrap();
        // SAFETY: block is 4096 bytes.
        unsafe { assert_eq!(std::ptr::read(same.ptr), 0x77) };
        attached.free(&ctx, same).unwrap();
        assert_eq!(alloc.allocated_bytes(), 0);
    }

    #[test]
    fn test_allocator_at_interior_offset() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 8 * MB).unwrap();
        let offset = 256 * KB;
        // SAFETY: offset < data_capacity.
        let span = RegionSpan::new(
            unsafe { backend.data().add(offset) },
            backend.data_capacity() - offset,
        );
        let mut inner = ArrayBackend::new(BackendId::new(0, 0), span);
        let alloc = inner.make_allocator::<BuddyAllocator>().unwrap();

        let ctx = MemContext::unbound();
        for _ in 0..100 {
            let p = alloc.allocate::<u8>(&ctx, 4096).unwrap();
            fill(&p, 4096, 0x5C);
            alloc.free(&ctx, p).unwrap();
        }
        assert_eq!(alloc.allocated_bytes(), 0);
    }

    #[test]
    fn test_offsets_never_zero_or_null_encoded() {
        let mut backend = HeapBackend::init(BackendId::new(0, 0), 2 * MB).unwrap();
        let alloc = buddy_on(&mut backend);
        let ctx = MemContext::unbound();

        let p = alloc.allocate::<u8>(&ctx, KB).unwrap();
        assert!(!p.shm.off.is_null());
        assert!(p.shm.off.get() >= std::mem::size_of::<BuddyShared>() as u64);
        alloc.free(&ctx, p).unwrap();
    }
}
