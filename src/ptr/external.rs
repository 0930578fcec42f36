//! Canonical reference-counted handles for bare managed addresses.
//!
//! Code outside the collected graph cannot hold a [`GcPtr`] safely, so it
//! gets an [`ExternalPtr`]: a refcounted handle whose bookkeeping slot in the
//! root table keeps the target anchored for the collector. The directory
//! guarantees at most one canonical handle per live address through two
//! caches:
//!
//! - a thread-local array, checked with no synchronization at all;
//! - a process-wide array of single-entry buckets, each behind a best-effort
//!   test-and-set lock. A caller that loses the lock race simply fabricates
//!   an uncached handle: correctness never depends on a cache hit, only the
//!   hit rate does.
//!
//! Both process-wide tables are created lazily and deliberately never torn
//! down, so handles created before them (process-startup statics) stay
//! destructible at exit.

use std::alloc::{alloc_zeroed, Layout};
use std::cell::{RefCell, UnsafeCell};
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::heap::segment::ALIGN_LOG;
use crate::ptr::GcPtr;

const GLOBAL_CACHE_SIZE: usize = 1 << 16;
const LOCAL_CACHE_SIZE: usize = 1 << 12;
const BLOCK_SLOTS: usize = 1024;
const MAX_BLOCKS: usize = 1024;

/// Shared bookkeeping behind every handle for one address. Dropping the last
/// clone releases the root slot back to the dropping thread's free list.
pub struct HandleInner {
    addr: *mut u8,
    index: u32,
}

unsafe impl Send for HandleInner {}
unsafe impl Sync for HandleInner {}

impl Drop for HandleInner {
    fn drop(&mut self) {
        release_slot(self.index);
    }
}

/// Externally-pinned handle to a managed object. Clones share bookkeeping;
/// equality is by underlying address, so two handles racing through the
/// directory for the same object always compare equal even if one of them
/// was fabricated uncached.
pub struct ExternalPtr<T> {
    inner: Arc<HandleInner>,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Send for ExternalPtr<T> {}
unsafe impl<T> Sync for ExternalPtr<T> {}

impl<T> ExternalPtr<T> {
    pub fn new(p: GcPtr<T>) -> ExternalPtr<T> {
        externalize(p)
    }

    pub fn value(&self) -> GcPtr<T> {
        GcPtr::from_bare_address(self.inner.addr.cast())
    }

    pub fn as_bare_address(&self) -> *mut T {
        self.inner.addr.cast()
    }
}

impl<T> From<GcPtr<T>> for ExternalPtr<T> {
    fn from(p: GcPtr<T>) -> Self {
        externalize(p)
    }
}

impl<T> Clone for ExternalPtr<T> {
    fn clone(&self) -> Self {
        ExternalPtr {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Deref for ExternalPtr<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.inner.addr.cast() }
    }
}

impl<T, U> PartialEq<ExternalPtr<U>> for ExternalPtr<T> {
    fn eq(&self, other: &ExternalPtr<U>) -> bool {
        self.inner.addr == other.inner.addr
    }
}
impl<T> Eq for ExternalPtr<T> {}

impl<T> std::fmt::Pointer for ExternalPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:p}", self.inner.addr)
    }
}

impl<T> std::fmt::Debug for ExternalPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ExternalPtr({:p})", self.inner.addr)
    }
}

// ---------------------------------------------------------------------------
// Root slot table: block spine + the crate's only mutex, on the cold path.

#[repr(C)]
struct RootSlot {
    /// Anchored target offset; 0 when free. The collector reads these as
    /// roots.
    target: AtomicU64,
    /// Free-list link, index plus one, 0 terminates.
    next_free: AtomicU32,
}

#[repr(C)]
struct RootBlock {
    slots: [RootSlot; BLOCK_SLOTS],
}

struct RootCold {
    /// Next virgin slot in the newest block; `BLOCK_SLOTS` forces a grow.
    next_slot: u32,
    /// Free-list heads returned by exiting threads.
    free_lists: Vec<u32>,
}

struct RootTable {
    spine: Box<[AtomicPtr<RootBlock>]>,
    /// Number of initialized blocks; grows only under the mutex but is read
    /// lock-free by collector scans.
    grown: AtomicU32,
    cold: Mutex<RootCold>,
}

impl RootTable {
    fn new() -> RootTable {
        let spine: Vec<AtomicPtr<RootBlock>> =
            (0..MAX_BLOCKS).map(|_| AtomicPtr::new(null_mut())).collect();
        RootTable {
            spine: spine.into_boxed_slice(),
            grown: AtomicU32::new(0),
            cold: Mutex::new(RootCold {
                next_slot: BLOCK_SLOTS as u32,
                free_lists: Vec::new(),
            }),
        }
    }

    #[inline]
    fn slot(&self, index: u32) -> &RootSlot {
        let b = index as usize / BLOCK_SLOTS;
        let i = index as usize % BLOCK_SLOTS;
        let blk = self.spine[b].load(Ordering::Acquire);
        debug_assert!(!blk.is_null());
        unsafe { &(*blk).slots[i] }
    }

    /// Hand out a free-list head (index + 1). Grows the spine when every
    /// existing slot is spoken for.
    fn get_free_list(&self) -> u32 {
        let mut cold = self.cold.lock().unwrap();
        if let Some(head) = cold.free_lists.pop() {
            return head;
        }
        if cold.next_slot as usize == BLOCK_SLOTS {
            let b = self.grown.load(Ordering::Relaxed) as usize;
            assert!(b < MAX_BLOCKS, "inbound root table exhausted");
            let layout = Layout::new::<RootBlock>();
            let blk = unsafe { alloc_zeroed(layout) } as *mut RootBlock;
            assert!(!blk.is_null(), "root block allocation failed");
            self.spine[b].store(blk, Ordering::Release);
            // The block must be visible before the published count moves, or
            // a collector scan could walk uninitialized memory.
            self.grown.store(b as u32 + 1, Ordering::Release);
            cold.next_slot = 0;
            log::trace!("root table grew to {} blocks", b + 1);
        }
        let b = self.grown.load(Ordering::Relaxed) - 1;
        let idx = b * BLOCK_SLOTS as u32 + cold.next_slot;
        self.slot(idx).next_free.store(0, Ordering::Relaxed);
        cold.next_slot += 1;
        idx + 1
    }

    fn release_free_list(&self, head: u32) {
        self.cold.lock().unwrap().free_lists.push(head);
    }
}

fn root_table() -> &'static RootTable {
    static TABLE: OnceLock<&'static RootTable> = OnceLock::new();
    TABLE.get_or_init(|| Box::leak(Box::new(RootTable::new())))
}

/// Visit every live anchored offset. The collector treats these as roots.
pub fn for_each_root(mut f: impl FnMut(u64)) {
    let t = root_table();
    let blocks = t.grown.load(Ordering::Acquire) as usize;
    for b in 0..blocks {
        let blk = t.spine[b].load(Ordering::Acquire);
        for slot in unsafe { &(*blk).slots } {
            let off = slot.target.load(Ordering::Acquire);
            if off != 0 {
                f(off);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-thread directory state.

struct DirThread {
    cache: Box<[Weak<HandleInner>]>,
    /// Head of this thread's slot free list, index plus one.
    free: u32,
}

impl DirThread {
    fn new() -> DirThread {
        DirThread {
            cache: (0..LOCAL_CACHE_SIZE)
                .map(|_| Weak::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            free: 0,
        }
    }
}

impl Drop for DirThread {
    fn drop(&mut self) {
        if self.free != 0 {
            root_table().release_free_list(self.free);
        }
    }
}

thread_local! {
    static DIR: RefCell<DirThread> = RefCell::new(DirThread::new());
}

fn create_handle(addr: *mut u8, off: u64) -> Arc<HandleInner> {
    let index = DIR.with(|d| {
        let mut d = d.borrow_mut();
        if d.free == 0 {
            d.free = root_table().get_free_list();
        }
        let idx = d.free - 1;
        let slot = root_table().slot(idx);
        d.free = slot.next_free.load(Ordering::Relaxed);
        debug_assert_eq!(slot.target.load(Ordering::Relaxed), 0);
        // Anchor before the handle can escape.
        slot.target.store(off, Ordering::Release);
        idx
    });
    Arc::new(HandleInner { addr, index })
}

fn release_slot(index: u32) {
    let slot = root_table().slot(index);
    let back_to_thread = DIR.try_with(|d| {
        let mut d = d.borrow_mut();
        slot.target.store(0, Ordering::Release);
        slot.next_free.store(d.free, Ordering::Relaxed);
        d.free = index + 1;
    });
    if back_to_thread.is_err() {
        // Thread teardown already ran; hand the slot back as a one-entry
        // list instead.
        slot.target.store(0, Ordering::Release);
        slot.next_free.store(0, Ordering::Relaxed);
        root_table().release_free_list(index + 1);
    }
}

// ---------------------------------------------------------------------------
// Global single-entry-per-bucket cache.

struct CacheEntry {
    lock: AtomicBool,
    cached: UnsafeCell<Weak<HandleInner>>,
}

unsafe impl Sync for CacheEntry {}

struct GlobalCache {
    entries: Box<[CacheEntry]>,
}

impl GlobalCache {
    fn new() -> GlobalCache {
        GlobalCache {
            entries: (0..GLOBAL_CACHE_SIZE)
                .map(|_| CacheEntry {
                    lock: AtomicBool::new(false),
                    cached: UnsafeCell::new(Weak::new()),
                })
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    #[inline]
    fn bucket(addr: *mut u8) -> usize {
        (addr as usize >> ALIGN_LOG as usize) & (GLOBAL_CACHE_SIZE - 1)
    }

    fn get(&self, addr: *mut u8, off: u64) -> Arc<HandleInner> {
        let entry = &self.entries[Self::bucket(addr)];
        if entry.lock.swap(true, Ordering::Acquire) {
            // Bucket is busy. An uncached handle keeps us moving; the caches
            // are a performance aid, never a correctness requirement.
            return create_handle(addr, off);
        }
        let hit = unsafe { (*entry.cached.get()).upgrade() };
        let res = match hit {
            Some(h) if h.addr == addr => h,
            _ => {
                let h = create_handle(addr, off);
                unsafe {
                    *entry.cached.get() = Arc::downgrade(&h);
                }
                h
            }
        };
        entry.lock.store(false, Ordering::Release);
        res
    }
}

fn global_cache() -> &'static GlobalCache {
    static CACHE: OnceLock<&'static GlobalCache> = OnceLock::new();
    CACHE.get_or_init(|| Box::leak(Box::new(GlobalCache::new())))
}

/// Map a managed pointer to its canonical handle.
pub fn externalize<T>(p: GcPtr<T>) -> ExternalPtr<T> {
    let addr = p.as_bare_address() as *mut u8;
    let i = (addr as usize >> ALIGN_LOG as usize) & (LOCAL_CACHE_SIZE - 1);
    let local = DIR.with(|d| d.borrow().cache[i].upgrade());
    let inner = match local {
        Some(h) if h.addr == addr => h,
        _ => {
            let h = global_cache().get(addr, p.offset());
            DIR.with(|d| d.borrow_mut().cache[i] = Arc::downgrade(&h));
            h
        }
    };
    ExternalPtr {
        inner,
        _marker: PhantomData,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::test_heap;

    fn fresh_object() -> GcPtr<u64> {
        let heap = test_heap();
        let p = heap.alloc(16, 8).unwrap();
        GcPtr::from_bare_address(p.as_ptr().cast())
    }

    #[test]
    fn same_address_same_handle() {
        let p = fresh_object();
        let a = externalize(p);
        let b = externalize(p);
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }

    #[test]
    fn handle_anchors_a_root() {
        let p = fresh_object();
        let a = externalize(p);
        let mut seen = false;
        for_each_root(|off| seen |= off == p.offset());
        assert!(seen, "live handle not visible as a root");
        drop(a);
        let mut still = false;
        for_each_root(|off| still |= off == p.offset());
        assert!(!still, "released handle left its root behind");
    }

    #[test]
    fn contended_bucket_degrades_to_uncached() {
        let p = fresh_object();
        let addr = p.as_bare_address() as *mut u8;
        let entry = &global_cache().entries[GlobalCache::bucket(addr)];
        while entry.lock.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
        // Lock held by "someone else": the lookup must still succeed.
        let a = externalize(p);
        let b = externalize(p);
        entry.lock.store(false, Ordering::Release);
        assert_eq!(a.value(), p);
        // Degraded handles still compare equal by address.
        assert_eq!(a, b);
    }

    #[test]
    fn slot_recycles_through_thread_free_list() {
        let p = fresh_object();
        let index = {
            let a = externalize(p);
            a.inner.index
        };
        // Handle dropped; the slot must come back for the next handle made
        // on this thread.
        let q = fresh_object();
        let b = externalize(q);
        assert_eq!(b.inner.index, index);
    }
}
