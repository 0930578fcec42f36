//! Lightweight external weak references and their slot arena.
//!
//! A weak external reference does not deserve a full directory handle, so it
//! gets one slot: a reference count plus a target cell the collector clears
//! when the object dies. Storage is an append-only chain of blocks that are
//! never freed; only slots recycle, through a thread-local free list backed
//! by a lock-free stack of whole free-list batches (threads push their lists
//! in one CAS when they exit, takers pop a whole batch at once).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::ptr::GcPtr;

const BLOCK_SLOTS: usize = 1024;

#[repr(C)]
pub struct WeakSlot {
    rc: AtomicUsize,
    /// Target offset; 0 when empty or expired. The collector nulls these
    /// during its weak-processing phase.
    target: AtomicU64,
    next_free: AtomicPtr<WeakSlot>,
}

#[repr(C)]
struct WeakBlock {
    /// Next virgin slot in this block.
    carve: AtomicUsize,
    next: AtomicPtr<WeakBlock>,
    slots: [WeakSlot; BLOCK_SLOTS],
}

/// A whole free list handed back by an exiting thread.
struct FreeBatch {
    head: *mut WeakSlot,
    next: *mut FreeBatch,
}

struct WeakTable {
    current: AtomicPtr<WeakBlock>,
    batches: AtomicPtr<FreeBatch>,
}

unsafe impl Send for WeakTable {}
unsafe impl Sync for WeakTable {}

fn table() -> &'static WeakTable {
    static TABLE: OnceLock<&'static WeakTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        Box::leak(Box::new(WeakTable {
            current: AtomicPtr::new(null_mut()),
            batches: AtomicPtr::new(null_mut()),
        }))
    })
}

fn new_block(next: *mut WeakBlock) -> *mut WeakBlock {
    let layout = Layout::new::<WeakBlock>();
    let blk = unsafe { alloc_zeroed(layout) } as *mut WeakBlock;
    assert!(!blk.is_null(), "weak slot block allocation failed");
    unsafe {
        (*blk).next.store(next, Ordering::Relaxed);
    }
    blk
}

impl WeakTable {
    /// Pop a whole returned free list, if any thread has donated one.
    fn pop_batch(&self) -> *mut WeakSlot {
        loop {
            let b = self.batches.load(Ordering::Acquire);
            if b.is_null() {
                return null_mut();
            }
            let next = unsafe { (*b).next };
            if self
                .batches
                .compare_exchange(b, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let head = unsafe { (*b).head };
                drop(unsafe { Box::from_raw(b) });
                return head;
            }
        }
    }

    fn push_batch(&self, head: *mut WeakSlot) {
        let batch = Box::into_raw(Box::new(FreeBatch {
            head,
            next: null_mut(),
        }));
        loop {
            let cur = self.batches.load(Ordering::Acquire);
            unsafe {
                (*batch).next = cur;
            }
            if self
                .batches
                .compare_exchange(cur, batch, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Carve a virgin slot from the current block, growing the chain on
    /// demand. A block allocated by a losing thread is thrown away.
    fn carve(&self) -> *mut WeakSlot {
        loop {
            let blk = self.current.load(Ordering::Acquire);
            if !blk.is_null() {
                let carve = unsafe { &(*blk).carve };
                loop {
                    let i = carve.load(Ordering::Relaxed);
                    if i >= BLOCK_SLOTS {
                        break;
                    }
                    if carve
                        .compare_exchange(i, i + 1, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        return unsafe { (*blk).slots.as_ptr().add(i) as *mut WeakSlot };
                    }
                }
            }
            let fresh = new_block(blk);
            unsafe {
                (*fresh).carve.store(1, Ordering::Relaxed);
            }
            if self
                .current
                .compare_exchange(blk, fresh, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return unsafe { (*fresh).slots.as_ptr() as *mut WeakSlot };
            }
            // Lost the block race; this one was speculative.
            unsafe {
                dealloc(fresh as *mut u8, Layout::new::<WeakBlock>());
            }
        }
    }
}

struct LocalFreeList {
    head: Cell<*mut WeakSlot>,
}

impl Drop for LocalFreeList {
    fn drop(&mut self) {
        let head = self.head.get();
        if !head.is_null() {
            table().push_batch(head);
        }
    }
}

thread_local! {
    static LOCAL_FREE: LocalFreeList = LocalFreeList {
        head: Cell::new(null_mut()),
    };
}

fn obtain_slot() -> *mut WeakSlot {
    let cached = LOCAL_FREE
        .try_with(|l| {
            let mut head = l.head.get();
            if head.is_null() {
                head = table().pop_batch();
                if head.is_null() {
                    return null_mut();
                }
            }
            unsafe {
                l.head.set((*head).next_free.load(Ordering::Relaxed));
            }
            head
        })
        .unwrap_or(null_mut());
    if !cached.is_null() {
        return cached;
    }
    table().carve()
}

fn release_slot(s: *mut WeakSlot) {
    unsafe {
        // Clear the target before the slot can be reissued; a recycled slot
        // must never leak its previous reference.
        (*s).target.store(0, Ordering::Release);
        let pushed = LOCAL_FREE.try_with(|l| {
            (*s).next_free.store(l.head.get(), Ordering::Relaxed);
            l.head.set(s);
        });
        if pushed.is_err() {
            (*s).next_free.store(null_mut(), Ordering::Relaxed);
            table().push_batch(s);
        }
    }
}

fn add_reference(s: *mut WeakSlot) -> *mut WeakSlot {
    if !s.is_null() {
        unsafe {
            (*s).rc.fetch_add(1, Ordering::Relaxed);
        }
    }
    s
}

fn drop_reference(s: *mut WeakSlot) {
    if !s.is_null() && unsafe { (*s).rc.fetch_sub(1, Ordering::AcqRel) } == 1 {
        release_slot(s);
    }
}

fn store(off: u64) -> *mut WeakSlot {
    let s = obtain_slot();
    unsafe {
        (*s).rc.store(1, Ordering::Relaxed);
        (*s).target.store(off, Ordering::Release);
    }
    s
}

/// Visit every slot's target cell. The collector clears the cells whose
/// offsets died; empty slots hold 0 and clearing them again is harmless.
pub fn for_each_weak_slot(mut f: impl FnMut(&AtomicU64)) {
    let mut blk = table().current.load(Ordering::Acquire);
    while !blk.is_null() {
        unsafe {
            let carved = (*blk).carve.load(Ordering::Acquire).min(BLOCK_SLOTS);
            for slot in &(&(*blk).slots)[..carved] {
                f(&slot.target);
            }
            blk = (*blk).next.load(Ordering::Acquire);
        }
    }
}

/// Weak external reference: observes a managed object without keeping it
/// alive. Locking fails once the collector has cleared the slot.
pub struct ExternalWeakPtr<T> {
    slot: Cell<*mut WeakSlot>,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Send for ExternalWeakPtr<T> {}

impl<T> ExternalWeakPtr<T> {
    pub fn null() -> ExternalWeakPtr<T> {
        ExternalWeakPtr {
            slot: Cell::new(null_mut()),
            _marker: PhantomData,
        }
    }

    pub fn new(p: GcPtr<T>) -> ExternalWeakPtr<T> {
        ExternalWeakPtr {
            slot: Cell::new(store(p.offset())),
            _marker: PhantomData,
        }
    }

    /// Upgrade to a managed pointer. An expired slot is dropped eagerly so
    /// dead entries do not linger until the last clone goes away.
    pub fn lock(&self) -> Option<GcPtr<T>> {
        let s = self.slot.get();
        if s.is_null() {
            return None;
        }
        let off = unsafe { (*s).target.load(Ordering::Acquire) };
        if off == 0 {
            drop_reference(s);
            self.slot.set(null_mut());
            return None;
        }
        Some(unsafe { GcPtr::from_offset_unchecked(off) })
    }

    pub fn expired(&self) -> bool {
        let s = self.slot.get();
        if !s.is_null() && unsafe { (*s).target.load(Ordering::Acquire) } == 0 {
            drop_reference(s);
            self.slot.set(null_mut());
        }
        self.slot.get().is_null()
    }

    pub fn reset(&self) {
        drop_reference(self.slot.get());
        self.slot.set(null_mut());
    }
}

impl<T> From<GcPtr<T>> for ExternalWeakPtr<T> {
    fn from(p: GcPtr<T>) -> Self {
        Self::new(p)
    }
}

impl<T> From<&crate::ptr::external::ExternalPtr<T>> for ExternalWeakPtr<T> {
    fn from(p: &crate::ptr::external::ExternalPtr<T>) -> Self {
        Self::new(p.value())
    }
}

impl<T> Clone for ExternalWeakPtr<T> {
    fn clone(&self) -> Self {
        ExternalWeakPtr {
            slot: Cell::new(add_reference(self.slot.get())),
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for ExternalWeakPtr<T> {
    fn drop(&mut self) {
        drop_reference(self.slot.get());
    }
}

impl<T> Default for ExternalWeakPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}
