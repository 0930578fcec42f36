//! # Multi-process shared heap — allocation core
//!
//! This module carves objects out of a shared memory segment that several
//! processes may map at different addresses. Everything stored in the
//! segment is offset-encoded (see [`segment`]); every shared mutation is a
//! single-word compare-and-swap.
//!
//! ## Allocation
//!
//! A request walks three tiers, fastest first:
//!
//! 1. [`local_cache`] — the thread's private pool of reusable chunks. No
//!    synchronization at all.
//! 2. [`free_list`] — shared lock-free buckets of freed chunks, versioned
//!    against reuse races.
//! 3. [`bump`] — the shared bump region, claimed through a two-phase
//!    publish/finalize protocol ([`slots`]) that any thread can complete on
//!    behalf of a stalled or dead publisher.
//!
//! When the bump region runs dry a replacement is carved off the segment's
//! unconsumed tail; once that is gone, allocation reports out-of-memory.
//!
//! ## Crash ordering
//!
//! Granted memory is zero-filled except its leading size-tag word, which
//! stays in place until the (external) object front end installs real type
//! metadata. A process that dies between allocation and construction leaves
//! a recognizable free blob behind instead of a corrupt object header.

pub mod bitfield;
pub mod bump;
pub mod free_list;
pub mod local_cache;
pub mod segment;
pub mod size_class;
pub mod slots;

use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use indexmap::IndexSet;
use thiserror::Error;

use self::local_cache::{required_padding, LocalPool};
use self::segment::{HeapHeader, Segment, HEADER_WORDS, LAYOUT_VERSION, MAGIC, WORD};

#[derive(Debug, Error)]
pub enum HeapError {
    #[error("shared arena exhausted and no replacement region available")]
    OutOfMemory,
    #[error("bump slot table exhausted; too many live threads")]
    TooManyThreads,
    #[error("segment header magic or layout mismatch")]
    BadSegment,
    #[error("arena of {0} words exceeds the {1}-word cursor range")]
    ArenaTooLarge(u64, u64),
    #[error("arena of {0} words is too small for the heap header")]
    ArenaTooSmall(u64),
    #[error("segment: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct HeapOptions {
    /// Total segment size in bytes (header included).
    pub arena_bytes: usize,
    /// Granularity of bump regions, in words.
    pub region_words: u64,
}

impl Default for HeapOptions {
    fn default() -> Self {
        HeapOptions {
            arena_bytes: 64 * 1024 * 1024,
            region_words: 16 * 1024,
        }
    }
}

/// Per-thread allocator state: the private chunk pool and the thread's slot
/// in the shared in-flight table. Obtained lazily on first use; admission
/// can also be forced up front with [`Heap::initialize_thread`].
pub struct ThreadState {
    pub pool: LocalPool,
    slot: u16,
}

impl ThreadState {
    fn admit(h: &HeapHeader) -> Result<ThreadState, HeapError> {
        let slot =
            slots::acquire(&h.slots, &h.slot_free).ok_or(HeapError::TooManyThreads)?;
        Ok(ThreadState {
            pool: LocalPool::new(),
            slot,
        })
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        if !segment::is_installed() {
            return;
        }
        let h = segment::header();
        self.pool.drain(|p, words| {
            free_list::push(h, words, segment::offset_of(p as *const u8));
        });
        slots::release(&h.slots, &h.slot_free, self.slot);
    }
}

thread_local! {
    static THREAD: RefCell<Option<ThreadState>> = const { RefCell::new(None) };
}

/// Front end over one shared segment. One heap per process; creating or
/// attaching installs the process-wide arena base, which is deliberately
/// never torn down.
pub struct Heap {
    segment: Segment,
    region_words: u64,
    regions: Mutex<IndexSet<u64>>,
}

impl Heap {
    /// Fresh heap over an anonymous shared mapping.
    pub fn create_anon(opts: HeapOptions) -> Result<Heap, HeapError> {
        let seg = Segment::map_anon(opts.arena_bytes)?;
        Self::bootstrap(seg, opts)
    }

    /// Fresh heap over a named POSIX shared-memory object.
    pub fn create_named(name: &str, opts: HeapOptions) -> Result<Heap, HeapError> {
        let seg = Segment::create_named(name, opts.arena_bytes)?;
        Self::bootstrap(seg, opts)
    }

    /// Join a heap another process created.
    pub fn attach_named(name: &str) -> Result<Heap, HeapError> {
        let seg = Segment::attach_named(name)?;
        let h = unsafe { &*(seg.base() as *const HeapHeader) };
        if h.magic.load(Ordering::Acquire) != MAGIC
            || h.layout_version.load(Ordering::Relaxed) != LAYOUT_VERSION
            || h.arena_words.load(Ordering::Relaxed) != seg.words()
        {
            return Err(HeapError::BadSegment);
        }
        segment::install(&seg);
        let region_words = h.region_words.load(Ordering::Relaxed);
        log::debug!(
            "attached heap: {} arena, {} regions live",
            formatted_size(seg.bytes()),
            h.region_next.load(Ordering::Relaxed) / region_words.max(1)
        );
        Ok(Heap {
            segment: seg,
            region_words,
            regions: Mutex::new(IndexSet::new()),
        })
    }

    fn bootstrap(seg: Segment, opts: HeapOptions) -> Result<Heap, HeapError> {
        let words = seg.words();
        if words > bump::MAX_BUMP_WORDS {
            return Err(HeapError::ArenaTooLarge(words, bump::MAX_BUMP_WORDS));
        }
        if words < HEADER_WORDS + opts.region_words.max(16) {
            return Err(HeapError::ArenaTooSmall(words));
        }
        debug_assert_eq!(memoffset::offset_of!(HeapHeader, magic), 0);
        // The next link must never be the first word of a free chunk; word 0
        // is the size tag everywhere on the heap.
        debug_assert_eq!(memoffset::offset_of!(local_cache::LocalChunk, size), 0);
        debug_assert_eq!(memoffset::offset_of!(local_cache::LocalChunk, next), WORD);
        let h = unsafe { &*(seg.base() as *const HeapHeader) };
        h.arena_words.store(words, Ordering::Relaxed);
        h.region_words.store(opts.region_words, Ordering::Relaxed);
        h.region_next.store(HEADER_WORDS, Ordering::Relaxed);
        free_list::initialize(h, opts.region_words);
        slots::initialize(&h.slots, &h.slot_free);
        h.layout_version.store(LAYOUT_VERSION, Ordering::Relaxed);
        // Attachers gate on the magic; it goes in last.
        h.magic.store(MAGIC, Ordering::Release);
        segment::install(&seg);
        log::debug!(
            "created heap: {} arena, {}-word regions",
            formatted_size(seg.bytes()),
            opts.region_words
        );
        Ok(Heap {
            segment: seg,
            region_words: opts.region_words,
            regions: Mutex::new(IndexSet::new()),
        })
    }

    pub fn header(&self) -> &HeapHeader {
        unsafe { &*(self.segment.base() as *const HeapHeader) }
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Admit the calling thread up front. Optional: every allocation path
    /// admits lazily through a once-per-thread initializer anyway.
    pub fn initialize_thread(&self) -> Result<(), HeapError> {
        self.with_thread(|_| ())
    }

    fn with_thread<R>(&self, f: impl FnOnce(&mut ThreadState) -> R) -> Result<R, HeapError> {
        THREAD.with(|cell| {
            let mut state = cell.borrow_mut();
            if state.is_none() {
                *state = Some(ThreadState::admit(self.header())?);
            }
            Ok(f(state.as_mut().expect("just admitted")))
        })
    }

    /// Allocate `size` bytes of object payload at `align`. The granted chunk
    /// carries one extra leading word holding its size tag; the returned
    /// pointer addresses that word, and the object front end overwrites it
    /// with type metadata once construction commits.
    pub fn alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        self.with_thread(|ts| self.alloc_with(ts, size, align))?
    }

    /// Same as [`Heap::alloc`] with an explicit thread handle.
    pub fn alloc_with(
        &self,
        ts: &mut ThreadState,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        assert!(size > 0, "zero-sized allocation");
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        let payload = (size + WORD - 1) / WORD;
        let words = payload as u64 + 1;
        let algn = ((align + WORD - 1) / WORD).max(1) as u64;

        let (chunk, leftover, pad) = self.obtain(ts, words, algn)?;
        unsafe {
            let ret = chunk.add(pad as usize);
            ts.pool.put(ret.add(words as usize), leftover);
            // Size tag first; it must be in place before the memory can be
            // mistaken for an object.
            ret.write(words);
            if pad > 0 {
                ts.pool.put(chunk, pad);
            }
            memx::memset(
                std::slice::from_raw_parts_mut(
                    ret.add(1).cast::<u8>(),
                    ((words - 1) as usize) * WORD,
                ),
                0,
            );
            debug_assert_eq!(ret.read(), words, "size tag corrupted during carve");
            Ok(NonNull::new_unchecked(ret.cast()))
        }
    }

    fn obtain(
        &self,
        ts: &mut ThreadState,
        words: u64,
        algn: u64,
    ) -> Result<(*mut u64, u64, u64), HeapError> {
        if let Some(found) = ts.pool.get(words, algn) {
            return Ok(found);
        }
        let padded = if algn > 1 { words + algn - 1 } else { words };
        let h = self.header();
        loop {
            if let Some((off, got)) = free_list::pop(h, padded) {
                let chunk = unsafe { segment::word_ptr(off) };
                let pad = required_padding(chunk, algn);
                return Ok((chunk, got - words - pad, pad));
            }
            match bump::allocate(h, ts.slot, padded) {
                Ok(off) => {
                    let chunk = unsafe { segment::word_ptr(off) };
                    let pad = required_padding(chunk, algn);
                    return Ok((chunk, padded - words - pad, pad));
                }
                Err(bump::Exhausted) => match self.carve_region(padded) {
                    Some((begin, end)) => {
                        if bump::install_region(h, begin, end) {
                            self.regions.lock().unwrap().insert(begin);
                        } else {
                            // Someone else replaced the region first; this
                            // one is still good memory.
                            free_list::push(h, end - begin, begin);
                        }
                    }
                    None => return Err(HeapError::OutOfMemory),
                },
            }
        }
    }

    /// Carve the next region off the unconsumed arena tail. Monotonic;
    /// offsets never repeat.
    fn carve_region(&self, min_words: u64) -> Option<(u64, u64)> {
        let h = self.header();
        let arena = h.arena_words.load(Ordering::Relaxed);
        loop {
            let next = h.region_next.load(Ordering::Acquire);
            let avail = arena.saturating_sub(next);
            if avail < min_words {
                return None;
            }
            let want = self.region_words.max(min_words).min(avail);
            if h
                .region_next
                .compare_exchange(next, next + want, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some((next, next + want));
            }
        }
    }

    /// Return an object's chunk to the calling thread's pool. `size` is the
    /// payload size the object was allocated with.
    pub fn dealloc(&self, ptr: NonNull<u8>, size: usize) -> Result<(), HeapError> {
        let words = ((size + WORD - 1) / WORD) as u64 + 1;
        let p = ptr.as_ptr();
        assert!(
            segment::in_arena(p) && segment::offset_of(p) + words <= segment::arena_words(),
            "chunk bounds disagree with recorded size; heap corrupt"
        );
        self.with_thread(|ts| ts.pool.put(p.cast(), words))
    }

    /// Donate a chunk straight to the shared lists. This is the seam the
    /// external sweeper feeds reclaimed memory through.
    pub fn release_to_global(&self, off: u64, words: u64) {
        free_list::push(self.header(), words, off);
    }

    /// Regions this process installed. Diagnostic.
    pub fn regions_installed(&self) -> usize {
        self.regions.lock().unwrap().len()
    }

    /// Abort-on-OOM wrapper with standard allocator semantics.
    pub fn alloc_or_abort(&self, size: usize, align: usize) -> NonNull<u8> {
        match self.alloc(size, align) {
            Ok(p) => p,
            Err(HeapError::OutOfMemory) => oom_abort(),
            Err(e) => panic!("allocation failed: {}", e),
        }
    }
}

pub struct FormattedSize {
    pub size: usize,
}

impl fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ksize = (self.size as f64) / 1024f64;
        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }
        let msize = ksize / 1024f64;
        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }
        let gsize = msize / 1024f64;
        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

#[inline(never)]
#[cold]
fn oom_abort() -> ! {
    eprintln!("out of shared heap memory");
    std::process::exit(1);
}

#[cfg(test)]
pub(crate) fn test_heap() -> &'static Heap {
    use std::sync::OnceLock;
    static HEAP: OnceLock<Heap> = OnceLock::new();
    HEAP.get_or_init(|| {
        Heap::create_anon(HeapOptions {
            arena_bytes: 8 * 1024 * 1024,
            region_words: 4 * 1024,
        })
        .expect("test heap")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_tags_and_zeroes() {
        let heap = test_heap();
        let p = heap.alloc(40, 8).unwrap().as_ptr().cast::<u64>();
        unsafe {
            assert_eq!(p.read(), 6); // 5 payload words + tag
            for i in 1..6 {
                assert_eq!(p.add(i).read(), 0);
            }
        }
    }

    #[test]
    fn dealloc_then_alloc_reuses_locally() {
        let heap = test_heap();
        let p = heap.alloc(64, 8).unwrap();
        heap.dealloc(p, 64).unwrap();
        let q = heap.alloc(64, 8).unwrap();
        assert_eq!(p.as_ptr(), q.as_ptr());
        heap.dealloc(q, 64).unwrap();
    }

    #[test]
    fn alignment_is_honored() {
        let heap = test_heap();
        for _ in 0..32 {
            let p = heap.alloc(24, 64).unwrap();
            assert_eq!(p.as_ptr() as usize % 64, 0);
        }
    }

}
