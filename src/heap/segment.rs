//! Shared-memory segment, the process-wide base registry, and the shared
//! header layout.
//!
//! Different processes may map the same segment at different virtual
//! addresses, so nothing address-shaped is ever stored in shared memory:
//! every shared link is an arena-relative word offset, decoded against this
//! process's `base()` at every dereference. Offset 0 is the null sentinel;
//! the header occupies the front of the arena so no chunk can have it.

use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::ffi::CString;
use std::io;
use std::ptr::null_mut;

use super::size_class::MAX_CLASSES;
use super::slots::{BumpSlot, SLOT_LIMIT};

pub const WORD: usize = 8;
pub const ALIGN_LOG: u64 = 3;

pub const MAGIC: u64 = 0x5348_4d48_4541_5031; // "SHMHEAP1"
pub const LAYOUT_VERSION: u64 = 1;

/// The bump cursor packs word offsets into 25 bits per half.
pub const MAX_ARENA_WORDS: u64 = 1 << 25;

/// Control block at the front of every segment. All mutable fields are
/// single atomic words; multi-word protocols over them live in `bump` and
/// `free_list`.
#[repr(C)]
pub struct HeapHeader {
    pub magic: AtomicU64,
    pub layout_version: AtomicU64,
    pub arena_words: AtomicU64,
    pub region_words: AtomicU64,
    /// Next unconsumed arena word. Regions are carved monotonically and
    /// never reused, which keeps every bump-cursor value globally unique.
    pub region_next: AtomicU64,
    pub class_count: AtomicU64,
    /// Packed bump cursor, see `bump`.
    pub cursor: AtomicU64,
    /// Versioned head of the bump-slot free list, see `slots`.
    pub slot_free: AtomicU64,
    pub free_lists: [AtomicU64; MAX_CLASSES],
    pub slots: [BumpSlot; SLOT_LIMIT],
}

pub const HEADER_WORDS: u64 =
    ((core::mem::size_of::<HeapHeader>() + WORD - 1) / WORD) as u64;

/// One shared mapping. Creation zeroes the memory (fresh pages), attachment
/// validates the header before anything trusts it.
pub struct Segment {
    base: *mut u8,
    bytes: usize,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Anonymous shared mapping; visible to this process and forked
    /// children. The test configuration of choice.
    pub fn map_anon(bytes: usize) -> io::Result<Segment> {
        unsafe {
            let map = libc::mmap(
                null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANON,
                -1,
                0,
            );
            if map == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Segment {
                base: map as *mut u8,
                bytes,
            })
        }
    }

    /// Create and map a named POSIX shared-memory object.
    pub fn create_named(name: &str, bytes: usize) -> io::Result<Segment> {
        let cname = CString::new(name).map_err(|_| io::ErrorKind::InvalidInput)?;
        unsafe {
            let fd = libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            );
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::ftruncate(fd, bytes as libc::off_t) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
                return Err(err);
            }
            let seg = Self::map_fd(fd, bytes);
            libc::close(fd);
            seg
        }
    }

    /// Map an existing named segment, possibly at a different address than
    /// its creator got.
    pub fn attach_named(name: &str) -> io::Result<Segment> {
        let cname = CString::new(name).map_err(|_| io::ErrorKind::InvalidInput)?;
        unsafe {
            let fd = libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let mut st: libc::stat = core::mem::zeroed();
            if libc::fstat(fd, &mut st) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
            let seg = Self::map_fd(fd, st.st_size as usize);
            libc::close(fd);
            seg
        }
    }

    unsafe fn map_fd(fd: libc::c_int, bytes: usize) -> io::Result<Segment> {
        let map = libc::mmap(
            null_mut(),
            bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        if map == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Segment {
            base: map as *mut u8,
            bytes,
        })
    }

    /// Remove a named segment from the namespace.
    pub fn unlink(name: &str) {
        if let Ok(cname) = CString::new(name) {
            unsafe {
                libc::shm_unlink(cname.as_ptr());
            }
        }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn words(&self) -> u64 {
        (self.bytes / WORD) as u64
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // The installed arena is deliberately leaked: objects created before
        // teardown must stay decodable afterwards.
        if ARENA_BASE.load(Ordering::Acquire) == self.base {
            return;
        }
        unsafe {
            libc::munmap(self.base.cast(), self.bytes);
        }
    }
}

static ARENA_BASE: AtomicPtr<u8> = AtomicPtr::new(null_mut());
static ARENA_WORDS: AtomicU64 = AtomicU64::new(0);

/// Register the process-wide arena. One segment per process; a second
/// install with a different base is a usage error. There is intentionally no
/// uninstall.
pub fn install(seg: &Segment) {
    ARENA_WORDS.store(seg.words(), Ordering::Relaxed);
    match ARENA_BASE.compare_exchange(
        null_mut(),
        seg.base(),
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {}
        Err(prev) => assert!(
            prev == seg.base(),
            "a different arena is already installed in this process"
        ),
    }
}

pub fn is_installed() -> bool {
    !ARENA_BASE.load(Ordering::Acquire).is_null()
}

#[inline(always)]
pub fn base() -> *mut u8 {
    let p = ARENA_BASE.load(Ordering::Acquire);
    debug_assert!(!p.is_null(), "arena not installed");
    p
}

#[inline(always)]
pub fn arena_words() -> u64 {
    ARENA_WORDS.load(Ordering::Relaxed)
}

#[inline(always)]
pub fn header() -> &'static HeapHeader {
    unsafe { &*(base() as *const HeapHeader) }
}

/// Shared word at `off`, viewed atomically. Every cross-process cell goes
/// through here.
#[inline(always)]
pub unsafe fn word(off: u64) -> &'static AtomicU64 {
    debug_assert!(off < arena_words());
    &*(base().add((off as usize) << ALIGN_LOG as usize) as *const AtomicU64)
}

#[inline(always)]
pub unsafe fn word_ptr(off: u64) -> *mut u64 {
    debug_assert!(off < arena_words());
    base().add((off as usize) << ALIGN_LOG as usize) as *mut u64
}

#[inline(always)]
pub fn in_arena(p: *const u8) -> bool {
    let b = base() as usize;
    let a = p as usize;
    a >= b && a < b + (arena_words() as usize) * WORD
}

/// Encode a process address back into an arena offset.
#[inline(always)]
pub fn offset_of(p: *const u8) -> u64 {
    assert!(in_arena(p), "address {:p} is outside the shared arena", p);
    let delta = p as usize - base() as usize;
    debug_assert!(delta % WORD == 0);
    (delta >> ALIGN_LOG as usize) as u64
}
