//! Lock-free shared free-chunk lists, one versioned bucket per size class.
//!
//! A free chunk carries its size in word 0 and its next link in word 1; the
//! size word must stay first so an asynchronous sweep recognizes free space.
//! Bucket heads pack the chunk offset with a version counter bumped on every
//! successful push and pop, so a compare-and-swap taken against a head that
//! has since cycled through the same offset still fails.

use core::sync::atomic::Ordering;

use super::bitfield::{BitFieldTrait, HeadOffField, HeadVerField};
use super::segment::{self, HeapHeader};
use super::size_class::{self, MIN_CHUNK_WORDS};

const VER_MASK: u64 = (1 << 24) - 1;

/// Bind the live bucket count to the region size. Called once by segment
/// creation; not re-entrant. Attaching processes inherit the stored count.
pub fn initialize(h: &HeapHeader, region_words: u64) {
    let count = size_class::class_count_for(region_words);
    h.class_count.store(count as u64, Ordering::Release);
}

#[inline]
fn next_ver(cur: u64) -> u64 {
    (HeadVerField::decode(cur) + 1) & VER_MASK
}

/// Donate a free chunk to its bucket.
pub fn push(h: &HeapHeader, words: u64, off: u64) {
    debug_assert!(words >= MIN_CHUNK_WORDS && off != 0);
    let count = h.class_count.load(Ordering::Relaxed) as usize;
    let k = size_class::bucket_of(words).min(count - 1);
    unsafe {
        segment::word(off).store(words, Ordering::Relaxed);
    }
    let head = &h.free_lists[k];
    loop {
        let cur = head.load(Ordering::Acquire);
        unsafe {
            segment::word(off + 1).store(HeadOffField::decode(cur), Ordering::Relaxed);
        }
        let des = HeadOffField::encode(off) | HeadVerField::encode(next_ver(cur));
        if head
            .compare_exchange(cur, des, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

/// Take any chunk of at least `min_words`, scanning buckets upward from the
/// smallest that could satisfy the request. Returns the chunk offset and its
/// recorded size.
pub fn pop(h: &HeapHeader, min_words: u64) -> Option<(u64, u64)> {
    let count = h.class_count.load(Ordering::Relaxed) as usize;
    let mut k = size_class::class_of(min_words);
    while k < count {
        let head = &h.free_lists[k];
        loop {
            let cur = head.load(Ordering::Acquire);
            let off = HeadOffField::decode(cur);
            if off == 0 {
                break;
            }
            let next = unsafe { segment::word(off + 1).load(Ordering::Relaxed) };
            let des = HeadOffField::encode(next) | HeadVerField::encode(next_ver(cur));
            if head
                .compare_exchange(cur, des, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let words = unsafe { segment::word(off).load(Ordering::Relaxed) };
                debug_assert!(words >= min_words);
                return Some((off, words));
            }
            // Lost the race; retry this bucket before escalating.
        }
        k += 1;
    }
    None
}
