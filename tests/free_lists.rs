//! Shared free-list behavior, run as the only test in this process so no
//! other allocation path races the buckets under inspection.

use shmheap::heap::free_list;
use shmheap::heap::segment;
use shmheap::{Heap, HeapOptions};

#[test]
fn release_pop_and_reuse() {
    let heap = Heap::create_anon(HeapOptions {
        arena_bytes: 4 * 1024 * 1024,
        region_words: 2 * 1024,
    })
    .expect("heap");
    let h = heap.header();

    // Carve one big chunk straight from the bump path and donate it.
    let p = heap.alloc(8000, 8).expect("alloc");
    let off = segment::offset_of(p.as_ptr());
    let words = 8000 / 8 + 1; // 1001
    heap.release_to_global(off, words);

    // A request too large for that bucket's guarantee must not see it.
    assert!(free_list::pop(h, 1024).is_none());

    // A covered request gets exactly that chunk, with its recorded size.
    let (got, got_words) = free_list::pop(h, 512).expect("chunk available");
    assert_eq!(got, off);
    assert_eq!(got_words, words);

    // Push it back and let the allocator reuse it: a 512-word request
    // (4088 payload bytes + tag) is served from the donated chunk, not from
    // fresh bump space.
    free_list::push(h, words, off);
    let q = heap.alloc(4088, 8).expect("reuse");
    assert_eq!(segment::offset_of(q.as_ptr()), off);

    // The 489-word leftover went to this thread's pool; an exact-fit
    // follow-up comes straight out of it.
    let r = heap.alloc(488 * 8, 8).expect("leftover fit");
    assert_eq!(segment::offset_of(r.as_ptr()), off + 512);

    // Distinct sizes land in distinct buckets and come back smallest-first
    // when the scan starts low.
    let a = heap.alloc(240, 8).expect("a"); // 31 words
    let b = heap.alloc(2040, 8).expect("b"); // 256 words
    let a_off = segment::offset_of(a.as_ptr());
    let b_off = segment::offset_of(b.as_ptr());
    heap.release_to_global(a_off, 31);
    heap.release_to_global(b_off, 256);
    let (first, w1) = free_list::pop(h, 2).expect("first");
    assert_eq!((first, w1), (a_off, 31));
    let (second, w2) = free_list::pop(h, 2).expect("second");
    assert_eq!((second, w2), (b_off, 256));
    assert!(free_list::pop(h, 2).is_none());
}
