//! Multi-threaded integration: disjointness of granted ranges and handle
//! canonicality under contention.

use std::sync::{Barrier, OnceLock};

use shmheap::heap::segment::{self, WORD};
use shmheap::{externalize, GcPtr, Heap, HeapOptions};

fn heap() -> &'static Heap {
    static HEAP: OnceLock<Heap> = OnceLock::new();
    HEAP.get_or_init(|| {
        Heap::create_anon(HeapOptions {
            arena_bytes: 16 * 1024 * 1024,
            region_words: 8 * 1024,
        })
        .expect("heap")
    })
}

#[test]
fn concurrent_grants_never_overlap() {
    let heap = heap();
    let threads = 8;
    let per_thread = 200;
    let sizes = [16usize, 48, 8, 120, 64, 24, 256, 32];

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            std::thread::spawn(move || {
                let heap = self::heap();
                let mut got = Vec::with_capacity(per_thread);
                for i in 0..per_thread {
                    let size = sizes[(t + i) % sizes.len()];
                    let p = heap.alloc(size, 8).expect("alloc");
                    let words = size as u64 / WORD as u64 + 1;
                    unsafe {
                        // Tag present, payload zeroed.
                        assert_eq!(p.as_ptr().cast::<u64>().read(), words);
                        for w in 1..words {
                            assert_eq!(p.as_ptr().cast::<u64>().add(w as usize).read(), 0);
                        }
                    }
                    got.push((segment::offset_of(p.as_ptr()), words));
                }
                got
            })
        })
        .collect();

    let mut all: Vec<(u64, u64)> = Vec::new();
    for h in handles {
        all.extend(h.join().unwrap());
    }
    all.sort();
    for pair in all.windows(2) {
        assert!(
            pair[0].0 + pair[0].1 <= pair[1].0,
            "ranges overlap: {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn concurrent_externalize_agrees_on_identity() {
    let heap = heap();
    let p = heap.alloc(32, 8).expect("object");
    let gc: GcPtr<u64> = GcPtr::from_bare_address(p.as_ptr().cast());

    let threads = 8;
    let barrier: &'static Barrier = Box::leak(Box::new(Barrier::new(threads)));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            std::thread::spawn(move || {
                barrier.wait();
                let h = externalize(gc);
                (h.as_bare_address() as usize, h)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let addr0 = results[0].0;
    for (addr, handle) in &results {
        assert_eq!(*addr, addr0, "handles disagree on the underlying address");
        assert_eq!(handle.value(), gc);
    }
    // Pairwise handle equality is by address, cached or not.
    for (_, a) in &results {
        for (_, b) in &results {
            assert!(a == b);
        }
    }
}

#[test]
fn cross_thread_dealloc_keeps_working() {
    let heap = heap();
    let (tx, rx) = std::sync::mpsc::channel::<Vec<(usize, usize)>>();

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let tx = tx.clone();
            std::thread::spawn(move || {
                let heap = self::heap();
                let items: Vec<(usize, usize)> = (0..250)
                    .map(|i| {
                        let size = 16 + (i % 8) * 8;
                        (heap.alloc(size, 8).unwrap().as_ptr() as usize, size)
                    })
                    .collect();
                tx.send(items).unwrap();
            })
        })
        .collect();
    drop(tx);

    let mut freed = 0;
    for items in rx {
        for (addr, size) in items {
            let p = std::ptr::NonNull::new(addr as *mut u8).unwrap();
            heap.dealloc(p, size).unwrap();
            freed += 1;
        }
    }
    for p in producers {
        p.join().unwrap();
    }
    assert_eq!(freed, 4 * 250);

    // The pool filled by the frees above satisfies new requests locally.
    for i in 0..100 {
        let size = 16 + (i % 8) * 8;
        let p = heap.alloc(size, 8).unwrap();
        heap.dealloc(p, size).unwrap();
    }
}
