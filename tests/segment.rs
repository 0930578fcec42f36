//! Named-segment round trip: what one mapping writes, another mapping of the
//! same object reads, wherever it lands. Header validation gates attachment.

use shmheap::heap::segment::Segment;
use shmheap::{Heap, HeapError};

#[test]
fn named_segment_round_trip_and_validation() {
    let name = format!("/shmheap-test-{}", std::process::id());
    Segment::unlink(&name);

    let seg1 = Segment::create_named(&name, 1024 * 1024).expect("create");
    unsafe {
        seg1.base().add(800).cast::<u64>().write(0xfeed_faced_cafe_0001u128 as u64);
    }

    let seg2 = Segment::attach_named(&name).expect("attach");
    assert_eq!(seg2.bytes(), 1024 * 1024);
    unsafe {
        assert_eq!(
            seg2.base().add(800).cast::<u64>().read(),
            0xfeed_faced_cafe_0001u128 as u64
        );
    }

    // No heap header was ever written into this segment, so joining it as a
    // heap must fail cleanly instead of trusting garbage.
    match Heap::attach_named(&name) {
        Err(HeapError::BadSegment) => {}
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("attached to a segment with no valid header"),
    }

    drop(seg1);
    drop(seg2);
    Segment::unlink(&name);
}
