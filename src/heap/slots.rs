//! In-flight allocation records backing the bump cursor's two-phase commit.
//!
//! While a thread has an allocation published on the cursor, its slot holds
//! the requested size and the reserved offset, which is exactly enough for
//! any other participant to finish the commit if the publisher stalls or
//! dies. Slots live in the shared header; threads check one out at admission
//! and keep it cached until they exit.

use core::sync::atomic::{AtomicU64, Ordering};

use super::bitfield::{BitFieldTrait, SlotIdxField, SlotVerField};

/// Capacity of the shared slot table. The cursor's slot marker is 7 bits
/// with 0 reserved for "none", so indexes run 0..126.
pub const SLOT_LIMIT: usize = 126;

const VER_MASK: u64 = (1 << 48) - 1;

#[repr(C)]
pub struct BumpSlot {
    /// Requested size in words; only trusted while the cursor publishes this
    /// slot.
    pub size: AtomicU64,
    /// Reserved chunk offset, written after `size` and published by the
    /// cursor CAS.
    pub offset: AtomicU64,
    /// Free-list link, index plus one, 0 terminates.
    pub next_free: AtomicU64,
}

/// Thread all slots onto the free list. Called once at segment creation.
pub fn initialize(slots: &[BumpSlot; SLOT_LIMIT], head: &AtomicU64) {
    for (i, slot) in slots.iter().enumerate() {
        let next = if i + 1 < SLOT_LIMIT { i as u64 + 2 } else { 0 };
        slot.size.store(0, Ordering::Relaxed);
        slot.offset.store(0, Ordering::Relaxed);
        slot.next_free.store(next, Ordering::Relaxed);
    }
    head.store(
        SlotIdxField::encode(1) | SlotVerField::encode(0),
        Ordering::Release,
    );
}

/// Check a slot out for a thread. Returns its index, or `None` when all
/// slots are taken.
pub fn acquire(slots: &[BumpSlot; SLOT_LIMIT], head: &AtomicU64) -> Option<u16> {
    loop {
        let cur = head.load(Ordering::Acquire);
        let idx1 = SlotIdxField::decode(cur);
        if idx1 == 0 {
            return None;
        }
        let slot = &slots[(idx1 - 1) as usize];
        let next = slot.next_free.load(Ordering::Relaxed);
        let ver = (SlotVerField::decode(cur) + 1) & VER_MASK;
        let des = SlotIdxField::encode(next) | SlotVerField::encode(ver);
        if head
            .compare_exchange(cur, des, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Some((idx1 - 1) as u16);
        }
    }
}

/// Return a slot to the shared free list (thread exit).
pub fn release(slots: &[BumpSlot; SLOT_LIMIT], head: &AtomicU64, idx: u16) {
    debug_assert!((idx as usize) < SLOT_LIMIT);
    let slot = &slots[idx as usize];
    slot.size.store(0, Ordering::Relaxed);
    slot.offset.store(0, Ordering::Relaxed);
    loop {
        let cur = head.load(Ordering::Acquire);
        slot.next_free
            .store(SlotIdxField::decode(cur), Ordering::Release);
        let ver = (SlotVerField::decode(cur) + 1) & VER_MASK;
        let des = SlotIdxField::encode(idx as u64 + 1) | SlotVerField::encode(ver);
        if head
            .compare_exchange(cur, des, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (Box<[BumpSlot; SLOT_LIMIT]>, AtomicU64) {
        let slots: Vec<BumpSlot> = (0..SLOT_LIMIT)
            .map(|_| BumpSlot {
                size: AtomicU64::new(0),
                offset: AtomicU64::new(0),
                next_free: AtomicU64::new(0),
            })
            .collect();
        let slots: Box<[BumpSlot; SLOT_LIMIT]> =
            slots.into_boxed_slice().try_into().ok().unwrap();
        let head = AtomicU64::new(0);
        initialize(&slots, &head);
        (slots, head)
    }

    #[test]
    fn acquire_all_then_exhaust() {
        let (slots, head) = fresh();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..SLOT_LIMIT {
            let idx = acquire(&slots, &head).unwrap();
            assert!(seen.insert(idx), "slot {} handed out twice", idx);
        }
        assert_eq!(acquire(&slots, &head), None);
        release(&slots, &head, 5);
        assert_eq!(acquire(&slots, &head), Some(5));
    }

    #[test]
    fn release_is_lifo() {
        let (slots, head) = fresh();
        let a = acquire(&slots, &head).unwrap();
        let b = acquire(&slots, &head).unwrap();
        release(&slots, &head, a);
        release(&slots, &head, b);
        assert_eq!(acquire(&slots, &head), Some(b));
        assert_eq!(acquire(&slots, &head), Some(a));
    }
}
