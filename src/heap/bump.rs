//! Bump allocation over the shared cursor.
//!
//! The cursor is a single atomic word holding the region's `begin` and `end`
//! word offsets, each half with room for an in-flight slot marker. Claiming
//! memory is a two-phase commit made of two single-word CAS steps:
//!
//! 1. *Publish*: record size and reserved offset in the caller's slot, then
//!    CAS the cursor so `begin` advances past the claim while both halves
//!    carry the slot marker.
//! 2. *Finalize*: write the chunk's size word at the reserved offset, then
//!    CAS the slot markers away.
//!
//! Any thread that observes a published-but-unfinalized cursor can complete
//! the commit itself from the shared cursor and slot contents alone, so a
//! publisher that is preempted indefinitely or dies mid-allocation never
//! wedges the region and never loses or doubles the reservation. A helper
//! trusts a slot only after re-reading the cursor and seeing the identical
//! publish; because regions are carved monotonically out of the arena and
//! `begin` never moves backwards, an identical cursor word can never mean a
//! different allocation.
//!
//! `end == 0` with `begin != 0` is the region's terminal state: exhausted,
//! waiting for a replacement supplied from outside.

use core::sync::atomic::Ordering;

use static_assertions::const_assert;

use super::bitfield::{
    BeginOffField, BeginSlotField, BitFieldTrait, EndOffField, EndSlotField,
};
use super::free_list;
use super::segment::{self, HeapHeader};
use super::size_class::MIN_CHUNK_WORDS;
use super::slots::SLOT_LIMIT;

/// Largest offset a cursor half can carry.
pub const MAX_BUMP_WORDS: u64 = (1 << 25) - 1;

// Slot markers store index + 1 in 7 bits.
const_assert!(SLOT_LIMIT < 127);

/// The current region cannot satisfy the request; a replacement region must
/// be installed before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// No region has ever been installed.
    Uninitialized,
    Idle {
        begin: u64,
        end: u64,
    },
    /// An allocation is published but not finalized.
    Publishing {
        slot: u16,
        begin: u64,
        end: u64,
    },
    /// Terminal for this region; `install_region` leaves it.
    Exhausted {
        begin: u64,
    },
}

pub fn cursor_state(h: &HeapHeader) -> CursorState {
    decode_state(h.cursor.load(Ordering::SeqCst))
}

pub fn decode_state(cur: u64) -> CursorState {
    let begin = BeginOffField::decode(cur);
    let end = EndOffField::decode(cur);
    let slot = BeginSlotField::decode(cur);
    if slot != 0 {
        CursorState::Publishing {
            slot: (slot - 1) as u16,
            begin,
            end,
        }
    } else if end != 0 {
        CursorState::Idle { begin, end }
    } else if begin != 0 {
        CursorState::Exhausted { begin }
    } else {
        CursorState::Uninitialized
    }
}

/// Claim `words` from the current region. `my_slot` is the calling thread's
/// slot in the shared table. On success the chunk's size word is in place
/// and the returned offset is exclusively owned by the caller.
pub fn allocate(h: &HeapHeader, my_slot: u16, words: u64) -> Result<u64, Exhausted> {
    debug_assert!(words > 0 && words <= MAX_BUMP_WORDS);
    debug_assert!((my_slot as usize) < SLOT_LIMIT);
    loop {
        let cur = h.cursor.load(Ordering::SeqCst);
        if BeginSlotField::decode(cur) != 0 || EndSlotField::decode(cur) != 0 {
            help_publish(h, cur);
            continue;
        }
        let b_off = BeginOffField::decode(cur);
        let e_off = EndOffField::decode(cur);
        if e_off == 0 {
            return Err(Exhausted);
        }
        if e_off - b_off >= words {
            let slot = &h.slots[my_slot as usize];
            slot.size.store(words, Ordering::Relaxed);
            slot.offset.store(b_off, Ordering::Release);
            let mark = my_slot as u64 + 1;
            let des = EndSlotField::update(
                BeginSlotField::update(BeginOffField::update(cur, b_off + words), mark),
                mark,
            );
            if h
                .cursor
                .compare_exchange(cur, des, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            // Intent is published. Construct the chunk header, then clear
            // the markers.
            unsafe {
                segment::word(b_off).store(words, Ordering::SeqCst);
            }
            let fin = EndSlotField::update(BeginSlotField::update(des, 0), 0);
            // A helper may already have finalized on our behalf; the
            // published word has exactly one successor either way.
            let _ = h
                .cursor
                .compare_exchange(des, fin, Ordering::SeqCst, Ordering::SeqCst);
            return Ok(b_off);
        }
        // Not enough room. Retire the region and donate the tail.
        let des = EndOffField::update(BeginOffField::update(0, b_off), 0);
        if h
            .cursor
            .compare_exchange(cur, des, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let tail = e_off - b_off;
            if tail >= MIN_CHUNK_WORDS {
                free_list::push(h, tail, b_off);
            } else if tail > 0 {
                // Too small for a free chunk; size-tag it so a sweep sees
                // dead space rather than a broken object.
                unsafe {
                    segment::word(b_off).store(tail, Ordering::SeqCst);
                }
            }
            log::debug!("bump region retired at {}, tail {} words", b_off, tail);
            return Err(Exhausted);
        }
    }
}

/// Finish another thread's published allocation, if `cur` still describes
/// it. Deterministic: every participant that gets this far writes the same
/// header word and the same finalized cursor.
fn help_publish(h: &HeapHeader, cur: u64) {
    let b_slot = BeginSlotField::decode(cur);
    let e_slot = EndSlotField::decode(cur);
    if b_slot == 0 || b_slot != e_slot {
        return;
    }
    let slot = &h.slots[(b_slot - 1) as usize];
    let off = slot.offset.load(Ordering::Acquire);
    let words = slot.size.load(Ordering::Acquire);
    let b_off = BeginOffField::decode(cur);
    if words == 0 || off + words != b_off {
        // Slot no longer matches the publish we saw; the cursor has moved on.
        return;
    }
    let hdr = unsafe { segment::word(off) };
    let seen = hdr.load(Ordering::SeqCst);
    // Trust the slot only while the cursor still shows this exact publish.
    if h.cursor.load(Ordering::SeqCst) != cur {
        return;
    }
    let _ = hdr.compare_exchange(seen, words, Ordering::SeqCst, Ordering::SeqCst);
    let fin = EndSlotField::update(BeginSlotField::update(cur, 0), 0);
    let _ = h
        .cursor
        .compare_exchange(cur, fin, Ordering::SeqCst, Ordering::SeqCst);
}

/// Complete any in-flight publish currently visible on the cursor.
pub fn help(h: &HeapHeader) {
    let cur = h.cursor.load(Ordering::SeqCst);
    if BeginSlotField::decode(cur) != 0 {
        help_publish(h, cur);
    }
}

/// Move the cursor from Exhausted (or its initial state) to a fresh region.
/// Returns false if a live region is already present; the caller then owns
/// the unused region and should donate it to the free lists.
pub fn install_region(h: &HeapHeader, begin: u64, end: u64) -> bool {
    debug_assert!(begin != 0 && begin < end && end <= MAX_BUMP_WORDS);
    loop {
        let cur = h.cursor.load(Ordering::SeqCst);
        if BeginSlotField::decode(cur) != 0 || EndSlotField::decode(cur) != 0 {
            help_publish(h, cur);
            continue;
        }
        if EndOffField::decode(cur) != 0 {
            return false;
        }
        let des = EndOffField::update(BeginOffField::update(0, begin), end);
        if h
            .cursor
            .compare_exchange(cur, des, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            log::debug!("bump region installed: [{}, {})", begin, end);
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_decoding() {
        assert_eq!(decode_state(0), CursorState::Uninitialized);
        let idle = EndOffField::update(BeginOffField::update(0, 100), 400);
        assert_eq!(
            decode_state(idle),
            CursorState::Idle {
                begin: 100,
                end: 400
            }
        );
        let pubd = EndSlotField::update(BeginSlotField::update(idle, 7), 7);
        assert_eq!(
            decode_state(pubd),
            CursorState::Publishing {
                slot: 6,
                begin: 100,
                end: 400
            }
        );
        let dead = BeginOffField::update(0, 100);
        assert_eq!(decode_state(dead), CursorState::Exhausted { begin: 100 });
    }
}
