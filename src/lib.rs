//! # shmheap
//!
//! Core of a garbage-collected heap shared across OS processes through a
//! common memory mapping. Two subsystems live here:
//!
//! - the concurrent, crash-tolerant allocator ([`heap`]): thread-local chunk
//!   pools over lock-free shared free lists over a bump region whose
//!   two-phase commit any thread can finish on a stalled publisher's behalf;
//! - the inbound-pointer bridge ([`ptr`]): reference-counted handles and
//!   weak slots that let code outside the collected graph refer safely into
//!   it.
//!
//! Objects are addressed by arena-relative offsets, so the heap stays valid
//! no matter where each process maps it. The tracing collector, safepoint
//! protocol, and object metadata system are external collaborators; the
//! seams they use are [`Heap::alloc`], [`Heap::release_to_global`],
//! [`ptr::external::for_each_root`], and [`ptr::weak::for_each_weak_slot`].

pub mod heap;
pub mod ptr;

pub use heap::{formatted_size, Heap, HeapError, HeapOptions, ThreadState};
pub use ptr::contingent::ContingentPtr;
pub use ptr::external::{externalize, ExternalPtr};
pub use ptr::weak::ExternalWeakPtr;
pub use ptr::GcPtr;
