//! Pointers jointly contingent on a controller object.
//!
//! The target is only meaningful while the controller is alive; locking
//! checks the controller first and wipes the target once it is gone. The
//! atomicity of *reassigning* one of these under concurrency is an open
//! protocol question, so the type is deliberately `!Sync`: sharing one
//! across threads for mutation requires caller-supplied synchronization,
//! enforced at compile time.

use std::cell::Cell;

use crate::ptr::external::ExternalPtr;
use crate::ptr::weak::ExternalWeakPtr;
use crate::ptr::GcPtr;

pub struct ContingentPtr<T, C> {
    control: ExternalWeakPtr<C>,
    target: Cell<Option<GcPtr<T>>>,
}

impl<T, C> ContingentPtr<T, C> {
    pub fn null() -> ContingentPtr<T, C> {
        ContingentPtr {
            control: ExternalWeakPtr::null(),
            target: Cell::new(None),
        }
    }

    pub fn new(target: GcPtr<T>, control: GcPtr<C>) -> ContingentPtr<T, C> {
        ContingentPtr {
            control: ExternalWeakPtr::new(control),
            target: Cell::new(Some(target)),
        }
    }

    /// Resolve both halves. A dead controller clears the target for good.
    pub fn lock_pair(&self) -> (Option<GcPtr<C>>, Option<GcPtr<T>>) {
        let control = self.control.lock();
        if control.is_none() && self.target.get().is_some() {
            self.target.set(None);
        }
        (control, self.target.get())
    }

    pub fn lock(&self) -> Option<GcPtr<T>> {
        self.target.get()?;
        let (control, target) = self.lock_pair();
        control.and(target)
    }

    pub fn control(&self) -> &ExternalWeakPtr<C> {
        &self.control
    }

    pub fn lock_control(&self) -> Option<GcPtr<C>> {
        self.control.lock()
    }

    pub fn control_expired(&self) -> bool {
        self.control.expired()
    }

    /// Replace the target, leaving the controller alone.
    pub fn set_target(&self, target: GcPtr<T>) {
        self.target.set(Some(target));
    }

    /// Replace the controller; the target stays and is re-judged at the next
    /// lock.
    pub fn reset_control(&mut self, control: GcPtr<C>) {
        self.control = ExternalWeakPtr::new(control);
    }

    pub fn reset(&mut self) {
        self.control.reset();
        self.target.set(None);
    }
}

impl<T, C> Clone for ContingentPtr<T, C> {
    fn clone(&self) -> Self {
        ContingentPtr {
            control: self.control.clone(),
            target: Cell::new(self.target.get()),
        }
    }
}

impl<T, C> Default for ContingentPtr<T, C> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T, C> From<(GcPtr<T>, GcPtr<C>)> for ContingentPtr<T, C> {
    fn from((target, control): (GcPtr<T>, GcPtr<C>)) -> Self {
        Self::new(target, control)
    }
}

impl<T, C> From<(ExternalPtr<T>, GcPtr<C>)> for ContingentPtr<T, C> {
    fn from((target, control): (ExternalPtr<T>, GcPtr<C>)) -> Self {
        Self::new(target.value(), control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptr::weak::for_each_weak_slot;
    use std::sync::atomic::Ordering;

    fn gc<T>(off: u64) -> GcPtr<T> {
        unsafe { GcPtr::from_offset_unchecked(off) }
    }

    #[test]
    fn live_controller_resolves() {
        let p: ContingentPtr<u64, u64> = ContingentPtr::new(gc(0x100), gc(0x108));
        assert_eq!(p.lock().map(|t| t.offset()), Some(0x100));
        let (c, t) = p.lock_pair();
        assert_eq!(c.map(|c| c.offset()), Some(0x108));
        assert_eq!(t.map(|t| t.offset()), Some(0x100));
    }

    #[test]
    fn dead_controller_clears_target() {
        let p: ContingentPtr<u64, u64> = ContingentPtr::new(gc(0x110), gc(0x118));
        for_each_weak_slot(|cell| {
            if cell.load(Ordering::Relaxed) == 0x118 {
                cell.store(0, Ordering::Release);
            }
        });
        assert_eq!(p.lock(), None);
        // Wiped for good, not just masked.
        assert_eq!(p.lock_pair().1, None);
        assert!(p.control_expired());
    }

    #[test]
    fn target_reassignment_keeps_controller() {
        let p: ContingentPtr<u64, u64> = ContingentPtr::new(gc(0x120), gc(0x128));
        p.set_target(gc(0x130));
        assert_eq!(p.lock().map(|t| t.offset()), Some(0x130));
    }
}
