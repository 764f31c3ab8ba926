// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Hazard-pointer based safe reclamation for the lock-free map mode.
//!
//! Every thread owns a small array of hazard slots on a process-wide
//! registry. Publishing a pointer into a slot forbids its reclamation until
//! the slot is overwritten; the publisher must re-verify reachability after
//! publishing (the classic protect/validate handshake, which the map code
//! performs). Unlinked records are pushed onto a retire list and freed by
//! the next scan that finds them in no slot.

use crate::loom::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use core::ptr::{self, NonNull};

/// Hazard slots per thread.
///
/// Slot [`RECORD`] protects the record an operation is about to lock; slots
/// [`CURR`]/[`PRED`] protect the two nodes a bucket-list traversal has in
/// hand.
pub(crate) const SLOTS: usize = 3;
pub(crate) const RECORD: usize = 0;
pub(crate) const CURR: usize = 1;
pub(crate) const PRED: usize = 2;

/// Retired pointers per thread triggering a scan.
const SCAN_THRESHOLD: usize = 64;

struct HazardSlots {
    ptrs: [AtomicPtr<()>; SLOTS],
    /// Owned by a live thread. Cleared on thread exit so the slots can be
    /// adopted by a later thread; the node itself is never freed.
    active: AtomicBool,
    next: AtomicPtr<HazardSlots>,
}

struct Retired {
    ptr: *mut (),
    drop_fn: unsafe fn(*mut ()),
}

// Safety: a retired pointer is unlinked and owned solely by the domain
// until `drop_fn` consumes it.
unsafe impl Send for Retired {}

struct Domain {
    head: AtomicPtr<HazardSlots>,
    retired: spin::Mutex<Vec<Retired>>,
}

lazy_static::lazy_static! {
    static ref DOMAIN: Domain = Domain {
        head: AtomicPtr::new(ptr::null_mut()),
        retired: spin::Mutex::new(Vec::new()),
    };
}

struct ThreadSlots {
    slots: &'static HazardSlots,
}

thread_local! {
    static THREAD_SLOTS: ThreadSlots = ThreadSlots {
        slots: DOMAIN.acquire_slots(),
    };
}

/// Publishes `ptr` into the calling thread's hazard `slot`.
///
/// The caller must re-verify that `ptr` is still reachable *after* this
/// returns before dereferencing it; only then is the protection effective.
/// The slot stays published until the next `protect`/[`clear`] on it.
pub(crate) fn protect<T>(slot: usize, ptr: *mut T) {
    THREAD_SLOTS.with(|h| h.slots.ptrs[slot].store(ptr.cast::<()>(), Ordering::SeqCst));
}

pub(crate) fn clear(slot: usize) {
    THREAD_SLOTS.with(|h| h.slots.ptrs[slot].store(ptr::null_mut(), Ordering::SeqCst));
}

/// Hands an unlinked allocation to the domain for deferred freeing.
///
/// # Safety
///
/// `ptr` must be a `Box`-allocated `T` that has been unlinked from every
/// shared structure: no *new* references can be formed, and existing ones
/// are all covered by hazard slots.
pub(crate) unsafe fn retire<T>(ptr: NonNull<T>) {
    unsafe fn drop_box<T>(ptr: *mut ()) {
        // Safety: `retire` is only called with `Box`-allocated pointers, and
        // the scan only calls this once no hazard slot covers it.
        unsafe { drop(Box::from_raw(ptr.cast::<T>())) }
    }

    let mut retired = DOMAIN.retired.lock();
    retired.push(Retired {
        ptr: ptr.as_ptr().cast::<()>(),
        drop_fn: drop_box::<T>,
    });
    if retired.len() >= SCAN_THRESHOLD {
        Domain::scan(&mut retired);
    }
}

/// Frees every retired allocation not covered by a hazard slot.
pub(crate) fn flush() {
    Domain::scan(&mut DOMAIN.retired.lock());
}

// === impl Domain ===

impl Domain {
    /// Finds an inactive slot node to adopt, or grows the registry.
    fn acquire_slots(&'static self) -> &'static HazardSlots {
        let mut curs = self.head.load(Ordering::Acquire);
        while let Some(node) = NonNull::new(curs) {
            // Safety: registry nodes are never freed.
            let node = unsafe { node.as_ref() };
            if node
                .active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return node;
            }
            curs = node.next.load(Ordering::Acquire);
        }

        let node = Box::leak(Box::new(HazardSlots {
            ptrs: [const { AtomicPtr::new(ptr::null_mut()) }; SLOTS],
            active: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            node.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                node,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return node,
                Err(actual) => head = actual,
            }
        }
    }

    /// Collects the published hazard set and frees whatever is outside it.
    fn scan(retired: &mut Vec<Retired>) {
        let mut protected = Vec::new();
        let mut curs = DOMAIN.head.load(Ordering::SeqCst);
        while let Some(node) = NonNull::new(curs) {
            // Safety: registry nodes are never freed.
            let node = unsafe { node.as_ref() };
            for slot in &node.ptrs {
                let ptr = slot.load(Ordering::SeqCst);
                if !ptr.is_null() {
                    protected.push(ptr);
                }
            }
            curs = node.next.load(Ordering::Acquire);
        }

        retired.retain(|r| {
            if protected.contains(&r.ptr) {
                return true;
            }
            // Safety: the pointer is unlinked (per the `retire` contract) and
            // no hazard slot covers it, so this is the last reference.
            unsafe { (r.drop_fn)(r.ptr) };
            false
        });
    }
}

// === impl ThreadSlots ===

impl Drop for ThreadSlots {
    fn drop(&mut self) {
        for slot in &self.slots.ptrs {
            slot.store(ptr::null_mut(), Ordering::SeqCst);
        }
        self.slots.active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retire_without_hazard_frees_on_flush() {
        let boxed = Box::new(17_u64);
        let ptr = NonNull::from(Box::leak(boxed));
        // Safety: just unlinked from everything, no hazard covers it.
        unsafe { retire(ptr) };
        flush();
        // Nothing to assert directly without tracking allocations; the test
        // exists so miri/asan runs exercise the free path.
    }

    #[test]
    fn protected_pointer_survives_scan() {
        let boxed = Box::new(21_u64);
        let ptr = NonNull::from(Box::leak(boxed));

        protect(RECORD, ptr.as_ptr());
        // Safety: unlinked; our own hazard slot covers it.
        unsafe { retire(ptr) };
        flush();

        // Still alive: the hazard slot held it back.
        // Safety: protected by the hazard slot published above.
        assert_eq!(unsafe { *ptr.as_ref() }, 21);

        clear(RECORD);
        flush();
    }
}
