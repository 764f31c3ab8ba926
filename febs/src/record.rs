// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::addr::{AlignedAddr, Word};
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::sched::TaskRef;
use core::fmt;
use core::pin::Pin;
use core::ptr::NonNull;
use cordyceps::list::{self, List};
use cordyceps::Linked;

/// Per-address synchronization state: the full/empty flag and the three
/// waiter queues, all behind the record's own fast lock.
///
/// A record is present in the striped map exactly while the address is empty
/// or has waiters; an absent address models "full, nobody waiting". Records
/// are owned by the map and freed by whichever operation first observes the
/// idle-and-full state at top level.
pub(crate) struct StatusRecord {
    /// The aligned address this record tracks.
    key: AlignedAddr,
    /// Everything mutable lives under this lock.
    pub(crate) lock: spin::Mutex<Slot>,
    /// Cleared (under `lock`) immediately before the record is unlinked from
    /// the map. Lookups in the lock-free map mode must re-check this after
    /// publishing a hazard pointer; the coarse mode never clears it early
    /// enough to be observable.
    valid: AtomicBool,
    /// Intrusive successor pointer of the per-bucket list in the lock-free
    /// map mode. The low bit marks the record as logically deleted.
    #[cfg(feature = "lock-free-febs")]
    pub(crate) next: crate::loom::sync::atomic::AtomicPtr<StatusRecord>,
}

/// The lock-protected interior of a [`StatusRecord`].
pub(crate) struct Slot {
    /// Whether the synchronization word currently holds a readable value.
    pub(crate) full: bool,
    /// Writers blocked until the word is empty (`writeEF`).
    pub(crate) efq: List<Waiter>,
    /// Consuming readers blocked until the word is full (`readFE`).
    pub(crate) feq: List<Waiter>,
    /// Non-consuming readers blocked until the word is full (`readFF`).
    pub(crate) ffq: List<Waiter>,
}

/// A parked waiter: one node in one of the three queues (or in a wake
/// batch), carrying the task to resume and the word to transfer through.
pub(crate) struct Waiter {
    /// Intrusive list pointers.
    ///
    /// This must be the first field in the struct in order for the `Linked`
    /// implementation to be sound.
    links: list::Links<Waiter>,
    /// Where to copy the value to (readers) or from (writers). `None` for
    /// precondition waits, which transfer nothing.
    pub(crate) addr: Option<NonNull<Word>>,
    /// The suspended (or nascent) task.
    pub(crate) task: TaskRef,
}

// === impl StatusRecord ===

// Safety: the queues and the flag are only touched under `lock`; the raw
// word addresses inside waiters belong to the callers, which promised (via
// the unsafe operation contract) that they outlive the wait.
unsafe impl Send for StatusRecord {}
// Safety: see above.
unsafe impl Sync for StatusRecord {}

impl StatusRecord {
    pub(crate) fn new(key: AlignedAddr, full: bool) -> Box<Self> {
        Box::new(Self {
            key,
            lock: spin::Mutex::new(Slot {
                full,
                efq: List::new(),
                feq: List::new(),
                ffq: List::new(),
            }),
            valid: AtomicBool::new(true),
            #[cfg(feature = "lock-free-febs")]
            next: crate::loom::sync::atomic::AtomicPtr::new(core::ptr::null_mut()),
        })
    }

    pub(crate) fn key(&self) -> AlignedAddr {
        self.key
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Marks the record logically removed. Must be called while holding
    /// `lock`, exactly once, immediately before unlinking it from the map.
    pub(crate) fn invalidate(&self) {
        debug_assert!(self.is_valid());
        self.valid.store(false, Ordering::Release);
    }
}

impl fmt::Debug for StatusRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusRecord")
            .field("key", &self.key)
            .field("valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}

// === impl Slot ===

impl Slot {
    /// No waiter is parked on any queue.
    pub(crate) fn idle(&self) -> bool {
        self.efq.is_empty() && self.feq.is_empty() && self.ffq.is_empty()
    }

    /// The record carries no information: full with nobody waiting. The
    /// operation that first observes this at top level must remove it.
    pub(crate) fn removable(&self) -> bool {
        self.full && self.idle()
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("full", &self.full)
            .field("efq", &self.efq.len())
            .field("feq", &self.feq.len())
            .field("ffq", &self.ffq.len())
            .finish()
    }
}

// === impl Waiter ===

// Safety: `task` is `Send`; `addr` is a caller-owned word that is only
// dereferenced by the wake engine under the owning record's lock.
unsafe impl Send for Waiter {}

impl Waiter {
    /// Allocates a waiter for `task`, transferring through `addr` (which may
    /// be null for precondition waits).
    pub(crate) fn new(addr: *mut Word, task: TaskRef) -> Pin<Box<Self>> {
        Box::pin(Self {
            links: list::Links::new(),
            addr: NonNull::new(addr),
            task,
        })
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("addr", &self.addr)
            .field("task", &self.task.id())
            .finish_non_exhaustive()
    }
}

// Safety: `Waiter` is only ever owned through `Pin<Box<Self>>`, so the
// pointer handed to the list is valid until the node is popped again, and
// `links` is never repurposed while linked.
unsafe impl Linked<list::Links<Waiter>> for Waiter {
    type Handle = Pin<Box<Waiter>>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        // Safety: the node is never moved out of the box while linked; we
        // only unpin it to leak the allocation.
        unsafe { NonNull::from(Box::leak(Pin::into_inner_unchecked(handle))) }
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: `ptr` came out of `into_ptr`, so it is a leaked boxed
        // waiter; re-pinning restores the original handle.
        unsafe { Pin::new_unchecked(Box::from_raw(ptr.as_ptr())) }
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<list::Links<Waiter>> {
        // Safety: using `addr_of_mut!` avoids creating a temporary
        // reference, which stacked borrows dislikes; `links` is a field of a
        // live allocation, so the pointer is non-null.
        unsafe {
            let links = core::ptr::addr_of_mut!((*ptr.as_ptr()).links);
            NonNull::new_unchecked(links)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{Task, TaskFlags};

    fn waiter(task: &TaskRef) -> Pin<Box<Waiter>> {
        Waiter::new(core::ptr::null_mut(), task.clone())
    }

    #[test]
    fn queues_are_fifo() {
        let mut q: List<Waiter> = List::new();
        let tasks: Vec<TaskRef> = (0..3).map(|_| Task::new(TaskFlags::empty(), None)).collect();
        for t in &tasks {
            q.push_back(waiter(t));
        }

        for t in &tasks {
            let popped = q.pop_front().expect("queue should not be empty yet");
            assert_eq!(popped.task.id(), t.id());
        }
        assert!(q.is_empty());
    }

    #[test]
    fn removable_needs_full_and_idle() {
        let word = Box::new(0_u64);
        let rec = StatusRecord::new(AlignedAddr::new(&*word), false);

        {
            let slot = rec.lock.lock();
            assert!(slot.idle());
            assert!(!slot.removable());
        }

        {
            let mut slot = rec.lock.lock();
            slot.full = true;
            assert!(slot.removable());

            let task = Task::new(TaskFlags::empty(), None);
            slot.ffq.push_back(waiter(&task));
            assert!(!slot.removable());
            drop(slot.ffq.pop_front());
        }
    }

    #[test]
    fn precond_waiters_carry_no_address() {
        let task = Task::new(TaskFlags::empty(), None);
        let w = Waiter::new(core::ptr::null_mut(), task);
        assert!(w.addr.is_none());
    }
}
