// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The FEB engine: the six synchronization primitives and the wake engine
//! that drains waiter queues.
//!
//! Every operation shares the same prologue: align the address, find (or
//! create) its status record with the record lock held, and then either
//! perform the word transfer and drain waiters, or link a waiter and park
//! the calling task. A record that ends up full with nobody waiting carries
//! no information and is removed again.

use crate::addr::{AlignedAddr, Word};
use crate::error::Error;
use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{Ordering, fence};
use crate::map::{LockedRecord, StripedMap};
use crate::record::Waiter;
use crate::sched::{Schedule, TaskFlags, TaskRef, TaskState};
use cordyceps::list::List;
use core::fmt;
use core::ptr;

#[cfg(feature = "count-threads")]
use crate::addr::{STRIPES, stripe_of};
#[cfg(feature = "count-threads")]
use util::CachePadded;

cfg_if::cfg_if! {
    if #[cfg(all(feature = "count-threads", feature = "mutex-increment"))] {
        type StripeCount = spin::Mutex<u64>;
    } else if #[cfg(feature = "count-threads")] {
        type StripeCount = crate::loom::sync::atomic::AtomicU64;
    }
}

/// The process-wide full/empty-bit engine.
///
/// Cheap to clone; all clones share the same striped map and scheduler. The
/// maps are torn down when the last clone goes away (or explicitly via
/// [`shutdown`]), at which point no waiter may be live anymore — that is the
/// caller's responsibility.
///
/// # Safety
///
/// The six primitives and their variants take raw pointers to the caller's
/// synchronization words. The caller must guarantee the words stay valid
/// (and are not deallocated) for the full duration of each call, including
/// the time a blocking call spends suspended and the time a helper task
/// spends executing on behalf of a non-worker caller.
///
/// [`shutdown`]: Febs::shutdown
pub struct Febs<S: Schedule> {
    pub(crate) core: Arc<Core<S>>,
}

pub(crate) struct Core<S: Schedule> {
    pub(crate) map: StripedMap,
    pub(crate) sched: S,
    #[cfg(feature = "count-threads")]
    counts: Box<[CachePadded<StripeCount>]>,
}

/// Which blocking primitive a helper task executes on behalf of a
/// non-worker caller.
#[derive(Copy, Clone, Debug)]
enum BlockerOp {
    WriteEF,
    ReadFF,
    ReadFE,
}

/// Completion latch for the out-of-scheduler-context fallback, using the
/// host OS primitives.
struct Blocker {
    done: std::sync::Mutex<Option<Result<(), Error>>>,
    cv: std::sync::Condvar,
}

/// Copies one synchronization word and publishes it with a release fence.
///
/// The copy is skipped when `dest` is null or aliases `src`, per the FEB
/// copy rules.
///
/// # Safety
///
/// Both pointers must be valid for a word-sized access (the public
/// operation contract); the caller must hold the record lock serializing
/// access to the synchronization word.
unsafe fn copy_word(dest: *mut Word, src: *const Word) {
    if dest.is_null() || ptr::eq(dest.cast_const(), src) {
        return;
    }
    // Safety: per the function contract.
    unsafe { *dest = *src };
    fence(Ordering::Release);
}

// === impl Febs ===

impl<S: Schedule> Clone for Febs<S> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<S: Schedule> fmt::Debug for Febs<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Febs").field("map", &self.core.map).finish()
    }
}

impl<S: Schedule + 'static> Febs<S> {
    /// Creates the engine: allocates the stripe array and hooks up the
    /// scheduler the blocking primitives will park through.
    pub fn new(sched: S) -> Self {
        Self {
            core: Arc::new(Core {
                map: StripedMap::new(),
                sched,
                #[cfg(feature = "count-threads")]
                counts: (0..STRIPES)
                    .map(|_| CachePadded::new(StripeCount::new(0)))
                    .collect(),
            }),
        }
    }

    /// Tears down this handle.
    ///
    /// The stripe maps (and any records still in them) are destroyed when
    /// the last handle goes away. All tasks must have drained by then: live
    /// waiters at shutdown are a caller contract violation.
    pub fn shutdown(self) {
        drop(self);
    }

    /// Whether the synchronization word at `addr` is currently full.
    ///
    /// An untracked address reads as full. Never dereferences `addr`.
    pub fn status(&self, addr: *const Word) -> bool {
        let addr = AlignedAddr::new(addr);
        self.count_stripe(addr);
        let full = match self.core.map.lookup(addr) {
            Some(rec) => rec.full,
            None => true,
        };
        tracing::trace!(addr = ?addr, full, "status");
        full
    }

    /// Marks the word at `dest` empty.
    ///
    /// Never blocks. If a writer is already parked waiting for the word to
    /// become empty, its value is transferred and the word fills again.
    ///
    /// # Safety
    ///
    /// See [`Febs`]: `dest` must be a valid synchronization word for the
    /// duration of the call.
    pub unsafe fn empty(&self, dest: *const Word) -> Result<(), Error> {
        let addr = AlignedAddr::new(dest);
        tracing::trace!(addr = ?addr, "empty");
        self.count_stripe(addr);

        let (rec, created) = self.core.map.lookup_or_insert(addr, false);
        if created {
            // was untracked (full); the fresh record marks it empty
            drop(rec);
        } else {
            self.empty_and_release(rec, addr);
        }
        Ok(())
    }

    /// Marks the word at `dest` full, waking parked readers.
    ///
    /// Never blocks. An untracked address is already full, so there is
    /// nothing to do.
    ///
    /// # Safety
    ///
    /// See [`Febs`]: `dest` must be a valid synchronization word for the
    /// duration of the call.
    pub unsafe fn fill(&self, dest: *const Word) -> Result<(), Error> {
        let addr = AlignedAddr::new(dest);
        tracing::trace!(addr = ?addr, "fill");
        self.count_stripe(addr);

        if let Some(rec) = self.core.map.lookup(addr) {
            self.fill_and_release(rec, addr);
        }
        Ok(())
    }

    /// Writes `*src` to `*dest` and marks the word full, regardless of its
    /// previous state. Never blocks.
    ///
    /// # Safety
    ///
    /// See [`Febs`]: both words must stay valid for the duration of the
    /// call.
    pub unsafe fn write_f(&self, dest: *mut Word, src: *const Word) -> Result<(), Error> {
        let addr = AlignedAddr::new(dest);
        tracing::trace!(addr = ?addr, "writeF");
        self.count_stripe(addr);

        match self.core.map.lookup(addr) {
            Some(rec) => {
                // Safety: under the record lock; pointer validity per the
                // public contract.
                unsafe { copy_word(dest, src) };
                self.fill_and_release(rec, addr);
            }
            None => {
                // untracked: already full with nobody to wake
                // Safety: pointer validity per the public contract.
                unsafe { copy_word(dest, src) };
            }
        }
        Ok(())
    }

    /// [`write_f`](Febs::write_f), taking the value directly.
    ///
    /// # Safety
    ///
    /// See [`Febs`]: `dest` must stay valid for the duration of the call.
    pub unsafe fn write_f_const(&self, dest: *mut Word, value: Word) -> Result<(), Error> {
        // Safety: forwarded contract; `value` outlives the call.
        unsafe { self.write_f(dest, &value) }
    }

    /// Writes `*src` to `*dest` once the word is empty, then marks it full.
    ///
    /// Blocks the calling task while the word is full. An untracked word is
    /// full, so the first `write_ef` to a pristine address parks until a
    /// consumer empties it.
    ///
    /// # Safety
    ///
    /// See [`Febs`]: both words must stay valid for the duration of the
    /// call, including while the caller is suspended.
    pub unsafe fn write_ef(&self, dest: *mut Word, src: *const Word) -> Result<(), Error> {
        let Some(me) = self.core.sched.current_task() else {
            return self.run_on_worker(BlockerOp::WriteEF, dest, src.cast_mut());
        };
        let addr = AlignedAddr::new(dest);
        tracing::trace!(addr = ?addr, task = %me.id(), "writeEF");
        self.count_stripe(addr);

        let (mut rec, _) = self.core.map.lookup_or_insert(addr, true);
        if rec.full {
            // full, thus we must block until a consumer empties the word
            rec.efq.push_back(Waiter::new(src.cast_mut(), me.clone()));
            self.suspend_on(rec, &me);
        } else {
            // Safety: under the record lock; pointer validity per the
            // public contract.
            unsafe { copy_word(dest, src) };
            self.fill_and_release(rec, addr);
        }
        Ok(())
    }

    /// [`write_ef`](Febs::write_ef), taking the value directly.
    ///
    /// # Safety
    ///
    /// See [`Febs`]: `dest` must stay valid for the duration of the call.
    pub unsafe fn write_ef_const(&self, dest: *mut Word, value: Word) -> Result<(), Error> {
        // Safety: forwarded contract. The parked waiter holds a pointer to
        // `value`, but the wake engine copies it out before the waiter is
        // rescheduled, so the stack slot outlives every read of it.
        unsafe { self.write_ef(dest, &value) }
    }

    /// Non-blocking [`write_ef`](Febs::write_ef): fails with
    /// [`Error::OpFail`] instead of parking, leaving queues and the flag
    /// untouched. Usable from any thread.
    ///
    /// # Safety
    ///
    /// See [`Febs`]: both words must stay valid for the duration of the
    /// call.
    pub unsafe fn write_ef_nb(&self, dest: *mut Word, src: *const Word) -> Result<(), Error> {
        let addr = AlignedAddr::new(dest);
        tracing::trace!(addr = ?addr, "writeEF_nb");
        self.count_stripe(addr);

        let Some(rec) = self.core.map.lookup(addr) else {
            // untracked means full: the blocking variant would park
            return Err(Error::OpFail);
        };
        if rec.full {
            drop(rec);
            return Err(Error::OpFail);
        }
        // Safety: under the record lock; pointer validity per the public
        // contract.
        unsafe { copy_word(dest, src) };
        self.fill_and_release(rec, addr);
        Ok(())
    }

    /// [`write_ef_nb`](Febs::write_ef_nb), taking the value directly.
    ///
    /// # Safety
    ///
    /// See [`Febs`]: `dest` must stay valid for the duration of the call.
    pub unsafe fn write_ef_const_nb(&self, dest: *mut Word, value: Word) -> Result<(), Error> {
        // Safety: forwarded contract; `value` outlives the call.
        unsafe { self.write_ef_nb(dest, &value) }
    }

    /// Copies `*src` to `*dest` once the word at `src` is full, leaving it
    /// full. Blocks the calling task while the word is empty.
    ///
    /// # Safety
    ///
    /// See [`Febs`]: both words must stay valid for the duration of the
    /// call, including while the caller is suspended.
    pub unsafe fn read_ff(&self, dest: *mut Word, src: *const Word) -> Result<(), Error> {
        let Some(me) = self.core.sched.current_task() else {
            return self.run_on_worker(BlockerOp::ReadFF, dest, src.cast_mut());
        };
        let addr = AlignedAddr::new(src);
        tracing::trace!(addr = ?addr, task = %me.id(), "readFF");
        self.count_stripe(addr);

        match self.core.map.lookup(addr) {
            None => {
                // untracked: already full
                // Safety: no record exists, so no writer is mid-transition
                // on this word; validity per the public contract.
                unsafe { copy_word(dest, src) };
            }
            Some(mut rec) if !rec.full => {
                rec.ffq.push_back(Waiter::new(dest, me.clone()));
                self.suspend_on(rec, &me);
            }
            Some(rec) => {
                // Safety: under the record lock; validity per the public
                // contract.
                unsafe { copy_word(dest, src) };
                drop(rec);
            }
        }
        Ok(())
    }

    /// Non-blocking [`read_ff`](Febs::read_ff). Usable from any thread.
    ///
    /// # Safety
    ///
    /// See [`Febs`]: both words must stay valid for the duration of the
    /// call.
    pub unsafe fn read_ff_nb(&self, dest: *mut Word, src: *const Word) -> Result<(), Error> {
        let addr = AlignedAddr::new(src);
        tracing::trace!(addr = ?addr, "readFF_nb");
        self.count_stripe(addr);

        match self.core.map.lookup(addr) {
            None => {
                // Safety: see `read_ff`.
                unsafe { copy_word(dest, src) };
                Ok(())
            }
            Some(rec) if !rec.full => {
                drop(rec);
                Err(Error::OpFail)
            }
            Some(rec) => {
                // Safety: see `read_ff`.
                unsafe { copy_word(dest, src) };
                drop(rec);
                Ok(())
            }
        }
    }

    /// Copies `*src` to `*dest` once the word at `src` is full, then marks
    /// it empty. Blocks the calling task while the word is empty.
    ///
    /// An untracked word is full: reading it consumes whatever the memory
    /// currently holds and leaves the word tracked-empty.
    ///
    /// # Safety
    ///
    /// See [`Febs`]: both words must stay valid for the duration of the
    /// call, including while the caller is suspended.
    pub unsafe fn read_fe(&self, dest: *mut Word, src: *const Word) -> Result<(), Error> {
        let Some(me) = self.core.sched.current_task() else {
            return self.run_on_worker(BlockerOp::ReadFE, dest, src.cast_mut());
        };
        let addr = AlignedAddr::new(src);
        tracing::trace!(addr = ?addr, task = %me.id(), "readFE");
        self.count_stripe(addr);

        let (mut rec, _) = self.core.map.lookup_or_insert(addr, true);
        if rec.full {
            // Safety: under the record lock; validity per the public
            // contract.
            unsafe { copy_word(dest, src) };
            self.empty_and_release(rec, addr);
        } else {
            rec.feq.push_back(Waiter::new(dest, me.clone()));
            self.suspend_on(rec, &me);
        }
        Ok(())
    }

    /// Non-blocking [`read_fe`](Febs::read_fe). Usable from any thread.
    ///
    /// # Safety
    ///
    /// See [`Febs`]: both words must stay valid for the duration of the
    /// call.
    pub unsafe fn read_fe_nb(&self, dest: *mut Word, src: *const Word) -> Result<(), Error> {
        let addr = AlignedAddr::new(src);
        tracing::trace!(addr = ?addr, "readFE_nb");
        self.count_stripe(addr);

        let (rec, _) = self.core.map.lookup_or_insert(addr, true);
        if rec.full {
            // Safety: under the record lock; validity per the public
            // contract.
            unsafe { copy_word(dest, src) };
            self.empty_and_release(rec, addr);
            Ok(())
        } else {
            drop(rec);
            Err(Error::OpFail)
        }
    }

    /// Per-stripe usage counters, indexed by stripe.
    #[cfg(feature = "count-threads")]
    pub fn stripe_counts(&self) -> Vec<u64> {
        self.core
            .counts
            .iter()
            .map(|count| {
                #[cfg(feature = "mutex-increment")]
                let used = *count.lock();
                #[cfg(not(feature = "mutex-increment"))]
                let used = count.load(Ordering::Relaxed);
                used
            })
            .collect()
    }

    #[cfg(feature = "count-threads")]
    pub(crate) fn count_stripe(&self, addr: AlignedAddr) {
        let count = &self.core.counts[stripe_of(addr)];
        #[cfg(feature = "mutex-increment")]
        {
            *count.lock() += 1;
        }
        #[cfg(not(feature = "mutex-increment"))]
        {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[cfg(not(feature = "count-threads"))]
    pub(crate) fn count_stripe(&self, _addr: AlignedAddr) {}

    /// Links are in place: transition `me` to blocked, release the record
    /// lock and park until the wake engine hands us back to the scheduler.
    fn suspend_on(&self, rec: LockedRecord<'_>, me: &TaskRef) {
        me.set_state(TaskState::Blocked);
        me.set_blocked_on(rec.as_ptr().cast_mut().cast());
        tracing::debug!(task = %me.id(), record = ?rec.as_ptr(), "suspending");
        drop(rec);
        // The waiter is linked, so a concurrent drain may already have
        // re-enqueued us; the task latch makes that wake impossible to
        // lose.
        self.core.sched.suspend_current(me);
        if me.state() != TaskState::Dead {
            me.set_state(TaskState::Running);
        }
        tracing::debug!(task = %me.id(), "resumed");
    }

    /// Hands a woken waiter back to the scheduler, honoring worker
    /// affinity.
    pub(crate) fn schedule_waiter(&self, task: TaskRef) {
        tracing::debug!(task = %task.id(), "waking waiter");
        task.set_state(TaskState::Runnable);
        task.set_blocked_on(ptr::null_mut());
        let worker = match (task.target_worker(), self.core.sched.current_worker()) {
            (Some(target), Some(current))
                if task.flags().contains(TaskFlags::UNSTEALABLE) && target != current =>
            {
                Some(target)
            }
            _ => None,
        };
        self.core.sched.enqueue_ready(worker, task);
    }

    /// Fills the slot and drains waiters entitled to run: every
    /// non-consuming reader, then at most one consuming reader (which
    /// empties the slot again and recurses).
    ///
    /// Nascent waiters (precondition waits) are deferred onto `batch`
    /// instead of being woken here: re-checking their remaining
    /// preconditions would take other record locks while this one is held.
    fn wake_fill(&self, rec: &mut LockedRecord<'_>, addr: AlignedAddr, batch: &mut List<Waiter>) {
        rec.full = true;
        while let Some(waiter) = rec.ffq.pop_front() {
            if let Some(dest) = waiter.addr {
                // Safety: under the record lock; the waiter's destination is
                // valid per the contract of the operation that parked it.
                unsafe { copy_word(dest.as_ptr(), addr.as_ptr()) };
            }
            if waiter.task.is_nascent() {
                batch.push_back(waiter);
            } else {
                let task = waiter.task.clone();
                drop(waiter);
                self.schedule_waiter(task);
            }
        }
        if let Some(waiter) = rec.feq.pop_front() {
            if let Some(dest) = waiter.addr {
                // Safety: as above.
                unsafe { copy_word(dest.as_ptr(), addr.as_ptr()) };
            }
            let task = waiter.task.clone();
            drop(waiter);
            self.schedule_waiter(task);
            // that reader consumed the value; the slot is empty again and a
            // parked writer may fire
            self.wake_empty(rec, addr, batch);
        }
    }

    /// Empties the slot and lets at most one parked writer fire (which
    /// fills the slot again and recurses).
    fn wake_empty(&self, rec: &mut LockedRecord<'_>, addr: AlignedAddr, batch: &mut List<Waiter>) {
        rec.full = false;
        if let Some(waiter) = rec.efq.pop_front() {
            if let Some(src) = waiter.addr {
                // Safety: under the record lock; the waiter's source word is
                // valid per the contract of the operation that parked it.
                unsafe { copy_word(addr.as_ptr(), src.as_ptr()) };
            }
            let task = waiter.task.clone();
            drop(waiter);
            self.schedule_waiter(task);
            self.wake_fill(rec, addr, batch);
        }
    }

    /// Top-level fill: drain, release the record lock, launch the deferred
    /// precondition batch, then reap the record if the drain left it
    /// idle-and-full.
    pub(crate) fn fill_and_release(&self, mut rec: LockedRecord<'_>, addr: AlignedAddr) {
        let mut batch = List::new();
        self.wake_fill(&mut rec, addr, &mut batch);
        debug_assert!(rec.ffq.is_empty());
        let removable = rec.removable();
        drop(rec);
        self.launch_batch(batch);
        if removable {
            self.core.map.remove_if_idle(addr);
        }
    }

    /// Top-level empty; see [`fill_and_release`](Febs::fill_and_release).
    fn empty_and_release(&self, mut rec: LockedRecord<'_>, addr: AlignedAddr) {
        let mut batch = List::new();
        self.wake_empty(&mut rec, addr, &mut batch);
        let removable = rec.removable();
        drop(rec);
        self.launch_batch(batch);
        if removable {
            self.core.map.remove_if_idle(addr);
        }
    }

    /// Executes a blocking primitive on a scheduler worker on behalf of a
    /// caller that is not one, blocking the caller on an OS latch until the
    /// helper completes.
    fn run_on_worker(&self, op: BlockerOp, dest: *mut Word, src: *mut Word) -> Result<(), Error> {
        struct SendPtr(*mut Word);
        // Safety: the pointer is only dereferenced by the helper task, and
        // the original caller (who owns the contract) blocks until the
        // helper is done with it.
        unsafe impl Send for SendPtr {}

        tracing::debug!(?op, "not on a scheduler worker, delegating");
        let blocker = Arc::new(Blocker {
            done: std::sync::Mutex::new(None),
            cv: std::sync::Condvar::new(),
        });
        let signal = Arc::clone(&blocker);
        let this = self.clone();
        let dest = SendPtr(dest);
        let src = SendPtr(src);
        self.core.sched.spawn_helper(Box::new(move || {
            let (SendPtr(dest), SendPtr(src)) = (dest, src);
            // Safety: the original caller's pointer contract extends through
            // this helper; it blocks until we signal completion below.
            let ret = unsafe {
                match op {
                    BlockerOp::WriteEF => this.write_ef(dest, src),
                    BlockerOp::ReadFF => this.read_ff(dest, src),
                    BlockerOp::ReadFE => this.read_fe(dest, src),
                }
            };
            signal.finish(ret);
        }));
        blocker.wait()
    }
}

#[cfg(feature = "count-threads")]
impl<S: Schedule> Drop for Core<S> {
    fn drop(&mut self) {
        for (stripe, count) in self.counts.iter().enumerate() {
            #[cfg(feature = "mutex-increment")]
            let used = *count.lock();
            #[cfg(not(feature = "mutex-increment"))]
            let used = count.load(Ordering::Relaxed);
            tracing::debug!(stripe, used, "stripe usage");
        }
    }
}

// === impl Blocker ===

impl Blocker {
    fn finish(&self, ret: Result<(), Error>) {
        let mut done = self.done.lock().expect("blocker latch poisoned");
        *done = Some(ret);
        self.cv.notify_one();
    }

    fn wait(&self) -> Result<(), Error> {
        let mut done = self.done.lock().expect("blocker latch poisoned");
        loop {
            match done.take() {
                Some(ret) => return ret,
                None => done = self.cv.wait(done).expect("blocker latch poisoned"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{new_engine, spawn_task, wait_until_blocked};
    use std::sync::atomic::AtomicU64;
    use tracing_subscriber::util::SubscriberInitExt;

    fn has_record<S: Schedule + 'static>(febs: &Febs<S>, word: *const Word) -> bool {
        febs.core.map.lookup(AlignedAddr::new(word)).is_some()
    }

    #[test]
    fn status_of_untracked_address_is_full() {
        let (febs, _sched) = new_engine();
        let word = Box::new(0_u64);
        assert!(febs.status(&*word));
        assert!(!has_record(&febs, &*word));
    }

    #[test]
    fn empty_is_idempotent() {
        let (febs, _sched) = new_engine();
        let word = Box::new(0_u64);

        // Safety: `word` outlives every engine call in this test.
        unsafe {
            febs.empty(&*word).unwrap();
            febs.empty(&*word).unwrap();
        }
        assert!(!febs.status(&*word));
        let rec = febs
            .core
            .map
            .lookup(AlignedAddr::new(&*word))
            .expect("emptied word must be tracked");
        assert!(!rec.full);
        assert!(rec.idle());
    }

    #[test]
    fn fill_is_idempotent_without_waiters() {
        let (febs, _sched) = new_engine();
        let word = Box::new(0_u64);

        // Untracked means full already; fill is a no-op.
        // Safety: `word` outlives every engine call in this test.
        unsafe {
            febs.fill(&*word).unwrap();
            febs.fill(&*word).unwrap();
        }
        assert!(febs.status(&*word));
        assert!(!has_record(&febs, &*word));

        // Empty then fill reaps the record again.
        // Safety: as above.
        unsafe {
            febs.empty(&*word).unwrap();
            febs.fill(&*word).unwrap();
        }
        assert!(febs.status(&*word));
        assert!(!has_record(&febs, &*word));
    }

    #[test]
    fn write_f_then_read_ff_round_trips() {
        let (febs, sched) = new_engine();
        let mut word = Box::new(0_u64);
        let word: *mut Word = &mut *word;
        let mut out = 0_u64;

        // Main thread is not a worker: readFF goes through the helper path.
        assert!(sched.current_worker().is_none());
        // Safety: `word` and `out` outlive the calls.
        unsafe {
            febs.write_f_const(word, 1234).unwrap();
            febs.read_ff(&mut out, word).unwrap();
        }
        assert_eq!(out, 1234);
        assert!(febs.status(word));
    }

    // writeF v; readFE; writeF w; readFE yields v then w
    #[test]
    fn write_f_read_fe_sequence_preserves_order() {
        let (febs, _sched) = new_engine();
        let mut word = Box::new(0_u64);
        let word: *mut Word = &mut *word;
        let (mut first, mut second) = (0_u64, 0_u64);

        // Safety: all words outlive the calls.
        unsafe {
            febs.write_f_const(word, 5).unwrap();
            febs.read_fe(&mut first, word).unwrap();
            febs.write_f_const(word, 6).unwrap();
            febs.read_fe(&mut second, word).unwrap();
        }
        assert_eq!((first, second), (5, 6));
        assert!(!febs.status(word), "readFE leaves the word empty");
    }

    // writeEF on an emptied word fills it and reaps the record
    #[test]
    fn write_ef_on_empty_word_fills_and_reaps() {
        let (febs, _sched) = new_engine();
        let mut word = Box::new(0_u64);
        let word: *mut Word = &mut *word;

        // Safety: `word` outlives the calls.
        unsafe {
            febs.empty(word).unwrap();
            febs.write_ef_const(word, 7).unwrap();
            assert_eq!(*word, 7);
        }
        assert!(febs.status(word));
        assert!(!has_record(&febs, word));
    }

    // readFE on an untracked word consumes its current value
    #[test]
    fn read_fe_on_untracked_word_consumes_current_value() {
        let (febs, _sched) = new_engine();
        let mut word = Box::new(0_u64);
        let word: *mut Word = &mut *word;
        let mut out = 99_u64;

        // Safety: `word` and `out` outlive the calls.
        unsafe { febs.read_fe(&mut out, word).unwrap() };
        assert_eq!(out, 0);
        assert!(!febs.status(word), "readFE leaves the word empty");
        {
            let rec = febs
                .core
                .map
                .lookup(AlignedAddr::new(word))
                .expect("consumed word must be tracked");
            assert!(!rec.full);
        }

        // A writer now proceeds immediately and the record is reaped.
        // Safety: as above.
        unsafe {
            febs.write_ef_const(word, 99).unwrap();
            assert_eq!(*word, 99);
        }
        assert!(febs.status(word));
        assert!(!has_record(&febs, word));
    }

    // queued writers hand their values to consumers in order
    #[test]
    fn writer_handoff_reaches_consumers_in_order() {
        let (febs, sched) = new_engine();
        let mut word = Box::new(0_u64);
        let word: *mut Word = &mut *word;
        let addr = word as usize;

        // Safety: `word` outlives every call; the writer task is joined
        // before the word is dropped.
        unsafe {
            febs.empty(word).unwrap();
            febs.write_ef_const(word, 5).unwrap();
        }
        // The slot is full and idle, so the record is gone; the next writer
        // tracks it anew and parks.
        assert!(!has_record(&febs, word));

        let writer_febs = febs.clone();
        let (writer, writer_handle) = spawn_task(&sched, move || {
            // Safety: see above.
            unsafe { writer_febs.write_ef_const(addr as *mut Word, 6).unwrap() };
        });
        wait_until_blocked(&writer);

        let (mut first, mut second) = (0_u64, 0_u64);
        // Safety: as above.
        unsafe {
            febs.read_fe(&mut first, word).unwrap();
            writer_handle.join().unwrap();
            febs.read_fe(&mut second, word).unwrap();
        }
        assert_eq!((first, second), (5, 6));
    }

    // a fill releases every parked non-consuming reader
    #[test]
    fn fill_wakes_all_blocked_readers_in_fifo_order() {
        let (febs, sched) = new_engine();
        let mut word = Box::new(0_u64);
        let word: *mut Word = &mut *word;
        let addr = word as usize;

        // Safety: `word` outlives every call; readers are joined below.
        unsafe { febs.empty(word).unwrap() };

        let mut readers = Vec::new();
        let outs: Vec<_> = (0..2).map(|_| std::sync::Arc::new(AtomicU64::new(0))).collect();
        for out in &outs {
            let febs = febs.clone();
            let out = out.clone();
            let (task, handle) = spawn_task(&sched, move || {
                let mut value = 0;
                // Safety: see above.
                unsafe { febs.read_ff(&mut value, addr as *const Word).unwrap() };
                out.store(value, Ordering::Release);
            });
            wait_until_blocked(&task);
            readers.push((task, handle));
        }

        // Safety: no reader dereferences the word while parked.
        unsafe {
            *word = 42;
            febs.fill(word).unwrap();
        }
        let ids: Vec<_> = readers.iter().map(|(task, _)| task.id()).collect();
        for (_, handle) in readers.drain(..) {
            handle.join().unwrap();
        }
        assert_eq!(outs[0].load(Ordering::Acquire), 42);
        assert_eq!(outs[1].load(Ordering::Acquire), 42);
        assert!(febs.status(word), "word stays full");
        assert!(!has_record(&febs, word), "record reaped after the drain");

        let log = sched.enqueue_log();
        let first = log.iter().position(|id| *id == ids[0]);
        let second = log.iter().position(|id| *id == ids[1]);
        assert!(first.expect("first reader woken") < second.expect("second reader woken"));
    }

    // boundary: readFE parks on an empty word until a writer arrives
    #[test]
    fn read_fe_blocks_until_write_ef() {
        let (febs, sched) = new_engine();
        let mut word = Box::new(0_u64);
        let word: *mut Word = &mut *word;
        let addr = word as usize;

        // Safety: `word` outlives every call; the reader is joined below.
        unsafe { febs.empty(word).unwrap() };

        let out = std::sync::Arc::new(AtomicU64::new(0));
        let reader_out = out.clone();
        let reader_febs = febs.clone();
        let (reader, handle) = spawn_task(&sched, move || {
            let mut value = 0;
            // Safety: see above.
            unsafe { reader_febs.read_fe(&mut value, addr as *const Word).unwrap() };
            reader_out.store(value, Ordering::Release);
        });
        wait_until_blocked(&reader);

        // Safety: as above.
        unsafe { febs.write_ef_const(word, 7).unwrap() };
        handle.join().unwrap();
        assert_eq!(out.load(Ordering::Acquire), 7);
        assert!(!febs.status(word), "the consuming reader leaves it empty");
    }

    // boundary: empty() hands the slot to a parked writer
    #[test]
    fn empty_releases_a_parked_writer() {
        let (febs, sched) = new_engine();
        let mut word = Box::new(0_u64);
        let word: *mut Word = &mut *word;
        let addr = word as usize;

        // writeEF on an untracked (full) word parks.
        let writer_febs = febs.clone();
        let (writer, handle) = spawn_task(&sched, move || {
            // Safety: `word` outlives the writer; joined below.
            unsafe { writer_febs.write_ef_const(addr as *mut Word, 7).unwrap() };
        });
        wait_until_blocked(&writer);

        // Safety: as above.
        unsafe { febs.empty(word).unwrap() };
        handle.join().unwrap();
        // Safety: as above.
        unsafe { assert_eq!(*word, 7) };
        assert!(febs.status(word));
        assert!(!has_record(&febs, word), "full and idle after the handoff");
    }

    #[test]
    fn parked_writers_drain_in_fifo_order() {
        let (febs, sched) = new_engine();
        let mut word = Box::new(0_u64);
        let word: *mut Word = &mut *word;
        let addr = word as usize;

        let mut writers = Vec::new();
        for value in [10_u64, 11] {
            let febs = febs.clone();
            let (task, handle) = spawn_task(&sched, move || {
                // Safety: `word` outlives the writers; joined below.
                unsafe { febs.write_ef_const(addr as *mut Word, value).unwrap() };
            });
            wait_until_blocked(&task);
            writers.push((task, handle));
        }

        // The word was untracked, so it still holds its initial value; each
        // consume then surfaces one queued writer in FIFO order.
        let mut seen = Vec::new();
        for _ in 0..3 {
            let mut value = 0;
            // Safety: as above.
            unsafe { febs.read_fe(&mut value, word).unwrap() };
            seen.push(value);
        }
        assert_eq!(seen, vec![0, 10, 11]);

        let log = sched.enqueue_log();
        let first = log.iter().position(|id| *id == writers[0].0.id());
        let second = log.iter().position(|id| *id == writers[1].0.id());
        assert!(first.expect("first writer woken") < second.expect("second writer woken"));

        for (_, handle) in writers {
            handle.join().unwrap();
        }
    }

    // each fill surfaces exactly one consuming reader
    #[test]
    fn consuming_readers_wake_one_at_a_time() {
        let (febs, sched) = new_engine();
        let mut word = Box::new(0_u64);
        let word: *mut Word = &mut *word;
        let addr = word as usize;

        // Safety: `word` outlives every call; readers are joined below.
        unsafe { febs.empty(word).unwrap() };

        let mut readers = Vec::new();
        let outs: Vec<_> = (0..2).map(|_| std::sync::Arc::new(AtomicU64::new(0))).collect();
        for out in &outs {
            let febs = febs.clone();
            let out = out.clone();
            let (task, handle) = spawn_task(&sched, move || {
                let mut value = 0;
                // Safety: see above.
                unsafe { febs.read_fe(&mut value, addr as *const Word).unwrap() };
                out.store(value, Ordering::Release);
            });
            wait_until_blocked(&task);
            readers.push((task, handle));
        }

        // The first write releases only the first consumer and leaves the
        // word empty again.
        // Safety: as above.
        unsafe { febs.write_f_const(word, 5).unwrap() };
        let (first_task, first_handle) = readers.remove(0);
        first_handle.join().unwrap();
        assert_eq!(outs[0].load(Ordering::Acquire), 5);
        assert_eq!(readers[0].0.state(), TaskState::Blocked);
        assert!(!febs.status(word));

        // Safety: as above.
        unsafe { febs.write_f_const(word, 6).unwrap() };
        let (second_task, second_handle) = readers.remove(0);
        second_handle.join().unwrap();
        assert_eq!(outs[1].load(Ordering::Acquire), 6);

        let log = sched.enqueue_log();
        let first = log.iter().position(|id| *id == first_task.id());
        let second = log.iter().position(|id| *id == second_task.id());
        assert!(first.expect("first consumer woken") < second.expect("second consumer woken"));
    }

    #[test]
    fn nonblocking_variants_fail_without_perturbing_state() {
        let (febs, _sched) = new_engine();
        let mut word = Box::new(0_u64);
        let word: *mut Word = &mut *word;
        let mut out = 0_u64;

        // Untracked (full): writers would park, readers would not.
        // Safety: all words outlive the calls.
        unsafe {
            assert_eq!(febs.write_ef_nb(word, &9), Err(Error::OpFail));
            assert!(!has_record(&febs, word), "failed nb op must not create records");

            febs.empty(word).unwrap();
            assert_eq!(febs.read_fe_nb(&mut out, word), Err(Error::OpFail));
            assert_eq!(febs.read_ff_nb(&mut out, word), Err(Error::OpFail));
        }
        {
            let rec = febs
                .core
                .map
                .lookup(AlignedAddr::new(word))
                .expect("emptied word must be tracked");
            assert!(!rec.full, "failed nb ops must not flip the flag");
            assert!(rec.idle(), "failed nb ops must not enqueue waiters");
        }

        // And the success paths work from a non-worker thread.
        // Safety: as above.
        unsafe {
            febs.write_ef_nb(word, &9).unwrap();
            assert_eq!(febs.read_ff_nb(&mut out, word), Ok(()));
            assert_eq!(out, 9);
            febs.read_fe_nb(&mut out, word).unwrap();
        }
        assert_eq!(out, 9);
        assert!(!febs.status(word));
    }

    #[test]
    fn ping_pong_alternates_producer_and_consumer() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default();

        let (febs, sched) = new_engine();
        let mut word = Box::new(0_u64);
        let word: *mut Word = &mut *word;
        let addr = word as usize;
        const ROUNDS: u64 = 16;

        // Safety: `word` outlives both tasks; they are joined below.
        unsafe { febs.empty(word).unwrap() };

        let producer_febs = febs.clone();
        let (_, producer) = spawn_task(&sched, move || {
            for i in 0..ROUNDS {
                // Safety: see above.
                unsafe { producer_febs.write_ef_const(addr as *mut Word, i).unwrap() };
            }
        });
        let consumer_febs = febs.clone();
        let (_, consumer) = spawn_task(&sched, move || {
            for i in 0..ROUNDS {
                let mut value = 0;
                // Safety: see above.
                unsafe {
                    consumer_febs
                        .read_fe(&mut value, addr as *const Word)
                        .unwrap();
                }
                assert_eq!(value, i, "values must alternate in write order");
            }
        });

        producer.join().unwrap();
        consumer.join().unwrap();
        assert!(!febs.status(word));
    }
}
