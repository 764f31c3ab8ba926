// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Maintenance sweeps over every parked waiter in the map.

use crate::addr::AlignedAddr;
use crate::record::Waiter;
use crate::sched::{Schedule, TaskRef};
use cordyceps::list::List;
use core::ptr;

/// What the [`taskfilter`](crate::Febs::taskfilter) callback decides about a
/// waiter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FilterVerdict {
    /// Leave the waiter where it is.
    Keep,
    /// Unlink the waiter and assassinate its task. The slot's full/empty
    /// state is left untouched.
    Kill,
}

impl<S: Schedule + 'static> crate::Febs<S> {
    /// Visits every parked waiter, one record at a time under that record's
    /// lock, walking `EFQ`, `FEQ`, `FFQ` in that order.
    ///
    /// Waiters judged [`FilterVerdict::Kill`] are unlinked, their tasks
    /// handed to [`Schedule::assassinate`], and their nodes freed. This is
    /// the only supported cancellation path.
    ///
    /// The callback must not invoke FEB operations; it runs under a record
    /// lock.
    pub fn taskfilter(&self, mut f: impl FnMut(AlignedAddr, &TaskRef) -> FilterVerdict) {
        self.core.map.for_each(|addr, rec| {
            let slot = &mut **rec;
            for queue in [&mut slot.efq, &mut slot.feq, &mut slot.ffq] {
                filter_queue(&self.core.sched, addr, queue, &mut f);
            }
        });
    }

    /// Calls `f` on every parked waiter without perturbing anything; a
    /// convenience sweep atop [`taskfilter`](crate::Febs::taskfilter).
    pub fn for_each_waiter(&self, mut f: impl FnMut(AlignedAddr, &TaskRef)) {
        self.taskfilter(|addr, task| {
            f(addr, task);
            FilterVerdict::Keep
        });
    }
}

fn filter_queue<S: Schedule>(
    sched: &S,
    addr: AlignedAddr,
    queue: &mut List<Waiter>,
    f: &mut impl FnMut(AlignedAddr, &TaskRef) -> FilterVerdict,
) {
    let mut kept = List::new();
    while let Some(waiter) = queue.pop_front() {
        match f(addr, &waiter.task) {
            FilterVerdict::Keep => kept.push_back(waiter),
            FilterVerdict::Kill => {
                let task = waiter.task.clone();
                drop(waiter);
                tracing::debug!(addr = ?addr, task = %task.id(), "assassinating waiter");
                task.set_blocked_on(ptr::null_mut());
                sched.assassinate(&task);
            }
        }
    }
    *queue = kept;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Word;
    use crate::sched::TaskState;
    use crate::test_util::{new_engine, spawn_task, wait_until_blocked};

    #[test]
    fn callback_sees_every_waiter() {
        let (febs, sched) = new_engine();
        let a = Box::new(0_u64);
        let b = Box::new(0_u64);
        // Safety: the words outlive every engine call in this test.
        unsafe {
            febs.empty(&*a).unwrap();
            febs.empty(&*b).unwrap();
        }

        let f1 = febs.clone();
        let pa = &*a as *const Word as usize;
        let (t1, h1) = spawn_task(&sched, move || {
            let mut out = 0;
            // Safety: `a` outlives the reader; the test joins before drop.
            unsafe { f1.read_ff(&mut out, pa as *const Word).unwrap() };
        });
        let f2 = febs.clone();
        let pb = &*b as *const Word as usize;
        let (t2, h2) = spawn_task(&sched, move || {
            let mut out = 0;
            // Safety: as above.
            unsafe { f2.read_fe(&mut out, pb as *const Word).unwrap() };
        });
        wait_until_blocked(&t1);
        wait_until_blocked(&t2);

        let mut seen = Vec::new();
        febs.for_each_waiter(|_, task| seen.push(task.id()));
        assert!(seen.contains(&t1.id()));
        assert!(seen.contains(&t2.id()));
        assert_eq!(seen.len(), 2);

        // Safety: as above.
        unsafe {
            febs.fill(&*a).unwrap();
            febs.fill(&*b).unwrap();
        }
        h1.join().unwrap();
        h2.join().unwrap();
    }

    // killing the only waiter leaves the record behind until
    // the next fill reaps it
    #[test]
    fn killed_writer_leaves_a_reapable_record() {
        let (febs, sched) = new_engine();
        let a = Box::new(0_u64);

        // A writer on an untracked (full) word parks on EFQ.
        let f1 = febs.clone();
        let pa = &*a as *const Word as usize;
        let (t1, h1) = spawn_task(&sched, move || {
            // Safety: `a` outlives the writer; the test joins before drop.
            unsafe { f1.write_ef_const(pa as *mut Word, 9).unwrap() };
        });
        wait_until_blocked(&t1);

        febs.taskfilter(|_, task| {
            if task.id() == t1.id() {
                FilterVerdict::Kill
            } else {
                FilterVerdict::Keep
            }
        });
        h1.join().unwrap();
        assert_eq!(t1.state(), TaskState::Dead);

        // The record is still there (full, idle), untouched by the kill.
        let addr = crate::AlignedAddr::new(&*a);
        assert!(febs.core.map.lookup(addr).is_some());
        assert!(febs.status(&*a));

        // The next fill observes idle-and-full and removes it.
        // Safety: as above.
        unsafe { febs.fill(&*a).unwrap() };
        assert!(febs.core.map.lookup(addr).is_none());
    }

    #[test]
    fn kill_preserves_fifo_of_survivors() {
        let (febs, sched) = new_engine();
        let a = Box::new(0_u64);
        // Safety: the word outlives every engine call in this test.
        unsafe { febs.empty(&*a).unwrap() };

        let pa = &*a as *const Word as usize;
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let f = febs.clone();
            let (t, h) = spawn_task(&sched, move || {
                let mut out = 0;
                // Safety: `a` outlives the readers; the test joins them.
                unsafe { f.read_ff(&mut out, pa as *const Word).unwrap() };
            });
            wait_until_blocked(&t);
            waiters.push((t, h));
        }

        // Kill the middle one.
        let victim = waiters[1].0.id();
        febs.taskfilter(|_, task| {
            if task.id() == victim {
                FilterVerdict::Kill
            } else {
                FilterVerdict::Keep
            }
        });

        // Safety: as above.
        unsafe { febs.fill(&*a).unwrap() };
        let log = sched.enqueue_log();
        let first = log.iter().position(|id| *id == waiters[0].0.id());
        let last = log.iter().position(|id| *id == waiters[2].0.id());
        assert!(first.expect("first waiter woken") < last.expect("last waiter woken"));
        assert!(!log.contains(&victim));

        for (_, h) in waiters {
            h.join().unwrap();
        }
    }
}
