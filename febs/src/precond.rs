// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Precondition checks for nascent tasks.
//!
//! A task may declare a list of addresses that must all be full before it
//! starts. Checking never suspends a live worker: when an empty address is
//! found, the *nascent* task itself is parked in that record's `FFQ` and the
//! check returns. When the address later fills, the wake engine defers the
//! nascent waiter onto a batch (re-checking here would take further record
//! locks under the one it holds), and [`Febs::launch_batch`] re-runs the
//! check once the lock is gone.

use crate::error::Error;
use crate::record::Waiter;
use crate::sched::{Schedule, TaskRef, TaskState};
use cordyceps::list::List;
use core::ptr;

impl<S: Schedule + 'static> crate::Febs<S> {
    /// Walks `task`'s precondition list, popping every address that is
    /// already full.
    ///
    /// Returns `Ok(true)` if the task was parked on an empty address (it
    /// stays nascent and will be re-checked when that address fills), or
    /// `Ok(false)` once every precondition is satisfied and the task has
    /// been transitioned to runnable.
    ///
    /// # Errors
    ///
    /// [`Error::Alloc`] if a waiter record cannot be allocated.
    pub fn check_preconds(&self, task: &TaskRef) -> Result<bool, Error> {
        while let Some(addr) = task.with_preconds_mut(|preconds| preconds.last().copied()) {
            self.count_stripe(addr);
            match self.core.map.lookup(addr) {
                None => {
                    // untracked: full
                    task.with_preconds_mut(|preconds| preconds.pop());
                }
                Some(rec) if rec.full => {
                    drop(rec);
                    task.with_preconds_mut(|preconds| preconds.pop());
                }
                Some(mut rec) => {
                    // empty: park the nascent task on this address
                    rec.ffq.push_back(Waiter::new(ptr::null_mut(), task.clone()));
                    task.set_state(TaskState::Nascent);
                    drop(rec);
                    tracing::debug!(task = %task.id(), addr = ?addr, "parked nascent task");
                    return Ok(true);
                }
            }
        }

        task.set_state(TaskState::Runnable);
        tracing::debug!(task = %task.id(), "all preconditions satisfied");
        Ok(false)
    }

    /// Re-checks every nascent waiter a drain deferred, and enqueues those
    /// whose remaining preconditions are now satisfied.
    ///
    /// Runs only after the draining record's lock has been released, so the
    /// record locks taken by the re-checks keep the locking graph acyclic.
    pub(crate) fn launch_batch(&self, mut batch: List<Waiter>) {
        while let Some(waiter) = batch.pop_front() {
            let task = waiter.task.clone();
            drop(waiter);
            match self.check_preconds(&task) {
                Ok(true) => {} // parked on another precondition
                Ok(false) => {
                    let worker = task.target_worker();
                    self.core.sched.enqueue_ready(worker, task);
                }
                Err(err) => {
                    tracing::error!(task = %task.id(), %err, "precondition re-check failed");
                    debug_assert!(false, "precondition re-check failed: {err}");
                }
            }
        }
    }
}
