// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Test scheduler: every task runs on its own OS thread, suspension parks
//! the thread on the task latch, and every `enqueue_ready` is logged so
//! tests can assert wake order.

use crate::engine::Febs;
use crate::sched::{Schedule, Task, TaskFlags, TaskId, TaskRef, TaskState, WorkerId};
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub(crate) struct DirectSched {
    next_worker: AtomicUsize,
    log: spin::Mutex<Vec<(TaskId, Option<WorkerId>)>>,
}

thread_local! {
    static CURRENT: RefCell<Option<(WorkerId, TaskRef)>> = const { RefCell::new(None) };
}

// === impl DirectSched ===

impl DirectSched {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_worker: AtomicUsize::new(0),
            log: spin::Mutex::new(Vec::new()),
        })
    }

    /// Task ids in the order they were handed back to the scheduler.
    pub(crate) fn enqueue_log(&self) -> Vec<TaskId> {
        self.log.lock().iter().map(|(id, _)| *id).collect()
    }

    /// The worker a task was enqueued on (outer `None` if never enqueued).
    pub(crate) fn enqueue_worker_of(&self, id: TaskId) -> Option<Option<WorkerId>> {
        self.log
            .lock()
            .iter()
            .find(|(logged, _)| *logged == id)
            .map(|(_, worker)| *worker)
    }
}

impl Schedule for DirectSched {
    fn current_worker(&self) -> Option<WorkerId> {
        CURRENT.with(|current| current.borrow().as_ref().map(|(worker, _)| *worker))
    }

    fn current_task(&self) -> Option<TaskRef> {
        CURRENT.with(|current| current.borrow().as_ref().map(|(_, task)| task.clone()))
    }

    fn suspend_current(&self, task: &TaskRef) {
        task.park();
    }

    fn enqueue_ready(&self, worker: Option<WorkerId>, task: TaskRef) {
        self.log.lock().push((task.id(), worker));
        task.unpark();
    }

    fn spawn_helper(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        let worker = WorkerId(self.next_worker.fetch_add(1, Ordering::Relaxed));
        std::thread::spawn(move || {
            let task = Task::new(TaskFlags::empty(), None);
            task.set_state(TaskState::Running);
            CURRENT.with(|current| *current.borrow_mut() = Some((worker, task)));
            job();
            CURRENT.with(|current| *current.borrow_mut() = None);
        });
    }

    fn assassinate(&self, task: &TaskRef) {
        task.set_state(TaskState::Dead);
        // Release the parked thread; the op observes the dead state.
        task.unpark();
    }
}

/// A fresh engine on a fresh scheduler.
pub(crate) fn new_engine() -> (Febs<Arc<DirectSched>>, Arc<DirectSched>) {
    let sched = DirectSched::new();
    (Febs::new(sched.clone()), sched)
}

/// Runs `f` as a task on its own worker thread.
pub(crate) fn spawn_task(
    sched: &Arc<DirectSched>,
    f: impl FnOnce() + Send + 'static,
) -> (TaskRef, JoinHandle<()>) {
    spawn_task_as(sched, Task::new(TaskFlags::empty(), None), f)
}

/// Runs `f` as the given task on its own worker thread.
pub(crate) fn spawn_task_as(
    sched: &Arc<DirectSched>,
    task: TaskRef,
    f: impl FnOnce() + Send + 'static,
) -> (TaskRef, JoinHandle<()>) {
    let worker = WorkerId(sched.next_worker.fetch_add(1, Ordering::Relaxed));
    let thread_task = task.clone();
    let handle = std::thread::spawn(move || {
        thread_task.set_state(TaskState::Running);
        CURRENT.with(|current| *current.borrow_mut() = Some((worker, thread_task)));
        f();
        CURRENT.with(|current| *current.borrow_mut() = None);
    });
    (task, handle)
}

/// Spins (with yields) until `cond` holds, panicking after five seconds.
pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "condition not reached within timeout"
        );
        std::thread::yield_now();
    }
}

/// Waits until `task` is parked in a waiter queue.
pub(crate) fn wait_until_blocked(task: &TaskRef) {
    wait_until(|| task.state() == TaskState::Blocked);
}
