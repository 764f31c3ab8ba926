// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler contract the FEB engine consumes, and the task vocabulary
//! shared between the engine and a scheduler.
//!
//! The engine never runs tasks. It parks the calling task through
//! [`Schedule::suspend_current`] after linking a waiter, and whichever task
//! later performs the releasing transition hands the parked task back to the
//! scheduler with [`Schedule::enqueue_ready`].

use crate::addr::{AlignedAddr, Word};
use crate::loom::sync::Arc;
use crate::loom::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64, Ordering};
use core::fmt;
use std::sync::{Condvar, Mutex};

/// A handle to a task, shared between the scheduler and any waiter node the
/// task is parked in.
pub type TaskRef = Arc<Task>;

/// Identifies a scheduler worker (shepherd) and its ready queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct WorkerId(pub usize);

/// An opaque ID that uniquely identifies a task.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct TaskId(u64);

bitflags::bitflags! {
    /// Scheduling properties of a task.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u8 {
        /// The task must run on its target worker; waking it from another
        /// worker enqueues it remotely instead of locally.
        const UNSTEALABLE = 1 << 0;
    }
}

/// The lifecycle state of a task, as far as the FEB engine is concerned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum TaskState {
    /// Not yet started; parked on one of its precondition addresses.
    Nascent = 0,
    /// On (or headed for) a ready queue.
    Runnable = 1,
    /// Currently executing on a worker.
    Running = 2,
    /// Parked in a waiter queue of a status record.
    Blocked = 3,
    /// Cancelled from outside; will never run (again).
    Dead = 4,
}

/// A task handle.
///
/// The FEB engine reads and writes the state, the precondition list and the
/// blocked-on slot; the park latch is the handshake a [`Schedule`]
/// implementation uses to realize [`suspend_current`]/[`enqueue_ready`].
///
/// [`suspend_current`]: Schedule::suspend_current
/// [`enqueue_ready`]: Schedule::enqueue_ready
pub struct Task {
    id: TaskId,
    state: AtomicU8,
    flags: TaskFlags,
    target_worker: Option<WorkerId>,
    /// Addresses that must be full before a nascent task may start.
    /// Satisfied entries are popped from the back.
    preconds: spin::Mutex<Vec<AlignedAddr>>,
    /// The status record this task is currently parked on, for diagnostics.
    blocked_on: AtomicPtr<()>,
    /// Park latch: set by `unpark`, consumed by `park`.
    ready: Mutex<bool>,
    ready_cv: Condvar,
}

// Safety: the precondition list holds plain addresses that are only
// dereferenced by FEB operations under the owning record's lock; everything
// else is atomics or immutable.
unsafe impl Send for Task {}
// Safety: see above.
unsafe impl Sync for Task {}

static_assertions::assert_impl_all!(TaskRef: Send, Sync);

/// The scheduler primitives the FEB engine requires.
///
/// Implementations own the workers, ready queues and context switching; the
/// engine only ever parks the current task and re-enqueues tasks it has
/// woken.
pub trait Schedule: Send + Sync {
    /// The worker the calling thread belongs to, or `None` when the caller
    /// is not a scheduler thread.
    fn current_worker(&self) -> Option<WorkerId>;

    /// The task executing on the calling thread, or `None` when the caller
    /// is not a scheduler thread.
    fn current_task(&self) -> Option<TaskRef>;

    /// Parks the calling task.
    ///
    /// Must not return until [`enqueue_ready`] has been called for `task`.
    /// A wake that lands before the park must not be lost; [`Task::park`]
    /// and [`Task::unpark`] provide exactly this latch.
    ///
    /// [`enqueue_ready`]: Schedule::enqueue_ready
    fn suspend_current(&self, task: &TaskRef);

    /// Places `task` on the given worker's ready queue, or on the current
    /// worker's (scheduler's choice) when `worker` is `None`.
    fn enqueue_ready(&self, worker: Option<WorkerId>, task: TaskRef);

    /// Runs `job` on some scheduler worker. Used to execute blocking FEB
    /// operations on behalf of callers that are not scheduler threads.
    fn spawn_helper(&self, job: Box<dyn FnOnce() + Send + 'static>);

    /// Forcibly terminates a blocked task. Only invoked by the maintenance
    /// task filter; the task has already been unlinked from its queue.
    fn assassinate(&self, task: &TaskRef);
}

impl<S: Schedule + ?Sized> Schedule for Arc<S> {
    fn current_worker(&self) -> Option<WorkerId> {
        (**self).current_worker()
    }

    fn current_task(&self) -> Option<TaskRef> {
        (**self).current_task()
    }

    fn suspend_current(&self, task: &TaskRef) {
        (**self).suspend_current(task);
    }

    fn enqueue_ready(&self, worker: Option<WorkerId>, task: TaskRef) {
        (**self).enqueue_ready(worker, task);
    }

    fn spawn_helper(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        (**self).spawn_helper(job);
    }

    fn assassinate(&self, task: &TaskRef) {
        (**self).assassinate(task);
    }
}

// === impl TaskId ===

impl TaskId {
    fn next() -> Self {
        #[cfg(loom)]
        crate::loom::lazy_static! {
            static ref NEXT_ID: AtomicU64 = AtomicU64::new(1);
        }
        #[cfg(not(loom))]
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl TaskState ===

impl TaskState {
    fn from_u8(bits: u8) -> Self {
        match bits {
            0 => Self::Nascent,
            1 => Self::Runnable,
            2 => Self::Running,
            3 => Self::Blocked,
            4 => Self::Dead,
            _ => unreachable!("invalid task state {bits}"),
        }
    }
}

// === impl Task ===

impl Task {
    /// Creates a runnable task handle with no preconditions.
    pub fn new(flags: TaskFlags, target_worker: Option<WorkerId>) -> TaskRef {
        Self::build(flags, target_worker, Vec::new(), TaskState::Runnable)
    }

    /// Creates a nascent task that may not start until every precondition
    /// address is full. Check with [`Febs::check_preconds`].
    ///
    /// [`Febs::check_preconds`]: crate::Febs::check_preconds
    pub fn with_preconds<I>(
        flags: TaskFlags,
        target_worker: Option<WorkerId>,
        preconds: I,
    ) -> TaskRef
    where
        I: IntoIterator<Item = *const Word>,
    {
        let preconds = preconds.into_iter().map(AlignedAddr::new).collect();
        Self::build(flags, target_worker, preconds, TaskState::Nascent)
    }

    fn build(
        flags: TaskFlags,
        target_worker: Option<WorkerId>,
        preconds: Vec<AlignedAddr>,
        state: TaskState,
    ) -> TaskRef {
        Arc::new(Self {
            id: TaskId::next(),
            state: AtomicU8::new(state as u8),
            flags,
            target_worker,
            preconds: spin::Mutex::new(preconds),
            blocked_on: AtomicPtr::new(core::ptr::null_mut()),
            ready: Mutex::new(false),
            ready_cv: Condvar::new(),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn flags(&self) -> TaskFlags {
        self.flags
    }

    pub fn target_worker(&self) -> Option<WorkerId> {
        self.target_worker
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_nascent(&self) -> bool {
        self.state() == TaskState::Nascent
    }

    pub(crate) fn with_preconds_mut<R>(&self, f: impl FnOnce(&mut Vec<AlignedAddr>) -> R) -> R {
        f(&mut self.preconds.lock())
    }

    pub(crate) fn set_blocked_on(&self, record: *mut ()) {
        self.blocked_on.store(record, Ordering::Release);
    }

    /// The record this task is parked on, if any. Diagnostics only.
    pub fn blocked_on(&self) -> *const () {
        self.blocked_on.load(Ordering::Acquire)
    }

    /// Blocks the calling thread until [`unpark`] is called, then consumes
    /// the wake. A wake delivered before the park returns immediately.
    ///
    /// This is the latch [`Schedule::suspend_current`] is expected to park
    /// on.
    ///
    /// [`unpark`]: Task::unpark
    pub fn park(&self) {
        let mut ready = self.ready.lock().expect("park latch poisoned");
        while !*ready {
            ready = self.ready_cv.wait(ready).expect("park latch poisoned");
        }
        *ready = false;
    }

    /// Releases a (current or future) [`park`].
    ///
    /// [`park`]: Task::park
    pub fn unpark(&self) {
        let mut ready = self.ready.lock().expect("park latch poisoned");
        *ready = true;
        self.ready_cv.notify_one();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("flags", &self.flags)
            .field("target_worker", &self.target_worker)
            .finish_non_exhaustive()
    }
}
