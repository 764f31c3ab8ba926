// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::backoff::Backoff;
use crate::loom::Ordering;
use crate::loom::{AtomicBool, UnsafeCell};
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// The busy-waiting mutual exclusion lock of the FEB engine.
///
/// This is the status record's fast lock, and it also guards the coarse
/// stripe tables and the mutex-mode stripe counters. All of those critical
/// sections are a handful of word copies and queue links, far cheaper than
/// a context switch, which is why contenders spin (with [`Backoff`]) rather
/// than park.
///
/// The data can only be reached through the RAII [`MutexGuard`] returned by
/// [`lock`] and [`try_lock`], so it is only ever touched with the lock held.
///
/// [`lock`]: Mutex::lock
/// [`try_lock`]: Mutex::try_lock
pub struct Mutex<T: ?Sized> {
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

/// Scoped access to a [`Mutex`]'s data; the lock is released on drop.
#[clippy::has_significant_drop]
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    marker: PhantomData<&'a mut T>,
}

// Safety: the mutex hands out access to `T` from multiple threads, so `T` must be `Send`; the
// guard serializes that access.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
// Safety: see above.
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

// === impl Mutex ===

impl<T> Mutex<T> {
    util::loom_const_fn! {
        pub const fn new(val: T) -> Mutex<T> {
            Mutex {
                lock: AtomicBool::new(false),
                data: UnsafeCell::new(val),
            }
        }
    }

    /// Consumes this mutex, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Creates a `MutexGuard` without acquiring the lock.
    ///
    /// # Safety
    ///
    /// The calling thread must logically hold the lock already, with no
    /// other guard alive for it (a guard disposed of with `mem::forget`
    /// does not count as alive).
    #[inline]
    pub unsafe fn make_guard_unchecked(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            mutex: self,
            marker: PhantomData,
        }
    }

    /// Acquires the lock, spinning until it is available.
    ///
    /// Re-locking from the thread that already holds the lock deadlocks.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let mut backoff = Backoff::default();
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            // wait for the holder to let go before hitting the line with
            // another compare-exchange
            while self.is_locked() {
                backoff.spin();
            }
        }
    }

    /// Acquires the lock only if it is free right now.
    ///
    /// Never spins; returns `None` when the lock is held elsewhere.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            // Safety: the exchange above acquired the lock.
            Some(unsafe { self.make_guard_unchecked() })
        } else {
            None
        }
    }

    /// Returns the data without locking; the exclusive borrow already
    /// proves no guard exists.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        // Safety: `&mut self` rules out any live guard.
        self.data.with_mut(|data| unsafe { &mut *data })
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    /// Releases the lock without a guard.
    ///
    /// # Safety
    ///
    /// The calling thread must logically hold the lock (e.g. via a guard
    /// discarded with `mem::forget`); unlocking an unheld mutex lets two
    /// threads into the critical section.
    #[inline]
    pub unsafe fn force_unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

impl<T: Default> Default for Mutex<T> {
    #[inline]
    fn default() -> Mutex<T> {
        Mutex::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &&*guard).finish(),
            None => f.pad("Mutex(<locked>)"),
        }
    }
}

// === impl MutexGuard ===

// Safety: the guard gives out `&T`, which is fine to share exactly when `T: Sync`.
unsafe impl<'a, T: ?Sized + Sync + 'a> Sync for MutexGuard<'a, T> {}

impl<'a, T: ?Sized + 'a> Deref for MutexGuard<'a, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        // Safety: a live guard means the lock is held.
        self.mutex.data.with(|data| unsafe { &*data })
    }
}

impl<'a, T: ?Sized + 'a> DerefMut for MutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: a live guard means the lock is held.
        self.mutex.data.with_mut(|data| unsafe { &mut *data })
    }
}

impl<'a, T: ?Sized + fmt::Debug + 'a> fmt::Debug for MutexGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<'a, T: ?Sized + 'a> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        // Safety: a live guard means the lock is held, and it is held by us.
        unsafe {
            self.mutex.force_unlock();
        }
    }
}
