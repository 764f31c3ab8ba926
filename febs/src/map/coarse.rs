// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Coarse-locked stripes: one mutex per stripe around a hash table of
//! record pointers.
//!
//! The record lock is always acquired *inside* the stripe critical section
//! and released only after the stripe lock is gone. Because of that, a
//! record can only be freed by a remover that held both locks and unlinked
//! it first: no other thread can still be spinning on (or holding) the
//! record lock at that point, and no later lookup can reach it.

use super::LockedRecord;
use crate::addr::AlignedAddr;
use crate::record::StatusRecord;
use core::ptr::NonNull;
use hashbrown::HashMap;
use hashbrown::hash_map::Entry;

pub(super) struct Stripe {
    table: spin::Mutex<HashMap<AlignedAddr, NonNull<StatusRecord>>>,
}

// Safety: the table is only touched under its mutex, and `StatusRecord` is
// itself `Send + Sync`.
unsafe impl Send for Stripe {}
// Safety: see above.
unsafe impl Sync for Stripe {}

// === impl Stripe ===

impl Stripe {
    pub(super) fn new() -> Self {
        Self {
            table: spin::Mutex::new(HashMap::new()),
        }
    }

    pub(super) fn lookup(&self, key: AlignedAddr) -> Option<LockedRecord<'_>> {
        let table = self.table.lock();
        let ptr = table.get(&key).copied()?;
        // Safety: we hold the stripe lock, so the record cannot be unlinked
        // (let alone freed) before we hold its own lock.
        let locked = unsafe { LockedRecord::lock(ptr) };
        drop(table);
        Some(locked)
    }

    pub(super) fn lookup_or_insert(
        &self,
        key: AlignedAddr,
        full_if_new: bool,
    ) -> (LockedRecord<'_>, bool) {
        let mut table = self.table.lock();
        let (ptr, created) = match table.entry(key) {
            Entry::Occupied(entry) => (*entry.get(), false),
            Entry::Vacant(entry) => {
                let rec = Box::into_raw(StatusRecord::new(key, full_if_new));
                // Safety: `Box::into_raw` never returns null.
                let ptr = unsafe { util::non_null(rec) };
                entry.insert(ptr);
                (ptr, true)
            }
        };
        // Safety: stripe lock held, see `lookup`.
        let locked = unsafe { LockedRecord::lock(ptr) };
        drop(table);
        (locked, created)
    }

    pub(super) fn remove_if_idle(&self, key: AlignedAddr) {
        let mut table = self.table.lock();
        let Some(ptr) = table.get(&key).copied() else {
            tracing::trace!(addr = ?key, "record already gone");
            return;
        };
        // Safety: stripe lock held, see `lookup`.
        let locked = unsafe { LockedRecord::lock(ptr) };
        if !locked.removable() {
            tracing::trace!(addr = ?key, "record in use, not removing");
            return;
        }

        locked.record().invalidate();
        table.remove(&key);
        drop(table);
        drop(locked);
        tracing::debug!(addr = ?key, "removed idle record");
        // Safety: the record was unlinked while we held both the stripe lock
        // and the record lock. Every lookup locks the record inside the
        // stripe section, so no other thread still holds or awaits this
        // record's lock, and none can find it anymore.
        unsafe { drop(Box::from_raw(ptr.as_ptr())) }
    }

    pub(super) fn for_each(&self, f: &mut impl FnMut(AlignedAddr, &mut LockedRecord<'_>)) {
        let table = self.table.lock();
        for (&key, &ptr) in table.iter() {
            // Safety: stripe lock held, see `lookup`.
            let mut locked = unsafe { LockedRecord::lock(ptr) };
            f(key, &mut locked);
        }
    }
}

impl Drop for Stripe {
    fn drop(&mut self) {
        let table = self.table.get_mut();
        for (_, ptr) in table.drain() {
            // Safety: dropping the map means the subsystem is shutting down
            // and we own every record exclusively.
            let mut rec = unsafe { Box::from_raw(ptr.as_ptr()) };
            let slot = rec.lock.get_mut();
            if !slot.idle() {
                debug_assert!(slot.idle(), "waiters leaked past shutdown");
                tracing::warn!(addr = ?rec.key(), "shutting down with live waiters");
            }
        }
    }
}
