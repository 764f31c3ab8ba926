// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The striped map from aligned addresses to status records.
//!
//! Both implementations present the same interface: lookups hand back a
//! [`LockedRecord`] whose record lock was acquired while the record was
//! still provably reachable (inside the stripe critical section in the
//! coarse mode, under a published hazard pointer in the lock-free mode), so
//! the caller can release map-level protection and keep using the record.
//!
//! Lock order is stripe before record, and never two records at once.

use crate::addr::{AlignedAddr, STRIPES, stripe_of};
use crate::record::{Slot, StatusRecord};
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

cfg_if::cfg_if! {
    if #[cfg(feature = "lock-free-febs")] {
        mod lock_free;
        use lock_free::Stripe;
    } else {
        mod coarse;
        use coarse::Stripe;
    }
}

/// `STRIPES` independent sub-maps, selected by hashing the address.
pub(crate) struct StripedMap {
    stripes: Box<[Stripe]>,
}

/// A status record with its fast lock held.
///
/// Dereferences to the [`Slot`]; dropping it releases the record lock.
pub(crate) struct LockedRecord<'a> {
    rec: &'a StatusRecord,
    slot: spin::MutexGuard<'a, Slot>,
}

// === impl StripedMap ===

impl StripedMap {
    pub(crate) fn new() -> Self {
        let stripes = (0..STRIPES).map(|_| Stripe::new()).collect();
        Self { stripes }
    }

    fn stripe(&self, key: AlignedAddr) -> &Stripe {
        &self.stripes[stripe_of(key)]
    }

    /// Looks up `key`, returning the record locked, or `None` if the address
    /// is untracked (i.e. full with no waiters).
    pub(crate) fn lookup(&self, key: AlignedAddr) -> Option<LockedRecord<'_>> {
        self.stripe(key).lookup(key)
    }

    /// Looks up `key`, inserting a fresh record with the given flag state if
    /// absent. Returns the locked record and whether it was created by this
    /// call.
    pub(crate) fn lookup_or_insert(
        &self,
        key: AlignedAddr,
        full_if_new: bool,
    ) -> (LockedRecord<'_>, bool) {
        self.stripe(key).lookup_or_insert(key, full_if_new)
    }

    /// Removes and frees the record for `key` if it is still idle-and-full.
    ///
    /// The decision is re-verified under the record lock (and, in the
    /// lock-free mode, against `valid`), so a waiter that slipped in after
    /// the caller observed the idle state keeps the record alive.
    pub(crate) fn remove_if_idle(&self, key: AlignedAddr) {
        self.stripe(key).remove_if_idle(key);
    }

    /// Visits every record in the map, locked one at a time.
    ///
    /// Only for maintenance sweeps; the callback must not touch the map.
    pub(crate) fn for_each(&self, mut f: impl FnMut(AlignedAddr, &mut LockedRecord<'_>)) {
        for stripe in &self.stripes {
            stripe.for_each(&mut f);
        }
    }
}

impl fmt::Debug for StripedMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripedMap")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}

#[cfg(feature = "lock-free-febs")]
impl Drop for StripedMap {
    fn drop(&mut self) {
        // Drop the stripes first so every linked record is freed, then
        // drain whatever the hazard domain still holds from earlier
        // unlinks.
        drop(core::mem::take(&mut self.stripes));
        crate::reclaim::flush();
    }
}

// === impl LockedRecord ===

impl<'a> LockedRecord<'a> {
    /// Locks the record behind `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live record that cannot be freed for the
    /// lifetime `'a`: the caller must hold the stripe lock, a published
    /// hazard pointer, or (transitively) the record lock this returns.
    pub(super) unsafe fn lock(ptr: NonNull<StatusRecord>) -> LockedRecord<'a> {
        // Safety: liveness ensured by caller, per above.
        let rec = unsafe { ptr.as_ref() };
        let slot = rec.lock.lock();
        LockedRecord { rec, slot }
    }

    pub(crate) fn record(&self) -> &StatusRecord {
        self.rec
    }

    pub(crate) fn as_ptr(&self) -> *const StatusRecord {
        self.rec
    }
}

impl Deref for LockedRecord<'_> {
    type Target = Slot;

    fn deref(&self) -> &Slot {
        &self.slot
    }
}

impl DerefMut for LockedRecord<'_> {
    fn deref_mut(&mut self) -> &mut Slot {
        &mut self.slot
    }
}

impl fmt::Debug for LockedRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedRecord")
            .field("record", &self.rec)
            .field("slot", &*self.slot)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Word;

    #[test]
    fn lookup_misses_on_untracked_address() {
        let map = StripedMap::new();
        let word = Box::new(0_u64);
        assert!(map.lookup(AlignedAddr::new(&*word)).is_none());
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let map = StripedMap::new();
        let word = Box::new(0_u64);
        let key = AlignedAddr::new(&*word);

        let (rec, created) = map.lookup_or_insert(key, false);
        assert!(created);
        assert!(!rec.full);
        assert_eq!(rec.record().key(), key);
        drop(rec);

        let (rec, created) = map.lookup_or_insert(key, true);
        assert!(!created);
        assert!(!rec.full, "existing record must keep its state");
        drop(rec);

        assert!(map.lookup(key).is_some());
    }

    #[test]
    fn remove_if_idle_only_removes_full_idle_records() {
        let map = StripedMap::new();
        let word = Box::new(0_u64);
        let key = AlignedAddr::new(&*word);

        let (rec, _) = map.lookup_or_insert(key, false);
        drop(rec);

        // Empty records carry state and must survive.
        map.remove_if_idle(key);
        assert!(map.lookup(key).is_some());

        {
            let mut rec = map.lookup(key).expect("record should exist");
            rec.full = true;
        }
        map.remove_if_idle(key);
        assert!(map.lookup(key).is_none());
    }

    #[test]
    fn for_each_visits_every_record() {
        let map = StripedMap::new();
        let words: Vec<Box<Word>> = (0..32).map(|i| Box::new(i as Word)).collect();
        for w in &words {
            let (rec, created) = map.lookup_or_insert(AlignedAddr::new(&**w), false);
            assert!(created);
            drop(rec);
        }

        let mut seen = 0;
        map.for_each(|_, rec| {
            assert!(!rec.full);
            seen += 1;
        });
        assert_eq!(seen, words.len());
    }

    #[test]
    fn distinct_addresses_do_not_alias() {
        let map = StripedMap::new();
        let words = [1_u64, 2, 3, 4];
        for (i, w) in words.iter().enumerate() {
            let (mut rec, created) = map.lookup_or_insert(AlignedAddr::new(w), false);
            assert!(created);
            rec.full = i % 2 == 0;
        }
        for (i, w) in words.iter().enumerate() {
            let rec = map.lookup(AlignedAddr::new(w)).expect("record must exist");
            assert_eq!(rec.full, i % 2 == 0);
        }
    }
}
