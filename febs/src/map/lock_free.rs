// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Lock-free stripes: a fixed array of buckets per stripe, each bucket a
//! sorted singly-linked list threaded through the records themselves.
//!
//! Deletion is two-phase: the low bit of a record's `next` pointer marks it
//! logically deleted, and any traversal that encounters a marked record
//! unlinks it (the unlink winner hands it to the [`reclaim`] domain).
//! Readers protect the two nodes they have in hand with hazard slots and
//! re-verify reachability after every publication, so a record they hold is
//! never freed under them. A record returned to the engine is additionally
//! published in hazard slot 0 and its `valid` flag re-checked under the
//! record lock, exactly the protocol the engine's retry loops expect.

use super::LockedRecord;
use crate::addr::{AlignedAddr, hash64};
use crate::loom::sync::atomic::{AtomicPtr, Ordering};
use crate::reclaim::{self, CURR, PRED, RECORD};
use crate::record::StatusRecord;
use core::ptr::{self, NonNull};

/// Buckets per stripe. Power of two; indexed by high hash bits so it does
/// not correlate with the stripe choice.
const BUCKETS: usize = 64;

pub(super) struct Stripe {
    buckets: Box<[AtomicPtr<StatusRecord>]>,
}

/// Outcome of a bucket traversal for `key`.
///
/// `pred` is the link to swing for an insert or unlink at this position. It
/// either points into the bucket array or into a record protected by the
/// [`PRED`] hazard slot, so it stays dereferenceable until the caller's next
/// traversal.
enum Find<'a> {
    Found {
        pred: &'a AtomicPtr<StatusRecord>,
        curr: NonNull<StatusRecord>,
    },
    NotFound {
        pred: &'a AtomicPtr<StatusRecord>,
        succ: *mut StatusRecord,
    },
}

fn is_marked(ptr: *mut StatusRecord) -> bool {
    ptr as usize & 1 != 0
}

fn marked(ptr: *mut StatusRecord) -> *mut StatusRecord {
    ptr.map_addr(|addr| addr | 1)
}

fn unmarked(ptr: *mut StatusRecord) -> *mut StatusRecord {
    ptr.map_addr(|addr| addr & !1)
}

// === impl Stripe ===

impl Stripe {
    pub(super) fn new() -> Self {
        let buckets = (0..BUCKETS).map(|_| AtomicPtr::new(ptr::null_mut())).collect();
        Self { buckets }
    }

    fn bucket(&self, key: AlignedAddr) -> &AtomicPtr<StatusRecord> {
        #[expect(clippy::cast_possible_truncation, reason = "masked to BUCKETS - 1")]
        let index = ((hash64(key.addr() as u64) >> 32) & (BUCKETS as u64 - 1)) as usize;
        &self.buckets[index]
    }

    /// Walks the bucket for `key`, unlinking marked records along the way.
    ///
    /// On return the [`CURR`] hazard slot protects `curr`/`succ` (when
    /// non-null) and the [`PRED`] slot protects the record holding `pred`
    /// (when `pred` is not the bucket head).
    fn find(&self, key: AlignedAddr) -> Find<'_> {
        let head = self.bucket(key);
        'retry: loop {
            let mut pred: &AtomicPtr<StatusRecord> = head;
            let mut curr = pred.load(Ordering::Acquire);
            loop {
                let Some(curr_nn) = NonNull::new(curr) else {
                    return Find::NotFound {
                        pred,
                        succ: ptr::null_mut(),
                    };
                };
                reclaim::protect(CURR, curr_nn.as_ptr());
                // SeqCst pairs with the reclaim scan: either the scan sees
                // the publication above, or this load sees the unlink and
                // we start over.
                if pred.load(Ordering::SeqCst) != curr {
                    continue 'retry;
                }
                // Safety: `curr` was reachable after the hazard was
                // published, so it cannot be freed while we use it.
                let curr_ref: &StatusRecord = unsafe { curr_nn.as_ref() };
                let succ = curr_ref.next.load(Ordering::Acquire);

                if is_marked(succ) {
                    // logically deleted; unlink it (the winner owns the free)
                    match pred.compare_exchange(
                        curr,
                        unmarked(succ),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // Safety: unlinked and the mark keeps it from
                            // being re-linked; remaining readers hold
                            // hazard slots.
                            unsafe { reclaim::retire(curr_nn) };
                            curr = unmarked(succ);
                            continue;
                        }
                        Err(_) => continue 'retry,
                    }
                }

                let curr_key = curr_ref.key();
                if curr_key >= key {
                    if curr_key == key {
                        return Find::Found {
                            pred,
                            curr: curr_nn,
                        };
                    }
                    return Find::NotFound { pred, succ: curr };
                }

                // advance; `curr`'s protection moves to the PRED slot
                reclaim::protect(PRED, curr_nn.as_ptr());
                pred = &curr_ref.next;
                curr = succ;
            }
        }
    }

    pub(super) fn lookup(&self, key: AlignedAddr) -> Option<LockedRecord<'_>> {
        loop {
            match self.find(key) {
                Find::NotFound { .. } => return None,
                Find::Found { curr, .. } => {
                    reclaim::protect(RECORD, curr.as_ptr());
                    // Safety: the CURR slot has protected this record since
                    // its reachability check inside `find`, so the RECORD
                    // publication above is effective.
                    let locked = unsafe { LockedRecord::lock(curr) };
                    if !locked.record().is_valid() {
                        // unlinked while we were acquiring the lock
                        drop(locked);
                        continue;
                    }
                    return Some(locked);
                }
            }
        }
    }

    pub(super) fn lookup_or_insert(
        &self,
        key: AlignedAddr,
        full_if_new: bool,
    ) -> (LockedRecord<'_>, bool) {
        loop {
            match self.find(key) {
                Find::Found { curr, .. } => {
                    reclaim::protect(RECORD, curr.as_ptr());
                    // Safety: see `lookup`.
                    let locked = unsafe { LockedRecord::lock(curr) };
                    if !locked.record().is_valid() {
                        drop(locked);
                        continue;
                    }
                    return (locked, false);
                }
                Find::NotFound { pred, succ } => {
                    let rec = StatusRecord::new(key, full_if_new);
                    rec.next.store(succ, Ordering::Relaxed);
                    let raw = Box::into_raw(rec);
                    // Safety: `Box::into_raw` never returns null.
                    let rec = unsafe { util::non_null(raw) };
                    // Lock before publishing: a concurrent remover must not
                    // be able to take the record away before our caller is
                    // done with it.
                    // Safety: not yet shared, we own the allocation.
                    let locked = unsafe { LockedRecord::lock(rec) };
                    match pred.compare_exchange(
                        succ,
                        raw,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return (locked, true),
                        Err(_) => {
                            // a concurrent insertion won the race; throw
                            // ours away and start over
                            drop(locked);
                            // Safety: never published anywhere.
                            unsafe { drop(Box::from_raw(raw)) };
                            continue;
                        }
                    }
                }
            }
        }
    }

    pub(super) fn remove_if_idle(&self, key: AlignedAddr) {
        let Some(locked) = self.lookup(key) else {
            tracing::trace!(addr = ?key, "record already gone");
            return;
        };
        if !locked.removable() {
            tracing::trace!(addr = ?key, "record in use, not removing");
            return;
        }

        let rec = locked.record();
        rec.invalidate();
        // Mark the next pointer; concurrent inserts behind this record may
        // still swing it, so loop.
        let mut next = rec.next.load(Ordering::Acquire);
        loop {
            debug_assert!(!is_marked(next), "record marked twice");
            match rec.next.compare_exchange_weak(
                next,
                marked(next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => next = actual,
            }
        }
        drop(locked);

        // Physically unlink it (or let a concurrent traversal do it; either
        // way the unlink winner retires the record). Our RECORD hazard slot
        // still covers the record, so it cannot be freed mid-`find`.
        let _ = self.find(key);
        // Stop holding the retired record back.
        reclaim::clear(RECORD);
        tracing::debug!(addr = ?key, "removed idle record");
    }

    pub(super) fn for_each(&self, f: &mut impl FnMut(AlignedAddr, &mut LockedRecord<'_>)) {
        for head in &self.buckets {
            'restart: loop {
                let mut pred: &AtomicPtr<StatusRecord> = head;
                let mut curr = pred.load(Ordering::Acquire);
                loop {
                    let Some(curr_nn) = NonNull::new(curr) else {
                        break 'restart;
                    };
                    reclaim::protect(CURR, curr_nn.as_ptr());
                    // SeqCst: see `find`
                    if pred.load(Ordering::SeqCst) != curr {
                        continue 'restart;
                    }
                    // Safety: reachable after hazard publication, see `find`.
                    let curr_ref: &StatusRecord = unsafe { curr_nn.as_ref() };
                    let succ = curr_ref.next.load(Ordering::Acquire);
                    if is_marked(succ) {
                        // mid-removal; retraverse and let `find`-style help
                        // in the next pass deal with it
                        continue 'restart;
                    }

                    reclaim::protect(RECORD, curr_nn.as_ptr());
                    // Safety: see `lookup`.
                    let mut locked = unsafe { LockedRecord::lock(curr_nn) };
                    if locked.record().is_valid() {
                        f(curr_ref.key(), &mut locked);
                    }
                    drop(locked);

                    reclaim::protect(PRED, curr_nn.as_ptr());
                    pred = &curr_ref.next;
                    curr = curr_ref.next.load(Ordering::Acquire);
                    if is_marked(curr) {
                        continue 'restart;
                    }
                }
            }
        }
    }
}

impl Drop for Stripe {
    fn drop(&mut self) {
        for head in &self.buckets {
            let mut curs = head.load(Ordering::Relaxed);
            while let Some(rec) = NonNull::new(unmarked(curs)) {
                // Safety: dropping the map means the subsystem is shutting
                // down and we own every linked record exclusively.
                let mut rec = unsafe { Box::from_raw(rec.as_ptr()) };
                let slot = rec.lock.get_mut();
                if !slot.idle() {
                    debug_assert!(slot.idle(), "waiters leaked past shutdown");
                    tracing::warn!(addr = ?rec.key(), "shutting down with live waiters");
                }
                curs = rec.next.load(Ordering::Relaxed);
            }
        }
    }
}
