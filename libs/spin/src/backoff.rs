// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;

/// Bounded exponential backoff for the spin loops in [`Mutex`].
///
/// The locks in this workspace guard critical sections of a few word copies
/// and queue links, so a loser of the lock race is expected to get in after
/// a very short wait; the exponent exists to keep the pathological case from
/// hammering the cache line.
///
/// [`Mutex`]: crate::Mutex
#[derive(Debug, Copy, Clone)]
pub struct Backoff {
    exp: u8,
}

// === impl Backoff ===

impl Backoff {
    /// Cap on the exponent: at saturation each call to [`spin`] issues
    /// `2^8` pause hints.
    ///
    /// [`spin`]: Backoff::spin
    const MAX_EXPONENT: u8 = 8;

    #[must_use]
    pub const fn new() -> Self {
        Self { exp: 0 }
    }

    /// Issues `2^exp` [spin-loop hints] and bumps the exponent toward the
    /// cap. Call this each time a retry loses the race to another thread.
    ///
    /// [spin-loop hints]: hint::spin_loop
    #[inline(always)]
    pub fn spin(&mut self) {
        for _ in 0..(1_u32 << self.exp) {
            // Under test (and loom in particular) the scheduler needs the
            // thread back to make progress, see
            // https://github.com/tokio-rs/loom/issues/162#issuecomment-665128979
            #[cfg(any(test, loom))]
            crate::loom::thread::yield_now();

            hint::spin_loop();
        }

        if self.exp < Self::MAX_EXPONENT {
            self.exp += 1;
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
