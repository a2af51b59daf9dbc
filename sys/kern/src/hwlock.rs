// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bank of hardware spinlocks.
//!
//! Each lock has two flags: `claimed`, saying somebody owns the lock as a
//! resource, and `locked`, saying somebody is inside it right now. Both are
//! flipped with `swap_polyfill`, and locking spins with interrupts masked on
//! the calling core, so a holder can't be preempted on its own core while the
//! other core waits.
//!
//! Nothing here knows about categories, owners or statistics. That's the
//! spinlock manager's job.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::atomic::AtomicExt;
use crate::config::SPINLOCK_COUNT;

#[allow(clippy::declare_interior_mutable_const)]
const CLEAR: AtomicBool = AtomicBool::new(false);

pub(crate) struct HwLockBank {
    claimed: [AtomicBool; SPINLOCK_COUNT],
    locked: [AtomicBool; SPINLOCK_COUNT],
}

impl HwLockBank {
    pub(crate) const fn new() -> Self {
        Self {
            claimed: [CLEAR; SPINLOCK_COUNT],
            locked: [CLEAR; SPINLOCK_COUNT],
        }
    }

    /// Claims the lowest-numbered unclaimed lock, skipping `skip`.
    pub(crate) fn claim_unused(&self, skip: Option<usize>) -> Option<usize> {
        (0..SPINLOCK_COUNT)
            .filter(|&i| Some(i) != skip)
            .find(|&i| self.claim(i))
    }

    /// Claims lock `i`, returning `false` if it was already claimed.
    pub(crate) fn claim(&self, i: usize) -> bool {
        !self.claimed[i].swap_polyfill(true, Ordering::AcqRel)
    }

    /// Returns lock `i` to the pool. Whether it is held is untouched; only
    /// `unlock` lets a holder go.
    pub(crate) fn unclaim(&self, i: usize) {
        self.claimed[i].store(false, Ordering::Release);
    }

    pub(crate) fn is_claimed(&self, i: usize) -> bool {
        self.claimed[i].load(Ordering::Acquire)
    }

    pub(crate) fn is_locked(&self, i: usize) -> bool {
        self.locked[i].load(Ordering::Acquire)
    }

    /// Spins until lock `i` is ours. Interrupts stay masked until `unlock`.
    pub(crate) fn lock(&self, i: usize) -> arch::IrqState {
        let irq = arch::disable_interrupts();
        while self.locked[i].swap_polyfill(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }
        irq
    }

    /// Takes lock `i` if nobody holds it.
    pub(crate) fn try_lock(&self, i: usize) -> Option<arch::IrqState> {
        let irq = arch::disable_interrupts();
        if self.locked[i].swap_polyfill(true, Ordering::Acquire) {
            arch::restore_interrupts(irq);
            None
        } else {
            Some(irq)
        }
    }

    pub(crate) fn unlock(&self, i: usize, irq: arch::IrqState) {
        self.locked[i].store(false, Ordering::Release);
        arch::restore_interrupts(irq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_skips_taken_and_reserved() {
        let bank = HwLockBank::new();
        assert_eq!(bank.claim_unused(Some(0)), Some(1));
        assert_eq!(bank.claim_unused(Some(0)), Some(2));
        assert!(bank.claim(0));
        assert!(!bank.claim(0));
        bank.unclaim(1);
        assert_eq!(bank.claim_unused(None), Some(1));
    }

    #[test]
    fn exhausted_bank() {
        let bank = HwLockBank::new();
        for _ in 0..SPINLOCK_COUNT {
            assert!(bank.claim_unused(None).is_some());
        }
        assert_eq!(bank.claim_unused(None), None);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let bank = HwLockBank::new();
        let irq = bank.lock(3);
        assert!(bank.is_locked(3));
        assert!(bank.try_lock(3).is_none());
        bank.unlock(3, irq);
        let irq = bank.try_lock(3).expect("lock should be free");
        bank.unlock(3, irq);
    }

    #[test]
    fn unclaim_leaves_the_holder_in_place() {
        let bank = HwLockBank::new();
        assert!(bank.claim(5));
        let irq = bank.lock(5);
        bank.unclaim(5);
        assert!(!bank.is_claimed(5));
        assert!(bank.is_locked(5));
        assert!(bank.try_lock(5).is_none());
        bank.unlock(5, irq);
        assert!(!bank.is_locked(5));
    }
}
