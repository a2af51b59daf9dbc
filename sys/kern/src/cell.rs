// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel state guarded by a tracked spinlock.
//!
//! A `KernCell` pairs a value with the ID of a pinned spinlock. The only way
//! in is `lock`, which goes through the spinlock manager (so the hold shows up
//! in its statistics) and hands back a guard that releases on drop. Kernel
//! code keeps guards short: copy fields in or out, then drop.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use abi::{LockId, TaskId};

use crate::spinlock::{SaveToken, SpinlockManager};

pub(crate) struct KernCell<T> {
    lock: LockId,
    contents: UnsafeCell<T>,
}

// Safety: access to `contents` is serialized by the spinlock.
unsafe impl<T: Send> Sync for KernCell<T> {}

impl<T> KernCell<T> {
    pub(crate) const fn new(lock: LockId, contents: T) -> Self {
        Self {
            lock,
            contents: UnsafeCell::new(contents),
        }
    }

    /// Spins until the cell's lock is ours.
    pub(crate) fn lock<'a>(&'a self, locks: &'a SpinlockManager) -> KernRef<'a, T> {
        let token = locks.acquire(self.lock, TaskId::SYSTEM);
        self.guard(locks, token)
    }

    /// Takes the cell's lock only if nobody holds it.
    pub(crate) fn try_lock<'a>(
        &'a self,
        locks: &'a SpinlockManager,
    ) -> Option<KernRef<'a, T>> {
        let token = locks.try_acquire(self.lock, TaskId::SYSTEM)?;
        Some(self.guard(locks, token))
    }

    fn guard<'a>(
        &'a self,
        locks: &'a SpinlockManager,
        token: SaveToken,
    ) -> KernRef<'a, T> {
        if !token.is_held() {
            // Kernel table locks are pinned, so they can't have left the
            // registry. If one has, handing out the contents would alias.
            crate::fail::die(format_args!(
                "kernel lock {} is not tracked",
                self.lock
            ));
        }
        KernRef {
            // Safety: we hold the lock, so this is the only reference.
            contents: unsafe { &mut *self.contents.get() },
            locks,
            lock: self.lock,
            token: Some(token),
        }
    }
}

pub(crate) struct KernRef<'a, T> {
    contents: &'a mut T,
    locks: &'a SpinlockManager,
    lock: LockId,
    token: Option<SaveToken>,
}

impl<T> Drop for KernRef<'_, T> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.locks.release(self.lock, token);
        }
    }
}

impl<T> Deref for KernRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.contents
    }
}

impl<T> DerefMut for KernRef<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.contents
    }
}
