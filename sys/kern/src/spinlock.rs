// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Spinlock manager.
//!
//! The manager owns the bank of hardware spinlocks and keeps a registry of
//! which ones are in use, by whom, and how long they've been held. Every
//! other part of the kernel (and every driver) gets its locks from here.
//!
//! # Phases
//!
//! Drivers may need a lock before the manager is fully up, so initialization
//! is staged:
//!
//! - `Core`: the manager claims one lock for its own registry. Nothing is
//!   tracked and nothing is logged.
//! - `Tracking`: locks taken early through `bootstrap_claim` are absorbed
//!   into the registry.
//! - `Full`: the kernel event log exists, and operations log.
//!
//! Code that came up early can register a `PhaseObserver` to hear about the
//! later transitions.
//!
//! # Locking
//!
//! The registry is guarded by the manager's own lock, taken directly from
//! the bank and only ever held for a field copy. It's the innermost lock in
//! the kernel: `acquire` and `release` take it while holding the lock being
//! tracked, and nothing takes another lock while holding it.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use abi::{InitPhase, LockId, SpinlockCategory, TaskId};
use enum_map::EnumMap;

use crate::arch;
use crate::atomic::AtomicExt;
use crate::config::{
    bounded_name, Name, LOG_DEPTH, PHASE_OBSERVERS, SPINLOCK_COUNT,
};
use crate::err::KernError;
use crate::hwlock::HwLockBank;
use crate::klog::{EventLog, KernEvent, LogEntry, NO_LOCK};
use crate::time::{Clock, Timestamp};

/// Proof of a spinlock acquisition, to be handed back to `release`.
///
/// Carries the interrupt state from before the acquisition. A token from an
/// acquire of an untracked lock holds nothing, and releasing it does nothing.
#[must_use]
#[derive(Debug)]
pub struct SaveToken {
    irq: Option<arch::IrqState>,
}

impl SaveToken {
    const UNTRACKED: Self = Self { irq: None };

    /// Checks whether this token actually represents a held lock.
    pub fn is_held(&self) -> bool {
        self.irq.is_some()
    }
}

/// Gets told when the spinlock manager changes phase.
pub trait PhaseObserver: Sync {
    fn phase_changed(&self, phase: InitPhase);
}

impl<F> PhaseObserver for F
where
    F: Fn(InitPhase) + Sync,
{
    fn phase_changed(&self, phase: InitPhase) {
        self(phase)
    }
}

/// Snapshot of one tracked lock.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LockInfo {
    pub id: LockId,
    pub category: SpinlockCategory,
    /// Task currently holding the lock; `SYSTEM` when free or held outside
    /// any task.
    pub owner: TaskId,
    /// Name of the component that allocated the lock.
    pub owner_name: Name,
    pub locked: bool,
    /// Held by the kernel for its own tables; can't be freed.
    pub pinned: bool,
    /// Absorbed from a bootstrap claim and not yet registered by its owner.
    pub provisional: bool,
    pub last_acquired: Timestamp,
    pub total_locked_us: u64,
    pub max_locked_us: u64,
    pub acquisitions: u32,
}

impl LockInfo {
    fn new(
        i: usize,
        category: SpinlockCategory,
        owner: &str,
        pinned: bool,
    ) -> Self {
        Self {
            id: LockId(i as u32),
            category,
            owner: TaskId::SYSTEM,
            owner_name: bounded_name(owner),
            locked: false,
            pinned,
            provisional: false,
            last_acquired: Timestamp::ZERO,
            total_locked_us: 0,
            max_locked_us: 0,
            acquisitions: 0,
        }
    }

    fn provisional(i: usize) -> Self {
        Self {
            provisional: true,
            ..Self::new(i, SpinlockCategory::Unused, "bootstrap", false)
        }
    }
}

/// How much `SpinlockManager::report` prints.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReportLevel {
    /// Totals and per-category counts.
    Summary,
    /// One table row per lock.
    Detailed,
    /// One short line per lock.
    Compact,
    /// The detailed table plus timing and flags.
    Wide,
}

struct Registry {
    entries: [Option<LockInfo>; SPINLOCK_COUNT],
    observers: heapless::Vec<&'static dyn PhaseObserver, PHASE_OBSERVERS>,
}

#[allow(clippy::declare_interior_mutable_const)]
const NOT_PENDING: AtomicBool = AtomicBool::new(false);

pub struct SpinlockManager {
    clock: &'static dyn Clock,
    bank: HwLockBank,
    phase: AtomicU8,
    /// Index of the registry's own lock, or `NO_LOCK` before phase `Core`.
    own_lock: AtomicU32,
    /// Bootstrap claims waiting to be absorbed into the registry.
    pending: [AtomicBool; SPINLOCK_COUNT],
    registry: UnsafeCell<Registry>,
    log: EventLog,
}

// Safety: `registry` is only touched through `RegistryRef`, which holds the
// manager's own lock, and the event log ring only under the log lock.
unsafe impl Sync for SpinlockManager {}

impl SpinlockManager {
    pub fn new(clock: &'static dyn Clock) -> Self {
        Self {
            clock,
            bank: HwLockBank::new(),
            phase: AtomicU8::new(InitPhase::Uninit as u8),
            own_lock: AtomicU32::new(NO_LOCK),
            pending: [NOT_PENDING; SPINLOCK_COUNT],
            registry: UnsafeCell::new(Registry {
                entries: core::array::from_fn(|_| None),
                observers: heapless::Vec::new(),
            }),
            log: EventLog::new(),
        }
    }

    pub fn clock(&self) -> &'static dyn Clock {
        self.clock
    }

    pub fn phase(&self) -> InitPhase {
        InitPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// The lock guarding the registry, once phase `Core` is reached.
    pub fn own_lock(&self) -> Option<LockId> {
        self.own_index().map(|i| LockId(i as u32))
    }

    fn own_index(&self) -> Option<usize> {
        match self.own_lock.load(Ordering::Acquire) {
            NO_LOCK => None,
            n => Some(n as usize),
        }
    }

    fn registry(&self) -> Result<RegistryRef<'_>, KernError> {
        let own = self.own_index().ok_or(KernError::NotReady)?;
        let irq = self.bank.lock(own);
        Ok(RegistryRef {
            mgr: self,
            own,
            irq,
        })
    }

    fn index(&self, id: LockId) -> Result<usize, KernError> {
        let i = id.index();
        if i < SPINLOCK_COUNT {
            Ok(i)
        } else {
            Err(KernError::NoSuchLock)
        }
    }

    fn tracked_index(&self, id: LockId) -> Option<usize> {
        let i = self.index(id).ok()?;
        let reg = self.registry().ok()?;
        reg.entries[i].as_ref().map(|_| i)
    }

    fn enter_phase(&self, phase: InitPhase) {
        self.phase.store(phase as u8, Ordering::Release);
        // Call observers with no locks held; they may well want to allocate.
        let observers = match self.registry() {
            Ok(reg) => reg.observers.clone(),
            Err(_) => heapless::Vec::new(),
        };
        for o in &observers {
            o.phase_changed(phase);
        }
    }

    /// Phase `Core`: claims the lock that protects the registry.
    pub fn init_core(&self) -> Result<LockId, KernError> {
        if self.phase() != InitPhase::Uninit {
            return Err(KernError::BadState);
        }
        let i = self.bank.claim_unused(None).ok_or(KernError::NoFreeLock)?;
        self.own_lock.store(i as u32, Ordering::Release);
        self.enter_phase(InitPhase::Core);
        Ok(LockId(i as u32))
    }

    /// Phase `Tracking`: absorbs outstanding bootstrap claims. Returns how
    /// many were absorbed.
    pub fn init_tracking(&self) -> Result<usize, KernError> {
        if self.phase() != InitPhase::Core {
            return Err(KernError::BadState);
        }
        let absorbed = self.absorb_pending()?;
        self.enter_phase(InitPhase::Tracking);
        Ok(absorbed)
    }

    /// Phase `Full`: sets up the kernel event log.
    pub fn init_full(&self) -> Result<(), KernError> {
        if self.phase() != InitPhase::Tracking {
            return Err(KernError::BadState);
        }
        let lock = self.allocate_pinned(SpinlockCategory::Logging, "klog")?;
        self.log.attach(lock);
        self.enter_phase(InitPhase::Full);
        klog!(self, KernEvent::Phase(InitPhase::Full));
        Ok(())
    }

    /// Walks through whatever phases remain up to `target`.
    pub fn advance_to(&self, target: InitPhase) -> Result<(), KernError> {
        while self.phase() < target {
            match self.phase() {
                InitPhase::Uninit => {
                    self.init_core()?;
                }
                InitPhase::Core => {
                    self.init_tracking()?;
                }
                InitPhase::Tracking | InitPhase::Full => {
                    self.init_full()?;
                }
            }
        }
        Ok(())
    }

    fn absorb_pending(&self) -> Result<usize, KernError> {
        let mut reg = self.registry()?;
        let mut absorbed = 0;
        for i in 0..SPINLOCK_COUNT {
            if self.pending[i].swap_polyfill(false, Ordering::AcqRel)
                && reg.entries[i].is_none()
            {
                reg.entries[i] = Some(LockInfo::provisional(i));
                absorbed += 1;
            }
        }
        Ok(absorbed)
    }

    /// Claims a raw lock without going through the registry.
    ///
    /// This works in any phase, including before `Core`. Unless
    /// `self_tracking` is set, the lock is remembered and absorbed into the
    /// registry at phase `Tracking` (or right away, if that has passed), where
    /// it shows as provisional until its owner calls `register_external`.
    pub fn bootstrap_claim(&self, self_tracking: bool) -> Result<LockId, KernError> {
        let i = self
            .bank
            .claim_unused(self.own_index())
            .ok_or(KernError::NoFreeLock)?;
        if !self_tracking {
            self.pending[i].store(true, Ordering::Release);
            if self.phase() >= InitPhase::Tracking {
                self.absorb_pending()?;
            }
        }
        Ok(LockId(i as u32))
    }

    /// Allocates a lock from the pool.
    pub fn allocate(
        &self,
        category: SpinlockCategory,
        owner: &str,
    ) -> Result<LockId, KernError> {
        self.allocate_inner(category, owner, false)
    }

    /// Allocates a lock that `free` will refuse to release.
    pub fn allocate_pinned(
        &self,
        category: SpinlockCategory,
        owner: &str,
    ) -> Result<LockId, KernError> {
        self.allocate_inner(category, owner, true)
    }

    fn allocate_inner(
        &self,
        category: SpinlockCategory,
        owner: &str,
        pinned: bool,
    ) -> Result<LockId, KernError> {
        if category == SpinlockCategory::Unused {
            return Err(KernError::ReservedCategory);
        }
        let found = {
            let mut reg = self.registry()?;
            let own = reg.own;
            let mut found = None;
            for i in 0..SPINLOCK_COUNT {
                if i == own || reg.entries[i].is_some() {
                    continue;
                }
                if self.bank.claim(i) {
                    reg.entries[i] =
                        Some(LockInfo::new(i, category, owner, pinned));
                    found = Some(i);
                    break;
                }
            }
            found
        };
        match found {
            Some(i) => Ok(LockId(i as u32)),
            None => {
                klog!(self, KernEvent::LockPoolExhausted(category));
                Err(KernError::NoFreeLock)
            }
        }
    }

    /// Adopts a lock obtained from `bootstrap_claim` into the registry.
    pub fn register_external(
        &self,
        id: LockId,
        category: SpinlockCategory,
        owner: &str,
    ) -> Result<(), KernError> {
        let i = self.index(id)?;
        if category == SpinlockCategory::Unused {
            return Err(KernError::ReservedCategory);
        }
        if Some(i) == self.own_index() {
            return Err(KernError::ReservedLock);
        }
        if !self.bank.is_claimed(i) {
            return Err(KernError::BadState);
        }
        {
            let mut reg = self.registry()?;
            if let Some(e) = &reg.entries[i] {
                if !e.provisional {
                    return Err(KernError::AlreadyTracked);
                }
            }
            reg.entries[i] = Some(LockInfo::new(i, category, owner, false));
        }
        self.pending[i].store(false, Ordering::Release);
        Ok(())
    }

    /// Spins until lock `id` is held, then records `task` as its owner.
    ///
    /// Acquiring a lock that isn't tracked does nothing and returns a token
    /// that holds nothing.
    pub fn acquire(&self, id: LockId, task: TaskId) -> SaveToken {
        let Some(i) = self.tracked_index(id) else {
            return SaveToken::UNTRACKED;
        };
        let irq = self.bank.lock(i);
        self.note_acquired(i, task);
        SaveToken { irq: Some(irq) }
    }

    /// Like `acquire`, but gives up at once if the lock is held. Also returns
    /// `None` for untracked locks.
    pub fn try_acquire(&self, id: LockId, task: TaskId) -> Option<SaveToken> {
        let i = self.tracked_index(id)?;
        let irq = self.bank.try_lock(i)?;
        self.note_acquired(i, task);
        Some(SaveToken { irq: Some(irq) })
    }

    fn note_acquired(&self, i: usize, task: TaskId) {
        // Stamp after the lock is ours, so held time doesn't include waiting
        // and a waiter can't overwrite the holder's stamp.
        let now = self.clock.now();
        if let Ok(mut reg) = self.registry() {
            if let Some(e) = reg.entries[i].as_mut() {
                e.owner = task;
                e.locked = true;
                e.last_acquired = now;
                e.acquisitions = e.acquisitions.wrapping_add(1);
            }
        }
    }

    /// Releases lock `id`, folding the hold into its statistics.
    pub fn release(&self, id: LockId, token: SaveToken) {
        let Some(irq) = token.irq else {
            return;
        };
        let Ok(i) = self.index(id) else {
            return;
        };
        let now = self.clock.now();
        if let Ok(mut reg) = self.registry() {
            if let Some(e) = reg.entries[i].as_mut() {
                let held = now.micros_since(e.last_acquired);
                e.total_locked_us = e.total_locked_us.saturating_add(held);
                e.max_locked_us = e.max_locked_us.max(held);
                e.locked = false;
                e.owner = TaskId::SYSTEM;
            }
        }
        self.bank.unlock(i, irq);
    }

    /// Removes a lock from the registry and returns it to the pool.
    ///
    /// A lock somebody is holding can't be freed.
    pub fn free(&self, id: LockId) -> Result<(), KernError> {
        let i = self.index(id)?;
        if Some(i) == self.own_index() {
            return Err(KernError::ReservedLock);
        }
        let mut reg = self.registry()?;
        match &reg.entries[i] {
            None => Err(KernError::LockNotTracked),
            Some(e) if e.pinned => Err(KernError::PinnedLock),
            Some(e) if e.locked || self.bank.is_locked(i) => {
                Err(KernError::BadState)
            }
            Some(_) => {
                reg.entries[i] = None;
                self.bank.unclaim(i);
                Ok(())
            }
        }
    }

    /// Clears `task` as owner of any lock it holds, for task teardown.
    ///
    /// The hardware locks themselves stay as they are; this only keeps a dead
    /// task from showing up as an owner. Each one found is logged, since a
    /// task that ends holding a lock is almost certainly buggy. Returns the
    /// number found.
    pub fn release_by_task(&self, task: TaskId) -> usize {
        if task.is_system() {
            return 0;
        }
        let mut leaked: heapless::Vec<LockId, SPINLOCK_COUNT> =
            heapless::Vec::new();
        if let Ok(mut reg) = self.registry() {
            for e in reg.entries.iter_mut().flatten() {
                if e.owner == task {
                    e.owner = TaskId::SYSTEM;
                    // Can't overflow; there are only SPINLOCK_COUNT entries.
                    let _ = leaked.push(e.id);
                }
            }
        }
        for &lock in &leaked {
            klog!(self, KernEvent::LockLeaked { lock, task });
        }
        leaked.len()
    }

    pub fn is_tracked(&self, id: LockId) -> bool {
        self.tracked_index(id).is_some()
    }

    pub fn get_info(&self, id: LockId) -> Option<LockInfo> {
        let i = self.index(id).ok()?;
        let reg = self.registry().ok()?;
        reg.entries[i].clone()
    }

    pub fn count_by_category(&self, category: SpinlockCategory) -> usize {
        self.category_counts()[category]
    }

    pub fn category_counts(&self) -> EnumMap<SpinlockCategory, usize> {
        let mut counts = EnumMap::default();
        if let Ok(reg) = self.registry() {
            for e in reg.entries.iter().flatten() {
                counts[e.category] += 1;
            }
        }
        counts
    }

    /// Number of tracked locks, not counting the manager's own.
    pub fn total_allocated(&self) -> usize {
        match self.registry() {
            Ok(reg) => reg.entries.iter().flatten().count(),
            Err(_) => 0,
        }
    }

    /// Copies out every tracked lock, in ID order.
    pub fn snapshot(&self) -> heapless::Vec<LockInfo, SPINLOCK_COUNT> {
        let mut out = heapless::Vec::new();
        if let Ok(reg) = self.registry() {
            for e in reg.entries.iter().flatten() {
                let _ = out.push(e.clone());
            }
        }
        out
    }

    /// Adds an observer for future phase changes. Returns the current phase,
    /// since transitions already made won't be replayed.
    pub fn register_phase_observer(
        &self,
        observer: &'static dyn PhaseObserver,
    ) -> Result<InitPhase, KernError> {
        let mut reg = self.registry()?;
        reg.observers
            .push(observer)
            .map_err(|_| KernError::TooManyObservers)?;
        Ok(self.phase())
    }

    /// Appends an event to the kernel log. Dropped before phase `Full`.
    pub(crate) fn record(&self, line: u16, event: KernEvent) {
        if self.phase() < InitPhase::Full {
            return;
        }
        let Some(lock) = self.log.lock_id() else {
            return;
        };
        let token = self.acquire(lock, TaskId::SYSTEM);
        if token.is_held() {
            // Safety: we hold the log lock.
            unsafe { self.log.ring() }.entry(line, event);
        }
        self.release(lock, token);
    }

    /// Copies out the event log, oldest first.
    pub fn log_entries(&self) -> heapless::Vec<LogEntry<KernEvent>, LOG_DEPTH> {
        let mut out = heapless::Vec::new();
        let Some(lock) = self.log.lock_id() else {
            return out;
        };
        let token = self.acquire(lock, TaskId::SYSTEM);
        if token.is_held() {
            // Safety: we hold the log lock.
            for e in unsafe { self.log.ring() }.iter() {
                let _ = out.push(*e);
            }
        }
        self.release(lock, token);
        out
    }

    /// Writes a human-readable usage report.
    pub fn report(
        &self,
        level: ReportLevel,
        out: &mut dyn fmt::Write,
    ) -> fmt::Result {
        let locks = self.snapshot();
        match level {
            ReportLevel::Summary => {
                writeln!(
                    out,
                    "spinlocks: {} of {} tracked, phase {:?}",
                    locks.len(),
                    SPINLOCK_COUNT,
                    self.phase()
                )?;
                let mut counts: EnumMap<SpinlockCategory, usize> =
                    EnumMap::default();
                for l in &locks {
                    counts[l.category] += 1;
                }
                for (category, n) in counts.iter() {
                    if *n != 0 {
                        writeln!(out, "  {:<10} {}", category.name(), n)?;
                    }
                }
                let held = locks.iter().filter(|l| l.locked).count();
                writeln!(out, "  held now: {held}")?;
            }
            ReportLevel::Compact => {
                for l in &locks {
                    writeln!(
                        out,
                        "{}:{}:{}{}",
                        l.id,
                        l.category.name(),
                        l.owner_name,
                        if l.locked { " *" } else { "" }
                    )?;
                }
            }
            ReportLevel::Detailed | ReportLevel::Wide => {
                let wide = level == ReportLevel::Wide;
                write!(
                    out,
                    "{:>3} {:<10} {:<24} {:>5} {:>8} {:>10} {:>8}",
                    "ID", "CATEGORY", "OWNER", "TASK", "ACQS", "TOTAL_US", "MAX_US"
                )?;
                if wide {
                    write!(out, " {:>8} {:>12} FLAGS", "AVG_US", "LAST_US")?;
                }
                writeln!(out)?;
                for l in &locks {
                    write!(
                        out,
                        "{:>3} {:<10} {:<24} {:>5} {:>8} {:>10} {:>8}",
                        l.id,
                        l.category.name(),
                        l.owner_name,
                        l.owner,
                        l.acquisitions,
                        l.total_locked_us,
                        l.max_locked_us,
                    )?;
                    if wide {
                        let avg = if l.acquisitions == 0 {
                            0
                        } else {
                            l.total_locked_us / u64::from(l.acquisitions)
                        };
                        write!(
                            out,
                            " {:>8} {:>12} {}{}{}",
                            avg,
                            l.last_acquired.as_micros(),
                            if l.locked { "L" } else { "-" },
                            if l.pinned { "P" } else { "-" },
                            if l.provisional { "B" } else { "-" },
                        )?;
                    }
                    writeln!(out)?;
                }
            }
        }
        Ok(())
    }
}

/// Access to the registry, holding the manager's own lock.
struct RegistryRef<'a> {
    mgr: &'a SpinlockManager,
    own: usize,
    irq: arch::IrqState,
}

impl Drop for RegistryRef<'_> {
    fn drop(&mut self) {
        self.mgr.bank.unlock(self.own, self.irq);
    }
}

impl Deref for RegistryRef<'_> {
    type Target = Registry;

    fn deref(&self) -> &Registry {
        // Safety: we hold the registry lock.
        unsafe { &*self.mgr.registry.get() }
    }
}

impl DerefMut for RegistryRef<'_> {
    fn deref_mut(&mut self) -> &mut Registry {
        // Safety: we hold the registry lock, and `&mut self` makes this the
        // only reference derived from this guard.
        unsafe { &mut *self.mgr.registry.get() }
    }
}
