// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel online profiling support.
//!
//! This is intended to help measure the timing of task dispatch, tick
//! handling and faults, as an aid to debugging or optimization work.
//!
//! The kernel does not assume any particular way of getting profiling
//! information out. Instead, a board that wants profiling populates an
//! `EventsTable` and hands it to `Kernel::configure_events_table`. Hooks fire
//! only while tracing is enabled (`Scheduler::enable_tracing`).
//!
//! A typical implementation would implement these event handling functions by
//! setting or clearing GPIOs on the processor package, where they can be
//! monitored and examined by an external logic analyzer. Other implementations
//! are of course possible, but be careful of probe effect and keep the handler
//! functions fast.

use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use abi::{CoreId, FaultKind, TaskId};

/// Hooks that must be provided by the board setup code if it wants to enable
/// kernel profiling.
///
/// If you provide an `EventsTable`, you have to provide every hook. To skip
/// one, give it an empty function:
///
/// ```ignore
///   timer_tick: || (),
/// ```
pub struct EventsTable {
    /// Called just before a task's entry point runs.
    pub task_enter: fn(CoreId, TaskId),
    /// Called just after a task's entry point returns.
    pub task_exit: fn(CoreId, TaskId),
    /// Called when a core starts running a different task than it last ran.
    pub context_switch: fn(CoreId, TaskId),
    /// Called on each scheduler tick.
    pub timer_tick: fn(),
    /// Called when a fault is reported, before recovery is attempted.
    pub fault: fn(FaultKind, TaskId),
}

/// Per-kernel profiling state.
pub(crate) struct Profiling {
    /// If null, no event table has been provided.
    ///
    /// Any non-null pointed-to table is guaranteed (by the other code in this
    /// module) to have static scope.
    ///
    /// Note: all accesses to this atomic value use `Relaxed` ordering, because
    /// we expect it to get written once at startup and then read many times,
    /// and memory barriers have non-zero cost.
    table: AtomicPtr<EventsTable>,
    enabled: AtomicBool,
}

impl Profiling {
    pub(crate) const fn new() -> Self {
        Self {
            table: AtomicPtr::new(core::ptr::null_mut()),
            enabled: AtomicBool::new(false),
        }
    }

    pub(crate) fn configure(&self, table: &'static EventsTable) {
        self.table
            .store(table as *const _ as *mut _, Ordering::Relaxed);
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Grabs a reference to the configured table, if any, while tracing is
    /// on.
    fn table(&self) -> Option<&'static EventsTable> {
        if !self.is_enabled() {
            return None;
        }
        let p = self.table.load(Ordering::Relaxed);
        // We only write this pointer from a valid `&'static`, and we're
        // handing out a shared reference, so this should be ok...
        unsafe { p.as_ref() }
    }

    pub(crate) fn task_enter(&self, core: CoreId, task: TaskId) {
        if let Some(t) = self.table() {
            (t.task_enter)(core, task)
        }
    }

    pub(crate) fn task_exit(&self, core: CoreId, task: TaskId) {
        if let Some(t) = self.table() {
            (t.task_exit)(core, task)
        }
    }

    pub(crate) fn context_switch(&self, core: CoreId, task: TaskId) {
        if let Some(t) = self.table() {
            (t.context_switch)(core, task)
        }
    }

    pub(crate) fn timer_tick(&self) {
        if let Some(t) = self.table() {
            (t.timer_tick)()
        }
    }

    pub(crate) fn fault(&self, kind: FaultKind, task: TaskId) {
        if let Some(t) = self.table() {
            (t.fault)(kind, task)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    static TICKS: AtomicU32 = AtomicU32::new(0);

    fn count_tick() {
        TICKS.fetch_add(1, Ordering::SeqCst);
    }

    static TABLE: EventsTable = EventsTable {
        task_enter: |_, _| (),
        task_exit: |_, _| (),
        context_switch: |_, _| (),
        timer_tick: count_tick,
        fault: |_, _| (),
    };

    #[test]
    fn hooks_fire_only_when_enabled() {
        let p = Profiling::new();
        p.configure(&TABLE);
        p.timer_tick();
        assert_eq!(TICKS.load(Ordering::SeqCst), 0);
        p.set_enabled(true);
        p.timer_tick();
        p.timer_tick();
        assert_eq!(TICKS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn no_table_no_hooks() {
        let p = Profiling::new();
        p.set_enabled(true);
        p.task_enter(CoreId::Core0, TaskId(1));
        p.fault(FaultKind::Unknown, TaskId(1));
    }
}
