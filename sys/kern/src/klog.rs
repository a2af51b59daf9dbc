// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel event log.
//!
//! The kernel records noteworthy events into a fixed-depth ring of typed
//! entries. Each entry carries the source line that recorded it, a generation
//! number for its slot, and a repeat count: recording the same event from the
//! same line as the most recent entry bumps that entry's count instead of
//! using a new slot.
//!
//! The log lives inside the spinlock manager and is guarded by a
//! `Logging`-category lock that the manager allocates when it reaches phase
//! FULL. Events recorded before then are dropped. Use the `klog!` macro, which
//! fills in the line number:
//!
//! ```ignore
//! klog!(kernel.locks, KernEvent::TaskDeleted(id));
//! ```

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use abi::{
    CoreId, FaultKind, InitPhase, LockId, SecurityState, SpinlockCategory,
    TaskId,
};

use crate::config::LOG_DEPTH;
use crate::err::KernError;

macro_rules! klog {
    ($locks:expr, $event:expr) => {
        $locks.record(line!() as u16, $event)
    };
}

/// Things the kernel logs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernEvent {
    Phase(InitPhase),
    LockPoolExhausted(SpinlockCategory),
    /// A task ended while still owning a lock.
    LockLeaked {
        lock: LockId,
        task: TaskId,
    },
    TaskCreated {
        task: TaskId,
        core: CoreId,
    },
    TaskTableFull(CoreId),
    /// A new task's default protection couldn't be installed, so the task
    /// was not created.
    DefaultProtectionFailed {
        task: TaskId,
        err: KernError,
    },
    TaskDeleted(TaskId),
    TaskSuspended(TaskId),
    TaskResumed(TaskId),
    /// Only recorded while tracing is on.
    Dispatch {
        core: CoreId,
        task: TaskId,
    },
    DeadlineMiss {
        task: TaskId,
        late_us: u64,
    },
    BudgetOverrun {
        task: TaskId,
        used_us: u64,
    },
    /// The tick found the task list busy and did nothing.
    TickSkipped,
    /// A task had more regions than the MPU has dynamic slots.
    RegionsTruncated {
        task: TaskId,
        dropped: u8,
    },
    SecurityTransition {
        core: CoreId,
        task: TaskId,
        from: SecurityState,
        to: SecurityState,
    },
    Fault {
        task: TaskId,
        kind: FaultKind,
        address: u32,
    },
    FaultTableFull(FaultKind),
    FaultRecovered(TaskId),
    FaultEscalated {
        task: TaskId,
        kind: FaultKind,
    },
}

/// One log entry. When an entry is recorded with the same `line` and
/// `payload` as the most recent one, `count` is incremented rather than
/// generating a new entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LogEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of `N` entries.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [Option<LogEntry<T>>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new() -> Self {
        Self {
            last: None,
            buffer: [None; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // Treat "nothing recorded yet" as an out-of-range index, so that the
        // first entry lands in slot 0 and is never merged.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(Some(ent)) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                // Only reuse this entry if we don't overflow the count.
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= N {
                0
            } else {
                last_plus_1
            }
        };

        let generation = match &self.buffer[ndx] {
            Some(old) => old.generation.wrapping_add(1),
            None => 0,
        };
        self.buffer[ndx] = Some(LogEntry {
            line,
            generation,
            count: 1,
            payload,
        });
        self.last = Some(ndx);
    }

    /// Iterates over entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry<T>> + '_ {
        let start = match self.last {
            Some(last) => last + 1,
            None => 0,
        };
        (0..N)
            .map(move |i| (start + i) % N)
            .filter_map(move |i| self.buffer[i].as_ref())
    }

    pub fn last(&self) -> Option<&LogEntry<T>> {
        self.last.and_then(|i| self.buffer[i].as_ref())
    }
}

impl<T: Copy + PartialEq, const N: usize> Default for Ringbuf<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) const NO_LOCK: u32 = u32::MAX;

/// Storage for the kernel log, plus the ID of the lock that guards it.
pub(crate) struct EventLog {
    lock: AtomicU32,
    ring: UnsafeCell<Ringbuf<KernEvent, LOG_DEPTH>>,
}

impl EventLog {
    pub(crate) const fn new() -> Self {
        Self {
            lock: AtomicU32::new(NO_LOCK),
            ring: UnsafeCell::new(Ringbuf::new()),
        }
    }

    pub(crate) fn attach(&self, lock: LockId) {
        self.lock.store(lock.0, Ordering::Release);
    }

    pub(crate) fn lock_id(&self) -> Option<LockId> {
        match self.lock.load(Ordering::Acquire) {
            NO_LOCK => None,
            n => Some(LockId(n)),
        }
    }

    /// # Safety
    ///
    /// The caller must hold the lock named by `lock_id`, for as long as the
    /// returned reference lives.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn ring(&self) -> &mut Ringbuf<KernEvent, LOG_DEPTH> {
        unsafe { &mut *self.ring.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_consecutive_entries_coalesce() {
        let mut rb: Ringbuf<u8, 4> = Ringbuf::new();
        rb.entry(10, 1);
        rb.entry(10, 1);
        rb.entry(10, 1);
        rb.entry(11, 1);
        let entries: Vec<_> = rb.iter().copied().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].count, 3);
        assert_eq!(entries[1].line, 11);
        assert_eq!(entries[1].count, 1);
    }

    #[test]
    fn wraps_and_bumps_generation() {
        let mut rb: Ringbuf<u8, 3> = Ringbuf::new();
        for i in 0..5 {
            rb.entry(1, i);
        }
        let payloads: Vec<u8> = rb.iter().map(|e| e.payload).collect();
        assert_eq!(payloads, [2, 3, 4]);
        // Slots 0 and 1 have been written twice.
        let gens: Vec<u16> = rb.iter().map(|e| e.generation).collect();
        assert_eq!(gens, [0, 1, 1]);
        assert_eq!(rb.last().map(|e| e.payload), Some(4));
    }

    #[test]
    fn empty_ring_iterates_nothing() {
        let rb: Ringbuf<u8, 3> = Ringbuf::new();
        assert_eq!(rb.iter().count(), 0);
        assert!(rb.last().is_none());
    }
}
