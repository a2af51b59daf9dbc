// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! All kernel state lives in a `Kernel`, which board code builds once and
//! then shares between the two cores (usually by putting it in a `static`).
//! Construction brings the spinlock manager up to phase `Full` and takes the
//! pinned locks that guard the kernel's own tables. After that, everything is
//! reached through borrowed handles:
//!
//! ```ignore
//! let id = kernel.scheduler().create_task(TaskParams::new("poll", &poll))?;
//! kernel.mpu().enable_protection(id, true)?;
//! ```

use abi::{CoreId, InitPhase, SpinlockCategory};

use crate::config::KernelOptions;
use crate::err::KernError;
use crate::fault::{FaultTables, Faults};
use crate::mpu::{Mpu, MpuTables};
use crate::profiling::{EventsTable, Profiling};
use crate::sched::{SchedTables, Scheduler};
use crate::security::{Security, SecurityTables};
use crate::spinlock::SpinlockManager;
use crate::time::Clock;

pub struct Kernel {
    pub(crate) clock: &'static dyn Clock,
    pub(crate) locks: SpinlockManager,
    pub(crate) sched_tables: SchedTables,
    pub(crate) mpu_tables: MpuTables,
    pub(crate) security_tables: SecurityTables,
    pub(crate) fault_tables: FaultTables,
    pub(crate) profiling: Profiling,
    options: KernelOptions,
}

impl Kernel {
    /// Builds a kernel around a fresh spinlock manager.
    pub fn new(
        clock: &'static dyn Clock,
        options: KernelOptions,
    ) -> Result<Self, KernError> {
        Self::with_spinlocks(SpinlockManager::new(clock), options)
    }

    /// Builds a kernel around a spinlock manager that early boot code has
    /// already been using, e.g. to `bootstrap_claim` driver locks. The
    /// manager is taken through whatever phases it hasn't reached yet.
    pub fn with_spinlocks(
        locks: SpinlockManager,
        options: KernelOptions,
    ) -> Result<Self, KernError> {
        locks.advance_to(InitPhase::Full)?;

        let tasks = locks.allocate_pinned(SpinlockCategory::Scheduler, "tasks")?;
        let sched = locks.allocate_pinned(SpinlockCategory::Scheduler, "sched")?;
        let mpu = locks.allocate_pinned(SpinlockCategory::Memory, "mpu")?;
        let security = locks.allocate_pinned(SpinlockCategory::Memory, "security")?;
        let faults = locks.allocate_pinned(SpinlockCategory::Fault, "faults")?;

        let kernel = Self {
            clock: locks.clock(),
            sched_tables: SchedTables::new(tasks, sched),
            mpu_tables: MpuTables::new(mpu, options.mpu_enabled),
            security_tables: SecurityTables::new(
                security,
                options.security_enabled,
            ),
            fault_tables: FaultTables::new(faults),
            profiling: Profiling::new(),
            locks,
            options,
        };

        // Core 1's hardware gets programmed again when it enters `run_core`;
        // this gets both shadows into a known state.
        for core in CoreId::ALL {
            kernel.mpu().init_core(core);
        }
        Ok(kernel)
    }

    pub fn clock(&self) -> &'static dyn Clock {
        self.clock
    }

    pub fn options(&self) -> &KernelOptions {
        &self.options
    }

    pub fn spinlocks(&self) -> &SpinlockManager {
        &self.locks
    }

    pub fn scheduler(&self) -> Scheduler<'_> {
        Scheduler::new(self)
    }

    pub fn mpu(&self) -> Mpu<'_> {
        Mpu::new(self)
    }

    pub fn security(&self) -> Security<'_> {
        Security::new(self)
    }

    pub fn faults(&self) -> Faults<'_> {
        Faults::new(self)
    }

    /// Installs profiling hooks. They fire while tracing is enabled.
    pub fn configure_events_table(&self, table: &'static EventsTable) {
        self.profiling.configure(table);
    }
}
