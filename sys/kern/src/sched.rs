// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dual-core scheduler.
//!
//! Each core has a fixed table of task slots. A task pinned to a core lives in
//! that core's table; a task that may run anywhere lives in core 0's table and
//! core 1 picks it up when it has nothing of its own.
//!
//! Cores drive themselves: `run_core` loops over `schedule_once`, which picks
//! a task, switches protection over to it, calls it, and does the accounting
//! when it returns. A task invocation is never interrupted by the scheduler.
//! What the periodic `tick` does is push a running persistent task back to
//! `Ready`, so that the next pass is free to pick someone else.
//!
//! # Locking
//!
//! Task tables are behind one lock and statistics behind another. Neither is
//! held while the other is taken, nor while calling into the MPU or security
//! configurators, nor while a task runs. The tick only ever tries the task
//! lock: it can land on a core that is in the middle of a scheduling pass, and
//! spinning there would never end.
//!
//! The per-core current task is an atomic that the owning core writes and
//! anyone may read without a lock. A reader can see a stale value, never a
//! torn one.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use abi::{
    CoreId, DeadlineKind, FaultKind, LockId, Priority, SecurityState, TaskId,
    TaskKind, TaskState, NUM_CORES,
};
use enum_map::EnumMap;

use crate::arch;
use crate::cell::{KernCell, KernRef};
use crate::config::{stack_slot_base, FLASH_BASE, FLASH_SIZE, TASKS_PER_CORE};
use crate::err::KernError;
use crate::klog::KernEvent;
use crate::startup::Kernel;
use crate::task::{
    priority_scan, DeadlineInfo, DeadlineMiss, DeadlineMissHandler, Runnable,
    TaskContext, TaskInfo, TaskParams, Tcb,
};
use crate::time::Timestamp;

/// Task slots across both cores.
pub const MAX_TASKS: usize = TASKS_PER_CORE * NUM_CORES;

/// Raw value of `current` when a core is running nothing.
const NO_TASK: u32 = 0;

pub(crate) struct TaskList {
    tables: EnumMap<CoreId, [Tcb; TASKS_PER_CORE]>,
    next_id: u32,
    /// Round-robin position for each (scanning core, table) pair.
    last: [[usize; NUM_CORES]; NUM_CORES],
}

impl TaskList {
    fn new() -> Self {
        Self {
            tables: EnumMap::from_fn(|_| {
                core::array::from_fn(|_| Tcb::empty())
            }),
            next_id: 1,
            last: [[TASKS_PER_CORE - 1; NUM_CORES]; NUM_CORES],
        }
    }

    fn find(&self, id: TaskId) -> Option<(CoreId, usize)> {
        if id.is_system() {
            return None;
        }
        CoreId::ALL.into_iter().find_map(|core| {
            self.tables[core]
                .iter()
                .position(|t| t.is(id))
                .map(|slot| (core, slot))
        })
    }

    fn get_mut(&mut self, id: TaskId) -> Option<&mut Tcb> {
        let (core, slot) = self.find(id)?;
        Some(&mut self.tables[core][slot])
    }

    /// Picks the task `core` should run next, as (table, slot).
    fn select(&mut self, core: CoreId, now: Timestamp) -> Option<(CoreId, usize)> {
        let other = core.other();

        // Hard deadlines that are about to be missed go first, whatever
        // their priority relative to everything else.
        let mut urgent: Option<(CoreId, usize, Priority)> = None;
        for table in [core, other] {
            for (slot, t) in self.tables[table].iter().enumerate() {
                if !t.is_dispatchable_on(core) || !t.deadline.is_urgent(now) {
                    continue;
                }
                if urgent.map_or(true, |(_, _, p)| t.priority.is_more_important_than(p)) {
                    urgent = Some((table, slot, t.priority));
                }
            }
        }
        if let Some((table, slot, _)) = urgent {
            return Some((table, slot));
        }

        // Tasks in another core's table that `core` may run are exactly the
        // ones with `Any` affinity, so one predicate serves both passes.
        for table in [core, other] {
            let last = self.last[core.index()][table.index()];
            if let Some(slot) = priority_scan(last, &self.tables[table], |t| {
                t.is_dispatchable_on(core)
            }) {
                self.last[core.index()][table.index()] = slot;
                return Some((table, slot));
            }
        }
        None
    }
}

/// Scheduler counters, from `Scheduler::stats`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SchedStats {
    /// Dispatches of a different task than the core ran last.
    pub context_switches: u64,
    pub core_switches: [u64; NUM_CORES],
    pub last_task: [Option<TaskId>; NUM_CORES],
    pub tasks_created: u32,
    pub tasks_deleted: u32,
    pub ticks: u64,
    /// Ticks that found the task list busy.
    pub ticks_skipped: u64,
    pub deadline_misses: u32,
    pub budget_overruns: u32,
    /// Time spent inside task entry points, per core.
    pub busy_us: [u64; NUM_CORES],
    /// Time the scheduler has been running, including the current run.
    pub runtime_us: u64,
}

pub(crate) struct SchedState {
    stats: SchedStats,
    started_at: Option<Timestamp>,
}

pub(crate) struct SchedTables {
    tasks: KernCell<TaskList>,
    state: KernCell<SchedState>,
    current: [AtomicU32; NUM_CORES],
    running: AtomicBool,
    core1_started: AtomicBool,
}

impl SchedTables {
    pub(crate) fn new(tasks_lock: LockId, state_lock: LockId) -> Self {
        Self {
            tasks: KernCell::new(tasks_lock, TaskList::new()),
            state: KernCell::new(
                state_lock,
                SchedState {
                    stats: SchedStats::default(),
                    started_at: None,
                },
            ),
            current: [AtomicU32::new(NO_TASK), AtomicU32::new(NO_TASK)],
            running: AtomicBool::new(false),
            core1_started: AtomicBool::new(false),
        }
    }
}

/// A task picked for dispatch.
struct Dispatch {
    id: TaskId,
    entry: &'static dyn Runnable,
    table: CoreId,
    slot: usize,
}

/// What a finished invocation left behind.
struct Completion {
    state: TaskState,
    miss: Option<DeadlineMiss>,
    miss_handler: Option<&'static dyn DeadlineMissHandler>,
    overrun_us: Option<u64>,
}

/// Handle on the scheduler of a `Kernel`.
pub struct Scheduler<'a> {
    kernel: &'a Kernel,
}

impl<'a> Scheduler<'a> {
    pub(crate) fn new(kernel: &'a Kernel) -> Self {
        Self { kernel }
    }

    fn tables(&self) -> &'a SchedTables {
        &self.kernel.sched_tables
    }

    fn tasks(&self) -> KernRef<'a, TaskList> {
        self.tables().tasks.lock(&self.kernel.locks)
    }

    fn state(&self) -> KernRef<'a, SchedState> {
        self.tables().state.lock(&self.kernel.locks)
    }

    /// Creates a task and makes it `Ready`.
    ///
    /// With MPU protection on, the task is given a default region set
    /// covering its stack slot and flash; if that can't be built, the task
    /// is not created.
    pub fn create_task(&self, params: TaskParams) -> Result<TaskId, KernError> {
        let k = self.kernel;
        let home = params.affinity.home_core();

        let reserved = {
            let mut list = self.tasks();
            let list = &mut *list;
            match list.tables[home].iter().position(Tcb::is_free) {
                Some(slot) => {
                    let id = TaskId(list.next_id);
                    list.next_id += 1;
                    // Blocked until protection is in place, so nobody runs it
                    // early.
                    list.tables[home][slot] = Tcb {
                        id,
                        name: params.name,
                        entry: Some(params.entry),
                        priority: params.priority,
                        kind: params.kind,
                        affinity: params.affinity,
                        state: TaskState::Blocked,
                        stack_base: stack_slot_base(home, slot),
                        stack_size: params.stack_size,
                        ..Tcb::empty()
                    };
                    Some((id, slot))
                }
                None => None,
            }
        };
        let Some((id, slot)) = reserved else {
            klog!(k.locks, KernEvent::TaskTableFull(home));
            return Err(KernError::NoFreeTaskSlot);
        };

        if k.mpu().is_enabled() {
            let mpu = k.mpu();
            let protected = mpu
                .create_default_config(
                    id,
                    stack_slot_base(home, slot),
                    params.stack_size,
                    Some(FLASH_BASE),
                    FLASH_SIZE,
                )
                .and_then(|config| mpu.configure_task(&config));
            if let Err(err) = protected {
                {
                    let mut list = self.tasks();
                    let t = &mut list.tables[home][slot];
                    if t.is(id) {
                        *t = Tcb {
                            id,
                            ..Tcb::empty()
                        };
                    }
                }
                mpu.forget_task(id);
                klog!(k.locks, KernEvent::DefaultProtectionFailed { task: id, err });
                return Err(err);
            }
        }

        {
            let mut list = self.tasks();
            let t = &mut list.tables[home][slot];
            // Somebody may have deleted or suspended it in the meantime.
            if t.is(id) && t.state == TaskState::Blocked {
                t.state = TaskState::Ready;
            }
        }
        {
            let mut st = self.state();
            st.stats.tasks_created = st.stats.tasks_created.wrapping_add(1);
        }
        klog!(k.locks, KernEvent::TaskCreated { task: id, core: home });
        Ok(id)
    }

    /// Ends a task. Its slot becomes free once no core is executing it, and
    /// its ID is never handed out again.
    ///
    /// Any locks the task still owns are disowned (but not released), and
    /// its protection state is dropped.
    pub fn delete_task(&self, task: TaskId) -> Result<(), KernError> {
        let k = self.kernel;
        {
            let mut list = self.tasks();
            let t = list.get_mut(task).ok_or(KernError::NoSuchTask)?;
            *t = Tcb {
                id: task,
                executing: t.executing,
                ..Tcb::empty()
            };
        }
        k.locks.release_by_task(task);
        k.mpu().forget_task(task);
        k.security().forget_task(task);
        {
            let mut st = self.state();
            st.stats.tasks_deleted = st.stats.tasks_deleted.wrapping_add(1);
        }
        klog!(k.locks, KernEvent::TaskDeleted(task));
        Ok(())
    }

    /// Takes a task out of scheduling until `resume_task`. A task that is
    /// running finishes its current invocation first.
    pub fn suspend_task(&self, task: TaskId) -> Result<(), KernError> {
        {
            let mut list = self.tasks();
            let t = list.get_mut(task).ok_or(KernError::NoSuchTask)?;
            match t.state {
                TaskState::Ready | TaskState::Running | TaskState::Blocked => {
                    t.state = TaskState::Suspended;
                }
                _ => return Err(KernError::BadState),
            }
        }
        klog!(self.kernel.locks, KernEvent::TaskSuspended(task));
        Ok(())
    }

    pub fn resume_task(&self, task: TaskId) -> Result<(), KernError> {
        {
            let mut list = self.tasks();
            let t = list.get_mut(task).ok_or(KernError::NoSuchTask)?;
            if t.state != TaskState::Suspended {
                return Err(KernError::BadState);
            }
            t.state = TaskState::Ready;
        }
        klog!(self.kernel.locks, KernEvent::TaskResumed(task));
        Ok(())
    }

    /// Runs one scheduling pass on `core`, which must be the calling core.
    /// Returns the task that ran, if there was one to run.
    pub fn schedule_once(&self, core: CoreId) -> Option<TaskId> {
        let k = self.kernel;
        let now = k.clock.now();

        let d = {
            let mut list = self.tasks();
            let (table, slot) = list.select(core, now)?;
            let t = &mut list.tables[table][slot];
            let entry = t.entry?;
            t.state = TaskState::Running;
            t.executing = Some(core);
            Dispatch {
                id: t.id,
                entry,
                table,
                slot,
            }
        };
        self.tables().current[core.index()].store(d.id.0, Ordering::Relaxed);

        let switched = {
            let mut st = self.state();
            let s = &mut st.stats;
            let switched = s.last_task[core.index()] != Some(d.id);
            if switched {
                s.context_switches = s.context_switches.wrapping_add(1);
                s.core_switches[core.index()] =
                    s.core_switches[core.index()].wrapping_add(1);
                s.last_task[core.index()] = Some(d.id);
            }
            switched
        };
        if switched {
            k.profiling.context_switch(core, d.id);
        }
        if k.profiling.is_enabled() {
            klog!(k.locks, KernEvent::Dispatch { core, task: d.id });
        }

        k.mpu().apply_task_settings(core, d.id);
        k.security().apply_task_settings(core, d.id);

        k.profiling.task_enter(core, d.id);
        let start = k.clock.now();
        d.entry.run(&TaskContext::new(k, d.id, core));
        let end = k.clock.now();
        k.profiling.task_exit(core, d.id);

        let done = self.complete(&d, start, end);
        {
            let mut st = self.state();
            let s = &mut st.stats;
            s.busy_us[core.index()] =
                s.busy_us[core.index()].saturating_add(end.micros_since(start));
            if let Some(done) = &done {
                if done.miss.is_some() {
                    s.deadline_misses = s.deadline_misses.wrapping_add(1);
                }
                if done.overrun_us.is_some() {
                    s.budget_overruns = s.budget_overruns.wrapping_add(1);
                }
            }
        }

        if let Some(done) = done {
            if let Some(used_us) = done.overrun_us {
                klog!(k.locks, KernEvent::BudgetOverrun { task: d.id, used_us });
            }
            if let Some(miss) = done.miss {
                klog!(
                    k.locks,
                    KernEvent::DeadlineMiss {
                        task: d.id,
                        late_us: miss.late_us
                    }
                );
                if let Some(handler) = done.miss_handler {
                    handler.deadline_missed(&miss);
                }
            }
            if done.state == TaskState::Completed {
                k.mpu().reset_task_settings(core, d.id);
                k.security().reset_task_settings(core, d.id);
            }
        }

        self.tables().current[core.index()].store(NO_TASK, Ordering::Relaxed);
        Some(d.id)
    }

    /// Post-run bookkeeping. Returns `None` if the task was deleted while it
    /// ran.
    fn complete(
        &self,
        d: &Dispatch,
        start: Timestamp,
        end: Timestamp,
    ) -> Option<Completion> {
        let mut list = self.tasks();
        let t = &mut list.tables[d.table][d.slot];
        t.executing = None;
        if !t.is(d.id) {
            return None;
        }

        let elapsed = end.micros_since(start);
        t.run_count = t.run_count.wrapping_add(1);
        t.total_runtime_us = t.total_runtime_us.saturating_add(elapsed);

        let dl = &mut t.deadline;
        if dl.is_configured() {
            dl.last_start = Some(start);
            dl.last_completion = Some(end);
        }
        dl.overrun = dl.budget_us != 0 && elapsed > u64::from(dl.budget_us);
        let overrun_us = if dl.overrun {
            dl.overruns = dl.overruns.wrapping_add(1);
            Some(elapsed)
        } else {
            None
        };
        let mut miss = None;
        if dl.is_periodic() {
            // Judged against the period the invocation started in.
            let deadline = dl.deadline_for(start);
            if end > deadline {
                dl.misses = dl.misses.wrapping_add(1);
                miss = Some(DeadlineMiss {
                    task: d.id,
                    deadline_ms: dl.deadline_ms,
                    late_us: end.micros_since(deadline),
                    misses: dl.misses,
                });
            }
        }
        let miss_handler = match (&miss, dl.kind) {
            (Some(_), DeadlineKind::Hard) => t.miss_handler,
            _ => None,
        };

        t.state = match (t.state, t.kind) {
            (TaskState::Running | TaskState::Ready, TaskKind::Persistent) => {
                TaskState::Ready
            }
            (TaskState::Running | TaskState::Ready, TaskKind::OneShot) => {
                TaskState::Completed
            }
            (s, _) => s,
        };

        Some(Completion {
            state: t.state,
            miss,
            miss_handler,
            overrun_us,
        })
    }

    /// The periodic scheduler tick. Sends running persistent tasks back to
    /// `Ready` so the next pass on each core can pick someone else.
    pub fn tick(&self) {
        let k = self.kernel;
        k.profiling.timer_tick();

        let Some(mut list) = self.tables().tasks.try_lock(&k.locks) else {
            {
                let mut st = self.state();
                st.stats.ticks_skipped = st.stats.ticks_skipped.wrapping_add(1);
            }
            klog!(k.locks, KernEvent::TickSkipped);
            return;
        };
        for core in CoreId::ALL {
            if let Some(task) = self.current_task(core) {
                if let Some(t) = list.get_mut(task) {
                    if t.state == TaskState::Running
                        && t.kind == TaskKind::Persistent
                    {
                        t.state = TaskState::Ready;
                    }
                }
            }
        }
        drop(list);

        let mut st = self.state();
        st.stats.ticks = st.stats.ticks.wrapping_add(1);
    }

    /// Marks the task running on `core` as willing to give way. The next
    /// scheduling pass on that core sees it.
    pub fn yield_now(&self, core: CoreId) {
        let Some(task) = self.current_task(core) else {
            return;
        };
        let mut list = self.tasks();
        if let Some(t) = list.get_mut(task) {
            if t.state == TaskState::Running {
                t.state = TaskState::Ready;
            }
        }
    }

    /// Holds the calling core for `ms` milliseconds. Nothing else runs on it
    /// in the meantime.
    pub fn delay(&self, ms: u32) {
        self.kernel.clock.delay_us(u64::from(ms) * 1000);
    }

    /// Replaces a task's deadline settings, resetting its counters. Periods
    /// are counted from now.
    ///
    /// A hard deadline lifts the task to at least `High` priority.
    pub fn set_deadline(
        &self,
        task: TaskId,
        kind: DeadlineKind,
        period_ms: u32,
        deadline_ms: u32,
        budget_us: u32,
    ) -> Result<(), KernError> {
        let now = self.kernel.clock.now();
        let mut list = self.tasks();
        let t = list.get_mut(task).ok_or(KernError::NoSuchTask)?;
        t.deadline = DeadlineInfo {
            kind,
            period_ms,
            deadline_ms,
            budget_us,
            anchor: now,
            ..DeadlineInfo::default()
        };
        if kind == DeadlineKind::Hard && t.priority < Priority::High {
            t.priority = Priority::High;
        }
        Ok(())
    }

    pub fn get_deadline_info(&self, task: TaskId) -> Option<DeadlineInfo> {
        let mut list = self.tasks();
        list.get_mut(task).map(|t| t.deadline)
    }

    /// Sets the handler called when `task` misses a hard deadline.
    pub fn set_deadline_miss_handler(
        &self,
        task: TaskId,
        handler: Option<&'static dyn DeadlineMissHandler>,
    ) -> Result<(), KernError> {
        let mut list = self.tasks();
        let t = list.get_mut(task).ok_or(KernError::NoSuchTask)?;
        t.miss_handler = handler;
        Ok(())
    }

    pub fn get_task_info(&self, task: TaskId) -> Option<TaskInfo> {
        let info = {
            let list = self.tasks();
            let (home, slot) = list.find(task)?;
            list.tables[home][slot].info(home)
        };
        Some(self.with_protection(info))
    }

    fn with_protection(&self, mut info: TaskInfo) -> TaskInfo {
        let k = self.kernel;
        info.mpu_enabled = k.mpu().is_protected(info.id);
        info.secure = k.security().effective_state(info.id) == SecurityState::Secure;
        info
    }

    /// Every task that has not been deleted, core 0's table first.
    pub fn task_list(&self) -> heapless::Vec<TaskInfo, MAX_TASKS> {
        let mut out = heapless::Vec::new();
        {
            let list = self.tasks();
            for core in CoreId::ALL {
                for t in list.tables[core].iter() {
                    if t.state != TaskState::Inactive {
                        // Can't overflow: both have room for every slot.
                        let _ = out.push(t.info(core));
                    }
                }
            }
        }
        for info in out.iter_mut() {
            *info = self.with_protection(info.clone());
        }
        out
    }

    /// The task `core` is running, as last published by that core.
    pub fn current_task(&self, core: CoreId) -> Option<TaskId> {
        match self.tables().current[core.index()].load(Ordering::Relaxed) {
            NO_TASK => None,
            n => Some(TaskId(n)),
        }
    }

    /// Records a fault against a task's control block.
    pub(crate) fn note_fault(&self, task: TaskId, kind: FaultKind, address: u32) {
        let mut list = self.tasks();
        if let Some(t) = list.get_mut(task) {
            t.faults = t.faults.saturating_add(1);
            t.last_fault = Some((kind, address));
        }
    }

    /// Forgets whatever `core` was executing, for when its invocation will
    /// never return.
    #[cfg(target_os = "none")]
    pub(crate) fn abandon(&self, core: CoreId) {
        {
            let mut list = self.tasks();
            for table in CoreId::ALL {
                for t in list.tables[table].iter_mut() {
                    if t.executing == Some(core) {
                        t.executing = None;
                    }
                }
            }
        }
        self.tables().current[core.index()].store(NO_TASK, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SchedStats {
        let now = self.kernel.clock.now();
        let st = self.state();
        let mut stats = st.stats;
        if let Some(started) = st.started_at {
            stats.runtime_us = stats.runtime_us.saturating_add(now.micros_since(started));
        }
        stats
    }

    /// Turns tracing on or off: profiling hooks, and a log entry for every
    /// dispatch.
    pub fn enable_tracing(&self, enabled: bool) {
        self.kernel.profiling.set_enabled(enabled);
    }

    pub fn is_tracing(&self) -> bool {
        self.kernel.profiling.is_enabled()
    }

    /// Marks the scheduler running. Cores in `run_core` keep going until
    /// `stop`.
    pub fn start(&self) {
        let now = self.kernel.clock.now();
        {
            let mut st = self.state();
            if st.started_at.is_none() {
                st.started_at = Some(now);
            }
        }
        self.tables().running.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        let t = self.tables();
        t.running.store(false, Ordering::Release);
        t.core1_started.store(false, Ordering::Release);
        let now = self.kernel.clock.now();
        let mut st = self.state();
        if let Some(started) = st.started_at.take() {
            st.stats.runtime_us =
                st.stats.runtime_us.saturating_add(now.micros_since(started));
        }
    }

    pub fn is_running(&self) -> bool {
        self.tables().running.load(Ordering::Acquire)
    }

    pub fn core1_started(&self) -> bool {
        self.tables().core1_started.load(Ordering::Acquire)
    }

    /// The scheduling loop for `core`, which must be the calling core.
    /// Returns once the scheduler is stopped.
    pub fn run_core(&self, core: CoreId) {
        arch::enter_scheduler(core);
        self.kernel.mpu().init_core(core);
        if core == CoreId::Core1 {
            self.tables().core1_started.store(true, Ordering::Release);
        }
        while self.is_running() {
            if self.schedule_once(core).is_none() {
                arch::idle();
            }
        }
    }

    /// Writes a `ps`-style table of tasks.
    pub fn write_task_list(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let tasks = self.task_list();
        let stats = self.stats();
        writeln!(
            out,
            "{:>4} {:<24} {:<8} {:<9} {:>4} {:>4} {:>8} {:>12} {:<4} {:>3} {:>6}",
            "ID", "NAME", "PRIO", "STATE", "HOME", "AFF", "RUNS", "RUNTIME_US",
            "DL", "MPU", "FAULTS"
        )?;
        for t in &tasks {
            writeln!(
                out,
                "{:>4} {:<24} {:<8} {:<9} {:>4} {:>4} {:>8} {:>12} {:<4} {:>3} {:>6}",
                t.id,
                t.name,
                t.priority.name(),
                t.state.name(),
                t.home,
                t.affinity,
                t.run_count,
                t.total_runtime_us,
                match t.deadline {
                    DeadlineKind::None => "-",
                    DeadlineKind::Soft => "soft",
                    DeadlineKind::Hard => "hard",
                },
                if t.mpu_enabled { "on" } else { "off" },
                t.faults,
            )?;
        }
        writeln!(
            out,
            "{} tasks, {} context switches ({} / {}), {} ticks ({} skipped)",
            tasks.len(),
            stats.context_switches,
            stats.core_switches[0],
            stats.core_switches[1],
            stats.ticks,
            stats.ticks_skipped,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelOptions;
    use abi::CoreAffinity;
    use crate::time::SteppedClock;

    fn nop(_: &TaskContext<'_>) {}

    fn kernel() -> (Kernel, &'static SteppedClock) {
        let clock: &'static SteppedClock = Box::leak(Box::new(SteppedClock::new()));
        (Kernel::new(clock, KernelOptions::default()).unwrap(), clock)
    }

    #[test]
    fn create_then_info() {
        let (k, _) = kernel();
        let s = k.scheduler();
        let id = s
            .create_task(TaskParams::new("t1", &nop).affinity(CoreId::Core0))
            .unwrap();
        assert!(id.0 >= 1);
        let info = s.get_task_info(id).unwrap();
        assert_eq!(info.state, TaskState::Ready);
        assert_eq!(info.priority, Priority::Normal);
        assert_eq!(info.affinity, CoreAffinity::Pinned(CoreId::Core0));
        assert_eq!(info.name.as_str(), "t1");
        // The default region set was installed.
        assert!(info.mpu_enabled);
        assert!(info.secure);
        assert_eq!(info.stack_base, stack_slot_base(CoreId::Core0, 0));
    }

    #[test]
    fn one_shot_completes_and_persistent_returns_to_ready() {
        let (k, _) = kernel();
        let s = k.scheduler();
        let once = s
            .create_task(TaskParams::new("once", &nop).priority(Priority::High))
            .unwrap();
        let forever = s.create_task(TaskParams::new("forever", &nop).persistent()).unwrap();

        assert_eq!(s.schedule_once(CoreId::Core0), Some(once));
        assert_eq!(s.get_task_info(once).unwrap().state, TaskState::Completed);
        assert_eq!(s.schedule_once(CoreId::Core0), Some(forever));
        assert_eq!(s.schedule_once(CoreId::Core0), Some(forever));
        let info = s.get_task_info(forever).unwrap();
        assert_eq!(info.state, TaskState::Ready);
        assert_eq!(info.run_count, 2);
        // The second run of the same task isn't a switch.
        assert_eq!(s.stats().context_switches, 2);
        assert_eq!(s.current_task(CoreId::Core0), None);
    }

    #[test]
    fn pinned_tasks_stay_home() {
        let (k, _) = kernel();
        let s = k.scheduler();
        let id = s.create_task(TaskParams::new("c0", &nop).affinity(CoreId::Core0)).unwrap();
        assert_eq!(s.schedule_once(CoreId::Core1), None);
        assert_eq!(s.schedule_once(CoreId::Core0), Some(id));
    }

    #[test]
    fn core1_borrows_any_core_tasks() {
        let (k, _) = kernel();
        let s = k.scheduler();
        let id = s.create_task(TaskParams::new("anywhere", &nop)).unwrap();
        assert_eq!(s.get_task_info(id).unwrap().home, CoreId::Core0);
        assert_eq!(s.schedule_once(CoreId::Core1), Some(id));
    }

    #[test]
    fn suspend_and_resume() {
        let (k, _) = kernel();
        let s = k.scheduler();
        let id = s.create_task(TaskParams::new("t", &nop).persistent()).unwrap();
        s.suspend_task(id).unwrap();
        assert_eq!(s.suspend_task(id), Err(KernError::BadState));
        assert_eq!(s.schedule_once(CoreId::Core0), None);
        s.resume_task(id).unwrap();
        assert_eq!(s.resume_task(id), Err(KernError::BadState));
        assert_eq!(s.schedule_once(CoreId::Core0), Some(id));
        assert_eq!(s.suspend_task(TaskId(999)), Err(KernError::NoSuchTask));
    }

    #[test]
    fn delete_frees_the_slot_but_not_the_id() {
        let (k, _) = kernel();
        let s = k.scheduler();
        let a = s.create_task(TaskParams::new("a", &nop)).unwrap();
        s.delete_task(a).unwrap();
        assert_eq!(s.delete_task(a), Err(KernError::NoSuchTask));
        assert!(s.get_task_info(a).is_none());
        assert!(!k.mpu().is_protected(a));
        let b = s.create_task(TaskParams::new("b", &nop)).unwrap();
        assert!(b > a);
        // Same slot, so same stack.
        assert_eq!(s.get_task_info(b).unwrap().stack_base, stack_slot_base(CoreId::Core0, 0));
        assert_eq!(s.stats().tasks_deleted, 1);
    }

    #[test]
    fn failed_default_protection_creates_nothing() {
        let (k, _) = kernel();
        let s = k.scheduler();
        let huge = TaskParams::new("huge", &nop).stack_size(u32::MAX);
        let err = s.create_task(huge.clone());
        assert!(err.is_err());
        assert!(s.task_list().is_empty());
        // Without the MPU the same request is fine.
        k.mpu().set_enabled(false);
        let id = s.create_task(huge).unwrap();
        assert!(!s.get_task_info(id).unwrap().mpu_enabled);
    }

    #[test]
    fn tick_preempts_running_persistent_tasks() {
        let (k, _) = kernel();
        let s = k.scheduler();
        let id = s.create_task(TaskParams::new("p", &nop).persistent()).unwrap();
        {
            let mut list = s.tasks();
            let t = list.get_mut(id).unwrap();
            t.state = TaskState::Running;
        }
        s.tables().current[0].store(id.0, Ordering::Relaxed);
        s.tick();
        assert_eq!(s.get_task_info(id).unwrap().state, TaskState::Ready);
        assert_eq!(s.stats().ticks, 1);
    }

    #[test]
    fn tick_skips_when_task_list_is_busy() {
        let (k, _) = kernel();
        let s = k.scheduler();
        let held = s.tasks();
        s.tick();
        drop(held);
        let stats = s.stats();
        assert_eq!(stats.ticks, 0);
        assert_eq!(stats.ticks_skipped, 1);
    }

    #[test]
    fn hard_deadline_raises_priority() {
        let (k, _) = kernel();
        let s = k.scheduler();
        let id = s
            .create_task(TaskParams::new("t", &nop).priority(Priority::Low))
            .unwrap();
        s.set_deadline(id, DeadlineKind::Hard, 10, 5, 1000).unwrap();
        assert_eq!(s.get_task_info(id).unwrap().priority, Priority::High);
        let crit = s
            .create_task(TaskParams::new("c", &nop).priority(Priority::Critical))
            .unwrap();
        s.set_deadline(crit, DeadlineKind::Hard, 10, 5, 0).unwrap();
        assert_eq!(s.get_task_info(crit).unwrap().priority, Priority::Critical);
        assert_eq!(
            s.set_deadline(TaskId(999), DeadlineKind::Soft, 1, 1, 0),
            Err(KernError::NoSuchTask)
        );
    }

    #[test]
    fn urgent_hard_deadline_beats_priority() {
        let (k, clock) = kernel();
        let s = k.scheduler();
        let important = s
            .create_task(TaskParams::new("imp", &nop).priority(Priority::Critical).persistent())
            .unwrap();
        let hard = s
            .create_task(TaskParams::new("hard", &nop).persistent())
            .unwrap();
        s.set_deadline(hard, DeadlineKind::Hard, 10, 8, 0).unwrap();

        // Plenty of time left: priority order.
        assert_eq!(s.schedule_once(CoreId::Core0), Some(important));
        // Two of eight milliseconds left.
        clock.advance_ms(6);
        assert_eq!(s.schedule_once(CoreId::Core0), Some(hard));
        // It ran this period, so it's no longer urgent.
        assert_eq!(s.schedule_once(CoreId::Core0), Some(important));
    }

    static YIELDED_STATE: AtomicU32 = AtomicU32::new(u32::MAX);

    fn yield_and_look(cx: &TaskContext<'_>) {
        cx.yield_now();
        let state = cx
            .kernel()
            .scheduler()
            .get_task_info(cx.task())
            .map_or(u32::MAX, |t| t.state as u32);
        YIELDED_STATE.store(state, Ordering::SeqCst);
    }

    #[test]
    fn yielding_persistent_task_stays_runnable() {
        let (k, _) = kernel();
        let s = k.scheduler();
        let a = s
            .create_task(
                TaskParams::new("a", &yield_and_look)
                    .persistent()
                    .affinity(CoreId::Core0),
            )
            .unwrap();
        let b = s
            .create_task(TaskParams::new("b", &nop).persistent().affinity(CoreId::Core0))
            .unwrap();

        assert_eq!(s.schedule_once(CoreId::Core0), Some(a));
        // Gave way as soon as it asked.
        assert_eq!(YIELDED_STATE.load(Ordering::SeqCst), TaskState::Ready as u32);
        let info = s.get_task_info(a).unwrap();
        assert_eq!(info.state, TaskState::Ready);
        assert_eq!(info.run_count, 1);
        assert_eq!(s.current_task(CoreId::Core0), None);

        assert_eq!(s.schedule_once(CoreId::Core0), Some(b));
        assert_eq!(s.schedule_once(CoreId::Core0), Some(a));
        assert_eq!(s.get_task_info(a).unwrap().run_count, 2);
    }

    fn yield_only(cx: &TaskContext<'_>) {
        cx.yield_now();
    }

    #[test]
    fn yielding_one_shot_task_still_completes() {
        let (k, _) = kernel();
        let s = k.scheduler();
        let id = s.create_task(TaskParams::new("once", &yield_only)).unwrap();
        assert_eq!(s.schedule_once(CoreId::Core0), Some(id));
        let info = s.get_task_info(id).unwrap();
        assert_eq!(info.state, TaskState::Completed);
        assert_eq!(info.run_count, 1);
        assert_eq!(s.schedule_once(CoreId::Core0), None);
    }

    #[test]
    fn yield_with_nothing_running_is_harmless() {
        let (k, _) = kernel();
        let s = k.scheduler();
        let id = s.create_task(TaskParams::new("idle", &nop).persistent()).unwrap();
        s.yield_now(CoreId::Core1);
        s.yield_now(CoreId::Core0);
        assert_eq!(s.get_task_info(id).unwrap().state, TaskState::Ready);
    }

    fn ignore_miss(_: &DeadlineMiss) {}

    #[test]
    fn deadline_calls_on_unknown_tasks_fail_quietly() {
        let (k, _) = kernel();
        let s = k.scheduler();
        let ghost = TaskId(4242);
        assert_eq!(s.get_deadline_info(ghost), None);
        assert_eq!(
            s.set_deadline_miss_handler(ghost, Some(&ignore_miss)),
            Err(KernError::NoSuchTask)
        );
        assert_eq!(
            s.set_deadline(ghost, DeadlineKind::Soft, 10, 5, 0),
            Err(KernError::NoSuchTask)
        );

        // Same once a real task has gone.
        let id = s.create_task(TaskParams::new("gone", &nop)).unwrap();
        s.set_deadline(id, DeadlineKind::Hard, 10, 5, 0).unwrap();
        s.set_deadline_miss_handler(id, Some(&ignore_miss)).unwrap();
        assert!(s.get_deadline_info(id).is_some());
        s.delete_task(id).unwrap();
        assert_eq!(s.get_deadline_info(id), None);
        assert_eq!(
            s.set_deadline_miss_handler(id, None),
            Err(KernError::NoSuchTask)
        );
        // Nothing else was disturbed.
        assert!(s.task_list().is_empty());
    }

    #[test]
    fn task_list_renders() {
        let (k, _) = kernel();
        let s = k.scheduler();
        s.create_task(TaskParams::new("listed", &nop)).unwrap();
        let mut out = String::new();
        s.write_task_list(&mut out).unwrap();
        assert!(out.contains("listed"));
        assert!(out.contains("READY"));
        assert!(out.contains("1 tasks"));
    }
}
