// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.
//!
//! A task is a `Runnable` plus the bookkeeping the scheduler needs to decide
//! when to call it. There are no per-task stacks to switch between: a core
//! runs a task by calling it, and the task returns when its quantum is done.

use abi::{
    CoreAffinity, CoreId, DeadlineKind, FaultKind, Priority, TaskId, TaskKind,
    TaskState,
};

use crate::config::{bounded_name, Name};
use crate::startup::Kernel;
use crate::time::Timestamp;

/// Stack size given to tasks that don't ask for one.
pub const DEFAULT_STACK_SIZE: u32 = 1024;

/// Something a task runs.
pub trait Runnable: Sync {
    fn run(&self, cx: &TaskContext<'_>);
}

impl<F> Runnable for F
where
    F: Fn(&TaskContext<'_>) + Sync,
{
    fn run(&self, cx: &TaskContext<'_>) {
        self(cx)
    }
}

/// What a running task can see of the kernel.
pub struct TaskContext<'a> {
    kernel: &'a Kernel,
    task: TaskId,
    core: CoreId,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(kernel: &'a Kernel, task: TaskId, core: CoreId) -> Self {
        Self { kernel, task, core }
    }

    pub fn kernel(&self) -> &'a Kernel {
        self.kernel
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Gives up the rest of this quantum. Takes effect when the task returns.
    pub fn yield_now(&self) {
        self.kernel.scheduler().yield_now(self.core);
    }

    /// Holds this core for `ms` milliseconds.
    pub fn delay_ms(&self, ms: u32) {
        self.kernel.scheduler().delay(ms);
    }
}

/// A deadline miss, as reported to a `DeadlineMissHandler`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeadlineMiss {
    pub task: TaskId,
    pub deadline_ms: u32,
    /// How far past the deadline the task completed.
    pub late_us: u64,
    /// Total misses, including this one.
    pub misses: u32,
}

/// Called when a task with a hard deadline misses it.
pub trait DeadlineMissHandler: Sync {
    fn deadline_missed(&self, miss: &DeadlineMiss);
}

impl<F> DeadlineMissHandler for F
where
    F: Fn(&DeadlineMiss) + Sync,
{
    fn deadline_missed(&self, miss: &DeadlineMiss) {
        self(miss)
    }
}

/// A task's deadline block.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DeadlineInfo {
    pub kind: DeadlineKind,
    pub period_ms: u32,
    /// Relative to the start of each period.
    pub deadline_ms: u32,
    /// Longest a single run may take; zero for no budget.
    pub budget_us: u32,
    pub misses: u32,
    pub overruns: u32,
    /// Set by the most recent run that went over budget, cleared by one that
    /// didn't.
    pub overrun: bool,
    /// When the deadline was set. Periods are counted from here.
    pub anchor: Timestamp,
    pub last_start: Option<Timestamp>,
    pub last_completion: Option<Timestamp>,
}

impl DeadlineInfo {
    pub fn is_configured(&self) -> bool {
        self.kind != DeadlineKind::None
    }

    /// Checks whether both a period and a deadline are set, which is what
    /// miss detection needs.
    pub fn is_periodic(&self) -> bool {
        self.is_configured() && self.period_ms != 0 && self.deadline_ms != 0
    }

    /// Start of the period that contains `t`.
    pub fn period_start(&self, t: Timestamp) -> Timestamp {
        let period_us = u64::from(self.period_ms) * 1000;
        if period_us == 0 {
            return self.anchor;
        }
        let into = t.micros_since(self.anchor);
        self.anchor.plus_micros(into - into % period_us)
    }

    /// Absolute deadline for the period containing `t`.
    pub fn deadline_for(&self, t: Timestamp) -> Timestamp {
        self.period_start(t)
            .plus_micros(u64::from(self.deadline_ms) * 1000)
    }

    /// Checks whether a hard-deadline task needs to run ahead of ordinary
    /// priority order at `now`: it hasn't run yet in the current period, and
    /// no more than a quarter of its deadline window is left.
    pub(crate) fn is_urgent(&self, now: Timestamp) -> bool {
        if self.kind != DeadlineKind::Hard || !self.is_periodic() {
            return false;
        }
        let period_start = self.period_start(now);
        if matches!(self.last_start, Some(s) if s >= period_start) {
            return false;
        }
        let remaining = self.deadline_for(now).micros_since(now);
        remaining * 4 <= u64::from(self.deadline_ms) * 1000
    }
}

/// Internal representation of a task.
///
/// A slot is free when its state is `Inactive` and no core is executing it.
pub(crate) struct Tcb {
    pub(crate) id: TaskId,
    pub(crate) name: Name,
    pub(crate) entry: Option<&'static dyn Runnable>,
    pub(crate) priority: Priority,
    pub(crate) kind: TaskKind,
    pub(crate) affinity: CoreAffinity,
    pub(crate) state: TaskState,
    pub(crate) deadline: DeadlineInfo,
    pub(crate) miss_handler: Option<&'static dyn DeadlineMissHandler>,
    pub(crate) faults: u32,
    pub(crate) last_fault: Option<(FaultKind, u32)>,
    pub(crate) run_count: u32,
    pub(crate) total_runtime_us: u64,
    pub(crate) stack_base: u32,
    pub(crate) stack_size: u32,
    /// The core running this task's entry point right now, if any.
    pub(crate) executing: Option<CoreId>,
}

impl Tcb {
    pub(crate) fn empty() -> Self {
        Self {
            id: TaskId::SYSTEM,
            name: Name::new(),
            entry: None,
            priority: Priority::default(),
            kind: TaskKind::default(),
            affinity: CoreAffinity::Any,
            state: TaskState::Inactive,
            deadline: DeadlineInfo::default(),
            miss_handler: None,
            faults: 0,
            last_fault: None,
            run_count: 0,
            total_runtime_us: 0,
            stack_base: 0,
            stack_size: 0,
            executing: None,
        }
    }

    pub(crate) fn is_free(&self) -> bool {
        self.state == TaskState::Inactive && self.executing.is_none()
    }

    /// Checks whether this slot holds live task `id`.
    pub(crate) fn is(&self, id: TaskId) -> bool {
        self.id == id && self.state != TaskState::Inactive
    }

    /// Checks whether `core` may pick this task up right now.
    pub(crate) fn is_dispatchable_on(&self, core: CoreId) -> bool {
        self.state == TaskState::Ready
            && self.executing.is_none()
            && self.affinity.allows(core)
    }

    /// Snapshot of the task. Protection fields are left false; they live in
    /// the configurators' tables and the scheduler fills them in.
    pub(crate) fn info(&self, home: CoreId) -> TaskInfo {
        TaskInfo {
            id: self.id,
            name: self.name.clone(),
            priority: self.priority,
            kind: self.kind,
            affinity: self.affinity,
            home,
            state: self.state,
            deadline: self.deadline.kind,
            run_count: self.run_count,
            total_runtime_us: self.total_runtime_us,
            mpu_enabled: false,
            secure: false,
            faults: self.faults,
            last_fault: self.last_fault,
            stack_base: self.stack_base,
            stack_size: self.stack_size,
        }
    }
}

/// Snapshot of a task, from `Scheduler::get_task_info`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: Name,
    pub priority: Priority,
    pub kind: TaskKind,
    pub affinity: CoreAffinity,
    /// The core whose table holds the task.
    pub home: CoreId,
    pub state: TaskState,
    pub deadline: DeadlineKind,
    pub run_count: u32,
    pub total_runtime_us: u64,
    pub mpu_enabled: bool,
    pub secure: bool,
    pub faults: u32,
    /// Kind and address of the most recent fault.
    pub last_fault: Option<(FaultKind, u32)>,
    pub stack_base: u32,
    pub stack_size: u32,
}

/// Everything needed to create a task.
#[derive(Clone)]
pub struct TaskParams {
    pub(crate) name: Name,
    pub(crate) entry: &'static dyn Runnable,
    pub(crate) priority: Priority,
    pub(crate) affinity: CoreAffinity,
    pub(crate) kind: TaskKind,
    pub(crate) stack_size: u32,
}

impl TaskParams {
    /// A one-shot task at normal priority, on any core.
    pub fn new(name: &str, entry: &'static dyn Runnable) -> Self {
        Self {
            name: bounded_name(name),
            entry,
            priority: Priority::Normal,
            affinity: CoreAffinity::Any,
            kind: TaskKind::OneShot,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn affinity(mut self, affinity: impl Into<CoreAffinity>) -> Self {
        self.affinity = affinity.into();
        self
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn persistent(self) -> Self {
        self.kind(TaskKind::Persistent)
    }

    pub fn stack_size(mut self, bytes: u32) -> Self {
        self.stack_size = bytes;
        self
    }
}

/// Scans `tasks` for the most important task matching `pred`, starting just
/// after `previous` and wrapping, so that tasks of equal priority take turns.
/// Returns the index of the first task found at the highest priority.
pub(crate) fn priority_scan(
    previous: usize,
    tasks: &[Tcb],
    pred: impl Fn(&Tcb) -> bool,
) -> Option<usize> {
    let mut pos = previous;
    let mut choice: Option<(usize, Priority)> = None;
    for _step_no in 0..tasks.len() {
        pos = pos.wrapping_add(1);
        if pos >= tasks.len() {
            pos = 0;
        }
        let t = &tasks[pos];
        if !pred(t) {
            continue;
        }

        if let Some((_, best)) = choice {
            if !t.priority.is_more_important_than(best) {
                continue;
            }
        }

        choice = Some((pos, t.priority));
    }

    choice.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop(_: &TaskContext<'_>) {}

    fn table(prios: &[Priority]) -> Vec<Tcb> {
        prios
            .iter()
            .enumerate()
            .map(|(i, &p)| Tcb {
                id: TaskId(i as u32 + 1),
                entry: Some(&nop),
                priority: p,
                state: TaskState::Ready,
                ..Tcb::empty()
            })
            .collect()
    }

    #[test]
    fn scan_prefers_priority_then_rotates() {
        use Priority::*;
        let tasks = table(&[Normal, High, Normal, High]);
        let ready = |t: &Tcb| t.state == TaskState::Ready;
        assert_eq!(priority_scan(tasks.len() - 1, &tasks, ready), Some(1));
        assert_eq!(priority_scan(1, &tasks, ready), Some(3));
        assert_eq!(priority_scan(3, &tasks, ready), Some(1));
    }

    #[test]
    fn scan_with_nothing_eligible() {
        let tasks = table(&[Priority::Low]);
        assert_eq!(priority_scan(0, &tasks, |_| false), None);
    }

    #[test]
    fn period_arithmetic() {
        let d = DeadlineInfo {
            kind: DeadlineKind::Hard,
            period_ms: 10,
            deadline_ms: 4,
            anchor: Timestamp::from_millis(3),
            ..DeadlineInfo::default()
        };
        let t = Timestamp::from_micros(27_500);
        assert_eq!(d.period_start(t), Timestamp::from_millis(23));
        assert_eq!(d.deadline_for(t), Timestamp::from_millis(27));
    }

    #[test]
    fn urgency_window() {
        let mut d = DeadlineInfo {
            kind: DeadlineKind::Hard,
            period_ms: 10,
            deadline_ms: 8,
            ..DeadlineInfo::default()
        };
        // 8ms window; urgent once 2ms or less remain.
        assert!(!d.is_urgent(Timestamp::from_millis(5)));
        assert!(d.is_urgent(Timestamp::from_millis(6)));
        // Already ran this period.
        d.last_start = Some(Timestamp::from_millis(1));
        assert!(!d.is_urgent(Timestamp::from_millis(6)));
        // Next period, same rule applies again.
        assert!(d.is_urgent(Timestamp::from_millis(16)));
        d.kind = DeadlineKind::Soft;
        assert!(!d.is_urgent(Timestamp::from_millis(16)));
    }
}
