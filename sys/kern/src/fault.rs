// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fault handling.
//!
//! The architecture layer decodes a hardware fault into a `FaultReport` and
//! calls `Faults::handle`. Every fault is first recorded in a bounded table,
//! deduplicated on (task, kind, address), so that the diagnosis survives even
//! if we go on to die. Only then is recovery considered.
//!
//! The recovery policy is deliberately simple: memory protection, security,
//! undefined instruction and invalid state faults terminate the offending
//! task. Anything else, or a fault with no task to blame, escalates, and the
//! caller is expected to stop the system.

use core::fmt;

use abi::{
    AccessClass, CoreId, ExceptionFrame, FaultKind, FaultStatus,
    SecureFaultStatus, TaskId,
};
use enum_map::EnumMap;

use crate::cell::KernCell;
use crate::config::FAULT_RECORDS;
use crate::err::KernError;
use crate::klog::KernEvent;
use crate::startup::Kernel;
use crate::time::Timestamp;

/// What the hardware told us about a fault.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FaultReport {
    /// Core that took the fault.
    pub core: CoreId,
    pub status: FaultStatus,
    pub secure_status: SecureFaultStatus,
    /// Faulting data address, when the hardware latched one.
    pub fault_address: Option<u32>,
    /// Stacked registers, unless stacking itself failed.
    pub frame: Option<ExceptionFrame>,
}

impl FaultReport {
    /// Address to blame: the latched fault address if there is one, or the
    /// faulting PC.
    pub fn address(&self) -> u32 {
        self.fault_address
            .or(self.frame.map(|f| f.pc))
            .unwrap_or(0)
    }
}

/// Picks the single most specific fault kind out of the status registers.
pub fn classify(status: FaultStatus, secure: SecureFaultStatus) -> FaultKind {
    let secure_violation = SecureFaultStatus::INVEP
        | SecureFaultStatus::INVIS
        | SecureFaultStatus::INVER
        | SecureFaultStatus::AUVIOL
        | SecureFaultStatus::INVTRAN
        | SecureFaultStatus::LSPERR
        | SecureFaultStatus::LSERR;
    if secure.intersects(secure_violation) {
        return FaultKind::SecurityViolation;
    }

    // Stack problems first: a stacking error usually comes with an access
    // violation bit that's only a symptom.
    let table = [
        (FaultStatus::STKOF, FaultKind::StackOverflow),
        (FaultStatus::MSTKERR | FaultStatus::STKERR, FaultKind::StackingError),
        (
            FaultStatus::MUNSTKERR | FaultStatus::UNSTKERR,
            FaultKind::UnstackingError,
        ),
        (FaultStatus::IACCVIOL, FaultKind::InstructionAccess),
        (FaultStatus::DACCVIOL | FaultStatus::MLSPERR, FaultKind::DataAccess),
        (
            FaultStatus::IBUSERR
                | FaultStatus::PRECISERR
                | FaultStatus::IMPRECISERR
                | FaultStatus::LSPERR,
            FaultKind::BusError,
        ),
        (FaultStatus::UNDEFINSTR, FaultKind::UndefinedInstruction),
        (FaultStatus::INVSTATE, FaultKind::InvalidState),
        (FaultStatus::INVPC, FaultKind::InvalidPc),
        (FaultStatus::NOCP, FaultKind::NoCoprocessor),
        (FaultStatus::UNALIGNED, FaultKind::Unaligned),
        (FaultStatus::DIVBYZERO, FaultKind::DivideByZero),
    ];
    table
        .iter()
        .find(|(bits, _)| status.intersects(*bits))
        .map(|&(_, kind)| kind)
        .unwrap_or(FaultKind::Unknown)
}

/// Checks whether `kind` is an MPU violation, which the MPU configurator
/// records and reports to its fault handler.
pub fn is_memory_violation(kind: FaultKind) -> bool {
    matches!(
        kind,
        FaultKind::InstructionAccess
            | FaultKind::DataAccess
            | FaultKind::StackingError
            | FaultKind::UnstackingError
            | FaultKind::StackOverflow
    )
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Recovery {
    TerminateTask,
    Escalate,
}

pub fn recovery_for(kind: FaultKind) -> Recovery {
    if is_memory_violation(kind)
        || matches!(
            kind,
            FaultKind::SecurityViolation
                | FaultKind::UndefinedInstruction
                | FaultKind::InvalidState
                | FaultKind::InvalidPc
        )
    {
        Recovery::TerminateTask
    } else {
        Recovery::Escalate
    }
}

/// xPSR with only the Thumb bit set.
pub const XPSR_THUMB: u32 = 1 << 24;

/// Lays out the exception return that restarts a core's scheduling loop
/// once its task has been terminated: a fresh frame entering `entry`, just
/// below `stack_top`, so nothing of the abandoned invocation stays on the
/// stack. Returns the new stack pointer and the frame to put there, or
/// `None` if there is no usable stack top.
pub fn resume_frame(stack_top: u32, entry: u32) -> Option<(u32, ExceptionFrame)> {
    let top = stack_top & !7;
    if top == 0 {
        return None;
    }
    let sp = top.checked_sub(core::mem::size_of::<ExceptionFrame>() as u32)?;
    let frame = ExceptionFrame {
        pc: entry & !1,
        xpsr: XPSR_THUMB,
        ..ExceptionFrame::default()
    };
    Some((sp, frame))
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EscalationReason {
    /// The fault happened outside any task.
    NoCurrentTask,
    /// There's no recovery action for this kind of fault.
    NoRecoveryPolicy,
    /// Terminating the task didn't work.
    TerminationFailed(KernError),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The task was terminated and the system can continue.
    Recovered { task: TaskId },
    Escalated {
        task: TaskId,
        kind: FaultKind,
        reason: EscalationReason,
    },
}

/// One entry in the fault table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FaultRecord {
    pub task: TaskId,
    pub kind: FaultKind,
    pub address: u32,
    pub occurrences: u32,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    /// Access class of the task region covering `address` when the fault was
    /// first recorded, or `None` if no task region covers it.
    pub region: Option<AccessClass>,
}

/// Gets told about each fault recorded through the MPU configurator.
pub trait FaultHandler: Sync {
    fn fault_recorded(&self, record: &FaultRecord);
}

impl<F> FaultHandler for F
where
    F: Fn(&FaultRecord) + Sync,
{
    fn fault_recorded(&self, record: &FaultRecord) {
        self(record)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FaultStats {
    /// Every fault recorded, including repeats and ones the table had no
    /// room for.
    pub total: u32,
    pub by_kind: EnumMap<FaultKind, u32>,
    /// Faults that found the table full.
    pub dropped: u32,
    pub recovered: u32,
    pub escalated: u32,
}

#[derive(Default)]
pub(crate) struct FaultState {
    records: heapless::Vec<FaultRecord, FAULT_RECORDS>,
    stats: FaultStats,
}

pub(crate) struct FaultTables {
    state: KernCell<FaultState>,
}

impl FaultTables {
    pub(crate) fn new(lock: abi::LockId) -> Self {
        Self {
            state: KernCell::new(lock, FaultState::default()),
        }
    }
}

/// Handle on the fault handlers of a `Kernel`.
pub struct Faults<'a> {
    kernel: &'a Kernel,
}

impl<'a> Faults<'a> {
    pub(crate) fn new(kernel: &'a Kernel) -> Self {
        Self { kernel }
    }

    fn lock(&self) -> crate::cell::KernRef<'a, FaultState> {
        self.kernel.fault_tables.state.lock(&self.kernel.locks)
    }

    /// Records a fault and applies the recovery policy.
    pub fn handle(&self, report: &FaultReport) -> FaultOutcome {
        let k = self.kernel;
        let kind = classify(report.status, report.secure_status);
        let task = k.scheduler().current_task(report.core);
        let blame = task.unwrap_or(TaskId::SYSTEM);
        let address = report.address();

        k.profiling.fault(kind, blame);
        if is_memory_violation(kind) {
            k.mpu().handle_violation(blame, address, kind);
        } else {
            // A full table has already been counted and logged.
            let _ = self.record(blame, kind, address);
        }

        let outcome = match (task, recovery_for(kind)) {
            (None, _) => FaultOutcome::Escalated {
                task: blame,
                kind,
                reason: EscalationReason::NoCurrentTask,
            },
            (Some(task), Recovery::Escalate) => FaultOutcome::Escalated {
                task,
                kind,
                reason: EscalationReason::NoRecoveryPolicy,
            },
            (Some(task), Recovery::TerminateTask) => {
                match k.scheduler().delete_task(task) {
                    Ok(()) => FaultOutcome::Recovered { task },
                    Err(e) => FaultOutcome::Escalated {
                        task,
                        kind,
                        reason: EscalationReason::TerminationFailed(e),
                    },
                }
            }
        };

        {
            let mut st = self.lock();
            match outcome {
                FaultOutcome::Recovered { .. } => st.stats.recovered += 1,
                FaultOutcome::Escalated { .. } => st.stats.escalated += 1,
            }
        }
        match outcome {
            FaultOutcome::Recovered { task } => {
                klog!(k.locks, KernEvent::FaultRecovered(task));
            }
            FaultOutcome::Escalated { task, kind, .. } => {
                klog!(k.locks, KernEvent::FaultEscalated { task, kind });
            }
        }
        outcome
    }

    /// Adds a fault to the table, or bumps the count of a matching entry.
    ///
    /// Statistics are updated even when the table is full, in which case
    /// this returns `NoFreeRecord`.
    pub fn record(
        &self,
        task: TaskId,
        kind: FaultKind,
        address: u32,
    ) -> Result<FaultRecord, KernError> {
        let k = self.kernel;
        let region = k.mpu().region_for(task, address).map(|r| r.access);
        let now = k.clock.now();

        let result = {
            let mut st = self.lock();
            st.stats.total = st.stats.total.saturating_add(1);
            st.stats.by_kind[kind] = st.stats.by_kind[kind].saturating_add(1);
            let existing = st.records.iter_mut().find(|r| {
                r.task == task && r.kind == kind && r.address == address
            });
            if let Some(r) = existing {
                r.occurrences = r.occurrences.saturating_add(1);
                r.last_seen = now;
                Ok(*r)
            } else {
                let r = FaultRecord {
                    task,
                    kind,
                    address,
                    occurrences: 1,
                    first_seen: now,
                    last_seen: now,
                    region,
                };
                match st.records.push(r) {
                    Ok(()) => Ok(r),
                    Err(_) => {
                        st.stats.dropped += 1;
                        Err(KernError::NoFreeRecord)
                    }
                }
            }
        };

        k.scheduler().note_fault(task, kind, address);
        match result {
            Ok(_) => klog!(k.locks, KernEvent::Fault { task, kind, address }),
            Err(_) => klog!(k.locks, KernEvent::FaultTableFull(kind)),
        }
        result
    }

    pub fn records(&self) -> heapless::Vec<FaultRecord, FAULT_RECORDS> {
        self.lock().records.clone()
    }

    pub fn stats(&self) -> FaultStats {
        self.lock().stats.clone()
    }

    /// Empties the table and zeroes the statistics.
    pub fn clear(&self) {
        let mut st = self.lock();
        st.records.clear();
        st.stats = FaultStats::default();
    }

    pub fn report(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let (records, stats) = {
            let st = self.lock();
            (st.records.clone(), st.stats.clone())
        };
        writeln!(
            out,
            "faults: {} total, {} distinct, {} dropped, {} recovered, {} escalated",
            stats.total,
            records.len(),
            stats.dropped,
            stats.recovered,
            stats.escalated
        )?;
        for (kind, n) in stats.by_kind.iter() {
            if *n != 0 {
                writeln!(out, "  {:<28} {}", kind.name(), n)?;
            }
        }
        if records.is_empty() {
            return Ok(());
        }
        writeln!(
            out,
            "{:>5} {:<28} {:>10} {:>6} {:>12} REGION",
            "TASK", "KIND", "ADDRESS", "COUNT", "LAST_US"
        )?;
        for r in &records {
            writeln!(
                out,
                "{:>5} {:<28} {:#010x} {:>6} {:>12} {}",
                r.task,
                r.kind.name(),
                r.address,
                r.occurrences,
                r.last_seen.as_micros(),
                r.region.map_or("none", AccessClass::name),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_frame_starts_over_at_the_stack_top() {
        assert_eq!(resume_frame(0, 0x1000_0101), None);
        assert_eq!(resume_frame(4, 0x1000_0101), None);

        let (sp, frame) = resume_frame(0x2000_1004, 0x1000_0101).unwrap();
        // Aligned down to 8, then one 32-byte frame below.
        assert_eq!(sp, 0x2000_0fe0);
        assert_eq!(frame.pc, 0x1000_0100);
        assert_eq!(frame.xpsr, XPSR_THUMB);
        assert_eq!(frame.lr, 0);

        // However deep the dead invocation went, every restart lands in the
        // same place.
        assert_eq!(resume_frame(0x2000_1004, 0x1000_0101).unwrap().0, sp);
    }

    #[test]
    fn classification_prefers_specific_causes() {
        let none = SecureFaultStatus::empty();
        assert_eq!(
            classify(FaultStatus::DACCVIOL | FaultStatus::MMARVALID, none),
            FaultKind::DataAccess
        );
        assert_eq!(
            classify(FaultStatus::MSTKERR | FaultStatus::DACCVIOL, none),
            FaultKind::StackingError
        );
        assert_eq!(
            classify(FaultStatus::PRECISERR | FaultStatus::BFARVALID, none),
            FaultKind::BusError
        );
        assert_eq!(classify(FaultStatus::DIVBYZERO, none), FaultKind::DivideByZero);
        assert_eq!(classify(FaultStatus::empty(), none), FaultKind::Unknown);
        assert_eq!(
            classify(FaultStatus::empty(), SecureFaultStatus::SFARVALID),
            FaultKind::Unknown
        );
        assert_eq!(
            classify(
                FaultStatus::UNDEFINSTR,
                SecureFaultStatus::AUVIOL | SecureFaultStatus::SFARVALID
            ),
            FaultKind::SecurityViolation
        );
    }

    #[test]
    fn recovery_policy() {
        assert_eq!(recovery_for(FaultKind::DataAccess), Recovery::TerminateTask);
        assert_eq!(
            recovery_for(FaultKind::UndefinedInstruction),
            Recovery::TerminateTask
        );
        assert_eq!(recovery_for(FaultKind::BusError), Recovery::Escalate);
        assert_eq!(recovery_for(FaultKind::DivideByZero), Recovery::Escalate);
        assert_eq!(recovery_for(FaultKind::Unknown), Recovery::Escalate);
    }

    #[test]
    fn address_falls_back_to_pc() {
        let mut r = FaultReport {
            frame: Some(ExceptionFrame {
                pc: 0x1000_0100,
                ..ExceptionFrame::default()
            }),
            ..FaultReport::default()
        };
        assert_eq!(r.address(), 0x1000_0100);
        r.fault_address = Some(0x2000_0000);
        assert_eq!(r.address(), 0x2000_0000);
    }
}
