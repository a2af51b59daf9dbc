// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and the code that sits
//! on top of it (drivers, the shell, telemetry).
//!
//! Everything in here is plain data. Types that cross the boundary as raw
//! integers (core affinity, priority, spinlock category) have `TryFrom`
//! implementations that reject out-of-range values, which is where argument
//! validation for those values lives.

#![cfg_attr(not(test), no_std)]

use core::fmt;

use enum_map::Enum;
use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// A raw integer that doesn't name a value of the type it was converted to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BadRaw {
    Affinity(u8),
    Priority(u8),
    Category(u8),
}

/// Names a task for the lifetime of the system.
///
/// Task IDs are handed out from a monotonic counter starting at 1 and are
/// never reused, even when the task table slot that held the task is. The
/// value 0 is reserved to mean "the system" (e.g. as the owner of a lock that
/// was acquired outside of any task).
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default,
)]
#[repr(transparent)]
pub struct TaskId(pub u32);

impl TaskId {
    /// The reserved "no task" / system ID.
    pub const SYSTEM: Self = Self(0);

    pub fn is_system(self) -> bool {
        self == Self::SYSTEM
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Number of execution cores the kernel schedules across.
pub const NUM_CORES: usize = 2;

/// Identifies one of the two execution cores.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Enum)]
pub enum CoreId {
    #[default]
    Core0 = 0,
    Core1 = 1,
}

impl CoreId {
    pub const ALL: [Self; NUM_CORES] = [Self::Core0, Self::Core1];

    /// Index of this core, suitable for indexing per-core arrays.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The core that is not `self`.
    pub const fn other(self) -> Self {
        match self {
            Self::Core0 => Self::Core1,
            Self::Core1 => Self::Core0,
        }
    }
}

impl TryFrom<u8> for CoreId {
    type Error = BadRaw;

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Core0),
            1 => Ok(Self::Core1),
            _ => Err(BadRaw::Affinity(x)),
        }
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// Restricts which core may run a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CoreAffinity {
    /// Only ever runs on this core.
    Pinned(CoreId),
    /// May run on either core. Such a task lives in core 0's table, and core 1
    /// may pick it up when it has nothing of its own to do.
    Any,
}

impl CoreAffinity {
    /// Raw encoding of `Any`, for collaborators that pass affinity as an
    /// integer.
    pub const ANY_RAW: u8 = 0xFF;

    /// The core whose task table holds tasks with this affinity.
    pub const fn home_core(self) -> CoreId {
        match self {
            Self::Pinned(c) => c,
            Self::Any => CoreId::Core0,
        }
    }

    /// Checks whether a task with this affinity may run on `core`.
    pub fn allows(self, core: CoreId) -> bool {
        match self {
            Self::Pinned(c) => c == core,
            Self::Any => true,
        }
    }
}

impl TryFrom<u8> for CoreAffinity {
    type Error = BadRaw;

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            Self::ANY_RAW => Ok(Self::Any),
            _ => CoreId::try_from(x).map(Self::Pinned),
        }
    }
}

impl From<CoreId> for CoreAffinity {
    fn from(c: CoreId) -> Self {
        Self::Pinned(c)
    }
}

impl fmt::Display for CoreAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pinned(c) => write!(f, "{c}"),
            Self::Any => f.write_str("any"),
        }
    }
}

/// Scheduling priority of a task.
///
/// Unlike a lot of kernels, numerically _higher_ priorities are more
/// important here, so the derived `Ord` agrees with importance.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Default,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum Priority {
    Idle = 0,
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self > other
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = BadRaw;

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Idle),
            1 => Ok(Self::Low),
            2 => Ok(Self::Normal),
            3 => Ok(Self::High),
            4 => Ok(Self::Critical),
            _ => Err(BadRaw::Priority(x)),
        }
    }
}

/// Whether a task runs once or forever.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum TaskKind {
    /// Runs once and then becomes `Completed`.
    #[default]
    OneShot,
    /// Returns to `Ready` after every invocation.
    Persistent,
}

/// Lifecycle state of a task table slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum TaskState {
    /// Slot is free.
    #[default]
    Inactive,
    Ready,
    Running,
    /// Reserved in the data model; no kernel operation currently blocks a
    /// task.
    Blocked,
    Suspended,
    /// A one-shot task that has run. Terminal.
    Completed,
}

impl TaskState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Inactive => "INACTIVE",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Blocked => "BLOCKED",
            Self::Suspended => "SUSPENDED",
            Self::Completed => "COMPLETED",
        }
    }
}

/// Severity class of a task's deadline.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum DeadlineKind {
    #[default]
    None,
    /// Misses are counted, nothing else.
    Soft,
    /// Misses are counted and reported to the task's miss handler, and the
    /// task gets elevated scheduling treatment.
    Hard,
}

/// Diagnostic classification of a spinlock. Purely for accounting.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Enum)]
pub enum SpinlockCategory {
    Scheduler,
    Sensor,
    I2c,
    Spi,
    Fault,
    Logging,
    Memory,
    Filesystem,
    Network,
    User,
    Debug,
    /// Sentinel for "not allocated". Can't be requested.
    Unused,
}

impl SpinlockCategory {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Scheduler => "scheduler",
            Self::Sensor => "sensor",
            Self::I2c => "i2c",
            Self::Spi => "spi",
            Self::Fault => "fault",
            Self::Logging => "logging",
            Self::Memory => "memory",
            Self::Filesystem => "filesystem",
            Self::Network => "network",
            Self::User => "user",
            Self::Debug => "debug",
            Self::Unused => "unused",
        }
    }
}

impl TryFrom<u8> for SpinlockCategory {
    type Error = BadRaw;

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        if usize::from(x) < <Self as Enum>::LENGTH {
            Ok(<Self as Enum>::from_usize(usize::from(x)))
        } else {
            Err(BadRaw::Category(x))
        }
    }
}

/// Names one hardware spinlock.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct LockId(pub u32);

impl LockId {
    /// Raw "no lock available" value, for collaborators that want a sentinel.
    pub const INVALID_RAW: u32 = u32::MAX;

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Staged initialization phase of the spinlock manager.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(u8)]
pub enum InitPhase {
    #[default]
    Uninit = 0,
    /// The manager owns its own lock; nothing is tracked yet.
    Core = 1,
    /// Bootstrap claims have been absorbed into the registry.
    Tracking = 2,
    /// Logging is available.
    Full = 3,
}

impl InitPhase {
    pub const fn from_u8(x: u8) -> Self {
        match x {
            1 => Self::Core,
            2 => Self::Tracking,
            3 => Self::Full,
            _ => Self::Uninit,
        }
    }
}

/// What a task may do with a protected region.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize,
)]
pub enum AccessClass {
    #[default]
    None,
    ReadOnly,
    ReadWrite,
    ReadExecute,
    ReadWriteExecute,
}

impl AccessClass {
    pub const fn can_read(self) -> bool {
        !matches!(self, Self::None)
    }

    pub const fn can_write(self) -> bool {
        matches!(self, Self::ReadWrite | Self::ReadWriteExecute)
    }

    pub const fn can_execute(self) -> bool {
        matches!(self, Self::ReadExecute | Self::ReadWriteExecute)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "--",
            Self::ReadOnly => "RO",
            Self::ReadWrite => "RW",
            Self::ReadExecute => "RX",
            Self::ReadWriteExecute => "RWX",
        }
    }
}

// This is defined outside the bitflags! macro so that it can carry serde
// derives of its own.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct RegionAttributes(u8);

bitflags::bitflags! {
    impl RegionAttributes: u8 {
        /// Region may be cached.
        const CACHEABLE = 1 << 0;
        /// Writes to the region may be buffered.
        const BUFFERABLE = 1 << 1;
        /// Region is shared with the other core or with DMA masters.
        const SHAREABLE = 1 << 2;
    }
}

/// Security domain a task executes in.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Default, Serialize, Deserialize,
)]
pub enum SecurityState {
    #[default]
    Secure,
    NonSecure,
    /// Between the two, while a transition is being carried out.
    Transitional,
}

impl SecurityState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Secure => "secure",
            Self::NonSecure => "non-secure",
            Self::Transitional => "transitional",
        }
    }
}

bitflags::bitflags! {
    /// Bits in the Configurable Fault Status Register, which is how hardware
    /// reports what went wrong in a MemManage, BusFault or UsageFault.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
    #[repr(transparent)]
    pub struct FaultStatus: u32 {
        // Bits 0-7: MMFSR (Memory Management Fault Status Register)
        const IACCVIOL = 1 << 0;
        const DACCVIOL = 1 << 1;
        const MUNSTKERR = 1 << 3;
        const MSTKERR = 1 << 4;
        const MLSPERR = 1 << 5;
        const MMARVALID = 1 << 7;

        // Bits 8-15: BFSR (Bus Fault Status Register)
        const IBUSERR = 1 << (8 + 0);
        const PRECISERR = 1 << (8 + 1);
        const IMPRECISERR = 1 << (8 + 2);
        const UNSTKERR = 1 << (8 + 3);
        const STKERR = 1 << (8 + 4);
        const LSPERR = 1 << (8 + 5);
        const BFARVALID = 1 << (8 + 7);

        // Bits 16-31: UFSR (Usage Fault Status Register)
        const UNDEFINSTR = 1 << (16 + 0);
        const INVSTATE = 1 << (16 + 1);
        const INVPC = 1 << (16 + 2);
        const NOCP = 1 << (16 + 3);
        const STKOF = 1 << (16 + 4);
        const UNALIGNED = 1 << (16 + 8);
        const DIVBYZERO = 1 << (16 + 9);
    }
}

bitflags::bitflags! {
    /// Bits in the Secure Fault Status Register (ARMv8-M Security Extension).
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
    #[repr(transparent)]
    pub struct SecureFaultStatus: u32 {
        const INVEP = 1 << 0;
        const INVIS = 1 << 1;
        const INVER = 1 << 2;
        const AUVIOL = 1 << 3;
        const INVTRAN = 1 << 4;
        const LSPERR = 1 << 5;
        const SFARVALID = 1 << 6;
        const LSERR = 1 << 7;
    }
}

/// Decoded kind of a hardware fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Enum)]
pub enum FaultKind {
    /// Instruction fetch from a region the task can't execute.
    InstructionAccess,
    /// Data access to a region the task can't touch.
    DataAccess,
    /// Exception entry couldn't push the frame onto the task stack.
    StackingError,
    /// Exception return couldn't pop the frame off the task stack.
    UnstackingError,
    BusError,
    UndefinedInstruction,
    InvalidState,
    InvalidPc,
    NoCoprocessor,
    Unaligned,
    DivideByZero,
    /// Stack limit check tripped.
    StackOverflow,
    /// The security attribution unit rejected an access or transition.
    SecurityViolation,
    Unknown,
}

impl FaultKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::InstructionAccess => "instruction access violation",
            Self::DataAccess => "data access violation",
            Self::StackingError => "stacking error",
            Self::UnstackingError => "unstacking error",
            Self::BusError => "bus error",
            Self::UndefinedInstruction => "undefined instruction",
            Self::InvalidState => "invalid state",
            Self::InvalidPc => "invalid pc",
            Self::NoCoprocessor => "no coprocessor",
            Self::Unaligned => "unaligned access",
            Self::DivideByZero => "divide by zero",
            Self::StackOverflow => "stack overflow",
            Self::SecurityViolation => "security violation",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The eight words the processor pushes onto the active stack on exception
/// entry, in push order.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct ExceptionFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

impl ExceptionFrame {
    /// Parses a frame out of raw stack memory. Returns `None` if `bytes` is
    /// not exactly one frame long.
    pub fn from_stack_bytes(bytes: &[u8]) -> Option<Self> {
        Self::read_from_bytes(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affinity_decodes_sentinel_and_cores() {
        assert_eq!(
            CoreAffinity::try_from(0),
            Ok(CoreAffinity::Pinned(CoreId::Core0))
        );
        assert_eq!(
            CoreAffinity::try_from(1),
            Ok(CoreAffinity::Pinned(CoreId::Core1))
        );
        assert_eq!(
            CoreAffinity::try_from(CoreAffinity::ANY_RAW),
            Ok(CoreAffinity::Any)
        );
        assert_eq!(CoreAffinity::try_from(2), Err(BadRaw::Affinity(2)));
        assert_eq!(CoreAffinity::Any.home_core(), CoreId::Core0);
        assert!(CoreAffinity::Any.allows(CoreId::Core1));
        assert!(!CoreAffinity::Pinned(CoreId::Core0).allows(CoreId::Core1));
    }

    #[test]
    fn priority_order_matches_importance() {
        assert!(Priority::High.is_more_important_than(Priority::Normal));
        assert!(!Priority::Low.is_more_important_than(Priority::Low));
        assert_eq!(Priority::try_from(4), Ok(Priority::Critical));
        assert_eq!(Priority::try_from(5), Err(BadRaw::Priority(5)));
    }

    #[test]
    fn category_range_check() {
        assert_eq!(SpinlockCategory::try_from(2), Ok(SpinlockCategory::I2c));
        assert_eq!(
            SpinlockCategory::try_from(11),
            Ok(SpinlockCategory::Unused)
        );
        assert_eq!(SpinlockCategory::try_from(12), Err(BadRaw::Category(12)));
    }

    #[test]
    fn exception_frame_from_stack() {
        let words: [u32; 8] = [1, 2, 3, 4, 12, 0xFFFF_FFFD, 0x1000_0400, 1 << 24];
        let frame = ExceptionFrame::from_stack_bytes(words.as_bytes())
            .expect("a full frame should parse");
        assert_eq!(frame.pc, 0x1000_0400);
        assert_eq!(frame.r12, 12);
        assert!(ExceptionFrame::from_stack_bytes(&[0u8; 12]).is_none());
    }
}
