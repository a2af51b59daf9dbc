// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Kernel operations report failure by returning `Err(KernError)`. Nothing in
//! the kernel unwinds; the only non-local exit is `fail::die`, which is
//! reserved for broken invariants and unrecoverable faults.
//!
//! Every operation validates its arguments before touching any state, so an
//! `Err` means nothing happened.

use core::fmt;

/// Why a kernel operation was refused.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernError {
    // Resource exhaustion. The caller can retry later or give up.
    /// The target core's task table has no INACTIVE slot.
    NoFreeTaskSlot,
    /// Every spinlock in the bank is claimed.
    NoFreeLock,
    /// A fixed-size table (MPU state, security state, fault records) is full.
    NoFreeRecord,
    /// The secure-function registry is full.
    NoFreeSecureSlot,
    /// The phase observer list is full.
    TooManyObservers,

    // Invalid arguments.
    BadAffinity,
    BadPriority,
    /// Raw spinlock category out of range.
    BadCategory,
    /// The tick period can't be produced by the tick timer.
    BadTickPeriod,
    BadRegion(RegionError),
    /// More regions than a task may have.
    TooManyRegions,
    NoSuchTask,
    /// Lock ID is outside the bank.
    NoSuchLock,
    /// Lock isn't in the registry.
    LockNotTracked,
    /// The spinlock manager's own lock.
    ReservedLock,
    /// A lock the kernel holds for its own tables.
    PinnedLock,
    /// `SpinlockCategory::Unused` can't be requested.
    ReservedCategory,
    AlreadyTracked,
    DuplicateName,
    /// No secure function with that name or ID is registered.
    NoSuchFunction,
    BadAddress,
    /// The target is in a state the operation doesn't apply to.
    BadState,
    /// The spinlock manager hasn't reached a phase that supports this.
    NotReady,
}

impl KernError {
    /// Checks whether this error reports a full table or pool, as opposed to
    /// a bad argument.
    pub fn is_exhaustion(self) -> bool {
        matches!(
            self,
            Self::NoFreeTaskSlot
                | Self::NoFreeLock
                | Self::NoFreeRecord
                | Self::NoFreeSecureSlot
                | Self::TooManyObservers
        )
    }
}

impl From<abi::BadRaw> for KernError {
    fn from(e: abi::BadRaw) -> Self {
        match e {
            abi::BadRaw::Affinity(_) => Self::BadAffinity,
            abi::BadRaw::Priority(_) => Self::BadPriority,
            abi::BadRaw::Category(_) => Self::BadCategory,
        }
    }
}

impl From<RegionError> for KernError {
    fn from(e: RegionError) -> Self {
        Self::BadRegion(e)
    }
}

impl fmt::Display for KernError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFreeTaskSlot => f.write_str("task table full"),
            Self::NoFreeLock => f.write_str("no spinlock available"),
            Self::NoFreeRecord => f.write_str("table full"),
            Self::NoFreeSecureSlot => f.write_str("secure function registry full"),
            Self::TooManyObservers => f.write_str("too many phase observers"),
            Self::BadAffinity => f.write_str("invalid core affinity"),
            Self::BadPriority => f.write_str("invalid priority"),
            Self::BadCategory => f.write_str("invalid spinlock category"),
            Self::BadTickPeriod => f.write_str("tick period out of range"),
            Self::BadRegion(e) => write!(f, "invalid region: {e}"),
            Self::TooManyRegions => f.write_str("too many regions"),
            Self::NoSuchTask => f.write_str("no such task"),
            Self::NoSuchLock => f.write_str("no such lock"),
            Self::LockNotTracked => f.write_str("lock not tracked"),
            Self::ReservedLock => f.write_str("lock reserved by the manager"),
            Self::PinnedLock => f.write_str("lock pinned by the kernel"),
            Self::ReservedCategory => f.write_str("category reserved"),
            Self::AlreadyTracked => f.write_str("lock already tracked"),
            Self::DuplicateName => f.write_str("name already registered"),
            Self::NoSuchFunction => f.write_str("no such secure function"),
            Self::BadAddress => f.write_str("invalid address"),
            Self::BadState => f.write_str("invalid state for operation"),
            Self::NotReady => f.write_str("not initialized"),
        }
    }
}

/// Why a memory region was rejected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionError {
    SizeNotPowerOfTwo(u32),
    /// Below the 32-byte hardware minimum.
    TooSmall(u32),
    Misaligned { base: u32, size: u32 },
    /// Region runs off the end of the address space.
    Wraps,
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeNotPowerOfTwo(size) => {
                write!(f, "size {size:#x} is not a power of two")
            }
            Self::TooSmall(size) => write!(f, "size {size:#x} is below 32 bytes"),
            Self::Misaligned { base, size } => {
                write!(f, "base {base:#010x} not aligned to size {size:#x}")
            }
            Self::Wraps => f.write_str("region wraps the address space"),
        }
    }
}
