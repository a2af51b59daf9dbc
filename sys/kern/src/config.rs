// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel configuration.
//!
//! Table sizes and the memory map are fixed at build time from `DUET_KCONFIG`
//! (see `build.rs`); a few switches can be flipped at run time through
//! `KernelOptions`.

use crate::err::KernError;

include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));

/// MPU regions available to the running task, starting at hardware region
/// `MPU_SYSTEM_REGIONS`.
pub const MPU_DYNAMIC_REGIONS: usize = MPU_HW_REGIONS - MPU_SYSTEM_REGIONS;

/// Longest task, lock owner or secure function name kept, in bytes. Longer
/// names are truncated.
pub const NAME_LEN: usize = 24;

/// Secure functions a single task can be associated with.
pub const SECURE_FNS_PER_TASK: usize = 8;

/// Size of a non-secure-callable veneer.
pub const VENEER_SIZE: u32 = 8;

static_assertions::const_assert!(MPU_SYSTEM_REGIONS >= 4);
static_assertions::const_assert!(MPU_DYNAMIC_REGIONS > 0);
static_assertions::const_assert!(SPINLOCK_COUNT < u32::MAX as usize);

/// Switches that can be changed after boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KernelOptions {
    /// Program per-task MPU regions on every dispatch, and give new tasks a
    /// default region set.
    pub mpu_enabled: bool,
    /// Track and switch per-task security state on dispatch.
    pub security_enabled: bool,
    pub tick_period_ms: u32,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            mpu_enabled: true,
            security_enabled: true,
            tick_period_ms: TICK_PERIOD_MS,
        }
    }
}

/// Widest count SysTick can reload with.
pub const SYSTICK_MAX_RELOAD: u32 = 1 << 24;

/// How the tick timer has to be set up for a given `tick_period_ms`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TickTiming {
    pub cycles_per_tick: u32,
    pub tick_us: u32,
}

impl KernelOptions {
    /// Works out the tick timer setup for a core clocked at `cpu_hz`.
    pub fn tick_timing(&self, cpu_hz: u32) -> Result<TickTiming, KernError> {
        let tick_us = self
            .tick_period_ms
            .checked_mul(1000)
            .filter(|&us| us != 0)
            .ok_or(KernError::BadTickPeriod)?;
        let cycles = u64::from(cpu_hz) * u64::from(self.tick_period_ms) / 1000;
        if cycles == 0 || cycles > u64::from(SYSTICK_MAX_RELOAD) {
            return Err(KernError::BadTickPeriod);
        }
        Ok(TickTiming {
            cycles_per_tick: cycles as u32,
            tick_us,
        })
    }
}

/// Bounded copy of a name.
pub type Name = heapless::String<NAME_LEN>;

/// Copies as much of `s` as fits into a `Name`, cutting at a character
/// boundary.
pub fn bounded_name(s: &str) -> Name {
    let mut name = Name::new();
    for c in s.chars() {
        if name.push(c).is_err() {
            break;
        }
    }
    name
}

/// Base of the stack carved out for a task table slot.
pub fn stack_slot_base(core: abi::CoreId, slot: usize) -> u32 {
    let index = core.index() * TASKS_PER_CORE + slot;
    STACK_ARENA_BASE + index as u32 * STACK_STRIDE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_truncate_on_char_boundary() {
        assert_eq!(bounded_name("bus0").as_str(), "bus0");
        let long = "é".repeat(NAME_LEN);
        let name = bounded_name(&long);
        assert_eq!(name.len(), NAME_LEN);
        assert!(name.chars().all(|c| c == 'é'));
    }

    #[test]
    fn tick_timing_follows_the_option() {
        let options = KernelOptions {
            tick_period_ms: 1,
            ..KernelOptions::default()
        };
        assert_eq!(
            options.tick_timing(150_000_000),
            Ok(TickTiming {
                cycles_per_tick: 150_000,
                tick_us: 1000,
            })
        );
        let ten = KernelOptions::default().tick_timing(12_000_000).unwrap();
        assert_eq!(ten.tick_us, TICK_PERIOD_MS * 1000);
        assert_eq!(ten.cycles_per_tick, 12_000 * TICK_PERIOD_MS);
    }

    #[test]
    fn tick_timing_rejects_what_systick_cant_do() {
        let zero = KernelOptions {
            tick_period_ms: 0,
            ..KernelOptions::default()
        };
        assert_eq!(zero.tick_timing(150_000_000), Err(KernError::BadTickPeriod));
        let long = KernelOptions {
            tick_period_ms: 1000,
            ..KernelOptions::default()
        };
        // 150M cycles doesn't fit in 24 bits.
        assert_eq!(long.tick_timing(150_000_000), Err(KernError::BadTickPeriod));
        // Too slow a clock for even one cycle per tick.
        let one = KernelOptions {
            tick_period_ms: 1,
            ..KernelOptions::default()
        };
        assert_eq!(one.tick_timing(999), Err(KernError::BadTickPeriod));
    }

    #[test]
    fn stack_slots_are_disjoint() {
        let a = stack_slot_base(abi::CoreId::Core0, TASKS_PER_CORE - 1);
        let b = stack_slot_base(abi::CoreId::Core1, 0);
        assert_eq!(b - a, STACK_STRIDE);
    }
}
