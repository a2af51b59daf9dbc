// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host simulation of the architecture layer.
//!
//! There are no interrupts to mask and no MPU to program here. The kernel
//! keeps its own shadow copy of everything it would have written to the
//! hardware, which is what tests look at.

use core::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use abi::{CoreId, SecurityState};

use crate::descs::RegionRegs;
use crate::time::{Clock, Timestamp};

/// Saved interrupt state. Always zero in simulation.
pub type IrqState = u32;

pub fn disable_interrupts() -> IrqState {
    0
}

pub fn restore_interrupts(_state: IrqState) {}

pub fn program_mpu_region(_slot: usize, _regs: RegionRegs) {}

pub fn disable_mpu_region(_slot: usize) {}

pub fn set_mpu_enabled(_enabled: bool) {}

pub fn enter_security_state(_state: SecurityState) {}

/// Gives up the host CPU while a simulated core has nothing to run.
pub fn idle() {
    std::thread::yield_now();
}

/// Threads don't get their stacks rewound, so there's nothing to note.
pub fn enter_scheduler(_core: CoreId) {}

/// Wall-clock time since the clock was created.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let us = self.origin.elapsed().as_micros();
        Timestamp::from_micros(u64::try_from(us).unwrap_or(u64::MAX))
    }

    fn delay_us(&self, us: u64) {
        std::thread::sleep(Duration::from_micros(us));
    }
}

impl crate::atomic::AtomicExt for AtomicBool {
    type Primitive = bool;

    fn swap_polyfill(
        &self,
        value: Self::Primitive,
        ordering: Ordering,
    ) -> Self::Primitive {
        self.swap(value, ordering)
    }
}
