// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.

/// In-kernel timestamp representation, in microseconds since boot.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub const fn from_micros(us: u64) -> Self {
        Self(us)
    }

    pub const fn from_millis(ms: u64) -> Self {
        Self(ms * 1000)
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Microseconds from `earlier` to `self`, or zero if `earlier` is
    /// actually later.
    pub fn micros_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn plus_micros(self, us: u64) -> Self {
        Self(self.0.saturating_add(us))
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<[u32; 2]> for Timestamp {
    fn from(v: [u32; 2]) -> Self {
        Self::from(u64::from(v[0]) | u64::from(v[1]) << 32)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

/// A source of kernel time.
///
/// Each `Kernel` is handed one of these at construction. On hardware this is
/// `arch::SystemClock`; simulations use [`SteppedClock`] so that tests decide
/// exactly when time passes.
pub trait Clock: Sync {
    fn now(&self) -> Timestamp;

    /// Busy-waits for `us` microseconds. This holds the calling core for the
    /// whole duration.
    fn delay_us(&self, us: u64) {
        let until = self.now().plus_micros(us);
        while self.now() < until {
            core::hint::spin_loop();
        }
    }
}

/// A clock that only moves when told to.
///
/// `delay_us` advances the clock rather than waiting, so simulated delays
/// complete immediately.
#[cfg(target_has_atomic = "64")]
#[derive(Debug, Default)]
pub struct SteppedClock {
    now: core::sync::atomic::AtomicU64,
}

#[cfg(target_has_atomic = "64")]
impl SteppedClock {
    pub const fn new() -> Self {
        Self {
            now: core::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn advance_us(&self, us: u64) {
        self.now
            .fetch_add(us, core::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance_us(ms * 1000);
    }

    pub fn set(&self, t: Timestamp) {
        self.now.store(t.0, core::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(target_has_atomic = "64")]
impl Clock for SteppedClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now.load(core::sync::atomic::Ordering::SeqCst))
    }

    fn delay_us(&self, us: u64) {
        self.advance_us(us);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stepped_clock_moves_only_when_told() {
        let clock = SteppedClock::new();
        assert_eq!(clock.now(), Timestamp::ZERO);
        clock.advance_ms(3);
        assert_eq!(clock.now().as_micros(), 3000);
        clock.delay_us(250);
        assert_eq!(clock.now().as_micros(), 3250);
    }

    #[test]
    fn micros_since_saturates() {
        let a = Timestamp::from_micros(100);
        let b = Timestamp::from_micros(40);
        assert_eq!(a.micros_since(b), 60);
        assert_eq!(b.micros_since(a), 0);
    }
}
