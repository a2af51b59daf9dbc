// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel atomic type support.

use core::sync::atomic::Ordering;

/// An atomic type with the read-modify-write operations the kernel needs.
///
/// ARMv6-M has no exclusive-access instructions, so `core` drops `swap` and
/// friends on that target. The lock bank is built on `swap_polyfill`, which
/// calls through to the native operation where one exists and otherwise does
/// a load/store pair with interrupts masked. Everything else in the kernel
/// sticks to plain loads and stores, which every target has.
///
/// Implementations live in the `arch` module for the target.
pub(crate) trait AtomicExt {
    type Primitive;

    fn swap_polyfill(
        &self,
        value: Self::Primitive,
        ordering: Ordering,
    ) -> Self::Primitive;
}
