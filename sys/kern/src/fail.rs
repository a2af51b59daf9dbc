// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel crashes/failures such that they can be found by
//! tooling.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `KERNEL_HAS_FAILED` is a `bool`. It is cleared to zero (false) at boot,
//!   and set to one (true) if the kernel reaches the `die` function (either
//!   explicitly, as a result of an unrecoverable fault, or as a result of a
//!   `panic!`).
//!
//! - `KERNEL_EPITAPH` is an array of `u8`. The `die` routine writes as much of
//!   the failure reason into this buffer (as UTF-8) as possible, truncating if
//!   the buffer fills. Trailing NUL bytes are padding.
//!
//! On the host there is nobody to read the epitaph, so `die` panics with the
//! same message instead, which lets tests see it.

use core::fmt::{Display, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::atomic::AtomicExt;

/// Flag that gets set to `true` by all failure reporting functions, giving
/// tools a one-stop-shop for doing kernel triage.
#[used]
static KERNEL_HAS_FAILED: AtomicBool = AtomicBool::new(false);

const EPITAPH_LEN: usize = 128;

/// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of description of the
/// event that caused the kernel to fail, padded with NULs.
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

/// Checks whether `die` has been reached.
pub fn has_failed() -> bool {
    KERNEL_HAS_FAILED.load(Ordering::Relaxed)
}

fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    let previous_fail = KERNEL_HAS_FAILED.swap_polyfill(true, Ordering::AcqRel);
    if previous_fail {
        // Two failures at once, from both cores or recursively. The first one
        // owns the epitaph; this one just stops.
        finish(&"failed while failing");
    }

    // Safety: only one execution of this function will successfully set the
    // flag, so this &mut is unique.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg}").ok();

    finish(msg)
}

#[cfg(target_os = "none")]
fn finish(_msg: &dyn Display) -> ! {
    halt()
}

#[cfg(not(target_os = "none"))]
fn finish(msg: &dyn Display) -> ! {
    panic!("kernel died: {msg}")
}

#[cfg(target_os = "none")]
fn halt() -> ! {
    loop {
        // Platform-independent NOP
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

struct Eulogist {
    dest: &'static mut [u8],
}

impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
