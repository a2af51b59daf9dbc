// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, tailored for the current target.
//!
//! Each architecture support module must define the same set of names:
//!
//! - `IrqState`, `disable_interrupts`, `restore_interrupts`
//! - `program_mpu_region`, `disable_mpu_region`, `set_mpu_enabled`
//! - `enter_security_state`
//! - `idle`, `enter_scheduler`
//! - `SystemClock`
//! - an `AtomicExt` implementation for `AtomicBool`

cfg_if::cfg_if! {
    // Note: cfg_if! is slightly touchy about ordering and expression
    // complexity; this chain seems to be the best compromise.

    if #[cfg(all(target_arch = "arm", target_os = "none"))] {
        pub mod arm_m;
        pub use arm_m::*;
    } else if #[cfg(target_os = "none")] {
        compile_error!("support for this architecture not implemented");
    } else {
        pub mod fake;
        pub use fake::*;
    }
}
