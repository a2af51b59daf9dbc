// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Duet kernel.
//!
//! A kernel for dual-core microcontrollers: two cores each run a scheduling
//! loop over a shared set of task tables, and every dispatch reconfigures the
//! memory protection unit and security state for the task about to run.
//!
//! This code outside of the `arch` module is portable, and on the host the
//! `fake` architecture stands in for the hardware so the whole kernel can be
//! exercised by ordinary tests, with threads playing the part of cores.
//!
//! # Design principles
//!
//! 1. Static configuration. Table sizes and the memory map are fixed when the
//!    kernel is built (see `config`), and nothing is allocated at run time.
//! 2. Explicitly owned state. Everything lives in a `Kernel` value, so tests
//!    can build as many independent kernels as they like.
//! 3. Short critical sections. Kernel locks are held to copy data in or out,
//!    never across a call into another subsystem, and never two at once.
//! 4. A strong preference for safe code where reasonable.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod klog;

pub mod arch;
mod atomic;
mod cell;
pub mod config;
pub mod descs;
pub mod err;
pub mod fail;
pub mod fault;
mod hwlock;
mod idtable;
pub mod mpu;
pub mod profiling;
pub mod sched;
pub mod security;
pub mod spinlock;
pub mod startup;
pub mod task;
pub mod time;

pub use abi;
pub use err::KernError;
pub use startup::Kernel;
pub use task::{TaskContext, TaskParams};
