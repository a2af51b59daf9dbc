// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for dual-core ARMv7-M / ARMv8-M parts.
//!
//! # Timer
//!
//! We use the system tick timer as the kernel timer, but it's only suitable
//! for producing periodic interrupts -- its counter is small and only counts
//! down. So, at each SysTick interrupt, we increment a tick count, and
//! `SystemClock::now` combines that count with the current countdown value to
//! get microseconds. Each tick also drives the scheduler tick of the
//! installed kernel.
//!
//! # Faults
//!
//! MemManage, BusFault, UsageFault and SecureFault all land in `fault_entry`,
//! which decodes the fault status registers and the stacked exception frame
//! into a `FaultReport` and hands it to the installed kernel. If the kernel
//! can't recover, we die with an epitaph. If it terminated the faulting
//! task, the exception returns into the core's scheduling loop.
//!
//! This assumes thread mode runs on the process stack, which is where the
//! scheduling loop and the tasks it calls live.
//!
//! # Cores
//!
//! Each core has its own MPU and SysTick; both are banked at the same
//! addresses, so the routines here always act on the calling core. The core
//! number comes from the SIO block's CPUID register.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use abi::{
    CoreId, ExceptionFrame, FaultStatus, SecureFaultStatus, SecurityState,
    NUM_CORES,
};

use crate::descs::RegionRegs;
use crate::err::KernError;
use crate::fault::{resume_frame, FaultOutcome, FaultReport};
use crate::startup::Kernel;
use crate::time::{Clock, Timestamp};

/// Saved PRIMASK state: 1 if interrupts were enabled.
pub type IrqState = u32;

/// CPUID register in the single-cycle IO block; reads as the core number.
const SIO_CPUID: *const u32 = 0xd000_0000 as *const u32;

/// Secure Fault Status Register and Secure Fault Address Register, part of
/// the SAU register block.
const SFSR: *mut u32 = 0xe000_ede4 as *mut u32;
const SFAR: *const u32 = 0xe000_ede8 as *const u32;

pub fn disable_interrupts() -> IrqState {
    let was_enabled = cortex_m::register::primask::read().is_active();
    cortex_m::interrupt::disable();
    u32::from(was_enabled)
}

pub fn restore_interrupts(state: IrqState) {
    if state != 0 {
        // Safety: we only re-enable interrupts that were enabled when the
        // matching `disable_interrupts` ran, so we're not breaking any
        // critical section we didn't open.
        unsafe { cortex_m::interrupt::enable() }
    }
}

pub fn current_core() -> CoreId {
    // Safety: CPUID is a read-only register with no side effects.
    let n = unsafe { core::ptr::read_volatile(SIO_CPUID) };
    if n == 0 {
        CoreId::Core0
    } else {
        CoreId::Core1
    }
}

fn mpu() -> &'static cortex_m::peripheral::mpu::RegisterBlock {
    // We are manufacturing authority to interact with the MPU here, because we
    // can't thread a cortex-specific peripheral through an
    // architecture-independent API.
    //
    // Safety: by not taking a &mut we're confident we're not violating
    // aliasing.
    unsafe { &*cortex_m::peripheral::MPU::PTR }
}

pub fn program_mpu_region(slot: usize, regs: RegionRegs) {
    let mpu = mpu();
    // Safety: we're messing with memory protection, so from the API's point
    // of view this is very unsafe. The values come from validated region
    // descriptors and the kernel always runs with PRIVDEFENA set, so none of
    // this can lock the kernel out of its own memory.
    unsafe {
        mpu.rnr.write(slot as u32);
        mpu.rbar.write(regs.rbar);
        mpu.rasr.write(regs.rasr);
    }
}

pub fn disable_mpu_region(slot: usize) {
    let mpu = mpu();
    // Safety: clearing RASR.ENABLE only removes a region.
    unsafe {
        mpu.rnr.write(slot as u32);
        mpu.rasr.write(0);
    }
}

pub fn set_mpu_enabled(enabled: bool) {
    let mpu = mpu();
    // ENABLE | PRIVDEFENA
    let ctrl = if enabled { 0b101 } else { 0 };
    // Safety: has no memory safety implications for the kernel, which keeps
    // the default map through PRIVDEFENA.
    unsafe {
        mpu.ctrl.write(ctrl);
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

pub fn enter_security_state(_state: SecurityState) {
    // The domain switch itself happens in the veneers (SG / BXNS). All the
    // kernel has to do is make sure everything it wrote for the previous
    // task is visible before the next one runs.
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

pub fn idle() {
    cortex_m::asm::wfe();
}

#[allow(clippy::declare_interior_mutable_const)]
const NO_STACK: AtomicU32 = AtomicU32::new(0);

/// Process stack pointer each core had the first time it entered its
/// scheduling loop, 8-byte aligned. Zero until then.
static SCHEDULER_STACK: [AtomicU32; NUM_CORES] = [NO_STACK; NUM_CORES];

/// Notes where `core`'s scheduling loop lives on the process stack, so that
/// fault recovery can restart the loop there. Only the first call per core
/// counts; later entries come through `resume_scheduler` and sit at that
/// same spot.
pub fn enter_scheduler(core: CoreId) {
    let top = &SCHEDULER_STACK[core.index()];
    // Each core only writes its own entry, so load/store is enough.
    if top.load(Ordering::Relaxed) == 0 {
        top.store(cortex_m::register::psp::read() & !7, Ordering::Relaxed);
    }
}

/// SysTick-backed kernel clock.
pub struct SystemClock {
    ticks: AtomicU32,
    tick_us: AtomicU32,
    cycles_per_tick: AtomicU32,
}

impl SystemClock {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU32::new(0),
            tick_us: AtomicU32::new(0),
            cycles_per_tick: AtomicU32::new(0),
        }
    }

    /// Programs and starts SysTick on the calling core.
    ///
    /// # Safety
    ///
    /// This takes over SysTick; nothing else may be using it.
    pub unsafe fn start(&self, cycles_per_tick: u32, tick_us: u32) {
        self.cycles_per_tick.store(cycles_per_tick, Ordering::Relaxed);
        self.tick_us.store(tick_us, Ordering::Relaxed);

        let syst = unsafe { &*cortex_m::peripheral::SYST::PTR };
        // Safety: SysTick is ours, per this function's contract.
        unsafe {
            syst.rvr.write(cycles_per_tick - 1);
            syst.cvr.write(0);
            // ENABLE | TICKINT | CLKSOURCE (processor clock)
            syst.csr.write(0b111);
        }
    }

    /// Starts SysTick at the tick period `kernel` was configured with, for a
    /// core clocked at `cpu_hz`.
    ///
    /// # Safety
    ///
    /// As for `start`.
    pub unsafe fn start_for(
        &self,
        kernel: &Kernel,
        cpu_hz: u32,
    ) -> Result<(), KernError> {
        let timing = kernel.options().tick_timing(cpu_hz)?;
        // Safety: passed on from our caller.
        unsafe { self.start(timing.cycles_per_tick, timing.tick_us) };
        Ok(())
    }

    fn tick(&self) {
        // Only the SysTick handler writes this, so load/store is enough.
        let t = self.ticks.load(Ordering::Relaxed);
        self.ticks.store(t.wrapping_add(1), Ordering::Release);
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let syst = unsafe { &*cortex_m::peripheral::SYST::PTR };
        let cycles = self.cycles_per_tick.load(Ordering::Relaxed);
        let tick_us = self.tick_us.load(Ordering::Relaxed);
        if cycles == 0 {
            return Timestamp::ZERO;
        }
        // Re-read the tick count until it's stable across the countdown
        // read, or we could pair a new tick count with an old countdown.
        loop {
            let before = self.ticks.load(Ordering::Acquire);
            let remaining = syst.cvr.read();
            let after = self.ticks.load(Ordering::Acquire);
            if before == after {
                let into_tick = u64::from(cycles - 1 - remaining.min(cycles - 1))
                    * u64::from(tick_us)
                    / u64::from(cycles);
                return Timestamp::from_micros(
                    u64::from(before) * u64::from(tick_us) + into_tick,
                );
            }
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

static KERNEL: AtomicPtr<Kernel> = AtomicPtr::new(core::ptr::null_mut());
static CLOCK: AtomicPtr<SystemClock> = AtomicPtr::new(core::ptr::null_mut());

/// Connects the interrupt and fault vectors to a kernel instance.
///
/// Until this is called, ticks are ignored and faults are fatal.
pub fn install(kernel: &'static Kernel, clock: &'static SystemClock) {
    KERNEL.store(kernel as *const _ as *mut _, Ordering::Release);
    CLOCK.store(clock as *const _ as *mut _, Ordering::Release);
}

fn installed_kernel() -> Option<&'static Kernel> {
    let p = KERNEL.load(Ordering::Acquire);
    // We only ever store a pointer derived from a `&'static`.
    unsafe { p.as_ref() }
}

#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    // Safety: as above, only ever set from a `&'static`.
    if let Some(clock) = unsafe { CLOCK.load(Ordering::Acquire).as_ref() } {
        clock.tick();
    }
    // Only core 0 drives the scheduler tick; it covers both cores.
    if current_core() == CoreId::Core0 {
        if let Some(kernel) = installed_kernel() {
            kernel.scheduler().tick();
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn MemoryManagement() {
    fault_entry();
}

#[no_mangle]
pub unsafe extern "C" fn BusFault() {
    fault_entry();
}

#[no_mangle]
pub unsafe extern "C" fn UsageFault() {
    fault_entry();
}

#[no_mangle]
pub unsafe extern "C" fn SecureFault() {
    fault_entry();
}

fn fault_entry() {
    // To diagnose the fault, we're going to need access to the System Control
    // Block. Pull such access from thin air.
    //
    // Safety: the returned pointer is valid and the block is Sync; we only
    // take a shared reference.
    let scb = unsafe { &*cortex_m::peripheral::SCB::PTR };
    let status = FaultStatus::from_bits_truncate(scb.cfsr.read());
    // Safety: plain register read.
    let secure_status =
        SecureFaultStatus::from_bits_truncate(unsafe {
            core::ptr::read_volatile(SFSR)
        });

    let fault_address = if status.contains(FaultStatus::MMARVALID) {
        Some(scb.mmfar.read())
    } else if status.contains(FaultStatus::BFARVALID) {
        Some(scb.bfar.read())
    } else if secure_status.contains(SecureFaultStatus::SFARVALID) {
        // Safety: plain register read.
        Some(unsafe { core::ptr::read_volatile(SFAR) })
    } else {
        None
    };

    // If stacking failed, whatever is at PSP is not a frame.
    let frame = if status
        .intersects(FaultStatus::MSTKERR | FaultStatus::STKERR)
    {
        None
    } else {
        let psp = cortex_m::register::psp::read() as *const u8;
        // Safety: the processor just pushed a frame at PSP, and stacking
        // succeeded, so these bytes are mapped and ours to read.
        let bytes = unsafe {
            core::slice::from_raw_parts(
                psp,
                core::mem::size_of::<ExceptionFrame>(),
            )
        };
        ExceptionFrame::from_stack_bytes(bytes)
    };

    // The status bits are sticky and write-one-to-clear.
    //
    // Safety: clearing status has no effect beyond the status registers.
    unsafe {
        scb.cfsr.write(status.bits());
        core::ptr::write_volatile(SFSR, secure_status.bits());
    }

    let Some(kernel) = installed_kernel() else {
        crate::fail::die(format_args!(
            "fault before kernel install: CFSR={:#010x}",
            status.bits()
        ));
    };

    let report = FaultReport {
        core: current_core(),
        status,
        secure_status,
        fault_address,
        frame,
    };
    match kernel.faults().handle(&report) {
        FaultOutcome::Recovered { .. } => {
            // The task is gone, but returning would run the faulting
            // instruction again. Everything on the process stack below where
            // the scheduling loop started belongs to the dead invocation, so
            // drop it: build a fresh frame at the loop's stack top and have
            // the exception return into `resume_scheduler` from there.
            let top = SCHEDULER_STACK[report.core.index()].load(Ordering::Relaxed);
            let entry = resume_scheduler as usize as u32;
            let Some((sp, frame)) = resume_frame(top, entry) else {
                crate::fail::die(format_args!(
                    "core {} faulted outside its scheduling loop",
                    report.core
                ));
            };
            kernel.scheduler().abandon(report.core);
            let new_psp = sp as *mut ExceptionFrame;
            // Safety: `top` was the process stack pointer when this core's
            // loop began, so the frame-sized area just below it is stack the
            // loop owned and the abandoned invocation no longer needs. The
            // exception return unstacks from the new PSP.
            unsafe {
                new_psp.write(frame);
                cortex_m::register::psp::write(new_psp as u32);
            }
        }
        FaultOutcome::Escalated { task, kind, reason } => {
            crate::fail::die(format_args!(
                "unrecoverable {kind} in task {task}: {reason:?}, \
                 CFSR={:#010x} SFSR={:#010x}",
                status.bits(),
                secure_status.bits(),
            ));
        }
    }
}

/// Where a core lands after the task it was running is terminated by fault
/// recovery, with the process stack back where its scheduling loop began.
extern "C" fn resume_scheduler() -> ! {
    let core = current_core();
    if let Some(kernel) = installed_kernel() {
        kernel.scheduler().run_core(core);
    }
    loop {
        idle();
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_has_atomic = "8")] {
        impl crate::atomic::AtomicExt for AtomicBool {
            type Primitive = bool;

            #[inline(always)]
            fn swap_polyfill(&self, value: Self::Primitive, ordering: Ordering)
                -> Self::Primitive
            {
                self.swap(value, ordering)
            }
        }
    } else {
        // ARMv6-M. Disabling interrupts makes the load/store pair atomic
        // with respect to this core only.
        //
        // TODO: back the lock bank with the SIO hardware spinlocks on
        // dual-core ARMv6-M parts, where this isn't enough.
        impl crate::atomic::AtomicExt for AtomicBool {
            type Primitive = bool;

            #[inline(never)]
            fn swap_polyfill(&self, value: Self::Primitive, ordering: Ordering)
                -> Self::Primitive
            {
                let (lo, so) = rmw_ordering(ordering);
                cortex_m::interrupt::free(|_| {
                    let prev = self.load(lo);
                    self.store(value, so);
                    prev
                })
            }
        }

        /// Translates an ordering suppled to a read-modify-write operation into
        /// the distinct orderings implied for its load and store phases,
        /// respectively.
        #[inline(always)]
        fn rmw_ordering(o: Ordering) -> (Ordering, Ordering) {
            match o {
                Ordering::AcqRel => (Ordering::Acquire, Ordering::Release),
                Ordering::Acquire => (Ordering::Acquire, Ordering::Relaxed),
                Ordering::Release => (Ordering::Relaxed, Ordering::Release),
                _ => (Ordering::SeqCst, Ordering::SeqCst),
            }
        }
    }
}
