// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory protection configurator.
//!
//! Each task can have up to `MAX_REGIONS_PER_TASK` region descriptors. When a
//! core is about to run a task, the scheduler calls `apply_task_settings`,
//! which programs the task's regions into the hardware regions above the
//! system ones. The system regions (a privileged-only fallback over the whole
//! address space, flash, RAM and peripherals) are programmed once per core
//! and never touched again.
//!
//! Each core remembers the last task it applied, so a task that runs several
//! times in a row only costs one reprogramming. Anything that changes a
//! task's regions invalidates that cache.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use abi::{
    AccessClass, CoreId, FaultKind, LockId, RegionAttributes, TaskId,
    NUM_CORES,
};

use crate::arch;
use crate::cell::{KernCell, KernRef};
use crate::config::{
    FLASH_BASE, FLASH_SIZE, MAX_REGIONS_PER_TASK, MPU_DYNAMIC_REGIONS,
    MPU_HW_REGIONS, MPU_SYSTEM_REGIONS, MPU_TABLE_SIZE, PERIPHERAL_BASE,
    PERIPHERAL_SIZE, RAM_BASE, RAM_SIZE,
};
use crate::descs::{region_size_for, RegionDesc, RegionRegs};
use crate::err::{KernError, RegionError};
use crate::fault::FaultHandler;
use crate::idtable::IdTable;
use crate::klog::KernEvent;
use crate::startup::Kernel;

pub type RegionList = heapless::Vec<RegionDesc, MAX_REGIONS_PER_TASK>;

/// A task's requested region set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MpuConfig {
    pub task: TaskId,
    pub regions: RegionList,
}

impl MpuConfig {
    pub fn new(task: TaskId) -> Self {
        Self {
            task,
            regions: RegionList::new(),
        }
    }

    pub fn push(&mut self, region: RegionDesc) -> Result<(), KernError> {
        self.regions
            .push(region)
            .map_err(|_| KernError::TooManyRegions)
    }

    pub fn from_regions(
        task: TaskId,
        regions: &[RegionDesc],
    ) -> Result<Self, KernError> {
        let regions = RegionList::from_slice(regions)
            .map_err(|_| KernError::TooManyRegions)?;
        Ok(Self { task, regions })
    }
}

/// Protection state of one task.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MpuTaskState {
    pub enabled: bool,
    /// Regions have been supplied. A task can be enabled but not configured,
    /// in which case it runs under the system regions alone.
    pub configured: bool,
    pub regions: RegionList,
}

impl MpuTaskState {
    fn is_protected(&self) -> bool {
        self.enabled && self.configured
    }

    /// The regions the hardware actually gets.
    fn programmed(&self) -> &[RegionDesc] {
        let n = self.regions.len().min(MPU_DYNAMIC_REGIONS);
        &self.regions[..n]
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MpuStats {
    /// Applies that reprogrammed hardware.
    pub apply_settings_count: u32,
    /// Applies skipped because the core already had the task's settings.
    pub cache_hits: u32,
    pub resets: u32,
    pub total_apply_us: u64,
    pub max_apply_us: u64,
    pub violations: u32,
}

#[derive(Copy, Clone)]
struct CoreMpu {
    last_applied: Option<TaskId>,
    /// What we last wrote to each hardware region.
    shadow: [RegionRegs; MPU_HW_REGIONS],
}

impl CoreMpu {
    const fn new() -> Self {
        Self {
            last_applied: None,
            shadow: [RegionRegs::DISABLED; MPU_HW_REGIONS],
        }
    }

    fn write(&mut self, slot: usize, regs: RegionRegs) {
        if regs.is_enabled() {
            arch::program_mpu_region(slot, regs);
        } else {
            arch::disable_mpu_region(slot);
        }
        self.shadow[slot] = regs;
    }

    fn clear_dynamic(&mut self) {
        for slot in MPU_SYSTEM_REGIONS..MPU_HW_REGIONS {
            self.write(slot, RegionRegs::DISABLED);
        }
    }
}

pub(crate) struct MpuState {
    tasks: IdTable<MpuTaskState, MPU_TABLE_SIZE>,
    cores: [CoreMpu; NUM_CORES],
    stats: MpuStats,
    handler: Option<&'static dyn FaultHandler>,
}

impl MpuState {
    fn invalidate(&mut self, task: TaskId) {
        for c in &mut self.cores {
            if c.last_applied == Some(task) {
                c.last_applied = None;
            }
        }
    }
}

pub(crate) struct MpuTables {
    state: KernCell<MpuState>,
    enabled: AtomicBool,
}

impl MpuTables {
    pub(crate) fn new(lock: LockId, enabled: bool) -> Self {
        Self {
            state: KernCell::new(
                lock,
                MpuState {
                    tasks: IdTable::new(),
                    cores: [CoreMpu::new(); NUM_CORES],
                    stats: MpuStats::default(),
                    handler: None,
                },
            ),
            enabled: AtomicBool::new(enabled),
        }
    }
}

/// Fixed regions shared by every task, in hardware region order.
pub fn system_regions() -> [RegionRegs; MPU_SYSTEM_REGIONS] {
    // Whole address space, privileged read/write, never executable. Only
    // useful as a background for the others.
    const FALLBACK: RegionRegs = RegionRegs {
        rbar: 0,
        rasr: 1 << 28 | 0b001 << 24 | 31 << 1 | 1,
    };
    let mut regs = [RegionRegs::DISABLED; MPU_SYSTEM_REGIONS];
    regs[0] = FALLBACK;
    regs[1] = RegionDesc::new(
        FLASH_BASE,
        FLASH_SIZE,
        AccessClass::ReadExecute,
        RegionAttributes::CACHEABLE,
    )
    .encode();
    regs[2] = RegionDesc::new(
        RAM_BASE,
        RAM_SIZE,
        AccessClass::ReadWrite,
        RegionAttributes::CACHEABLE
            | RegionAttributes::BUFFERABLE
            | RegionAttributes::SHAREABLE,
    )
    .encode();
    regs[3] = RegionDesc::new(
        PERIPHERAL_BASE,
        PERIPHERAL_SIZE,
        AccessClass::ReadWrite,
        RegionAttributes::BUFFERABLE | RegionAttributes::SHAREABLE,
    )
    .encode();
    regs
}

/// Handle on the MPU configurator of a `Kernel`.
pub struct Mpu<'a> {
    kernel: &'a Kernel,
}

impl<'a> Mpu<'a> {
    pub(crate) fn new(kernel: &'a Kernel) -> Self {
        Self { kernel }
    }

    fn lock(&self) -> KernRef<'a, MpuState> {
        self.kernel.mpu_tables.state.lock(&self.kernel.locks)
    }

    pub fn is_enabled(&self) -> bool {
        self.kernel.mpu_tables.enabled.load(Ordering::Acquire)
    }

    /// Turns protection on or off globally. While off, applies do nothing
    /// and the hardware MPU is disabled.
    pub fn set_enabled(&self, enabled: bool) {
        self.kernel
            .mpu_tables
            .enabled
            .store(enabled, Ordering::Release);
        let mut st = self.lock();
        for c in &mut st.cores {
            c.last_applied = None;
        }
        arch::set_mpu_enabled(enabled);
    }

    /// Programs the system regions on `core` and clears the task regions.
    ///
    /// This writes the MPU of the calling core, which must be `core`.
    pub fn init_core(&self, core: CoreId) {
        let enabled = self.is_enabled();
        let mut st = self.lock();
        let c = &mut st.cores[core.index()];
        for (slot, regs) in system_regions().into_iter().enumerate() {
            c.write(slot, regs);
        }
        c.clear_dynamic();
        c.last_applied = None;
        arch::set_mpu_enabled(enabled);
    }

    /// Stores a task's region set, replacing any earlier one.
    ///
    /// A task configured for the first time also has protection enabled.
    pub fn configure_task(&self, config: &MpuConfig) -> Result<(), KernError> {
        for r in &config.regions {
            r.validate()?;
        }
        let mut st = self.lock();
        let entry = st.tasks.get_or_insert_with(config.task, || MpuTaskState {
            enabled: true,
            ..MpuTaskState::default()
        })?;
        entry.regions = config.regions.clone();
        entry.configured = true;
        st.invalidate(config.task);
        Ok(())
    }

    /// Turns protection for one task on or off. Enabling a task with no
    /// configuration creates an empty one.
    pub fn enable_protection(
        &self,
        task: TaskId,
        enable: bool,
    ) -> Result<(), KernError> {
        let mut st = self.lock();
        if !enable && st.tasks.get(task).is_none() {
            return Ok(());
        }
        let entry = st.tasks.get_or_insert_with(task, MpuTaskState::default)?;
        entry.enabled = enable;
        st.invalidate(task);
        Ok(())
    }

    /// Programs `task`'s regions into the MPU of `core`, which must be the
    /// calling core, unless that core has them already.
    pub fn apply_task_settings(&self, core: CoreId, task: TaskId) {
        if !self.is_enabled() {
            return;
        }
        let clock = self.kernel.clock;
        let start = clock.now();
        let dropped = {
            let mut st = self.lock();
            let st = &mut *st;
            let c = &mut st.cores[core.index()];
            if c.last_applied == Some(task) {
                st.stats.cache_hits = st.stats.cache_hits.wrapping_add(1);
                return;
            }

            let mut regs = [RegionRegs::DISABLED; MPU_DYNAMIC_REGIONS];
            let mut dropped = 0;
            if let Some(t) = st.tasks.get(task).filter(|t| t.is_protected()) {
                for (r, out) in t.programmed().iter().zip(&mut regs) {
                    *out = r.encode();
                }
                dropped = t.regions.len() - t.programmed().len();
            }
            for (i, r) in regs.into_iter().enumerate() {
                c.write(MPU_SYSTEM_REGIONS + i, r);
            }
            c.last_applied = Some(task);

            let elapsed = clock.now().micros_since(start);
            let s = &mut st.stats;
            s.apply_settings_count = s.apply_settings_count.wrapping_add(1);
            s.total_apply_us = s.total_apply_us.saturating_add(elapsed);
            s.max_apply_us = s.max_apply_us.max(elapsed);
            dropped
        };
        if dropped != 0 {
            klog!(
                self.kernel.locks,
                KernEvent::RegionsTruncated {
                    task,
                    dropped: dropped as u8
                }
            );
        }
    }

    /// Clears the task regions on `core` (the calling core) and forgets what
    /// was applied there, so the next task starts clean.
    pub fn reset_task_settings(&self, core: CoreId, _task: TaskId) {
        let mut st = self.lock();
        let c = &mut st.cores[core.index()];
        c.clear_dynamic();
        c.last_applied = None;
        st.stats.resets = st.stats.resets.wrapping_add(1);
    }

    /// Drops a deleted task's state and any core's cached copy of it.
    pub(crate) fn forget_task(&self, task: TaskId) {
        let mut st = self.lock();
        st.tasks.remove(task);
        st.invalidate(task);
    }

    /// Builds the region set a new task gets by default: its stack, its code
    /// if `code_start` is given, general RAM, and peripherals.
    ///
    /// Stack and code sizes are rounded up to a power of two, and their bases
    /// aligned down to match.
    pub fn create_default_config(
        &self,
        task: TaskId,
        stack_start: u32,
        stack_size: u32,
        code_start: Option<u32>,
        code_size: u32,
    ) -> Result<MpuConfig, KernError> {
        fn aligned(base: u32, size: u32) -> Result<(u32, u32), KernError> {
            let size = region_size_for(size)
                .ok_or(KernError::BadRegion(RegionError::SizeNotPowerOfTwo(size)))?;
            Ok((base & !(size - 1), size))
        }

        let mut config = MpuConfig::new(task);
        let (base, size) = aligned(stack_start, stack_size)?;
        config.push(RegionDesc::new(
            base,
            size,
            AccessClass::ReadWrite,
            RegionAttributes::CACHEABLE | RegionAttributes::BUFFERABLE,
        ))?;
        if let Some(code_start) = code_start {
            let (base, size) = aligned(code_start, code_size)?;
            config.push(RegionDesc::new(
                base,
                size,
                AccessClass::ReadExecute,
                RegionAttributes::CACHEABLE,
            ))?;
        }
        config.push(RegionDesc::new(
            RAM_BASE,
            RAM_SIZE,
            AccessClass::ReadWrite,
            RegionAttributes::CACHEABLE
                | RegionAttributes::BUFFERABLE
                | RegionAttributes::SHAREABLE,
        ))?;
        config.push(RegionDesc::new(
            PERIPHERAL_BASE,
            PERIPHERAL_SIZE,
            AccessClass::ReadWrite,
            RegionAttributes::BUFFERABLE | RegionAttributes::SHAREABLE,
        ))?;
        for r in &config.regions {
            r.validate()?;
        }
        Ok(config)
    }

    /// Finds the programmed task region that decides accesses to `addr`.
    /// Like the hardware, a later region wins over an earlier one.
    pub fn region_for(&self, task: TaskId, addr: u32) -> Option<RegionDesc> {
        let st = self.lock();
        let t = st.tasks.get(task).filter(|t| t.is_protected())?;
        t.programmed().iter().rev().find(|r| r.contains(addr)).copied()
    }

    /// Checks whether `task`'s regions allow an access of `len` bytes at
    /// `addr`. Tasks without protection are allowed everything.
    pub fn check_access(
        &self,
        task: TaskId,
        addr: u32,
        len: u32,
        write: bool,
    ) -> bool {
        if !self.is_enabled() || !self.is_protected(task) {
            return true;
        }
        match self.region_for(task, addr) {
            Some(r) => {
                r.covers(addr, len)
                    && if write {
                        r.access.can_write()
                    } else {
                        r.access.can_read()
                    }
            }
            None => false,
        }
    }

    pub fn is_protected(&self, task: TaskId) -> bool {
        let st = self.lock();
        st.tasks.get(task).is_some_and(MpuTaskState::is_protected)
    }

    /// Records an MPU violation in the fault table and passes it to the
    /// registered fault handler, if any.
    pub fn handle_violation(&self, task: TaskId, addr: u32, kind: FaultKind) {
        let record = self.kernel.faults().record(task, kind, addr);
        let handler = {
            let mut st = self.lock();
            st.stats.violations = st.stats.violations.wrapping_add(1);
            st.handler
        };
        if let (Ok(record), Some(h)) = (record, handler) {
            h.fault_recorded(&record);
        }
    }

    pub fn set_fault_handler(&self, handler: Option<&'static dyn FaultHandler>) {
        self.lock().handler = handler;
    }

    pub fn task_state(&self, task: TaskId) -> Option<MpuTaskState> {
        self.lock().tasks.get(task).cloned()
    }

    pub fn stats(&self) -> MpuStats {
        self.lock().stats
    }

    pub fn last_applied(&self, core: CoreId) -> Option<TaskId> {
        self.lock().cores[core.index()].last_applied
    }

    /// What was last written to each hardware region of `core`.
    pub fn programmed_regions(&self, core: CoreId) -> [RegionRegs; MPU_HW_REGIONS] {
        self.lock().cores[core.index()].shadow
    }

    pub fn status(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let (stats, last, tasks) = {
            let st = self.lock();
            let mut tasks: heapless::Vec<(TaskId, MpuTaskState), MPU_TABLE_SIZE> =
                heapless::Vec::new();
            for (id, t) in st.tasks.iter() {
                let _ = tasks.push((id, t.clone()));
            }
            let last = st.cores.map(|c| c.last_applied);
            (st.stats, last, tasks)
        };

        writeln!(
            out,
            "mpu: {}, {} regions ({} system, {} per task)",
            if self.is_enabled() { "enabled" } else { "disabled" },
            MPU_HW_REGIONS,
            MPU_SYSTEM_REGIONS,
            MPU_DYNAMIC_REGIONS,
        )?;
        let avg = if stats.apply_settings_count == 0 {
            0
        } else {
            stats.total_apply_us / u64::from(stats.apply_settings_count)
        };
        writeln!(
            out,
            "applies: {} (cache hits {}), avg {} us, max {} us, resets {}, violations {}",
            stats.apply_settings_count,
            stats.cache_hits,
            avg,
            stats.max_apply_us,
            stats.resets,
            stats.violations,
        )?;
        for core in CoreId::ALL {
            match last[core.index()] {
                Some(t) => writeln!(out, "{core}: task {t} applied")?,
                None => writeln!(out, "{core}: nothing applied")?,
            }
        }
        for (id, t) in &tasks {
            writeln!(
                out,
                "task {id}: {}{}",
                if t.enabled { "enabled" } else { "disabled" },
                if t.configured { "" } else { ", unconfigured" },
            )?;
            for (i, r) in t.regions.iter().enumerate() {
                writeln!(
                    out,
                    "  [{i}] {:#010x} {:>10} {:<18} {}{}{}{}",
                    r.base,
                    r.size,
                    r.access.name(),
                    if r.attributes.contains(RegionAttributes::CACHEABLE) { "C" } else { "-" },
                    if r.attributes.contains(RegionAttributes::BUFFERABLE) { "B" } else { "-" },
                    if r.attributes.contains(RegionAttributes::SHAREABLE) { "S" } else { "-" },
                    if i >= MPU_DYNAMIC_REGIONS { " (not programmed)" } else { "" },
                )?;
            }
        }
        Ok(())
    }
}
