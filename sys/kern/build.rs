// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use build_kconfig::KernelConfig;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    generate_consts()?;
    Ok(())
}

fn generate_consts() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=DUET_KCONFIG");

    // An unset variable gets the stock configuration, which is what host
    // builds and unit tests run against.
    let kconfig: KernelConfig = match env::var("DUET_KCONFIG") {
        Ok(text) => ron::de::from_str(&text)?,
        Err(env::VarError::NotPresent) => KernelConfig::default(),
        Err(e) => return Err(e.into()),
    };
    kconfig.validate()?;

    let out = &PathBuf::from(env::var_os("OUT_DIR").ok_or("OUT_DIR unset")?);
    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// See build.rs for details")?;

    let usizes = [
        ("TASKS_PER_CORE", kconfig.tasks_per_core),
        ("SPINLOCK_COUNT", kconfig.spinlocks),
        ("MPU_HW_REGIONS", kconfig.mpu_regions),
        ("MPU_SYSTEM_REGIONS", kconfig.system_regions),
        ("MAX_REGIONS_PER_TASK", kconfig.regions_per_task),
        ("MPU_TABLE_SIZE", kconfig.mpu_table),
        ("SECURITY_TABLE_SIZE", kconfig.security_table),
        ("SECURE_FN_CAPACITY", kconfig.secure_functions),
        ("FAULT_RECORDS", kconfig.fault_records),
        ("PHASE_OBSERVERS", kconfig.phase_observers),
        ("LOG_DEPTH", kconfig.log_depth),
    ];
    for (name, value) in usizes {
        writeln!(file, "pub const {name}: usize = {value};")?;
    }
    writeln!(
        file,
        "pub const TICK_PERIOD_MS: u32 = {};",
        kconfig.tick_period_ms
    )?;

    let mem = &kconfig.memory;
    let regions = [
        ("FLASH", mem.flash),
        ("RAM", mem.ram),
        ("PERIPHERAL", mem.peripherals),
        ("NSC", mem.nsc),
    ];
    for (name, region) in regions {
        writeln!(file, "pub const {name}_BASE: u32 = {:#010x};", region.base)?;
        writeln!(file, "pub const {name}_SIZE: u32 = {:#010x};", region.size)?;
    }
    writeln!(
        file,
        "pub const STACK_ARENA_BASE: u32 = {:#010x};",
        mem.stack_arena.base
    )?;
    writeln!(
        file,
        "pub const STACK_STRIDE: u32 = {:#010x};",
        mem.stack_arena.stride
    )?;

    Ok(())
}
