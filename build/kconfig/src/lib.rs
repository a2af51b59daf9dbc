// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};

/// Kernel configuration passed into the kernel build.
///
/// The kernel's build script deserializes this from the `DUET_KCONFIG`
/// environment variable (as RON) and turns every field into a `pub const`.
/// Any field left out of the RON document takes its default, so an empty
/// document `()` describes the stock configuration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Number of task slots in each core's task table.
    pub tasks_per_core: usize,
    /// Number of hardware spinlocks in the lock bank.
    pub spinlocks: usize,
    /// Number of regions the MPU implements.
    pub mpu_regions: usize,
    /// Number of MPU regions reserved for system-wide defaults. Regions from
    /// this index up to `mpu_regions` are reprogrammed per task.
    pub system_regions: usize,
    /// Maximum number of regions a single task may describe.
    pub regions_per_task: usize,
    /// Capacity of the per-task MPU state table.
    pub mpu_table: usize,
    /// Capacity of the per-task security state table.
    pub security_table: usize,
    /// Capacity of the secure-function registry.
    pub secure_functions: usize,
    /// Number of distinct fault records kept.
    pub fault_records: usize,
    /// Number of spinlock phase observers that can be registered.
    pub phase_observers: usize,
    /// Depth of the kernel event log.
    pub log_depth: usize,
    /// Period of the scheduler tick.
    pub tick_period_ms: u32,
    pub memory: MemoryMap,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tasks_per_core: 16,
            spinlocks: 32,
            mpu_regions: 8,
            system_regions: 4,
            regions_per_task: 8,
            mpu_table: 32,
            security_table: 32,
            secure_functions: 32,
            fault_records: 16,
            phase_observers: 8,
            log_depth: 64,
            tick_period_ms: 10,
            memory: MemoryMap::default(),
        }
    }
}

/// Physical memory layout used to build default protection.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryMap {
    /// Code. Programmed read-execute in a system region.
    pub flash: RegionConfig,
    /// General RAM. Programmed read-write in a system region.
    pub ram: RegionConfig,
    /// Memory-mapped peripherals.
    pub peripherals: RegionConfig,
    /// Where non-secure-callable veneers for registered secure functions are
    /// placed, 8 bytes apiece.
    pub nsc: RegionConfig,
    /// Task stacks are carved out of this arena, one `stride`-sized slot per
    /// task table entry, core 0's table first.
    pub stack_arena: StackArena,
}

impl Default for MemoryMap {
    fn default() -> Self {
        Self {
            flash: RegionConfig {
                base: 0x1000_0000,
                size: 0x0040_0000,
            },
            ram: RegionConfig {
                base: 0x2000_0000,
                size: 0x0008_0000,
            },
            peripherals: RegionConfig {
                base: 0x4000_0000,
                size: 0x2000_0000,
            },
            nsc: RegionConfig {
                base: 0x1007_f000,
                size: 0x0000_1000,
            },
            stack_arena: StackArena {
                base: 0x2004_0000,
                stride: 0x800,
            },
        }
    }
}

/// Description of one memory region.
///
/// On ARMv7-M regions must be a power of two of at least 32 bytes, and
/// naturally aligned for their size. We hold every configured region to that
/// rule, even ones that are only used to derive other regions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub base: u32,
    pub size: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StackArena {
    pub base: u32,
    pub stride: u32,
}

/// Smallest region the MPU can describe.
pub const MIN_REGION_SIZE: u32 = 32;

/// Size of one non-secure-callable veneer (an `SG` followed by a `B.W`).
pub const VENEER_SIZE: u32 = 8;

/// Reasons a `KernelConfig` can be rejected.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// A count that must be non-zero was zero.
    ZeroCount(&'static str),
    /// The system regions leave no room for per-task regions.
    NoDynamicRegions { mpu_regions: usize, system_regions: usize },
    /// Fewer than the four defaults (fallback, flash, RAM, peripherals).
    TooFewSystemRegions(usize),
    BadRegionSize { name: &'static str, size: u32 },
    MisalignedRegion { name: &'static str, base: u32, size: u32 },
    RegionWraps { name: &'static str },
    /// The veneer region can't hold one veneer per registry slot.
    VeneerRegionTooSmall { needed: u64, size: u32 },
    /// The stack arena doesn't fit inside RAM.
    StackArenaOutsideRam,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroCount(what) => write!(f, "{what} must be non-zero"),
            Self::NoDynamicRegions {
                mpu_regions,
                system_regions,
            } => write!(
                f,
                "{system_regions} system regions leave none of the \
                 {mpu_regions} MPU regions for tasks"
            ),
            Self::TooFewSystemRegions(n) => {
                write!(f, "need at least 4 system regions, got {n}")
            }
            Self::BadRegionSize { name, size } => write!(
                f,
                "{name}: size {size:#x} is not a power of two >= \
                 {MIN_REGION_SIZE}"
            ),
            Self::MisalignedRegion { name, base, size } => write!(
                f,
                "{name}: base {base:#010x} is not aligned to size {size:#x}"
            ),
            Self::RegionWraps { name } => {
                write!(f, "{name}: region wraps the address space")
            }
            Self::VeneerRegionTooSmall { needed, size } => write!(
                f,
                "veneer region of {size:#x} bytes can't hold {needed:#x} \
                 bytes of veneers"
            ),
            Self::StackArenaOutsideRam => {
                f.write_str("stack arena does not fit inside RAM")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl RegionConfig {
    fn check(&self, name: &'static str) -> Result<(), ConfigError> {
        if self.size < MIN_REGION_SIZE || !self.size.is_power_of_two() {
            return Err(ConfigError::BadRegionSize {
                name,
                size: self.size,
            });
        }
        if self.base & (self.size - 1) != 0 {
            return Err(ConfigError::MisalignedRegion {
                name,
                base: self.base,
                size: self.size,
            });
        }
        if self.end() > 1 << 32 {
            return Err(ConfigError::RegionWraps { name });
        }
        Ok(())
    }

    /// One past the last byte of the region, widened so that a region ending
    /// at the top of the address space is representable.
    pub fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.size)
    }
}

impl KernelConfig {
    /// Number of MPU regions available for per-task assignment.
    pub fn dynamic_regions(&self) -> usize {
        self.mpu_regions.saturating_sub(self.system_regions)
    }

    /// Total number of task slots across both cores.
    pub fn task_slots(&self) -> usize {
        self.tasks_per_core * 2
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("tasks_per_core", self.tasks_per_core),
            ("spinlocks", self.spinlocks),
            ("mpu_regions", self.mpu_regions),
            ("regions_per_task", self.regions_per_task),
            ("mpu_table", self.mpu_table),
            ("security_table", self.security_table),
            ("secure_functions", self.secure_functions),
            ("fault_records", self.fault_records),
            ("phase_observers", self.phase_observers),
            ("log_depth", self.log_depth),
            ("tick_period_ms", self.tick_period_ms as usize),
        ];
        for (name, n) in counts {
            if n == 0 {
                return Err(ConfigError::ZeroCount(name));
            }
        }
        if self.system_regions < 4 {
            return Err(ConfigError::TooFewSystemRegions(self.system_regions));
        }
        if self.system_regions >= self.mpu_regions {
            return Err(ConfigError::NoDynamicRegions {
                mpu_regions: self.mpu_regions,
                system_regions: self.system_regions,
            });
        }

        let mem = &self.memory;
        mem.flash.check("flash")?;
        mem.ram.check("ram")?;
        mem.peripherals.check("peripherals")?;
        mem.nsc.check("nsc")?;

        let needed = self.secure_functions as u64 * u64::from(VENEER_SIZE);
        if needed > u64::from(mem.nsc.size) {
            return Err(ConfigError::VeneerRegionTooSmall {
                needed,
                size: mem.nsc.size,
            });
        }

        let arena = &mem.stack_arena;
        if arena.stride < MIN_REGION_SIZE || !arena.stride.is_power_of_two() {
            return Err(ConfigError::BadRegionSize {
                name: "stack_arena",
                size: arena.stride,
            });
        }
        if arena.base & (arena.stride - 1) != 0 {
            return Err(ConfigError::MisalignedRegion {
                name: "stack_arena",
                base: arena.base,
                size: arena.stride,
            });
        }
        let arena_end = u64::from(arena.base)
            + self.task_slots() as u64 * u64::from(arena.stride);
        if u64::from(arena.base) < u64::from(mem.ram.base)
            || arena_end > mem.ram.end()
        {
            return Err(ConfigError::StackArenaOutsideRam);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = KernelConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.dynamic_regions(), 4);
    }

    #[test]
    fn empty_ron_document_means_defaults() {
        let config: KernelConfig = ron::de::from_str("()").unwrap();
        assert_eq!(config, KernelConfig::default());
    }

    #[test]
    fn partial_ron_document_overrides_fields() {
        let config: KernelConfig =
            ron::de::from_str("(tasks_per_core: 4, spinlocks: 16)").unwrap();
        assert_eq!(config.tasks_per_core, 4);
        assert_eq!(config.spinlocks, 16);
        assert_eq!(config.log_depth, 64);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn system_regions_must_leave_room() {
        let config = KernelConfig {
            system_regions: 8,
            ..KernelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NoDynamicRegions { .. })
        ));
    }

    #[test]
    fn zero_counts_rejected() {
        let config = KernelConfig {
            spinlocks: 0,
            ..KernelConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroCount("spinlocks"))
        );
    }

    #[test]
    fn regions_must_be_pow2_and_aligned() {
        let mut config = KernelConfig::default();
        config.memory.ram.size = 0x7_0000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadRegionSize { name: "ram", .. })
        ));

        let mut config = KernelConfig::default();
        config.memory.flash.base = 0x1000_0100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MisalignedRegion { name: "flash", .. })
        ));
    }

    #[test]
    fn veneer_region_must_fit_registry() {
        let mut config = KernelConfig::default();
        config.memory.nsc = RegionConfig {
            base: 0x1007_ff00,
            size: 0x100,
        };
        config.secure_functions = 33;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::VeneerRegionTooSmall { .. })
        ));
    }

    #[test]
    fn stack_arena_must_sit_in_ram() {
        let mut config = KernelConfig::default();
        config.memory.stack_arena.base = 0x3000_0000;
        assert_eq!(
            config.validate(),
            Err(ConfigError::StackArenaOutsideRam)
        );
    }
}
