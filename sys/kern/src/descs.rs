// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory region descriptors and their MPU encoding.

use abi::{AccessClass, RegionAttributes};

use crate::err::RegionError;

/// Smallest region the MPU can describe.
pub const MIN_REGION_SIZE: u32 = 32;

/// Description of one protected memory region.
///
/// Regions can overlap. When they do, the higher-numbered hardware region
/// wins, which is why per-task regions sit above the system defaults.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionDesc {
    /// Address of start of region. Must be naturally aligned for the size.
    pub base: u32,
    /// Size of region, in bytes. Must be a power of two no smaller than
    /// `MIN_REGION_SIZE`.
    pub size: u32,
    pub access: AccessClass,
    pub attributes: RegionAttributes,
}

impl RegionDesc {
    pub const fn new(
        base: u32,
        size: u32,
        access: AccessClass,
        attributes: RegionAttributes,
    ) -> Self {
        Self {
            base,
            size,
            access,
            attributes,
        }
    }

    /// Checks the region against the hardware's rules.
    pub fn validate(&self) -> Result<(), RegionError> {
        if !self.size.is_power_of_two() {
            return Err(RegionError::SizeNotPowerOfTwo(self.size));
        }
        if self.size < MIN_REGION_SIZE {
            return Err(RegionError::TooSmall(self.size));
        }
        if self.base & (self.size - 1) != 0 {
            return Err(RegionError::Misaligned {
                base: self.base,
                size: self.size,
            });
        }
        if self.end_addr() > 1 << 32 {
            return Err(RegionError::Wraps);
        }
        Ok(())
    }

    /// Tests whether `self` contains `addr`.
    pub fn contains(&self, addr: u32) -> bool {
        self.base <= addr && u64::from(addr) < self.end_addr()
    }

    /// Tests whether `self` contains all of `[addr, addr + len)`.
    pub fn covers(&self, addr: u32, len: u32) -> bool {
        let end = u64::from(addr) + u64::from(len.max(1));
        self.base <= addr && end <= self.end_addr()
    }

    /// Compute the address one past the end of this region, widened so a
    /// region that ends at the top of the address space can say so.
    pub fn end_addr(&self) -> u64 {
        u64::from(self.base) + u64::from(self.size)
    }

    /// Hardware encoding of the size: `log2(size) - 1`.
    ///
    /// Only meaningful for sizes that passed `validate`.
    pub fn size_field(&self) -> u32 {
        // log2(N) = bits_in_word - 1 - clz(N), and we want log2 minus one.
        // ARMv7-M has CLZ but no CTZ, hence leading zeros.
        30 - self.size.leading_zeros()
    }

    /// Computes the RBAR/RASR pair for this region.
    ///
    /// The AP encodings are chosen such that we never deny *privileged* code
    /// (i.e. us) access to the memory.
    pub fn encode(&self) -> RegionRegs {
        let xn = !self.access.can_execute();
        let ap = if self.access.can_write() {
            0b011
        } else if self.access.can_read() {
            0b010
        } else {
            0b001
        };

        // TEX/C/B select the memory type; see table B3-13 in the ARMv7-M ARM.
        let atts = self.attributes;
        let cacheable = atts.contains(RegionAttributes::CACHEABLE);
        let bufferable = atts.contains(RegionAttributes::BUFFERABLE);
        let (tex, cb) = match (cacheable, bufferable) {
            // Write-back, read and write allocate.
            (true, true) => (0b001, 0b11),
            // Write-through, no write allocate.
            (true, false) => (0b000, 0b10),
            // Device.
            (false, true) => (0b000, 0b01),
            // Normal, non-cacheable.
            (false, false) => (0b001, 0b00),
        };
        let s = u32::from(atts.contains(RegionAttributes::SHAREABLE));
        let scb = s << 2 | cb;

        let rasr = (xn as u32) << 28
            | ap << 24
            | tex << 19
            | scb << 16
            | self.size_field() << 1
            | 1;
        RegionRegs {
            rbar: self.base,
            rasr,
        }
    }
}

/// Contents of one MPU region's RBAR and RASR, without the region number.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RegionRegs {
    pub rbar: u32,
    pub rasr: u32,
}

impl RegionRegs {
    /// A region slot with RASR.ENABLE clear.
    pub const DISABLED: Self = Self { rbar: 0, rasr: 0 };

    pub fn is_enabled(&self) -> bool {
        self.rasr & 1 != 0
    }
}

/// Rounds `size` up to a power of two no smaller than `MIN_REGION_SIZE`.
/// Returns `None` if that doesn't fit in a `u32`.
pub fn region_size_for(size: u32) -> Option<u32> {
    size.max(MIN_REGION_SIZE).checked_next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw(base: u32, size: u32) -> RegionDesc {
        RegionDesc::new(
            base,
            size,
            AccessClass::ReadWrite,
            RegionAttributes::CACHEABLE | RegionAttributes::BUFFERABLE,
        )
    }

    #[test]
    fn size_field_is_log2_minus_one() {
        assert_eq!(rw(0, 32).size_field(), 4);
        assert_eq!(rw(0, 1024).size_field(), 9);
        assert_eq!(rw(0, 0x8000_0000).size_field(), 30);
    }

    #[test]
    fn validation() {
        assert_eq!(rw(0x2000_0400, 1024).validate(), Ok(()));
        assert_eq!(
            rw(0x2000_0000, 1000).validate(),
            Err(RegionError::SizeNotPowerOfTwo(1000))
        );
        assert_eq!(rw(0x2000_0000, 16).validate(), Err(RegionError::TooSmall(16)));
        assert_eq!(
            rw(0x2000_0200, 1024).validate(),
            Err(RegionError::Misaligned {
                base: 0x2000_0200,
                size: 1024
            })
        );
        assert_eq!(rw(0, 0).validate(), Err(RegionError::SizeNotPowerOfTwo(0)));
    }

    #[test]
    fn encoding_of_stack_region() {
        let regs = rw(0x2000_0400, 1024).encode();
        assert_eq!(regs.rbar, 0x2000_0400);
        // XN, AP=011, TEX=001, S=0 C=1 B=1, SIZE=9, ENABLE
        let expected = 1 << 28 | 0b011 << 24 | 0b001 << 19 | 0b011 << 16 | 9 << 1 | 1;
        assert_eq!(regs.rasr, expected);
        assert!(regs.is_enabled());
    }

    #[test]
    fn encoding_of_code_and_device() {
        let code = RegionDesc::new(
            0x1000_0000,
            0x40_0000,
            AccessClass::ReadExecute,
            RegionAttributes::CACHEABLE,
        )
        .encode();
        assert_eq!(code.rasr >> 28 & 1, 0, "code must be executable");
        assert_eq!(code.rasr >> 24 & 0b111, 0b010);

        let dev = RegionDesc::new(
            0x4000_0000,
            0x2000_0000,
            AccessClass::ReadWrite,
            RegionAttributes::BUFFERABLE | RegionAttributes::SHAREABLE,
        )
        .encode();
        assert_eq!(dev.rasr >> 16 & 0b111, 0b101);
        assert_eq!(dev.rasr >> 19 & 0b111, 0);
    }

    #[test]
    fn contains_and_covers() {
        let r = rw(0x2000_0000, 256);
        assert!(r.contains(0x2000_0000));
        assert!(r.contains(0x2000_00ff));
        assert!(!r.contains(0x2000_0100));
        assert!(r.covers(0x2000_00f0, 16));
        assert!(!r.covers(0x2000_00f0, 17));
    }

    #[test]
    fn rounding() {
        assert_eq!(region_size_for(1), Some(32));
        assert_eq!(region_size_for(1000), Some(1024));
        assert_eq!(region_size_for(1024), Some(1024));
        assert_eq!(region_size_for(0x8000_0001), None);
    }
}
