// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory protection: region descriptions and the MPU model the loader
//! allocates against.

use kerncore::{align_up, pow2_region_size};

/// Description of one memory region a process can touch.
///
/// The context-switch layer programs the MPU from these; the kernel uses the
/// same table to validate addresses processes hand it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionDesc {
    /// Address of start of region.
    pub base: u32,
    /// Size of region, in bytes.
    pub size: u32,
    /// What the process can do with the region.
    pub attributes: RegionAttributes,
}

impl RegionDesc {
    /// Tests whether `self` contains `addr`.
    pub fn contains(&self, addr: u32) -> bool {
        self.base <= addr && addr < self.end_addr()
    }

    /// Compute the address one past the end of this region. Regions never
    /// touch the end of the address space, so this doesn't overflow.
    pub fn end_addr(&self) -> u32 {
        self.base.wrapping_add(self.size)
    }
}

impl kerncore::MemoryRegion for RegionDesc {
    #[inline(always)]
    fn span(&self) -> core::ops::Range<u32> {
        self.base..self.end_addr()
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct RegionAttributes: u32 {
        /// Region can be read by the process.
        const READ = 1 << 0;
        /// Region can be written by the process.
        const WRITE = 1 << 1;
        /// Region can contain executable code for the process.
        const EXECUTE = 1 << 2;
        /// Region contains memory mapped registers.
        const DEVICE = 1 << 3;
        /// Region can be used for DMA or communication with other processors.
        const DMA = 1 << 4;
    }
}

/// The shape constraints of the memory protection unit, as far as process
/// loading is concerned.
pub trait Mpu {
    /// Picks a RAM region for a process needing at least `min_size` bytes,
    /// inside the unallocated range starting at `unallocated_start` and
    /// `unallocated_size` bytes long.
    ///
    /// Returns the region's start and size, which may be larger than asked
    /// for, or `None` if no region the MPU can express fits.
    fn allocate_app_memory_region(
        &self,
        unallocated_start: u32,
        unallocated_size: u32,
        min_size: u32,
    ) -> Option<(u32, u32)>;

    /// Checks whether the MPU can express a flash region of this shape.
    fn validate_flash_region(&self, start: u32, size: u32) -> bool;
}

/// ARMv7-M style MPU: every region is a power of two of at least 32 bytes,
/// naturally aligned.
#[derive(Copy, Clone, Debug, Default)]
pub struct PowerOfTwoMpu;

impl PowerOfTwoMpu {
    pub const MIN_REGION_SIZE: u32 = 32;
}

impl Mpu for PowerOfTwoMpu {
    fn allocate_app_memory_region(
        &self,
        unallocated_start: u32,
        unallocated_size: u32,
        min_size: u32,
    ) -> Option<(u32, u32)> {
        let size = pow2_region_size(min_size, Self::MIN_REGION_SIZE)?;
        let start = align_up(unallocated_start, size)?;
        fits(unallocated_start, unallocated_size, start, size)
            .then_some((start, size))
    }

    fn validate_flash_region(&self, start: u32, size: u32) -> bool {
        size >= Self::MIN_REGION_SIZE
            && size.is_power_of_two()
            && start % size == 0
    }
}

/// MPU with regions of any size that is a multiple of a fixed granule, on
/// granule boundaries (ARMv8-M style).
#[derive(Copy, Clone, Debug)]
pub struct GranularMpu {
    granularity: u32,
}

impl GranularMpu {
    /// # Panics
    ///
    /// If `granularity` is not a power of two.
    pub const fn new(granularity: u32) -> Self {
        assert!(granularity.is_power_of_two());
        Self { granularity }
    }
}

impl Mpu for GranularMpu {
    fn allocate_app_memory_region(
        &self,
        unallocated_start: u32,
        unallocated_size: u32,
        min_size: u32,
    ) -> Option<(u32, u32)> {
        let size = align_up(min_size.max(1), self.granularity)?;
        let start = align_up(unallocated_start, self.granularity)?;
        fits(unallocated_start, unallocated_size, start, size)
            .then_some((start, size))
    }

    fn validate_flash_region(&self, start: u32, size: u32) -> bool {
        size != 0
            && start % self.granularity == 0
            && size % self.granularity == 0
    }
}

/// Checks that `start..start + size` lies inside the unallocated range.
fn fits(
    unallocated_start: u32,
    unallocated_size: u32,
    start: u32,
    size: u32,
) -> bool {
    let Some(pool_end) = unallocated_start.checked_add(unallocated_size) else {
        return false;
    };
    let Some(end) = start.checked_add(size) else {
        return false;
    };
    kerncore::range_contains(&(unallocated_start..pool_end), &(start..end))
}
