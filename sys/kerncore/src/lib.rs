// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent memory arithmetic for the kernel.
//!
//! Everything in here is pure and free of kernel types, so that it can be
//! exercised on the host. The kernel wraps these routines with its own region
//! and slice types.

// std is available to the unit tests only. rust-analyzer builds with `test`
// set, so non-no_std code can sneak in here without your editor noticing.
#![cfg_attr(not(test), no_std)]
#![forbid(clippy::wildcard_imports)]

use core::ops::Range;

/// A stretch of a process's address space that carries uniform rights.
///
/// Attributes are not part of this trait; callers check them with a
/// predicate passed to [`buffer_covered`].
pub trait MemoryRegion {
    /// Addresses covered by the region. The range never wraps.
    fn span(&self) -> Range<u32>;
}

impl<T: MemoryRegion> MemoryRegion for &T {
    #[inline(always)]
    fn span(&self) -> Range<u32> {
        (**self).span()
    }
}

/// Decides whether `buffer` lies entirely in regions of `table` that satisfy
/// `usable`.
///
/// The buffer may run across several regions as long as they abut; a gap,
/// or a region `usable` rejects, fails the check. An empty buffer still has
/// to point somewhere usable: its start must fall inside a usable region or
/// exactly at its end, so that a process can share a zero-length buffer at
/// its break but not at an arbitrary address.
///
/// # Preconditions
///
/// `buffer.start <= buffer.end`. `table` is sorted by start address and its
/// regions do not overlap.
#[must_use]
pub fn buffer_covered<R: MemoryRegion>(
    buffer: Range<u32>,
    table: &[R],
    usable: impl Fn(&R) -> bool,
) -> bool {
    debug_assert!(buffer.start <= buffer.end);
    let mut cursor = buffer.start;
    for region in table.iter().filter(|r| usable(*r)) {
        let span = region.span();
        if span.end < cursor {
            continue;
        }
        if span.start > cursor {
            return false;
        }
        if buffer.end <= span.end {
            return true;
        }
        cursor = span.end;
    }
    false
}

/// Rounds `value` up to the next multiple of `align`, which must be a power
/// of two. Returns `None` on overflow.
#[must_use]
pub fn align_up(value: u32, align: u32) -> Option<u32> {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Rounds `value` down to a multiple of `align`, which must be a power of
/// two.
#[must_use]
pub fn align_down(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Computes the size of a naturally aligned power-of-two region that can hold
/// at least `min_size` bytes, and is no smaller than `floor`.
///
/// This is the shape an ARMv7-M style MPU region has to take. Returns `None`
/// if no such region fits in the 32-bit address space.
#[must_use]
pub fn pow2_region_size(min_size: u32, floor: u32) -> Option<u32> {
    u32::max(min_size, floor).checked_next_power_of_two()
}

/// Checks that `inner` lies entirely within `outer`.
///
/// An empty `inner` is contained if its start lies within `outer` or at its
/// end.
#[must_use]
pub fn range_contains(outer: &Range<u32>, inner: &Range<u32>) -> bool {
    inner.start <= inner.end
        && inner.start >= outer.start
        && inner.end <= outer.end
}
