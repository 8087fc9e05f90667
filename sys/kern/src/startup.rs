// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process loading.
//!
//! At boot the board hands the kernel the flash area holding the packed
//! application images and the RAM pool that processes may use. The loader
//! walks the images front to back. Each one that parses, is enabled, and
//! fits gets a process slot and a piece of the pool; each one that doesn't
//! is logged, recorded in the trace, and skipped by its declared length.
//!
//! The walk ends at the first image with a zero length, at the end of flash,
//! at bytes that don't look like a header at all (erased flash), or when the
//! process table is full.

use core::fmt;

use heapless::Vec;
use kerncore::align_up;
use tbf::{MalformedHeader, TbfHeader, BASE_HEADER_LEN};

use crate::config::{KernelConfig, TRACE_DEPTH};
use crate::mpu::Mpu;
use crate::process::Process;
use crate::trace::{Ringbuf, Trace};

/// The flash area holding application images.
#[derive(Copy, Clone, Debug)]
pub struct FlashRegion<'a> {
    /// Address of `bytes[0]`.
    pub start: u32,
    pub bytes: &'a [u8],
}

/// RAM available for processes.
#[derive(Debug)]
pub struct RamPool<'a> {
    /// Address of `bytes[0]`.
    pub start: u32,
    pub bytes: &'a mut [u8],
}

/// Loading as a whole failed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoadError {
    /// Images were present, but not one of them could be loaded.
    NoProcessesLoaded { failures: usize },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoProcessesLoaded { failures } => {
                write!(f, "no processes loaded ({failures} images failed)")
            }
        }
    }
}

/// Why one image was skipped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoadFailure {
    Malformed(MalformedHeader),
    /// The image is not marked enabled.
    Disabled,
    /// The image has no Main record; it only pads flash.
    PaddingOnly,
    /// The MPU can't protect the image's flash as placed.
    FlashRegionInvalid,
    /// The image was linked to run from a different flash address.
    FixedFlashMismatch { expected: u32, actual: u32 },
    /// The image was linked for a RAM address we can't give it.
    FixedRamUnavailable { requested: u32 },
    /// Not enough RAM left in the pool, after MPU rounding.
    OutOfMemory { requested: u32 },
}

impl LoadFailure {
    /// Disabled and padding images are skipped on purpose; everything else
    /// is an image that should have loaded and didn't.
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Disabled | Self::PaddingOnly)
    }
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed header: {e}"),
            Self::Disabled => f.write_str("disabled"),
            Self::PaddingOnly => f.write_str("padding"),
            Self::FlashRegionInvalid => {
                f.write_str("flash region not expressible by the MPU")
            }
            Self::FixedFlashMismatch { expected, actual } => write!(
                f,
                "linked for flash {expected:#010x}, placed at {actual:#010x}"
            ),
            Self::FixedRamUnavailable { requested } => {
                write!(f, "fixed RAM address {requested:#010x} unavailable")
            }
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory ({requested} bytes needed)")
            }
        }
    }
}

/// Loads every runnable image in `flash` into `processes`, carving RAM from
/// `ram`.
///
/// Per-image failures don't stop the walk. The result is an error only if
/// some image failed and none loaded.
pub(crate) fn load_processes<'a, const N: usize>(
    flash: FlashRegion<'a>,
    mut ram: RamPool<'a>,
    mpu: &dyn Mpu,
    config: &KernelConfig,
    processes: &mut Vec<Process<'a>, N>,
    trace: &mut Ringbuf<Trace, TRACE_DEPTH>,
) -> Result<(), LoadError> {
    let mut offset = 0;
    let mut failures = 0;

    while offset < flash.bytes.len() {
        let remaining = &flash.bytes[offset..];
        let flash_start = flash.start.wrapping_add(offset as u32);

        let Some(lengths) = tbf::peek_lengths(remaining) else {
            klog!(debug: "no image header at {:#010x}", flash_start);
            break;
        };
        let total = lengths.total_size as usize;
        if total == 0 {
            break;
        }
        if total < BASE_HEADER_LEN || total % 4 != 0 {
            // Without a usable length there's no way to find the next image.
            let reason = LoadFailure::Malformed(MalformedHeader::BadLength);
            failures += 1;
            skipped(trace, flash_start, reason);
            break;
        }
        if total > remaining.len() {
            let reason = LoadFailure::Malformed(MalformedHeader::Truncated);
            failures += 1;
            skipped(trace, flash_start, reason);
            break;
        }
        if processes.is_full() {
            klog!(
                warn: "process table full, ignoring images from {:#010x}",
                flash_start
            );
            break;
        }

        let image = &remaining[..total];
        match load_one(processes.len(), image, flash_start, &mut ram, mpu, config)
        {
            Ok(process) => {
                klog!(
                    info: "loaded {} ({}) flash {:#010x} ram {:#010x}+{:#x}",
                    process.name(),
                    process.id(),
                    flash_start,
                    process.memory_start(),
                    process.memory_end() - process.memory_start()
                );
                trace_event!(
                    trace,
                    Trace::Loaded {
                        index: process.index(),
                        flash_start,
                        memory_start: process.memory_start(),
                        memory_size: process.memory_end()
                            - process.memory_start(),
                    }
                );
                // Can't fail: capacity checked above.
                let _ = processes.push(process);
            }
            Err(reason) => {
                if reason.is_error() {
                    failures += 1;
                }
                skipped(trace, flash_start, reason);
            }
        }
        offset += total;
    }

    if processes.is_empty() && failures > 0 {
        klog!(error: "no processes loaded, {} images failed", failures);
        return Err(LoadError::NoProcessesLoaded { failures });
    }
    Ok(())
}

fn skipped(
    trace: &mut Ringbuf<Trace, TRACE_DEPTH>,
    flash_start: u32,
    reason: LoadFailure,
) {
    if reason.is_error() {
        klog!(warn: "skipping image at {:#010x}: {}", flash_start, reason);
    } else {
        klog!(info: "skipping image at {:#010x}: {}", flash_start, reason);
    }
    trace_event!(
        trace,
        Trace::LoadSkipped {
            flash_start,
            reason,
        }
    );
}

/// Checks one image and, if it passes, gives it RAM from `ram` and builds
/// its process. The pool is only touched once every check has passed.
fn load_one<'a>(
    index: usize,
    image: &'a [u8],
    flash_start: u32,
    ram: &mut RamPool<'a>,
    mpu: &dyn Mpu,
    config: &KernelConfig,
) -> Result<Process<'a>, LoadFailure> {
    let header = match tbf::parse(image) {
        Ok(Some(h)) => h,
        Ok(None) => return Err(LoadFailure::PaddingOnly),
        Err(e) => return Err(LoadFailure::Malformed(e)),
    };
    if !header.is_app() {
        return Err(LoadFailure::PaddingOnly);
    }
    if !header.enabled() {
        return Err(LoadFailure::Disabled);
    }
    if !mpu.validate_flash_region(flash_start, header.total_size()) {
        return Err(LoadFailure::FlashRegionInvalid);
    }
    let actual = flash_start.wrapping_add(header.protected_len());
    if let Some(expected) = header.fixed_address_flash() {
        if expected != actual {
            return Err(LoadFailure::FixedFlashMismatch { expected, actual });
        }
    }

    let (start, size, app_ram) = place_in_ram(&header, ram, mpu, config)?;

    let pool = core::mem::take(&mut ram.bytes);
    let (_skipped, rest) = pool.split_at_mut((start - ram.start) as usize);
    let (memory, rest) = rest.split_at_mut(size as usize);
    ram.bytes = rest;
    ram.start = start + size;

    let initial_break = start + app_ram;
    let grant_floor = start + size - config.grant_region_size;
    Ok(Process::new(
        index,
        header,
        image,
        flash_start,
        memory,
        start,
        initial_break,
        grant_floor,
    ))
}

/// Picks where in the pool the process goes. Returns the region's start and
/// size, and the RAM the process itself asked for (word aligned).
fn place_in_ram(
    header: &TbfHeader<'_>,
    ram: &RamPool<'_>,
    mpu: &dyn Mpu,
    config: &KernelConfig,
) -> Result<(u32, u32, u32), LoadFailure> {
    let min_ram = header.minimum_ram_size();
    let app_ram = align_up(min_ram, 4)
        .ok_or(LoadFailure::OutOfMemory { requested: min_ram })?;
    let requested = app_ram
        .checked_add(config.grant_region_size)
        .ok_or(LoadFailure::OutOfMemory { requested: u32::MAX })?;
    let pool_len = ram.bytes.len() as u32;

    let (search_start, search_len) = match header.fixed_address_ram() {
        Some(addr) => {
            let unavailable = LoadFailure::FixedRamUnavailable { requested: addr };
            let skip = addr.checked_sub(ram.start).ok_or(unavailable)?;
            if skip >= pool_len {
                return Err(unavailable);
            }
            (addr, pool_len - skip)
        }
        None => (ram.start, pool_len),
    };

    let (start, size) = mpu
        .allocate_app_memory_region(search_start, search_len, requested)
        .ok_or(LoadFailure::OutOfMemory { requested })?;
    if let Some(addr) = header.fixed_address_ram() {
        if start != addr {
            return Err(LoadFailure::FixedRamUnavailable { requested: addr });
        }
    }
    Ok((start, size, app_ram))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FaultPolicy, SchedulerPolicy};
    use crate::mpu::{GranularMpu, PowerOfTwoMpu};
    use crate::testutil::{end_marker, AppSpec, FLASH_BASE, RAM_BASE};
    use abi::ProcessState;

    fn config() -> KernelConfig {
        KernelConfig {
            grant_region_size: 0x100,
            scheduler: SchedulerPolicy::Cooperative,
            fault_policy: FaultPolicy::Stop,
            trace_syscalls: false,
        }
    }

    fn load<'a, const N: usize>(
        flash: &'a [u8],
        ram: &'a mut [u8],
        mpu: &dyn Mpu,
        processes: &mut Vec<Process<'a>, N>,
        trace: &mut Ringbuf<Trace, TRACE_DEPTH>,
    ) -> Result<(), LoadError> {
        load_processes(
            FlashRegion {
                start: FLASH_BASE,
                bytes: flash,
            },
            RamPool {
                start: RAM_BASE,
                bytes: ram,
            },
            mpu,
            &config(),
            processes,
            trace,
        )
    }

    fn skips(trace: &Ringbuf<Trace, TRACE_DEPTH>) -> std::vec::Vec<(u32, LoadFailure)> {
        trace
            .iter()
            .filter_map(|e| match e.payload {
                Trace::LoadSkipped {
                    flash_start,
                    reason,
                } => Some((flash_start, reason)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn walk_stops_at_zero_length_image() {
        let mut flash = AppSpec::new("first", 0x400, 0x100).build();
        flash.extend(end_marker());
        flash.extend(AppSpec::new("hidden", 0x400, 0x100).build());
        let mut ram = vec![0; 0x2000];
        let mut procs = Vec::<Process<'_>, 4>::new();
        let mut trace = Ringbuf::new(Trace::None);

        load(&flash, &mut ram, &PowerOfTwoMpu, &mut procs, &mut trace).unwrap();

        assert_eq!(procs.len(), 1);
        let p = &procs[0];
        assert_eq!(p.name(), "first");
        assert_eq!(*p.state(), ProcessState::Running);
        assert_eq!(p.flash_start(), FLASH_BASE);
        assert_eq!(p.memory_start(), RAM_BASE);
        // 0x100 for the app plus 0x100 of grants, already a power of two.
        assert_eq!(p.memory_end(), RAM_BASE + 0x200);
        assert_eq!(p.save().pc, p.entry_point());
        assert!(matches!(
            trace.last().map(|e| e.payload),
            Some(Trace::Loaded { index: 0, .. })
        ));
    }

    #[test]
    fn processes_get_disjoint_ram() {
        let mut flash = AppSpec::new("a", 0x400, 0x180).build();
        flash.extend(AppSpec::new("b", 0x400, 0x40).build());
        flash.extend(AppSpec::new("c", 0x800, 0x400).build());
        let mut ram = vec![0; 0x4000];
        let mut procs = Vec::<Process<'_>, 4>::new();
        let mut trace = Ringbuf::new(Trace::None);

        load(&flash, &mut ram, &PowerOfTwoMpu, &mut procs, &mut trace).unwrap();

        assert_eq!(procs.len(), 3);
        for pair in procs.windows(2) {
            assert!(pair[0].memory_end() <= pair[1].memory_start());
        }
        // Rounded to 0x400 and aligned to it.
        assert_eq!(procs[0].memory_start(), RAM_BASE);
        assert_eq!(procs[0].memory_end(), RAM_BASE + 0x400);
        assert_eq!(procs[1].memory_start(), RAM_BASE + 0x400);
        assert_eq!(procs[2].memory_start(), RAM_BASE + 0x800);
        assert_eq!(procs[2].flash_start(), FLASH_BASE + 0x800);
    }

    #[test]
    fn skipped_images_dont_stop_the_walk() {
        let mut flash = AppSpec::new("off", 0x400, 0x100).disabled().build();
        flash.extend(AppSpec::new("pad", 0x400, 0).no_main().build());
        let mut broken = AppSpec::new("broken", 0x400, 0x100).build();
        broken[20] ^= 0x40;
        flash.extend(broken);
        flash.extend(AppSpec::new("greedy", 0x400, 0x10_0000).build());
        flash.extend(AppSpec::new("ok", 0x400, 0x100).build());
        let mut ram = vec![0; 0x1000];
        let mut procs = Vec::<Process<'_>, 4>::new();
        let mut trace = Ringbuf::new(Trace::None);

        load(&flash, &mut ram, &PowerOfTwoMpu, &mut procs, &mut trace).unwrap();

        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].name(), "ok");
        assert_eq!(procs[0].flash_start(), FLASH_BASE + 0x1000);
        let skips = skips(&trace);
        assert_eq!(skips.len(), 4);
        assert_eq!(skips[0], (FLASH_BASE, LoadFailure::Disabled));
        assert_eq!(skips[1], (FLASH_BASE + 0x400, LoadFailure::PaddingOnly));
        assert!(matches!(
            skips[2],
            (_, LoadFailure::Malformed(MalformedHeader::ChecksumMismatch { .. }))
        ));
        assert!(matches!(skips[3].1, LoadFailure::OutOfMemory { .. }));
    }

    #[test]
    fn all_images_failing_is_an_error() {
        let mut flash = AppSpec::new("greedy", 0x400, 0x10_0000).build();
        flash.extend(AppSpec::new("off", 0x400, 0x100).disabled().build());
        let mut ram = vec![0; 0x1000];
        let mut procs = Vec::<Process<'_>, 4>::new();
        let mut trace = Ringbuf::new(Trace::None);

        assert_eq!(
            load(&flash, &mut ram, &PowerOfTwoMpu, &mut procs, &mut trace),
            Err(LoadError::NoProcessesLoaded { failures: 1 })
        );
    }

    #[test]
    fn nothing_to_load_is_fine() {
        let flash = vec![0xFF; 0x400];
        let mut ram = vec![0; 0x1000];
        let mut procs = Vec::<Process<'_>, 4>::new();
        let mut trace = Ringbuf::new(Trace::None);

        load(&flash, &mut ram, &PowerOfTwoMpu, &mut procs, &mut trace).unwrap();
        assert!(procs.is_empty());
        assert_eq!(trace.iter().count(), 0);
    }

    #[test]
    fn truncated_image_counts_as_failure() {
        let flash = AppSpec::new("cut", 0x400, 0x100).build();
        let mut ram = vec![0; 0x1000];
        let mut procs = Vec::<Process<'_>, 4>::new();
        let mut trace = Ringbuf::new(Trace::None);

        assert_eq!(
            load(&flash[..0x200], &mut ram, &PowerOfTwoMpu, &mut procs, &mut trace),
            Err(LoadError::NoProcessesLoaded { failures: 1 })
        );
    }

    #[test]
    fn bad_image_length_counts_as_failure() {
        let mut flash = AppSpec::new("odd", 0x400, 0x100).build();
        flash[4..8].copy_from_slice(&0x3FEu32.to_le_bytes());
        flash.extend(AppSpec::new("after", 0x400, 0x100).build());
        let mut ram = vec![0; 0x1000];
        let mut procs = Vec::<Process<'_>, 4>::new();
        let mut trace = Ringbuf::new(Trace::None);

        assert_eq!(
            load(&flash, &mut ram, &PowerOfTwoMpu, &mut procs, &mut trace),
            Err(LoadError::NoProcessesLoaded { failures: 1 })
        );
        assert!(procs.is_empty());
        assert_eq!(
            skips(&trace),
            [(
                FLASH_BASE,
                LoadFailure::Malformed(MalformedHeader::BadLength)
            )]
        );
    }

    #[test]
    fn table_capacity_bounds_the_walk() {
        let mut flash = AppSpec::new("a", 0x400, 0x40).build();
        flash.extend(AppSpec::new("b", 0x400, 0x40).build());
        let mut ram = vec![0; 0x1000];
        let mut procs = Vec::<Process<'_>, 1>::new();
        let mut trace = Ringbuf::new(Trace::None);

        load(&flash, &mut ram, &PowerOfTwoMpu, &mut procs, &mut trace).unwrap();
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].name(), "a");
    }

    #[test]
    fn fixed_ram_address_is_honored() {
        let mut flash = AppSpec::new("a", 0x400, 0x40).build();
        flash.extend(AppSpec::new("pinned", 0x400, 0x40).fixed_ram(RAM_BASE + 0x800).build());
        flash.extend(AppSpec::new("late", 0x400, 0x40).fixed_ram(RAM_BASE + 0x100).build());
        let mut ram = vec![0; 0x1000];
        let mut procs = Vec::<Process<'_>, 4>::new();
        let mut trace = Ringbuf::new(Trace::None);

        load(&flash, &mut ram, &GranularMpu::new(0x100), &mut procs, &mut trace).unwrap();

        assert_eq!(procs.len(), 2);
        assert_eq!(procs[1].name(), "pinned");
        assert_eq!(procs[1].memory_start(), RAM_BASE + 0x800);
        // The pool cursor has moved past 0x100 by now.
        assert_eq!(
            skips(&trace),
            [(
                FLASH_BASE + 0x800,
                LoadFailure::FixedRamUnavailable {
                    requested: RAM_BASE + 0x100
                }
            )]
        );
    }

    #[test]
    fn fixed_flash_address_must_match() {
        // Same name length, so both headers have the same size.
        let protected = AppSpec::new("right", 0x400, 0x40)
            .fixed_flash(0)
            .build_header()
            .protected_len();
        let expected = FLASH_BASE + protected;
        let mut flash = AppSpec::new("right", 0x400, 0x40)
            .fixed_flash(expected)
            .build();
        flash.extend(
            AppSpec::new("wrong", 0x400, 0x40)
                .fixed_flash(expected)
                .build(),
        );
        let mut ram = vec![0; 0x1000];
        let mut procs = Vec::<Process<'_>, 4>::new();
        let mut trace = Ringbuf::new(Trace::None);

        load(&flash, &mut ram, &PowerOfTwoMpu, &mut procs, &mut trace).unwrap();

        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].name(), "right");
        assert!(matches!(
            skips(&trace)[..],
            [(_, LoadFailure::FixedFlashMismatch { .. })]
        ));
    }

    #[test]
    fn misaligned_flash_is_refused_by_the_mpu() {
        // Power-of-two MPU needs the image aligned to its own size.
        let mut flash = AppSpec::new("small", 0x400, 0x40).build();
        flash.extend(AppSpec::new("big", 0x800, 0x40).build());
        let mut ram = vec![0; 0x1000];
        let mut procs = Vec::<Process<'_>, 4>::new();
        let mut trace = Ringbuf::new(Trace::None);

        load(&flash, &mut ram, &PowerOfTwoMpu, &mut procs, &mut trace).unwrap();

        assert_eq!(procs.len(), 1);
        assert_eq!(
            skips(&trace),
            [(FLASH_BASE + 0x400, LoadFailure::FlashRegionInvalid)]
        );
    }
}
