// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process isolation and syscall dispatch for a Tock-style kernel.
//!
//! This is the portable core: it loads untrusted applications from Tock
//! Binary Format images in flash, gives each its own MPU-protected RAM,
//! schedules them, and dispatches their syscalls to trusted in-kernel
//! drivers (capsules). Capsules keep per-process state in grants, carved out
//! of the top of each process's RAM.
//!
//! Nothing here touches hardware. The board supplies the context switch
//! ([`arch::ContextSwitch`]), the MPU model ([`mpu::Mpu`]), and the driver
//! table ([`driver::DriverLookup`]).
//!
//! # Design principles
//!
//! 1. Static configuration. Table sizes are fixed at build time (see
//!    `build.rs`) and the kernel never allocates.
//! 2. A strong preference for safe code. Process memory is reached through
//!    the slices the kernel owns, never through raw addresses.
//! 3. Capsules borrow process state only for the duration of a call, through
//!    a [`driver::Context`], so nothing they keep can outlive a process.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod klog;
#[macro_use]
pub mod trace;

pub mod arch;
pub mod capabilities;
pub mod config;
pub mod deferred;
pub mod driver;
pub mod err;
pub mod grant;
pub mod kernel;
pub mod mpu;
pub mod process;
mod sched;
pub mod startup;
pub mod syscalls;
pub mod umem;

#[cfg(test)]
mod testutil;

pub use kernel::Kernel;
