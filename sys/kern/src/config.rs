// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel configuration.
//!
//! Table capacities are fixed at build time (see `build.rs`); everything
//! else is chosen by the board when it constructs the kernel.

include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));

// Pending deferred calls live in one u32.
static_assertions::const_assert!(DEFERRED_CALL_SLOTS <= 32);
static_assertions::const_assert!(CALLBACK_QUEUE_DEPTH > 0);

/// How processes share the CPU.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedulerPolicy {
    /// A process runs until it yields or faults. A process that never
    /// yields starves everyone else.
    Cooperative,
    /// Each process gets at most `timeslice_us` before it is preempted and
    /// the next runnable process is chosen.
    RoundRobin { timeslice_us: u32 },
}

impl SchedulerPolicy {
    /// Timeslice to arm before switching to a process, if any.
    pub fn timeslice(&self) -> Option<u32> {
        match self {
            Self::Cooperative => None,
            Self::RoundRobin { timeslice_us } => Some(*timeslice_us),
        }
    }
}

/// What the kernel does with a process after it faults.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum FaultPolicy {
    /// Leave it in `Fault` until someone restarts it.
    #[default]
    Stop,
    /// Bring the whole system down. Useful while debugging an app.
    Panic,
    /// Restart it from flash, at most `limit` times over its lifetime. Once
    /// the limit is spent the process stops as under `Stop`.
    Restart { limit: Option<u32> },
}

impl FaultPolicy {
    /// Whether a process that has already been restarted `restarts` times
    /// should be restarted again.
    pub fn allows_restart(&self, restarts: u32) -> bool {
        match self {
            Self::Stop | Self::Panic => false,
            Self::Restart { limit } => limit.map_or(true, |l| restarts < l),
        }
    }
}

/// Runtime kernel settings.
#[derive(Copy, Clone, Debug)]
pub struct KernelConfig {
    /// Bytes reserved at the top of each process's RAM for grants. This is
    /// added to the process's own minimum RAM requirement at load.
    pub grant_region_size: u32,
    pub scheduler: SchedulerPolicy,
    pub fault_policy: FaultPolicy,
    /// Record every syscall in the trace buffer and log it at debug level.
    pub trace_syscalls: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            grant_region_size: 1024,
            scheduler: SchedulerPolicy::RoundRobin {
                timeslice_us: 10_000,
            },
            fault_policy: FaultPolicy::Stop,
            trace_syscalls: false,
        }
    }
}
