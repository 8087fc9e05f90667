// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process selection and the run loop for one process.

use abi::ProcessState;

use crate::arch::{ContextSwitch, SwitchReason};
use crate::config::SchedulerPolicy;
use crate::driver::{Context, DriverLookup};
use crate::process::{NextTask, Process};
use crate::syscalls::handle_syscall;

/// How a process's turn ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SliceEnd {
    /// The process can't continue: it yielded with nothing to deliver,
    /// faulted, or isn't alive.
    Blocked,
    /// The timeslice ran out; someone else should get a turn.
    Preempted,
    /// The kernel has work to do. The process should be resumed once it's
    /// done, with whatever was left of its timeslice.
    Paused { remaining_us: Option<u32> },
}

/// Scans processes after `previous`, wrapping around, for the first one
/// satisfying `pred`. `previous` itself is checked last.
pub(crate) fn scan(
    previous: usize,
    processes: &[Process<'_>],
    pred: impl Fn(&Process<'_>) -> bool,
) -> Option<usize> {
    let mut pos = previous;
    for _step_no in 0..processes.len() {
        pos = pos.wrapping_add(1);
        if pos >= processes.len() {
            pos = 0;
        }
        if pred(&processes[pos]) {
            return Some(pos);
        }
    }
    None
}

/// Gives the process at `index` one turn of at most `timeslice_us`.
pub(crate) fn run_process(
    ctx: &mut Context<'_, '_>,
    drivers: &dyn DriverLookup,
    arch: &mut dyn ContextSwitch,
    index: usize,
    timeslice_us: Option<u32>,
) -> SliceEnd {
    arch.begin_slice(ctx.processes[index].id(), timeslice_us);
    let end = run_turn(ctx, drivers, arch, index);
    arch.end_slice();
    end
}

fn run_turn(
    ctx: &mut Context<'_, '_>,
    drivers: &dyn DriverLookup,
    arch: &mut dyn ContextSwitch,
    index: usize,
) -> SliceEnd {
    loop {
        let p = &mut ctx.processes[index];
        let state = *p.state();
        match state {
            ProcessState::Running => (),
            ProcessState::Yielded => {
                if !p.deliver_next_callback() {
                    return SliceEnd::Blocked;
                }
            }
            ProcessState::Fault(_) | ProcessState::Terminated => {
                return SliceEnd::Blocked;
            }
        }

        let id = p.id();
        let regions = p.region_table();
        let reason = arch.switch_to(id, p.save_mut(), &regions);

        match reason {
            SwitchReason::SyscallFired => {
                if handle_syscall(ctx, drivers, index) == NextTask::Other {
                    return SliceEnd::Blocked;
                }
                // The timer may have run out while the kernel worked.
                if arch.timeslice_remaining() == Some(0) {
                    count_expiration(ctx, index);
                    return SliceEnd::Preempted;
                }
                if *ctx.deferred_pending != 0 || arch.has_pending_interrupts() {
                    return SliceEnd::Paused {
                        remaining_us: arch.timeslice_remaining(),
                    };
                }
            }
            SwitchReason::Fault(fault) => {
                let _ = ctx.force_fault(index, fault);
                return SliceEnd::Blocked;
            }
            SwitchReason::TimesliceExpired => {
                count_expiration(ctx, index);
                if let SchedulerPolicy::RoundRobin { .. } = ctx.config.scheduler {
                    return SliceEnd::Preempted;
                }
            }
            SwitchReason::Interrupted => {
                return SliceEnd::Paused {
                    remaining_us: arch.timeslice_remaining(),
                };
            }
        }
    }
}

fn count_expiration(ctx: &mut Context<'_, '_>, index: usize) {
    let debug = ctx.processes[index].debug_mut();
    debug.timeslice_expirations = debug.timeslice_expirations.wrapping_add(1);
}
