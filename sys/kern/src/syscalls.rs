// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Syscall dispatch.
//!
//! # Syscall implementations
//!
//! Each syscall class has an implementation function returning
//! `Result<NextTask, UserError>`. On success the implementation has already
//! written the caller's result register. On a recoverable error the common
//! wrapper, [`handle_syscall`], writes the return code; on an unrecoverable
//! one it faults the caller. Either way the `NextTask` tells the scheduler
//! whether the caller can keep running.
//!
//! Drivers are reached through the board's [`DriverLookup`]. Subscribe,
//! Command, and Allow each call exactly one driver method, after the kernel
//! has done the checks that don't need the driver.

use core::convert::TryFrom;

use abi::{MemopOp, ReturnCode, Sysnum, UsageError};

use crate::driver::{Context, DriverLookup};
use crate::err::UserError;
use crate::process::{ArchState, NextTask, Process};
use crate::trace::Trace;

/// A decoded syscall.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Syscall {
    Yield,
    Subscribe {
        driver: u32,
        subscribe_num: u32,
        callback_ptr: u32,
        userdata: u32,
    },
    Command {
        driver: u32,
        command_num: u32,
        arg: u32,
    },
    Allow {
        driver: u32,
        allow_num: u32,
        ptr: u32,
        len: u32,
    },
    /// `op` is kept raw: an unknown op is an error code, not a fault.
    Memop { op: u32, arg: u32 },
}

impl Syscall {
    /// Decodes a syscall from its class number and argument registers.
    pub fn decode(descriptor: u32, args: [u32; 4]) -> Result<Self, UsageError> {
        let [a0, a1, a2, a3] = args;
        let class = Sysnum::try_from(descriptor)
            .map_err(|_| UsageError::BadSyscallNumber)?;
        Ok(match class {
            Sysnum::Yield => Self::Yield,
            Sysnum::Subscribe => Self::Subscribe {
                driver: a0,
                subscribe_num: a1,
                callback_ptr: a2,
                userdata: a3,
            },
            Sysnum::Command => Self::Command {
                driver: a0,
                command_num: a1,
                arg: a2,
            },
            Sysnum::Allow => Self::Allow {
                driver: a0,
                allow_num: a1,
                ptr: a2,
                len: a3,
            },
            Sysnum::Memop => Self::Memop { op: a0, arg: a1 },
        })
    }

    pub fn class(&self) -> Sysnum {
        match self {
            Self::Yield => Sysnum::Yield,
            Self::Subscribe { .. } => Sysnum::Subscribe,
            Self::Command { .. } => Sysnum::Command,
            Self::Allow { .. } => Sysnum::Allow,
            Self::Memop { .. } => Sysnum::Memop,
        }
    }
}

/// Entry point for a syscall trapped by the process at `index`.
///
/// Returns a `NextTask` indicating whether the process can keep running.
pub(crate) fn handle_syscall(
    ctx: &mut Context<'_, '_>,
    drivers: &dyn DriverLookup,
    index: usize,
) -> NextTask {
    let call = match ctx.processes[index].save().as_syscall() {
        Ok(call) => call,
        Err(e) => return ctx.force_fault(index, e.into()),
    };

    let debug = ctx.processes[index].debug_mut();
    debug.syscall_count = debug.syscall_count.wrapping_add(1);
    debug.last_syscall = Some(call);

    if ctx.config.trace_syscalls {
        trace_event!(
            ctx.trace,
            Trace::Syscall {
                index,
                class: call.class(),
            }
        );
        klog!(debug: "{}: {:?}", ctx.processes[index].id(), call);
    }

    let result = match call {
        Syscall::Yield => Ok(yield_(&mut ctx.processes[index])),
        Syscall::Subscribe {
            driver,
            subscribe_num,
            callback_ptr,
            userdata,
        } => subscribe(
            ctx,
            drivers,
            index,
            driver,
            subscribe_num,
            callback_ptr,
            userdata,
        ),
        Syscall::Command {
            driver,
            command_num,
            arg,
        } => command(ctx, drivers, index, driver, command_num, arg),
        Syscall::Allow {
            driver,
            allow_num,
            ptr,
            len,
        } => allow(ctx, drivers, index, driver, allow_num, ptr, len),
        Syscall::Memop { op, arg } => memop(&mut ctx.processes[index], op, arg),
    };

    match result {
        Ok(nt) => nt,
        Err(UserError::Recoverable(code, hint)) => {
            ctx.processes[index].save_mut().set_return(code);
            hint
        }
        Err(UserError::Unrecoverable(fault)) => ctx.force_fault(index, fault),
    }
}

/// Implementation of the YIELD syscall.
///
/// Delivers the oldest queued callback if there is one; otherwise blocks the
/// caller until a callback arrives.
fn yield_(p: &mut Process<'_>) -> NextTask {
    if p.deliver_next_callback() {
        NextTask::Same
    } else {
        p.set_yielded();
        NextTask::Other
    }
}

/// Implementation of the SUBSCRIBE syscall.
///
/// On success the caller receives its previous callback pointer for this
/// driver and number, or zero.
fn subscribe(
    ctx: &mut Context<'_, '_>,
    drivers: &dyn DriverLookup,
    index: usize,
    driver: u32,
    subscribe_num: u32,
    callback_ptr: u32,
    userdata: u32,
) -> Result<NextTask, UserError> {
    let d = drivers.lookup(driver).ok_or(ReturnCode::ENODEVICE)?;

    let p = &ctx.processes[index];
    if callback_ptr != 0 {
        if !p.flash_contains(callback_ptr) {
            return Err(ReturnCode::EINVAL.into());
        }
        // The driver must not hear of a subscription that won't be kept.
        if !p.has_subscription_room(driver, subscribe_num) {
            return Err(ReturnCode::ENOMEM.into());
        }
    }
    let caller = p.id();

    d.subscribe(ctx, caller, subscribe_num)?;

    let p = &mut ctx.processes[index];
    let previous = p.subscribe(driver, subscribe_num, callback_ptr, userdata)?;
    p.save_mut()
        .set_return(ReturnCode::SuccessWithValue { value: previous });
    Ok(NextTask::Same)
}

/// Implementation of the COMMAND syscall.
fn command(
    ctx: &mut Context<'_, '_>,
    drivers: &dyn DriverLookup,
    index: usize,
    driver: u32,
    command_num: u32,
    arg: u32,
) -> Result<NextTask, UserError> {
    let d = drivers.lookup(driver).ok_or(ReturnCode::ENODEVICE)?;

    let p = &ctx.processes[index];
    // A command the image isn't permitted looks like a missing driver.
    if !p.header().command_allowed(driver, command_num) {
        return Err(ReturnCode::ENODEVICE.into());
    }
    let caller = p.id();

    let rc = d.command(ctx, caller, command_num, arg);
    ctx.processes[index].save_mut().set_return(rc);
    Ok(NextTask::Same)
}

/// Implementation of the ALLOW syscall.
///
/// A null pointer revokes whatever the caller shared before. Anything else
/// must lie in memory the caller can write.
fn allow(
    ctx: &mut Context<'_, '_>,
    drivers: &dyn DriverLookup,
    index: usize,
    driver: u32,
    allow_num: u32,
    ptr: u32,
    len: u32,
) -> Result<NextTask, UserError> {
    let d = drivers.lookup(driver).ok_or(ReturnCode::ENODEVICE)?;

    let p = &ctx.processes[index];
    let slice = if ptr == 0 {
        None
    } else {
        Some(p.validate_allow(ptr, len)?)
    };
    let caller = p.id();

    let rc = d.allow(ctx, caller, allow_num, slice);
    ctx.processes[index].save_mut().set_return(rc);
    Ok(NextTask::Same)
}

/// Implementation of the MEMOP syscall.
fn memop(
    p: &mut Process<'_>,
    op: u32,
    arg: u32,
) -> Result<NextTask, UserError> {
    let op = MemopOp::try_from(op).map_err(|_| ReturnCode::ENOSUPPORT)?;
    let rc = match op {
        MemopOp::Brk => {
            p.brk(arg)?;
            ReturnCode::SUCCESS
        }
        MemopOp::Sbrk => ReturnCode::SuccessWithValue {
            value: p.sbrk(arg as i32)?,
        },
        MemopOp::MemoryStart => value(p.memory_start()),
        MemopOp::MemoryEnd => value(p.memory_end()),
        MemopOp::FlashStart => value(p.flash_start()),
        MemopOp::FlashEnd => value(p.flash_end()),
        MemopOp::GrantStart => value(p.kernel_memory_break()),
        MemopOp::WriteableFlashRegionCount => {
            value(p.header().writeable_flash_regions().count() as u32)
        }
        MemopOp::WriteableFlashRegionStart => {
            let r = writeable_region(p, arg)?;
            value(p.flash_start().wrapping_add(r.offset))
        }
        MemopOp::WriteableFlashRegionEnd => {
            let r = writeable_region(p, arg)?;
            value(p.flash_start().wrapping_add(r.offset).wrapping_add(r.size))
        }
        MemopOp::StackTop => {
            p.debug_mut().app_stack_top = Some(arg);
            ReturnCode::SUCCESS
        }
        MemopOp::HeapStart => {
            p.debug_mut().app_heap_start = Some(arg);
            ReturnCode::SUCCESS
        }
    };
    p.save_mut().set_return(rc);
    Ok(NextTask::Same)
}

fn value(value: u32) -> ReturnCode {
    ReturnCode::SuccessWithValue { value }
}

fn writeable_region(
    p: &Process<'_>,
    index: u32,
) -> Result<tbf::WriteableFlashRegion, ReturnCode> {
    p.header()
        .writeable_flash_regions()
        .nth(index as usize)
        .copied()
        .ok_or(ReturnCode::EINVAL)
}
