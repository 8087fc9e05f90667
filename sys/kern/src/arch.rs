// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture boundary.
//!
//! The kernel never touches CPU registers or the MPU directly. The board
//! supplies a [`ContextSwitch`] implementation that loads a process's saved
//! registers and memory regions, runs it until it traps back, and saves the
//! registers again. Everything the portable kernel needs to know about a
//! process's registers goes through [`SavedState`].

use abi::FaultInfo;

use crate::driver::Context;
use crate::mpu::RegionDesc;
use crate::process::{ArchState, ProcessId};

cfg_if::cfg_if! {
    if #[cfg(test)] {
        pub mod fake;
    }
}

/// Saved machine state of a process, as exchanged with the context switch.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SavedState {
    /// Argument registers: syscall arguments in, result out (in `regs[0]`),
    /// and callback arguments when a callback is pushed.
    pub regs: [u32; 4],
    pub sp: u32,
    pub pc: u32,
    /// Where a callback returns to.
    pub lr: u32,
    /// Syscall class of the most recent trap.
    pub svc_number: u32,
}

impl ArchState for SavedState {
    fn stack_pointer(&self) -> u32 {
        self.sp
    }

    fn arg0(&self) -> u32 {
        self.regs[0]
    }
    fn arg1(&self) -> u32 {
        self.regs[1]
    }
    fn arg2(&self) -> u32 {
        self.regs[2]
    }
    fn arg3(&self) -> u32 {
        self.regs[3]
    }

    fn syscall_descriptor(&self) -> u32 {
        self.svc_number
    }

    fn ret0(&mut self, x: u32) {
        self.regs[0] = x;
    }

    fn push_callback(&mut self, fn_ptr: u32, args: [u32; 4]) {
        self.lr = self.pc;
        self.pc = fn_ptr;
        self.regs = args;
    }

    fn initialize(&mut self, entry: u32, sp: u32, args: [u32; 4]) {
        *self = Self {
            regs: args,
            sp,
            pc: entry,
            lr: 0,
            svc_number: 0,
        };
    }
}

/// Why a process stopped running and control came back to the kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SwitchReason {
    /// The process trapped with a syscall; its class is in
    /// `SavedState::svc_number` and its arguments in `regs`.
    SyscallFired,
    /// The process did something the hardware refused.
    Fault(FaultInfo),
    /// The timeslice armed for the process ran out.
    TimesliceExpired,
    /// A hardware interrupt arrived while the process ran.
    Interrupted,
}

/// Board-supplied CPU and interrupt plumbing.
///
/// A process's turn is bracketed by `begin_slice` and `end_slice`; in
/// between, `switch_to` is called once per trip into the process. The
/// timeslice covers the whole turn, so time spent before each syscall counts
/// against the same budget.
pub trait ContextSwitch {
    /// Starts a turn for `process`. If `timeslice_us` is `Some`, arms a
    /// timer that preempts the process once it has run that long in total.
    fn begin_slice(&mut self, process: ProcessId, timeslice_us: Option<u32>);

    /// Disarms the timer armed by `begin_slice`.
    fn end_slice(&mut self);

    /// Time left on the timer armed by `begin_slice`, or `None` if none is
    /// armed.
    fn timeslice_remaining(&self) -> Option<u32>;

    /// Runs `process` with the registers in `state` and access limited to
    /// `regions`, until it traps back into the kernel.
    fn switch_to(
        &mut self,
        process: ProcessId,
        state: &mut SavedState,
        regions: &[RegionDesc],
    ) -> SwitchReason;

    /// Checks whether chip interrupts are waiting to be serviced.
    fn has_pending_interrupts(&self) -> bool {
        false
    }

    /// Services pending chip interrupts. Drivers reached from here can
    /// schedule callbacks and deferred calls through `ctx`.
    fn service_interrupts(&mut self, _ctx: &mut Context<'_, '_>) {}

    /// Waits for an interrupt. Called when no process can run and no kernel
    /// work is pending.
    fn sleep(&mut self) {}
}
