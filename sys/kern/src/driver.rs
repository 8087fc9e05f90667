// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interface between the kernel and capsules.
//!
//! Capsules are trusted kernel extensions, reached by driver number from the
//! Subscribe, Command, and Allow syscalls. Every capsule entry point receives
//! a [`Context`], which is the only way a capsule can reach process state:
//! scheduling callbacks, touching shared buffers, entering grants, and
//! requesting deferred calls. A `Context` borrows the kernel's tables for the
//! duration of one call, so nothing a capsule holds onto can outlive it.

use core::fmt;

use abi::{FaultInfo, ProcessState, ReturnCode};

use crate::config::{FaultPolicy, KernelConfig, TRACE_DEPTH};
use crate::deferred::DeferredCall;
use crate::process::{Callback, NextTask, Process, ProcessId};
use crate::trace::{Ringbuf, Trace};
use crate::umem::{AccessError, AppSlice};

/// A capsule, as seen by the syscall dispatcher.
///
/// Exactly one of these methods runs per syscall. Capsules use interior
/// mutability for their own state; the kernel only ever holds shared
/// references to them. Every method defaults to `ENOSUPPORT`.
pub trait Driver {
    /// Checks that `subscribe_num` names a callback this driver produces.
    /// The kernel records the subscription only if this returns `Ok`.
    fn subscribe(
        &self,
        _ctx: &mut Context<'_, '_>,
        _caller: ProcessId,
        _subscribe_num: u32,
    ) -> Result<(), ReturnCode> {
        Err(ReturnCode::ENOSUPPORT)
    }

    /// Handles a command. By convention command 0 returns `SUCCESS`, so
    /// apps can tell whether the driver is present.
    fn command(
        &self,
        _ctx: &mut Context<'_, '_>,
        _caller: ProcessId,
        _command_num: u32,
        _arg: u32,
    ) -> ReturnCode {
        ReturnCode::ENOSUPPORT
    }

    /// Receives a buffer shared by `caller`, or `None` when the process
    /// revokes a previous one.
    fn allow(
        &self,
        _ctx: &mut Context<'_, '_>,
        _caller: ProcessId,
        _allow_num: u32,
        _slice: Option<AppSlice>,
    ) -> ReturnCode {
        ReturnCode::ENOSUPPORT
    }
}

/// The board's driver-number-indexed dispatch table.
pub trait DriverLookup {
    fn lookup(&self, driver_number: u32) -> Option<&dyn Driver>;
}

/// A plain table of `(driver number, driver)` pairs is a dispatch table.
impl<const N: usize> DriverLookup for [(u32, &dyn Driver); N] {
    fn lookup(&self, driver_number: u32) -> Option<&dyn Driver> {
        self.iter()
            .find(|(n, _)| *n == driver_number)
            .map(|(_, d)| *d)
    }
}

/// Reasons a callback can't be scheduled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CallbackError {
    /// The process is not alive, or is a different incarnation.
    NoSuchProcess,
    /// The process has no callback registered for this driver and number.
    NotSubscribed,
    /// The process's callback queue is full; the callback was dropped.
    QueueFull,
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchProcess => f.write_str("no such process"),
            Self::NotSubscribed => f.write_str("not subscribed"),
            Self::QueueFull => f.write_str("callback queue full"),
        }
    }
}

/// Kernel state lent to a capsule for the duration of one call.
pub struct Context<'k, 'a> {
    pub(crate) processes: &'k mut [Process<'a>],
    pub(crate) deferred_pending: &'k mut u32,
    pub(crate) trace: &'k mut Ringbuf<Trace, TRACE_DEPTH>,
    pub(crate) config: &'k KernelConfig,
}

impl<'a> Context<'_, 'a> {
    /// Queues a callback for `process` on its subscription
    /// `(driver, subscribe_num)`.
    ///
    /// The callback runs the next time the process yields (or right away, if
    /// it is already blocked in Yield).
    pub fn schedule_callback(
        &mut self,
        process: ProcessId,
        driver: u32,
        subscribe_num: u32,
        args: [u32; 3],
    ) -> Result<(), CallbackError> {
        let p = self
            .live_process_mut(process)
            .ok_or(CallbackError::NoSuchProcess)?;
        let sub = *p
            .subscription(driver, subscribe_num)
            .ok_or(CallbackError::NotSubscribed)?;
        let cb = Callback {
            driver,
            subscribe_num,
            fn_ptr: sub.fn_ptr,
            args,
            userdata: sub.userdata,
        };
        if p.enqueue_callback(cb).is_ok() {
            return Ok(());
        }

        klog!(
            warn: "dropped callback {}/{} for {}: queue full",
            driver,
            subscribe_num,
            process
        );
        trace_event!(
            self.trace,
            Trace::CallbackDropped {
                index: process.index(),
                driver,
                subscribe_num,
            }
        );
        Err(CallbackError::QueueFull)
    }

    /// Runs `body` on the bytes of a buffer a process shared through Allow.
    ///
    /// Fails if the process has gone away since sharing, or if the buffer is
    /// no longer entirely below its break.
    pub fn with_app_slice<R>(
        &mut self,
        slice: &AppSlice,
        body: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, AccessError> {
        let p = self
            .live_process_mut(slice.process())
            .ok_or(AccessError::ProcessGone)?;
        let bytes = p
            .app_memory_mut(slice.base_addr(), slice.len())
            .ok_or(AccessError::OutOfBounds)?;
        Ok(body(bytes))
    }

    /// Asks for `call`'s client to be run from the main loop.
    pub fn set_deferred(&mut self, call: &DeferredCall) {
        *self.deferred_pending |= 1 << call.slot();
    }

    /// Current state of `process`, or `None` if that incarnation no longer
    /// exists.
    pub fn process_state(&self, process: ProcessId) -> Option<ProcessState> {
        self.processes
            .get(process.index())
            .filter(|p| p.generation() == process.generation())
            .map(|p| *p.state())
    }

    pub fn config(&self) -> &KernelConfig {
        self.config
    }

    /// Finds `id` if that incarnation is alive (running or yielded).
    pub(crate) fn live_process_mut(
        &mut self,
        id: ProcessId,
    ) -> Option<&mut Process<'a>> {
        self.processes
            .get_mut(id.index())
            .filter(|p| p.generation() == id.generation() && p.state().is_alive())
    }

    /// Faults the process at `index`, logs its crash report, and records the
    /// fault in the trace. What happens next is up to the configured
    /// [`FaultPolicy`].
    ///
    /// # Panics
    ///
    /// Under [`FaultPolicy::Panic`].
    pub(crate) fn force_fault(
        &mut self,
        index: usize,
        fault: FaultInfo,
    ) -> NextTask {
        let p = &mut self.processes[index];
        p.set_fault(fault);
        klog!(error: "{}", p.fault_report());
        trace_event!(self.trace, Trace::Faulted { index, fault });

        let policy = self.config.fault_policy;
        if policy == FaultPolicy::Panic {
            panic!("process {} faulted: {}", p.name(), fault);
        }
        if policy.allows_restart(p.debug().restart_count) {
            if let Ok(id) = p.reload() {
                klog!(info: "restarted {} as {} after fault", p.name(), id);
                trace_event!(
                    self.trace,
                    Trace::Restarted {
                        index,
                        generation: id.generation(),
                    }
                );
            }
        }
        NextTask::Other
    }
}
