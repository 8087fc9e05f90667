// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel object.
//!
//! A board creates one `Kernel`, registers its deferred-call clients and
//! grant types, loads processes from flash, and then hands control to
//! [`Kernel::run_forever`]. `N` is the size of the process table.

use heapless::Vec;

use crate::arch::ContextSwitch;
use crate::capabilities::{
    MainLoopCapability, MemoryAllocationCapability, ProcessManagementCapability,
};
use crate::config::{KernelConfig, MAX_GRANTS, TRACE_DEPTH};
use crate::deferred::{pending_slots, DeferredCall, DeferredCallClient, DeferredCalls};
use crate::driver::{Context, DriverLookup};
use crate::grant::{Grant, GrantData};
use crate::mpu::Mpu;
use crate::process::{Process, ProcessId, RestartError};
use crate::sched::{self, SliceEnd};
use crate::startup::{self, FlashRegion, LoadError, RamPool};
use crate::trace::{Ringbuf, Trace};

pub struct Kernel<'a, const N: usize> {
    processes: Vec<Process<'a>, N>,
    grants_created: usize,
    deferred: DeferredCalls<'a>,
    config: KernelConfig,
    /// Index of the process scheduled most recently; scanning starts after
    /// it.
    last_scheduled: usize,
    /// Process whose turn was interrupted by kernel work, to be continued
    /// before anyone else runs, and what was left of its timeslice.
    resume: Option<(usize, Option<u32>)>,
    trace: Ringbuf<Trace, TRACE_DEPTH>,
}

impl<'a, const N: usize> Kernel<'a, N> {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            processes: Vec::new(),
            grants_created: 0,
            deferred: DeferredCalls::new(),
            config,
            last_scheduled: usize::MAX,
            resume: None,
            trace: Ringbuf::new(Trace::None),
        }
    }

    /// Creates a new grant type, taking the next slot in every process's
    /// grant table.
    ///
    /// # Panics
    ///
    /// If every grant slot has been handed out.
    pub fn create_grant<T: GrantData>(
        &mut self,
        _cap: &MemoryAllocationCapability,
    ) -> Grant<T> {
        let id = self.grants_created;
        if id >= MAX_GRANTS {
            panic!("all {MAX_GRANTS} grant slots in use");
        }
        self.grants_created += 1;
        Grant::new(id)
    }

    /// Registers a client to be run from the main loop when its handle is
    /// set.
    ///
    /// # Panics
    ///
    /// If every deferred call slot is taken.
    pub fn register_deferred_call(
        &mut self,
        client: &'a dyn DeferredCallClient,
    ) -> DeferredCall {
        self.deferred.register(client)
    }

    /// Loads the application images in `flash`, giving each RAM from `ram`.
    ///
    /// # Panics
    ///
    /// If processes have already been loaded.
    pub fn load_processes(
        &mut self,
        flash: FlashRegion<'a>,
        ram: RamPool<'a>,
        mpu: &dyn Mpu,
    ) -> Result<(), LoadError> {
        if !self.processes.is_empty() {
            panic!("processes loaded twice");
        }
        startup::load_processes(
            flash,
            ram,
            mpu,
            &self.config,
            &mut self.processes,
            &mut self.trace,
        )
    }

    /// Lends out the kernel state capsules work with.
    pub fn context(&mut self) -> Context<'_, 'a> {
        Context {
            processes: &mut self.processes[..],
            deferred_pending: self.deferred.pending_mut(),
            trace: &mut self.trace,
            config: &self.config,
        }
    }

    /// Runs kernel work, then gives one process a turn. If no process can
    /// run and there's no kernel work, sleeps until an interrupt.
    pub fn run_one_slice(
        &mut self,
        drivers: &dyn DriverLookup,
        arch: &mut dyn ContextSwitch,
    ) {
        self.service_deferred_calls();
        if arch.has_pending_interrupts() {
            arch.service_interrupts(&mut self.context());
        }

        let full = self.config.scheduler.timeslice();
        let next = match self.resume.take() {
            Some((i, left)) if self.processes[i].is_ready() => Some((i, left)),
            _ => sched::scan(self.last_scheduled, &self.processes, |p| {
                p.is_ready()
            })
            .map(|i| (i, full)),
        };
        let Some((index, timeslice)) = next else {
            if !self.deferred.has_pending() && !arch.has_pending_interrupts() {
                arch.sleep();
            }
            return;
        };

        self.last_scheduled = index;
        let end = sched::run_process(
            &mut self.context(),
            drivers,
            arch,
            index,
            timeslice,
        );
        if let SliceEnd::Paused { remaining_us } = end {
            self.resume = Some((index, remaining_us));
        }
    }

    /// The kernel main loop.
    pub fn run_forever(
        &mut self,
        drivers: &dyn DriverLookup,
        arch: &mut dyn ContextSwitch,
        _cap: &MainLoopCapability,
    ) -> ! {
        loop {
            self.run_one_slice(drivers, arch);
        }
    }

    /// Runs each pending deferred call once. Calls that become pending while
    /// this runs wait for the next round.
    fn service_deferred_calls(&mut self) {
        let pending = self.deferred.take_pending();
        for slot in pending_slots(pending) {
            if let Some(client) = self.deferred.client(slot) {
                client.handle_deferred_call(&mut self.context());
            }
        }
    }

    /// Starts a fresh incarnation of the process at `index`: its header is
    /// parsed again, its memory cleared, its grants and subscriptions
    /// dropped. Works from any state.
    pub fn restart_process(
        &mut self,
        index: usize,
        _cap: &ProcessManagementCapability,
    ) -> Result<ProcessId, RestartError> {
        let p = self
            .processes
            .get_mut(index)
            .ok_or(RestartError::NoSuchProcess)?;
        let id = p.reload()?;
        klog!(info: "restarted {} as {}", p.name(), id);
        trace_event!(
            self.trace,
            Trace::Restarted {
                index,
                generation: id.generation(),
            }
        );
        Ok(id)
    }

    /// Restarts every process. Processes that can't be restarted are left
    /// as they are, and counted in the error.
    pub fn restart_all(
        &mut self,
        cap: &ProcessManagementCapability,
    ) -> Result<(), RestartError> {
        let mut failures = 0;
        for index in 0..self.processes.len() {
            if let Err(e) = self.restart_process(index, cap) {
                klog!(warn: "restart_all: process {} not restarted: {}", index, e);
                failures += 1;
            }
        }
        if failures == 0 {
            Ok(())
        } else {
            Err(RestartError::Incomplete { failures })
        }
    }

    /// Stops the process at `index` for good (or until restarted),
    /// reclaiming its grants.
    pub fn terminate_process(
        &mut self,
        index: usize,
        _cap: &ProcessManagementCapability,
    ) -> Result<(), RestartError> {
        let p = self
            .processes
            .get_mut(index)
            .ok_or(RestartError::NoSuchProcess)?;
        p.terminate();
        klog!(info: "terminated {}", p.name());
        trace_event!(self.trace, Trace::Terminated { index });
        Ok(())
    }

    pub fn processes(&self) -> &[Process<'a>] {
        &self.processes
    }

    pub fn process(&self, index: usize) -> Option<&Process<'a>> {
        self.processes.get(index)
    }

    pub fn trace(&self) -> &Ringbuf<Trace, TRACE_DEPTH> {
        &self.trace
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }
}
