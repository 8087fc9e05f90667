// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scripted context switch for host tests.
//!
//! Each process gets a script of things to do when it is switched to: trap
//! with a syscall, fault, run out its timeslice, or get interrupted. A process
//! whose script has run out yields forever. The fake records what it sees in
//! an event log: which process got a turn, what each syscall returned, and
//! which callbacks were delivered.
//!
//! Time is simulated: every switch costs `switch_cost_us` of the armed
//! timeslice (nothing, by default). A switch that would exhaust the budget
//! reports `TimesliceExpired` instead of running the next step.
//!
//! Processes never execute anything, so a process's `pc` only moves when the
//! kernel pushes a callback. The fake notices that on the next switch,
//! records the callback, and "returns" from it immediately.

use std::collections::VecDeque;
use std::vec::Vec;

use abi::{FaultInfo, Sysnum};

use super::{ContextSwitch, SavedState, SwitchReason};
use crate::driver::{CallbackError, Context};
use crate::mpu::RegionDesc;
use crate::process::ProcessId;

/// One thing a process does when it gets the CPU.
#[derive(Copy, Clone, Debug)]
pub enum Step {
    Syscall(u32, [u32; 4]),
    Fault(FaultInfo),
    Preempt,
    Interrupt,
}

impl Step {
    pub fn yield_() -> Self {
        Self::Syscall(Sysnum::Yield as u32, [0; 4])
    }

    pub fn subscribe(driver: u32, num: u32, fn_ptr: u32, userdata: u32) -> Self {
        Self::Syscall(Sysnum::Subscribe as u32, [driver, num, fn_ptr, userdata])
    }

    pub fn command(driver: u32, num: u32, arg: u32) -> Self {
        Self::Syscall(Sysnum::Command as u32, [driver, num, arg, 0])
    }

    pub fn allow(driver: u32, num: u32, ptr: u32, len: u32) -> Self {
        Self::Syscall(Sysnum::Allow as u32, [driver, num, ptr, len])
    }

    pub fn memop(op: u32, arg: u32) -> Self {
        Self::Syscall(Sysnum::Memop as u32, [op, arg, 0, 0])
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// The process was given a turn.
    Ran(usize),
    /// The process's last syscall completed with this result register.
    Returned(usize, i32),
    /// The process was resumed in a callback.
    Callback {
        index: usize,
        fn_ptr: u32,
        args: [u32; 4],
    },
}

/// An interrupt that, when serviced, schedules a callback.
#[derive(Copy, Clone, Debug)]
pub struct Irq {
    pub process: ProcessId,
    pub driver: u32,
    pub subscribe_num: u32,
    pub args: [u32; 3],
}

#[derive(Default)]
pub struct FakeArch {
    scripts: Vec<VecDeque<Step>>,
    /// Entry point of each process, to tell a pushed callback apart.
    home: Vec<Option<u32>>,
    awaiting_return: Vec<bool>,
    pub events: Vec<Event>,
    pub irqs: VecDeque<Irq>,
    pub irq_results: Vec<Result<(), CallbackError>>,
    pub sleeps: usize,
    /// Timeslice each turn started with.
    pub timeslices: Vec<Option<u32>>,
    pub switch_cost_us: u32,
    budget: Option<u32>,
    pub last_regions: Vec<Vec<RegionDesc>>,
}

impl FakeArch {
    pub fn new() -> Self {
        Self::default()
    }

    fn grow(&mut self, index: usize) {
        if self.scripts.len() <= index {
            self.scripts.resize_with(index + 1, VecDeque::new);
            self.home.resize(index + 1, None);
            self.awaiting_return.resize(index + 1, false);
            self.last_regions.resize_with(index + 1, Vec::new);
        }
    }

    /// Appends steps to the script of the process at `index`.
    pub fn script(&mut self, index: usize, steps: impl IntoIterator<Item = Step>) {
        self.grow(index);
        self.scripts[index].extend(steps);
    }

    pub fn script_len(&self, index: usize) -> usize {
        self.scripts.get(index).map_or(0, VecDeque::len)
    }

    /// Forgets the entry point recorded for `index`, e.g. after a restart
    /// that moved it.
    pub fn forget(&mut self, index: usize) {
        self.grow(index);
        self.home[index] = None;
        self.awaiting_return[index] = false;
    }

    pub fn events_for(&self, index: usize) -> Vec<Event> {
        self.events
            .iter()
            .copied()
            .filter(|e| match e {
                Event::Ran(i) | Event::Returned(i, _) => *i == index,
                Event::Callback { index: i, .. } => *i == index,
            })
            .collect()
    }

    /// Results of `index`'s completed syscalls, in order.
    pub fn returns_for(&self, index: usize) -> Vec<i32> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Returned(i, rc) if *i == index => Some(*rc),
                _ => None,
            })
            .collect()
    }

    /// Order in which processes were given turns.
    pub fn run_order(&self) -> Vec<usize> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Ran(i) => Some(*i),
                _ => None,
            })
            .collect()
    }
}

impl ContextSwitch for FakeArch {
    fn begin_slice(&mut self, process: ProcessId, timeslice_us: Option<u32>) {
        self.events.push(Event::Ran(process.index()));
        self.timeslices.push(timeslice_us);
        self.budget = timeslice_us;
    }

    fn end_slice(&mut self) {
        self.budget = None;
    }

    fn timeslice_remaining(&self) -> Option<u32> {
        self.budget
    }

    fn switch_to(
        &mut self,
        process: ProcessId,
        state: &mut SavedState,
        regions: &[RegionDesc],
    ) -> SwitchReason {
        let index = process.index();
        self.grow(index);
        let home = *self.home[index].get_or_insert(state.pc);

        if state.pc != home {
            self.events.push(Event::Callback {
                index,
                fn_ptr: state.pc,
                args: state.regs,
            });
            state.pc = state.lr;
        } else if self.awaiting_return[index] {
            self.events.push(Event::Returned(index, state.regs[0] as i32));
        }
        self.awaiting_return[index] = false;
        self.last_regions[index] = regions.to_vec();

        if let Some(left) = self.budget {
            if left <= self.switch_cost_us {
                self.budget = Some(0);
                return SwitchReason::TimesliceExpired;
            }
            self.budget = Some(left - self.switch_cost_us);
        }

        let step = self.scripts[index].pop_front().unwrap_or_else(Step::yield_);
        match step {
            Step::Syscall(nr, args) => {
                state.svc_number = nr;
                state.regs = args;
                self.awaiting_return[index] = true;
                SwitchReason::SyscallFired
            }
            Step::Fault(fault) => SwitchReason::Fault(fault),
            Step::Preempt => SwitchReason::TimesliceExpired,
            Step::Interrupt => SwitchReason::Interrupted,
        }
    }

    fn has_pending_interrupts(&self) -> bool {
        !self.irqs.is_empty()
    }

    fn service_interrupts(&mut self, ctx: &mut Context<'_, '_>) {
        while let Some(irq) = self.irqs.pop_front() {
            let r = ctx.schedule_callback(
                irq.process,
                irq.driver,
                irq.subscribe_num,
                irq.args,
            );
            self.irq_results.push(r);
        }
    }

    fn sleep(&mut self) {
        self.sleeps += 1;
    }
}
