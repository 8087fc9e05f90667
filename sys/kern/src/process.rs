// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of processes.
//!
//! A process owns a slice of flash (its TBF image) and a slice of RAM carved
//! out of the kernel's pool at boot. RAM is laid out as:
//!
//! ```text
//! memory_start       initial_break   app_break     grant floor  memory_end
//! |---- stack/data ----|---- heap ----|.............|--- grants ---|
//!                                     ^ moved by brk/sbrk         ^
//!                                       grants are carved downward from here
//! ```
//!
//! The process may touch `memory_start..app_break`. Everything from the
//! grant floor up belongs to the kernel. `brk` can never cross the floor and
//! grants can never cross it going the other way, so the two never meet.

use core::fmt;

use abi::{FaultInfo, ProcessState, ReturnCode, UsageError};
use heapless::{Deque, Vec};
use tbf::TbfHeader;

use crate::arch::SavedState;
use crate::config::{CALLBACK_QUEUE_DEPTH, MAX_GRANTS, MAX_SUBSCRIPTIONS};
use crate::mpu::{RegionAttributes, RegionDesc};
use crate::syscalls::Syscall;
use crate::umem::{AppSlice, USlice};

/// Names one incarnation of a process.
///
/// The index locates the process in the kernel's table; the generation is
/// bumped whenever the process is restarted or terminated, so an ID held
/// across a restart no longer matches.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ProcessId {
    index: usize,
    generation: u32,
}

impl ProcessId {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Return value for operations that can have scheduling implications. This is
/// marked `must_use` because forgetting to actually update the scheduler after
/// performing an operation that requires it would be Bad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// It's fine to keep running whatever process we were just running.
    Same,
    /// The current process can't continue; the scheduler needs to pick.
    Other,
}

/// Interface that must be implemented by the `arch::SavedState` type. This
/// gives architecture-independent access to process registers for the rest
/// of the kernel.
pub trait ArchState: Default {
    fn stack_pointer(&self) -> u32;

    /// Reads syscall argument register 0.
    fn arg0(&self) -> u32;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> u32;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> u32;
    /// Reads syscall argument register 3.
    fn arg3(&self) -> u32;

    /// Reads the syscall descriptor (class number).
    fn syscall_descriptor(&self) -> u32;

    /// Writes the syscall result register.
    fn ret0(&mut self, _: u32);

    /// Arranges for the process to resume in a callback: `fn_ptr` runs with
    /// `args` and returns to where the process was.
    fn push_callback(&mut self, fn_ptr: u32, args: [u32; 4]);

    /// Resets registers for a fresh start at `entry`.
    fn initialize(&mut self, entry: u32, sp: u32, args: [u32; 4]);

    /// Decodes the trapped syscall.
    #[inline(always)]
    fn as_syscall(&self) -> Result<Syscall, UsageError> {
        Syscall::decode(
            self.syscall_descriptor(),
            [self.arg0(), self.arg1(), self.arg2(), self.arg3()],
        )
    }

    fn set_return(&mut self, rc: ReturnCode) {
        self.ret0(rc.into());
    }
}

/// A registered callback.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Subscription {
    pub driver: u32,
    pub subscribe_num: u32,
    pub fn_ptr: u32,
    pub userdata: u32,
}

/// A callback waiting to be delivered.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Callback {
    pub driver: u32,
    pub subscribe_num: u32,
    pub fn_ptr: u32,
    pub args: [u32; 3],
    pub userdata: u32,
}

/// One allocated grant slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GrantEntry {
    pub address: u32,
    pub size: u32,
}

/// Bookkeeping for the kernel-owned top of a process's RAM.
#[derive(Debug)]
struct GrantRegion {
    /// Lowest address grants may use; the highest the app break may reach.
    floor: u32,
    /// Lowest address currently used by a grant. Starts at the top of RAM.
    kernel_break: u32,
    /// End of the process's RAM.
    top: u32,
    table: [Option<GrantEntry>; MAX_GRANTS],
}

impl GrantRegion {
    fn new(floor: u32, top: u32) -> Self {
        Self {
            floor,
            kernel_break: top,
            top,
            table: [None; MAX_GRANTS],
        }
    }

    fn reset(&mut self) {
        self.kernel_break = self.top;
        self.table = [None; MAX_GRANTS];
    }
}

/// Counters kept for crash reports and debuggers.
#[derive(Copy, Clone, Debug, Default)]
pub struct DebugCounters {
    pub syscall_count: u32,
    pub last_syscall: Option<Syscall>,
    pub dropped_callbacks: u32,
    pub timeslice_expirations: u32,
    /// Survives restarts; everything else is cleared.
    pub restart_count: u32,
    /// Where the process says its stack begins (Memop 10).
    pub app_stack_top: Option<u32>,
    /// Where the process says its heap begins (Memop 11).
    pub app_heap_start: Option<u32>,
}

/// Internal representation of a process.
pub struct Process<'a> {
    /// Saved machine state of the user program.
    save: SavedState,
    state: ProcessState,
    index: usize,
    generation: u32,

    header: TbfHeader<'a>,
    /// The whole TBF image, header included.
    flash: &'a [u8],
    flash_start: u32,

    memory: &'a mut [u8],
    memory_start: u32,
    initial_break: u32,
    app_break: u32,
    grants: GrantRegion,

    subscriptions: Vec<Subscription, MAX_SUBSCRIPTIONS>,
    callbacks: Deque<Callback, CALLBACK_QUEUE_DEPTH>,

    debug: DebugCounters,
}

impl<'a> Process<'a> {
    /// Creates a process in its initial state.
    ///
    /// The loader is responsible for the layout: `memory_start <=
    /// initial_break <= grant_floor <= memory_start + memory.len()`.
    pub(crate) fn new(
        index: usize,
        header: TbfHeader<'a>,
        flash: &'a [u8],
        flash_start: u32,
        memory: &'a mut [u8],
        memory_start: u32,
        initial_break: u32,
        grant_floor: u32,
    ) -> Self {
        let memory_end = memory_start.wrapping_add(memory.len() as u32);
        debug_assert!(memory_start <= initial_break);
        debug_assert!(initial_break <= grant_floor);
        debug_assert!(grant_floor <= memory_end);

        let mut p = Self {
            save: SavedState::default(),
            state: ProcessState::Running,
            index,
            generation: 0,
            header,
            flash,
            flash_start,
            memory,
            memory_start,
            initial_break,
            app_break: initial_break,
            grants: GrantRegion::new(grant_floor, memory_end),
            subscriptions: Vec::new(),
            callbacks: Deque::new(),
            debug: DebugCounters::default(),
        };
        p.start();
        p
    }

    /// Puts the process into its boot state: clean memory, no grants, no
    /// subscriptions, registers pointing at the entry point.
    fn start(&mut self) {
        self.memory.fill(0);
        self.app_break = self.initial_break;
        self.grants.reset();
        self.subscriptions.clear();
        self.callbacks.clear();
        let args = [
            self.flash_start,
            self.memory_start,
            self.memory.len() as u32,
            self.app_break,
        ];
        self.save
            .initialize(self.entry_point(), self.initial_break, args);
        self.state = ProcessState::Running;
    }

    /// Starts a new incarnation from `header`, which must describe the same
    /// image.
    pub(crate) fn restart(&mut self, header: TbfHeader<'a>) {
        self.header = header;
        self.generation = self.generation.wrapping_add(1);
        self.debug = DebugCounters {
            restart_count: self.debug.restart_count.wrapping_add(1),
            ..DebugCounters::default()
        };
        self.start();
    }

    /// Starts a new incarnation from the header in flash, which must still
    /// describe an application.
    pub(crate) fn reload(&mut self) -> Result<ProcessId, RestartError> {
        match tbf::parse(self.flash) {
            Ok(Some(header)) if header.is_app() => {
                self.restart(header);
                Ok(self.id())
            }
            other => {
                klog!(
                    error: "can't restart {}: {:?}",
                    self.name(),
                    other.map(|_| ())
                );
                Err(RestartError::BadHeader)
            }
        }
    }

    /// Ends the current incarnation without starting another.
    pub(crate) fn terminate(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.memory.fill(0);
        self.app_break = self.initial_break;
        self.grants.reset();
        self.subscriptions.clear();
        self.callbacks.clear();
        self.state = ProcessState::Terminated;
    }

    pub fn id(&self) -> ProcessId {
        ProcessId::new(self.index, self.generation)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    pub fn header(&self) -> &TbfHeader<'a> {
        &self.header
    }

    pub(crate) fn flash(&self) -> &'a [u8] {
        self.flash
    }

    pub fn name(&self) -> &'a str {
        self.header.package_name().unwrap_or("<unnamed>")
    }

    pub fn save(&self) -> &SavedState {
        &self.save
    }

    pub fn save_mut(&mut self) -> &mut SavedState {
        &mut self.save
    }

    pub fn debug(&self) -> &DebugCounters {
        &self.debug
    }

    pub(crate) fn debug_mut(&mut self) -> &mut DebugCounters {
        &mut self.debug
    }

    /// Checks whether the scheduler has anything to do with this process:
    /// either it is running, or it is blocked in Yield and a callback is
    /// waiting for it.
    pub fn is_ready(&self) -> bool {
        match self.state {
            ProcessState::Running => true,
            ProcessState::Yielded => !self.callbacks.is_empty(),
            ProcessState::Fault(_) | ProcessState::Terminated => false,
        }
    }

    pub fn entry_point(&self) -> u32 {
        self.flash_start
            .wrapping_add(u32::from(self.header.header_size()))
            .wrapping_add(self.header.init_fn_offset())
    }

    pub fn flash_start(&self) -> u32 {
        self.flash_start
    }

    pub fn flash_end(&self) -> u32 {
        self.flash_start.wrapping_add(self.flash.len() as u32)
    }

    /// End of the part of flash the process can never write.
    pub fn flash_protected_end(&self) -> u32 {
        self.flash_start.wrapping_add(self.header.protected_len())
    }

    pub fn memory_start(&self) -> u32 {
        self.memory_start
    }

    pub fn memory_end(&self) -> u32 {
        self.grants.top
    }

    pub fn initial_break(&self) -> u32 {
        self.initial_break
    }

    pub fn app_break(&self) -> u32 {
        self.app_break
    }

    /// Lowest address reserved for grants.
    pub fn grant_floor(&self) -> u32 {
        self.grants.floor
    }

    /// Lowest address currently used by a grant.
    pub fn kernel_memory_break(&self) -> u32 {
        self.grants.kernel_break
    }

    pub fn flash_contains(&self, addr: u32) -> bool {
        (self.flash_start..self.flash_end()).contains(&addr)
    }

    /// The regions this process may access, sorted by address.
    pub fn region_table(&self) -> [RegionDesc; 2] {
        let flash = RegionDesc {
            base: self.flash_start,
            size: self.flash.len() as u32,
            attributes: RegionAttributes::READ | RegionAttributes::EXECUTE,
        };
        let ram = RegionDesc {
            base: self.memory_start,
            size: self.app_break - self.memory_start,
            attributes: RegionAttributes::READ | RegionAttributes::WRITE,
        };
        if ram.base < flash.base {
            [ram, flash]
        } else {
            [flash, ram]
        }
    }

    /// Validates a buffer the process wants to share through Allow.
    ///
    /// The buffer must lie in memory the process can currently write. An
    /// empty buffer carries no authority but must still point into the
    /// process's RAM (its end counts).
    pub(crate) fn validate_allow(
        &self,
        ptr: u32,
        len: u32,
    ) -> Result<AppSlice, ReturnCode> {
        let buffer =
            USlice::from_raw(ptr, len).map_err(|_| ReturnCode::EINVAL)?;
        let needed = RegionAttributes::READ | RegionAttributes::WRITE;
        let writable =
            kerncore::buffer_covered(buffer.span(), &self.region_table(), |r| {
                r.attributes.contains(needed)
            });
        if writable {
            Ok(buffer.bind(self.id()))
        } else {
            Err(ReturnCode::EINVAL)
        }
    }

    /// Gets at `len` bytes of process memory starting at address `base`, if
    /// they are all below the current break.
    pub(crate) fn app_memory_mut(
        &mut self,
        base: u32,
        len: u32,
    ) -> Option<&mut [u8]> {
        let end = base.checked_add(len)?;
        if base < self.memory_start || end > self.app_break {
            return None;
        }
        let offset = (base - self.memory_start) as usize;
        self.memory.get_mut(offset..offset + len as usize)
    }

    /// Moves the app break to `new_break`, returning the old one.
    pub(crate) fn brk(&mut self, new_break: u32) -> Result<u32, ReturnCode> {
        if new_break < self.initial_break || new_break > self.grants.floor {
            return Err(ReturnCode::ENOMEM);
        }
        Ok(core::mem::replace(&mut self.app_break, new_break))
    }

    /// Moves the app break by `increment` bytes, returning the old one.
    pub(crate) fn sbrk(&mut self, increment: i32) -> Result<u32, ReturnCode> {
        let new_break = self
            .app_break
            .checked_add_signed(increment)
            .ok_or(ReturnCode::ENOMEM)?;
        self.brk(new_break)
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub(crate) fn subscription(
        &self,
        driver: u32,
        subscribe_num: u32,
    ) -> Option<&Subscription> {
        self.subscriptions
            .iter()
            .find(|s| s.driver == driver && s.subscribe_num == subscribe_num)
    }

    /// Whether a callback for `(driver, subscribe_num)` can be registered
    /// without running out of subscription slots.
    pub(crate) fn has_subscription_room(
        &self,
        driver: u32,
        subscribe_num: u32,
    ) -> bool {
        self.subscription(driver, subscribe_num).is_some()
            || self.subscriptions.len() < MAX_SUBSCRIPTIONS
    }

    /// Registers (or with `fn_ptr == 0`, removes) the callback for
    /// `(driver, subscribe_num)`, returning the previous function pointer or
    /// zero. Callbacks still queued for the old registration are discarded.
    pub(crate) fn subscribe(
        &mut self,
        driver: u32,
        subscribe_num: u32,
        fn_ptr: u32,
        userdata: u32,
    ) -> Result<u32, ReturnCode> {
        let pos = self
            .subscriptions
            .iter()
            .position(|s| s.driver == driver && s.subscribe_num == subscribe_num);
        let previous = pos.map_or(0, |i| self.subscriptions[i].fn_ptr);

        match (pos, fn_ptr) {
            (Some(i), 0) => {
                self.subscriptions.swap_remove(i);
            }
            (None, 0) => (),
            (Some(i), _) => {
                self.subscriptions[i].fn_ptr = fn_ptr;
                self.subscriptions[i].userdata = userdata;
            }
            (None, _) => self
                .subscriptions
                .push(Subscription {
                    driver,
                    subscribe_num,
                    fn_ptr,
                    userdata,
                })
                .map_err(|_| ReturnCode::ENOMEM)?,
        }

        self.drop_callbacks_for(driver, subscribe_num);
        Ok(previous)
    }

    fn drop_callbacks_for(&mut self, driver: u32, subscribe_num: u32) {
        // Deque has no retain; rotate once through the queue instead.
        for _ in 0..self.callbacks.len() {
            let Some(cb) = self.callbacks.pop_front() else {
                break;
            };
            if cb.driver != driver || cb.subscribe_num != subscribe_num {
                // Can't fail: we just made room.
                let _ = self.callbacks.push_back(cb);
            }
        }
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// Hands `cb` to the process.
    ///
    /// A process blocked in Yield takes it right away: the callback frame is
    /// pushed and the process becomes `Running`. Otherwise the callback waits
    /// in the queue for the next Yield. If the queue is full the callback is
    /// dropped, counted, and given back.
    pub(crate) fn enqueue_callback(&mut self, cb: Callback) -> Result<(), Callback> {
        if self.state == ProcessState::Yielded && self.callbacks.is_empty() {
            self.deliver(cb);
            return Ok(());
        }
        self.callbacks.push_back(cb).map_err(|cb| {
            self.debug.dropped_callbacks =
                self.debug.dropped_callbacks.wrapping_add(1);
            cb
        })
    }

    /// Delivers the oldest queued callback, if there is one.
    pub(crate) fn deliver_next_callback(&mut self) -> bool {
        match self.callbacks.pop_front() {
            Some(cb) => {
                self.deliver(cb);
                true
            }
            None => false,
        }
    }

    fn deliver(&mut self, cb: Callback) {
        let [a0, a1, a2] = cb.args;
        self.save.push_callback(cb.fn_ptr, [a0, a1, a2, cb.userdata]);
        self.state = ProcessState::Running;
    }

    /// Blocks the process in Yield.
    pub(crate) fn set_yielded(&mut self) {
        if self.state == ProcessState::Running {
            self.state = ProcessState::Yielded;
        }
    }

    /// Puts the process into a fault state. A second fault replaces the
    /// first.
    pub(crate) fn set_fault(&mut self, fault: FaultInfo) {
        self.state = ProcessState::Fault(fault);
    }

    pub fn grant_entries(
        &self,
    ) -> impl Iterator<Item = (usize, GrantEntry)> + '_ {
        self.grants
            .table
            .iter()
            .enumerate()
            .filter_map(|(id, e)| e.map(|e| (id, e)))
    }

    pub(crate) fn has_grant(&self, id: usize) -> bool {
        matches!(self.grants.table.get(id), Some(Some(_)))
    }

    /// Carves `size` bytes for grant `id` off the bottom of the used grant
    /// area, aligned to `align` (at least word alignment). Returns the
    /// address, or `None` if it would cross the grant floor.
    ///
    /// # Panics
    ///
    /// If `id` already has a slot, or is out of range. Callers check first.
    pub(crate) fn carve_grant(
        &mut self,
        id: usize,
        size: u32,
        align: u32,
    ) -> Option<u32> {
        if self.has_grant(id) {
            panic!("grant {} already allocated in process {}", id, self.name());
        }
        let align = align.max(4);
        let base = kerncore::align_down(
            self.grants.kernel_break.checked_sub(size)?,
            align,
        );
        if base < self.grants.floor {
            return None;
        }
        self.grants.kernel_break = base;
        self.grants.table[id] = Some(GrantEntry {
            address: base,
            size,
        });
        Some(base)
    }

    pub(crate) fn grant_bytes_mut(&mut self, id: usize) -> Option<&mut [u8]> {
        let GrantEntry { address, size } = (*self.grants.table.get(id)?)?;
        let offset = (address - self.memory_start) as usize;
        self.memory.get_mut(offset..offset + size as usize)
    }

    /// Structured description of the process for crash logs.
    pub fn fault_report(&self) -> FaultReport<'_, 'a> {
        FaultReport { process: self }
    }
}

impl fmt::Debug for Process<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name())
            .field("id", &self.id())
            .field("state", &self.state)
            .field("callbacks", &self.callbacks.len())
            .finish_non_exhaustive()
    }
}

/// Reasons a restart or termination request can't be carried out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RestartError {
    NoSuchProcess,
    /// The image in flash no longer parses.
    BadHeader,
    /// Some processes in a bulk restart couldn't be restarted; the rest
    /// were.
    Incomplete { failures: usize },
}

impl fmt::Display for RestartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchProcess => f.write_str("no such process"),
            Self::BadHeader => f.write_str("image header no longer valid"),
            Self::Incomplete { failures } => {
                write!(f, "{failures} process(es) could not be restarted")
            }
        }
    }
}

/// Crash report for a process; see [`Process::fault_report`].
pub struct FaultReport<'p, 'a> {
    process: &'p Process<'a>,
}

impl fmt::Display for FaultReport<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.process;
        write!(f, "process {} ({}) ", p.name(), p.id())?;
        match p.state {
            ProcessState::Fault(fault) => writeln!(f, "faulted: {fault}")?,
            other => writeln!(f, "is {other:?}")?,
        }
        writeln!(
            f,
            "  flash  {:#010x}..{:#010x}, protected to {:#010x}",
            p.flash_start(),
            p.flash_end(),
            p.flash_protected_end(),
        )?;
        writeln!(
            f,
            "  ram    {:#010x}..{:#010x}, break {:#010x} (initial {:#010x})",
            p.memory_start(),
            p.memory_end(),
            p.app_break,
            p.initial_break,
        )?;
        writeln!(
            f,
            "  grants {:#010x}..{:#010x}, floor {:#010x}",
            p.kernel_memory_break(),
            p.memory_end(),
            p.grant_floor(),
        )?;
        for (id, e) in p.grant_entries() {
            writeln!(f, "    grant {id}: {:#010x} +{}", e.address, e.size)?;
        }
        let s = &p.save;
        writeln!(
            f,
            "  r0 {:#010x} r1 {:#010x} r2 {:#010x} r3 {:#010x}",
            s.regs[0], s.regs[1], s.regs[2], s.regs[3],
        )?;
        writeln!(
            f,
            "  sp {:#010x} pc {:#010x} lr {:#010x}",
            s.sp, s.pc, s.lr
        )?;
        let d = &p.debug;
        write!(
            f,
            "  syscalls {} (last {:?}), dropped callbacks {}, \
             timeslice expirations {}, restarts {}",
            d.syscall_count,
            d.last_syscall,
            d.dropped_callbacks,
            d.timeslice_expirations,
            d.restart_count,
        )
    }
}
