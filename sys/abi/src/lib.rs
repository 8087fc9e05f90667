// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and applications.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};

/// Enumeration of syscall numbers.
///
/// These are the values an application passes in the syscall descriptor
/// register when it traps into the kernel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Sysnum {
    Yield = 0,
    Subscribe = 1,
    Command = 2,
    Allow = 3,
    Memop = 4,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't depend on `num-traits` and this
/// seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Yield),
            1 => Ok(Self::Subscribe),
            2 => Ok(Self::Command),
            3 => Ok(Self::Allow),
            4 => Ok(Self::Memop),
            _ => Err(()),
        }
    }
}

/// Result of a syscall, as seen by the application.
///
/// This is a closed set. Failures encode as negative register values,
/// successes as zero or a non-negative value. `SuccessWithValue` can therefore
/// only carry values below `0x8000_0000`; the kernel only uses it for
/// addresses, counts, and previously registered callback pointers.
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ReturnCode {
    /// Success value must be non-negative when read as an `i32`.
    SuccessWithValue { value: u32 },
    SUCCESS,
    /// Generic failure condition.
    FAIL,
    /// Underlying system is busy; retry.
    EBUSY,
    /// The state requested is already set.
    EALREADY,
    /// The component is powered down.
    EOFF,
    /// Reservation required before use.
    ERESERVE,
    /// An invalid parameter was passed.
    EINVAL,
    /// Parameter passed was too large.
    ESIZE,
    /// Operation cancelled by a call.
    ECANCEL,
    /// Memory required not available.
    ENOMEM,
    /// Operation or command is unsupported.
    ENOSUPPORT,
    /// Device does not exist.
    ENODEVICE,
    /// Device is not physically installed.
    EUNINSTALLED,
    /// Packet transmission not acknowledged.
    ENOACK,
}

impl ReturnCode {
    /// Checks whether this code reports success of any kind.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::SUCCESS | Self::SuccessWithValue { .. })
    }

    /// Produces the signed value written to the application's return
    /// register.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::SuccessWithValue { value } => value as i32,
            Self::SUCCESS => 0,
            Self::FAIL => -1,
            Self::EBUSY => -2,
            Self::EALREADY => -3,
            Self::EOFF => -4,
            Self::ERESERVE => -5,
            Self::EINVAL => -6,
            Self::ESIZE => -7,
            Self::ECANCEL => -8,
            Self::ENOMEM => -9,
            Self::ENOSUPPORT => -10,
            Self::ENODEVICE => -11,
            Self::EUNINSTALLED => -12,
            Self::ENOACK => -13,
        }
    }

    /// Decodes a raw return register, as an application library would.
    ///
    /// Zero decodes as `SUCCESS`. Negative values outside the defined set
    /// produce `None`.
    pub fn from_i32(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => Self::SUCCESS,
            v if v > 0 => Self::SuccessWithValue { value: v as u32 },
            -1 => Self::FAIL,
            -2 => Self::EBUSY,
            -3 => Self::EALREADY,
            -4 => Self::EOFF,
            -5 => Self::ERESERVE,
            -6 => Self::EINVAL,
            -7 => Self::ESIZE,
            -8 => Self::ECANCEL,
            -9 => Self::ENOMEM,
            -10 => Self::ENOSUPPORT,
            -11 => Self::ENODEVICE,
            -12 => Self::EUNINSTALLED,
            -13 => Self::ENOACK,
            _ => return None,
        })
    }
}

impl From<ReturnCode> for u32 {
    fn from(rc: ReturnCode) -> Self {
        rc.as_i32() as u32
    }
}

/// Operations accepted by the `Memop` syscall, selected by its first
/// argument.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u32)]
pub enum MemopOp {
    /// Set the application break to an absolute address.
    Brk = 0,
    /// Move the application break by a signed increment, returning the old
    /// break.
    Sbrk = 1,
    MemoryStart = 2,
    MemoryEnd = 3,
    FlashStart = 4,
    FlashEnd = 5,
    GrantStart = 6,
    WriteableFlashRegionCount = 7,
    WriteableFlashRegionStart = 8,
    WriteableFlashRegionEnd = 9,
    /// Debug hint: the application reports where its stack begins.
    StackTop = 10,
    /// Debug hint: the application reports where its heap begins.
    HeapStart = 11,
}

impl core::convert::TryFrom<u32> for MemopOp {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Brk),
            1 => Ok(Self::Sbrk),
            2 => Ok(Self::MemoryStart),
            3 => Ok(Self::MemoryEnd),
            4 => Ok(Self::FlashStart),
            5 => Ok(Self::FlashEnd),
            6 => Ok(Self::GrantStart),
            7 => Ok(Self::WriteableFlashRegionCount),
            8 => Ok(Self::WriteableFlashRegionStart),
            9 => Ok(Self::WriteableFlashRegionEnd),
            10 => Ok(Self::StackTop),
            11 => Ok(Self::HeapStart),
            _ => Err(()),
        }
    }
}

/// Scheduling and health state of a process.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProcessState {
    /// Process is able to run, or is running.
    #[default]
    Running,
    /// Process has called Yield and is waiting for a callback.
    Yielded,
    /// Process has been stopped by a fault and will not run again until it is
    /// explicitly restarted.
    Fault(FaultInfo),
    /// Process was shut down by the kernel and its grant memory reclaimed.
    Terminated,
}

impl ProcessState {
    /// Checks whether a process in this state belongs to a live incarnation,
    /// i.e. one whose grants may be entered.
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Running | Self::Yielded)
    }
}

/// Origin of a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultSource {
    /// User code did something that was intercepted by the processor.
    User,
    /// User code asked the kernel to do something bad on its behalf.
    Kernel,
}

/// A record describing a fault taken by a process.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultInfo {
    /// The process has violated memory access rules. This may have come from
    /// a memory protection fault while executing the process (`source`
    /// `User`) or from checks on kernel syscall arguments (`source`
    /// `Kernel`).
    MemoryAccess {
        /// Problematic address, if the hardware reported a precise one.
        address: Option<u32>,
        source: FaultSource,
    },
    /// The process ran its stack pointer below the bottom of its RAM.
    StackOverflow { address: u32 },
    /// A bus error, precise or not.
    BusError {
        address: Option<u32>,
        source: FaultSource,
    },
    DivideByZero,
    /// Attempt to execute non-executable memory.
    IllegalText,
    /// Execution of an illegal instruction.
    IllegalInstruction,
    /// Other invalid operation, with an architecture-specific 32-bit code
    /// (on ARMv7-M, the bits of the Configurable Fault Status Register).
    InvalidOperation(u32),
    /// Arguments passed to a syscall were invalid in a way that can't be
    /// reported with a return code.
    SyscallUsage(UsageError),
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

impl core::fmt::Display for FaultInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::MemoryAccess { address, source } => {
                write!(f, "memory access violation ({source:?})")?;
                if let Some(a) = address {
                    write!(f, " at {a:#010x}")?;
                }
                Ok(())
            }
            Self::StackOverflow { address } => {
                write!(f, "stack overflow at {address:#010x}")
            }
            Self::BusError { address, source } => {
                write!(f, "bus error ({source:?})")?;
                if let Some(a) = address {
                    write!(f, " at {a:#010x}")?;
                }
                Ok(())
            }
            Self::DivideByZero => f.write_str("divide by zero"),
            Self::IllegalText => f.write_str("executed non-executable memory"),
            Self::IllegalInstruction => f.write_str("illegal instruction"),
            Self::InvalidOperation(code) => {
                write!(f, "invalid operation (code {code:#010x})")
            }
            Self::SyscallUsage(e) => write!(f, "syscall usage error: {e:?}"),
        }
    }
}

/// A kernel-defined fault, arising from how a user process behaved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum UsageError {
    /// A program used an undefined syscall number.
    BadSyscallNumber,
    /// A program passed a buffer that is misaligned or wraps the top of the
    /// address space.
    InvalidSlice,
}
