// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Buffers named by processes, and the handles drivers keep to them.

use core::ops::Range;

use abi::UsageError;

use crate::process::ProcessId;

/// A buffer a process names in a syscall, as a pointer and a length in its
/// 32-bit address space.
///
/// This is only a claim. It may point into the kernel, at another process,
/// or at flash; the one thing known about it is that it doesn't run past the
/// top of the address space. Check it against the process's region table
/// (`Process::validate_allow`) and then [`USlice::bind`] it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct USlice {
    base: u32,
    len: u32,
}

impl USlice {
    /// Takes a pointer and length straight from a process's registers.
    pub fn from_raw(ptr: u32, len: u32) -> Result<Self, UsageError> {
        match ptr.checked_add(len) {
            Some(_) => Ok(Self { base: ptr, len }),
            None => Err(UsageError::InvalidSlice),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn base_addr(&self) -> u32 {
        self.base
    }

    /// Addresses the buffer covers.
    pub fn span(&self) -> Range<u32> {
        // Can't wrap; see from_raw.
        self.base..self.base.wrapping_add(self.len)
    }

    /// Ties a checked buffer to the incarnation of the process that named it.
    pub(crate) fn bind(self, process: ProcessId) -> AppSlice {
        AppSlice::new(process, self.base, self.len)
    }
}

/// A buffer a process has shared with a driver through Allow.
///
/// This is a handle, not a borrow: it names the process incarnation and the
/// range it allowed. The bytes are reached through
/// `Context::with_app_slice`, which checks again at that moment that the
/// process is the same incarnation and the range is still inside its
/// accessible memory. A handle kept past a restart, or past a `brk` that
/// shrank the process below it, simply stops working.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AppSlice {
    process: ProcessId,
    base: u32,
    len: u32,
}

impl AppSlice {
    pub(crate) fn new(process: ProcessId, base: u32, len: u32) -> Self {
        Self { process, base, len }
    }

    /// The process that shared the buffer.
    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn base_addr(&self) -> u32 {
        self.base
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Reasons a capsule can't reach a shared buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AccessError {
    /// The process has restarted, faulted, or been terminated since sharing.
    ProcessGone,
    /// The buffer is no longer inside the process's accessible memory.
    OutOfBounds,
}

impl core::fmt::Display for AccessError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ProcessGone => f.write_str("process is gone"),
            Self::OutOfBounds => f.write_str("buffer out of bounds"),
        }
    }
}
