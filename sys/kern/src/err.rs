// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Syscall implementations report problems through `Result`, and a single
//! wrapper in `syscalls` turns them into either a return code for the
//! process or a fault against it.

use abi::{FaultInfo, ReturnCode, UsageError};

use crate::process::NextTask;

/// An error committed by user code when interacting with a syscall.
#[derive(Clone, Debug)]
pub enum UserError {
    /// A recoverable error. The process sees the return code in its result
    /// register. It may still cause a context switch, as indicated by the
    /// `NextTask`.
    Recoverable(ReturnCode, NextTask),
    /// An unrecoverable error. The process is faulted and stops running.
    Unrecoverable(FaultInfo),
}

/// Shorthand for the common case: fail the syscall and keep running the
/// caller.
impl From<ReturnCode> for UserError {
    fn from(code: ReturnCode) -> Self {
        Self::Recoverable(code, NextTask::Same)
    }
}

impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}

impl From<UsageError> for UserError {
    fn from(f: UsageError) -> Self {
        Self::Unrecoverable(f.into())
    }
}
