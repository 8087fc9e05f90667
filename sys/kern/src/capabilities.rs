// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability tokens.
//!
//! Some kernel operations are only for trusted code: board bring-up, or a
//! small number of privileged capsules. Each of these takes a reference to a
//! token type whose constructor is `unsafe`. Ordinary capsules are compiled
//! with `unsafe` forbidden, so they cannot mint one and cannot call the
//! operation.

/// Permits restarting and terminating processes.
#[derive(Debug)]
pub struct ProcessManagementCapability(());

impl ProcessManagementCapability {
    /// # Safety
    ///
    /// Only trusted code may hold this capability.
    pub unsafe fn new() -> Self {
        Self(())
    }
}

/// Permits entering the kernel main loop.
#[derive(Debug)]
pub struct MainLoopCapability(());

impl MainLoopCapability {
    /// # Safety
    ///
    /// Only board bring-up code may hold this capability.
    pub unsafe fn new() -> Self {
        Self(())
    }
}

/// Permits creating grant types, which reserve space in every process.
#[derive(Debug)]
pub struct MemoryAllocationCapability(());

impl MemoryAllocationCapability {
    /// # Safety
    ///
    /// Only trusted code may hold this capability.
    pub unsafe fn new() -> Self {
        Self(())
    }
}
