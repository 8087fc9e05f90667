// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Grants: per-process capsule state stored in the process's own RAM.
//!
//! A capsule that needs state for each process it serves gets a
//! [`Grant<T>`] from the board at boot. Each `Grant` owns one slot in every
//! process's grant table. The slot is carved out of the top of the process's
//! RAM the first time the capsule allocates it for that process, and stays
//! until the process restarts or is terminated, at which point the whole grant
//! area is reclaimed at once.
//!
//! Grant data is plain old data. Entering a grant copies the value out of
//! process memory, runs the capsule's closure on the copy, and writes it back.
//! The closure can't reach the kernel context while it runs, so two grants
//! (or a grant and a shared buffer) can never be borrowed at the same time.

use core::fmt;
use core::marker::PhantomData;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::driver::Context;
use crate::process::ProcessId;
use crate::trace::Trace;

/// Types that can live in a grant.
pub trait GrantData: FromBytes + IntoBytes + Immutable + KnownLayout {}

impl<T: FromBytes + IntoBytes + Immutable + KnownLayout> GrantData for T {}

/// Reasons a grant operation can fail.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GrantError {
    /// The process is not alive (or is a different incarnation), or hasn't
    /// had this grant allocated.
    NoSuchGrant,
    /// The process's grant area can't fit the value.
    AllocationFailed,
}

impl fmt::Display for GrantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchGrant => f.write_str("no such grant"),
            Self::AllocationFailed => f.write_str("grant allocation failed"),
        }
    }
}

/// A capsule's handle on one grant slot, binding it to the type `T`.
///
/// Created by `Kernel::create_grant`.
pub struct Grant<T: GrantData> {
    id: usize,
    _marker: PhantomData<T>,
}

impl<T: GrantData> Grant<T> {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Makes sure `process` has this grant, initializing it with `init()` if
    /// it is being allocated now. Allocating again is harmless and leaves the
    /// existing value alone.
    pub fn allocate(
        &self,
        ctx: &mut Context<'_, '_>,
        process: ProcessId,
        init: impl FnOnce() -> T,
    ) -> Result<GrantRef<T>, GrantError> {
        let p = ctx
            .live_process_mut(process)
            .ok_or(GrantError::NoSuchGrant)?;
        if p.has_grant(self.id) {
            return Ok(GrantRef::new(process, self.id));
        }

        let size = core::mem::size_of::<T>() as u32;
        let align = core::mem::align_of::<T>() as u32;
        let Some(address) = p.carve_grant(self.id, size, align) else {
            klog!(
                warn: "grant {} ({} bytes) doesn't fit in {}",
                self.id,
                size,
                process
            );
            return Err(GrantError::AllocationFailed);
        };
        if let Some(bytes) = p.grant_bytes_mut(self.id) {
            bytes.copy_from_slice(init().as_bytes());
        }

        trace_event!(
            ctx.trace,
            Trace::GrantAllocated {
                index: process.index(),
                grant: self.id,
                address,
            }
        );
        Ok(GrantRef::new(process, self.id))
    }

    /// Runs `body` on `process`'s value of this grant.
    pub fn enter<R>(
        &self,
        ctx: &mut Context<'_, '_>,
        process: ProcessId,
        body: impl FnOnce(&mut T) -> R,
    ) -> Result<R, GrantError> {
        let bytes = ctx
            .live_process_mut(process)
            .and_then(|p| p.grant_bytes_mut(self.id))
            .ok_or(GrantError::NoSuchGrant)?;
        let mut value =
            T::read_from_bytes(bytes).map_err(|_| GrantError::NoSuchGrant)?;
        let r = body(&mut value);
        bytes.copy_from_slice(value.as_bytes());
        Ok(r)
    }

    /// Runs `body` on this grant's value in every live process that has it.
    pub fn each(
        &self,
        ctx: &mut Context<'_, '_>,
        mut body: impl FnMut(ProcessId, &mut T),
    ) {
        for p in ctx.processes.iter_mut().filter(|p| p.state().is_alive()) {
            let id = p.id();
            let Some(bytes) = p.grant_bytes_mut(self.id) else {
                continue;
            };
            let Some(mut value) = T::read_from_bytes(bytes).ok() else {
                continue;
            };
            body(id, &mut value);
            bytes.copy_from_slice(value.as_bytes());
        }
    }
}

impl<T: GrantData> Clone for Grant<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: GrantData> Copy for Grant<T> {}

impl<T: GrantData> fmt::Debug for Grant<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grant").field("id", &self.id).finish()
    }
}

/// One process's instance of a grant, as returned by
/// [`Grant::allocate`].
///
/// Holding a `GrantRef` doesn't keep anything alive. If the process restarts,
/// entering the reference fails with `NoSuchGrant`.
pub struct GrantRef<T: GrantData> {
    process: ProcessId,
    grant: Grant<T>,
}

impl<T: GrantData> GrantRef<T> {
    fn new(process: ProcessId, id: usize) -> Self {
        Self {
            process,
            grant: Grant::new(id),
        }
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn enter<R>(
        &self,
        ctx: &mut Context<'_, '_>,
        body: impl FnOnce(&mut T) -> R,
    ) -> Result<R, GrantError> {
        self.grant.enter(ctx, self.process, body)
    }
}

impl<T: GrantData> Clone for GrantRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: GrantData> Copy for GrantRef<T> {}

impl<T: GrantData> fmt::Debug for GrantRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantRef")
            .field("process", &self.process)
            .field("grant", &self.grant.id)
            .finish()
    }
}
