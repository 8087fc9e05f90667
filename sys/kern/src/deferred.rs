// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deferred calls: capsule work that runs from the main loop.
//!
//! A capsule that wants to finish something outside the syscall it is
//! handling (typically so that it can complete an operation asynchronously
//! without a hardware interrupt) registers a client at boot and gets a
//! [`DeferredCall`] handle. Setting the handle marks its slot pending; the
//! kernel runs pending clients between process slices.
//!
//! Pending slots live in one `u32`. Each round of servicing takes a snapshot
//! of the mask and runs each client in it once, so a client that sets itself
//! again runs in the next round rather than spinning.

use crate::config::DEFERRED_CALL_SLOTS;
use crate::driver::Context;

/// A capsule that can be run from the main loop.
pub trait DeferredCallClient {
    fn handle_deferred_call(&self, ctx: &mut Context<'_, '_>);
}

/// Handle for one registered client.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeferredCall {
    slot: u8,
}

impl DeferredCall {
    pub fn slot(&self) -> u32 {
        u32::from(self.slot)
    }
}

pub(crate) struct DeferredCalls<'a> {
    clients: [Option<&'a dyn DeferredCallClient>; DEFERRED_CALL_SLOTS],
    registered: usize,
    pending: u32,
}

impl<'a> DeferredCalls<'a> {
    pub(crate) fn new() -> Self {
        Self {
            clients: [None; DEFERRED_CALL_SLOTS],
            registered: 0,
            pending: 0,
        }
    }

    /// # Panics
    ///
    /// If every slot is taken. The number of clients is fixed by the board,
    /// so this only happens on a misconfigured build.
    pub(crate) fn register(
        &mut self,
        client: &'a dyn DeferredCallClient,
    ) -> DeferredCall {
        let slot = self.registered;
        if slot >= DEFERRED_CALL_SLOTS {
            panic!("all {DEFERRED_CALL_SLOTS} deferred call slots in use");
        }
        self.clients[slot] = Some(client);
        self.registered += 1;
        DeferredCall { slot: slot as u8 }
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending != 0
    }

    pub(crate) fn pending_mut(&mut self) -> &mut u32 {
        &mut self.pending
    }

    /// Clears the pending mask, returning what was in it.
    pub(crate) fn take_pending(&mut self) -> u32 {
        core::mem::take(&mut self.pending)
    }

    pub(crate) fn client(
        &self,
        slot: usize,
    ) -> Option<&'a dyn DeferredCallClient> {
        self.clients.get(slot).copied().flatten()
    }
}

/// Iterates over the slots set in `mask`, lowest first.
pub(crate) fn pending_slots(mask: u32) -> impl Iterator<Item = usize> {
    (0..DEFERRED_CALL_SLOTS).filter(move |&slot| mask & (1 << slot) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nobody;

    impl DeferredCallClient for Nobody {
        fn handle_deferred_call(&self, _ctx: &mut Context<'_, '_>) {}
    }

    #[test]
    fn slots_are_handed_out_in_order() {
        let nobody = Nobody;
        let mut calls = DeferredCalls::new();
        assert_eq!(calls.register(&nobody).slot(), 0);
        assert_eq!(calls.register(&nobody).slot(), 1);
        assert!(calls.client(1).is_some());
        assert!(calls.client(2).is_none());
    }

    #[test]
    #[should_panic(expected = "deferred call slots in use")]
    fn running_out_of_slots_panics() {
        let nobody = Nobody;
        let mut calls = DeferredCalls::new();
        for _ in 0..=DEFERRED_CALL_SLOTS {
            calls.register(&nobody);
        }
    }

    #[test]
    fn pending_mask_is_taken_whole() {
        let mut calls = DeferredCalls::new();
        *calls.pending_mut() |= 0b101;
        assert!(calls.has_pending());
        let mask = calls.take_pending();
        assert!(!calls.has_pending());
        assert_eq!(pending_slots(mask).collect::<Vec<_>>(), [0, 2]);
    }
}
