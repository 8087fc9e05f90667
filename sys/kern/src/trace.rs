// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel event trace.
//!
//! A fixed-size ring of recent kernel events, readable from a debugger or by
//! board code through `Kernel::trace`. Recording an event that is identical
//! to the newest entry (same source line, same payload) bumps that entry's
//! count instead of using a new slot, so a process spinning on one syscall
//! doesn't wash out the history.

use abi::{FaultInfo, Sysnum};

use crate::startup::LoadFailure;

/// Records `$payload` in `$buf`, tagged with the current source line.
macro_rules! trace_event {
    ($buf:expr, $payload:expr) => {
        $buf.entry(line!() as u16, $payload)
    };
}

/// Things worth remembering.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Trace {
    None,
    Loaded {
        index: usize,
        flash_start: u32,
        memory_start: u32,
        memory_size: u32,
    },
    LoadSkipped {
        flash_start: u32,
        reason: LoadFailure,
    },
    Faulted {
        index: usize,
        fault: FaultInfo,
    },
    Restarted {
        index: usize,
        generation: u32,
    },
    Terminated {
        index: usize,
    },
    GrantAllocated {
        index: usize,
        grant: usize,
        address: u32,
    },
    CallbackDropped {
        index: usize,
        driver: u32,
        subscribe_num: u32,
    },
    Syscall {
        index: usize,
        class: Sysnum,
    },
}

/// One slot of a [`Ringbuf`].
#[derive(Copy, Clone, Debug)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    /// Source line that recorded the event.
    pub line: u16,
    /// Bumped every time the slot is reused, so a reader can tell a fresh
    /// entry from a stale one.
    pub generation: u16,
    /// Times this event was recorded back to back.
    pub count: u32,
    pub payload: T,
}

#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    /// Slot written most recently, or `None` before the first entry.
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    /// Creates an empty ring. `blank` fills the unused slots.
    pub fn new(blank: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: blank,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        if let Some(ent) = self.last.and_then(|i| self.buffer.get_mut(i)) {
            if ent.line == line && ent.payload == payload {
                if let Some(count) = ent.count.checked_add(1) {
                    ent.count = count;
                    return;
                }
            }
        }

        let next = match self.last {
            Some(i) if i + 1 < N => i + 1,
            _ => 0,
        };
        let Some(ent) = self.buffer.get_mut(next) else {
            // Zero-length ring; nothing is ever kept.
            return;
        };
        *ent = RingbufEntry {
            line,
            generation: ent.generation.wrapping_add(1),
            count: 1,
            payload,
        };
        self.last = Some(next);
    }

    /// Entries in the order they were recorded, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = self.last.map_or(0, |i| i + 1);
        self.buffer[start..]
            .iter()
            .chain(&self.buffer[..start])
            .filter(|e| e.count != 0)
    }

    /// The most recent entry, if any.
    pub fn last(&self) -> Option<&RingbufEntry<T>> {
        self.last.and_then(|i| self.buffer.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_are_counted_not_stored() {
        let mut rb = Ringbuf::<u32, 4>::new(0);
        rb.entry(10, 7);
        rb.entry(10, 7);
        rb.entry(10, 7);
        rb.entry(11, 7);
        let v: Vec<_> = rb.iter().map(|e| (e.line, e.payload, e.count)).collect();
        assert_eq!(v, [(10, 7, 3), (11, 7, 1)]);
    }

    #[test]
    fn wraps_and_keeps_order() {
        let mut rb = Ringbuf::<u32, 3>::new(0);
        for i in 1..=5 {
            rb.entry(1, i);
        }
        let v: Vec<_> = rb.iter().map(|e| e.payload).collect();
        assert_eq!(v, [3, 4, 5]);
        assert_eq!(rb.last().map(|e| e.payload), Some(5));
        // Slot 0 has been written twice.
        assert_eq!(rb.buffer[0].generation, 2);
    }

    #[test]
    fn empty_ring_yields_nothing() {
        let rb = Ringbuf::<Trace, 8>::new(Trace::None);
        assert_eq!(rb.iter().count(), 0);
        assert!(rb.last().is_none());
    }
}
