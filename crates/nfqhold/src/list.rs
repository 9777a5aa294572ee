// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet lifecycle tracking: record arena + intrusive FIFO lists.
//!
//! Records live in a [`PacketArena`] and are addressed by generational
//! [`RecordHandle`]s; the linked-list structure is intrusive (prev/next
//! slot indices stored in the record itself), giving O(1) append and
//! O(1) removal of an arbitrary member with no searching. Generations
//! make stale handles resolve to `None` after a slot is reclaimed,
//! which is what makes consumer release requests idempotent.
//!
//! Invariant, enforced with panics: a record is a member of at most
//! one list at any time. Linking an already-linked record, or
//! unlinking a record from a list it is not in, is a programming error
//! in the connection code and fails fast.

use crate::packet::ReleaseReason;
use std::time::Instant;

/// Generational handle to a record in a [`PacketArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHandle {
    index: u32,
    generation: u32,
}

/// Identity of the list a record is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListTag {
    /// Awaiting a release trigger.
    Held,
    /// Verdict pending dispatch.
    ToRelease,
}

/// Internal tracking state for one held packet.
#[derive(Debug)]
pub(crate) struct PacketRecord {
    /// Queue-local packet ID; only meaningful for the owning connection.
    pub(crate) id: u32,
    /// Instant the packet was first received from the transport.
    pub(crate) hold_time: Instant,
    /// Why the packet is being released. Defaults to consumer request;
    /// overwritten by age-based expiry.
    pub(crate) reason: ReleaseReason,

    prev: Option<u32>,
    next: Option<u32>,
    owner: Option<ListTag>,
}

impl PacketRecord {
    pub(crate) fn new(id: u32, hold_time: Instant) -> Self {
        Self {
            id,
            hold_time,
            reason: ReleaseReason::ConsumerRequested,
            prev: None,
            next: None,
            owner: None,
        }
    }

    /// The list this record is currently linked into, if any.
    pub(crate) fn owner(&self) -> Option<ListTag> {
        self.owner
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<PacketRecord>,
}

/// Slab of packet records addressed by generational handles.
#[derive(Debug, Default)]
pub(crate) struct PacketArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl PacketArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store `record`, reusing a free slot when one exists.
    pub(crate) fn insert(&mut self, record: PacketRecord) -> RecordHandle {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.record.is_none());
                slot.record = Some(record);
                RecordHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    record: Some(record),
                });
                RecordHandle {
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Resolve a handle, returning `None` when the slot has since been
    /// reclaimed (stale handle).
    pub(crate) fn get(&self, handle: RecordHandle) -> Option<&PacketRecord> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.record.as_ref()
    }

    /// Mutable variant of [`PacketArena::get`].
    pub(crate) fn get_mut(&mut self, handle: RecordHandle) -> Option<&mut PacketRecord> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.record.as_mut()
    }

    /// Reclaim the record behind `handle`. The record must be live and
    /// not linked to any list.
    pub(crate) fn free(&mut self, handle: RecordHandle) -> PacketRecord {
        let slot = &mut self.slots[handle.index as usize];
        assert_eq!(
            slot.generation, handle.generation,
            "freeing a stale packet record handle"
        );
        let record = slot
            .record
            .take()
            .expect("freeing an already-freed packet record");
        assert!(
            record.owner.is_none(),
            "freeing a packet record that is still linked to a list"
        );
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        record
    }

    /// Number of live records.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    fn handle_at(&self, index: u32) -> RecordHandle {
        RecordHandle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn record(&self, index: u32) -> &PacketRecord {
        self.slots[index as usize]
            .record
            .as_ref()
            .expect("linked list references a vacant slot")
    }

    fn record_mut(&mut self, index: u32) -> &mut PacketRecord {
        self.slots[index as usize]
            .record
            .as_mut()
            .expect("linked list references a vacant slot")
    }
}

/// Ordered (FIFO by arrival) intrusive list of packet records.
#[derive(Debug)]
pub(crate) struct PacketList {
    tag: ListTag,
    first: Option<u32>,
    last: Option<u32>,
    len: usize,
}

impl PacketList {
    pub(crate) fn new(tag: ListTag) -> Self {
        Self {
            tag,
            first: None,
            last: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handle of the oldest record, if any.
    pub(crate) fn first(&self, arena: &PacketArena) -> Option<RecordHandle> {
        self.first.map(|index| arena.handle_at(index))
    }

    /// Append to the tail. The record must not already be linked.
    pub(crate) fn push_back(&mut self, arena: &mut PacketArena, handle: RecordHandle) {
        {
            let record = arena
                .get(handle)
                .expect("linking a stale packet record handle");
            assert!(
                record.owner.is_none(),
                "packet record is already linked to a list"
            );
        }

        let index = handle.index;
        match self.last {
            Some(last) => {
                arena.record_mut(last).next = Some(index);
                let record = arena.record_mut(index);
                record.prev = Some(last);
                record.owner = Some(self.tag);
                self.last = Some(index);
            }
            None => {
                let record = arena.record_mut(index);
                record.prev = None;
                record.owner = Some(self.tag);
                self.first = Some(index);
                self.last = Some(index);
            }
        }
        arena.record_mut(index).next = None;
        self.len += 1;
    }

    /// Unlink a record from wherever it sits in this list. The record
    /// must be linked to *this* list.
    pub(crate) fn unlink(&mut self, arena: &mut PacketArena, handle: RecordHandle) {
        let (prev, next) = {
            let record = arena
                .get(handle)
                .expect("unlinking a stale packet record handle");
            assert_eq!(
                record.owner,
                Some(self.tag),
                "packet record is not linked to this list"
            );
            (record.prev, record.next)
        };

        let index = handle.index;
        match prev {
            Some(prev) => arena.record_mut(prev).next = next,
            None => self.first = next,
        }
        match next {
            Some(next) => arena.record_mut(next).prev = prev,
            None => self.last = prev,
        }

        let record = arena.record_mut(index);
        record.prev = None;
        record.next = None;
        record.owner = None;
        self.len -= 1;
    }

    /// Unlink and return the oldest record, if any.
    pub(crate) fn pop_front(&mut self, arena: &mut PacketArena) -> Option<RecordHandle> {
        let handle = self.first(arena)?;
        self.unlink(arena, handle);
        Some(handle)
    }

    /// Handle of the record following `handle` in this list.
    #[cfg(test)]
    pub(crate) fn next(&self, arena: &PacketArena, handle: RecordHandle) -> Option<RecordHandle> {
        let record = arena.get(handle)?;
        debug_assert_eq!(record.owner(), Some(self.tag));
        record.next.map(|index| arena.handle_at(index))
    }
}
