//! Fixed-capacity connection table.
//!
//! Slots are pre-allocated once; claiming a slot never allocates. Slots are
//! addressed by a [`SlotHandle`] carrying a generation counter, so a handle
//! kept across a release cannot reach the slot's next occupant.

use crate::error::TableError;
use crate::slot::{Slot, SlotState};
use crate::types::{ChannelId, PeerId};

/// Stable reference to a claimed slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: usize,
    generation: u32,
}

impl SlotHandle {
    /// Position of the slot in the table.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone, Default)]
struct Entry {
    generation: u32,
    slot: Slot,
}

/// Registry of every peer connection, one slot per peer.
#[derive(Debug, Clone)]
pub struct ConnectionTable {
    entries: Vec<Entry>,
}

impl ConnectionTable {
    /// Create a table with `capacity` unclaimed slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| Entry::default()).collect(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of claimed slots.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.slot.state().is_occupied())
            .count()
    }

    /// Number of slots currently in `state`.
    #[must_use]
    pub fn count_in(&self, state: SlotState) -> usize {
        self.entries
            .iter()
            .filter(|e| e.slot.state() == state)
            .count()
    }

    // ------------------------------------------------------------------ //
    // Claim / release
    // ------------------------------------------------------------------ //

    /// Claim the first free slot for `peer`, leaving it `ConnectPending`.
    ///
    /// Fails without mutating anything when `peer` already holds a slot or
    /// every slot is taken.
    pub fn allocate(&mut self, peer: PeerId) -> Result<SlotHandle, TableError> {
        if self.find_by_connection(peer).is_some() {
            return Err(TableError::PeerAlreadyConnected(peer));
        }
        let capacity = self.capacity();
        let (index, entry) = self
            .entries
            .iter_mut()
            .enumerate()
            .find(|(_, e)| !e.slot.state().is_occupied())
            .ok_or(TableError::NoCapacity { capacity })?;

        entry.slot.claim(peer);
        tracing::debug!(%peer, index, "table: slot claimed");
        Ok(SlotHandle {
            index,
            generation: entry.generation,
        })
    }

    /// Return a slot to the free pool.
    ///
    /// Any pending payload is dropped and the handle (and every copy of it)
    /// becomes stale.
    pub fn release(&mut self, handle: SlotHandle) -> Result<(), TableError> {
        let entry = self
            .entries
            .get_mut(handle.index)
            .filter(|e| e.generation == handle.generation && e.slot.state().is_occupied())
            .ok_or(TableError::StaleHandle)?;
        tracing::debug!(
            peer = ?entry.slot.peer(),
            channel = ?entry.slot.channel(),
            index = handle.index,
            "table: slot released"
        );
        entry.slot.reset();
        entry.generation = entry.generation.wrapping_add(1);
        Ok(())
    }

    // ------------------------------------------------------------------ //
    // Lookup
    // ------------------------------------------------------------------ //

    /// Find the slot claimed by `peer`.
    #[must_use]
    pub fn find_by_connection(&self, peer: PeerId) -> Option<SlotHandle> {
        self.find(|slot| slot.peer() == Some(peer))
    }

    /// Find the slot bound to channel `channel`.
    #[must_use]
    pub fn find_by_channel(&self, channel: ChannelId) -> Option<SlotHandle> {
        self.find(|slot| slot.channel() == Some(channel))
    }

    fn find(&self, pred: impl Fn(&Slot) -> bool) -> Option<SlotHandle> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.slot.state().is_occupied() && pred(&e.slot))
            .map(|(index, e)| SlotHandle {
                index,
                generation: e.generation,
            })
    }

    #[must_use]
    pub fn get(&self, handle: SlotHandle) -> Option<&Slot> {
        self.entries
            .get(handle.index)
            .filter(|e| e.generation == handle.generation)
            .map(|e| &e.slot)
    }

    pub fn get_mut(&mut self, handle: SlotHandle) -> Option<&mut Slot> {
        self.entries
            .get_mut(handle.index)
            .filter(|e| e.generation == handle.generation)
            .map(|e| &mut e.slot)
    }

    /// Handle for whatever currently occupies position `index`.
    #[must_use]
    pub fn handle_at(&self, index: usize) -> Option<SlotHandle> {
        self.entries.get(index).map(|e| SlotHandle {
            index,
            generation: e.generation,
        })
    }

    /// Slot at position `index`, claimed or not.
    #[must_use]
    pub fn slot_at(&self, index: usize) -> Option<&Slot> {
        self.entries.get(index).map(|e| &e.slot)
    }

    /// Iterate over every slot in table order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotHandle, &Slot)> {
        self.entries.iter().enumerate().map(|(index, e)| {
            (
                SlotHandle {
                    index,
                    generation: e.generation,
                },
                &e.slot,
            )
        })
    }
}
