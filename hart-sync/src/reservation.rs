//! Reservation Table for LR/SC emulation on the slow path.
//!
//! A dense array of live reservations plus a per-hart index into it. Each
//! hart owns at most one entry. Removal is a swap-remove: the last entry moves
//! into the freed slot and its owner's index is patched, so the live set stays
//! contiguous and removal is O(1).
//!
//! The table is not synchronized on its own; it lives inside the shared
//! state's mutex and is only reached through `SharedMemoryState`.

use crate::error::{SyncError, violation};
use crate::types::{HartId, overlaps_granule};

/// One live reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub owner: HartId,
    pub address: u64,
    /// Exempt from invalidation by plain writes; only an explicit cancel
    /// releases it.
    pub manual_release: bool,
}

/// What `reserve` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The hart already held this exact address.
    Unchanged,
    /// A new entry was created (any previous one was released first).
    Created { replaced: Option<u64> },
}

pub struct ReservationTable {
    entries: Vec<Reservation>,
    slot_of_hart: Vec<Option<usize>>,
    granule: u64,
}

impl ReservationTable {
    /// Table sized for `capacity` harts. `granule` is the overlap unit used
    /// by write invalidation.
    pub fn new(capacity: usize, granule: u64) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            slot_of_hart: vec![None; capacity],
            granule,
        }
    }

    /// Number of live reservations.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slot_of_hart.len()
    }

    /// Live entries, densely packed.
    pub fn entries(&self) -> &[Reservation] {
        &self.entries
    }

    /// The reservation held by `hart`, if any.
    pub fn get(&self, hart: HartId) -> Option<&Reservation> {
        self.slot_of_hart
            .get(hart.index())
            .copied()
            .flatten()
            .map(|slot| &self.entries[slot])
    }

    pub fn reserve(
        &mut self,
        hart: HartId,
        address: u64,
        manual_release: bool,
    ) -> Result<ReserveOutcome, SyncError> {
        if hart.index() >= self.capacity() {
            return violation(SyncError::ReservationTableFull {
                hart,
                capacity: self.capacity(),
            });
        }
        let replaced = match self.get(hart) {
            Some(res) if res.address == address => return Ok(ReserveOutcome::Unchanged),
            Some(res) => {
                let old = res.address;
                self.cancel(hart);
                Some(old)
            }
            None => None,
        };
        if self.entries.len() >= self.capacity() {
            return violation(SyncError::ReservationTableFull {
                hart,
                capacity: self.capacity(),
            });
        }
        self.entries.push(Reservation {
            owner: hart,
            address,
            manual_release,
        });
        self.slot_of_hart[hart.index()] = Some(self.entries.len() - 1);
        Ok(ReserveOutcome::Created { replaced })
    }

    /// True exactly when `hart` holds the reservation for `address`.
    pub fn check(&self, hart: HartId, address: u64) -> bool {
        self.get(hart).is_some_and(|res| res.address == address)
    }

    /// Release `hart`'s reservation, returning it.
    pub fn cancel(&mut self, hart: HartId) -> Option<Reservation> {
        let slot = self.slot_of_hart.get(hart.index()).copied().flatten()?;
        Some(self.remove_at(slot))
    }

    /// Drop every non-manual reservation overlapping `[address, address + len)`
    /// that is not owned by `writer`. Returns the number released.
    pub fn invalidate_overlapping(&mut self, writer: Option<HartId>, address: u64, len: u64) -> usize {
        let mut released = 0;
        let mut i = 0;
        while i < self.entries.len() {
            let res = self.entries[i];
            let hit = !res.manual_release
                && Some(res.owner) != writer
                && overlaps_granule(res.address, address, len, self.granule);
            if hit {
                // The last entry now sits at `i`; look at it before moving on.
                self.remove_at(i);
                released += 1;
            } else {
                i += 1;
            }
        }
        released
    }

    fn remove_at(&mut self, slot: usize) -> Reservation {
        let removed = self.entries.swap_remove(slot);
        self.slot_of_hart[removed.owner.index()] = None;
        if let Some(moved) = self.entries.get(slot) {
            self.slot_of_hart[moved.owner.index()] = Some(slot);
        }
        removed
    }

    /// Verify the index is the exact inverse of the entry array.
    #[cfg(test)]
    fn assert_consistent(&self) {
        for (slot, res) in self.entries.iter().enumerate() {
            assert_eq!(self.slot_of_hart[res.owner.index()], Some(slot));
        }
        let indexed = self.slot_of_hart.iter().filter(|s| s.is_some()).count();
        assert_eq!(indexed, self.entries.len());
    }
}
