//! Fast-Path Lock Table.
//!
//! A fixed, power-of-two sized table of per-slot spinlocks and last-writer
//! tags. It lets LR/SC on ordinary, naturally aligned memory run without the
//! global memory lock.
//!
//! A slot does not identify one address. It identifies an equivalence class:
//! every address in a reservation granule hashes to the same slot, and
//! distinct granules may alias. Aliasing can only cause a spurious SC failure
//! (a foreign tag on a shared slot), never a missed conflict, because every
//! access to a granule goes through the same slot.
//!
//! Per-slot words are only ever changed with atomic operations.

use crate::error::{SyncError, violation};
use crate::memory::GuestMemory;
use crate::types::{AccessType, FastLoad, HartId, ScOutcome, Width, crosses_page};
use std::hint::spin_loop;
use std::sync::atomic::{AtomicU32, Ordering};

/// Sentinel for "no hart" in both slot words.
pub const UNLOCKED: u32 = u32::MAX;

#[inline]
fn decode(word: u32) -> Option<HartId> {
    (word != UNLOCKED).then(|| HartId::new(word))
}

struct FastPathEntry {
    /// Hart whose access last touched this slot's granules.
    last_writer: AtomicU32,
    /// `UNLOCKED` or the id of the hart holding the slot.
    lock_word: AtomicU32,
}

/// Reservation taken by a fast-path load-reserved. Owned by the hart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastReservation {
    pub address: u64,
    pub width: Width,
    /// Value observed by the load; the SC compares against it.
    pub value: u64,
}

pub struct FastPathTable {
    slots: Box<[FastPathEntry]>,
    mask: usize,
    granule_shift: u32,
    page_size: u64,
}

/// Holds one slot's spinlock; unlocks on drop.
pub(crate) struct SlotGuard<'a> {
    table: &'a FastPathTable,
    slot: usize,
    hart: HartId,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let _ = self.table.release_slot(self.slot, self.hart);
    }
}

impl FastPathTable {
    /// `slots` must be a power of two.
    pub fn new(slots: usize, granule: u64, page_size: u64) -> Self {
        debug_assert!(slots.is_power_of_two());
        let slots: Box<[FastPathEntry]> = (0..slots)
            .map(|_| FastPathEntry {
                last_writer: AtomicU32::new(UNLOCKED),
                lock_word: AtomicU32::new(UNLOCKED),
            })
            .collect();
        Self {
            mask: slots.len() - 1,
            slots,
            granule_shift: granule.trailing_zeros(),
            page_size,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot (address-equivalence class) for `address`.
    #[inline(always)]
    pub fn slot_index(&self, address: u64) -> usize {
        ((address >> self.granule_shift) as usize) & self.mask
    }

    /// True if `address`/`width` may use the fast path at all.
    #[inline]
    pub fn eligible(&self, address: u64, width: Width) -> bool {
        width.is_aligned(address) && !crosses_page(address, width, self.page_size)
    }

    // ========== Spinlock ==========

    /// Spin until `hart` owns the slot for `address`. Returns the slot index.
    ///
    /// No timeout: critical sections under a slot are a handful of loads and
    /// one compare-and-swap.
    pub fn lock(&self, hart: HartId, address: u64) -> usize {
        let slot = self.slot_index(address);
        self.lock_slot(hart, slot);
        slot
    }

    fn lock_slot(&self, hart: HartId, slot: usize) {
        let word = &self.slots[slot].lock_word;
        loop {
            match word.compare_exchange_weak(UNLOCKED, hart.get(), Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return,
                Err(current) => {
                    debug_assert_ne!(
                        current,
                        hart.get(),
                        "deadlock: {hart} re-acquiring fast-path slot {slot} it already holds"
                    );
                }
            }
            // Spin on a plain load until the holder lets go.
            while word.load(Ordering::Relaxed) != UNLOCKED {
                spin_loop();
            }
        }
    }

    /// Release the slot for `address`. Only the holder may unlock.
    pub fn unlock(&self, hart: HartId, address: u64) -> Result<(), SyncError> {
        self.release_slot(self.slot_index(address), hart)
    }

    fn release_slot(&self, slot: usize, hart: HartId) -> Result<(), SyncError> {
        match self.slots[slot].lock_word.compare_exchange(
            hart.get(),
            UNLOCKED,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => Ok(()),
            Err(holder) => violation(SyncError::FastPathNotHeld {
                hart,
                slot,
                holder: decode(holder),
            }),
        }
    }

    pub(crate) fn guard(&self, hart: HartId, address: u64) -> SlotGuard<'_> {
        let slot = self.lock(hart, address);
        SlotGuard {
            table: self,
            slot,
            hart,
        }
    }

    fn guard_slot(&self, hart: HartId, slot: usize) -> SlotGuard<'_> {
        self.lock_slot(hart, slot);
        SlotGuard {
            table: self,
            slot,
            hart,
        }
    }

    /// Lock every slot covering `[address, address + width)`. A span touches
    /// at most two slots; they are taken lowest index first, which is the only
    /// place a hart holds more than one slot.
    pub(crate) fn guard_span(&self, hart: HartId, address: u64, width: Width) -> (SlotGuard<'_>, Option<SlotGuard<'_>>) {
        let first = self.slot_index(address);
        let last = self.slot_index(address.wrapping_add(width.bytes() - 1));
        if first == last {
            return (self.guard_slot(hart, first), None);
        }
        let (low, high) = (first.min(last), first.max(last));
        let low = self.guard_slot(hart, low);
        (low, Some(self.guard_slot(hart, high)))
    }

    /// Current holder of the slot for `address`.
    pub fn holder(&self, address: u64) -> Option<HartId> {
        decode(self.slots[self.slot_index(address)].lock_word.load(Ordering::Acquire))
    }

    // ========== Writer tags ==========

    /// Tag the slot for `address` as last touched by `hart`. A later SC by a
    /// different hart that reserved through this slot will fail.
    #[inline]
    pub fn register_access(&self, hart: HartId, address: u64) {
        self.slots[self.slot_index(address)]
            .last_writer
            .store(hart.get(), Ordering::Release);
    }

    pub fn last_writer(&self, address: u64) -> Option<HartId> {
        decode(self.slots[self.slot_index(address)].last_writer.load(Ordering::Acquire))
    }

    /// Tag both ends of `[address, address + width)`.
    pub fn register_span(&self, hart: HartId, address: u64, width: Width) {
        self.register_access(hart, address);
        let last = address.wrapping_add(width.bytes() - 1);
        if self.slot_index(last) != self.slot_index(address) {
            self.register_access(hart, last);
        }
    }

    /// True if `hart` is the last writer on every slot of the span.
    pub fn span_owned_by(&self, hart: HartId, address: u64, width: Width) -> bool {
        let last = address.wrapping_add(width.bytes() - 1);
        self.last_writer(address) == Some(hart) && self.last_writer(last) == Some(hart)
    }

    // ========== LR / SC ==========

    /// Host address for `address` if the fast path may use it: eligible and
    /// backed by plain memory.
    #[inline]
    pub fn host_address(&self, memory: &dyn GuestMemory, address: u64, width: Width, mem_index: usize, access: AccessType) -> Option<u64> {
        if !self.eligible(address, width) {
            return None;
        }
        let host = memory.resolve_host_address(address, mem_index, access);
        // Echoed address: device memory, no plain CAS possible.
        (host != address).then_some(host)
    }

    /// Fast-path load-reserved. On `Loaded` the caller records a
    /// [`FastReservation`] with the returned value.
    pub fn load_reserved(
        &self,
        hart: HartId,
        memory: &dyn GuestMemory,
        address: u64,
        width: Width,
        mem_index: usize,
    ) -> Result<FastLoad, SyncError> {
        let Some(host) = self.host_address(memory, address, width, mem_index, AccessType::Load) else {
            return Ok(FastLoad::Fallback);
        };
        let _slot = self.guard(hart, address);
        let value = memory.host_load(host, width)?;
        self.register_access(hart, address);
        Ok(FastLoad::Loaded(value))
    }

    /// Fast-path store-conditional.
    ///
    /// `Fallback` for page-spanning, misaligned or device addresses, checked
    /// before anything else. `Failure` when `reservation` does not match, when
    /// another hart touched the slot since the reserve, or when the location
    /// no longer holds the reserved value.
    pub fn store_conditional(
        &self,
        hart: HartId,
        reservation: Option<&FastReservation>,
        memory: &dyn GuestMemory,
        address: u64,
        value: u64,
        width: Width,
        mem_index: usize,
    ) -> Result<ScOutcome, SyncError> {
        let Some(host) = self.host_address(memory, address, width, mem_index, AccessType::Store) else {
            return Ok(ScOutcome::Fallback);
        };
        let Some(res) = reservation.filter(|r| r.address == address && r.width == width) else {
            return Ok(ScOutcome::Failure);
        };
        let _slot = self.guard(hart, address);
        if self.last_writer(address) != Some(hart) {
            return Ok(ScOutcome::Failure);
        }
        match memory.host_compare_exchange(host, res.value, value, width)? {
            Ok(_) => Ok(ScOutcome::Success),
            Err(_) => Ok(ScOutcome::Failure),
        }
    }
}
