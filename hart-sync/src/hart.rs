//! Hart (Hardware Thread) handles.
//!
//! A [`Machine`] bundles what every hart of one simulated system shares: the
//! [`SharedMemoryState`], the guest memory collaborator and the broadcast hub.
//! Attaching to it yields a [`Hart`], the per-core handle the execution loop
//! calls for every atomic or code-visible memory operation.
//!
//! ## Paths
//!
//! - **Fast path**: aligned, single-page accesses to plain memory. LR/SC go
//!   through the fast-path lock table and never touch the global lock.
//! - **Slow path**: everything else (device windows, misaligned addresses).
//!   LR/SC run under the global memory lock against the reservation table.
//!
//! The path is a pure function of (address, width), so an LR and the SC that
//! pairs with it always take the same one.
//!
//! A `Hart` is owned by the thread that drives the core; it is `Send` but the
//! dirty buffer, fast reservation and code cache inside it are never shared.

use crate::config::SyncConfig;
use crate::dirty::{BroadcastHub, DirtyAddressBuffer};
use crate::error::SyncError;
use crate::fastpath::FastReservation;
use crate::memory::GuestMemory;
use crate::shared::SharedMemoryState;
use crate::tcache::{CodeInvalidator, TranslationCache};
use crate::types::{
    AccessType, AmoOp, FastLoad, HartId, ScOutcome, Width, overlaps_granule, page_base,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Everything the harts of one simulated system share.
#[derive(Clone)]
pub struct Machine {
    shared: Arc<SharedMemoryState>,
    memory: Arc<dyn GuestMemory>,
    hub: Arc<BroadcastHub>,
}

impl Machine {
    pub fn new(config: SyncConfig, memory: Arc<dyn GuestMemory>) -> Result<Self, SyncError> {
        let hub = Arc::new(BroadcastHub::new(config.max_harts));
        let shared = Arc::new(SharedMemoryState::new(config)?);
        Ok(Self {
            shared,
            memory,
            hub,
        })
    }

    pub fn shared(&self) -> &Arc<SharedMemoryState> {
        &self.shared
    }

    pub fn memory(&self) -> &Arc<dyn GuestMemory> {
        &self.memory
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Register a new hart and hand back its handle.
    pub fn attach<C: CodeInvalidator>(&self, requested: Option<u32>, code: C) -> Result<Hart<C>, SyncError> {
        let id = self.shared.register_hart(requested)?;
        self.hub.attach(id);
        let dirty = DirtyAddressBuffer::new(
            id,
            self.shared.config().dirty_capacity,
            self.hub.clone(),
        );
        Ok(Hart {
            id,
            shared: self.shared.clone(),
            memory: self.memory.clone(),
            hub: self.hub.clone(),
            dirty,
            fast_reservation: None,
            slow_reserved: false,
            code,
            mem_index: 0,
        })
    }
}

/// Per-core handle.
pub struct Hart<C: CodeInvalidator = TranslationCache> {
    id: HartId,
    shared: Arc<SharedMemoryState>,
    memory: Arc<dyn GuestMemory>,
    hub: Arc<BroadcastHub>,
    dirty: DirtyAddressBuffer,
    fast_reservation: Option<FastReservation>,
    /// Set whenever this hart may own a reservation-table entry. Another
    /// hart's write can remove the entry, so this can be stale-true but
    /// never stale-false.
    slow_reserved: bool,
    code: C,
    /// MMU index handed to address translation (privilege/regime).
    pub mem_index: usize,
}

impl<C: CodeInvalidator> Hart<C> {
    #[inline]
    pub fn id(&self) -> HartId {
        self.id
    }

    pub fn shared(&self) -> &SharedMemoryState {
        &self.shared
    }

    pub fn code(&self) -> &C {
        &self.code
    }

    pub fn code_mut(&mut self) -> &mut C {
        &mut self.code
    }

    pub fn dirty(&self) -> &DirtyAddressBuffer {
        &self.dirty
    }

    pub fn fast_reservation(&self) -> Option<&FastReservation> {
        self.fast_reservation.as_ref()
    }

    // ========== Global memory lock ==========

    pub fn acquire_lock(&self) {
        self.shared.acquire_lock(self.id);
    }

    pub fn release_lock(&self) -> Result<(), SyncError> {
        self.shared.release_lock(self.id)
    }

    pub fn clear_lock(&self) -> Result<(), SyncError> {
        self.shared.clear_lock(self.id)
    }

    /// Run `f` with the global lock held; the lock is released even if `f`
    /// fails.
    fn locked<T>(&self, f: impl FnOnce() -> Result<T, SyncError>) -> Result<T, SyncError> {
        self.shared.acquire_lock(self.id);
        let result = f();
        let released = self.shared.release_lock(self.id);
        let value = result?;
        released?;
        Ok(value)
    }

    // ========== Reservation table ==========

    /// Reserve `address` in the reservation table. The caller must hold the
    /// global memory lock.
    pub fn reserve(&mut self, address: u64, manual_release: bool) -> Result<(), SyncError> {
        self.fast_reservation = None;
        self.shared.reserve(self.id, address, manual_release)?;
        self.slow_reserved = true;
        Ok(())
    }

    /// True exactly when this hart holds the reservation for `address`. The
    /// caller must hold the global memory lock.
    pub fn check_reservation(&self, address: u64) -> Result<bool, SyncError> {
        self.shared.check_reservation(self.id, address)
    }

    /// Drop whatever reservation this hart holds, on either path.
    pub fn cancel_reservation(&mut self) -> Option<u64> {
        let fast = self.fast_reservation.take().map(|r| r.address);
        let slow = if std::mem::take(&mut self.slow_reserved) {
            self.shared.cancel_reservation(self.id)
        } else {
            None
        };
        slow.or(fast)
    }

    /// Tell the reservation table this hart performed a plain store.
    pub fn on_plain_write(&self, address: u64, width: Width) -> usize {
        self.shared.on_plain_write(self.id, address, width)
    }

    /// A store by this hart ends its own overlapping reservation.
    fn drop_own_reservation(&mut self, address: u64, len: u64) {
        let granule = self.shared.config().reservation_granule;
        if self
            .fast_reservation
            .is_some_and(|r| overlaps_granule(r.address, address, len, granule))
        {
            self.fast_reservation = None;
        }
        if self.slow_reserved && self.shared.cancel_own_if_overlapping(self.id, address, len) {
            self.slow_reserved = false;
        }
    }

    /// True if `address` is backed by plain memory rather than a device.
    fn is_plain(&self, address: u64) -> bool {
        self.memory
            .resolve_host_address(address, self.mem_index, AccessType::Load)
            != address
    }

    // ========== LR / SC ==========

    /// Load-reserved. Takes the fast path when the address allows it and
    /// falls back to the global lock and reservation table otherwise.
    pub fn load_reserved(&mut self, address: u64, width: Width) -> Result<u64, SyncError> {
        self.fast_reservation = None;
        let fast = self.shared.fast_path();
        match fast.load_reserved(self.id, self.memory.as_ref(), address, width, self.mem_index)? {
            FastLoad::Loaded(value) => {
                if std::mem::take(&mut self.slow_reserved) {
                    self.shared.cancel_reservation(self.id);
                }
                self.fast_reservation = Some(FastReservation {
                    address,
                    width,
                    value,
                });
                log::trace!("{}: fast LR {address:#x} -> {value:#x}", self.id);
                Ok(value)
            }
            FastLoad::Fallback => self.load_reserved_slow(address, width),
        }
    }

    fn load_reserved_slow(&mut self, address: u64, width: Width) -> Result<u64, SyncError> {
        let id = self.id;
        let plain = self.is_plain(address);
        let value = self.locked(|| {
            // Reserve before reading: a store that lands during the read must
            // find the entry to invalidate.
            self.shared.reserve(id, address, false)?;
            let fast = self.shared.fast_path();
            let _slots = fast.guard_span(id, address, width);
            let value = self.memory.read(address, width)?;
            if plain {
                fast.register_span(id, address, width);
            }
            Ok(value)
        })?;
        self.slow_reserved = true;
        log::trace!("{id}: slow LR {address:#x} -> {value:#x}");
        Ok(value)
    }

    /// Fast-path store-conditional only. On `Fallback` nothing changed and the
    /// reservation is kept for the slow path.
    pub fn try_store_conditional(&mut self, address: u64, value: u64, width: Width) -> Result<ScOutcome, SyncError> {
        let fast = self.shared.fast_path();
        let outcome = fast.store_conditional(
            self.id,
            self.fast_reservation.as_ref(),
            self.memory.as_ref(),
            address,
            value,
            width,
            self.mem_index,
        )?;
        let counters = &self.shared.counters;
        match outcome {
            ScOutcome::Success => {
                self.fast_reservation = None;
                counters.sc_fast_success.fetch_add(1, Ordering::Relaxed);
                self.after_commit(address, width);
            }
            ScOutcome::Failure => {
                self.fast_reservation = None;
                counters.sc_fast_failure.fetch_add(1, Ordering::Relaxed);
            }
            ScOutcome::Fallback => {
                counters.sc_fallback.fetch_add(1, Ordering::Relaxed);
            }
        }
        log::trace!("{}: fast SC {address:#x} -> {outcome:?}", self.id);
        Ok(outcome)
    }

    /// Store-conditional on whichever path the address requires. Returns
    /// whether the store was performed.
    pub fn store_conditional(&mut self, address: u64, value: u64, width: Width) -> Result<bool, SyncError> {
        match self.try_store_conditional(address, value, width)? {
            ScOutcome::Success => Ok(true),
            ScOutcome::Failure => Ok(false),
            ScOutcome::Fallback => self.store_conditional_slow(address, value, width),
        }
    }

    fn store_conditional_slow(&mut self, address: u64, value: u64, width: Width) -> Result<bool, SyncError> {
        let id = self.id;
        let plain = self.is_plain(address);
        let committed = self.locked(|| {
            let mut held = self.shared.check_reservation(id, address)?;
            if held {
                let fast = self.shared.fast_path();
                let _slots = fast.guard_span(id, address, width);
                // Aligned stores to plain memory do not take the global lock;
                // the slot tag is what records them.
                if plain && !fast.span_owned_by(id, address, width) {
                    held = false;
                } else {
                    self.memory.write(address, value, width)?;
                    fast.register_span(id, address, width);
                }
            }
            if held {
                // Other agents see a committed SC as a store.
                self.shared.invalidate_for_write(id, address, width.bytes());
            }
            self.shared.cancel_reservation(id);
            Ok(held)
        })?;
        self.slow_reserved = false;
        self.fast_reservation = None;
        let counters = &self.shared.counters;
        if committed {
            counters.sc_slow_success.fetch_add(1, Ordering::Relaxed);
            self.after_commit(address, width);
        } else {
            counters.sc_slow_failure.fetch_add(1, Ordering::Relaxed);
        }
        log::trace!("{id}: slow SC {address:#x} -> {committed}");
        Ok(committed)
    }

    // ========== AMO and plain accesses ==========

    /// Atomic read-modify-write under the global memory lock. Returns the old
    /// value.
    pub fn atomic_rmw(&mut self, op: AmoOp, address: u64, operand: u64, width: Width) -> Result<u64, SyncError> {
        let id = self.id;
        let old = self.locked(|| {
            let fast = self.shared.fast_path();
            let host = fast.host_address(self.memory.as_ref(), address, width, self.mem_index, AccessType::Store);
            let old = match host {
                Some(host) => {
                    // Plain stores to this granule serialize on the slot.
                    let _slot = fast.guard(id, address);
                    let old = self.memory.host_load(host, width)?;
                    self.memory.host_store(host, op.apply(old, operand, width), width)?;
                    fast.register_access(id, address);
                    old
                }
                None => {
                    let _slots = fast.guard_span(id, address, width);
                    let old = self.memory.read(address, width)?;
                    self.memory.write(address, op.apply(old, operand, width), width)?;
                    fast.register_span(id, address, width);
                    old
                }
            };
            self.shared.invalidate_for_write(id, address, width.bytes());
            Ok(old)
        })?;
        self.drop_own_reservation(address, width.bytes());
        self.shared.counters.amo_operations.fetch_add(1, Ordering::Relaxed);
        self.after_commit(address, width);
        Ok(old)
    }

    /// Plain load.
    pub fn load(&self, address: u64, width: Width) -> Result<u64, SyncError> {
        let fast = self.shared.fast_path();
        match fast.host_address(self.memory.as_ref(), address, width, self.mem_index, AccessType::Load) {
            Some(host) => Ok(self.memory.host_load(host, width)?),
            None => Ok(self.memory.read(address, width)?),
        }
    }

    /// Plain store: invalidates other harts' reservations on the address,
    /// this hart's own overlapping one, and any translated code it covers.
    ///
    /// Device and misaligned addresses are the ones slow-path LR/SC reserve,
    /// so stores to them run under the global lock and invalidate before it
    /// is released. Fast-path stores only take the slot and leave their tag.
    pub fn store(&mut self, address: u64, value: u64, width: Width) -> Result<(), SyncError> {
        let id = self.id;
        let fast = self.shared.fast_path();
        match fast.host_address(self.memory.as_ref(), address, width, self.mem_index, AccessType::Store) {
            Some(host) => {
                {
                    let _slot = fast.guard(id, address);
                    self.memory.host_store(host, value, width)?;
                    fast.register_access(id, address);
                }
                self.shared.on_plain_write(id, address, width);
            }
            None => self.locked(|| {
                {
                    let _slots = fast.guard_span(id, address, width);
                    self.memory.write(address, value, width)?;
                    fast.register_span(id, address, width);
                }
                self.shared.on_plain_write(id, address, width);
                Ok(())
            })?,
        }
        self.drop_own_reservation(address, width.bytes());
        self.after_commit(address, width);
        Ok(())
    }

    // ========== Code consistency ==========

    fn after_commit(&mut self, address: u64, width: Width) {
        self.code
            .invalidate_cached_code_containing(address, width.bytes(), false);
        self.note_dirty(address);
    }

    /// Queue `address` for the next dirty-address broadcast.
    pub fn note_dirty(&mut self, address: u64) {
        let flushes = self.dirty.flush_count();
        let pending = self.dirty.len();
        self.dirty.append(address);
        if self.dirty.flush_count() != flushes {
            self.count_flush(pending);
        }
    }

    /// Broadcast whatever is batched. Returns the number of addresses sent.
    pub fn flush_dirty(&mut self) -> usize {
        let sent = self.dirty.flush();
        if sent > 0 {
            self.count_flush(sent);
        }
        sent
    }

    fn count_flush(&self, sent: usize) {
        let counters = &self.shared.counters;
        counters.dirty_flushes.fetch_add(1, Ordering::Relaxed);
        counters
            .dirty_addresses_flushed
            .fetch_add(sent as u64, Ordering::Relaxed);
    }

    /// Apply invalidations broadcast by siblings. Call before dispatching
    /// translated code. Returns the number of pages invalidated.
    pub fn process_broadcasts(&mut self) -> usize {
        let pending = self.hub.take_pending(self.id);
        if pending.is_empty() {
            return 0;
        }
        if pending.flush_all {
            log::debug!("{}: broadcast inbox overflowed, dropping all translations", self.id);
            self.code.invalidate_all();
        }
        let page_size = self.shared.config().page_size;
        let mut last_page = None;
        let mut pages = 0;
        for &address in &pending.addresses {
            let page = page_base(address, page_size);
            if last_page == Some(page) {
                continue;
            }
            last_page = Some(page);
            self.code.invalidate_cached_code_containing(page, page_size, true);
            pages += 1;
        }
        self.shared
            .counters
            .broadcast_invalidations
            .fetch_add(pages as u64, Ordering::Relaxed);
        pages
    }
}

impl<C: CodeInvalidator> Drop for Hart<C> {
    fn drop(&mut self) {
        self.cancel_reservation();
        // Unwinding out of an atomic sequence: free the lock for the others.
        if self.shared.lock_holder() == Some(self.id) {
            let _ = self.shared.clear_lock(self.id);
        }
        self.flush_dirty();
        self.hub.detach(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DRAM_BASE, Dram, MemoryError};
    use crate::tcache::TranslatedBlock;
    use crate::types::PAGE_SIZE;
    use std::sync::{Mutex, mpsc};
    use std::thread;
    use std::time::Duration;

    const MMIO_BASE: u64 = 0x1000_0000;

    type Hook = Box<dyn FnOnce(&Dram) + Send>;

    /// Dram that runs a one-shot action inside the next guest-level access to
    /// `trigger`: right after a read, right before a write.
    struct HookedMemory {
        inner: Dram,
        trigger: u64,
        after_read: Mutex<Option<Hook>>,
        before_write: Mutex<Option<Hook>>,
    }

    impl HookedMemory {
        fn new(trigger: u64) -> Self {
            Self {
                inner: Dram::new(DRAM_BASE, 0x10000).with_device_window(MMIO_BASE, 0x1000),
                trigger,
                after_read: Mutex::new(None),
                before_write: Mutex::new(None),
            }
        }

        fn fire(&self, hook: &Mutex<Option<Hook>>, guest: u64) {
            if guest != self.trigger {
                return;
            }
            let action = hook.lock().unwrap().take();
            if let Some(action) = action {
                action(&self.inner);
            }
        }
    }

    impl GuestMemory for HookedMemory {
        fn resolve_host_address(&self, guest: u64, mem_index: usize, access: AccessType) -> u64 {
            self.inner.resolve_host_address(guest, mem_index, access)
        }

        fn host_load(&self, host: u64, width: Width) -> Result<u64, MemoryError> {
            self.inner.host_load(host, width)
        }

        fn host_store(&self, host: u64, value: u64, width: Width) -> Result<(), MemoryError> {
            self.inner.host_store(host, value, width)
        }

        fn host_compare_exchange(
            &self,
            host: u64,
            current: u64,
            new: u64,
            width: Width,
        ) -> Result<Result<u64, u64>, MemoryError> {
            self.inner.host_compare_exchange(host, current, new, width)
        }

        fn read(&self, guest: u64, width: Width) -> Result<u64, MemoryError> {
            let value = self.inner.read(guest, width);
            self.fire(&self.after_read, guest);
            value
        }

        fn write(&self, guest: u64, value: u64, width: Width) -> Result<(), MemoryError> {
            self.fire(&self.before_write, guest);
            self.inner.write(guest, value, width)
        }
    }

    fn machine() -> Machine {
        let dram = Dram::new(DRAM_BASE, 0x10000).with_device_window(MMIO_BASE, 0x1000);
        Machine::new(SyncConfig::default(), Arc::new(dram)).unwrap()
    }

    fn pair(m: &Machine) -> (Hart, Hart) {
        let a = m.attach(Some(0), TranslationCache::new()).unwrap();
        let b = m.attach(Some(1), TranslationCache::new()).unwrap();
        (a, b)
    }

    #[test]
    fn test_fast_path_success_is_visible() {
        let m = machine();
        let (mut a, _b) = pair(&m);
        let x = DRAM_BASE + 0x100;
        assert_eq!(a.load_reserved(x, Width::Word).unwrap(), 0);
        assert!(a.fast_reservation().is_some());
        assert_eq!(a.try_store_conditional(x, 0xabcd, Width::Word).unwrap(), ScOutcome::Success);
        assert_eq!(a.load(x, Width::Word).unwrap(), 0xabcd);
        // Reservation consumed.
        assert_eq!(a.try_store_conditional(x, 1, Width::Word).unwrap(), ScOutcome::Failure);
    }

    #[test]
    fn test_fast_path_never_takes_global_lock() {
        let m = machine();
        let (mut a, _b) = pair(&m);
        let before = m.shared().stats();
        let x = DRAM_BASE + 0x100;
        for i in 0..10 {
            a.load_reserved(x, Width::Word).unwrap();
            assert!(a.store_conditional(x, i, Width::Word).unwrap());
        }
        let after = m.shared().stats();
        assert_eq!(after.lock_acquisitions, before.lock_acquisitions);
        assert_eq!(after.sc_fast_success, 10);
    }

    #[test]
    fn test_fast_path_foreign_access_fails() {
        let m = machine();
        let (mut a, b) = pair(&m);
        let x = DRAM_BASE + 0x200;
        a.load_reserved(x, Width::Word).unwrap();
        m.shared().fast_path().register_access(b.id(), x);
        assert_eq!(a.try_store_conditional(x, 5, Width::Word).unwrap(), ScOutcome::Failure);
        assert_eq!(a.load(x, Width::Word).unwrap(), 0);
    }

    #[test]
    fn test_foreign_plain_store_breaks_fast_reservation() {
        let m = machine();
        let (mut a, mut b) = pair(&m);
        let x = DRAM_BASE + 0x300;
        a.load_reserved(x, Width::Double).unwrap();
        b.store(x, 0, Width::Double).unwrap();
        // Same value written back: the tag still catches it.
        assert!(!a.store_conditional(x, 1, Width::Double).unwrap());
    }

    #[test]
    fn test_page_spanning_falls_back_regardless_of_reservation() {
        let m = machine();
        let (mut a, _b) = pair(&m);
        let x = DRAM_BASE + PAGE_SIZE - 2;
        assert_eq!(a.try_store_conditional(x, 1, Width::Word).unwrap(), ScOutcome::Fallback);
        a.load_reserved(x, Width::Word).unwrap();
        assert_eq!(a.try_store_conditional(x, 1, Width::Word).unwrap(), ScOutcome::Fallback);
        // The slow path still honours the reservation taken by the slow LR.
        assert!(a.store_conditional(x, 0x1122_3344, Width::Word).unwrap());
        assert_eq!(a.load(x, Width::Word).unwrap(), 0x1122_3344);
    }

    #[test]
    fn test_slow_path_device_lr_sc() {
        let m = machine();
        let (mut a, mut b) = pair(&m);
        let reg = MMIO_BASE + 0x10;
        a.load_reserved(reg, Width::Word).unwrap();
        assert_eq!(m.shared().live_reservations(), 1);
        assert!(a.store_conditional(reg, 7, Width::Word).unwrap());
        assert_eq!(b.load(reg, Width::Word).unwrap(), 7);
        assert_eq!(m.shared().live_reservations(), 0);

        // Foreign plain store in between: SC fails.
        a.load_reserved(reg, Width::Word).unwrap();
        b.store(reg, 9, Width::Word).unwrap();
        assert!(!a.store_conditional(reg, 8, Width::Word).unwrap());
        assert_eq!(a.load(reg, Width::Word).unwrap(), 9);
    }

    #[test]
    fn test_slow_sc_success_invalidates_competitor() {
        let m = machine();
        let (mut a, mut b) = pair(&m);
        let reg = MMIO_BASE + 0x20;
        a.load_reserved(reg, Width::Word).unwrap();
        b.load_reserved(reg, Width::Word).unwrap();
        assert!(b.store_conditional(reg, 1, Width::Word).unwrap());
        assert!(!a.store_conditional(reg, 1, Width::Word).unwrap());
    }

    #[test]
    fn test_explicit_reserve_check_cancel() {
        let m = machine();
        let (mut a, b) = pair(&m);
        a.acquire_lock();
        a.reserve(0x4000, true).unwrap();
        assert!(a.check_reservation(0x4000).unwrap());
        a.release_lock().unwrap();

        // Manual reservations ignore plain writes.
        assert_eq!(b.on_plain_write(0x4000, Width::Word), 0);
        assert_eq!(a.cancel_reservation(), Some(0x4000));
        a.acquire_lock();
        assert!(!a.check_reservation(0x4000).unwrap());
        a.release_lock().unwrap();
    }

    #[test]
    fn test_amo_returns_old_and_breaks_reservations() {
        let m = machine();
        let (mut a, mut b) = pair(&m);
        let x = DRAM_BASE + 0x400;
        a.store(x, 40, Width::Double).unwrap();
        a.load_reserved(x, Width::Double).unwrap();
        assert_eq!(b.atomic_rmw(AmoOp::Add, x, 2, Width::Double).unwrap(), 40);
        assert_eq!(a.load(x, Width::Double).unwrap(), 42);
        assert!(!a.store_conditional(x, 0, Width::Double).unwrap());

        let reg = MMIO_BASE + 0x40;
        a.load_reserved(reg, Width::Word).unwrap();
        assert_eq!(b.atomic_rmw(AmoOp::Swap, reg, 5, Width::Word).unwrap(), 0);
        assert!(!a.store_conditional(reg, 1, Width::Word).unwrap());
        assert_eq!(m.shared().stats().amo_operations, 2);
    }

    #[test]
    fn test_own_store_breaks_own_reservation() {
        let m = machine();
        let (mut a, _b) = pair(&m);
        let x = DRAM_BASE + 0x500;
        a.load_reserved(x, Width::Word).unwrap();
        a.store(x + 4, 1, Width::Word).unwrap();
        assert!(a.fast_reservation().is_none());
        assert!(!a.store_conditional(x, 1, Width::Word).unwrap());
    }

    #[test]
    fn test_sc_broadcast_invalidates_sibling_code() {
        let m = machine();
        let (mut a, mut b) = pair(&m);
        let code = DRAM_BASE + 0x2000;
        b.code_mut().insert(TranslatedBlock::new(0x2000, code, 0x40));
        b.code_mut().insert(TranslatedBlock::new(0x3000, DRAM_BASE + 0x3000, 0x40));

        a.load_reserved(code + 8, Width::Word).unwrap();
        assert!(a.store_conditional(code + 8, 0x13, Width::Word).unwrap());
        assert_eq!(a.dirty().entries(), &[code + 8]);
        assert_eq!(a.code().local_invalidations, 1);

        // Lazy: nothing happens on the sibling until the batch is flushed
        // and the sibling processes it.
        assert_eq!(b.process_broadcasts(), 0);
        assert_eq!(a.flush_dirty(), 1);
        assert_eq!(b.process_broadcasts(), 1);
        assert!(b.code_mut().get(0x2000).is_none());
        assert!(b.code_mut().get(0x3000).is_some());
        assert_eq!(b.code().broadcast_invalidations, 1);
        assert_eq!(m.shared().stats().broadcast_invalidations, 1);
    }

    #[test]
    fn test_dirty_buffer_auto_flush_through_hart() {
        let dram = Dram::new(DRAM_BASE, 0x10000);
        let config = SyncConfig {
            dirty_capacity: 4,
            ..SyncConfig::default()
        };
        let m = Machine::new(config, Arc::new(dram)).unwrap();
        let (mut a, b) = pair(&m);
        for i in 0..5 {
            a.note_dirty(DRAM_BASE + i * PAGE_SIZE);
        }
        let stats = m.shared().stats();
        assert_eq!(stats.dirty_flushes, 1);
        assert_eq!(stats.dirty_addresses_flushed, 4);
        assert_eq!(m.hub().take_pending(b.id()).addresses.len(), 4);
    }

    #[test]
    fn test_drop_releases_lock_and_flushes() {
        let m = machine();
        let (mut a, b) = pair(&m);
        a.acquire_lock();
        a.acquire_lock();
        a.note_dirty(DRAM_BASE);
        drop(a);
        assert_eq!(m.shared().lock_holder(), None);
        assert_eq!(m.hub().take_pending(b.id()).addresses, vec![DRAM_BASE]);
        b.acquire_lock();
        b.release_lock().unwrap();
    }

    #[test]
    fn test_single_hart_machine() {
        let m = machine();
        let mut solo = m.attach(None, TranslationCache::new()).unwrap();
        let before = m.shared().stats();
        solo.acquire_lock();
        solo.release_lock().unwrap();
        let after = m.shared().stats();
        assert_eq!(before.mutex_entries, after.mutex_entries);

        let reg = MMIO_BASE + 0x80;
        solo.load_reserved(reg, Width::Word).unwrap();
        assert!(solo.store_conditional(reg, 3, Width::Word).unwrap());
        assert_eq!(solo.load(reg, Width::Word).unwrap(), 3);
    }

    #[test]
    fn test_store_during_slow_lr_read_breaks_reservation() {
        let reg = MMIO_BASE + 0x10;
        let memory = Arc::new(HookedMemory::new(reg));
        let m = Machine::new(SyncConfig::default(), memory.clone()).unwrap();
        let (mut a, b) = pair(&m);
        let shared = m.shared().clone();
        let writer = b.id();
        *memory.after_read.lock().unwrap() = Some(Box::new(move |dram: &Dram| {
            dram.write(reg, 9, Width::Word).unwrap();
            shared.on_plain_write(writer, reg, Width::Word);
        }));

        let seen = a.load_reserved(reg, Width::Word).unwrap();
        assert_eq!(seen, 0);
        // The store landed after the value was read: the SC must not commit
        // a result computed from the stale value.
        assert!(!a.store_conditional(reg, seen + 1, Width::Word).unwrap());
        assert_eq!(a.load(reg, Width::Word).unwrap(), 9);
    }

    #[test]
    fn test_device_store_serializes_with_slow_sc() {
        let reg = MMIO_BASE + 0x20;
        let memory = Arc::new(HookedMemory::new(reg));
        let m = Machine::new(SyncConfig::default(), memory.clone()).unwrap();
        let (mut a, mut b) = pair(&m);
        assert_eq!(a.load_reserved(reg, Width::Word).unwrap(), 0);

        let (tx, rx) = mpsc::channel::<()>();
        *memory.before_write.lock().unwrap() = Some(Box::new(move |_: &Dram| {
            tx.send(()).unwrap();
            // Leave the other hart plenty of time to get its store in.
            thread::sleep(Duration::from_millis(50));
        }));

        thread::scope(|s| {
            let other = s.spawn(move || {
                rx.recv().unwrap();
                b.store(reg, 9, Width::Word).unwrap();
            });
            assert!(a.store_conditional(reg, 1, Width::Word).unwrap());
            other.join().unwrap();
        });
        // The store waited for the SC instead of being overwritten by it.
        assert_eq!(a.load(reg, Width::Word).unwrap(), 9);
    }

    #[test]
    fn test_aligned_store_breaks_misaligned_reservation() {
        let m = machine();
        let (mut a, mut b) = pair(&m);
        let x = DRAM_BASE + 0x602;
        a.load_reserved(x, Width::Word).unwrap();
        assert!(a.fast_reservation().is_none());
        b.store(DRAM_BASE + 0x600, u64::MAX, Width::Double).unwrap();
        assert!(!a.store_conditional(x, 5, Width::Word).unwrap());
        assert_eq!(a.load(DRAM_BASE + 0x600, Width::Double).unwrap(), u64::MAX);
    }
}
