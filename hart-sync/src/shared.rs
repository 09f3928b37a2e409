//! Shared Memory State
//!
//! One instance per simulated system whose harts share memory. It holds the
//! global lock's state machine, the reservation table, the fast-path lock
//! table and the instrumentation counters.
//!
//! ## Synchronization
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Mutex<Inner>  + Condvar                                      │
//! │   - lock: LockState          (global memory lock owner)      │
//! │   - reservations             (dense table + per-hart index)  │
//! │   - registered[MAX_HARTS]    (id allocation)                 │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Atomics (no lock)                                            │
//! │   - registered_count         (single-hart fast path)         │
//! │   - active_reservations      (skip mutex on plain writes)    │
//! │   - fast_path slots          (CAS spinlocks + writer tags)   │
//! │   - counters                                                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Lock order: global memory lock, then a fast-path slot. A slot spinlock is
//! never held while taking the mutex or waiting on the condition variable.

use crate::config::SyncConfig;
use crate::error::{SyncError, violation};
use crate::fastpath::FastPathTable;
use crate::lock::LockState;
use crate::reservation::{ReservationTable, ReserveOutcome};
use crate::types::{HartId, Width};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// State guarded by the shared mutex.
pub(crate) struct Inner {
    pub(crate) lock: LockState,
    pub(crate) reservations: ReservationTable,
    registered: Vec<bool>,
}

/// Instrumentation counters. All updates are `Relaxed`; they are statistics,
/// not synchronization.
#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) mutex_entries: AtomicU64,
    pub(crate) condvar_waits: AtomicU64,
    pub(crate) condvar_notifications: AtomicU64,
    pub(crate) lock_acquisitions: AtomicU64,
    pub(crate) lock_contended: AtomicU64,
    pub(crate) lock_clears: AtomicU64,
    pub(crate) reservations_created: AtomicU64,
    pub(crate) reservations_cancelled: AtomicU64,
    pub(crate) reservations_invalidated: AtomicU64,
    pub(crate) sc_fast_success: AtomicU64,
    pub(crate) sc_fast_failure: AtomicU64,
    pub(crate) sc_fallback: AtomicU64,
    pub(crate) sc_slow_success: AtomicU64,
    pub(crate) sc_slow_failure: AtomicU64,
    pub(crate) amo_operations: AtomicU64,
    pub(crate) dirty_flushes: AtomicU64,
    pub(crate) dirty_addresses_flushed: AtomicU64,
    pub(crate) broadcast_invalidations: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub registered_harts: u32,
    pub live_reservations: usize,
    pub mutex_entries: u64,
    pub condvar_waits: u64,
    pub condvar_notifications: u64,
    pub lock_acquisitions: u64,
    pub lock_contended: u64,
    pub lock_clears: u64,
    pub reservations_created: u64,
    pub reservations_cancelled: u64,
    pub reservations_invalidated: u64,
    pub sc_fast_success: u64,
    pub sc_fast_failure: u64,
    pub sc_fallback: u64,
    pub sc_slow_success: u64,
    pub sc_slow_failure: u64,
    pub amo_operations: u64,
    pub dirty_flushes: u64,
    pub dirty_addresses_flushed: u64,
    pub broadcast_invalidations: u64,
}

pub struct SharedMemoryState {
    config: SyncConfig,
    registered_count: AtomicU32,
    active_reservations: AtomicUsize,
    inner: Mutex<Inner>,
    cond: Condvar,
    fast_path: FastPathTable,
    pub(crate) counters: Counters,
}

impl SharedMemoryState {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let fast_path = FastPathTable::new(
            config.fast_path_slots(),
            config.reservation_granule,
            config.page_size,
        );
        Ok(Self {
            registered_count: AtomicU32::new(0),
            active_reservations: AtomicUsize::new(0),
            inner: Mutex::new(Inner {
                lock: LockState::Free,
                reservations: ReservationTable::new(config.max_harts, config.reservation_granule),
                registered: vec![false; config.max_harts],
            }),
            cond: Condvar::new(),
            fast_path,
            counters: Counters::default(),
            config,
        })
    }

    #[inline]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[inline]
    pub fn fast_path(&self) -> &FastPathTable {
        &self.fast_path
    }

    #[inline]
    pub fn registered_harts(&self) -> u32 {
        self.registered_count.load(Ordering::Acquire)
    }

    /// More than one hart attached; below this every lock is elided.
    #[inline]
    pub fn is_multi_hart(&self) -> bool {
        self.registered_harts() > 1
    }

    // ========== Mutex / condvar plumbing ==========

    /// Lock the inner state. A hart that panicked while holding the mutex
    /// must not wedge the others, so poisoning is ignored.
    pub(crate) fn inner(&self) -> MutexGuard<'_, Inner> {
        self.counters.mutex_entries.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait<'a>(&self, guard: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        self.counters.condvar_waits.fetch_add(1, Ordering::Relaxed);
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify_all(&self) {
        self.counters.condvar_notifications.fetch_add(1, Ordering::Relaxed);
        self.cond.notify_all();
    }

    // ========== Registration ==========

    /// Attach a hart. `requested` is honoured when free and in range;
    /// otherwise the lowest free id is assigned.
    ///
    /// Harts are expected to register before any of them starts executing:
    /// going from one to two harts switches the global lock from no-op to
    /// real locking.
    pub fn register_hart(&self, requested: Option<u32>) -> Result<HartId, SyncError> {
        let mut inner = self.inner();
        let limit = inner.registered.len();
        let wanted = requested
            .map(|id| id as usize)
            .filter(|&id| id < limit && !inner.registered[id]);
        let Some(index) = wanted.or_else(|| inner.registered.iter().position(|taken| !taken))
        else {
            drop(inner);
            return violation(SyncError::TooManyHarts { limit });
        };
        inner.registered[index] = true;
        let count = self.registered_count.fetch_add(1, Ordering::AcqRel) + 1;
        let id = HartId::new(index as u32);
        log::debug!("registered {id} (requested {requested:?}, {count} attached)");
        Ok(id)
    }

    // ========== Reservation table ==========

    fn require_lock(&self, inner: &Inner, hart: HartId) -> Result<(), SyncError> {
        if self.is_multi_hart() && inner.lock.holder() != Some(hart) {
            return violation(SyncError::ReservationWithoutLock { hart });
        }
        Ok(())
    }

    #[inline]
    fn publish_len(&self, inner: &Inner) {
        self.active_reservations
            .store(inner.reservations.len(), Ordering::Release);
    }

    /// Reserve `address` for `hart`, replacing any reservation it held
    /// elsewhere. Must be called with the global memory lock held by `hart`.
    pub fn reserve(&self, hart: HartId, address: u64, manual_release: bool) -> Result<(), SyncError> {
        let mut inner = self.inner();
        self.require_lock(&inner, hart)?;
        let outcome = inner.reservations.reserve(hart, address, manual_release)?;
        self.publish_len(&inner);
        drop(inner);
        if let ReserveOutcome::Created { replaced } = outcome {
            self.counters.reservations_created.fetch_add(1, Ordering::Relaxed);
            if replaced.is_some() {
                self.counters.reservations_cancelled.fetch_add(1, Ordering::Relaxed);
            }
            log::trace!("{hart}: reserved {address:#x} (replaced {replaced:x?}, manual {manual_release})");
        }
        Ok(())
    }

    /// True exactly when `hart` holds the reservation for `address`. Must be
    /// called with the global memory lock held by `hart`.
    pub fn check_reservation(&self, hart: HartId, address: u64) -> Result<bool, SyncError> {
        let inner = self.inner();
        self.require_lock(&inner, hart)?;
        Ok(inner.reservations.check(hart, address))
    }

    /// Release `hart`'s reservation, if any. Returns the released address.
    pub fn cancel_reservation(&self, hart: HartId) -> Option<u64> {
        if self.active_reservations.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut inner = self.inner();
        let removed = inner.reservations.cancel(hart);
        self.publish_len(&inner);
        drop(inner);
        if let Some(res) = removed {
            self.counters.reservations_cancelled.fetch_add(1, Ordering::Relaxed);
            log::trace!("{hart}: cancelled reservation at {:#x}", res.address);
        }
        removed.map(|res| res.address)
    }

    /// Release `hart`'s own reservation if it overlaps the written bytes.
    pub(crate) fn cancel_own_if_overlapping(&self, hart: HartId, address: u64, len: u64) -> bool {
        if self.active_reservations.load(Ordering::Acquire) == 0 {
            return false;
        }
        let mut inner = self.inner();
        let granule = self.config.reservation_granule;
        let hit = inner.reservations.get(hart).is_some_and(|res| {
            !res.manual_release && crate::types::overlaps_granule(res.address, address, len, granule)
        });
        if hit {
            inner.reservations.cancel(hart);
            self.publish_len(&inner);
            self.counters.reservations_invalidated.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// A store by `writer` to `[address, address + width)` that was not a
    /// store-conditional. Every other hart's overlapping, non-manual
    /// reservation is released. Returns how many were released.
    pub fn on_plain_write(&self, writer: HartId, address: u64, width: Width) -> usize {
        self.invalidate_for_write(writer, address, width.bytes())
    }

    pub(crate) fn invalidate_for_write(&self, writer: HartId, address: u64, len: u64) -> usize {
        // Nothing to scan: skip the mutex entirely.
        if self.active_reservations.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let mut inner = self.inner();
        let released = inner
            .reservations
            .invalidate_overlapping(Some(writer), address, len);
        self.publish_len(&inner);
        drop(inner);
        if released > 0 {
            self.counters
                .reservations_invalidated
                .fetch_add(released as u64, Ordering::Relaxed);
            log::trace!("{writer}: write to {address:#x} invalidated {released} reservation(s)");
        }
        released
    }

    /// Number of live reservations.
    pub fn live_reservations(&self) -> usize {
        self.active_reservations.load(Ordering::Acquire)
    }

    // ========== Statistics ==========

    pub fn stats(&self) -> SyncStats {
        let c = &self.counters;
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        SyncStats {
            registered_harts: self.registered_harts(),
            live_reservations: self.live_reservations(),
            mutex_entries: get(&c.mutex_entries),
            condvar_waits: get(&c.condvar_waits),
            condvar_notifications: get(&c.condvar_notifications),
            lock_acquisitions: get(&c.lock_acquisitions),
            lock_contended: get(&c.lock_contended),
            lock_clears: get(&c.lock_clears),
            reservations_created: get(&c.reservations_created),
            reservations_cancelled: get(&c.reservations_cancelled),
            reservations_invalidated: get(&c.reservations_invalidated),
            sc_fast_success: get(&c.sc_fast_success),
            sc_fast_failure: get(&c.sc_fast_failure),
            sc_fallback: get(&c.sc_fallback),
            sc_slow_success: get(&c.sc_slow_success),
            sc_slow_failure: get(&c.sc_slow_failure),
            amo_operations: get(&c.amo_operations),
            dirty_flushes: get(&c.dirty_flushes),
            dirty_addresses_flushed: get(&c.dirty_addresses_flushed),
            broadcast_invalidations: get(&c.broadcast_invalidations),
        }
    }
}
