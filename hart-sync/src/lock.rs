//! Global Memory Lock.
//!
//! A reentrant exclusion gate built from the shared state's mutex and
//! condition variable. It makes multi-step atomic sequences (AMOs, slow-path
//! LR/SC) indivisible with respect to other harts.
//!
//! Ownership is an explicit state machine, `Free -> Held(owner, depth) -> Free`:
//! - `acquire` enters or deepens `Held` for the caller, waiting while another
//!   hart owns it.
//! - `release` removes one level; reaching zero returns to `Free` and wakes
//!   every waiter.
//! - `clear` is the fault-recovery transition: all levels held by the caller
//!   are dropped at once.
//!
//! With a single registered hart every operation is a no-op and neither the
//! mutex nor the condition variable is touched.

use crate::error::{SyncError, violation};
use crate::shared::SharedMemoryState;
use crate::types::HartId;
use std::num::NonZeroU32;
use std::sync::atomic::Ordering;

/// Ownership state of the global lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    #[default]
    Free,
    Held { owner: HartId, depth: NonZeroU32 },
}

impl LockState {
    pub fn holder(&self) -> Option<HartId> {
        match *self {
            LockState::Free => None,
            LockState::Held { owner, .. } => Some(owner),
        }
    }

    pub fn depth(&self) -> u32 {
        match *self {
            LockState::Free => 0,
            LockState::Held { depth, .. } => depth.get(),
        }
    }

    /// Take the lock or deepen it. Returns false if another hart owns it.
    fn try_enter(&mut self, hart: HartId) -> bool {
        match *self {
            LockState::Free => {
                *self = LockState::Held {
                    owner: hart,
                    depth: NonZeroU32::MIN,
                };
                true
            }
            LockState::Held { owner, depth } if owner == hart => {
                *self = LockState::Held {
                    owner,
                    depth: depth.saturating_add(1),
                };
                true
            }
            LockState::Held { .. } => false,
        }
    }

    /// Drop one level. `Ok(true)` when the lock became free.
    fn exit(&mut self, hart: HartId) -> Result<bool, Option<HartId>> {
        match *self {
            LockState::Held { owner, depth } if owner == hart => {
                match NonZeroU32::new(depth.get() - 1) {
                    Some(depth) => {
                        *self = LockState::Held { owner, depth };
                        Ok(false)
                    }
                    None => {
                        *self = LockState::Free;
                        Ok(true)
                    }
                }
            }
            other => Err(other.holder()),
        }
    }

    /// Drop every level held by `hart`. Returns how many were dropped.
    fn clear(&mut self, hart: HartId) -> Result<u32, Option<HartId>> {
        match *self {
            LockState::Held { owner, depth } if owner == hart => {
                *self = LockState::Free;
                Ok(depth.get())
            }
            other => Err(other.holder()),
        }
    }
}

impl SharedMemoryState {
    /// Block until `hart` owns the global memory lock, then add one level.
    pub fn acquire_lock(&self, hart: HartId) {
        if !self.is_multi_hart() {
            return;
        }
        let mut inner = self.inner();
        let mut waited = false;
        while !inner.lock.try_enter(hart) {
            if !waited {
                self.counters.lock_contended.fetch_add(1, Ordering::Relaxed);
                waited = true;
            }
            inner = self.wait(inner);
        }
        self.counters.lock_acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove one level held by `hart`; at zero the lock is freed and waiters
    /// are woken. Releasing a lock the caller does not hold is a protocol
    /// violation.
    pub fn release_lock(&self, hart: HartId) -> Result<(), SyncError> {
        if !self.is_multi_hart() {
            return Ok(());
        }
        let mut inner = self.inner();
        match inner.lock.exit(hart) {
            Ok(true) => {
                drop(inner);
                self.notify_all();
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(holder) => {
                drop(inner);
                violation(SyncError::LockNotHeld { hart, holder })
            }
        }
    }

    /// Forcibly drop every level `hart` holds. Used when a simulated
    /// exception aborts a partially executed atomic sequence.
    pub fn clear_lock(&self, hart: HartId) -> Result<(), SyncError> {
        if !self.is_multi_hart() {
            return Ok(());
        }
        let mut inner = self.inner();
        match inner.lock.clear(hart) {
            Ok(levels) => {
                drop(inner);
                self.counters.lock_clears.fetch_add(1, Ordering::Relaxed);
                log::debug!("{hart}: cleared global memory lock ({levels} levels)");
                self.notify_all();
                Ok(())
            }
            Err(holder) => {
                drop(inner);
                violation(SyncError::LockNotHeld { hart, holder })
            }
        }
    }

    /// Current holder of the global lock, if any.
    pub fn lock_holder(&self) -> Option<HartId> {
        if !self.is_multi_hart() {
            return None;
        }
        self.inner().lock.holder()
    }

    /// Current lock state.
    pub fn lock_state(&self) -> LockState {
        if !self.is_multi_hart() {
            return LockState::Free;
        }
        self.inner().lock
    }
}
