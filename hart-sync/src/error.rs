//! Error taxonomy.
//!
//! Two families live here. Memory errors come back from the backing store and
//! are ordinary runtime failures. Protocol violations are integration bugs in
//! the surrounding emulator (releasing a lock it does not hold, overflowing
//! the hart table); they abort in debug builds and are contained in release
//! builds, where the caller gets an `Err` it may ignore.

use crate::memory::MemoryError;
use crate::types::HartId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{hart} released or cleared the global memory lock without holding it (holder: {holder:?})")]
    LockNotHeld { hart: HartId, holder: Option<HartId> },

    #[error("{hart} touched the reservation table without holding the global memory lock")]
    ReservationWithoutLock { hart: HartId },

    #[error("cannot register another hart: limit of {limit} reached")]
    TooManyHarts { limit: usize },

    #[error("reservation table full ({capacity} entries) while reserving for {hart}")]
    ReservationTableFull { hart: HartId, capacity: usize },

    #[error("{hart} unlocked fast-path slot {slot} held by {holder:?}")]
    FastPathNotHeld {
        hart: HartId,
        slot: usize,
        holder: Option<HartId>,
    },

    #[error("memory access failed: {0}")]
    Memory(#[from] MemoryError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn hart thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("{hart} thread panicked")]
    HartPanicked { hart: HartId },
}

/// Report a protocol violation.
///
/// Debug builds panic with the formatted violation. Release builds log it and
/// hand the error back so the offending call becomes a no-op.
#[track_caller]
pub(crate) fn violation<T>(err: SyncError) -> Result<T, SyncError> {
    if cfg!(debug_assertions) {
        panic!("protocol violation: {err}");
    }
    log::warn!("protocol violation (ignored): {err}");
    Err(err)
}
