//! Cross-hart atomic memory and code consistency for a multi-hart emulator.
//!
//! Every hart runs on its own host thread. This crate is what keeps them
//! honest with each other:
//!
//! - a reentrant, owner-tracked **global memory lock** serializing atomic
//!   sequences that cannot be done lock-free ([`lock`]),
//! - a **reservation table** for LR/SC on that slow path ([`reservation`]),
//! - a hashed **fast-path lock table** letting LR/SC on plain memory skip the
//!   global lock entirely ([`fastpath`]),
//! - batched **dirty-address broadcast** so siblings drop translated code a
//!   hart overwrote ([`dirty`]).
//!
//! [`hart::Machine`] ties them together; [`hart::Hart`] is the per-core handle
//! the execution loop calls.

pub mod config;
pub mod dirty;
pub mod error;
pub mod fastpath;
pub mod hart;
pub mod lock;
pub mod memory;
pub mod reservation;
pub mod runner;
pub mod shared;
pub mod tcache;
pub mod types;

pub use config::SyncConfig;
pub use dirty::{BroadcastHub, DirtyAddressBuffer, DirtyBroadcast};
pub use error::SyncError;
pub use fastpath::{FastPathTable, FastReservation};
pub use hart::{Hart, Machine};
pub use lock::LockState;
pub use memory::{DRAM_BASE, Dram, GuestMemory, MemoryError};
pub use reservation::{Reservation, ReservationTable};
pub use runner::{PathMode, StressConfig, StressReport, StressRunner};
pub use shared::{SharedMemoryState, SyncStats};
pub use tcache::{CodeInvalidator, TranslatedBlock, TranslationCache};
pub use types::{AccessType, AmoOp, FastLoad, HartId, ScOutcome, Width};
