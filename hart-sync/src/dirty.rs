//! Dirty-Address Broadcast.
//!
//! Each hart batches the guest addresses it wrote that may back translated
//! code. When the batch fills (or on an explicit flush) it is handed to a
//! [`DirtyBroadcast`] collaborator, which fans it out to the sibling harts.
//! Receivers apply the invalidations lazily, before their next dispatch.
//!
//! [`BroadcastHub`] is the in-process fan-out: one bounded inbox per hart.
//! An inbox that overflows degrades to "invalidate everything", the same
//! coalescing fallback a TLB shootdown mailbox uses when saturated.

use crate::types::{HartId, MAX_HARTS};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Fan-out of dirty-address batches to sibling harts. Delivery is
/// at-least-once; receivers may coalesce.
pub trait DirtyBroadcast: Send + Sync {
    fn broadcast_dirty_batch(&self, from: HartId, addresses: &[u64]);
}

/// Per-hart batch of written addresses.
pub struct DirtyAddressBuffer {
    owner: HartId,
    entries: Vec<u64>,
    capacity: usize,
    flushes: u64,
    sink: Arc<dyn DirtyBroadcast>,
}

impl DirtyAddressBuffer {
    pub fn new(owner: HartId, capacity: usize, sink: Arc<dyn DirtyBroadcast>) -> Self {
        Self {
            owner,
            entries: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            flushes: 0,
            sink,
        }
    }

    /// Record `address`. A repeat of the previous entry is dropped; a full
    /// buffer is flushed before the append.
    pub fn append(&mut self, address: u64) {
        if self.entries.last() == Some(&address) {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.flush();
        }
        self.entries.push(address);
    }

    /// Hand the batch to the broadcast collaborator and empty the buffer.
    /// Returns how many addresses were sent; an empty buffer sends nothing.
    pub fn flush(&mut self) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        let sent = self.entries.len();
        self.sink.broadcast_dirty_batch(self.owner, &self.entries);
        self.entries.clear();
        self.flushes += 1;
        log::debug!("{}: flushed {} dirty address(es)", self.owner, sent);
        sent
    }

    pub fn entries(&self) -> &[u64] {
        &self.entries
    }

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
        self.capacity
    }

    /// Number of non-empty flushes so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes
    }
}

/// Default inbox bound before a receiver falls back to a full flush.
pub const INBOX_CAPACITY: usize = 4096;

#[derive(Default)]
struct Inbox {
    addresses: Vec<u64>,
    overflowed: bool,
}

/// Invalidations waiting for one hart.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PendingInvalidations {
    pub addresses: Vec<u64>,
    /// The inbox overflowed: drop every cached translation.
    pub flush_all: bool,
}

impl PendingInvalidations {
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty() && !self.flush_all
    }
}

/// In-process broadcast collaborator with one inbox per hart.
pub struct BroadcastHub {
    inboxes: Vec<Mutex<Inbox>>,
    attached: Vec<AtomicBool>,
    inbox_capacity: usize,
    batches: AtomicU64,
    deliveries: AtomicU64,
}

impl BroadcastHub {
    pub fn new(max_harts: usize) -> Self {
        Self::with_inbox_capacity(max_harts, INBOX_CAPACITY)
    }

    pub fn with_inbox_capacity(max_harts: usize, inbox_capacity: usize) -> Self {
        let max_harts = max_harts.min(MAX_HARTS);
        Self {
            inboxes: (0..max_harts).map(|_| Mutex::new(Inbox::default())).collect(),
            attached: (0..max_harts).map(|_| AtomicBool::new(false)).collect(),
            inbox_capacity,
            batches: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
        }
    }

    /// Start delivering batches to `hart`.
    pub fn attach(&self, hart: HartId) {
        if let Some(flag) = self.attached.get(hart.index()) {
            flag.store(true, Ordering::Release);
        }
    }

    /// Stop delivering to `hart` and discard its inbox.
    pub fn detach(&self, hart: HartId) {
        if let Some(flag) = self.attached.get(hart.index()) {
            flag.store(false, Ordering::Release);
            *self.inbox(hart.index()) = Inbox::default();
        }
    }

    fn inbox(&self, index: usize) -> std::sync::MutexGuard<'_, Inbox> {
        self.inboxes[index].lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drain everything queued for `hart`.
    pub fn take_pending(&self, hart: HartId) -> PendingInvalidations {
        if hart.index() >= self.inboxes.len() {
            return PendingInvalidations::default();
        }
        let inbox = std::mem::take(&mut *self.inbox(hart.index()));
        PendingInvalidations {
            addresses: inbox.addresses,
            flush_all: inbox.overflowed,
        }
    }

    /// Batches received from all senders.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Per-receiver deliveries (one batch to three siblings counts three).
    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }
}

impl DirtyBroadcast for BroadcastHub {
    fn broadcast_dirty_batch(&self, from: HartId, addresses: &[u64]) {
        if addresses.is_empty() {
            return;
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        for (index, flag) in self.attached.iter().enumerate() {
            if index == from.index() || !flag.load(Ordering::Acquire) {
                continue;
            }
            let mut inbox = self.inbox(index);
            if inbox.overflowed {
                continue;
            }
            for &addr in addresses {
                if inbox.addresses.last() == Some(&addr) {
                    continue;
                }
                if inbox.addresses.len() >= self.inbox_capacity {
                    inbox.addresses.clear();
                    inbox.overflowed = true;
                    break;
                }
                inbox.addresses.push(addr);
            }
            self.deliveries.fetch_add(1, Ordering::Relaxed);
        }
    }
}
