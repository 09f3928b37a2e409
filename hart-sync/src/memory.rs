//! Guest memory collaborator and the reference DRAM backend.
//!
//! The synchronization core never touches guest memory directly. It asks a
//! [`GuestMemory`] to translate a guest address into a host address, and then
//! performs loads, stores and compare-and-swaps on that host address. A
//! translation that echoes the guest address back is the sentinel for
//! "not plain memory" (device registers), which the fast path refuses.
//!
//! [`Dram`] stores memory as an array of `AtomicU64` words. Naturally aligned
//! sub-word accesses are done on the containing word (plain loads, CAS loops
//! for stores), so concurrent harts never race on non-atomic memory.

use crate::types::{AccessType, Width};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Default DRAM base for the virt platform.
pub const DRAM_BASE: u64 = 0x8000_0000;

/// Memory access errors reported by a backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Out-of-bounds memory access at {0:#x}")]
    OutOfBounds(u64),

    #[error("Invalid or misaligned access at {0:#x}")]
    InvalidAlignment(u64),
}

/// Address translation and host-side access used by the synchronization core.
///
/// All methods take `&self`; implementations are shared by every hart.
pub trait GuestMemory: Send + Sync {
    /// Translate `guest` to a host address. Returning `guest` unchanged means
    /// the location is not ordinary memory (e.g. device MMIO).
    fn resolve_host_address(&self, guest: u64, mem_index: usize, access: AccessType) -> u64;

    fn host_load(&self, host: u64, width: Width) -> Result<u64, MemoryError>;

    fn host_store(&self, host: u64, value: u64, width: Width) -> Result<(), MemoryError>;

    /// Atomically replace `current` with `new`. `Ok(Ok(old))` on success,
    /// `Ok(Err(observed))` when the location did not hold `current`.
    fn host_compare_exchange(
        &self,
        host: u64,
        current: u64,
        new: u64,
        width: Width,
    ) -> Result<Result<u64, u64>, MemoryError>;

    /// Guest-level read, any region. Used by the global-lock slow path.
    fn read(&self, guest: u64, width: Width) -> Result<u64, MemoryError>;

    /// Guest-level write, any region. Used by the global-lock slow path.
    fn write(&self, guest: u64, value: u64, width: Width) -> Result<(), MemoryError>;
}

// ============================================================================
// Word-array helpers
// ============================================================================

#[inline(always)]
fn field(off: usize, width: Width) -> (usize, u32, u64) {
    let index = off / 8;
    let shift = ((off % 8) * 8) as u32;
    (index, shift, width.mask() << shift)
}

fn load_at(words: &[AtomicU64], off: usize, width: Width) -> u64 {
    let (index, shift, _) = field(off, width);
    (words[index].load(Ordering::Acquire) >> shift) & width.mask()
}

fn store_at(words: &[AtomicU64], off: usize, value: u64, width: Width) {
    let (index, shift, mask) = field(off, width);
    if width == Width::Double {
        words[index].store(value, Ordering::Release);
        return;
    }
    let bits = (value & width.mask()) << shift;
    let _ = words[index].fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
        Some((word & !mask) | bits)
    });
}

fn compare_exchange_at(
    words: &[AtomicU64],
    off: usize,
    current: u64,
    new: u64,
    width: Width,
) -> Result<u64, u64> {
    let (index, shift, mask) = field(off, width);
    let current = current & width.mask();
    let new_bits = (new & width.mask()) << shift;
    let slot = &words[index];
    let mut word = slot.load(Ordering::Acquire);
    loop {
        let observed = (word & mask) >> shift;
        if observed != current {
            return Err(observed);
        }
        let replacement = (word & !mask) | new_bits;
        match slot.compare_exchange_weak(word, replacement, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Ok(observed),
            // Either a spurious failure or a neighbouring byte changed; re-check our field.
            Err(actual) => word = actual,
        }
    }
}

/// Guest-level read: aligned accesses go straight to the word, misaligned
/// ones are assembled little-endian byte by byte.
fn read_region(words: &[AtomicU64], size: usize, off: usize, addr: u64, width: Width) -> Result<u64, MemoryError> {
    let len = width.bytes() as usize;
    if off + len > size {
        return Err(MemoryError::OutOfBounds(addr));
    }
    if width.is_aligned(off as u64) {
        return Ok(load_at(words, off, width));
    }
    let mut value = 0u64;
    for i in 0..len {
        value |= load_at(words, off + i, Width::Byte) << (i * 8);
    }
    Ok(value)
}

fn write_region(
    words: &[AtomicU64],
    size: usize,
    off: usize,
    addr: u64,
    value: u64,
    width: Width,
) -> Result<(), MemoryError> {
    let len = width.bytes() as usize;
    if off + len > size {
        return Err(MemoryError::OutOfBounds(addr));
    }
    if width.is_aligned(off as u64) {
        store_at(words, off, value, width);
        return Ok(());
    }
    for i in 0..len {
        store_at(words, off + i, value >> (i * 8), Width::Byte);
    }
    Ok(())
}

fn zeroed_words(size: usize) -> Box<[AtomicU64]> {
    (0..size.div_ceil(8)).map(|_| AtomicU64::new(0)).collect()
}

/// Register file standing in for a device-mapped window.
struct DeviceWindow {
    base: u64,
    size: usize,
    regs: Box<[AtomicU64]>,
}

impl DeviceWindow {
    #[inline]
    fn offset(&self, addr: u64) -> Option<usize> {
        let off = addr.wrapping_sub(self.base) as usize;
        (off < self.size).then_some(off)
    }
}

/// DRAM backing store shared by all harts.
///
/// Host addresses handed out by [`GuestMemory::resolve_host_address`] are the
/// real addresses of the backing words in this process, so they never collide
/// with guest addresses.
pub struct Dram {
    pub base: u64,
    size: usize,
    words: Box<[AtomicU64]>,
    host_base: u64,
    device: Option<DeviceWindow>,
}

impl Dram {
    /// Create a new DRAM image of `size` bytes, zero-initialised.
    pub fn new(base: u64, size: usize) -> Self {
        let words = zeroed_words(size);
        let host_base = words.as_ptr() as usize as u64;
        Self {
            base,
            size,
            words,
            host_base,
            device: None,
        }
    }

    /// Map a device register window at `[base, base + size)`. Addresses in it
    /// resolve to the MMIO sentinel.
    pub fn with_device_window(mut self, base: u64, size: usize) -> Self {
        self.device = Some(DeviceWindow {
            base,
            size,
            regs: zeroed_words(size),
        });
        self
    }

    /// Get the size of DRAM in bytes.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn offset(&self, addr: u64) -> Option<usize> {
        // wrapping_sub avoids a separate underflow branch
        let off = addr.wrapping_sub(self.base) as usize;
        if off < self.size { Some(off) } else { None }
    }

    #[inline]
    fn host_offset(&self, host: u64, width: Width) -> Result<usize, MemoryError> {
        let off = host.wrapping_sub(self.host_base) as usize;
        match off.checked_add(width.bytes() as usize) {
            Some(end) if end <= self.size => {}
            _ => return Err(MemoryError::OutOfBounds(host)),
        }
        if !width.is_aligned(off as u64) {
            return Err(MemoryError::InvalidAlignment(host));
        }
        Ok(off)
    }

    /// Load data into DRAM at the given offset.
    pub fn load(&self, data: &[u8], offset: u64) -> Result<(), MemoryError> {
        let off = offset as usize;
        if off.checked_add(data.len()).is_none_or(|end| end > self.size) {
            return Err(MemoryError::OutOfBounds(offset));
        }
        for (i, byte) in data.iter().enumerate() {
            store_at(&self.words, off + i, *byte as u64, Width::Byte);
        }
        Ok(())
    }
}

impl GuestMemory for Dram {
    fn resolve_host_address(&self, guest: u64, _mem_index: usize, _access: AccessType) -> u64 {
        match self.offset(guest) {
            Some(off) => self.host_base + off as u64,
            None => guest,
        }
    }

    fn host_load(&self, host: u64, width: Width) -> Result<u64, MemoryError> {
        let off = self.host_offset(host, width)?;
        Ok(load_at(&self.words, off, width))
    }

    fn host_store(&self, host: u64, value: u64, width: Width) -> Result<(), MemoryError> {
        let off = self.host_offset(host, width)?;
        store_at(&self.words, off, value, width);
        Ok(())
    }

    fn host_compare_exchange(
        &self,
        host: u64,
        current: u64,
        new: u64,
        width: Width,
    ) -> Result<Result<u64, u64>, MemoryError> {
        let off = self.host_offset(host, width)?;
        Ok(compare_exchange_at(&self.words, off, current, new, width))
    }

    fn read(&self, guest: u64, width: Width) -> Result<u64, MemoryError> {
        if let Some(off) = self.offset(guest) {
            return read_region(&self.words, self.size, off, guest, width);
        }
        match &self.device {
            Some(dev) => match dev.offset(guest) {
                Some(off) => read_region(&dev.regs, dev.size, off, guest, width),
                None => Err(MemoryError::OutOfBounds(guest)),
            },
            None => Err(MemoryError::OutOfBounds(guest)),
        }
    }

    fn write(&self, guest: u64, value: u64, width: Width) -> Result<(), MemoryError> {
        if let Some(off) = self.offset(guest) {
            return write_region(&self.words, self.size, off, guest, value, width);
        }
        match &self.device {
            Some(dev) => match dev.offset(guest) {
                Some(off) => write_region(&dev.regs, dev.size, off, guest, value, width),
                None => Err(MemoryError::OutOfBounds(guest)),
            },
            None => Err(MemoryError::OutOfBounds(guest)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MMIO_BASE: u64 = 0x1000_0000;

    fn dram() -> Dram {
        Dram::new(DRAM_BASE, 0x10000).with_device_window(MMIO_BASE, 0x100)
    }

    #[test]
    fn test_resolve_dram_and_sentinel() {
        let mem = dram();
        let host = mem.resolve_host_address(DRAM_BASE + 0x40, 0, AccessType::Store);
        assert_ne!(host, DRAM_BASE + 0x40);
        let mmio = mem.resolve_host_address(MMIO_BASE + 4, 0, AccessType::Store);
        assert_eq!(mmio, MMIO_BASE + 4);
    }

    #[test]
    fn test_subword_little_endian() {
        let mem = dram();
        mem.write(DRAM_BASE, 0x1122_3344_5566_7788, Width::Double).unwrap();
        assert_eq!(mem.read(DRAM_BASE, Width::Byte).unwrap(), 0x88);
        assert_eq!(mem.read(DRAM_BASE + 4, Width::Word).unwrap(), 0x1122_3344);
        mem.write(DRAM_BASE + 2, 0xabcd, Width::Half).unwrap();
        assert_eq!(mem.read(DRAM_BASE, Width::Double).unwrap(), 0x1122_3344_abcd_7788);
    }

    #[test]
    fn test_misaligned_guest_access_spans_words() {
        let mem = dram();
        mem.write(DRAM_BASE + 6, 0xdead_beef, Width::Word).unwrap();
        assert_eq!(mem.read(DRAM_BASE + 6, Width::Word).unwrap(), 0xdead_beef);
        assert_eq!(mem.read(DRAM_BASE + 8, Width::Half).unwrap(), 0xdead);
    }

    #[test]
    fn test_host_compare_exchange() {
        let mem = dram();
        let host = mem.resolve_host_address(DRAM_BASE + 8, 0, AccessType::Store);
        mem.host_store(host, 5, Width::Word).unwrap();
        assert_eq!(mem.host_compare_exchange(host, 5, 6, Width::Word).unwrap(), Ok(5));
        assert_eq!(mem.host_compare_exchange(host, 5, 7, Width::Word).unwrap(), Err(6));
        assert_eq!(mem.host_load(host, Width::Word).unwrap(), 6);
        // Upper half of the word is untouched.
        assert_eq!(mem.read(DRAM_BASE + 12, Width::Word).unwrap(), 0);
    }

    #[test]
    fn test_host_errors() {
        let mem = dram();
        let host = mem.resolve_host_address(DRAM_BASE, 0, AccessType::Load);
        assert_eq!(
            mem.host_load(host + 2, Width::Word),
            Err(MemoryError::InvalidAlignment(host + 2))
        );
        assert!(matches!(
            mem.host_load(host + 0x10000, Width::Byte),
            Err(MemoryError::OutOfBounds(_))
        ));
        assert!(mem.read(0x4000_0000, Width::Word).is_err());
    }

    #[test]
    fn test_device_window() {
        let mem = dram();
        mem.write(MMIO_BASE + 0x10, 42, Width::Word).unwrap();
        assert_eq!(mem.read(MMIO_BASE + 0x10, Width::Word).unwrap(), 42);
        assert!(mem.write(MMIO_BASE + 0x100, 1, Width::Byte).is_err());
    }

    #[test]
    fn test_load_image() {
        let mem = dram();
        mem.load(&[1, 2, 3, 4], 0x20).unwrap();
        assert_eq!(mem.read(DRAM_BASE + 0x20, Width::Word).unwrap(), 0x0403_0201);
        assert!(mem.load(&[0; 8], 0xfffc).is_err());
    }
}
