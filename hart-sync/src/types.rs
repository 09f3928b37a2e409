//! Shared vocabulary types: hart identity, access widths, outcomes and the
//! page/granule arithmetic every component agrees on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of harts that can attach to one shared memory state.
pub const MAX_HARTS: usize = 128;

/// Default guest page size.
pub const PAGE_SIZE: u64 = 4096;

/// Default reservation granule (bytes covered by one LR reservation).
pub const RESERVATION_GRANULE: u64 = 64;

/// Stable small-integer identity of a registered hart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HartId(u32);

impl HartId {
    pub(crate) const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw id value.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hart{}", self.0)
    }
}

/// Memory access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Width {
    Byte,
    Half,
    Word,
    Double,
}

impl Width {
    /// Size in bytes.
    #[inline]
    pub const fn bytes(self) -> u64 {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
            Width::Double => 8,
        }
    }

    /// Mask selecting the low `bytes()` bytes of a value.
    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            Width::Double => u64::MAX,
            _ => (1u64 << (self.bytes() * 8)) - 1,
        }
    }

    /// Sign-extend the low `bytes()` bytes of `value` to 64 bits.
    #[inline]
    pub const fn sign_extend(self, value: u64) -> u64 {
        match self {
            Width::Byte => value as u8 as i8 as i64 as u64,
            Width::Half => value as u16 as i16 as i64 as u64,
            Width::Word => value as u32 as i32 as i64 as u64,
            Width::Double => value,
        }
    }

    #[inline]
    pub const fn is_aligned(self, addr: u64) -> bool {
        addr % self.bytes() == 0
    }

    /// Width for a byte count, if it is one of the supported sizes.
    pub const fn from_bytes(n: u64) -> Option<Self> {
        match n {
            1 => Some(Width::Byte),
            2 => Some(Width::Half),
            4 => Some(Width::Word),
            8 => Some(Width::Double),
            _ => None,
        }
    }
}

/// Kind of access handed to the address-translation collaborator.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessType {
    Instruction,
    Load,
    Store,
}

/// Result of a fast-path store-conditional attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScOutcome {
    /// The value was committed.
    Success,
    /// Reservation lost or the location changed underneath us.
    Failure,
    /// Address not eligible for the fast path; use the global-lock path.
    Fallback,
}

/// Result of a fast-path load-reserved attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastLoad {
    Loaded(u64),
    Fallback,
}

/// Read-modify-write operations performed under the global memory lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmoOp {
    Swap,
    Add,
    And,
    Or,
    Xor,
    Min,
    Max,
    MinU,
    MaxU,
}

impl AmoOp {
    /// New memory value given the `old` value and the `operand`, both
    /// truncated to `width`.
    pub fn apply(self, old: u64, operand: u64, width: Width) -> u64 {
        let (a, b) = (old & width.mask(), operand & width.mask());
        let (sa, sb) = (width.sign_extend(a) as i64, width.sign_extend(b) as i64);
        let new = match self {
            AmoOp::Swap => b,
            AmoOp::Add => a.wrapping_add(b),
            AmoOp::And => a & b,
            AmoOp::Or => a | b,
            AmoOp::Xor => a ^ b,
            AmoOp::Min => if sa <= sb { a } else { b },
            AmoOp::Max => if sa >= sb { a } else { b },
            AmoOp::MinU => a.min(b),
            AmoOp::MaxU => a.max(b),
        };
        new & width.mask()
    }
}

/// Base address of the page containing `addr`.
#[inline]
pub const fn page_base(addr: u64, page_size: u64) -> u64 {
    addr & !(page_size - 1)
}

/// True if `[addr, addr + width)` touches more than one page.
#[inline]
pub const fn crosses_page(addr: u64, width: Width, page_size: u64) -> bool {
    let last = addr.wrapping_add(width.bytes() - 1);
    page_base(addr, page_size) != page_base(last, page_size)
}

/// Granule-aligned base of `addr`.
#[inline]
pub const fn granule_base(addr: u64, granule: u64) -> u64 {
    addr & !(granule - 1)
}

/// True if the byte range `[addr, addr + len)` overlaps the granule that
/// contains `reserved`.
#[inline]
pub const fn overlaps_granule(reserved: u64, addr: u64, len: u64, granule: u64) -> bool {
    let start = granule_base(reserved, granule);
    let end = start.wrapping_add(granule);
    let w_end = addr.wrapping_add(len);
    addr < end && w_end > start
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_helpers() {
        assert_eq!(Width::Word.bytes(), 4);
        assert_eq!(Width::Half.mask(), 0xffff);
        assert_eq!(Width::Double.mask(), u64::MAX);
        assert_eq!(Width::Word.sign_extend(0x8000_0000), 0xffff_ffff_8000_0000);
        assert_eq!(Width::from_bytes(8), Some(Width::Double));
        assert_eq!(Width::from_bytes(3), None);
        assert!(Width::Word.is_aligned(0x1004));
        assert!(!Width::Double.is_aligned(0x1004));
    }

    #[test]
    fn test_amo_apply() {
        assert_eq!(AmoOp::Add.apply(0xffff_ffff, 1, Width::Word), 0);
        assert_eq!(AmoOp::Swap.apply(5, 9, Width::Double), 9);
        // -1 < 1 when signed, larger when unsigned.
        assert_eq!(AmoOp::Min.apply(0xffff_ffff, 1, Width::Word), 0xffff_ffff);
        assert_eq!(AmoOp::MinU.apply(0xffff_ffff, 1, Width::Word), 1);
        assert_eq!(AmoOp::Max.apply(0x80, 0x7f, Width::Byte), 0x7f);
        assert_eq!(AmoOp::MaxU.apply(0x80, 0x7f, Width::Byte), 0x80);
        assert_eq!(AmoOp::Xor.apply(0b1100, 0b1010, Width::Half), 0b0110);
        assert_eq!(AmoOp::And.apply(0b1100, 0b1010, Width::Half), 0b1000);
        assert_eq!(AmoOp::Or.apply(0b1100, 0b1010, Width::Half), 0b1110);
    }

    #[test]
    fn test_page_crossing() {
        assert!(!crosses_page(0x8000_0ffc, Width::Word, PAGE_SIZE));
        assert!(crosses_page(0x8000_0ffe, Width::Word, PAGE_SIZE));
        assert!(crosses_page(0x8000_0ff9, Width::Double, PAGE_SIZE));
        assert_eq!(page_base(0x8000_1234, PAGE_SIZE), 0x8000_1000);
    }

    #[test]
    fn test_granule_overlap() {
        // Same granule, different word.
        assert!(overlaps_granule(0x1000, 0x1038, 4, 64));
        // Write straddling into the granule from below.
        assert!(overlaps_granule(0x1040, 0x103c, 8, 64));
        // Adjacent granule.
        assert!(!overlaps_granule(0x1000, 0x1040, 4, 64));
    }
}
