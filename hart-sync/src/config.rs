//! Tunables for one shared memory state.

use crate::error::SyncError;
use crate::types::{MAX_HARTS, PAGE_SIZE, RESERVATION_GRANULE};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default dirty-address batch size.
pub const DEFAULT_DIRTY_CAPACITY: usize = 100;

/// Default fast-path table size as a power of two.
pub const DEFAULT_FAST_PATH_BITS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on attached harts (at most `MAX_HARTS`).
    pub max_harts: usize,
    /// Entries in each hart's dirty-address buffer before it auto-flushes.
    pub dirty_capacity: usize,
    /// The fast-path lock table has `1 << fast_path_bits` slots.
    pub fast_path_bits: u32,
    /// Guest page size in bytes.
    pub page_size: u64,
    /// Bytes covered by a single reservation.
    pub reservation_granule: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_harts: MAX_HARTS,
            dirty_capacity: DEFAULT_DIRTY_CAPACITY,
            fast_path_bits: DEFAULT_FAST_PATH_BITS,
            page_size: PAGE_SIZE,
            reservation_granule: RESERVATION_GRANULE,
        }
    }
}

impl SyncConfig {
    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.max_harts == 0 || self.max_harts > MAX_HARTS {
            return Err(SyncError::InvalidConfig(format!(
                "max_harts must be in 1..={}, got {}",
                MAX_HARTS, self.max_harts
            )));
        }
        if self.dirty_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "dirty_capacity must be non-zero".to_string(),
            ));
        }
        if self.fast_path_bits == 0 || self.fast_path_bits > 24 {
            return Err(SyncError::InvalidConfig(format!(
                "fast_path_bits must be in 1..=24, got {}",
                self.fast_path_bits
            )));
        }
        if !self.page_size.is_power_of_two() || self.page_size < 8 {
            return Err(SyncError::InvalidConfig(format!(
                "page_size must be a power of two >= 8, got {}",
                self.page_size
            )));
        }
        if !self.reservation_granule.is_power_of_two()
            || self.reservation_granule < 8
            || self.reservation_granule > self.page_size
        {
            return Err(SyncError::InvalidConfig(format!(
                "reservation_granule must be a power of two in 8..=page_size, got {}",
                self.reservation_granule
            )));
        }
        Ok(())
    }

    /// Number of fast-path slots.
    #[inline]
    pub fn fast_path_slots(&self) -> usize {
        1usize << self.fast_path_bits
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, SyncError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: SyncConfig = serde_json::from_str(&text)
            .map_err(|e| SyncError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}
