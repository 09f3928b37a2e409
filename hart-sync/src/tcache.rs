//! Per-hart translation cache.
//!
//! Stand-in for the emulator's store of translated blocks, keyed by PC. It is
//! what a hart invalidates when it writes code itself, or when a sibling's
//! dirty-address broadcast says a page changed. Uses generation-based flushes
//! so "drop everything" is O(1).

use std::collections::HashMap;

/// Translation cache configuration.
pub const BLOCK_CACHE_SIZE: usize = 4096;

/// Informs a translation cache that guest bytes changed.
pub trait CodeInvalidator {
    /// Bytes in `[address, address + width)` changed. `from_broadcast` is set
    /// when the news came from a sibling, so it must not be re-broadcast.
    fn invalidate_cached_code_containing(&mut self, address: u64, width: u64, from_broadcast: bool);

    /// Drop every cached translation.
    fn invalidate_all(&mut self);
}

/// A translated block. Only the metadata the coherence logic needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedBlock {
    /// Starting virtual PC of this block.
    pub start_pc: u64,
    /// Starting physical address (for invalidation).
    pub start_pa: u64,
    /// Guest bytes covered by the block.
    pub byte_len: u16,
    pub exec_count: u32,
    pub generation: u32,
}

impl TranslatedBlock {
    pub fn new(start_pc: u64, start_pa: u64, byte_len: u16) -> Self {
        Self {
            start_pc,
            start_pa,
            byte_len,
            exec_count: 0,
            generation: 0,
        }
    }

    #[inline]
    fn overlaps(&self, start: u64, end: u64) -> bool {
        let block_end = self.start_pa + self.byte_len as u64;
        self.start_pa < end && block_end > start
    }
}

/// Block cache using PC as key.
pub struct TranslationCache {
    blocks: HashMap<u64, TranslatedBlock>,
    /// Current generation (incremented on flush).
    pub generation: u32,
    pub hits: u64,
    pub misses: u64,
    /// Invalidations caused by this hart's own writes.
    pub local_invalidations: u64,
    /// Invalidations applied from sibling broadcasts.
    pub broadcast_invalidations: u64,
    /// Blocks removed by range invalidation.
    pub blocks_dropped: u64,
}

impl TranslationCache {
    pub fn new() -> Self {
        Self {
            blocks: HashMap::with_capacity(BLOCK_CACHE_SIZE),
            generation: 0,
            hits: 0,
            misses: 0,
            local_invalidations: 0,
            broadcast_invalidations: 0,
            blocks_dropped: 0,
        }
    }

    /// Look up a block by PC, counting hits and stale entries as misses.
    #[inline]
    pub fn get(&mut self, pc: u64) -> Option<&TranslatedBlock> {
        match self.blocks.get_mut(&pc) {
            Some(block) if block.generation == self.generation => {
                self.hits += 1;
                block.exec_count = block.exec_count.saturating_add(1);
                Some(&*block)
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert a block, stamping it with the current generation.
    pub fn insert(&mut self, mut block: TranslatedBlock) {
        if self.blocks.len() >= BLOCK_CACHE_SIZE {
            self.evict_cold();
        }
        block.generation = self.generation;
        self.blocks.insert(block.start_pc, block);
    }

    /// Invalidate all blocks without walking the map; stale entries fail the
    /// generation check.
    pub fn flush(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    /// Remove blocks overlapping `[start_pa, end_pa)`. Returns how many.
    pub fn invalidate_range(&mut self, start_pa: u64, end_pa: u64) -> usize {
        let before = self.blocks.len();
        self.blocks.retain(|_, block| !block.overlaps(start_pa, end_pa));
        let dropped = before - self.blocks.len();
        self.blocks_dropped += dropped as u64;
        dropped
    }

    fn evict_cold(&mut self) {
        let current = self.generation;
        self.blocks.retain(|_, block| block.generation == current);
        if self.blocks.len() < BLOCK_CACHE_SIZE {
            return;
        }
        // Still full: drop the least-executed quarter. Ties are broken by PC
        // so exactly `cut` blocks go.
        let mut by_heat: Vec<(u32, u64)> = self
            .blocks
            .iter()
            .map(|(&pc, block)| (block.exec_count, pc))
            .collect();
        let cut = (by_heat.len() / 4).max(1);
        by_heat.select_nth_unstable(cut - 1);
        for &(_, pc) in &by_heat[..cut] {
            self.blocks.remove(&pc);
        }
    }

    /// Live (current-generation) blocks.
    pub fn len(&self) -> usize {
        self.blocks
            .values()
            .filter(|b| b.generation == self.generation)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses, size, hit_rate).
    pub fn stats(&self) -> (u64, u64, usize, f64) {
        let total = self.hits + self.misses;
        let hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
        (self.hits, self.misses, self.len(), hit_rate)
    }
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeInvalidator for TranslationCache {
    fn invalidate_cached_code_containing(&mut self, address: u64, width: u64, from_broadcast: bool) {
        if from_broadcast {
            self.broadcast_invalidations += 1;
        } else {
            self.local_invalidations += 1;
        }
        self.invalidate_range(address, address.saturating_add(width));
    }

    fn invalidate_all(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_insert_and_get() {
        let mut cache = TranslationCache::new();
        cache.insert(TranslatedBlock::new(0x8000_0000, 0x8000_0000, 16));
        assert!(cache.get(0x8000_0000).is_some());
        assert!(cache.get(0x8000_1000).is_none());
        assert_eq!(cache.hits, 1);
        assert_eq!(cache.misses, 1);
    }

    #[test]
    fn test_flush_invalidates_by_generation() {
        let mut cache = TranslationCache::new();
        cache.insert(TranslatedBlock::new(0x8000_0000, 0x8000_0000, 16));
        cache.flush();
        assert!(cache.get(0x8000_0000).is_none());
        assert!(cache.is_empty());
        // Reinserted blocks pick up the new generation.
        cache.insert(TranslatedBlock::new(0x8000_0000, 0x8000_0000, 16));
        assert!(cache.get(0x8000_0000).is_some());
    }

    #[test]
    fn test_range_invalidation_hits_overlap_only() {
        let mut cache = TranslationCache::new();
        cache.insert(TranslatedBlock::new(0x1000, 0x8000_1000, 0x20));
        cache.insert(TranslatedBlock::new(0x1020, 0x8000_1020, 0x20));
        cache.insert(TranslatedBlock::new(0x2000, 0x8000_2000, 0x20));

        cache.invalidate_cached_code_containing(0x8000_101c, 4, false);
        assert!(cache.get(0x1000).is_none());
        assert!(cache.get(0x1020).is_some());
        assert!(cache.get(0x2000).is_some());
        assert_eq!(cache.local_invalidations, 1);
        assert_eq!(cache.blocks_dropped, 1);
    }

    #[test]
    fn test_broadcast_page_invalidation() {
        let mut cache = TranslationCache::new();
        cache.insert(TranslatedBlock::new(0x1000, 0x8000_1000, 0x20));
        cache.insert(TranslatedBlock::new(0x1800, 0x8000_1800, 0x20));
        cache.insert(TranslatedBlock::new(0x2000, 0x8000_2000, 0x20));
        cache.invalidate_cached_code_containing(0x8000_1000, 0x1000, true);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.broadcast_invalidations, 1);
        assert_eq!(cache.local_invalidations, 0);
    }

    #[test]
    fn test_eviction_keeps_cache_bounded() {
        let mut cache = TranslationCache::new();
        for i in 0..(BLOCK_CACHE_SIZE as u64 + 10) {
            cache.insert(TranslatedBlock::new(i * 4, i * 4, 4));
        }
        assert!(cache.len() <= BLOCK_CACHE_SIZE);
    }

    #[test]
    fn test_eviction_drops_only_the_cold_quarter() {
        let mut cache = TranslationCache::new();
        for i in 0..BLOCK_CACHE_SIZE as u64 {
            cache.insert(TranslatedBlock::new(i * 4, i * 4, 4));
        }
        // Everything else ties at zero executions.
        let hot = [0u64, 0x400, 0x3ffc];
        for pc in hot {
            assert!(cache.get(pc).is_some());
        }

        cache.insert(TranslatedBlock::new(0x10_0000, 0x10_0000, 4));
        assert_eq!(cache.len(), BLOCK_CACHE_SIZE - BLOCK_CACHE_SIZE / 4 + 1);
        for pc in hot {
            assert!(cache.get(pc).is_some(), "hot block {pc:#x} evicted");
        }
        assert!(cache.get(0x10_0000).is_some());
    }

    #[test]
    fn test_cache_stats() {
        let mut cache = TranslationCache::new();
        cache.insert(TranslatedBlock::new(0x8000_0000, 0x8000_0000, 4));
        cache.get(0x8000_0000);
        cache.get(0x8000_1000);
        cache.get(0x8000_2000);
        let (hits, misses, size, hit_rate) = cache.stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 2);
        assert_eq!(size, 1);
        assert!((hit_rate - 0.333).abs() < 0.01);
    }
}
