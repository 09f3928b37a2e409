//! Multi-hart stress runner.
//!
//! Drives N hart threads against one [`Machine`] and checks the end state:
//! every LR/SC increment and every AMO add must be accounted for. Hart 0 also
//! keeps rewriting a code page while the others hold a translation of it, so
//! the dirty-address broadcast is exercised under load.
//!
//! Memory layout:
//!
//! | Address                 | Use                              |
//! |-------------------------|----------------------------------|
//! | `DRAM_BASE + 0x1000`    | fast-path LR/SC counter          |
//! | `DEVICE_BASE + 0x10`    | slow-path LR/SC counter (device) |
//! | `DRAM_BASE + 0x3000`    | AMO add counter                  |
//! | `DRAM_BASE + 0x8000`    | code page rewritten by hart 0    |

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::hart::{Hart, Machine};
use crate::memory::{DRAM_BASE, Dram};
use crate::shared::SyncStats;
use crate::tcache::{TranslatedBlock, TranslationCache};
use crate::types::{AmoOp, Width};
use serde::Serialize;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

/// Base of the device register window in the runner's memory map.
pub const DEVICE_BASE: u64 = 0x1000_0000;

const DRAM_SIZE: usize = 1 << 20;
const DEVICE_SIZE: usize = 0x1000;

const FAST_COUNTER: u64 = DRAM_BASE + 0x1000;
const SLOW_COUNTER: u64 = DEVICE_BASE + 0x10;
const AMO_COUNTER: u64 = DRAM_BASE + 0x3000;
const CODE_PAGE: u64 = DRAM_BASE + 0x8000;
/// Guest PC the siblings keep a translation for.
const CODE_PC: u64 = 0x8000;
/// Hart 0 patches one instruction every this many iterations.
const REWRITE_INTERVAL: u64 = 64;

/// Which LR/SC path the workers exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PathMode {
    /// Plain memory only: no global lock on the hot path.
    Fast,
    /// Device window only: every LR/SC goes through the global lock.
    Slow,
    /// Both counters plus AMO adds, interleaved.
    Mixed,
}

#[derive(Debug, Clone)]
pub struct StressConfig {
    pub harts: usize,
    pub iterations: u64,
    pub path: PathMode,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            harts: 4,
            iterations: 10_000,
            path: PathMode::Mixed,
        }
    }
}

/// Final counter values and what they should have been.
#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub harts: usize,
    pub iterations: u64,
    pub path: PathMode,
    pub expected: u64,
    pub fast_counter: u64,
    pub slow_counter: u64,
    pub amo_counter: u64,
    /// Failed SCs that had to be retried.
    pub sc_retries: u64,
    pub code_rewrites: u64,
    /// Times a sibling found its translation gone and rebuilt it.
    pub retranslations: u64,
    pub elapsed_ms: u128,
    pub consistent: bool,
    pub stats: SyncStats,
}

#[derive(Debug, Default)]
struct Tally {
    retries: u64,
    rewrites: u64,
    retranslations: u64,
}

pub struct StressRunner {
    sync: SyncConfig,
    config: StressConfig,
}

impl StressRunner {
    pub fn new(sync: SyncConfig, config: StressConfig) -> Self {
        Self { sync, config }
    }

    pub fn run(&self) -> Result<StressReport, SyncError> {
        let StressConfig {
            harts,
            iterations,
            path,
        } = self.config.clone();
        if harts == 0 || harts > self.sync.max_harts {
            return Err(SyncError::InvalidConfig(format!(
                "harts must be in 1..={}, got {}",
                self.sync.max_harts, harts
            )));
        }

        let dram = Dram::new(DRAM_BASE, DRAM_SIZE).with_device_window(DEVICE_BASE, DEVICE_SIZE);
        let machine = Machine::new(self.sync.clone(), Arc::new(dram))?;

        // Everyone registers before anyone runs.
        let mut cores = Vec::with_capacity(harts);
        for i in 0..harts {
            let mut hart = machine.attach(Some(i as u32), TranslationCache::new())?;
            if i != 0 {
                hart.code_mut().insert(TranslatedBlock::new(CODE_PC, CODE_PAGE, 0x40));
            }
            cores.push(hart);
        }

        log::info!("[Runner] {harts} hart(s) x {iterations} iteration(s), {path:?} path");
        let barrier = Barrier::new(harts);
        let start = Instant::now();

        let finished = thread::scope(|s| -> Result<Vec<(Hart, Tally)>, SyncError> {
            let mut handles = Vec::with_capacity(harts);
            for hart in cores {
                let id = hart.id();
                let barrier = &barrier;
                let handle = thread::Builder::new()
                    .name(format!("hart-{}", id.get()))
                    .spawn_scoped(s, move || {
                        barrier.wait();
                        run_hart(hart, iterations, path)
                    })?;
                handles.push((id, handle));
            }
            let mut finished = Vec::with_capacity(handles.len());
            for (id, handle) in handles {
                let result = handle
                    .join()
                    .map_err(|_| SyncError::HartPanicked { hart: id })?;
                finished.push(result?);
            }
            Ok(finished)
        })?;
        let elapsed_ms = start.elapsed().as_millis();

        // Deliver the last partial batches, then let every hart drain its inbox.
        let (mut cores, tallies): (Vec<Hart>, Vec<Tally>) = finished.into_iter().unzip();
        for hart in &mut cores {
            hart.flush_dirty();
        }
        let mut retranslations = 0;
        for hart in &mut cores {
            hart.process_broadcasts();
            if hart.id().get() != 0 && hart.code_mut().get(CODE_PC).is_none() {
                retranslations += 1;
            }
        }

        let reader = &cores[0];
        let fast_counter = reader.load(FAST_COUNTER, Width::Double)?;
        let slow_counter = reader.load(SLOW_COUNTER, Width::Double)?;
        let amo_counter = reader.load(AMO_COUNTER, Width::Double)?;
        drop(cores);

        let expected = harts as u64 * iterations;
        let consistent = match path {
            PathMode::Fast => fast_counter == expected,
            PathMode::Slow => slow_counter == expected,
            PathMode::Mixed => {
                fast_counter == expected && slow_counter == expected && amo_counter == expected
            }
        };
        if consistent {
            log::info!("[Runner] done in {elapsed_ms} ms, all updates accounted for");
        } else {
            log::error!(
                "[Runner] lost updates: expected {expected}, fast {fast_counter}, slow {slow_counter}, amo {amo_counter}"
            );
        }

        Ok(StressReport {
            harts,
            iterations,
            path,
            expected,
            fast_counter,
            slow_counter,
            amo_counter,
            sc_retries: tallies.iter().map(|t| t.retries).sum(),
            code_rewrites: tallies.iter().map(|t| t.rewrites).sum(),
            retranslations: retranslations + tallies.iter().map(|t| t.retranslations).sum::<u64>(),
            elapsed_ms,
            consistent,
            stats: machine.shared().stats(),
        })
    }
}

/// LR/SC increment loop. Returns the number of failed attempts.
fn increment(hart: &mut Hart, address: u64) -> Result<u64, SyncError> {
    let mut retries = 0;
    loop {
        let value = hart.load_reserved(address, Width::Double)?;
        if hart.store_conditional(address, value.wrapping_add(1), Width::Double)? {
            return Ok(retries);
        }
        retries += 1;
    }
}

fn run_hart(mut hart: Hart, iterations: u64, path: PathMode) -> Result<(Hart, Tally), SyncError> {
    let mut tally = Tally::default();
    let writer = hart.id().get() == 0;
    for i in 0..iterations {
        // Siblings apply broadcasts before "dispatching" the translated block.
        if !writer {
            hart.process_broadcasts();
            if hart.code_mut().get(CODE_PC).is_none() {
                hart.code_mut().insert(TranslatedBlock::new(CODE_PC, CODE_PAGE, 0x40));
                tally.retranslations += 1;
            }
        }

        match path {
            PathMode::Fast => tally.retries += increment(&mut hart, FAST_COUNTER)?,
            PathMode::Slow => tally.retries += increment(&mut hart, SLOW_COUNTER)?,
            PathMode::Mixed => {
                tally.retries += increment(&mut hart, FAST_COUNTER)?;
                tally.retries += increment(&mut hart, SLOW_COUNTER)?;
                hart.atomic_rmw(AmoOp::Add, AMO_COUNTER, 1, Width::Double)?;
            }
        }

        if writer && i % REWRITE_INTERVAL == 0 {
            let slot = (i / REWRITE_INTERVAL) % 16;
            hart.store(CODE_PAGE + slot * 4, 0x0000_0013 | (slot << 20), Width::Word)?;
            tally.rewrites += 1;
        }
    }
    log::debug!("[Runner] {} finished ({} retries)", hart.id(), tally.retries);
    Ok((hart, tally))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(harts: usize, iterations: u64, path: PathMode) -> StressReport {
        let config = StressConfig {
            harts,
            iterations,
            path,
        };
        StressRunner::new(SyncConfig::default(), config).run().unwrap()
    }

    #[test]
    fn test_fast_path_no_lost_updates() {
        let report = run(4, 500, PathMode::Fast);
        assert!(report.consistent, "{report:?}");
        assert_eq!(report.fast_counter, 2000);
        assert_eq!(report.stats.sc_fast_success, 2000);
        // Plain-memory LR/SC and stores never take the global lock.
        assert_eq!(report.stats.lock_acquisitions, 0);
    }

    #[test]
    fn test_slow_path_no_lost_updates() {
        let report = run(4, 300, PathMode::Slow);
        assert!(report.consistent, "{report:?}");
        assert_eq!(report.slow_counter, 1200);
        assert_eq!(report.stats.sc_slow_success, 1200);
        assert_eq!(report.stats.sc_fast_success, 0);
        assert!(report.stats.lock_acquisitions >= 2400);
        assert_eq!(report.stats.live_reservations, 0);
    }

    #[test]
    fn test_mixed_paths_and_code_broadcast() {
        let report = run(3, 300, PathMode::Mixed);
        assert!(report.consistent, "{report:?}");
        assert_eq!(report.amo_counter, 900);
        assert_eq!(report.stats.amo_operations, 900);
        assert_eq!(report.code_rewrites, 5);
        // Hart 0's rewrites reached both siblings.
        assert!(report.stats.broadcast_invalidations > 0);
        assert!(report.retranslations >= 2);
    }

    #[test]
    fn test_single_hart_skips_locking() {
        let report = run(1, 200, PathMode::Slow);
        assert!(report.consistent);
        assert_eq!(report.stats.lock_acquisitions, 0);
        assert_eq!(report.sc_retries, 0);
    }

    #[test]
    fn test_rejects_bad_hart_count() {
        let config = StressConfig {
            harts: 0,
            ..StressConfig::default()
        };
        assert!(matches!(
            StressRunner::new(SyncConfig::default(), config).run(),
            Err(SyncError::InvalidConfig(_))
        ));
    }
}
