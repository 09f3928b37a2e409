use clap::Parser;
use hart_sync::{PathMode, StressConfig, StressReport, StressRunner, SyncConfig};
use std::fmt::Write;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of hart threads
    #[arg(long, default_value_t = 4)]
    harts: usize,

    /// LR/SC increments per hart
    #[arg(short, long, default_value_t = 10_000)]
    iterations: u64,

    /// Which atomic path to exercise
    #[arg(long, value_enum, default_value_t = PathMode::Mixed)]
    path: PathMode,

    /// Dirty-address batch size (overrides the config file)
    #[arg(long)]
    dirty_capacity: Option<usize>,

    /// Fast-path table size as a power of two (overrides the config file)
    #[arg(long)]
    fast_path_bits: Option<u32>,

    /// JSON file with synchronization tunables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the report as JSON instead of the summary
    #[arg(long)]
    json: bool,
}

/// Plain-text summary: a header, three groups of `label  value` rows and a
/// one-line verdict.
fn summary(report: &StressReport, sync: &SyncConfig) -> Result<String, std::fmt::Error> {
    let stats = &report.stats;
    let mut out = String::new();
    fn row(out: &mut String, label: &str, value: &dyn std::fmt::Display) -> std::fmt::Result {
        writeln!(out, "  {label:<22} {value}")
    }

    writeln!(
        out,
        "hart-sync: {} hart(s) x {} iteration(s), {:?} path, {} ms",
        report.harts, report.iterations, report.path, report.elapsed_ms
    )?;
    writeln!(
        out,
        "  [{} fast-path slots, {}-byte granule, dirty batch {}]",
        sync.fast_path_slots(),
        sync.reservation_granule,
        sync.dirty_capacity
    )?;

    writeln!(out, "\ncounters (expected {} each)", report.expected)?;
    row(&mut out, "lr/sc fast", &report.fast_counter)?;
    row(&mut out, "lr/sc slow", &report.slow_counter)?;
    row(&mut out, "amo add", &report.amo_counter)?;
    row(&mut out, "sc retries", &report.sc_retries)?;

    writeln!(out, "\nsync")?;
    row(
        &mut out,
        "global lock",
        &format!("{} taken, {} contended", stats.lock_acquisitions, stats.lock_contended),
    )?;
    row(&mut out, "mutex / condvar", &format!("{} / {}", stats.mutex_entries, stats.condvar_waits))?;
    row(&mut out, "sc fast ok/fail", &format!("{}/{}", stats.sc_fast_success, stats.sc_fast_failure))?;
    row(&mut out, "sc slow ok/fail", &format!("{}/{}", stats.sc_slow_success, stats.sc_slow_failure))?;
    row(
        &mut out,
        "reservations",
        &format!("{} made, {} broken", stats.reservations_created, stats.reservations_invalidated),
    )?;

    writeln!(out, "\ncode")?;
    row(&mut out, "rewrites", &report.code_rewrites)?;
    row(&mut out, "retranslations", &report.retranslations)?;
    row(
        &mut out,
        "dirty flushes",
        &format!("{} ({} addrs)", stats.dirty_flushes, stats.dirty_addresses_flushed),
    )?;
    row(&mut out, "blocks invalidated", &stats.broadcast_invalidations)?;

    let verdict = if report.consistent { "ok: no lost updates" } else { "FAILED: lost updates" };
    writeln!(out, "\n{verdict}")?;
    Ok(out)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut sync = match &args.config {
        Some(path) => SyncConfig::from_json_file(path)?,
        None => SyncConfig::default(),
    };
    if let Some(capacity) = args.dirty_capacity {
        sync.dirty_capacity = capacity;
    }
    if let Some(bits) = args.fast_path_bits {
        sync.fast_path_bits = bits;
    }
    sync.validate()?;

    let stress = StressConfig {
        harts: args.harts,
        iterations: args.iterations,
        path: args.path,
    };

    let report = StressRunner::new(sync.clone(), stress).run()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", summary(&report, &sync)?);
    }

    if !report.consistent {
        std::process::exit(1);
    }
    Ok(())
}
