use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use codecache_core::{initialize_heaps, CodeCacheConfig, CodeHeapKind, HeapLayout};
use codecache_runtime::{
    AllReachable, BlobSpec, ClassChange, ClassChangeKind, CodeCache, CompileBroker, Detached,
    GcCause, GcRequester, KlassId, ManualClock,
};
use colored::Colorize;
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "codecache")]
#[command(
    about = "Inspect JIT code cache layouts and simulate compile/GC workloads",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "pretty")]
    output: OutputFormat,

    /// TOML configuration file, layered under CODECACHE__* environment variables
    #[arg(short, long, global = true, env = "CODECACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Pin the total reserved size (accepts K, M and G suffixes)
    #[arg(long, global = true, value_parser = parse_size)]
    reserved_size: Option<usize>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML
    Config {
        /// Print the JSON schema of the configuration file instead
        #[arg(long)]
        schema: bool,
    },

    /// Print how the reservation is split into heaps
    Layout,

    /// Run a synthetic compile/GC workload and print the resulting cache state
    Simulate {
        /// Marking cycles to run
        #[arg(long, default_value_t = 20)]
        cycles: usize,

        /// Methods compiled between two cycles
        #[arg(long, default_value_t = 200)]
        methods_per_cycle: usize,

        /// Fraction of live methods found on a stack each cycle
        #[arg(long, default_value_t = 0.2)]
        hot_fraction: f64,

        /// Seconds of simulated time between cycles
        #[arg(long, default_value_t = 1.0)]
        interval: f64,

        /// Random seed
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Write a perf map of the final cache contents
        #[arg(long)]
        perf_map: Option<PathBuf>,
    },
}

fn parse_size(text: &str) -> std::result::Result<usize, String> {
    let text = text.trim();
    let (digits, multiplier) = match text.chars().last() {
        Some('k' | 'K') => (&text[..text.len() - 1], 1024),
        Some('m' | 'M') => (&text[..text.len() - 1], 1024 * 1024),
        Some('g' | 'G') => (&text[..text.len() - 1], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    let n = digits
        .parse::<usize>()
        .map_err(|e| format!("invalid size `{}`: {}", text, e))?;
    n.checked_mul(multiplier)
        .ok_or_else(|| format!("size `{}` does not fit in {} bits", text, usize::BITS))
}

/// Stops and restarts are only logged; the simulation checks the cache's gate itself.
struct LoggingBroker;

impl CompileBroker for LoggingBroker {
    fn stop_compilation(&self, kind: CodeHeapKind) {
        info!("Compilation stopped: {} is full", kind);
    }

    fn restart_compilation(&self) {
        info!("Compilation restarted");
    }
}

#[derive(Default)]
struct PendingGc {
    requested: AtomicBool,
}

impl GcRequester for PendingGc {
    fn collect(&self, cause: GcCause) {
        debug!("GC requested: {:?}", cause);
        self.requested.store(true, Ordering::Release);
    }
}

#[derive(Debug, Default, Serialize)]
struct SimulationStats {
    compiled: usize,
    allocation_failures: usize,
    install_failures: usize,
    requested_gcs: usize,
    unloaded: usize,
    deoptimized: usize,
    freed_bytes: usize,
    compiler_restarts: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "codecache_core=debug,codecache_runtime=debug,codecache=debug"
    } else {
        "codecache_core=info,codecache_runtime=info,codecache=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = CodeCacheConfig::load(cli.config.as_deref())
        .context("Failed to load code cache configuration")?;
    if let Some(size) = cli.reserved_size {
        config = config.with_reserved_size(size);
    }

    match &cli.command {
        Commands::Config { schema: true } => {
            println!("{}", CodeCacheConfig::json_schema()?);
            Ok(())
        }
        Commands::Config { schema: false } => {
            match cli.output {
                OutputFormat::Json => println!("{}", config.to_json()?),
                OutputFormat::Pretty => print!("{}", config.to_toml()?),
            }
            Ok(())
        }
        Commands::Layout => {
            let layout = initialize_heaps(&config).context("Invalid code heap configuration")?;
            print_layout(cli.output, &layout)
        }
        Commands::Simulate {
            cycles,
            methods_per_cycle,
            hot_fraction,
            interval,
            seed,
            perf_map,
        } => {
            if !(0.0..=1.0).contains(hot_fraction) {
                bail!("--hot-fraction must be within 0..=1");
            }
            if *interval <= 0.0 {
                bail!("--interval must be positive");
            }
            let clock = Arc::new(ManualClock::new());
            let gc = Arc::new(PendingGc::default());
            let cache = CodeCache::builder(config)
                .compile_broker(Arc::new(LoggingBroker))
                .gc_requester(gc.clone())
                .clock(clock.clone())
                .build()
                .context("Failed to create code cache")?;

            let workload = Workload {
                cycles: *cycles,
                methods_per_cycle: *methods_per_cycle,
                hot_fraction: *hot_fraction,
                interval: Duration::from_secs_f64(*interval),
                seed: *seed,
            };
            let stats = workload.run(&cache, &clock, &gc);

            if let Some(path) = perf_map {
                let lines = cache
                    .write_perf_map_file(path)
                    .with_context(|| format!("Failed to write perf map {}", path.display()))?;
                info!("Wrote {} perf map entries", lines);
            }
            print_simulation(cli.output, &cache, &stats)
        }
    }
}

struct Workload {
    cycles: usize,
    methods_per_cycle: usize,
    hot_fraction: f64,
    interval: Duration,
    seed: u64,
}

impl Workload {
    fn run(&self, cache: &CodeCache, clock: &ManualClock, gc: &PendingGc) -> SimulationStats {
        let mut rng = fastrand::Rng::with_seed(self.seed);
        let mut stats = SimulationStats::default();
        let mut next_id = 0usize;

        {
            let mut guard = cache.lock();
            for name in ["call_stub", "i2c_adapter", "c2i_adapter", "deopt_blob"] {
                if let Ok(handle) = guard.allocate(1024, CodeHeapKind::NonMethod) {
                    let spec = if name.ends_with("adapter") {
                        BlobSpec::adapter(name)
                    } else {
                        BlobSpec::stub(name)
                    };
                    if let Err(e) = guard.commit(handle, spec) {
                        debug!("Failed to commit {}: {}", name, e);
                    }
                }
            }
        }

        for cycle in 0..self.cycles {
            for _ in 0..self.methods_per_cycle {
                if !cache.is_compilation_enabled() {
                    break;
                }
                let tier = rng.u8(1..=4);
                let kind = cache.code_kind_for_tier(tier);
                let size = rng.usize(256..16 * 1024);
                let deps: Vec<KlassId> = (0..rng.usize(0..3))
                    .map(|_| KlassId(rng.u64(0..64)))
                    .collect();
                let code: Vec<u8> = (0..size.min(64)).map(|_| rng.u8(..)).collect();

                let mut guard = cache.lock();
                match guard.allocate(size, kind) {
                    Ok(handle) => {
                        let name = format!("m{}::tier{}", next_id, tier);
                        if let Err(e) = guard.install_code(handle, &code) {
                            debug!("Failed to install {}: {}", name, e);
                            stats.install_failures += 1;
                            // still pending, so this only returns the block
                            let _ = guard.free(handle);
                            continue;
                        }
                        match guard.commit(handle, BlobSpec::method(name, deps)) {
                            Ok(_) => {
                                stats.compiled += 1;
                                next_id += 1;
                            }
                            Err(e) => {
                                debug!("Failed to commit method: {}", e);
                                stats.install_failures += 1;
                            }
                        }
                    }
                    Err(_) => stats.allocation_failures += 1,
                }
            }

            if rng.f64() < 0.3 {
                let change = ClassChange::new(KlassId(rng.u64(0..64)), ClassChangeKind::Load);
                if cache.mark_for_deoptimization(&change) > 0 {
                    stats.deoptimized += cache.deoptimize_marked(&Detached).made_not_entrant;
                }
            }

            clock.advance(self.interval);
            if gc.requested.swap(false, Ordering::AcqRel) {
                stats.requested_gcs += 1;
            }
            self.collect(cache, &mut rng, &mut stats);
            debug!("Cycle {} done, cold gc count {}", cycle, cache.cold_gc_count());
        }
        stats
    }

    fn collect(&self, cache: &CodeCache, rng: &mut fastrand::Rng, stats: &mut SimulationStats) {
        cache.on_marking_cycle_start();
        for blob in cache.methods() {
            if rng.f64() < self.hot_fraction {
                cache.mark_as_maybe_on_stack(&blob);
            }
        }
        cache.on_marking_cycle_finish();

        cache.increment_unloading_cycle();
        stats.unloaded += cache.do_unloading(&AllReachable);
        cache.unlink_marked();
        let report = cache.flush_unlinked(&Detached);
        stats.freed_bytes += report.freed_bytes;
        if report.restarted_compilation {
            stats.compiler_restarts += 1;
        }
    }
}

fn print_layout(format: OutputFormat, layout: &HeapLayout) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(layout)?),
        OutputFormat::Pretty => {
            println!(
                "{}: {}K (granularity {}K)",
                "Reserved".cyan().bold(),
                (layout.reserved_size / 1024).to_string().yellow(),
                layout.granularity / 1024
            );
            for placement in layout.placements() {
                println!(
                    "  {:<32} offset={:>8}K size={:>8}K",
                    placement.kind.heap_name().green(),
                    placement.offset / 1024,
                    placement.size / 1024
                );
            }
        }
    }
    Ok(())
}

fn print_simulation(
    format: OutputFormat,
    cache: &CodeCache,
    stats: &SimulationStats,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "simulation": stats,
                "cache": cache.summary(),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Pretty => {
            println!("{}", "Simulation".cyan().bold());
            let value = serde_json::to_value(stats)?;
            if let serde_json::Value::Object(map) = value {
                for (key, val) in map {
                    println!("  {}: {}", key.cyan(), val.to_string().yellow());
                }
            }
            println!("{}", "Code cache".cyan().bold());
            let mut out = Vec::new();
            cache.print_summary(&mut out)?;
            print!("{}", String::from_utf8_lossy(&out));
            let state = if cache.is_compilation_enabled() {
                "enabled".green()
            } else {
                "disabled".red()
            };
            println!("  cold_gc_count={} compiler {}", cache.cold_gc_count(), state);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_accept_suffixes() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("64K"), Ok(64 * 1024));
        assert_eq!(parse_size("48m"), Ok(48 * 1024 * 1024));
        assert_eq!(parse_size("1G"), Ok(1024 * 1024 * 1024));
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("99999999999G").is_err());
        assert!(parse_size(&format!("{}K", usize::MAX)).is_err());
    }

    #[test]
    fn small_workload_runs_to_completion() {
        let config = CodeCacheConfig::default().with_reserved_size(8 * 1024 * 1024);
        let clock = Arc::new(ManualClock::new());
        let gc = Arc::new(PendingGc::default());
        let cache = CodeCache::builder(config)
            .gc_requester(gc.clone())
            .clock(clock.clone())
            .build()
            .unwrap();
        let workload = Workload {
            cycles: 5,
            methods_per_cycle: 50,
            hot_fraction: 0.5,
            interval: Duration::from_secs(1),
            seed: 1,
        };
        let stats = workload.run(&cache, &clock, &gc);
        assert!(stats.compiled > 0);
        assert_eq!(stats.install_failures, 0);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["install_failures"], 0);
        assert_eq!(cache.gc_epoch(), 2 + 2 * 5);
        assert_eq!(cache.adapter_count(), 2);
    }
}
