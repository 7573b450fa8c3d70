//! CLI entrypoint for the HPHA workload harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hpha::{DebugHphaAllocator, DebugPolicy, Hpha, HphaAllocator, HphaConfig};
use hpha_harness::{ChurnOptions, HarnessError, Outcome, RunReport, StressOptions, logger, workload};

/// Drive the HPHA allocator through canned workloads.
#[derive(Debug, Parser)]
#[command(name = "hpha-harness")]
#[command(about = "Workload driver and JSON reports for the HPHA allocator")]
struct Cli {
    /// Use the debug allocator (guard bytes, live-allocation registry).
    #[arg(long, global = true)]
    debug: bool,
    /// Capture a call stack per allocation (debug allocator only).
    #[arg(long, global = true)]
    stacks: bool,
    /// Route every request to the tree.
    #[arg(long, global = true)]
    no_pool: bool,
    /// More log output; repeat for debug and trace. `HPHA_LOG` overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Output JSON path (if omitted, prints to stdout).
    #[arg(long, global = true)]
    output: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Random alloc/free from several threads, then verify the counters.
    Stress {
        #[arg(long, default_value_t = 8)]
        threads: usize,
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Largest request in bytes.
        #[arg(long, default_value_t = 2_048)]
        max_size: usize,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0x12345678")]
        seed: String,
    },
    /// Tree alloc/free/realloc churn with an accounting check after every step.
    Churn {
        #[arg(long, default_value_t = 2_000)]
        steps: usize,
        /// Largest request in bytes.
        #[arg(long, default_value_t = 65_536)]
        max_size: usize,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xC0A1E5CE")]
        seed: String,
    },
    /// Print the effective configuration and a snapshot of an idle heap.
    Report,
}

fn parse_seed(raw: &str) -> Result<u64, HarnessError> {
    let cleaned = raw.trim().replace('_', "");
    let parsed = match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse::<u64>(),
    };
    parsed.map_err(|err| HarnessError::InvalidOption(format!("seed {raw:?}: {err}")))
}

fn run<D: DebugPolicy>(heap: &Hpha<D>, command: &Command) -> Result<RunReport, HarnessError> {
    match command {
        Command::Stress {
            threads,
            ops,
            max_size,
            seed,
        } => {
            let options = StressOptions {
                threads: *threads,
                ops_per_thread: *ops,
                max_size: *max_size,
                seed: parse_seed(seed)?,
            };
            let outcome = workload::run_stress(heap, &options)?;
            Ok(RunReport::new("stress", heap, Outcome::Stress(outcome)))
        }
        Command::Churn { steps, max_size, seed } => {
            let options = ChurnOptions {
                steps: *steps,
                max_size: *max_size,
                seed: parse_seed(seed)?,
            };
            let outcome = workload::run_churn(heap, &options)?;
            Ok(RunReport::new("churn", heap, Outcome::Churn(outcome)))
        }
        Command::Report => {
            let snapshot = heap.snapshot();
            Ok(RunReport::new("report", heap, Outcome::Report { snapshot }))
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logger::init(logger::level_for(cli.verbose))?;

    let mut config = HphaConfig::from_env()?;
    if cli.no_pool {
        config.enable_pool_allocations = false;
    }
    config.capture_call_stacks = cli.stacks;

    let report = if cli.debug {
        let heap = DebugHphaAllocator::with_config(config)?;
        let report = run(&heap, &cli.command)?;
        heap.check();
        report
    } else {
        let heap = HphaAllocator::with_config(config)?;
        run(&heap, &cli.command)?
    };
    report.write(cli.output.as_deref())?;
    Ok(())
}
