//! # Main — CLI Entry Point
//!
//! Routes subcommands to the execution functions in `cli.rs` and sets up the
//! shared concerns: `.env` loading, structured logging, and the Rayon pool.
//!
//! ## Subcommands
//!
//! - `run`: plan segments and search them in parallel; prints `RESULT:<n>`
//!   (the smallest solution found) or `RESULT:none` on stdout.
//! - `worker`: search one segment, speaking the line protocol on stdout.
//!   Started by `run --mode process`; rarely invoked by hand.
//! - `scan`: open-ended descending search with a consecutive-failure budget.
//! - `sample`: draw window starts at random, bucketed over the range, and
//!   print the smallest solution hit as `RESULT:<n>` or `RESULT:none`.
//! - `plan`: print the segment layout for a configuration as JSON.
//! - `inspect`: count and list the primes of one window.
//!
//! ## Global Options
//!
//! - `--log-format` / `LOG_FORMAT`: `json` for structured logs, otherwise text.
//!   Logs always go to stderr; stdout is reserved for results and protocol lines.
//! - `--mr-rounds`: Miller–Rabin rounds for candidates of 64 bits and more.
//! - `--threads`: Rayon thread pool size (defaults to all cores).

mod cli;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use primewindow::config::WorkerMode;
use primewindow::sampler::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_PER_BUCKET, DEFAULT_SAMPLE_PROGRESS_EVERY,
};
use primewindow::searcher::DEFAULT_PROGRESS_EVERY;
use primewindow::window::Direction;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "primewindow",
    about = "Search for windows of 2004 consecutive integers containing exactly 12 primes"
)]
struct Cli {
    /// Log format: "json" or "text"
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: String,

    /// Miller-Rabin rounds for candidates of 64 bits and more (default 25, or the run file's value)
    #[arg(long)]
    mr_rounds: Option<u32>,

    /// Number of rayon worker threads (defaults to all logical cores)
    #[arg(long)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

/// Range and segmentation, from a run file and/or flags (flags win).
#[derive(Args)]
struct LayoutArgs {
    /// TOML run file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Lowest window start, e.g. 1000 or "10^15+1"
    #[arg(long, allow_hyphen_values = true)]
    low: Option<String>,
    /// Highest window start
    #[arg(long, allow_hyphen_values = true)]
    high: Option<String>,
    /// Number of segments
    #[arg(long)]
    segments: Option<u32>,
    /// Starts added to each side of a core range
    #[arg(long)]
    overlap: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Search a range with parallel segment workers
    Run {
        #[command(flatten)]
        layout: LayoutArgs,
        /// Directory for per-segment checkpoints
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
        /// Do not read or write checkpoints
        #[arg(long, conflicts_with = "checkpoint_dir")]
        no_checkpoint: bool,
        /// Seconds between periodic checkpoints
        #[arg(long)]
        checkpoint_interval: Option<u64>,
        /// Scan direction within each segment
        #[arg(long, value_enum)]
        direction: Option<Direction>,
        /// Stop a segment after this many consecutive windows without a solution
        #[arg(long)]
        max_fails: Option<u64>,
        /// Run segments as threads or as child processes
        #[arg(long, value_enum)]
        mode: Option<WorkerMode>,
        /// Seconds workers get to stop before being killed
        #[arg(long)]
        grace_period: Option<u64>,
        /// Stop the whole run after this many seconds
        #[arg(long)]
        max_runtime: Option<u64>,
    },
    /// Search one segment and report on stdout (used by `run --mode process`)
    Worker {
        #[arg(long)]
        segment_id: u32,
        /// Lowest window start of the search range
        #[arg(long, allow_hyphen_values = true)]
        start: String,
        /// Highest window start of the search range
        #[arg(long, allow_hyphen_values = true)]
        end: String,
        /// Checkpoint file for this segment
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        #[arg(long, default_value_t = 60)]
        checkpoint_interval: u64,
        #[arg(long, value_enum, default_value_t = Direction::Backward)]
        direction: Direction,
        #[arg(long)]
        max_fails: Option<u64>,
        #[arg(long, default_value_t = DEFAULT_PROGRESS_EVERY)]
        progress_every: u64,
    },
    /// Scan downward from a start until the failure budget runs out
    Scan {
        /// First window start, e.g. "10^24"
        #[arg(long)]
        from: String,
        /// Lowest window start to consider
        #[arg(long, default_value = "2")]
        to: String,
        /// Consecutive windows without a solution before giving up
        #[arg(long, default_value_t = 1_000_000)]
        max_fails: u64,
        /// Checkpoint file for resuming the scan
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        #[arg(long, default_value_t = 60)]
        checkpoint_interval: u64,
        #[arg(long, default_value_t = DEFAULT_PROGRESS_EVERY)]
        progress_every: u64,
    },
    /// Evaluate randomly drawn windows in a range, keeping the smallest solution
    Sample {
        /// Lowest integer a sampled window may cover
        #[arg(long, allow_hyphen_values = true)]
        low: String,
        /// Highest integer a sampled window may cover
        #[arg(long, allow_hyphen_values = true)]
        high: String,
        /// Window starts per bucket, e.g. "10^10"
        #[arg(long, default_value = "10^10")]
        bucket_width: String,
        /// Samples accepted per bucket
        #[arg(long, default_value_t = DEFAULT_MAX_PER_BUCKET)]
        max_per_bucket: u64,
        /// Windows to evaluate in total
        #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
        max_attempts: u64,
        /// Seed for a reproducible run
        #[arg(long)]
        seed: Option<u64>,
        /// Attempts between progress log lines
        #[arg(long, default_value_t = DEFAULT_SAMPLE_PROGRESS_EVERY)]
        progress_every: u64,
    },
    /// Print the segment layout as JSON
    Plan {
        #[command(flatten)]
        layout: LayoutArgs,
    },
    /// Count the primes in the window starting at a given integer
    Inspect {
        /// Window start
        start: String,
        /// Also list the offsets of the primes
        #[arg(long)]
        offsets: bool,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // LOG_FORMAT=json for log shippers, human-readable otherwise; stderr either way
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    cli::configure_rayon(cli.threads);

    match &cli.command {
        Commands::Run { .. } => cli::run_search(&cli),
        Commands::Worker { .. } => {
            let outcome = cli::run_worker(&cli)?;
            std::process::exit(outcome.exit_code());
        }
        Commands::Scan { .. } => cli::run_scan(&cli),
        Commands::Sample { .. } => cli::run_sample(&cli),
        Commands::Plan { layout } => cli::run_plan(layout),
        Commands::Inspect { start, offsets } => cli::run_inspect(&cli, start, *offsets),
    }
}
