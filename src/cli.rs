//! # CLI Execution Functions
//!
//! Kept out of `main.rs` so the entry point stays a thin router. Contains the
//! execution logic for each subcommand, operator signal handling, and Rayon
//! configuration.

use anyhow::{Context, Result};
use primewindow::checkpoint::CheckpointStore;
use primewindow::config::{self, parse_bound, RunConfig, WorkerMode};
use primewindow::oracle::{MillerRabin, PrimalityOracle, DEFAULT_MR_ROUNDS};
use primewindow::orchestrator::{Orchestrator, ThreadLauncher, WorkerLauncher};
use primewindow::planner::Range;
use primewindow::process::ProcessLauncher;
use primewindow::protocol::{EventSink, StdoutSink, WorkerEvent};
use primewindow::sampler::{self, SampleSpec};
use primewindow::searcher::{SearchOutcome, SearchSpec, SegmentSearcher, StopFlag};
use primewindow::window::{count_primes, Direction, SlidingWindow, WINDOW_WIDTH};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{Cli, Commands, LayoutArgs};

// ── Run ─────────────────────────────────────────────────────────

/// Orchestrated search over all segments. Prints `RESULT:<n>` or `RESULT:none`.
pub fn run_search(cli: &Cli) -> Result<()> {
    let Commands::Run {
        layout,
        checkpoint_dir,
        no_checkpoint,
        checkpoint_interval,
        direction,
        max_fails,
        mode,
        grace_period,
        max_runtime,
    } = &cli.command
    else {
        unreachable!("run_search called for another subcommand");
    };

    let mut config = load_layout(layout)?;
    if let Some(dir) = checkpoint_dir {
        config.checkpoint.dir = Some(dir.clone());
    }
    if *no_checkpoint {
        config.checkpoint.dir = None;
    }
    if let Some(secs) = checkpoint_interval {
        config.checkpoint.interval_secs = *secs;
    }
    if let Some(d) = direction {
        config.search.direction = *d;
    }
    if max_fails.is_some() {
        config.search.max_consecutive_fails = *max_fails;
    }
    if let Some(m) = mode {
        config.orchestrator.mode = *m;
    }
    if let Some(secs) = grace_period {
        config.orchestrator.grace_period_secs = *secs;
    }
    if max_runtime.is_some() {
        config.orchestrator.max_runtime_secs = *max_runtime;
    }
    if let Some(rounds) = cli.mr_rounds {
        config.search.mr_rounds = rounds;
    }
    config::validate_config(&config)?;

    let segments = config.plan()?;
    let range = config.total_range()?;
    info!(
        range = %range,
        segments = segments.len(),
        overlap = config.segments.overlap,
        direction = %config.search.direction,
        mode = %config.orchestrator.mode,
        mr_rounds = config.search.mr_rounds,
        cores = rayon::current_num_threads(),
        "primewindow starting"
    );

    let store = config
        .checkpoint
        .dir
        .as_ref()
        .map(CheckpointStore::open)
        .transpose()?;
    let settings = config.search_settings();

    let launcher: Box<dyn WorkerLauncher> = match config.orchestrator.mode {
        WorkerMode::Thread => {
            let oracle: Arc<dyn PrimalityOracle> =
                Arc::new(MillerRabin::new(config.search.mr_rounds));
            let launcher = ThreadLauncher::new(oracle, settings);
            Box::new(match store {
                Some(store) => launcher.with_checkpoints(store),
                None => launcher,
            })
        }
        WorkerMode::Process => {
            let launcher = ProcessLauncher::current_exe(settings, config.search.mr_rounds)?;
            Box::new(match store {
                Some(store) => launcher.with_checkpoints(store),
                None => launcher,
            })
        }
    };

    let interrupt = StopFlag::new();
    install_signal_handler(interrupt.clone())?;

    let result = Orchestrator::new(config.orchestrator_config()).run(
        &segments,
        launcher.as_ref(),
        &interrupt,
    )?;

    for report in &result.segments {
        info!(
            segment = report.segment_id,
            exit = %report.exit,
            solutions = report.solutions_reported,
            position = %report
                .last_position
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            "segment summary"
        );
    }
    if !result.failed_launches.is_empty() {
        warn!(segments = ?result.failed_launches, "some segments never started");
    }

    match &result.minimum {
        Some(m) => println!("RESULT:{}", m),
        None => println!("RESULT:none"),
    }
    Ok(())
}

fn load_layout(layout: &LayoutArgs) -> Result<RunConfig> {
    let mut config = match &layout.config {
        Some(path) => config::parse_toml_file(path)?,
        None => RunConfig::default(),
    };
    if let Some(low) = &layout.low {
        config.range.low = low.clone();
    }
    if let Some(high) = &layout.high {
        config.range.high = high.clone();
    }
    if let Some(count) = layout.segments {
        config.segments.count = count;
    }
    if let Some(overlap) = layout.overlap {
        config.segments.overlap = overlap;
    }
    Ok(config)
}

// ── Worker ──────────────────────────────────────────────────────

/// One segment, reporting on stdout in the line protocol.
pub fn run_worker(cli: &Cli) -> Result<SearchOutcome> {
    let Commands::Worker {
        segment_id,
        start,
        end,
        checkpoint,
        checkpoint_interval,
        direction,
        max_fails,
        progress_every,
    } = &cli.command
    else {
        unreachable!("run_worker called for another subcommand");
    };

    let range = Range::new(
        parse_bound(start).context("--start")?,
        parse_bound(end).context("--end")?,
    )?;
    let mut spec = SearchSpec::new(*segment_id, range);
    spec.direction = *direction;
    spec.checkpoint_path = checkpoint.clone();
    spec.checkpoint_interval = Duration::from_secs(*checkpoint_interval);
    spec.progress_every = *progress_every;
    spec.max_consecutive_fails = *max_fails;

    let oracle = MillerRabin::new(cli.mr_rounds.unwrap_or(DEFAULT_MR_ROUNDS));
    let stop = StopFlag::new();
    install_signal_handler(stop.clone())?;
    // The supervisor holds back SIGTERM until it has seen this line.
    StdoutSink.emit(WorkerEvent::Info(format!("worker {} ready", segment_id)));

    info!(segment = segment_id, range = %spec.range, direction = %spec.direction, "worker starting");
    SegmentSearcher::new(spec).run(&oracle, &stop, &StdoutSink)
}

// ── Scan ────────────────────────────────────────────────────────

/// Prints each solution with its prime offsets as soon as it is reported.
struct ScanReporter<'a> {
    oracle: &'a dyn PrimalityOracle,
}

impl EventSink for ScanReporter<'_> {
    fn emit(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Solution(start) => {
                let window = SlidingWindow::initialize(self.oracle, start.clone());
                let offsets: Vec<String> =
                    window.prime_offsets().iter().map(|o| o.to_string()).collect();
                println!("{} offsets: {}", start, offsets.join(" "));
            }
            WorkerEvent::Progress(position) => info!(position = %position, "scan progress"),
            WorkerEvent::Info(text) => info!("{}", text),
        }
    }
}

/// Open-ended descending search from `--from`, bounded by a failure budget.
pub fn run_scan(cli: &Cli) -> Result<()> {
    let Commands::Scan {
        from,
        to,
        max_fails,
        checkpoint,
        checkpoint_interval,
        progress_every,
    } = &cli.command
    else {
        unreachable!("run_scan called for another subcommand");
    };

    let range = Range::new(
        parse_bound(to).context("--to")?,
        parse_bound(from).context("--from")?,
    )?;
    let mut spec = SearchSpec::new(0, range);
    spec.direction = Direction::Backward;
    spec.checkpoint_path = checkpoint.clone();
    spec.checkpoint_interval = Duration::from_secs(*checkpoint_interval);
    spec.progress_every = *progress_every;
    spec.max_consecutive_fails = Some(*max_fails);

    let oracle = MillerRabin::new(cli.mr_rounds.unwrap_or(DEFAULT_MR_ROUNDS));
    let stop = StopFlag::new();
    install_signal_handler(stop.clone())?;

    let reporter = ScanReporter { oracle: &oracle };
    let mut searcher = SegmentSearcher::new(spec);
    let outcome = searcher.run(&oracle, &stop, &reporter)?;
    info!(
        outcome = %outcome,
        solutions = searcher.solutions_found(),
        windows = searcher.windows_scanned(),
        "scan finished"
    );
    Ok(())
}

// ── Sample ──────────────────────────────────────────────────────

/// Logs each hit; the minimum is printed once sampling ends.
struct SampleReporter;

impl EventSink for SampleReporter {
    fn emit(&self, event: WorkerEvent) {
        if let WorkerEvent::Solution(start) = event {
            info!(start = %start, "solution sampled");
        }
    }
}

/// Random-start search. Prints `RESULT:<n>` or `RESULT:none`.
pub fn run_sample(cli: &Cli) -> Result<()> {
    let Commands::Sample {
        low,
        high,
        bucket_width,
        max_per_bucket,
        max_attempts,
        seed,
        progress_every,
    } = &cli.command
    else {
        unreachable!("run_sample called for another subcommand");
    };

    let range = Range::new(
        parse_bound(low).context("--low")?,
        parse_bound(high).context("--high")?,
    )?;
    let mut spec = SampleSpec::new(range);
    spec.bucket_width = parse_bound(bucket_width).context("--bucket-width")?;
    spec.max_per_bucket = *max_per_bucket;
    spec.max_attempts = *max_attempts;
    spec.seed = *seed;
    spec.progress_every = *progress_every;

    let oracle = MillerRabin::new(cli.mr_rounds.unwrap_or(DEFAULT_MR_ROUNDS));
    let stop = StopFlag::new();
    install_signal_handler(stop.clone())?;

    let report = sampler::sample(&spec, &oracle, &stop, &SampleReporter)?;
    info!(seed = report.seed, attempts = report.attempts, hits = report.hits, "sample summary");
    match &report.minimum {
        Some(m) => println!("RESULT:{}", m),
        None => println!("RESULT:none"),
    }
    Ok(())
}

// ── Plan / Inspect ──────────────────────────────────────────────

pub fn run_plan(layout: &LayoutArgs) -> Result<()> {
    let config = load_layout(layout)?;
    config::validate_config(&config)?;
    let segments = config.plan()?;
    println!("{}", serde_json::to_string_pretty(&segments)?);
    Ok(())
}

pub fn run_inspect(cli: &Cli, start: &str, offsets: bool) -> Result<()> {
    let start = parse_bound(start).context("window start")?;
    let oracle = MillerRabin::new(cli.mr_rounds.unwrap_or(DEFAULT_MR_ROUNDS));
    let end = rug::Integer::from(&start + (WINDOW_WIDTH - 1) as u32);

    let count = if offsets {
        let window = SlidingWindow::initialize(&oracle, start.clone());
        let list: Vec<String> = window.prime_offsets().iter().map(|o| o.to_string()).collect();
        println!("offsets: {}", list.join(" "));
        window.count()
    } else {
        count_primes(&oracle, &start)
    };
    println!("window: [{}, {}]", start, end);
    println!("primes: {}", count);
    println!(
        "solution: {}",
        if count == primewindow::TARGET_PRIMES { "yes" } else { "no" }
    );
    Ok(())
}

// ── Signals ─────────────────────────────────────────────────────

/// Raise `stop` on SIGINT or SIGTERM.
///
/// Both handlers are registered before this returns; only the wait for a
/// signal happens on the background thread.
fn install_signal_handler(stop: StopFlag) -> Result<()> {
    let sig_rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting signal handler runtime")?;

    #[cfg(unix)]
    let (mut interrupt, mut terminate) = {
        use tokio::signal::unix::{signal, SignalKind};
        let _guard = sig_rt.enter();
        (
            signal(SignalKind::interrupt()).context("registering SIGINT handler")?,
            signal(SignalKind::terminate()).context("registering SIGTERM handler")?,
        )
    };
    #[cfg(not(unix))]
    let mut ctrl_c = {
        let _guard = sig_rt.enter();
        tokio::signal::windows::ctrl_c().context("registering Ctrl-C handler")?
    };

    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            sig_rt.block_on(async {
                #[cfg(unix)]
                tokio::select! {
                    _ = interrupt.recv() => {},
                    _ = terminate.recv() => {},
                }
                #[cfg(not(unix))]
                let _ = ctrl_c.recv().await;
            });
            info!("stop requested by operator");
            stop.request();
        })
        .context("spawning signal handler thread")?;
    Ok(())
}

// ── Rayon Configuration ─────────────────────────────────────────

/// Configure the rayon global thread pool size.
pub fn configure_rayon(threads: Option<usize>) {
    let num_threads = threads.unwrap_or(0);
    if num_threads > 0 {
        if let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build_global()
        {
            warn!(error = %e, "Could not configure rayon thread pool");
        }
    }
}
