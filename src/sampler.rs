//! # Sampler — Random Probing for Smaller Solutions
//!
//! Once a solution is known, a sequential scan below it is far too slow to
//! settle whether a smaller one exists. The sampler draws window starts
//! uniformly from a range instead and keeps the smallest solution it hits.
//!
//! The start range is split into buckets of `bucket_width` consecutive
//! starts. A bucket accepts at most `max_per_bucket` samples; draws that
//! land in a full bucket are rejected without counting as an attempt, which
//! spreads the budget evenly over the range. The attempt budget is capped at
//! the total bucket capacity so the loop always ends.
//!
//! Each sample is evaluated with [`count_primes_capped`], which abandons a
//! window as soon as it is certain not to hold exactly 12 primes.
//!
//! Randomness comes from GMP's Mersenne Twister ([`RandState`]). A fixed
//! seed reproduces a run exactly; without one the seed is taken from the
//! clock and logged.

use anyhow::{bail, Result};
use rug::rand::RandState;
use rug::Integer;
use std::collections::HashMap;
use std::fmt;
use tracing::info;

use crate::oracle::PrimalityOracle;
use crate::planner::Range;
use crate::protocol::{EventSink, WorkerEvent};
use crate::searcher::StopFlag;
use crate::window::{count_primes_capped, TARGET_PRIMES, WINDOW_WIDTH};

pub const DEFAULT_BUCKET_WIDTH: u64 = 10_000_000_000;
pub const DEFAULT_MAX_PER_BUCKET: u64 = 10_000;
pub const DEFAULT_MAX_ATTEMPTS: u64 = 1_000_000;
pub const DEFAULT_SAMPLE_PROGRESS_EVERY: u64 = 1000;

#[derive(Clone, Debug)]
pub struct SampleSpec {
    /// Integers the sampled windows must lie in; starts run up to
    /// `high - 2003`.
    pub range: Range,
    pub bucket_width: Integer,
    pub max_per_bucket: u64,
    pub max_attempts: u64,
    /// `None` seeds from the clock.
    pub seed: Option<u64>,
    /// Attempts between progress log lines.
    pub progress_every: u64,
}

impl SampleSpec {
    pub fn new(range: Range) -> Self {
        SampleSpec {
            range,
            bucket_width: Integer::from(DEFAULT_BUCKET_WIDTH),
            max_per_bucket: DEFAULT_MAX_PER_BUCKET,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            seed: None,
            progress_every: DEFAULT_SAMPLE_PROGRESS_EVERY,
        }
    }

    /// Range of window starts whose whole window fits in `range`.
    pub fn start_range(&self) -> Result<Range> {
        let last = Integer::from(&self.range.high - (WINDOW_WIDTH as u32 - 1));
        if last < self.range.low {
            bail!(
                "range {} is narrower than one window of {} integers",
                self.range,
                WINDOW_WIDTH
            );
        }
        Range::new(self.range.low.clone(), last)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Attempt budget spent.
    Completed,
    Stopped,
}

impl fmt::Display for SampleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleOutcome::Completed => write!(f, "completed"),
            SampleOutcome::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SampleReport {
    /// Windows evaluated.
    pub attempts: u64,
    /// Draws rejected because their bucket was full.
    pub rejected: u64,
    pub minimum: Option<Integer>,
    /// Number of sampled windows that held exactly 12 primes.
    pub hits: u64,
    pub seed: u64,
    pub outcome: SampleOutcome,
}

/// Draws window starts and evaluates them until the budget is spent or
/// `stop` is raised. Every hit is emitted as [`WorkerEvent::Solution`].
pub fn sample(
    spec: &SampleSpec,
    oracle: &dyn PrimalityOracle,
    stop: &StopFlag,
    sink: &dyn EventSink,
) -> Result<SampleReport> {
    if spec.bucket_width < 1 {
        bail!("bucket width must be at least 1, got {}", spec.bucket_width);
    }
    if spec.max_per_bucket == 0 {
        bail!("max per bucket must be at least 1");
    }
    let starts = spec.start_range()?;
    let span = starts.len();

    let buckets = (Integer::from(&span + &spec.bucket_width) - 1u32) / &spec.bucket_width;
    let capacity = Integer::from(&buckets * spec.max_per_bucket);
    let budget = capacity
        .to_u64()
        .map_or(spec.max_attempts, |c| c.min(spec.max_attempts));

    let seed = spec.seed.unwrap_or_else(clock_seed);
    let mut rand = RandState::new();
    rand.seed(&Integer::from(seed));
    info!(
        starts = %starts,
        buckets = %buckets,
        budget,
        seed,
        "sampling window starts"
    );

    let progress_every = spec.progress_every.max(1);
    let mut filled: HashMap<Integer, u64> = HashMap::new();
    let mut report = SampleReport {
        attempts: 0,
        rejected: 0,
        minimum: None,
        hits: 0,
        seed,
        outcome: SampleOutcome::Completed,
    };

    while report.attempts < budget {
        if stop.is_requested() {
            report.outcome = SampleOutcome::Stopped;
            break;
        }
        let offset = span.clone().random_below(&mut rand);
        let bucket = Integer::from(&offset / &spec.bucket_width);
        let taken = filled.entry(bucket).or_insert(0);
        if *taken >= spec.max_per_bucket {
            report.rejected += 1;
            continue;
        }
        *taken += 1;
        report.attempts += 1;

        let start = offset + &starts.low;
        if count_primes_capped(oracle, &start) == TARGET_PRIMES {
            report.hits += 1;
            info!(start = %start, attempt = report.attempts, "sampled window holds 12 primes");
            sink.emit(WorkerEvent::Solution(start.clone()));
            if report.minimum.as_ref().map_or(true, |m| start < *m) {
                report.minimum = Some(start);
            }
        }

        if report.attempts % progress_every == 0 {
            info!(
                attempts = report.attempts,
                budget,
                rejected = report.rejected,
                hits = report.hits,
                minimum = %report
                    .minimum
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                "sampling progress"
            );
        }
    }

    info!(
        outcome = %report.outcome,
        attempts = report.attempts,
        rejected = report.rejected,
        hits = report.hits,
        "sampling finished"
    );
    Ok(report)
}

fn clock_seed() -> u64 {
    let now = chrono::Utc::now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros()) as u64
}
