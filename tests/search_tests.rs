//! End-to-end search scenarios.
//!
//! Real windows with exactly 12 primes only appear far beyond anything a test
//! can scan, so most scenarios use a synthetic oracle with solutions planted
//! at known positions. [`HoleOracle`] treats every multiple of 167 as prime
//! (any 2004 consecutive integers hold exactly 12 of them) plus every other
//! integer except those inside "holes" of 2004 integers. A window is then a
//! solution exactly when it coincides with a hole.
//!
//! The scenario over `[1, 10000]` uses the real oracle and compares against a
//! sieve.

use primewindow::checkpoint::{self, CheckpointStore};
use primewindow::orchestrator::{
    Orchestrator, OrchestratorConfig, StopReason, ThreadLauncher, WorkerExit,
};
use primewindow::protocol::MemorySink;
use primewindow::searcher::{SearchSettings, SearchSpec, SegmentSearcher};
use primewindow::sieve;
use primewindow::{
    plan, Direction, MillerRabin, PrimalityOracle, Range, SearchOutcome, StopFlag, TARGET_PRIMES,
    WINDOW_WIDTH,
};
use rug::Integer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct HoleOracle {
    holes: Vec<(Integer, Integer)>,
}

impl HoleOracle {
    /// Hole starts must not be 0 or 1 mod 167 and must lie 2004+ apart.
    fn with_solutions(starts: &[u64]) -> Self {
        for &s in starts {
            assert!(s % 167 > 1, "planted start {} would create neighbours", s);
        }
        HoleOracle {
            holes: starts
                .iter()
                .map(|&s| (Integer::from(s), Integer::from(s + WINDOW_WIDTH as u64 - 1)))
                .collect(),
        }
    }
}

impl PrimalityOracle for HoleOracle {
    fn is_probable_prime(&self, n: &Integer) -> bool {
        n.is_divisible_u(167) || !self.holes.iter().any(|(lo, hi)| n >= lo && n <= hi)
    }
}

/// Delegates to `inner`, raising `stop` once `limit` calls have been made.
struct StopAfter<'a> {
    inner: &'a dyn PrimalityOracle,
    calls: AtomicUsize,
    limit: usize,
    stop: StopFlag,
}

impl PrimalityOracle for StopAfter<'_> {
    fn is_probable_prime(&self, n: &Integer) -> bool {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.limit {
            self.stop.request();
        }
        self.inner.is_probable_prime(n)
    }
}

fn range(low: u64, high: u64) -> Range {
    Range::new(Integer::from(low), Integer::from(high)).unwrap()
}

fn quiet_settings() -> SearchSettings {
    SearchSettings {
        progress_every: 1_000_000,
        ..Default::default()
    }
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval: Duration::from_millis(2),
        grace_period: Duration::from_secs(30),
        max_runtime: None,
        status_interval: None,
        ..Default::default()
    }
}

fn run_segment(oracle: &dyn PrimalityOracle, spec: SearchSpec) -> Vec<Integer> {
    let sink = MemorySink::new();
    SegmentSearcher::new(spec)
        .run(oracle, &StopFlag::new(), &sink)
        .unwrap();
    sink.solutions()
}

#[test]
fn planted_oracle_has_exactly_the_planted_solutions() {
    let oracle = HoleOracle::with_solutions(&[3000]);
    for start in 900u64..5100 {
        let count = primewindow::count_primes(&oracle, &Integer::from(start));
        assert_eq!(count == TARGET_PRIMES, start == 3000, "start={} count={}", start, count);
    }
}

// ── Scenario: brute-force agreement ────────────────────────────

#[test]
fn matches_brute_force_below_10000() {
    let limit = 10_000 + WINDOW_WIDTH as u64;
    let primes = sieve::generate_primes(limit);
    let mut expected = Vec::new();
    for start in 1u64..=10_000 {
        let end = start + WINDOW_WIDTH as u64 - 1;
        let lo = primes.partition_point(|&p| p < start);
        let hi = primes.partition_point(|&p| p <= end);
        if (hi - lo) as u32 == TARGET_PRIMES {
            expected.push(Integer::from(start));
        }
    }

    let segments = plan(&range(1, 10_000), 1, 0).unwrap();
    let launcher = ThreadLauncher::new(Arc::new(MillerRabin::default()), quiet_settings());
    let result = Orchestrator::new(test_config())
        .run(&segments, &launcher, &StopFlag::new())
        .unwrap();

    assert_eq!(result.solutions, expected);
    assert!(result.minimum.is_none());
    assert_eq!(result.stop_reason, None);
    assert_eq!(result.segments[0].exit, WorkerExit::Finished(SearchOutcome::Exhausted));
}

// ── Scenario: solution on a core boundary ───────────────────────

#[test]
fn boundary_solution_found_by_overlapping_segments() {
    let oracle = HoleOracle::with_solutions(&[10_001]);
    let segments = plan(&range(1, 20_000), 4, WINDOW_WIDTH as u64).unwrap();
    assert_eq!(segments[2].core.low, 10_001);

    for segment in &segments {
        let spec = SearchSpec::for_segment(segment, &quiet_settings(), None);
        let found = run_segment(&oracle, spec);
        if segment.search.contains(&Integer::from(10_001)) {
            assert_eq!(found, vec![Integer::from(10_001)], "segment {}", segment.id);
        } else {
            assert!(found.is_empty(), "segment {} found {:?}", segment.id, found);
        }
    }

    let launcher = ThreadLauncher::new(Arc::new(oracle), quiet_settings());
    let result = Orchestrator::new(test_config())
        .run(&segments, &launcher, &StopFlag::new())
        .unwrap();
    assert_eq!(result.minimum, Some(Integer::from(10_001)));
    assert_eq!(result.solutions, vec![Integer::from(10_001)]);
}

#[test]
fn forward_scan_finds_the_same_boundary_solution() {
    let oracle = HoleOracle::with_solutions(&[10_001]);
    let segments = plan(&range(1, 20_000), 4, WINDOW_WIDTH as u64).unwrap();
    let settings = SearchSettings {
        direction: Direction::Forward,
        ..quiet_settings()
    };
    let found: Vec<Integer> = segments
        .iter()
        .flat_map(|s| run_segment(&oracle, SearchSpec::for_segment(s, &settings, None)))
        .collect();
    assert_eq!(found, vec![Integer::from(10_001), Integer::from(10_001)]);
}

// ── Scenario: minimum over concurrent reports ───────────────────

#[test]
fn reports_minimum_of_concurrent_solutions() {
    // Each solution sits at its segment's starting boundary, so both are
    // reported during window initialization regardless of which stops first.
    let oracle = HoleOracle::with_solutions(&[30_000, 60_000]);
    let segments = plan(&range(1, 60_000), 2, 0).unwrap();
    assert_eq!(segments[0].search.high, 30_000);
    assert_eq!(segments[1].search.high, 60_000);

    let launcher = ThreadLauncher::new(Arc::new(oracle), quiet_settings());
    let result = Orchestrator::new(test_config())
        .run(&segments, &launcher, &StopFlag::new())
        .unwrap();

    assert_eq!(result.stop_reason, Some(StopReason::SolutionFound));
    assert_eq!(result.solutions, vec![Integer::from(30_000), Integer::from(60_000)]);
    assert_eq!(result.minimum, Some(Integer::from(30_000)));
}

// ── Scenario: no solution ───────────────────────────────────────

#[test]
fn exhausted_range_reports_no_solution() {
    let segments = plan(&range(1, 8_000), 2, WINDOW_WIDTH as u64).unwrap();
    let launcher = ThreadLauncher::new(Arc::new(MillerRabin::default()), quiet_settings());
    let result = Orchestrator::new(test_config())
        .run(&segments, &launcher, &StopFlag::new())
        .unwrap();

    assert!(result.minimum.is_none());
    assert!(result.solutions.is_empty());
    assert_eq!(result.stop_reason, None);
    assert!(result.failed_launches.is_empty());
    for report in &result.segments {
        assert_eq!(report.solutions_reported, 0);
        assert_eq!(report.exit, WorkerExit::Finished(SearchOutcome::Exhausted));
    }
}

// ── Scenario: interrupt and resume ──────────────────────────────

fn interrupted_then_resumed(oracle: &HoleOracle, interrupt_after: usize) -> Vec<Integer> {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = SearchSpec::new(0, range(1, 16_000));
    spec.progress_every = 1_000_000;
    spec.checkpoint_path = Some(dir.path().join("segment.checkpoint"));

    let stop = StopFlag::new();
    let stopping = StopAfter {
        inner: oracle,
        calls: AtomicUsize::new(0),
        limit: interrupt_after,
        stop: stop.clone(),
    };
    let first = MemorySink::new();
    let outcome = SegmentSearcher::new(spec.clone())
        .run(&stopping, &stop, &first)
        .unwrap();
    assert_eq!(outcome, SearchOutcome::Stopped);

    let second = MemorySink::new();
    let outcome = SegmentSearcher::new(spec)
        .run(oracle, &StopFlag::new(), &second)
        .unwrap();
    assert_eq!(outcome, SearchOutcome::Exhausted);

    let mut all = first.solutions();
    all.extend(second.solutions());
    all
}

#[test]
fn resumed_run_matches_uninterrupted_run() {
    let oracle = HoleOracle::with_solutions(&[5_000, 9_000, 14_000]);
    let mut spec = SearchSpec::new(0, range(1, 16_000));
    spec.progress_every = 1_000_000;
    let reference = run_segment(&oracle, spec);
    assert_eq!(
        reference,
        vec![Integer::from(14_000), Integer::from(9_000), Integer::from(5_000)]
    );

    // Interrupt between solutions, exactly on one, and one step before one.
    for steps in [4_000usize, 7_000, 6_999] {
        assert_eq!(
            interrupted_then_resumed(&oracle, WINDOW_WIDTH + steps),
            reference,
            "interrupted after {} steps",
            steps
        );
    }
}

#[test]
fn orchestrated_rerun_skips_completed_segments() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::open(dir.path()).unwrap();
    let segments = plan(&range(1, 6_000), 2, 0).unwrap();
    let launcher = ThreadLauncher::new(Arc::new(MillerRabin::default()), quiet_settings())
        .with_checkpoints(store.clone());

    let first = Orchestrator::new(test_config())
        .run(&segments, &launcher, &StopFlag::new())
        .unwrap();
    assert!(first.minimum.is_none());
    for segment in &segments {
        let record = checkpoint::load(&store.path_for(segment.id)).unwrap();
        assert!(record.completed);
        assert_eq!(record.current_start, segment.search.low.to_string());
    }

    let second = Orchestrator::new(test_config())
        .run(&segments, &launcher, &StopFlag::new())
        .unwrap();
    assert!(second.minimum.is_none());
    assert!(second.segments.iter().all(|s| s.last_position.is_none()));
}

#[test]
fn operator_interrupt_stops_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::open(dir.path()).unwrap();
    let segments = plan(&range(10u64.pow(12), 10u64.pow(12) + 20_000_000), 2, 0).unwrap();
    let launcher = ThreadLauncher::new(Arc::new(MillerRabin::default()), quiet_settings())
        .with_checkpoints(store.clone());

    let interrupt = StopFlag::new();
    let trigger = interrupt.clone();
    let timer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        trigger.request();
    });
    let result = Orchestrator::new(test_config())
        .run(&segments, &launcher, &interrupt)
        .unwrap();
    timer.join().unwrap();

    assert_eq!(result.stop_reason, Some(StopReason::Interrupted));
    for report in &result.segments {
        assert_eq!(report.exit, WorkerExit::Finished(SearchOutcome::Stopped));
        let record = store.load(report.segment_id).unwrap();
        assert!(!record.completed);
        assert!(record.window().is_ok());
    }
}
