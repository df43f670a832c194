//! # Searcher — Scanning One Segment
//!
//! A [`SegmentSearcher`] walks the window start across its search range one
//! position at a time, reporting every window that holds exactly 12 primes.
//! It owns its [`SlidingWindow`] exclusively and talks to the outside world
//! through two narrow seams: an [`EventSink`] for reports and a read-only
//! [`StopFlag`] for cancellation.
//!
//! ## Lifecycle
//!
//! ```text
//! Starting ──► InitializingWindow ──► Scanning ──► Stopping ──► Stopped
//!     └──────── (valid checkpoint) ──────┘
//! ```
//!
//! A fresh searcher evaluates the window at the starting boundary (the high
//! end when scanning backward, the low end when scanning forward) and reports
//! it if it is a solution. A searcher resumed from a checkpoint picks up at
//! the saved window without re-reporting it.
//!
//! ## Outcomes
//!
//! | Outcome | Cause | Checkpoint |
//! |---------|-------|------------|
//! | `Stopped` | stop flag observed | final record flushed |
//! | `Exhausted` | last window of the range evaluated | marked `completed` |
//! | `BudgetExceeded` | too many consecutive non-solutions | final record flushed |
//!
//! An oracle panic aborts the scan: the window, which is still at its last
//! consistent position, is checkpointed and an error is returned.

use anyhow::{anyhow, Result};
use rug::Integer;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::checkpoint::{self, CheckpointRecord, CheckpointStore};
use crate::oracle::PrimalityOracle;
use crate::planner::{Range, Segment};
use crate::protocol::{EventSink, WorkerEvent};
use crate::window::{Direction, SlidingWindow};

/// Default wall-clock interval between periodic checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of windows between progress reports.
pub const DEFAULT_PROGRESS_EVERY: u64 = 100_000;

/// Cooperative cancellation signal. Cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearcherState {
    Starting,
    InitializingWindow,
    Scanning,
    Stopping,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchOutcome {
    Stopped,
    Exhausted,
    BudgetExceeded,
}

impl SearchOutcome {
    /// Process exit code a `worker` subprocess uses for this outcome.
    pub fn exit_code(self) -> i32 {
        match self {
            SearchOutcome::Exhausted => 0,
            SearchOutcome::Stopped => 10,
            SearchOutcome::BudgetExceeded => 11,
        }
    }

    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(SearchOutcome::Exhausted),
            10 => Some(SearchOutcome::Stopped),
            11 => Some(SearchOutcome::BudgetExceeded),
            _ => None,
        }
    }
}

impl fmt::Display for SearchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchOutcome::Stopped => write!(f, "stopped"),
            SearchOutcome::Exhausted => write!(f, "exhausted"),
            SearchOutcome::BudgetExceeded => write!(f, "budget exceeded"),
        }
    }
}

/// Knobs shared by every segment of a run.
#[derive(Clone, Debug)]
pub struct SearchSettings {
    pub direction: Direction,
    pub checkpoint_interval: Duration,
    pub progress_every: u64,
    pub max_consecutive_fails: Option<u64>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        SearchSettings {
            direction: Direction::default(),
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            progress_every: DEFAULT_PROGRESS_EVERY,
            max_consecutive_fails: None,
        }
    }
}

/// Everything one searcher needs to know about its assignment.
#[derive(Clone, Debug)]
pub struct SearchSpec {
    pub segment_id: u32,
    /// Inclusive range of window starts to evaluate.
    pub range: Range,
    pub direction: Direction,
    pub checkpoint_path: Option<PathBuf>,
    /// `Duration::ZERO` checkpoints after every step.
    pub checkpoint_interval: Duration,
    pub progress_every: u64,
    pub max_consecutive_fails: Option<u64>,
}

impl SearchSpec {
    pub fn new(segment_id: u32, range: Range) -> Self {
        Self::with_settings(segment_id, range, &SearchSettings::default())
    }

    pub fn with_settings(segment_id: u32, range: Range, settings: &SearchSettings) -> Self {
        SearchSpec {
            segment_id,
            range,
            direction: settings.direction,
            checkpoint_path: None,
            checkpoint_interval: settings.checkpoint_interval,
            progress_every: settings.progress_every,
            max_consecutive_fails: settings.max_consecutive_fails,
        }
    }

    /// Spec for a planned segment: scans its search range, checkpoints into `store`.
    pub fn for_segment(
        segment: &Segment,
        settings: &SearchSettings,
        store: Option<&CheckpointStore>,
    ) -> Self {
        let mut spec = Self::with_settings(segment.id, segment.search.clone(), settings);
        spec.checkpoint_path = store.map(|s| s.path_for(segment.id));
        spec
    }

    /// Window start the scan begins from.
    fn first_start(&self) -> &Integer {
        match self.direction {
            Direction::Backward => &self.range.high,
            Direction::Forward => &self.range.low,
        }
    }

    /// Window start the scan ends at.
    fn last_start(&self) -> &Integer {
        match self.direction {
            Direction::Backward => &self.range.low,
            Direction::Forward => &self.range.high,
        }
    }
}

pub struct SegmentSearcher {
    spec: SearchSpec,
    state: SearcherState,
    consecutive_fails: u64,
    windows_scanned: u64,
    solutions_found: u64,
    position: Option<Integer>,
}

impl SegmentSearcher {
    pub fn new(spec: SearchSpec) -> Self {
        SegmentSearcher {
            spec,
            state: SearcherState::Starting,
            consecutive_fails: 0,
            windows_scanned: 0,
            solutions_found: 0,
            position: None,
        }
    }

    pub fn spec(&self) -> &SearchSpec {
        &self.spec
    }

    pub fn state(&self) -> SearcherState {
        self.state
    }

    /// Windows evaluated so far, including those before a resume.
    pub fn windows_scanned(&self) -> u64 {
        self.windows_scanned
    }

    /// Solutions reported by this run (a resumed run starts from zero).
    pub fn solutions_found(&self) -> u64 {
        self.solutions_found
    }

    /// Start of the most recently evaluated window.
    pub fn position(&self) -> Option<&Integer> {
        self.position.as_ref()
    }

    /// Scan until the range is exhausted, the stop flag is raised, or the
    /// consecutive-failure budget runs out.
    pub fn run(
        &mut self,
        oracle: &dyn PrimalityOracle,
        stop: &StopFlag,
        sink: &dyn EventSink,
    ) -> Result<SearchOutcome> {
        self.transition(SearcherState::Starting);

        let mut window = match self.resume() {
            Resume::Completed => {
                info!(segment = self.spec.segment_id, "segment already completed, nothing to do");
                self.transition(SearcherState::Stopped);
                return Ok(SearchOutcome::Exhausted);
            }
            Resume::From(window) => {
                info!(
                    segment = self.spec.segment_id,
                    start = %window.start(),
                    windows_scanned = self.windows_scanned,
                    "resuming from checkpoint"
                );
                window
            }
            Resume::Fresh => {
                self.transition(SearcherState::InitializingWindow);
                let start = self.spec.first_start().clone();
                let window = panic::catch_unwind(AssertUnwindSafe(|| {
                    SlidingWindow::initialize(oracle, start.clone())
                }))
                .map_err(|payload| {
                    anyhow!(
                        "oracle panicked while initializing window at {}: {}",
                        start,
                        panic_message(&*payload)
                    )
                })?;
                self.windows_scanned += 1;
                self.record(&window, sink);
                self.checkpoint(&window, false, sink);
                window
            }
        };
        self.position = Some(window.start().clone());

        self.transition(SearcherState::Scanning);
        let progress_every = self.spec.progress_every.max(1);
        let mut last_checkpoint = Instant::now();

        let outcome = loop {
            if stop.is_requested() {
                break SearchOutcome::Stopped;
            }
            if window.start() == self.spec.last_start() {
                break SearchOutcome::Exhausted;
            }
            if let Some(budget) = self.spec.max_consecutive_fails {
                if self.consecutive_fails >= budget {
                    info!(
                        segment = self.spec.segment_id,
                        start = %window.start(),
                        budget,
                        "consecutive-failure budget exhausted"
                    );
                    break SearchOutcome::BudgetExceeded;
                }
            }

            let step = panic::catch_unwind(AssertUnwindSafe(|| {
                window.advance(oracle, self.spec.direction)
            }));
            if let Err(payload) = step {
                let message = panic_message(&*payload);
                warn!(
                    segment = self.spec.segment_id,
                    start = %window.start(),
                    error = %message,
                    "oracle panicked, saving last consistent window"
                );
                self.checkpoint(&window, false, sink);
                self.transition(SearcherState::Stopped);
                return Err(anyhow!(
                    "segment {}: oracle panicked next to window {}: {}",
                    self.spec.segment_id,
                    window.start(),
                    message
                ));
            }

            self.windows_scanned += 1;
            self.position = Some(window.start().clone());
            self.record(&window, sink);

            if self.windows_scanned % progress_every == 0 {
                sink.emit(WorkerEvent::Progress(window.start().clone()));
            }
            if last_checkpoint.elapsed() >= self.spec.checkpoint_interval {
                self.checkpoint(&window, false, sink);
                last_checkpoint = Instant::now();
            }
        };

        self.transition(SearcherState::Stopping);
        self.checkpoint(&window, outcome == SearchOutcome::Exhausted, sink);
        self.transition(SearcherState::Stopped);
        info!(
            segment = self.spec.segment_id,
            outcome = %outcome,
            position = %window.start(),
            windows_scanned = self.windows_scanned,
            solutions = self.solutions_found,
            "segment search finished"
        );
        Ok(outcome)
    }

    fn resume(&mut self) -> Resume {
        let Some(path) = &self.spec.checkpoint_path else {
            return Resume::Fresh;
        };
        let Some(record) = checkpoint::load(path) else {
            return Resume::Fresh;
        };
        if !record.belongs_to(self.spec.segment_id, self.spec.direction, &self.spec.range) {
            warn!(
                path = %path.display(),
                segment = self.spec.segment_id,
                "checkpoint belongs to a different segment, direction or range; starting fresh"
            );
            return Resume::Fresh;
        }
        if record.completed {
            return Resume::Completed;
        }
        let window = match record.window() {
            Ok(w) => w,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "checkpoint window unusable; starting fresh");
                return Resume::Fresh;
            }
        };
        if !self.spec.range.contains(window.start()) {
            warn!(
                path = %path.display(),
                start = %window.start(),
                "checkpoint position outside search range; starting fresh"
            );
            return Resume::Fresh;
        }
        self.consecutive_fails = record.consecutive_fails;
        self.windows_scanned = record.windows_scanned;
        Resume::From(window)
    }

    /// Report the freshly evaluated window and update the failure streak.
    fn record(&mut self, window: &SlidingWindow, sink: &dyn EventSink) {
        if window.is_solution() {
            info!(
                segment = self.spec.segment_id,
                start = %window.start(),
                "window with exactly 12 primes"
            );
            sink.emit(WorkerEvent::Solution(window.start().clone()));
            self.solutions_found += 1;
            self.consecutive_fails = 0;
        } else {
            self.consecutive_fails += 1;
        }
    }

    fn checkpoint(&self, window: &SlidingWindow, completed: bool, sink: &dyn EventSink) {
        let Some(path) = &self.spec.checkpoint_path else {
            return;
        };
        let record = CheckpointRecord::capture(
            self.spec.segment_id,
            self.spec.direction,
            &self.spec.range,
            window,
            self.consecutive_fails,
            self.windows_scanned,
            completed,
        );
        match checkpoint::save(path, &record) {
            Ok(()) => debug!(segment = self.spec.segment_id, start = %window.start(), "checkpoint saved"),
            Err(e) => {
                warn!(segment = self.spec.segment_id, error = %format!("{:#}", e), "checkpoint write failed");
                sink.emit(WorkerEvent::Info(format!(
                    "segment {}: checkpoint write failed: {:#}",
                    self.spec.segment_id, e
                )));
            }
        }
    }

    fn transition(&mut self, next: SearcherState) {
        debug!(segment = self.spec.segment_id, from = ?self.state, to = ?next, "searcher state");
        self.state = next;
    }
}

enum Resume {
    Fresh,
    From(SlidingWindow),
    Completed,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
