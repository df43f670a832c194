//! # Orchestrator — Running Segments in Parallel
//!
//! The orchestrator launches one worker per planned segment, drains their
//! events, and decides when the run is over. It is the sole owner of the
//! aggregate solution set; workers only ever emit events and observe the
//! shared [`StopFlag`].
//!
//! ## Worker Backends
//!
//! Workers sit behind the [`WorkerLauncher`] / [`WorkerHandle`] seam:
//!
//! - [`ThreadLauncher`]: each segment runs on a named OS thread in this
//!   process; events flow over an `mpsc` channel.
//! - [`ProcessLauncher`](crate::process::ProcessLauncher): each segment runs
//!   in a child process of this binary, speaking the line protocol on stdout.
//!
//! ## Run Loop
//!
//! ```text
//! launch all ──► poll ──► stop condition? ──► request stop ──► grace drain
//!                 ▲  │          no                               │ timeout
//!                 └──┘ (sleep when idle)                     force kill
//!                                                                │
//!                                              final drain ──► minimum
//! ```
//!
//! The run stops on the first solution, on an operator interrupt, or when
//! `max_runtime` elapses. Solutions that arrive during the grace period are
//! still counted, and the reported answer is the minimum over all of them,
//! never simply the first to arrive.

use anyhow::{bail, Context, Result};
use rug::Integer;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::oracle::PrimalityOracle;
use crate::planner::Segment;
use crate::progress::Progress;
use crate::protocol::{ChannelSink, WorkerEvent};
use crate::searcher::{
    SearchOutcome, SearchSettings, SearchSpec, SegmentSearcher, StopFlag, DEFAULT_PROGRESS_EVERY,
};

/// Upper bound on events taken from one worker per poll, so a chatty worker
/// cannot starve the others.
const MAX_EVENTS_PER_POLL: usize = 1024;

/// How a worker ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    Finished(SearchOutcome),
    Failed(String),
    /// Terminated by the orchestrator after the grace period.
    Killed,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Finished(outcome) => write!(f, "{}", outcome),
            WorkerExit::Failed(reason) => write!(f, "failed: {}", reason),
            WorkerExit::Killed => write!(f, "killed"),
        }
    }
}

/// A running worker as seen by the orchestrator.
pub trait WorkerHandle: Send {
    fn segment_id(&self) -> u32;

    /// Next buffered event, without blocking.
    fn try_next_event(&mut self) -> Option<WorkerEvent>;

    /// Ask the worker to checkpoint and stop.
    fn request_stop(&mut self);

    /// True once the worker is gone and has nothing left to deliver.
    fn has_exited(&mut self) -> bool;

    /// Terminate a worker that ignored `request_stop`.
    fn force_kill(&mut self);

    /// Reap the worker and report how it ended.
    fn finish(self: Box<Self>) -> WorkerExit;
}

pub trait WorkerLauncher {
    /// Start a worker for `segment`. `stop` is the run-wide stop flag.
    fn launch(&self, segment: &Segment, stop: &StopFlag) -> Result<Box<dyn WorkerHandle>>;
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Sleep between polls when no worker had anything to say.
    pub poll_interval: Duration,
    /// Time workers get to stop on their own before being killed.
    pub grace_period: Duration,
    pub max_runtime: Option<Duration>,
    /// Interval of the background status line; `None` disables it.
    pub status_interval: Option<Duration>,
    /// Windows between two progress events of one worker.
    pub progress_every: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_secs(10),
            max_runtime: None,
            status_interval: Some(Duration::from_secs(30)),
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    SolutionFound,
    Interrupted,
    TimeLimit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::SolutionFound => write!(f, "solution found"),
            StopReason::Interrupted => write!(f, "interrupted"),
            StopReason::TimeLimit => write!(f, "time limit reached"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SegmentReport {
    pub segment_id: u32,
    /// Latest position from a progress or solution event.
    pub last_position: Option<Integer>,
    pub solutions_reported: u64,
    pub exit: WorkerExit,
}

#[derive(Clone, Debug)]
pub struct RunResult {
    /// Smallest solution reported by any segment.
    pub minimum: Option<Integer>,
    /// Every distinct solution, ascending.
    pub solutions: Vec<Integer>,
    /// Why the run was cut short; `None` if every segment ran to completion.
    pub stop_reason: Option<StopReason>,
    pub segments: Vec<SegmentReport>,
    pub failed_launches: Vec<u32>,
    pub elapsed: Duration,
}

struct Slot {
    handle: Box<dyn WorkerHandle>,
    last_position: Option<Integer>,
    solutions_reported: u64,
    exited: bool,
}

impl Slot {
    fn refresh_exited(&mut self) -> bool {
        if !self.exited {
            self.exited = self.handle.has_exited();
        }
        self.exited
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Orchestrator { config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run every segment to completion or until a stop condition fires.
    ///
    /// `interrupt` is raised by the operator (Ctrl-C, SIGTERM) and handled
    /// exactly like an internal stop.
    pub fn run(
        &self,
        segments: &[Segment],
        launcher: &dyn WorkerLauncher,
        interrupt: &StopFlag,
    ) -> Result<RunResult> {
        if segments.is_empty() {
            bail!("nothing to search: no segments planned");
        }
        let started = Instant::now();
        let stop = StopFlag::new();
        let progress = Progress::new(self.config.progress_every);
        let reporter = self.config.status_interval.map(|i| progress.start_reporter(i));

        let mut slots = Vec::with_capacity(segments.len());
        let mut failed_launches = Vec::new();
        for segment in segments {
            match launcher.launch(segment, &stop) {
                Ok(handle) => {
                    info!(
                        segment = segment.id,
                        core = %segment.core,
                        search = %segment.search,
                        "worker launched"
                    );
                    slots.push(Slot {
                        handle,
                        last_position: None,
                        solutions_reported: 0,
                        exited: false,
                    });
                }
                Err(e) => {
                    warn!(segment = segment.id, error = %format!("{:#}", e), "failed to launch worker");
                    failed_launches.push(segment.id);
                }
            }
        }
        if slots.is_empty() {
            progress.stop();
            bail!(
                "no worker could be launched ({} of {} failed)",
                failed_launches.len(),
                segments.len()
            );
        }

        let mut solutions = BTreeSet::new();
        let mut stop_reason = None;

        loop {
            let received = drain(&mut slots, &mut solutions, &progress);
            if !solutions.is_empty() {
                stop_reason = Some(StopReason::SolutionFound);
            } else if interrupt.is_requested() {
                stop_reason = Some(StopReason::Interrupted);
            } else if self
                .config
                .max_runtime
                .is_some_and(|limit| started.elapsed() >= limit)
            {
                stop_reason = Some(StopReason::TimeLimit);
            }
            if stop_reason.is_some() {
                break;
            }
            if all_exited(&mut slots) {
                break;
            }
            if received == 0 {
                thread::sleep(self.config.poll_interval);
            }
        }

        if let Some(reason) = stop_reason {
            info!(reason = %reason, "stopping all workers");
            stop.request();
            for slot in slots.iter_mut() {
                if !slot.refresh_exited() {
                    slot.handle.request_stop();
                }
            }
            let deadline = Instant::now() + self.config.grace_period;
            loop {
                let received = drain(&mut slots, &mut solutions, &progress);
                if all_exited(&mut slots) {
                    break;
                }
                if Instant::now() >= deadline {
                    for slot in slots.iter_mut() {
                        if slot.refresh_exited() {
                            continue;
                        }
                        warn!(
                            segment = slot.handle.segment_id(),
                            grace_secs = self.config.grace_period.as_secs_f64(),
                            "worker did not stop within grace period, forcing termination"
                        );
                        slot.handle.force_kill();
                    }
                    break;
                }
                if received == 0 {
                    thread::sleep(self.config.poll_interval);
                }
            }
        }

        // Exited workers may still have events buffered.
        while drain(&mut slots, &mut solutions, &progress) > 0 {}
        progress.stop();
        if let Some(reporter) = reporter {
            let _ = reporter.join();
        }

        let segments: Vec<SegmentReport> = slots
            .into_iter()
            .map(|slot| {
                let segment_id = slot.handle.segment_id();
                let exit = slot.handle.finish();
                if let WorkerExit::Failed(reason) = &exit {
                    error!(segment = segment_id, reason = %reason, "worker failed");
                }
                SegmentReport {
                    segment_id,
                    last_position: slot.last_position,
                    solutions_reported: slot.solutions_reported,
                    exit,
                }
            })
            .collect();

        let solutions: Vec<Integer> = solutions.into_iter().collect();
        let minimum = solutions.first().cloned();
        let elapsed = started.elapsed();
        match &minimum {
            Some(m) => info!(minimum = %m, distinct = solutions.len(), elapsed_secs = elapsed.as_secs_f64(), "run finished"),
            None => info!(elapsed_secs = elapsed.as_secs_f64(), "run finished without a solution"),
        }

        Ok(RunResult {
            minimum,
            solutions,
            stop_reason,
            segments,
            failed_launches,
            elapsed,
        })
    }
}

/// Refresh every slot, without stopping at the first live one.
fn all_exited(slots: &mut [Slot]) -> bool {
    slots
        .iter_mut()
        .fold(true, |all, slot| slot.refresh_exited() && all)
}

/// Pull buffered events from every worker. Returns how many were received.
fn drain(slots: &mut [Slot], solutions: &mut BTreeSet<Integer>, progress: &Progress) -> usize {
    let mut received = 0;
    for slot in slots.iter_mut() {
        let segment = slot.handle.segment_id();
        for _ in 0..MAX_EVENTS_PER_POLL {
            let Some(event) = slot.handle.try_next_event() else {
                break;
            };
            received += 1;
            match event {
                WorkerEvent::Progress(position) => {
                    progress.record_position(segment, position.to_string());
                    slot.last_position = Some(position);
                }
                WorkerEvent::Solution(start) => {
                    info!(segment, start = %start, "solution reported");
                    progress.record_solution();
                    slot.solutions_reported += 1;
                    slot.last_position = Some(start.clone());
                    solutions.insert(start);
                }
                WorkerEvent::Info(text) => info!(segment, "{}", text),
            }
        }
    }
    received
}

/// Runs each segment on its own thread in this process.
pub struct ThreadLauncher {
    oracle: Arc<dyn PrimalityOracle>,
    settings: SearchSettings,
    store: Option<CheckpointStore>,
}

impl ThreadLauncher {
    pub fn new(oracle: Arc<dyn PrimalityOracle>, settings: SearchSettings) -> Self {
        ThreadLauncher {
            oracle,
            settings,
            store: None,
        }
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.store = Some(store);
        self
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, segment: &Segment, stop: &StopFlag) -> Result<Box<dyn WorkerHandle>> {
        let spec = SearchSpec::for_segment(segment, &self.settings, self.store.as_ref());
        let (tx, rx) = mpsc::channel();
        let oracle = Arc::clone(&self.oracle);
        let worker_stop = stop.clone();
        let join = thread::Builder::new()
            .name(format!("segment-{}", segment.id))
            .spawn(move || {
                let sink = ChannelSink::new(tx);
                SegmentSearcher::new(spec).run(&*oracle, &worker_stop, &sink)
            })
            .with_context(|| format!("spawning thread for segment {}", segment.id))?;
        Ok(Box::new(ThreadWorker {
            segment_id: segment.id,
            rx,
            join: Some(join),
            stop: stop.clone(),
            detached: false,
        }))
    }
}

pub struct ThreadWorker {
    segment_id: u32,
    rx: Receiver<WorkerEvent>,
    join: Option<JoinHandle<Result<SearchOutcome>>>,
    stop: StopFlag,
    detached: bool,
}

impl WorkerHandle for ThreadWorker {
    fn segment_id(&self) -> u32 {
        self.segment_id
    }

    fn try_next_event(&mut self) -> Option<WorkerEvent> {
        self.rx.try_recv().ok()
    }

    fn request_stop(&mut self) {
        self.stop.request();
    }

    fn has_exited(&mut self) -> bool {
        self.detached || self.join.as_ref().map_or(true, |j| j.is_finished())
    }

    fn force_kill(&mut self) {
        // Threads cannot be killed; the thread is left to notice the stop
        // flag on its own and its handle is dropped.
        warn!(segment = self.segment_id, "detaching unresponsive worker thread");
        self.detached = true;
    }

    fn finish(mut self: Box<Self>) -> WorkerExit {
        let Some(join) = self.join.take() else {
            return WorkerExit::Killed;
        };
        if self.detached && !join.is_finished() {
            return WorkerExit::Killed;
        }
        match join.join() {
            Ok(Ok(outcome)) => WorkerExit::Finished(outcome),
            Ok(Err(e)) => WorkerExit::Failed(format!("{:#}", e)),
            Err(_) => WorkerExit::Failed("worker thread panicked".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MillerRabin;
    use crate::planner::{plan, Range};
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    /// Emits a fixed list of events, then either exits or keeps running.
    struct Scripted {
        id: u32,
        events: VecDeque<WorkerEvent>,
        runs_until_stopped: bool,
        ignores_stop: bool,
        stop_requested: bool,
        killed: bool,
    }

    impl WorkerHandle for Scripted {
        fn segment_id(&self) -> u32 {
            self.id
        }
        fn try_next_event(&mut self) -> Option<WorkerEvent> {
            self.events.pop_front()
        }
        fn request_stop(&mut self) {
            self.stop_requested = true;
        }
        fn has_exited(&mut self) -> bool {
            self.killed
                || (self.events.is_empty()
                    && (!self.runs_until_stopped || (self.stop_requested && !self.ignores_stop)))
        }
        fn force_kill(&mut self) {
            self.killed = true;
        }
        fn finish(self: Box<Self>) -> WorkerExit {
            if self.killed {
                WorkerExit::Killed
            } else if self.stop_requested {
                WorkerExit::Finished(SearchOutcome::Stopped)
            } else {
                WorkerExit::Finished(SearchOutcome::Exhausted)
            }
        }
    }

    #[derive(Clone, Default)]
    struct Script {
        events: Vec<WorkerEvent>,
        runs_until_stopped: bool,
        ignores_stop: bool,
    }

    #[derive(Default)]
    struct ScriptedLauncher {
        scripts: Mutex<Vec<Script>>,
        refuse: HashSet<u32>,
    }

    impl ScriptedLauncher {
        fn new(scripts: Vec<Script>) -> Self {
            ScriptedLauncher {
                scripts: Mutex::new(scripts),
                refuse: HashSet::new(),
            }
        }
    }

    impl WorkerLauncher for ScriptedLauncher {
        fn launch(&self, segment: &Segment, _stop: &StopFlag) -> Result<Box<dyn WorkerHandle>> {
            if self.refuse.contains(&segment.id) {
                bail!("refusing segment {}", segment.id);
            }
            let script = self.scripts.lock().unwrap()[segment.id as usize].clone();
            Ok(Box::new(Scripted {
                id: segment.id,
                events: script.events.into(),
                runs_until_stopped: script.runs_until_stopped,
                ignores_stop: script.ignores_stop,
                stop_requested: false,
                killed: false,
            }))
        }
    }

    fn segments(count: u32) -> Vec<Segment> {
        let total = Range::new(Integer::from(1), Integer::from(100_000)).unwrap();
        plan(&total, count, 2004).unwrap()
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            poll_interval: Duration::from_millis(2),
            grace_period: Duration::from_millis(200),
            max_runtime: None,
            status_interval: None,
            ..Default::default()
        }
    }

    fn solution(n: u32) -> WorkerEvent {
        WorkerEvent::Solution(Integer::from(n))
    }

    #[test]
    fn reports_minimum_not_first_arrival() {
        let launcher = ScriptedLauncher::new(vec![
            Script {
                events: vec![solution(500)],
                runs_until_stopped: true,
                ..Default::default()
            },
            Script {
                events: vec![solution(300)],
                runs_until_stopped: true,
                ..Default::default()
            },
        ]);
        let result = Orchestrator::new(fast_config())
            .run(&segments(2), &launcher, &StopFlag::new())
            .unwrap();
        assert_eq!(result.minimum, Some(Integer::from(300)));
        assert_eq!(result.solutions, vec![Integer::from(300), Integer::from(500)]);
        assert_eq!(result.stop_reason, Some(StopReason::SolutionFound));
        assert!(result
            .segments
            .iter()
            .all(|s| s.exit == WorkerExit::Finished(SearchOutcome::Stopped)));
    }

    #[test]
    fn overlapping_reports_are_deduplicated() {
        let launcher = ScriptedLauncher::new(vec![
            Script {
                events: vec![solution(10_001)],
                ..Default::default()
            },
            Script {
                events: vec![WorkerEvent::Progress(Integer::from(12_000)), solution(10_001)],
                ..Default::default()
            },
        ]);
        let result = Orchestrator::new(fast_config())
            .run(&segments(2), &launcher, &StopFlag::new())
            .unwrap();
        assert_eq!(result.solutions, vec![Integer::from(10_001)]);
        assert_eq!(result.segments[1].solutions_reported, 1);
        assert_eq!(result.segments[1].last_position, Some(Integer::from(10_001)));
    }

    #[test]
    fn exhausted_run_has_no_solution() {
        let launcher = ScriptedLauncher::new(vec![
            Script {
                events: vec![WorkerEvent::Progress(Integer::from(40_000))],
                ..Default::default()
            },
            Script::default(),
        ]);
        let result = Orchestrator::new(fast_config())
            .run(&segments(2), &launcher, &StopFlag::new())
            .unwrap();
        assert_eq!(result.minimum, None);
        assert!(result.solutions.is_empty());
        assert_eq!(result.stop_reason, None);
        assert_eq!(result.segments[0].last_position, Some(Integer::from(40_000)));
    }

    #[test]
    fn unresponsive_worker_is_killed_after_grace() {
        let launcher = ScriptedLauncher::new(vec![
            Script {
                runs_until_stopped: true,
                ignores_stop: true,
                ..Default::default()
            },
            Script {
                runs_until_stopped: true,
                ..Default::default()
            },
        ]);
        let interrupt = StopFlag::new();
        interrupt.request();
        let started = Instant::now();
        let result = Orchestrator::new(fast_config())
            .run(&segments(2), &launcher, &interrupt)
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(result.stop_reason, Some(StopReason::Interrupted));
        assert_eq!(result.segments[0].exit, WorkerExit::Killed);
        assert_eq!(result.segments[1].exit, WorkerExit::Finished(SearchOutcome::Stopped));
    }

    #[test]
    fn only_the_unresponsive_worker_is_killed() {
        let launcher = ScriptedLauncher::new(vec![
            Script {
                runs_until_stopped: true,
                ..Default::default()
            },
            Script {
                runs_until_stopped: true,
                ignores_stop: true,
                ..Default::default()
            },
            Script {
                runs_until_stopped: true,
                ..Default::default()
            },
        ]);
        let interrupt = StopFlag::new();
        interrupt.request();
        let result = Orchestrator::new(fast_config())
            .run(&segments(3), &launcher, &interrupt)
            .unwrap();
        let exits: Vec<WorkerExit> = result.segments.iter().map(|s| s.exit.clone()).collect();
        assert_eq!(
            exits,
            vec![
                WorkerExit::Finished(SearchOutcome::Stopped),
                WorkerExit::Killed,
                WorkerExit::Finished(SearchOutcome::Stopped),
            ]
        );
    }

    #[test]
    fn time_limit_stops_run() {
        let launcher = ScriptedLauncher::new(vec![Script {
            runs_until_stopped: true,
            ..Default::default()
        }]);
        let config = OrchestratorConfig {
            max_runtime: Some(Duration::from_millis(30)),
            ..fast_config()
        };
        let result = Orchestrator::new(config)
            .run(&segments(1), &launcher, &StopFlag::new())
            .unwrap();
        assert_eq!(result.stop_reason, Some(StopReason::TimeLimit));
        assert!(result.elapsed >= Duration::from_millis(30));
    }

    #[test]
    fn partial_launch_failure_is_tolerated() {
        let mut launcher = ScriptedLauncher::new(vec![
            Script {
                events: vec![solution(7)],
                ..Default::default()
            },
            Script::default(),
        ]);
        launcher.refuse.insert(1);
        let result = Orchestrator::new(fast_config())
            .run(&segments(2), &launcher, &StopFlag::new())
            .unwrap();
        assert_eq!(result.failed_launches, vec![1]);
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.minimum, Some(Integer::from(7)));
    }

    #[test]
    fn total_launch_failure_is_an_error() {
        let mut launcher = ScriptedLauncher::new(vec![Script::default(), Script::default()]);
        launcher.refuse.extend([0, 1]);
        let err = Orchestrator::new(fast_config())
            .run(&segments(2), &launcher, &StopFlag::new())
            .unwrap_err();
        assert!(err.to_string().contains("no worker could be launched"), "{}", err);
        assert!(Orchestrator::new(fast_config())
            .run(&[], &launcher, &StopFlag::new())
            .is_err());
    }

    #[test]
    fn thread_workers_exhaust_small_range() {
        let total = Range::new(Integer::from(1), Integer::from(6000)).unwrap();
        let segs = plan(&total, 3, 2004).unwrap();
        let settings = SearchSettings {
            progress_every: 1000,
            ..Default::default()
        };
        let launcher = ThreadLauncher::new(Arc::new(MillerRabin::default()), settings);
        let result = Orchestrator::new(fast_config())
            .run(&segs, &launcher, &StopFlag::new())
            .unwrap();
        assert_eq!(result.minimum, None);
        assert_eq!(result.segments.len(), 3);
        for report in &result.segments {
            assert_eq!(report.exit, WorkerExit::Finished(SearchOutcome::Exhausted));
            assert!(report.last_position.is_some());
        }
    }
}
