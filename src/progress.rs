//! # Progress — Run-Wide Status Counters
//!
//! Shared between the orchestrator loop, which updates the counters as worker
//! events arrive, and an optional background reporter that logs a status line
//! at a fixed interval. Counters are atomics; the per-segment positions sit
//! behind a Mutex (one update per progress event, which workers throttle).
//!
//! ## Background Reporter
//!
//! The reporter thread wakes every `interval`, logs windows scanned,
//! solutions found, windows per second, and the latest position of each
//! segment. Workers report once every `progress_every` windows, so windows
//! scanned is estimated as reports times that stride. It polls
//! the `shutdown` flag in short slices so `stop` takes effect promptly.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

pub struct Progress {
    /// Progress events received across all segments.
    pub reports: AtomicU64,
    /// Solution events received (before de-duplication).
    pub found: AtomicU64,
    /// Latest reported window start, keyed by segment id.
    pub positions: Mutex<BTreeMap<u32, String>>,
    /// Windows represented by one progress event.
    report_stride: u64,
    start: Instant,
    shutdown: AtomicBool,
}

impl Progress {
    pub fn new(report_stride: u64) -> Arc<Self> {
        Arc::new(Progress {
            reports: AtomicU64::new(0),
            found: AtomicU64::new(0),
            positions: Mutex::new(BTreeMap::new()),
            report_stride: report_stride.max(1),
            start: Instant::now(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn record_position(&self, segment_id: u32, position: String) {
        self.reports.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut positions) = self.positions.lock() {
            positions.insert(segment_id, position);
        }
    }

    pub fn record_solution(&self) {
        self.found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn start_reporter(self: &Arc<Self>, interval: Duration) -> thread::JoinHandle<()> {
        let progress = Arc::clone(self);
        thread::spawn(move || {
            let mut next = Instant::now() + interval;
            while !progress.shutdown.load(Ordering::Relaxed) {
                thread::sleep(SHUTDOWN_POLL.min(interval));
                if Instant::now() >= next {
                    progress.print_status();
                    next = Instant::now() + interval;
                }
            }
        })
    }

    /// Lower estimate of windows scanned across all segments.
    pub fn windows_scanned(&self) -> u64 {
        self.reports
            .load(Ordering::Relaxed)
            .saturating_mul(self.report_stride)
    }

    pub fn windows_per_sec(&self, elapsed: Duration) -> f64 {
        if elapsed.is_zero() {
            return 0.0;
        }
        self.windows_scanned() as f64 / elapsed.as_secs_f64()
    }

    /// One-line summary of per-segment positions, e.g. `0@1250000 1@1480000`.
    pub fn summary(&self) -> String {
        self.positions
            .lock()
            .map(|positions| {
                positions
                    .iter()
                    .map(|(id, pos)| format!("{}@{}", id, pos))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default()
    }

    pub fn print_status(&self) {
        let elapsed = self.start.elapsed();
        let windows = self.windows_scanned();
        let found = self.found.load(Ordering::Relaxed);
        let windows_per_sec = self.windows_per_sec(elapsed);
        let h = elapsed.as_secs() / 3600;
        let m = (elapsed.as_secs() % 3600) / 60;
        let s = elapsed.as_secs() % 60;
        info!(
            positions = %self.summary(),
            windows,
            windows_per_sec = format_args!("{:.1}", windows_per_sec),
            found,
            elapsed = format_args!("{:02}:{:02}:{:02}", h, m, s),
            "search progress"
        );
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
