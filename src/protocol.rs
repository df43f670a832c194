//! # Protocol — Worker-to-Orchestrator Events
//!
//! Workers report three kinds of event. In-process workers send them over a
//! channel; subprocess workers print one per line on stdout:
//!
//! ```text
//! line     = progress | success | info
//! progress = "PROGRESS:" integer     ; current window start (throttled)
//! success  = "SUCCESS:" integer      ; start of a window with exactly 12 primes
//! info     = any other non-empty line
//! integer  = ["-"] digit+
//! ```
//!
//! Surrounding whitespace is ignored. A known tag followed by something that
//! is not an integer is treated as `info`, never as an error.

use rug::Integer;
use std::fmt;
use std::io::Write;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

const PROGRESS_TAG: &str = "PROGRESS:";
const SUCCESS_TAG: &str = "SUCCESS:";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerEvent {
    Progress(Integer),
    Solution(Integer),
    Info(String),
}

impl WorkerEvent {
    /// Parse one protocol line. Blank lines yield `None`.
    pub fn parse_line(line: &str) -> Option<WorkerEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if let Some(rest) = line.strip_prefix(PROGRESS_TAG) {
            if let Ok(n) = rest.trim().parse::<Integer>() {
                return Some(WorkerEvent::Progress(n));
            }
        } else if let Some(rest) = line.strip_prefix(SUCCESS_TAG) {
            if let Ok(n) = rest.trim().parse::<Integer>() {
                return Some(WorkerEvent::Solution(n));
            }
        }
        Some(WorkerEvent::Info(line.to_string()))
    }
}

impl fmt::Display for WorkerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerEvent::Progress(n) => write!(f, "{}{}", PROGRESS_TAG, n),
            WorkerEvent::Solution(n) => write!(f, "{}{}", SUCCESS_TAG, n),
            WorkerEvent::Info(text) => write!(f, "{}", text.replace('\n', " ")),
        }
    }
}

/// Destination for the events a searcher produces.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: WorkerEvent);
}

/// Channel sink used by in-process workers. Events sent after the
/// orchestrator hung up are dropped.
pub struct ChannelSink {
    tx: Mutex<Sender<WorkerEvent>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<WorkerEvent>) -> Self {
        ChannelSink { tx: Mutex::new(tx) }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: WorkerEvent) {
        if let Ok(tx) = self.tx.lock() {
            let _ = tx.send(event);
        }
    }
}

/// Line-protocol sink used by subprocess workers: one flushed line per event.
#[derive(Default)]
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&self, event: WorkerEvent) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", event);
        let _ = out.flush();
    }
}

/// Collects events in memory; handy for single-searcher runs.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<WorkerEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkerEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn solutions(&self) -> Vec<Integer> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WorkerEvent::Solution(n) => Some(n),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: WorkerEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_lines() {
        assert_eq!(
            WorkerEvent::parse_line("PROGRESS:1250000000000000"),
            Some(WorkerEvent::Progress(Integer::from(1_250_000_000_000_000u64)))
        );
        assert_eq!(
            WorkerEvent::parse_line("  SUCCESS: 413523644431096819312710 \n"),
            Some(WorkerEvent::Solution(
                "413523644431096819312710".parse().unwrap()
            ))
        );
    }

    #[test]
    fn untagged_and_malformed_lines_are_info() {
        assert_eq!(
            WorkerEvent::parse_line("Checkpoint saved at 42"),
            Some(WorkerEvent::Info("Checkpoint saved at 42".into()))
        );
        assert_eq!(
            WorkerEvent::parse_line("SUCCESS:abc"),
            Some(WorkerEvent::Info("SUCCESS:abc".into()))
        );
        assert_eq!(
            WorkerEvent::parse_line("progress:12"),
            Some(WorkerEvent::Info("progress:12".into()))
        );
        assert_eq!(WorkerEvent::parse_line("   "), None);
    }

    #[test]
    fn display_matches_grammar() {
        let ev = WorkerEvent::Solution(Integer::from(300));
        assert_eq!(ev.to_string(), "SUCCESS:300");
        assert_eq!(WorkerEvent::parse_line(&ev.to_string()), Some(ev));
        assert_eq!(WorkerEvent::Progress(Integer::from(-5)).to_string(), "PROGRESS:-5");
        assert_eq!(WorkerEvent::Info("a\nb".into()).to_string(), "a b");
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (tx, rx) = std::sync::mpsc::channel();
        let sink = ChannelSink::new(tx);
        sink.emit(WorkerEvent::Info("first".into()));
        assert_eq!(rx.recv().unwrap(), WorkerEvent::Info("first".into()));
        drop(rx);
        sink.emit(WorkerEvent::Info("ignored".into()));
    }

    #[test]
    fn memory_sink_filters_solutions() {
        let sink = MemorySink::new();
        sink.emit(WorkerEvent::Progress(Integer::from(9)));
        sink.emit(WorkerEvent::Solution(Integer::from(7)));
        sink.emit(WorkerEvent::Solution(Integer::from(3)));
        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.solutions(), vec![Integer::from(7), Integer::from(3)]);
    }
}
