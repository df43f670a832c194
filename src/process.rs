//! # Process — Segment Workers as Child Processes
//!
//! [`ProcessLauncher`] starts each segment as `<binary> worker ...`, a child
//! process of the same executable. The child prints protocol lines on stdout
//! (see [`crate::protocol`]) and logs on stderr, which is inherited. A reader
//! thread per child turns stdout lines into [`WorkerEvent`]s.
//!
//! Stopping sends SIGTERM, on which the worker writes a final checkpoint
//! and exits; forcing sends SIGKILL. The worker prints one line as soon as
//! its signal handlers are in place, and SIGTERM is held back until that
//! line arrives. The worker's exit code encodes its [`SearchOutcome`].

use anyhow::{Context, Result};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use tracing::{debug, warn};

use crate::checkpoint::CheckpointStore;
use crate::orchestrator::{WorkerExit, WorkerHandle, WorkerLauncher};
use crate::planner::Segment;
use crate::protocol::WorkerEvent;
use crate::searcher::{SearchOutcome, SearchSettings, StopFlag};

pub struct ProcessLauncher {
    binary_path: PathBuf,
    settings: SearchSettings,
    store: Option<CheckpointStore>,
    mr_rounds: u32,
}

impl ProcessLauncher {
    pub fn new(binary_path: impl Into<PathBuf>, settings: SearchSettings, mr_rounds: u32) -> Self {
        ProcessLauncher {
            binary_path: binary_path.into(),
            settings,
            store: None,
            mr_rounds,
        }
    }

    /// Launcher that re-executes the running binary.
    pub fn current_exe(settings: SearchSettings, mr_rounds: u32) -> Result<Self> {
        let exe = std::env::current_exe().context("locating the running executable")?;
        Ok(Self::new(exe, settings, mr_rounds))
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// Command-line arguments for the `worker` subcommand of `segment`.
    pub fn worker_args(&self, segment: &Segment) -> Vec<String> {
        let mut args = vec![
            "--mr-rounds".to_string(),
            self.mr_rounds.to_string(),
            "worker".to_string(),
            "--segment-id".to_string(),
            segment.id.to_string(),
            "--start".to_string(),
            segment.search.low.to_string(),
            "--end".to_string(),
            segment.search.high.to_string(),
            "--direction".to_string(),
            self.settings.direction.to_string(),
            "--checkpoint-interval".to_string(),
            self.settings.checkpoint_interval.as_secs().to_string(),
            "--progress-every".to_string(),
            self.settings.progress_every.to_string(),
        ];
        if let Some(store) = &self.store {
            args.push("--checkpoint".to_string());
            args.push(store.path_for(segment.id).display().to_string());
        }
        if let Some(max) = self.settings.max_consecutive_fails {
            args.push("--max-fails".to_string());
            args.push(max.to_string());
        }
        args
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, segment: &Segment, _stop: &StopFlag) -> Result<Box<dyn WorkerHandle>> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(self.worker_args(segment));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        let mut child = cmd.spawn().with_context(|| {
            format!(
                "spawning {} for segment {}",
                self.binary_path.display(),
                segment.id
            )
        })?;
        let stdout = child
            .stdout
            .take()
            .context("child process has no stdout pipe")?;

        let (tx, rx) = mpsc::channel();
        let segment_id = segment.id;
        thread::Builder::new()
            .name(format!("segment-{}-stdout", segment_id))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if let Some(event) = WorkerEvent::parse_line(&line) {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }
                debug!(segment = segment_id, "worker stdout closed");
            })
            .context("spawning stdout reader thread")?;

        Ok(Box::new(ProcessWorker {
            segment_id,
            child,
            rx,
            eof: false,
            ready: false,
            stop_pending: false,
            killed: false,
        }))
    }
}

pub struct ProcessWorker {
    segment_id: u32,
    child: Child,
    rx: Receiver<WorkerEvent>,
    eof: bool,
    /// Set by the first line from the child; its handlers are installed.
    ready: bool,
    stop_pending: bool,
    killed: bool,
}

impl WorkerHandle for ProcessWorker {
    fn segment_id(&self) -> u32 {
        self.segment_id
    }

    fn try_next_event(&mut self) -> Option<WorkerEvent> {
        match self.rx.try_recv() {
            Ok(event) => {
                if !self.ready {
                    self.ready = true;
                    if self.stop_pending {
                        send_term_signal(&mut self.child);
                    }
                }
                Some(event)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.eof = true;
                None
            }
        }
    }

    fn request_stop(&mut self) {
        if self.ready {
            send_term_signal(&mut self.child);
        } else {
            debug!(segment = self.segment_id, "worker not ready, deferring stop");
            self.stop_pending = true;
        }
    }

    fn has_exited(&mut self) -> bool {
        if self.killed {
            return true;
        }
        let exited = matches!(self.child.try_wait(), Ok(Some(_)) | Err(_));
        // Not gone until the reader has hit EOF and every line was drained.
        exited && self.eof
    }

    fn force_kill(&mut self) {
        if let Err(e) = self.child.kill() {
            warn!(segment = self.segment_id, error = %e, "failed to kill worker process");
        }
        self.killed = true;
    }

    fn finish(mut self: Box<Self>) -> WorkerExit {
        let status = match self.child.wait() {
            Ok(status) => status,
            Err(e) => return WorkerExit::Failed(format!("wait error: {}", e)),
        };
        if self.killed {
            return WorkerExit::Killed;
        }
        match status.code().and_then(SearchOutcome::from_exit_code) {
            Some(outcome) => WorkerExit::Finished(outcome),
            None => WorkerExit::Failed(format!("exit status: {}", status)),
        }
    }
}

/// Send SIGTERM (Unix) or kill (other) to a child process.
fn send_term_signal(child: &mut Child) {
    #[cfg(unix)]
    {
        // Use the kill command to send SIGTERM without unsafe code
        let _ = Command::new("kill")
            .arg("-TERM")
            .arg(child.id().to_string())
            .status();
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }
}
