//! # Checkpoint — Resumable Segment State
//!
//! A segment searcher periodically persists a [`CheckpointRecord`]: the
//! current window start, the window's packed prime flags, the running prime
//! count, and enough bookkeeping (direction, range, failure streak) to resume
//! exactly where it stopped. Restoring a record yields a window bit-identical
//! to the one that was saved, so resumption needs no re-initialization.
//!
//! ## Atomic Writes
//!
//! Records are written to a `.tmp` sibling and renamed over the live file.
//! An interrupted write leaves the previous record untouched.
//!
//! ## Integrity
//!
//! The JSON payload is wrapped in an envelope carrying its SHA-256 digest.
//! On load the digest is verified; a corrupt file is skipped and the loader
//! falls back to the previous generation (three generations are kept).
//!
//! ## Layout
//!
//! [`CheckpointStore`] partitions records by segment id, one file per
//! segment (`segment-<id>.checkpoint`), so concurrent segments never write
//! the same file.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rug::Integer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::planner::Range;
use crate::window::{Direction, SlidingWindow};

/// Number of backup generations to keep.
const GENERATIONS: usize = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub segment_id: u32,
    pub direction: Direction,
    /// Search range the record belongs to, decimal.
    pub range_low: String,
    pub range_high: String,
    /// Start of the last fully evaluated window, decimal.
    pub current_start: String,
    /// Base64 of the logical-order packed flag image.
    pub flags: String,
    pub prime_count: u32,
    #[serde(default)]
    pub consecutive_fails: u64,
    #[serde(default)]
    pub windows_scanned: u64,
    /// Set once the searcher has evaluated every window of its range.
    #[serde(default)]
    pub completed: bool,
    pub saved_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn capture(
        segment_id: u32,
        direction: Direction,
        range: &Range,
        window: &SlidingWindow,
        consecutive_fails: u64,
        windows_scanned: u64,
        completed: bool,
    ) -> Self {
        CheckpointRecord {
            segment_id,
            direction,
            range_low: range.low.to_string(),
            range_high: range.high.to_string(),
            current_start: window.start().to_string(),
            flags: BASE64.encode(window.packed_flags()),
            prime_count: window.count(),
            consecutive_fails,
            windows_scanned,
            completed,
            saved_at: Utc::now(),
        }
    }

    /// Rebuild the saved window.
    pub fn window(&self) -> Result<SlidingWindow> {
        let start = parse_integer(&self.current_start, "current_start")?;
        let packed = BASE64
            .decode(self.flags.as_bytes())
            .context("checkpoint flags are not valid base64")?;
        SlidingWindow::from_packed(start, &packed, self.prime_count)
    }

    pub fn range(&self) -> Result<Range> {
        Range::new(
            parse_integer(&self.range_low, "range_low")?,
            parse_integer(&self.range_high, "range_high")?,
        )
    }

    /// Whether this record was written by a searcher with the same identity.
    pub fn belongs_to(&self, segment_id: u32, direction: Direction, range: &Range) -> bool {
        self.segment_id == segment_id
            && self.direction == direction
            && self.range().is_ok_and(|r| r == *range)
    }
}

fn parse_integer(s: &str, field: &str) -> Result<Integer> {
    s.parse::<Integer>()
        .with_context(|| format!("checkpoint field {} is not an integer: {:?}", field, s))
}

/// Wrapper that includes a SHA-256 checksum for integrity verification.
#[derive(Serialize, Deserialize)]
struct CheckpointEnvelope {
    checksum: String,
    data: serde_json::Value,
}

fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Path of generation `gen` (0 = current, 1 = `.1`, ...).
fn generation_path(base: &Path, gen: usize) -> PathBuf {
    if gen == 0 {
        base.to_path_buf()
    } else {
        let mut p = base.as_os_str().to_os_string();
        p.push(format!(".{}", gen));
        PathBuf::from(p)
    }
}

fn tmp_path(base: &Path) -> PathBuf {
    let mut p = base.as_os_str().to_os_string();
    p.push(".tmp");
    PathBuf::from(p)
}

/// Save a record with checksum and rotating generations.
///
/// Rotation: current → .1 → .2 (the old .2 is discarded). The new record is
/// fully written to a temp file before it replaces the current one.
pub fn save(path: &Path, record: &CheckpointRecord) -> Result<()> {
    let data = serde_json::to_value(record)?;
    let data_str = serde_json::to_string_pretty(&data)?;
    let envelope = CheckpointEnvelope {
        checksum: sha256_hex(&data_str),
        data,
    };
    let json = serde_json::to_string_pretty(&envelope)?;

    let tmp = tmp_path(path);
    fs::write(&tmp, &json).with_context(|| format!("writing {}", tmp.display()))?;

    for gen in (1..GENERATIONS).rev() {
        let src = generation_path(path, gen - 1);
        if src.exists() {
            let _ = fs::rename(&src, generation_path(path, gen));
        }
    }
    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Load the newest valid record, falling back to older generations on corruption.
/// Any read or decode failure counts as "no checkpoint".
pub fn load(path: &Path) -> Option<CheckpointRecord> {
    for gen in 0..GENERATIONS {
        let p = generation_path(path, gen);
        if let Some(record) = load_single(&p) {
            if gen > 0 {
                warn!(
                    generation = gen,
                    path = %p.display(),
                    "recovered checkpoint from older generation"
                );
            }
            return Some(record);
        }
    }
    None
}

fn load_single(path: &Path) -> Option<CheckpointRecord> {
    let raw = fs::read_to_string(path).ok()?;
    let envelope: CheckpointEnvelope = match serde_json::from_str(&raw) {
        Ok(e) => e,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable checkpoint");
            return None;
        }
    };

    let data_str = serde_json::to_string_pretty(&envelope.data).ok()?;
    let expected = sha256_hex(&data_str);
    if expected != envelope.checksum {
        warn!(
            path = %path.display(),
            expected = &expected[..12],
            found = &envelope.checksum[..12.min(envelope.checksum.len())],
            "checkpoint integrity check failed"
        );
        return None;
    }

    serde_json::from_value(envelope.data).ok()
}

/// Remove every generation of a checkpoint plus any leftover temp file.
pub fn clear(path: &Path) {
    for gen in 0..GENERATIONS {
        let _ = fs::remove_file(generation_path(path, gen));
    }
    let _ = fs::remove_file(tmp_path(path));
}

/// Directory of per-segment checkpoint files.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating checkpoint directory {}", dir.display()))?;
        Ok(CheckpointStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, segment_id: u32) -> PathBuf {
        self.dir.join(format!("segment-{}.checkpoint", segment_id))
    }

    pub fn save(&self, record: &CheckpointRecord) -> Result<()> {
        save(&self.path_for(record.segment_id), record)
    }

    pub fn load(&self, segment_id: u32) -> Option<CheckpointRecord> {
        load(&self.path_for(segment_id)).filter(|r| r.segment_id == segment_id)
    }

    pub fn clear(&self, segment_id: u32) {
        clear(&self.path_for(segment_id))
    }
}
