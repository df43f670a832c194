//! TOML run configuration: parsing, validation, and bound expressions.
//!
//! A run file describes one orchestrated search. Every section is optional;
//! missing values fall back to the defaults of the historical run
//! (`[10^15 + 1, 2·10^15]`, four segments, backward scan):
//!
//! ```toml
//! [range]
//! low = "10^15 + 1"
//! high = "2*10^15"
//!
//! [segments]
//! count = 4
//! overlap = 2004
//!
//! [search]
//! direction = "backward"
//! mr_rounds = 25
//! progress_every = 100000
//! # max_consecutive_fails = 1000000
//!
//! [checkpoint]
//! dir = "checkpoints"
//! interval_secs = 60
//!
//! [orchestrator]
//! mode = "thread"
//! poll_interval_ms = 50
//! grace_period_secs = 10
//! status_interval_secs = 30
//! # max_runtime_secs = 3600
//! ```
//!
//! Range bounds are strings so they can exceed 64 bits and may be written as
//! expressions over `+ - * ^` and parentheses (see [`parse_bound`]).

use anyhow::{bail, Context, Result};
use rug::ops::Pow;
use rug::Integer;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::oracle::DEFAULT_MR_ROUNDS;
use crate::orchestrator::OrchestratorConfig;
use crate::planner::{self, Range, Segment};
use crate::searcher::{SearchSettings, DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_PROGRESS_EVERY};
use crate::window::{Direction, WINDOW_WIDTH};

// ── TOML Configuration Structs ──────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub range: RangeConfig,
    #[serde(default)]
    pub segments: SegmentsConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
}

/// The `[range]` section: inclusive bounds on window starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeConfig {
    pub low: String,
    pub high: String,
}

impl Default for RangeConfig {
    fn default() -> Self {
        RangeConfig {
            low: "10^15+1".to_string(),
            high: "2*10^15".to_string(),
        }
    }
}

/// The `[segments]` section: how the range is split across workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentsConfig {
    pub count: u32,
    /// Extra starts searched on each side of a core range.
    pub overlap: u64,
}

impl Default for SegmentsConfig {
    fn default() -> Self {
        SegmentsConfig {
            count: 4,
            overlap: WINDOW_WIDTH as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub direction: Direction,
    pub max_consecutive_fails: Option<u64>,
    pub mr_rounds: u32,
    pub progress_every: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            direction: Direction::default(),
            max_consecutive_fails: None,
            mr_rounds: DEFAULT_MR_ROUNDS,
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory for per-segment checkpoint files; `None` disables them.
    pub dir: Option<PathBuf>,
    pub interval_secs: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            dir: Some(PathBuf::from("checkpoints")),
            interval_secs: DEFAULT_CHECKPOINT_INTERVAL.as_secs(),
        }
    }
}

/// Where segment workers run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// One OS thread per segment in this process.
    #[default]
    Thread,
    /// One child process per segment.
    Process,
}

impl std::fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerMode::Thread => write!(f, "thread"),
            WorkerMode::Process => write!(f, "process"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub mode: WorkerMode,
    pub poll_interval_ms: u64,
    pub grace_period_secs: u64,
    pub max_runtime_secs: Option<u64>,
    /// 0 disables the periodic status line.
    pub status_interval_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        OrchestratorSection {
            mode: WorkerMode::default(),
            poll_interval_ms: 50,
            grace_period_secs: 10,
            max_runtime_secs: None,
            status_interval_secs: 30,
        }
    }
}

// ── TOML Parsing ────────────────────────────────────────────────

/// Parse a run configuration from a TOML string.
pub fn parse_toml(content: &str) -> Result<RunConfig> {
    let config: RunConfig = toml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Parse a run configuration from a TOML file path.
pub fn parse_toml_file(path: &Path) -> Result<RunConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading run config {}", path.display()))?;
    parse_toml(&content).with_context(|| format!("invalid run config {}", path.display()))
}

/// Check a configuration for logical consistency.
pub fn validate_config(config: &RunConfig) -> Result<()> {
    let range = config.total_range()?;
    if config.segments.count == 0 {
        bail!("segments.count must be at least 1");
    }
    if range.len() < config.segments.count {
        bail!(
            "range {} holds fewer starts than segments.count = {}",
            range,
            config.segments.count
        );
    }
    if config.search.mr_rounds == 0 {
        bail!("search.mr_rounds must be at least 1");
    }
    if config.search.progress_every == 0 {
        bail!("search.progress_every must be at least 1");
    }
    if config.orchestrator.poll_interval_ms == 0 {
        bail!("orchestrator.poll_interval_ms must be at least 1");
    }
    Ok(())
}

impl RunConfig {
    pub fn total_range(&self) -> Result<Range> {
        let low = parse_bound(&self.range.low).context("range.low")?;
        let high = parse_bound(&self.range.high).context("range.high")?;
        Range::new(low, high)
    }

    pub fn plan(&self) -> Result<Vec<Segment>> {
        planner::plan(
            &self.total_range()?,
            self.segments.count,
            self.segments.overlap,
        )
    }

    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            direction: self.search.direction,
            checkpoint_interval: Duration::from_secs(self.checkpoint.interval_secs),
            progress_every: self.search.progress_every,
            max_consecutive_fails: self.search.max_consecutive_fails,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let o = &self.orchestrator;
        OrchestratorConfig {
            poll_interval: Duration::from_millis(o.poll_interval_ms),
            grace_period: Duration::from_secs(o.grace_period_secs),
            max_runtime: o.max_runtime_secs.map(Duration::from_secs),
            status_interval: (o.status_interval_secs > 0)
                .then(|| Duration::from_secs(o.status_interval_secs)),
            progress_every: self.search.progress_every,
        }
    }
}

// ── Bound Expressions ───────────────────────────────────────────

/// Largest exponent accepted by `^`; keeps a typo from allocating gigabytes.
const MAX_EXPONENT: u32 = 1_000_000;

/// Evaluate an integer bound such as `1000`, `10^15 + 1`, or `2*(10^6-1)`.
///
/// Grammar (whitespace and `_` digit separators ignored):
///
/// ```text
/// expr   = term (("+" | "-") term)*
/// term   = power ("*" power)*
/// power  = unary ("^" power)?        ; right-associative
/// unary  = "-" unary | atom
/// atom   = digit+ | "(" expr ")"
/// ```
pub fn parse_bound(input: &str) -> Result<Integer> {
    let tokens: Vec<u8> = input
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b'_')
        .collect();
    if tokens.is_empty() {
        bail!("empty bound expression");
    }
    let mut parser = BoundParser {
        src: &tokens,
        pos: 0,
    };
    let value = parser.expr()?;
    if parser.pos != tokens.len() {
        bail!(
            "unexpected '{}' in bound expression {:?}",
            tokens[parser.pos] as char,
            input
        );
    }
    Ok(value)
}

struct BoundParser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl BoundParser<'_> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn expr(&mut self) -> Result<Integer> {
        let mut value = self.term()?;
        while let Some(op @ (b'+' | b'-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            if op == b'+' {
                value += rhs;
            } else {
                value -= rhs;
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<Integer> {
        let mut value = self.power()?;
        while self.peek() == Some(b'*') {
            self.pos += 1;
            value *= self.power()?;
        }
        Ok(value)
    }

    fn power(&mut self) -> Result<Integer> {
        let base = self.unary()?;
        if self.peek() != Some(b'^') {
            return Ok(base);
        }
        self.pos += 1;
        let exp = self.power()?;
        let exp = exp
            .to_u32()
            .filter(|&e| e <= MAX_EXPONENT)
            .with_context(|| format!("exponent {} out of range (0..={})", exp, MAX_EXPONENT))?;
        Ok(base.pow(exp))
    }

    fn unary(&mut self) -> Result<Integer> {
        if self.peek() == Some(b'-') {
            self.pos += 1;
            return Ok(-self.unary()?);
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Integer> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let value = self.expr()?;
                if self.peek() != Some(b')') {
                    bail!("missing ')' in bound expression");
                }
                self.pos += 1;
                Ok(value)
            }
            Some(b) if b.is_ascii_digit() => {
                let start = self.pos;
                while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                    self.pos += 1;
                }
                let digits = std::str::from_utf8(&self.src[start..self.pos])?;
                Ok(digits.parse::<Integer>()?)
            }
            Some(b) => bail!("unexpected '{}' in bound expression", b as char),
            None => bail!("bound expression ends early"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_expression_bounds() {
        assert_eq!(parse_bound("1000").unwrap(), 1000);
        assert_eq!(parse_bound("10^15+1").unwrap(), 1_000_000_000_000_001u64);
        assert_eq!(parse_bound(" 2 * 10^15 ").unwrap(), 2_000_000_000_000_000u64);
        assert_eq!(parse_bound("2^3^2").unwrap(), 512);
        assert_eq!(parse_bound("(1+2)*3").unwrap(), 9);
        assert_eq!(parse_bound("-5+10").unwrap(), 5);
        assert_eq!(parse_bound("10-2-3").unwrap(), 5);
        assert_eq!(parse_bound("123_456").unwrap(), 123_456);
        let big = parse_bound("10^72").unwrap();
        assert_eq!(big.to_string().len(), 73);
    }

    #[test]
    fn rejects_malformed_bounds() {
        for bad in ["", "   ", "10^", "abc", "1+", "(1", "1)", "2^99999999999", "3**2", "1e6"] {
            assert!(parse_bound(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse_toml("").unwrap();
        let range = config.total_range().unwrap();
        assert_eq!(range.low, 1_000_000_000_000_001u64);
        assert_eq!(range.high, 2_000_000_000_000_000u64);
        assert_eq!(config.segments.count, 4);
        assert_eq!(config.segments.overlap, 2004);
        assert_eq!(config.search.direction, Direction::Backward);
        assert_eq!(config.orchestrator.mode, WorkerMode::Thread);
        assert_eq!(config.plan().unwrap().len(), 4);
    }

    #[test]
    fn parses_full_file() {
        let config = parse_toml(
            r#"
            [range]
            low = "1"
            high = "10^4"

            [segments]
            count = 2
            overlap = 0

            [search]
            direction = "forward"
            max_consecutive_fails = 500
            mr_rounds = 10
            progress_every = 250

            [checkpoint]
            dir = "/tmp/pw"
            interval_secs = 5

            [orchestrator]
            mode = "process"
            poll_interval_ms = 20
            grace_period_secs = 3
            max_runtime_secs = 120
            status_interval_secs = 0
            "#,
        )
        .unwrap();

        let settings = config.search_settings();
        assert_eq!(settings.direction, Direction::Forward);
        assert_eq!(settings.max_consecutive_fails, Some(500));
        assert_eq!(settings.checkpoint_interval, Duration::from_secs(5));
        assert_eq!(settings.progress_every, 250);
        assert_eq!(config.search.mr_rounds, 10);
        assert_eq!(config.checkpoint.dir, Some(PathBuf::from("/tmp/pw")));

        let orch = config.orchestrator_config();
        assert_eq!(config.orchestrator.mode, WorkerMode::Process);
        assert_eq!(orch.poll_interval, Duration::from_millis(20));
        assert_eq!(orch.grace_period, Duration::from_secs(3));
        assert_eq!(orch.max_runtime, Some(Duration::from_secs(120)));
        assert_eq!(orch.status_interval, None);
        assert_eq!(orch.progress_every, 250);

        let segs = config.plan().unwrap();
        assert_eq!(segs[1].core.high, 10_000);
    }

    #[test]
    fn rejects_inconsistent_files() {
        assert!(parse_toml("[range]\nlow = \"10\"\nhigh = \"5\"").is_err());
        assert!(parse_toml("[segments]\ncount = 0").is_err());
        assert!(parse_toml("[range]\nlow = \"1\"\nhigh = \"3\"\n[segments]\ncount = 4").is_err());
        assert!(parse_toml("[search]\nmr_rounds = 0").is_err());
        assert!(parse_toml("[search]\ndirection = \"sideways\"").is_err());
        assert!(parse_toml("[orchestrator]\nmode = \"cluster\"").is_err());
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = RunConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = parse_toml(&text).unwrap();
        assert_eq!(parsed.range.low, config.range.low);
        assert_eq!(parsed.segments.count, config.segments.count);
    }

    #[test]
    fn file_errors_carry_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(&path, "[segments]\ncount = \"four\"").unwrap();
        let err = parse_toml_file(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("run.toml"));
        assert!(parse_toml_file(&dir.path().join("absent.toml")).is_err());
    }
}
