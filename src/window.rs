//! # Window — Incremental Prime Count over 2004 Consecutive Integers
//!
//! A [`SlidingWindow`] tracks which of the integers `[start, start + 2003]`
//! are probable primes and how many there are. Moving the window by one
//! position costs a single oracle call: only the integer entering the window
//! is tested, and the flag of the integer leaving it is read back from the
//! buffer.
//!
//! ## Representation
//!
//! The 2004 flags live in a packed ring of u64 words. `head` is the physical
//! slot of logical offset 0, so a shift rotates `head` instead of moving data.
//! Logical offset `i` always corresponds to the integer `start + i`; two
//! windows compare equal when their starts, counts, and logical flags agree,
//! regardless of where their heads sit.
//!
//! ## Invariant
//!
//! `count == number of set flags`, and flag `i` is set iff the oracle accepts
//! `start + i`. [`SlidingWindow::advance`] consults the oracle before mutating
//! anything, so a panicking oracle leaves the window at its previous, valid
//! position.

use anyhow::{bail, Result};
use rayon::prelude::*;
use rug::Integer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::oracle::PrimalityOracle;

/// Integers per window.
pub const WINDOW_WIDTH: usize = 2004;

/// Prime count that makes a window a solution.
pub const TARGET_PRIMES: u32 = 12;

const WORDS: usize = WINDOW_WIDTH.div_ceil(64);

/// Direction in which a searcher moves the window start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Start increases by one per step.
    Forward,
    /// Start decreases by one per step.
    #[default]
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Backward => write!(f, "backward"),
        }
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "forward" | "up" | "ascending" => Ok(Direction::Forward),
            "backward" | "down" | "descending" => Ok(Direction::Backward),
            other => bail!("unknown direction '{}'", other),
        }
    }
}

#[derive(Clone)]
pub struct SlidingWindow {
    start: Integer,
    words: [u64; WORDS],
    head: usize,
    count: u32,
}

impl SlidingWindow {
    /// Evaluate all 2004 integers of the window at `start` (parallel oracle calls).
    pub fn initialize(oracle: &dyn PrimalityOracle, start: Integer) -> Self {
        let flags: Vec<bool> = (0..WINDOW_WIDTH)
            .into_par_iter()
            .map(|i| oracle.is_probable_prime(&Integer::from(&start + i as u32)))
            .collect();

        let mut window = SlidingWindow {
            start,
            words: [0; WORDS],
            head: 0,
            count: 0,
        };
        for (i, &prime) in flags.iter().enumerate() {
            if prime {
                window.set_slot(i, true);
                window.count += 1;
            }
        }
        window
    }

    /// Rebuild a window from a logical-order packed flag image
    /// (LSB-first bytes, as produced by [`SlidingWindow::packed_flags`]).
    ///
    /// Fails when the image is the wrong size or disagrees with `count`.
    pub fn from_packed(start: Integer, packed: &[u8], count: u32) -> Result<Self> {
        if packed.len() != WINDOW_WIDTH.div_ceil(8) {
            bail!(
                "flag image has {} bytes, expected {}",
                packed.len(),
                WINDOW_WIDTH.div_ceil(8)
            );
        }
        let mut window = SlidingWindow {
            start,
            words: [0; WORDS],
            head: 0,
            count: 0,
        };
        for i in 0..WINDOW_WIDTH {
            if packed[i / 8] & (1 << (i % 8)) != 0 {
                window.set_slot(i, true);
                window.count += 1;
            }
        }
        let tail_bits = WINDOW_WIDTH % 8;
        if tail_bits != 0 && packed[packed.len() - 1] >> tail_bits != 0 {
            bail!("flag image has bits set past offset {}", WINDOW_WIDTH - 1);
        }
        if window.count != count {
            bail!(
                "flag image holds {} primes but the record says {}",
                window.count,
                count
            );
        }
        Ok(window)
    }

    /// Shift the window one position in `direction`, testing only the
    /// integer that enters. Exactly one oracle call.
    pub fn advance(&mut self, oracle: &dyn PrimalityOracle, direction: Direction) {
        match direction {
            Direction::Backward => {
                let entering = Integer::from(&self.start - 1u32);
                let prime = oracle.is_probable_prime(&entering);
                // The slot before head holds logical offset 2003, which leaves.
                self.head = (self.head + WINDOW_WIDTH - 1) % WINDOW_WIDTH;
                self.replace_slot(self.head, prime);
                self.start = entering;
            }
            Direction::Forward => {
                let entering = Integer::from(&self.start + WINDOW_WIDTH as u32);
                let prime = oracle.is_probable_prime(&entering);
                // Logical offset 0 leaves; its slot becomes offset 2003.
                self.replace_slot(self.head, prime);
                self.head = (self.head + 1) % WINDOW_WIDTH;
                self.start += 1u32;
            }
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn start(&self) -> &Integer {
        &self.start
    }

    /// Last integer covered by the window.
    pub fn end(&self) -> Integer {
        Integer::from(&self.start + (WINDOW_WIDTH - 1) as u32)
    }

    pub fn is_solution(&self) -> bool {
        self.count == TARGET_PRIMES
    }

    /// Whether `start + offset` is a probable prime.
    pub fn flag(&self, offset: usize) -> bool {
        assert!(offset < WINDOW_WIDTH, "offset {} outside window", offset);
        self.slot((self.head + offset) % WINDOW_WIDTH)
    }

    /// Offsets (relative to `start`) of the primes in the window, ascending.
    pub fn prime_offsets(&self) -> Vec<usize> {
        (0..WINDOW_WIDTH).filter(|&i| self.flag(i)).collect()
    }

    /// Logical-order flag image, LSB-first, `ceil(2004 / 8)` bytes.
    pub fn packed_flags(&self) -> Vec<u8> {
        let mut out = vec![0u8; WINDOW_WIDTH.div_ceil(8)];
        for i in 0..WINDOW_WIDTH {
            if self.flag(i) {
                out[i / 8] |= 1 << (i % 8);
            }
        }
        out
    }

    fn replace_slot(&mut self, slot: usize, prime: bool) {
        if self.slot(slot) {
            self.count -= 1;
        }
        if prime {
            self.count += 1;
        }
        self.set_slot(slot, prime);
    }

    #[inline]
    fn slot(&self, slot: usize) -> bool {
        self.words[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    #[inline]
    fn set_slot(&mut self, slot: usize, value: bool) {
        if value {
            self.words[slot / 64] |= 1u64 << (slot % 64);
        } else {
            self.words[slot / 64] &= !(1u64 << (slot % 64));
        }
    }
}

impl PartialEq for SlidingWindow {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start
            && self.count == other.count
            && (0..WINDOW_WIDTH).all(|i| self.flag(i) == other.flag(i))
    }
}

impl Eq for SlidingWindow {}

impl fmt::Debug for SlidingWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingWindow")
            .field("start", &self.start)
            .field("count", &self.count)
            .field("prime_offsets", &self.prime_offsets())
            .finish()
    }
}

/// Count primes in `[start, start + 2003]` by testing every integer.
pub fn count_primes(oracle: &dyn PrimalityOracle, start: &Integer) -> u32 {
    (0..WINDOW_WIDTH)
        .filter(|&i| oracle.is_probable_prime(&Integer::from(start + i as u32)))
        .count() as u32
}

/// Like [`count_primes`], but stops once the window can no longer hold
/// exactly [`TARGET_PRIMES`] primes: either more have been seen, or too few
/// integers remain to reach the target. The result equals the true count
/// whenever it is [`TARGET_PRIMES`]; other values are lower or upper bounds.
pub fn count_primes_capped(oracle: &dyn PrimalityOracle, start: &Integer) -> u32 {
    let mut count = 0;
    for i in 0..WINDOW_WIDTH {
        let remaining = (WINDOW_WIDTH - i) as u32;
        if count + remaining < TARGET_PRIMES {
            return count;
        }
        if oracle.is_probable_prime(&Integer::from(start + i as u32)) {
            count += 1;
            if count > TARGET_PRIMES {
                return count;
            }
        }
    }
    count
}
