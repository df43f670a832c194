//! # Oracle — Probable-Prime Decision Procedure
//!
//! Every other component treats primality as a black box behind the
//! [`PrimalityOracle`] trait. The stock implementation, [`MillerRabin`], is
//! exact below 2^64 and probabilistic above:
//!
//! | Magnitude | Method | Error |
//! |-----------|--------|-------|
//! | n < 2 | rejected | none |
//! | any | trial division by primes < 1000 | none |
//! | n < 998² | trial division alone is a proof | none |
//! | n < 2^64 | strong-probable-prime test, bases 2..37 | none (deterministic below 3.3·10^24) |
//! | n ≥ 2^64 | GMP Baillie–PSW + `rounds` random-base Miller–Rabin | ≤ 4^-rounds |
//!
//! The oracle holds no mutable state, so one instance is shared by every
//! worker thread.

use rug::integer::IsPrime;
use rug::Integer;
use std::sync::{Arc, OnceLock};

use crate::sieve::{self, MontgomeryCtx};

/// Primes below this bound are used for trial division.
pub const TRIAL_DIVISION_LIMIT: u64 = 1000;

/// Default number of Miller–Rabin rounds for candidates of 64 bits and more.
pub const DEFAULT_MR_ROUNDS: u32 = 25;

/// Fixed witness set; deterministic for every n < 3.317·10^24.
const WITNESSES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

/// Decides whether an integer is (probably) prime.
///
/// Implementations must return `false` for n < 2, must be exact for n < 2^64,
/// and must be safe to call concurrently without shared mutable state.
pub trait PrimalityOracle: Send + Sync {
    fn is_probable_prime(&self, n: &Integer) -> bool;
}

impl<T: PrimalityOracle + ?Sized> PrimalityOracle for Arc<T> {
    fn is_probable_prime(&self, n: &Integer) -> bool {
        (**self).is_probable_prime(n)
    }
}

impl<T: PrimalityOracle + ?Sized> PrimalityOracle for &T {
    fn is_probable_prime(&self, n: &Integer) -> bool {
        (**self).is_probable_prime(n)
    }
}

/// Trial division + Miller–Rabin oracle.
#[derive(Clone, Copy, Debug)]
pub struct MillerRabin {
    rounds: u32,
}

impl MillerRabin {
    pub fn new(rounds: u32) -> Self {
        MillerRabin {
            rounds: rounds.max(1),
        }
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }
}

impl Default for MillerRabin {
    fn default() -> Self {
        MillerRabin::new(DEFAULT_MR_ROUNDS)
    }
}

impl PrimalityOracle for MillerRabin {
    fn is_probable_prime(&self, n: &Integer) -> bool {
        if *n < 2u32 {
            return false;
        }
        let primes = small_primes();
        for &p in primes {
            if n.is_divisible_u(p as u32) {
                return *n == p;
            }
        }
        match n.to_u64() {
            Some(v) => {
                let bound = primes.last().copied().unwrap_or(1) + 1;
                v < bound * bound || is_prime_u64(v)
            }
            None => mr_screened_test(n, self.rounds) != IsPrime::No,
        }
    }
}

/// Trial-division table: all primes below [`TRIAL_DIVISION_LIMIT`].
pub fn small_primes() -> &'static [u64] {
    static TABLE: OnceLock<Vec<u64>> = OnceLock::new();
    TABLE.get_or_init(|| sieve::generate_primes(TRIAL_DIVISION_LIMIT - 1))
}

/// Quick check if n is divisible by a tabled small prime other than itself.
/// `true` means definitely composite; `false` means it might be prime.
pub fn has_small_factor(n: &Integer) -> bool {
    for &p in small_primes() {
        if n.is_divisible_u(p as u32) {
            return *n > p;
        }
    }
    false
}

/// Two-round pre-screen before the full GMP test; most composites fail early.
pub fn mr_screened_test(candidate: &Integer, mr_rounds: u32) -> IsPrime {
    if mr_rounds > 2 && candidate.is_probably_prime(2) == IsPrime::No {
        return IsPrime::No;
    }
    candidate.is_probably_prime(mr_rounds)
}

/// Deterministic primality for odd n > 37 with no factor below 1000.
fn is_prime_u64(n: u64) -> bool {
    debug_assert!(n & 1 == 1 && n > WITNESSES[WITNESSES.len() - 1]);
    let mut d = n - 1;
    let mut s = 0u32;
    while d & 1 == 0 {
        d >>= 1;
        s += 1;
    }
    if n < MontgomeryCtx::MAX_MODULUS {
        let ctx = MontgomeryCtx::new(n);
        WITNESSES.iter().all(|&a| strong_witness_mont(&ctx, d, s, a))
    } else {
        WITNESSES.iter().all(|&a| strong_witness_plain(n, d, s, a))
    }
}

/// True if n passes the strong-probable-prime test to base a.
fn strong_witness_mont(ctx: &MontgomeryCtx, d: u64, s: u32, a: u64) -> bool {
    let one = ctx.one();
    let minus_one = ctx.to_mont(ctx.n - 1);
    let mut x = ctx.pow_mod(ctx.to_mont(a), d);
    if x == one || x == minus_one {
        return true;
    }
    for _ in 1..s {
        x = ctx.sqr(x);
        if x == minus_one {
            return true;
        }
    }
    false
}

fn strong_witness_plain(n: u64, d: u64, s: u32, a: u64) -> bool {
    let mut x = sieve::pow_mod(a, d, n);
    if x == 1 || x == n - 1 {
        return true;
    }
    for _ in 1..s {
        x = sieve::mul_mod(x, x, n);
        if x == n - 1 {
            return true;
        }
    }
    false
}
