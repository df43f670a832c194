//! # Sieve — Small Primes and Word-Sized Modular Arithmetic
//!
//! Helpers for the primality oracle: the trial-division table, `pow_mod`
//! over u128 products for any u64 modulus, and a Montgomery context that
//! keeps Miller–Rabin on odd moduli below 2^63 free of division.
//!
//! Montgomery form of `a` is `a·2^64 mod n`. Products are reduced with
//! `(t + m·n) >> 64`, where `m = t·(−n⁻¹) mod 2^64` makes the low word zero.

/// Every prime `p <= limit`, ascending. Odd-only sieve of Eratosthenes.
pub fn generate_primes(limit: u64) -> Vec<u64> {
    if limit < 2 {
        return Vec::new();
    }
    // Slot i stands for 2i + 1.
    let slots = (limit as usize - 1) / 2 + 1;
    let mut composite = vec![false; slots];
    let mut i = 1;
    while (2 * i + 1) * (2 * i + 1) <= limit as usize {
        if !composite[i] {
            let p = 2 * i + 1;
            let mut j = p * p / 2;
            while j < slots {
                composite[j] = true;
                j += p;
            }
        }
        i += 1;
    }
    let mut primes = vec![2];
    primes.extend(
        (1..slots)
            .filter(|&i| !composite[i])
            .map(|i| (2 * i + 1) as u64),
    );
    primes
}

/// base^exp mod modulus, with u128 products so any u64 modulus is safe.
pub fn pow_mod(mut base: u64, mut exp: u64, modulus: u64) -> u64 {
    if modulus == 1 {
        return 0;
    }
    let mut result: u64 = 1;
    base %= modulus;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, modulus);
        }
        exp >>= 1;
        base = mul_mod(base, base, modulus);
    }
    result
}

#[inline]
pub fn mul_mod(a: u64, b: u64, modulus: u64) -> u64 {
    (a as u128 * b as u128 % modulus as u128) as u64
}

/// Montgomery arithmetic for a fixed odd modulus 1 < n < 2^63.
#[derive(Clone, Copy, Debug)]
pub struct MontgomeryCtx {
    pub n: u64,
    /// −n⁻¹ mod 2^64
    neg_inv: u64,
    /// 2^64 mod n
    one: u64,
    /// 2^128 mod n
    r_squared: u64,
}

impl MontgomeryCtx {
    /// Moduli at or above this could overflow the u128 sum in `reduce`.
    pub const MAX_MODULUS: u64 = 1 << 63;

    pub fn new(n: u64) -> Self {
        debug_assert!(n > 1 && n & 1 == 1 && n < Self::MAX_MODULUS);

        // Newton iteration: each step doubles the correct low bits of n⁻¹.
        let mut inv = n;
        for _ in 0..5 {
            inv = inv.wrapping_mul(2u64.wrapping_sub(n.wrapping_mul(inv)));
        }
        let one = ((1u128 << 64) % n as u128) as u64;
        MontgomeryCtx {
            n,
            neg_inv: inv.wrapping_neg(),
            one,
            r_squared: mul_mod(one, one, n),
        }
    }

    /// Converts `a` into Montgomery form.
    #[inline]
    pub fn to_mont(&self, a: u64) -> u64 {
        self.mul(a % self.n, self.r_squared)
    }

    #[inline]
    fn reduce(&self, t: u128) -> u64 {
        let m = (t as u64).wrapping_mul(self.neg_inv);
        let r = ((t + m as u128 * self.n as u128) >> 64) as u64;
        if r >= self.n {
            r - self.n
        } else {
            r
        }
    }

    #[inline]
    pub fn mul(&self, a: u64, b: u64) -> u64 {
        self.reduce(a as u128 * b as u128)
    }

    #[inline]
    pub fn sqr(&self, a: u64) -> u64 {
        self.mul(a, a)
    }

    /// `base` and the result are in Montgomery form.
    pub fn pow_mod(&self, mut base: u64, mut exp: u64) -> u64 {
        let mut result = self.one;
        while exp > 0 {
            if exp & 1 == 1 {
                result = self.mul(result, base);
            }
            exp >>= 1;
            base = self.sqr(base);
        }
        result
    }

    #[inline]
    pub fn one(&self) -> u64 {
        self.one
    }
}
