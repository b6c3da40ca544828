//! # K Value — Big-Integer Base of the Candidate Family
//!
//! Every candidate has the form `m * K + i - SL` with `K = P#/D`. `K` is
//! computed once per run with GMP's primorial and reused everywhere; the hot
//! path only ever needs `K mod p` for a 64-bit prime `p`.

use anyhow::{ensure, Result};
use rug::Integer;

/// Compute `K = P#/D`. Fails when `D` does not divide `P#` (i.e. `D` has a
/// prime factor above `P`, or a repeated factor).
pub fn init_k(p: u32, d: u64) -> Result<Integer> {
    ensure!(p >= 2, "P must be at least 2");
    ensure!(d >= 1, "D must be positive");
    let primorial = Integer::from(Integer::primorial(p));
    let d_int = Integer::from(d);
    ensure!(
        primorial.is_divisible(&d_int),
        "D={} does not divide {}#",
        d,
        p
    );
    Ok(primorial.div_exact(&d_int))
}

/// `K mod p` for arbitrary 64-bit `p`. Callers guarantee `p < 2^63`.
#[inline]
pub fn mod_u64(k: &Integer, p: u64) -> u64 {
    debug_assert!(p > 0 && p < (1u64 << 63));
    Integer::from(k % p)
        .to_u64()
        .expect("remainder of positive K is in [0, p)")
}

/// Natural log of `K`, accurate enough for merit and probability math even
/// when `K` has thousands of digits (where `to_f64` would overflow).
pub fn ln(k: &Integer) -> f64 {
    let bits = k.significant_bits();
    if bits <= 64 {
        return k.to_f64().ln();
    }
    let top = Integer::from(k >> (bits - 64));
    top.to_f64().ln() + f64::from(bits - 64) * std::f64::consts::LN_2
}

/// Decimal digit count, `floor(log10 K) + 1`, from the same bit-shift
/// machinery as [`ln`]. Can be off by one right at a power of ten.
pub fn digits(k: &Integer) -> u64 {
    if *k <= 1 {
        return 1;
    }
    (ln(k) / std::f64::consts::LN_10).floor() as u64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn k_small_primorials() {
        // 11# = 2310; D = 6 leaves 385 = 5 * 7 * 11.
        assert_eq!(init_k(11, 1).unwrap(), 2310);
        assert_eq!(init_k(11, 6).unwrap(), 385);
        assert_eq!(init_k(13, 30030).unwrap(), 1);
        assert_eq!(init_k(7, 2).unwrap(), 105);
    }

    #[test]
    fn k_rejects_non_divisor() {
        // 4 = 2^2 does not divide the squarefree 11#.
        assert!(init_k(11, 4).is_err());
        // 13 > 11 is not a factor of 11#.
        assert!(init_k(11, 13).is_err());
    }

    #[test]
    fn mod_u64_matches_direct() {
        let k = init_k(53, 1).unwrap();
        for p in [2u64, 3, 101, 4093, 999_983, 1_000_000_007] {
            let expect = Integer::from(&k % Integer::from(p)).to_u64().unwrap();
            assert_eq!(mod_u64(&k, p), expect, "K mod {}", p);
        }
    }

    #[test]
    fn mod_u64_factor_of_k_is_zero() {
        let k = init_k(53, 1).unwrap();
        assert_eq!(mod_u64(&k, 53), 0);
        assert_eq!(mod_u64(&k, 47), 0);
        assert_ne!(mod_u64(&k, 59), 0);
    }

    #[test]
    fn ln_agrees_with_f64_for_small_k() {
        let k = init_k(31, 1).unwrap();
        let direct = k.to_f64().ln();
        assert!((ln(&k) - direct).abs() < 1e-9);
    }

    #[test]
    fn ln_handles_huge_k() {
        let k = init_k(1511, 1).unwrap();
        // ln(1511#) = theta(1511), the Chebyshev function, near 1511 by PNT.
        let v = ln(&k);
        assert!(v > 1300.0 && v < 1700.0, "ln(1511#) = {}", v);
    }

    #[test]
    fn digit_estimate_close_to_exact() {
        let k = init_k(503, 1).unwrap();
        let exact = k.to_string_radix(10).len() as u64;
        assert!((digits(&k) as i64 - exact as i64).abs() <= 1);
    }
}
