//! # Wheel — Coprime Reindexing of the (m, i) Space
//!
//! The logical composite array `composite[m][x]` (with `x = i + SL` in
//! `[0, 2*SL]`) is mostly dead weight: offsets sharing a factor with `K` can
//! never be prime, and `m` values sharing a factor with `D` are never
//! searched. This module builds the dense reindexing that method 2 sieves
//! into:
//!
//! - the `m` axis keeps only `gcd(M_start + mi, D) = 1` rows;
//! - the `x` axis keeps only offsets coprime to every prime factor of `K`;
//! - a small wheel `W = gcd(D, 2*3*5*7)` additionally drops, per residue of
//!   `m mod W`, the offsets whose candidate is divisible by a factor of `W`.
//!
//! Dense index 0 is reserved: every offset removed here maps to 0, and bit 0
//! of each composite row is pre-set, so sieve writes against removed offsets
//! are harmless no-ops.

use rug::Integer;

use crate::config::Config;
use crate::{gcd, kvalue, primes};

/// Sentinel in `m_reindex` for `m` values sharing a factor with `D`.
pub const M_ABSENT: i32 = -1;

pub struct Reindex {
    /// `mi` values with `gcd(M_start + mi, D) = 1`, ascending.
    pub valid_mi: Vec<u64>,
    /// Dense row index per `mi`, or [`M_ABSENT`].
    pub m_reindex: Vec<i32>,
    /// Fast-path flag mirroring `m_reindex < 0`.
    pub m_not_coprime: Vec<bool>,
    /// Offsets `x` in `[0, 2*SL]` coprime to `K`, ascending.
    pub coprime_x: Vec<u32>,
    /// Per-offset coprimality flag (`x_coprime[SL]` is always false).
    pub x_coprime: Vec<bool>,
    /// Wheel modulus `W = gcd(D, 210)`; 1 disables the wheel.
    pub wheel: u64,
    /// Per `w = m mod W` (coprime `w` only, others empty): dense index for
    /// each offset, 0 when the offset is dropped for that residue.
    pub i_reindex_wheel: Vec<Vec<u32>>,
    /// Count of kept offsets per residue (row length is count + 1).
    pub wheel_counts: Vec<usize>,
}

impl Reindex {
    pub fn build(config: &Config, k: &Integer) -> Reindex {
        let m_inc = config.minc;
        let interval = config.sieve_interval() as usize;
        let sl = config.sieve_length;

        let mut valid_mi = Vec::new();
        let mut m_reindex = vec![M_ABSENT; m_inc as usize];
        let mut m_not_coprime = vec![true; m_inc as usize];
        for mi in 0..m_inc {
            if gcd(config.mstart + mi, config.d) == 1 {
                m_reindex[mi as usize] = valid_mi.len() as i32;
                m_not_coprime[mi as usize] = false;
                valid_mi.push(mi);
            }
        }

        // Offsets with a factor of K: for q | K (q <= P, q not a factor of
        // D), the candidate m*K + x - SL is divisible by q exactly when
        // x = SL (mod q), for every m.
        let mut x_coprime = vec![true; interval];
        for &q in &primes::generate_primes(u64::from(config.p)) {
            if config.d % q == 0 {
                continue;
            }
            let mut x = (sl % q) as usize;
            while x < interval {
                x_coprime[x] = false;
                x += q as usize;
            }
        }
        assert!(!x_coprime[sl as usize], "center must be composite");

        let mut coprime_x = Vec::new();
        for (x, &ok) in x_coprime.iter().enumerate() {
            if ok {
                coprime_x.push(x as u32);
            }
        }

        let wheel = gcd(config.d, 2 * 3 * 5 * 7);
        let k_mod_w = if wheel > 1 { kvalue::mod_u64(k, wheel) } else { 0 };

        let mut i_reindex_wheel = vec![Vec::new(); wheel as usize];
        let mut wheel_counts = vec![0usize; wheel as usize];
        // w = 0 is the only residue of the trivial wheel (m mod 1 == 0).
        for w in 0..wheel {
            if gcd(w, wheel) > 1 {
                continue;
            }
            let mut table = vec![0u32; interval];
            // (m*K - SL) mod W for m = w (mod W).
            let mod_low = (w * k_mod_w % wheel + wheel - sl % wheel) % wheel;
            let mut count = 0u32;
            for x in 0..interval {
                if x_coprime[x] && gcd(mod_low + x as u64, wheel) == 1 {
                    count += 1;
                    table[x] = count;
                }
            }
            assert_eq!(table[sl as usize], 0);
            wheel_counts[w as usize] = count as usize;
            i_reindex_wheel[w as usize] = table;
        }

        Reindex {
            valid_mi,
            m_reindex,
            m_not_coprime,
            coprime_x,
            x_coprime,
            wheel,
            i_reindex_wheel,
            wheel_counts,
        }
    }

    /// Dense index of offset `x` for the row of `m`, 0 when dropped.
    #[inline]
    pub fn index_for(&self, m: u64, x: usize) -> u32 {
        self.i_reindex_wheel[(m % self.wheel) as usize][x]
    }

    /// Composite-row length for `m` (kept offsets + reserved bit 0).
    #[inline]
    pub fn row_len(&self, m: u64) -> usize {
        self.wheel_counts[(m % self.wheel) as usize] + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config(p: u32, d: u64, mstart: u64, minc: u64, sl: u64) -> Config {
        let mut cfg = Config::for_tests();
        cfg.p = p;
        cfg.d = d;
        cfg.mstart = mstart;
        cfg.minc = minc;
        cfg.sieve_length = sl;
        cfg
    }

    #[test]
    fn m_axis_keeps_exactly_coprime_values() {
        let cfg = test_config(11, 6, 1, 30, 60);
        let k = kvalue::init_k(11, 6).unwrap();
        let ri = Reindex::build(&cfg, &k);

        for mi in 0..30u64 {
            let coprime = gcd(1 + mi, 6) == 1;
            assert_eq!(ri.m_reindex[mi as usize] >= 0, coprime, "mi={}", mi);
            assert_eq!(ri.m_not_coprime[mi as usize], !coprime);
        }
        assert_eq!(ri.valid_mi.len(), 10); // phi(6)/6 * 30
    }

    #[test]
    fn x_axis_crosses_off_factors_of_k() {
        // P=11, D=6: K = 385 = 5*7*11; only 5, 7, 11 divide K.
        let cfg = test_config(11, 6, 1, 1, 30);
        let k = kvalue::init_k(11, 6).unwrap();
        let ri = Reindex::build(&cfg, &k);

        for x in 0..=60usize {
            let dist = x as i64 - 30;
            let divisible = [5i64, 7, 11].iter().any(|&q| dist.rem_euclid(q) == 0);
            assert_eq!(ri.x_coprime[x], !divisible, "x={}", x);
        }
        assert!(!ri.x_coprime[30], "center");
    }

    #[test]
    fn wheel_residue_tables_drop_wheel_divisors() {
        // Hand-enumerable: P=11, D=6, SL=30, W = gcd(6, 210) = 6,
        // K = 385, K mod 6 = 1.
        let cfg = test_config(11, 6, 1, 6, 30);
        let k = kvalue::init_k(11, 6).unwrap();
        let ri = Reindex::build(&cfg, &k);
        assert_eq!(ri.wheel, 6);

        for w in [1u64, 5] {
            let table = &ri.i_reindex_wheel[w as usize];
            assert_eq!(table.len(), 61);
            assert_eq!(table[30], 0, "center reserved for w={}", w);
            let mut seen = 0u32;
            for x in 0..=60usize {
                // Candidate residue mod 6 is (w*1 + x - 30) mod 6.
                let expect = ri.x_coprime[x]
                    && gcd((w as i64 + x as i64 - 30).rem_euclid(6) as u64, 6) == 1;
                if expect {
                    seen += 1;
                    assert_eq!(table[x], seen, "w={} x={}", w, x);
                } else {
                    assert_eq!(table[x], 0, "w={} x={}", w, x);
                }
            }
            assert_eq!(ri.wheel_counts[w as usize], seen as usize);
        }
        // Non-coprime residues get no table.
        for w in [0usize, 2, 3, 4] {
            assert!(ri.i_reindex_wheel[w].is_empty());
        }
    }

    #[test]
    fn trivial_wheel_when_d_is_one() {
        let cfg = test_config(11, 1, 1, 4, 30);
        let k = kvalue::init_k(11, 1).unwrap();
        let ri = Reindex::build(&cfg, &k);

        assert_eq!(ri.wheel, 1);
        // Single residue class; table collapses to the plain i_reindex.
        let table = &ri.i_reindex_wheel[0];
        let mut count = 0u32;
        for x in 0..=60usize {
            if ri.x_coprime[x] {
                count += 1;
                assert_eq!(table[x], count);
            } else {
                assert_eq!(table[x], 0);
            }
        }
        assert_eq!(count as usize, ri.coprime_x.len());
        // All m map to the one residue.
        assert_eq!(ri.row_len(7), ri.row_len(8));
    }

    #[test]
    fn coprime_count_is_even() {
        // Offsets pair symmetrically around the center.
        let cfg = test_config(31, 1, 1, 1, 200);
        let k = kvalue::init_k(31, 1).unwrap();
        let ri = Reindex::build(&cfg, &k);
        assert_eq!(ri.coprime_x.len() % 2, 0);
    }
}
