//! # Config — Run Configuration and Derived Constants
//!
//! The configuration tuple `(P, D, M_start, M_inc, SL, MAX_PRIME,
//! min_merit)` identifies a run: it keys the `range` tables through a
//! deterministic hash and names the unknowns file. Everything here is
//! immutable after [`Config::validate`] fills the auto-set defaults.
//!
//! Validation failures are user errors (exit code 1), never panics.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{ensure, Result};
use rug::Integer;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{gcd, kvalue, primes};

#[derive(Clone, Debug, Serialize)]
pub struct Config {
    pub p: u32,
    pub d: u64,
    pub mstart: u64,
    pub minc: u64,
    /// Sieve half-length; 0 requests auto-set.
    pub sieve_length: u64,
    /// Upper bound on sieved primes; 0 requests auto-set.
    pub max_prime: u64,
    pub min_merit: f64,
    pub save_unknowns: bool,
    pub method1: bool,
    pub rle: bool,
    pub verbose: i32,
    pub threads: usize,
    #[serde(skip)]
    pub search_db: PathBuf,
    #[serde(skip)]
    pub records_db: PathBuf,
    #[serde(skip)]
    pub output_dir: PathBuf,
}

impl Config {
    /// Baseline used by unit tests; field values are overridden per test.
    pub fn for_tests() -> Config {
        Config {
            p: 31,
            d: 1,
            mstart: 1,
            minc: 1,
            sieve_length: 150,
            max_prime: 10_000,
            min_merit: 18.0,
            save_unknowns: true,
            method1: false,
            rle: false,
            verbose: 0,
            threads: 1,
            search_db: PathBuf::from("gapsieve.db"),
            records_db: PathBuf::from("gaps.db"),
            output_dir: PathBuf::from("."),
        }
    }

    /// `2*SL + 1`, the number of offsets in `[-SL, +SL]`.
    #[inline]
    pub fn sieve_interval(&self) -> u64 {
        2 * self.sieve_length + 1
    }

    /// Deterministic 63-bit id of the configuration tuple, with `max_prime`
    /// supplied by the caller so a cancellation-truncated run keys its own
    /// row.
    pub fn run_id(&self, max_prime: u64) -> u64 {
        let text = format!(
            "{}|{}|{}|{}|{}|{}|{:.3}",
            self.p, self.d, self.mstart, self.minc, self.sieve_length, max_prime, self.min_merit
        );
        let digest = Sha256::digest(text.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes) >> 1
    }

    /// Default unknowns-file path for the given (possibly truncated) bound.
    pub fn unknown_path(&self, max_prime: u64) -> PathBuf {
        let bound = if max_prime >= 1_000_000 && max_prime % 1_000_000 == 0 {
            format!("{}M", max_prime / 1_000_000)
        } else {
            format!("{}", max_prime)
        };
        self.output_dir.join(format!(
            "{}_{}_{}_{}_s{}_l{}.txt",
            self.p, self.d, self.mstart, self.minc, self.sieve_length, bound
        ))
    }

    /// Validate, filling the auto-set defaults for `sieve_length` and
    /// `max_prime`. Returns `K` for reuse.
    pub fn validate(&mut self) -> Result<Integer> {
        self.validate_inner(true)
    }

    /// Validation for the stats pass, which reads an existing unknowns file
    /// instead of refusing to overwrite one.
    pub fn validate_for_stats(&mut self) -> Result<Integer> {
        self.validate_inner(false)
    }

    fn validate_inner(&mut self, fresh_output: bool) -> Result<Integer> {
        ensure!(self.mstart >= 1, "mstart must be positive");
        ensure!(self.minc >= 1, "minc must be positive");
        ensure!(
            self.mstart.checked_add(self.minc).is_some(),
            "mstart + minc overflows"
        );
        ensure!(self.save_unknowns, "must set --save-unknowns");

        let p_primes = primes::generate_primes(u64::from(self.p));
        ensure!(
            p_primes.last() == Some(&u64::from(self.p)),
            "P={} is not prime",
            self.p
        );

        // Also proves every prime factor of D is at most P, with multiplicity.
        let k = kvalue::init_k(self.p, self.d)?;

        if self.sieve_length == 0 {
            self.auto_sieve_length(&k)?;
        } else {
            // An explicitly chosen SL must be proportionate to P; the
            // auto-set value answers to its own probability target instead.
            let (sl_low, sl_high) = (6 * u64::from(self.p), 22 * u64::from(self.p));
            ensure!(
                (sl_low..=sl_high).contains(&self.sieve_length),
                "sieve_length {} should be between [{}, {}]",
                self.sieve_length,
                sl_low,
                sl_high
            );
        }

        if self.max_prime == 0 {
            ensure!(
                !self.method1,
                "method 1 requires an explicit --max-prime"
            );
            let k_log = kvalue::ln(&k);
            self.max_prime = if k_log >= 1500.0 {
                100_000_000_000
            } else {
                10_000_000_000
            };
            info!(
                max_prime = self.max_prime,
                k_log = format_args!("{:.0}", k_log),
                "auto-set max_prime"
            );
        }
        ensure!(
            self.max_prime >= self.sieve_interval(),
            "max_prime {} is below the sieve interval {}",
            self.max_prime,
            self.sieve_interval()
        );
        ensure!(self.max_prime < 1u64 << 63, "max_prime must be below 2^63");

        if self.max_prime > 500_000_000 && self.p <= 8000 {
            let m_per = self.max_prime as f64 / (self.minc as f64 * self.sieve_length as f64);
            if m_per < 0.1 {
                warn!(
                    "max_prime {}B is probably too large for this range",
                    self.max_prime / 1_000_000_000
                );
            }
        }

        if fresh_output && self.save_unknowns {
            let path = self.unknown_path(self.max_prime);
            ensure!(
                !path.exists(),
                "output file '{}' already exists",
                path.display()
            );
        }

        Ok(k)
    }

    /// Grow SL until the chance that every coprime offset in the window is
    /// composite falls below 0.8%, using the worst residue class of
    /// `m mod D` so no searched `m` is short-changed.
    fn auto_sieve_length(&mut self, k: &Integer) -> Result<()> {
        ensure!(
            self.p >= 503,
            "sieve_length auto-set needs P >= 503; pass --sieve-length"
        );
        ensure!(
            self.d <= 30030,
            "sieve_length auto-set needs D <= 30030; pass --sieve-length"
        );

        let n_log = kvalue::ln(k) + (self.mstart as f64).ln();
        let mut prob_prime_coprime = 1.0 / n_log - 1.0 / (n_log * n_log);
        let mut k_primes = primes::generate_primes(u64::from(self.p));
        for &q in &k_primes {
            prob_prime_coprime /= 1.0 - 1.0 / q as f64;
        }
        k_primes.retain(|&q| self.d % q != 0);

        let d = self.d;
        let base = if d > 1 { kvalue::mod_u64(k, d) } else { 0 };

        // Distances from the window edge to the nearest multiple of each
        // residue class of m*K mod D, both directions.
        let mut count_by_mod_d = vec![0u32; d as usize];
        for mi in 0..self.minc {
            let m = self.mstart + mi;
            if gcd(m, d) == 1 {
                let center = (m % d) * base % d;
                count_by_mod_d[center as usize] += 1;
                count_by_mod_d[((d - center) % d) as usize] += 1;
            }
        }
        let mut coprime_by_mod_d: BTreeMap<u64, u64> = BTreeMap::new();
        for (residue, &count) in count_by_mod_d.iter().enumerate() {
            if count > 0 {
                coprime_by_mod_d.insert(residue as u64, 0);
            }
        }
        ensure!(
            !coprime_by_mod_d.is_empty(),
            "no m in [{}, {}) is coprime to D={}",
            self.mstart,
            self.mstart + self.minc,
            d
        );

        for t_sl in 1u64.. {
            if k_primes.iter().any(|&q| t_sl % q == 0) {
                // Offset has a factor of K; same counts as last round.
                continue;
            }
            for (&center, count) in coprime_by_mod_d.iter_mut() {
                if gcd(center + t_sl, d) == 1 {
                    *count += 1;
                }
            }
            let min_coprime = coprime_by_mod_d.values().copied().min().unwrap_or(t_sl);

            let prob_gap_shorter = (1.0 - prob_prime_coprime).powf(min_coprime as f64);
            if prob_gap_shorter <= 0.008 {
                self.sieve_length = t_sl;
                info!(
                    sieve_length = t_sl,
                    coprime = min_coprime,
                    prob_gap_longer = format_args!("{:.2}%", 100.0 * prob_gap_shorter),
                    "auto-set sieve length"
                );
                break;
            }
        }
        ensure!(self.sieve_length > 100, "sieve length auto-set failed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn valid_config(dir: &std::path::Path) -> Config {
        let mut cfg = Config::for_tests();
        cfg.p = 503;
        cfg.d = 1;
        cfg.mstart = 1;
        cfg.minc = 10;
        cfg.sieve_length = 3100;
        cfg.max_prime = 1_000_000;
        cfg.output_dir = dir.to_path_buf();
        cfg
    }

    #[test]
    fn accepts_valid_config() {
        let dir = tempdir().unwrap();
        let mut cfg = valid_config(dir.path());
        let k = cfg.validate().unwrap();
        assert!(k > 0);
    }

    #[test]
    fn rejects_composite_p() {
        let dir = tempdir().unwrap();
        let mut cfg = valid_config(dir.path());
        cfg.p = 500;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_sl_outside_bounds() {
        let dir = tempdir().unwrap();
        for sl in [100, 6 * 503 - 1, 22 * 503 + 1] {
            let mut cfg = valid_config(dir.path());
            cfg.sieve_length = sl;
            assert!(cfg.validate().is_err(), "sl={}", sl);
        }
    }

    #[test]
    fn rejects_max_prime_below_interval() {
        let dir = tempdir().unwrap();
        let mut cfg = valid_config(dir.path());
        cfg.max_prime = 2 * cfg.sieve_length; // one short of the interval
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_missing_save_unknowns() {
        let dir = tempdir().unwrap();
        let mut cfg = valid_config(dir.path());
        cfg.save_unknowns = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_existing_output_file() {
        let dir = tempdir().unwrap();
        let mut cfg = valid_config(dir.path());
        std::fs::write(cfg.unknown_path(cfg.max_prime), "occupied").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_auto_max_prime_with_method1() {
        let dir = tempdir().unwrap();
        let mut cfg = valid_config(dir.path());
        cfg.max_prime = 0;
        cfg.method1 = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn auto_max_prime_by_k_size() {
        let dir = tempdir().unwrap();
        let mut cfg = valid_config(dir.path());
        cfg.max_prime = 0;
        cfg.validate().unwrap();
        assert_eq!(cfg.max_prime, 10_000_000_000); // ln(503#) < 1500

        let mut big = valid_config(dir.path());
        big.p = 1999;
        big.sieve_length = 6 * 1999;
        big.max_prime = 0;
        big.validate().unwrap();
        assert_eq!(big.max_prime, 100_000_000_000); // ln(1999#) ~ 1960
    }

    #[test]
    fn auto_sieve_length_reaches_probability_target() {
        let dir = tempdir().unwrap();
        let mut cfg = valid_config(dir.path());
        cfg.sieve_length = 0;
        cfg.validate().unwrap();
        // Ballpark for P=503: a couple thousand offsets per side.
        assert!(cfg.sieve_length > 1000, "sl={}", cfg.sieve_length);
        assert!(cfg.sieve_length < 22 * 503, "sl={}", cfg.sieve_length);
    }

    #[test]
    fn auto_sieve_length_with_wheel_d() {
        let dir = tempdir().unwrap();
        let mut cfg = valid_config(dir.path());
        cfg.d = 210;
        cfg.minc = 100;
        cfg.sieve_length = 0;
        cfg.validate().unwrap();
        assert!(cfg.sieve_length > 100);
    }

    #[test]
    fn run_id_is_deterministic_and_sensitive() {
        let cfg = Config::for_tests();
        assert_eq!(cfg.run_id(1000), cfg.run_id(1000));
        assert_ne!(cfg.run_id(1000), cfg.run_id(2000));
        let mut other = Config::for_tests();
        other.minc += 1;
        assert_ne!(cfg.run_id(1000), other.run_id(1000));
    }

    #[test]
    fn unknown_path_formats_bound() {
        let cfg = Config::for_tests();
        let path = cfg.unknown_path(10_000_000_000);
        assert!(path.to_string_lossy().ends_with("31_1_1_1_s150_l10000M.txt"));
        let path = cfg.unknown_path(12_345);
        assert!(path.to_string_lossy().ends_with("31_1_1_1_s150_l12345.txt"));
    }
}
