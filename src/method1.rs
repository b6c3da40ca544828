//! # Method 1 — Per-Prime Queue Sieve
//!
//! Processes `m` values one at a time with a pair of side-buffers. Small
//! primes (below [`SMALL_PRIME_LIMIT`]) stride-mark both sides for every
//! row. Each large prime touches the window at most once per `m`, so it is
//! enqueued at the smallest `mi` it divides; after marking its single bit
//! the prime reruns the modular search and hops to the pending list of its
//! next row. Across the whole run each large prime lives in at most one
//! pending list at a time, and a row's list is freed as soon as the row is
//! written.

use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;
use crate::unknowns::UnknownsWriter;
use crate::{db, gcd, kvalue, modsearch, primes, SieveSummary};

/// Any prime above this bound touches `[-SL, SL]` at most once per `m`
/// (asserted against `2*SL` at startup).
pub const SMALL_PRIME_LIMIT: u64 = 400_000;

pub fn sieve(config: &Config) -> Result<SieveSummary> {
    let m_start = config.mstart;
    let m_inc = config.minc;
    let d = config.d;
    let sl = config.sieve_length;
    let max_prime = config.max_prime;

    assert!(
        SMALL_PRIME_LIMIT > 2 * sl,
        "small-prime limit must cover every prime that can hit twice"
    );

    let k = kvalue::init_k(config.p, d)?;

    let setup_start = Instant::now();

    // Pass over all primes once: small ones into a flat table, large ones
    // into the pending list of the first row they touch.
    let mut prime_and_remainder: Vec<(u64, u64)> = Vec::new();
    let mut pending: Vec<Vec<(u64, u64)>> = vec![Vec::new(); m_inc as usize];
    let mut pi: u64 = 0;
    let mut enqueued: u64 = 0;
    let mut expected_per_m = 0f64;
    {
        let expected_pi = primes::primepi_estimate(max_prime);
        let mut stream = primes::PrimeStream::new(0);
        loop {
            let p = stream.next_prime();
            if p > max_prime {
                break;
            }
            pi += 1;
            if pi % (expected_pi / 20 + 1) == 0 {
                info!(prime = p, "queue placement {}%", pi * 100 / expected_pi.max(1));
            }

            let base_r = kvalue::mod_u64(&k, p);
            if p <= SMALL_PRIME_LIMIT {
                prime_and_remainder.push((p, base_r));
                continue;
            }
            if base_r == 0 {
                // Divides K itself; touches nothing but the center.
                continue;
            }

            expected_per_m += (2 * sl + 1) as f64 / p as f64;
            let mi = modsearch::next_coprime_m(m_start, d, m_inc, sl, p, base_r);
            if mi == m_inc {
                continue;
            }
            pending[mi as usize].push((p, base_r));
            enqueued += 1;
        }
    }
    info!(
        pi,
        small = prime_and_remainder.len(),
        enqueued,
        secs = format_args!("{:.1}", setup_start.elapsed().as_secs_f64()),
        "method 1 setup done"
    );

    let path = config.unknown_path(max_prime);
    info!("saving unknowns to '{}'", path.display());
    let mut writer = UnknownsWriter::create(&path, config.rle)?;

    let sieve_start = Instant::now();
    let mut lower = vec![false; sl as usize + 1];
    let mut upper = vec![false; sl as usize + 1];
    let mut low_list: Vec<u32> = Vec::new();
    let mut high_list: Vec<u32> = Vec::new();

    let mut tests: u64 = 0;
    let mut total_unknown: u64 = 0;
    let mut large_tested: u64 = 0;

    #[cfg(feature = "validate-factors")]
    let validate = |m: u64, p: u64, offset: i64| {
        use rug::Integer;
        let n = Integer::from(&k * m) + offset;
        assert!(
            n.is_divisible(&Integer::from(p)),
            "claimed factor {} of m={} offset {}",
            p,
            m,
            offset
        );
    };

    let valid_rows = (0..m_inc).filter(|&mi| gcd(m_start + mi, d) == 1).count() as u64;

    for mi in 0..m_inc {
        let m = m_start + mi;
        if gcd(m, d) > 1 {
            debug_assert!(pending[mi as usize].is_empty());
            continue;
        }

        lower.fill(false);
        upper.fill(false);
        // Center is always composite.
        lower[0] = true;
        upper[0] = true;

        for &(p, r) in &prime_and_remainder {
            let modulo = (r as u128 * m as u128 % p as u128) as u64;
            let mut x = modulo;
            while x <= sl {
                lower[x as usize] = true;
                x += p;
            }
            // Skipping modulo == 0 on this side is fine: that bit is the
            // pre-set center.
            let mut x = p - modulo;
            while x <= sl {
                upper[x as usize] = true;
                x += p;
            }
        }

        let row_queue = std::mem::take(&mut pending[mi as usize]);
        large_tested += row_queue.len() as u64;
        for (p, r) in row_queue {
            let modulo = (r as u128 * m as u128 % p as u128) as u64;
            if modulo <= sl {
                lower[modulo as usize] = true;
                #[cfg(feature = "validate-factors")]
                validate(m, p, -(modulo as i64));
            } else {
                let first_positive = p - modulo;
                assert!(first_positive <= sl, "queued prime {} missed row {}", p, mi);
                upper[first_positive as usize] = true;
                #[cfg(feature = "validate-factors")]
                validate(m, p, first_positive as i64);
            }

            // Hop to this prime's next row.
            let start = mi + 1;
            if start < m_inc {
                let next =
                    start + modsearch::next_coprime_m(m_start + start, d, m_inc - start, sl, p, r);
                if next < m_inc {
                    pending[next as usize].push((p, r));
                }
            }
        }

        low_list.clear();
        high_list.clear();
        for x in 1..=sl as usize {
            if !lower[x] {
                low_list.push(x as u32);
            }
            if !upper[x] {
                high_list.push(x as u32);
            }
        }
        total_unknown += (low_list.len() + high_list.len()) as u64;
        writer.write_row(mi, &low_list, &high_list)?;

        tests += 1;
        let is_last = tests == valid_rows;
        if matches!(tests, 1 | 10 | 100 | 500 | 1000) || tests % 5000 == 0 || is_last {
            let secs = sieve_start.elapsed().as_secs_f64();
            info!(
                m,
                unknown_low = low_list.len(),
                unknown_high = high_list.len(),
                tests,
                avg_unknown = format_args!("{:.2}", total_unknown as f64 / tests as f64),
                rate = format_args!("{:.2}/sec", tests as f64 / secs.max(1e-9)),
                "row sieved"
            );
        }
    }

    // Every queued prime must have drained through its last row.
    for (mi, q) in pending.iter().enumerate() {
        assert!(q.is_empty(), "pending list {} not drained", mi);
    }

    if tests > 0 && expected_per_m > 0.0 {
        let per_m = large_tested as f64 / tests as f64;
        let err = 100.0 * (expected_per_m - per_m).abs() / expected_per_m;
        if err > 0.5 {
            info!(
                observed = format_args!("{:.1}", per_m),
                expected = format_args!("{:.1}", expected_per_m),
                "large primes per m off by {:.2}%",
                err
            );
        }
    }

    writer.finish()?;
    let seconds = setup_start.elapsed().as_secs_f64();

    // Bookkeeping row; sieve output is already on disk, so store failures
    // only warn.
    if let Err(e) = db::SearchDb::open(&config.search_db)
        .and_then(|sdb| sdb.insert_range_sieve(config, max_prime, tests, seconds))
        .context("recording range in search db")
    {
        warn!("{e:#}");
    }

    Ok(SieveSummary {
        rows_written: tests,
        seconds,
        cancelled: false,
        effective_max_prime: max_prime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::unknowns::UnknownsReader;
    use rug::Integer;
    use tempfile::TempDir;

    fn run(config: &mut Config) -> (TempDir, Vec<crate::unknowns::UnknownLine>) {
        let dir = TempDir::new().unwrap();
        config.output_dir = dir.path().to_path_buf();
        config.search_db = dir.path().join("search.db");
        let summary = sieve(config).unwrap();
        let mut reader = UnknownsReader::open(&config.unknown_path(config.max_prime)).unwrap();
        let mut rows = Vec::new();
        while let Some(r) = reader.next_row().unwrap() {
            rows.push(r);
        }
        assert_eq!(rows.len() as u64, summary.rows_written);
        (dir, rows)
    }

    /// Reference sieve: one direct modular pass per prime, no queues, no
    /// stride tricks. The queued path in method 1 must agree with it.
    fn reference_unknowns(
        k: &Integer,
        m: u64,
        sl: u64,
        check_primes: &[u64],
    ) -> (Vec<u32>, Vec<u32>) {
        let mut lower = vec![false; sl as usize + 1];
        let mut upper = vec![false; sl as usize + 1];
        lower[0] = true;
        upper[0] = true;
        for &p in check_primes {
            let r = kvalue::mod_u64(k, p);
            let modulo = (r as u128 * m as u128 % p as u128) as u64;
            // m*K - x divisible by p at x = modulo (mod p).
            let mut x = modulo;
            while x <= sl {
                lower[x as usize] = true;
                x += p;
            }
            let mut x = (p - modulo) % p;
            while x <= sl {
                upper[x as usize] = true;
                x += p;
            }
        }
        lower[0] = true;
        upper[0] = true;
        let collect = |side: &[bool]| {
            (1..=sl as u32)
                .filter(|&x| !side[x as usize])
                .collect::<Vec<u32>>()
        };
        (collect(&lower), collect(&upper))
    }

    #[test]
    fn tiny_run_matches_reference_sieve() {
        let mut cfg = Config::for_tests();
        cfg.p = 31;
        cfg.d = 1;
        cfg.mstart = 1;
        cfg.minc = 3;
        cfg.sieve_length = 150;
        cfg.max_prime = 500_000; // just above SMALL_PRIME_LIMIT
        let k = kvalue::init_k(31, 1).unwrap();
        let (_dir, rows) = run(&mut cfg);

        assert_eq!(rows.len(), 3);
        let check_primes = primes::generate_primes(cfg.max_prime);
        for row in &rows {
            let m = cfg.mstart + row.mi;
            let (low, high) = reference_unknowns(&k, m, cfg.sieve_length, &check_primes);
            assert_eq!(row.low, low, "m={}", m);
            assert_eq!(row.high, high, "m={}", m);
        }

        // Spot check with big-integer arithmetic: emitted offsets really
        // have no small factor.
        for row in &rows {
            let m = cfg.mstart + row.mi;
            for (sign, list) in [(-1i64, &row.low), (1i64, &row.high)] {
                for &x in list.iter().take(5) {
                    let n = Integer::from(&k * m) + sign * x as i64;
                    for p in primes::generate_primes(10_000) {
                        assert!(
                            !n.is_divisible(&Integer::from(p)),
                            "m={} offset {}*{} divisible by {}",
                            m,
                            sign,
                            x,
                            p
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn skips_m_sharing_factor_with_d() {
        let mut cfg = Config::for_tests();
        cfg.p = 31;
        cfg.d = 6;
        cfg.mstart = 1;
        cfg.minc = 12;
        cfg.sieve_length = 150;
        cfg.max_prime = 450_000;
        let (_dir, rows) = run(&mut cfg);

        let emitted: Vec<u64> = rows.iter().map(|r| r.mi).collect();
        let expected: Vec<u64> = (0..12).filter(|mi| gcd(1 + mi, 6) == 1).collect();
        assert_eq!(emitted, expected);
    }

    #[test]
    fn center_never_emitted() {
        let mut cfg = Config::for_tests();
        cfg.p = 31;
        cfg.d = 1;
        cfg.mstart = 5;
        cfg.minc = 2;
        cfg.sieve_length = 120;
        cfg.max_prime = 420_000;
        let (_dir, rows) = run(&mut cfg);
        for row in rows {
            assert!(!row.low.contains(&0));
            assert!(!row.high.contains(&0));
        }
    }
}
