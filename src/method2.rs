//! # Method 2 — Staged Three-Band Sieve
//!
//! Sieves the whole compact bit-matrix in bands of increasing prime size,
//! each with the algorithm that suits its hit density:
//!
//! - **small** (`p <= SMALL_THRESHOLD`): batched per print-interval, then
//!   applied row by row with stride marking; rows are independent, so this
//!   band optionally partitions over `valid_m` with rayon.
//! - **medium** (`<= MEDIUM_THRESHOLD`): per prime, invert `r = K mod p`
//!   once and enumerate the row arithmetic progression for each coprime
//!   offset.
//! - **large** (`<= MAX_PRIME`): per prime, the Euclid modular search
//!   reports the few `(m, offset)` pairs it divides.
//!
//! A SIGINT sets a process-wide stop flag, observed at the next reporting
//! checkpoint of the large band: `MAX_PRIME` is truncated to a round-million
//! boundary, the serializer runs normally, and the emitted file is a valid
//! prefix of the full result. A second SIGINT exits immediately.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Once;
use std::time::Instant;

use anyhow::{Context, Result};
use rayon::prelude::*;
use rug::Integer;
use tracing::{info, warn};

use crate::composite::CompositeMatrix;
use crate::config::Config;
use crate::modsearch::{self, mul_mod};
use crate::unknowns::UnknownsWriter;
use crate::wheel::Reindex;
use crate::{db, kvalue, primes, SieveSummary, GAMMA};

static STOP: AtomicBool = AtomicBool::new(false);
static STOP_AT: AtomicU64 = AtomicU64::new(0);
static HANDLER: Once = Once::new();

/// Serializes tests that touch the process-wide stop state.
#[cfg(test)]
pub(crate) static TEST_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Ask the running sieve to stop at its next checkpoint. The SIGINT handler
/// calls this; tests call it directly.
pub fn request_stop() {
    STOP.store(true, Ordering::SeqCst);
}

/// Treat the stop flag as set once the large band reaches `prime`. Lets
/// tests deliver the signal at a deterministic simulated prime.
pub fn request_stop_at(prime: u64) {
    STOP_AT.store(prime, Ordering::SeqCst);
}

fn stop_requested(prime: u64) -> bool {
    if STOP.load(Ordering::SeqCst) {
        return true;
    }
    let at = STOP_AT.load(Ordering::SeqCst);
    at != 0 && prime >= at
}

fn install_signal_handler() {
    HANDLER.call_once(|| {
        let result = ctrlc::set_handler(|| {
            if STOP.swap(true, Ordering::SeqCst) {
                eprintln!("second interrupt, exiting now");
                std::process::exit(2);
            }
            eprintln!("interrupt received, stopping after the current interval");
        });
        if let Err(e) = result {
            warn!("could not install interrupt handler: {e}");
        }
    });
}

/// Cancellation arrived before the sieve reached any million boundary;
/// there is no meaningful prefix to save.
#[derive(Debug)]
pub struct EarlyCancel;

impl std::fmt::Display for EarlyCancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cancelled before the first checkpoint; no output written")
    }
}

impl std::error::Error for EarlyCancel {}

/// Band split points. The medium/large crossover sits where the per-prime
/// cost of walking every coprime offset overtakes the O(log p) modular
/// search with its ~M_inc*(2SL+1)/p expected hits.
fn thresholds(config: &Config, coprime_count: usize) -> (u64, u64) {
    let interval = config.sieve_interval();
    let small = (8 * interval).clamp(interval, config.max_prime);
    let medium = (8u64
        .saturating_mul(config.minc)
        .saturating_mul(interval)
        / coprime_count.max(1) as u64)
        .clamp(small, config.max_prime);
    (small, medium)
}

/// Per-interval accumulators for the reporting cadence. Reset at each print
/// point; totals survive for the final summary.
struct IntervalStats {
    start: Instant,
    interval_start: Instant,
    next_print: u64,
    next_mult: u64,
    pi: u64,
    pi_interval: u64,
    factors: u64,
    small_factors_interval: u64,
    large_factors_interval: u64,
    m_stops: u64,
    m_stops_interval: u64,
    prob_prime: f64,
    current_prob_prime: f64,
    prp_time_est: f64,
}

impl IntervalStats {
    fn new(threshold: u64, prob_prime: f64, prp_time_est: f64) -> IntervalStats {
        let next_mult = if threshold <= 100_000 { 10_000 } else { 100_000 };
        IntervalStats {
            start: Instant::now(),
            interval_start: Instant::now(),
            next_print: next_mult,
            next_mult,
            pi: 0,
            pi_interval: 0,
            factors: 0,
            small_factors_interval: 0,
            large_factors_interval: 0,
            m_stops: 0,
            m_stops_interval: 0,
            prob_prime,
            current_prob_prime: prob_prime,
            prp_time_est,
        }
    }

    fn due(&self, prime: u64) -> bool {
        prime >= self.next_print
    }

    fn checkpoint(
        &mut self,
        prime: u64,
        valid_ms: usize,
        matrix: &CompositeMatrix,
        config: &Config,
    ) {
        while self.next_print <= prime {
            self.next_print += self.next_mult;
            if self.next_print >= 10 * self.next_mult {
                self.next_mult *= 10;
            }
        }

        let secs = self.start.elapsed().as_secs_f64();
        let int_secs = self.interval_start.elapsed().as_secs_f64();
        self.interval_start = Instant::now();

        // Mertens: sieving to `prime` leaves 1/(ln(prime) e^gamma) of
        // candidates; the delta against the last interval is how many PRP
        // tests this interval saved.
        let prob_after = self.prob_prime * (prime as f64).ln() * GAMMA.exp();
        let skipped_prp =
            2.0 * valid_ms as f64 * (1.0 / self.current_prob_prime - 1.0 / prob_after);
        self.current_prob_prime = prob_after;

        info!(
            prime,
            pi_interval = self.pi_interval,
            pi = self.pi,
            interval_secs = format_args!("{:.2}", int_secs),
            total_secs = format_args!("{:.1}", secs),
            "sieve checkpoint"
        );

        if config.verbose >= 2 && valid_ms > 0 {
            let unknowns = matrix.total_unknown();
            let interval_factors = self.small_factors_interval + self.large_factors_interval;
            info!(
                factors = self.factors + interval_factors,
                interval_factors,
                unknowns,
                avg_unknowns = format_args!("{:.2}", unknowns as f64 / valid_ms as f64),
                prp_per_m = format_args!("{:.2}", 1.0 / self.current_prob_prime),
                skipped_prp = format_args!("{:.1}", skipped_prp),
                "interval detail"
            );
            if self.prp_time_est > 0.0 && int_secs > 0.0 {
                let run_prp_mult = int_secs / (self.prp_time_est * skipped_prp.max(1e-12));
                if run_prp_mult > 2.0 {
                    info!(
                        "estimated ~{:.1}x faster to run PRP now (interrupt to stop sieving)",
                        run_prp_mult
                    );
                }
            }
        }

        self.pi += self.pi_interval;
        self.factors += self.small_factors_interval + self.large_factors_interval;
        self.m_stops += self.m_stops_interval;
        self.pi_interval = 0;
        self.small_factors_interval = 0;
        self.large_factors_interval = 0;
        self.m_stops_interval = 0;
    }
}

#[cfg(feature = "validate-factors")]
fn validate_factor(k: &Integer, m: u64, x: u64, sl: u64, prime: u64) {
    let n = Integer::from(k * m) - sl + x;
    assert!(
        n.is_divisible(&Integer::from(prime)),
        "claimed factor {} of m={} x={}",
        prime,
        m,
        x
    );
}

pub fn sieve(config: &Config) -> Result<SieveSummary> {
    let m_start = config.mstart;
    let m_inc = config.minc;
    let sl = config.sieve_length;
    let interval = config.sieve_interval();

    let k = kvalue::init_k(config.p, config.d)?;
    let k_log = kvalue::ln(&k);
    let n_log = k_log + (m_start as f64).ln();
    let prob_prime = 1.0 / n_log - 1.0 / (n_log * n_log);

    let reindex = Reindex::build(config, &k);
    let valid_ms = reindex.valid_mi.len();
    let (small_threshold, medium_threshold) = thresholds(config, reindex.coprime_x.len());
    assert!(small_threshold >= interval);
    assert!(medium_threshold >= small_threshold && medium_threshold <= config.max_prime);

    info!(
        valid_m = valid_ms,
        m_inc,
        coprime_i = reindex.coprime_x.len() / 2,
        sieve_length = sl,
        wheel = reindex.wheel,
        k_digits = kvalue::digits(&k),
        small_threshold,
        medium_threshold,
        max_prime = config.max_prime,
        "method 2 setup"
    );

    let mut matrix = CompositeMatrix::allocate(&reindex, m_start)?;

    let prp_time_est = if config.verbose >= 2 {
        crate::stats::prp_time_estimate(n_log)
    } else {
        0.0
    };
    let mut stats = IntervalStats::new(small_threshold, prob_prime, prp_time_est);

    STOP.store(false, Ordering::SeqCst);
    install_signal_handler();

    let k_odd = k.is_odd();
    let k_mod3 = kvalue::mod_u64(&k, 3);
    let k_mod5 = kvalue::mod_u64(&k, 5);
    let k_mod7 = kvalue::mod_u64(&k, 7);
    let d_mod2 = config.d % 2 == 0;
    let d_mod3 = config.d % 3 == 0;
    let d_mod5 = config.d % 5 == 0;
    let d_mod7 = config.d % 7 == 0;

    // ----- Small band
    small_band(config, &k, &reindex, &mut matrix, small_threshold, &mut stats);

    // ----- Medium band
    let mut stream = primes::PrimeStream::new(small_threshold);
    let mut prime = stream.next_prime();
    debug_assert!(prime > interval);
    while prime <= medium_threshold {
        stats.pi_interval += 1;
        let r = kvalue::mod_u64(&k, prime);
        if r == 0 {
            // Divides K; only the (pre-set) center is affected.
            prime = stream.next_prime();
            continue;
        }
        let inv = modsearch::mod_inverse(r, prime);
        debug_assert_eq!(mul_mod(inv, r, prime), 1);
        let m_start_shift = (prime - m_start % prime) % prime;

        for &x in &reindex.coprime_x {
            let x = u64::from(x);
            let dist = x as i64 - sl as i64;
            debug_assert!(k_odd || dist & 1 != 0, "even K already removed even dists");

            // Row progression: mi = (-dist * r^-1 - M_start) mod p, step p.
            let p_minus_dist = ((prime as i64 - dist) as u64) % prime;
            let mut mi0 = (mul_mod(p_minus_dist, inv, prime) + m_start_shift) % prime;
            let step = if k_odd { 2 * prime } else { prime };
            if k_odd && (m_start + mi0 + x + sl) & 1 == 0 {
                // Even candidate; the odd multiples are every other step.
                mi0 += prime;
            }

            let mut mi = mi0;
            while mi < m_inc {
                if !reindex.m_not_coprime[mi as usize] {
                    let m = m_start + mi;
                    let row = reindex.m_reindex[mi as usize];
                    debug_assert!(row >= 0);
                    matrix.set(row as usize, reindex.index_for(m, x as usize));
                    stats.small_factors_interval += 1;
                    #[cfg(feature = "validate-factors")]
                    validate_factor(&k, m, x, sl, prime);
                }
                mi += step;
            }
        }

        if stats.due(prime) {
            stats.checkpoint(prime, valid_ms, &matrix, config);
        }
        prime = stream.next_prime();
    }

    // ----- Large band
    let mut effective_max = config.max_prime;
    let mut cancelled = false;
    while prime <= effective_max {
        stats.pi_interval += 1;
        let r = kvalue::mod_u64(&k, prime);
        if r == 0 {
            prime = stream.next_prime();
            continue;
        }

        {
            let stats = &mut stats;
            let matrix = &mut matrix;
            modsearch::for_each_m_hit(m_start, m_inc, sl, prime, r, |mi, first| {
                stats.m_stops_interval += 1;

                // With D even, (M_start + mi) even shares a factor 2 with D.
                let m = m_start + mi;
                if k_odd && m & 1 == 0 {
                    return;
                }
                if reindex.m_not_coprime[mi as usize] {
                    return;
                }

                // first = (m*K + SL) mod p; the offset hit is its mirror.
                let first = 2 * sl - first;
                let dist = first as i64 - sl as i64;
                // Divisor-of-D fast paths, verified for q in {2, 3, 5, 7}:
                // such hits land on wheel-dropped offsets anyway.
                if d_mod2 && dist & 1 != 0 {
                    return;
                }
                if d_mod3 && (dist as i128 + k_mod3 as i128 * m as i128) % 3 == 0 {
                    return;
                }
                if d_mod5 && (dist as i128 + k_mod5 as i128 * m as i128) % 5 == 0 {
                    return;
                }
                if d_mod7 && (dist as i128 + k_mod7 as i128 * m as i128) % 7 == 0 {
                    return;
                }
                if !reindex.x_coprime[first as usize] {
                    return;
                }

                let row = reindex.m_reindex[mi as usize];
                debug_assert!(row >= 0);
                matrix.set(row as usize, reindex.index_for(m, first as usize));
                stats.large_factors_interval += 1;
                #[cfg(feature = "validate-factors")]
                validate_factor(&k, m, first, sl, prime);
            });
        }

        if stats.due(prime) {
            stats.checkpoint(prime, valid_ms, &matrix, config);

            if stop_requested(prime) && prime < effective_max {
                if prime < 1_000_000 {
                    STOP.store(false, Ordering::SeqCst);
                    STOP_AT.store(0, Ordering::SeqCst);
                    return Err(EarlyCancel.into());
                }
                effective_max = prime - prime % 1_000_000;
                info!(prime, effective_max, "stopping from interrupt");
                cancelled = true;
                break;
            }
        }
        prime = stream.next_prime();
    }
    STOP.store(false, Ordering::SeqCst);
    STOP_AT.store(0, Ordering::SeqCst);

    // Flush interval counters that never hit a print point.
    stats.pi += stats.pi_interval;
    stats.factors += stats.small_factors_interval + stats.large_factors_interval;
    stats.m_stops += stats.m_stops_interval;

    if effective_max > medium_threshold && stats.m_stops > 0 {
        // Mertens' third theorem check on the modulo-search hit count.
        let expected = ((effective_max as f64).ln().ln() - (medium_threshold as f64).ln().ln())
            * (2 * sl) as f64
            * m_inc as f64;
        let err = 100.0 * (expected - stats.m_stops as f64).abs() / expected.max(1.0);
        if err > 0.1 {
            info!(
                m_stops = stats.m_stops,
                expected = format_args!("{:.0}", expected),
                "modulo searches off estimate by {:.2}%",
                err
            );
        }
    }

    let seconds = stats.start.elapsed().as_secs_f64();
    let rows_written = write_unknowns(config, &reindex, &matrix, effective_max)?;

    if let Err(e) = db::SearchDb::open(&config.search_db)
        .and_then(|sdb| sdb.insert_range_sieve(config, effective_max, rows_written, seconds))
        .context("recording range in search db")
    {
        warn!("{e:#}");
    }

    Ok(SieveSummary {
        rows_written,
        seconds,
        cancelled,
        effective_max_prime: effective_max,
    })
}

/// Small band: primes are gathered per print-interval with `r = K mod p`,
/// then each row strides the whole batch. Primes dividing `K` or the wheel
/// are skipped; the reindexer already removed their offsets.
fn small_band(
    config: &Config,
    k: &Integer,
    reindex: &Reindex,
    matrix: &mut CompositeMatrix,
    small_threshold: u64,
    stats: &mut IntervalStats,
) {
    let sl = config.sieve_length;
    let interval = config.sieve_interval();
    let d = config.d;
    let m_start = config.mstart;

    let mut stream = primes::PrimeStream::new(0);
    let mut done = false;
    while !done {
        let mut batch: Vec<(u64, u64)> = Vec::new();
        let mut last = 0u64;
        loop {
            let p = stream.next_prime();
            if p > small_threshold {
                done = true;
                break;
            }
            last = p;
            stats.pi_interval += 1;
            if p <= u64::from(config.p) && d % p != 0 {
                // Factor of K; the reindexer crossed these offsets off once.
                continue;
            }
            if reindex.wheel % p == 0 {
                continue;
            }
            batch.push((p, kvalue::mod_u64(k, p)));
            if stats.due(p) {
                break;
            }
        }

        if !batch.is_empty() {
            let valid_mi = &reindex.valid_mi;
            let batch = &batch;
            let marked: u64 = matrix
                .rows_mut()
                .par_iter_mut()
                .enumerate()
                .map(|(row_idx, row)| {
                    let mi = valid_mi[row_idx];
                    let m = m_start + mi;
                    let table = &reindex.i_reindex_wheel[(m % reindex.wheel) as usize];

                    let center_odd = d % 2 == 0 && m & 1 == 1;
                    let low_is_even = center_odd == (sl & 1 == 1);

                    let mut marked = 0u64;
                    for &(p, r) in batch {
                        let modulo = mul_mod(r, m % p, p);
                        // First offset with p | m*K + x - SL is
                        // (SL - modulo) mod p.
                        let mut flip = modulo + p - ((sl + 1) % p);
                        if flip >= p {
                            flip -= p;
                        }
                        let mut first = p - flip - 1;
                        if first >= interval {
                            continue;
                        }
                        let mut step = p;
                        if p > 2 {
                            let even_from_low = first & 1 == 0;
                            if low_is_even == even_from_low {
                                // Even candidate; start at the next (odd)
                                // multiple and skip even ones entirely.
                                first += p;
                            }
                            step = 2 * p;
                        }
                        let mut x = first;
                        while x < interval {
                            row.set(table[x as usize] as usize);
                            marked += 1;
                            #[cfg(feature = "validate-factors")]
                            validate_factor(k, m, x, sl, p);
                            x += step;
                        }
                    }
                    marked
                })
                .sum();
            stats.small_factors_interval += marked;
        }

        if last > 0 && stats.due(last) {
            stats.checkpoint(last, reindex.valid_mi.len(), matrix, config);
        }
    }
}

fn write_unknowns(
    config: &Config,
    reindex: &Reindex,
    matrix: &CompositeMatrix,
    effective_max: u64,
) -> Result<u64> {
    let sl = config.sieve_length;
    let path = config.unknown_path(effective_max);
    info!("saving unknowns to '{}'", path.display());
    let mut writer = UnknownsWriter::create(&path, config.rle)?;

    let mut low = Vec::new();
    let mut high = Vec::new();
    for (row_idx, &mi) in reindex.valid_mi.iter().enumerate() {
        let m = config.mstart + mi;
        let table = &reindex.i_reindex_wheel[(m % reindex.wheel) as usize];
        let comp = matrix.row(row_idx);

        low.clear();
        high.clear();
        for i in 1..=sl {
            if !comp.get(table[(sl - i) as usize] as usize) {
                low.push(i as u32);
            }
            if !comp.get(table[(sl + i) as usize] as usize) {
                high.push(i as u32);
            }
        }
        writer.write_row(mi, &low, &high)?;
    }
    writer.finish()?;
    Ok(reindex.valid_mi.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unknowns::{UnknownLine, UnknownsReader};
    use tempfile::TempDir;

    // The stop flag is process-wide; run these tests one at a time.
    fn serial() -> std::sync::MutexGuard<'static, ()> {
        TEST_SERIAL.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run(config: &mut Config) -> (TempDir, Vec<UnknownLine>, SieveSummary) {
        let dir = TempDir::new().unwrap();
        config.output_dir = dir.path().to_path_buf();
        config.search_db = dir.path().join("search.db");
        let summary = sieve(config).unwrap();
        let mut reader =
            UnknownsReader::open(&config.unknown_path(summary.effective_max_prime)).unwrap();
        let mut rows = Vec::new();
        while let Some(r) = reader.next_row().unwrap() {
            rows.push(r);
        }
        (dir, rows, summary)
    }

    fn base_config(p: u32, d: u64, mstart: u64, minc: u64, sl: u64, max_prime: u64) -> Config {
        let mut cfg = Config::for_tests();
        cfg.p = p;
        cfg.d = d;
        cfg.mstart = mstart;
        cfg.minc = minc;
        cfg.sieve_length = sl;
        cfg.max_prime = max_prime;
        cfg
    }

    /// Direct modular reference, independent of bands and reindexing.
    fn reference_row(k: &Integer, m: u64, sl: u64, max_prime: u64) -> (Vec<u32>, Vec<u32>) {
        let mut lower = vec![false; sl as usize + 1];
        let mut upper = vec![false; sl as usize + 1];
        lower[0] = true;
        upper[0] = true;
        for p in primes::generate_primes(max_prime) {
            let r = kvalue::mod_u64(k, p);
            let modulo = mul_mod(r, m % p, p);
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
        let collect = |side: &[bool]| {
            (1..=sl as u32)
                .filter(|&x| !side[x as usize])
                .collect::<Vec<u32>>()
        };
        (collect(&lower), collect(&upper))
    }

    #[test]
    fn agrees_with_reference_d1() {
        let _guard = serial();
        let mut cfg = base_config(31, 1, 1, 4, 150, 60_000);
        let k = kvalue::init_k(31, 1).unwrap();
        let (_dir, rows, _) = run(&mut cfg);
        assert_eq!(rows.len(), 4);
        for row in &rows {
            let m = 1 + row.mi;
            let (low, high) = reference_row(&k, m, 150, 60_000);
            assert_eq!(row.low, low, "m={}", m);
            assert_eq!(row.high, high, "m={}", m);
        }
    }

    #[test]
    fn agrees_with_reference_wheel_d() {
        let _guard = serial();
        // D = 210 exercises the full wheel plus every fast-path filter.
        let mut cfg = base_config(31, 210, 11, 30, 180, 50_000);
        let k = kvalue::init_k(31, 210).unwrap();
        let (_dir, rows, _) = run(&mut cfg);
        assert!(!rows.is_empty());
        for row in &rows {
            let m = 11 + row.mi;
            assert_eq!(crate::gcd(m, 210), 1);
            let (low, high) = reference_row(&k, m, 180, 50_000);
            assert_eq!(row.low, low, "m={}", m);
            assert_eq!(row.high, high, "m={}", m);
        }
    }

    #[test]
    fn agrees_with_reference_even_k() {
        let _guard = serial();
        // D odd keeps the factor 2 in K (K even), the other parity regime.
        let mut cfg = base_config(31, 15, 1, 12, 150, 40_000);
        let k = kvalue::init_k(31, 15).unwrap();
        let (_dir, rows, _) = run(&mut cfg);
        for row in &rows {
            let m = 1 + row.mi;
            let (low, high) = reference_row(&k, m, 150, 40_000);
            assert_eq!(row.low, low, "m={}", m);
            assert_eq!(row.high, high, "m={}", m);
        }
    }

    #[test]
    fn medium_band_exercised_with_large_minc() {
        let _guard = serial();
        // Large minc pushes MEDIUM_THRESHOLD above SMALL_THRESHOLD.
        let mut cfg = base_config(31, 2, 1, 4000, 150, 120_000);
        let k = kvalue::init_k(31, 2).unwrap();
        let (small, medium) = thresholds(&cfg, {
            let ri = Reindex::build(&cfg, &k);
            ri.coprime_x.len()
        });
        assert!(medium > small, "intended to cover the medium band");

        let (_dir, rows, _) = run(&mut cfg);
        for row in rows.iter().step_by(397) {
            let m = 1 + row.mi;
            let (low, high) = reference_row(&k, m, 150, 120_000);
            assert_eq!(row.low, low, "m={}", m);
            assert_eq!(row.high, high, "m={}", m);
        }
    }

    #[test]
    fn monotonic_in_max_prime() {
        let _guard = serial();
        let mut shallow = base_config(31, 1, 1, 6, 150, 20_000);
        let (_d1, rows_shallow, _) = run(&mut shallow);
        let mut deep = base_config(31, 1, 1, 6, 150, 200_000);
        let (_d2, rows_deep, _) = run(&mut deep);

        for (a, b) in rows_shallow.iter().zip(&rows_deep) {
            assert_eq!(a.mi, b.mi);
            for x in &b.low {
                assert!(a.low.contains(x), "deeper sieve added -{}", x);
            }
            for x in &b.high {
                assert!(a.high.contains(x), "deeper sieve added +{}", x);
            }
        }
    }

    #[test]
    fn single_m_matches_method1() {
        let _guard = serial();
        let mut cfg2 = base_config(31, 1, 5, 1, 150, 450_000);
        let (_d2, rows2, _) = run(&mut cfg2);

        let mut cfg1 = base_config(31, 1, 5, 1, 150, 450_000);
        cfg1.method1 = true;
        let dir = TempDir::new().unwrap();
        cfg1.output_dir = dir.path().to_path_buf();
        cfg1.search_db = dir.path().join("search.db");
        crate::method1::sieve(&cfg1).unwrap();
        let mut reader = UnknownsReader::open(&cfg1.unknown_path(cfg1.max_prime)).unwrap();
        let row1 = reader.next_row().unwrap().unwrap();

        assert_eq!(rows2.len(), 1);
        assert_eq!(rows2[0], row1);
    }

    #[test]
    fn cancellation_truncates_to_million_boundary() {
        let _guard = serial();
        let mut cfg = base_config(31, 1, 1, 2, 150, 9_000_000);
        request_stop_at(3_000_000);
        let (_dir, rows, summary) = run(&mut cfg);
        assert!(summary.cancelled);
        assert_eq!(summary.effective_max_prime, 3_000_000);
        assert!(!stop_requested(0), "stop state cleared after the run");

        // The truncated output is a valid prefix: a fresh run at the
        // truncated bound differs by at most the one extra prime the
        // cancelled run had already applied.
        let mut fresh = base_config(31, 1, 1, 2, 150, 3_000_000);
        let (_dir2, fresh_rows, fresh_summary) = run(&mut fresh);
        assert!(!fresh_summary.cancelled);
        for (cancelled_row, fresh_row) in rows.iter().zip(&fresh_rows) {
            assert_eq!(cancelled_row.mi, fresh_row.mi);
            for x in &cancelled_row.low {
                assert!(fresh_row.low.contains(x));
            }
            for x in &cancelled_row.high {
                assert!(fresh_row.high.contains(x));
            }
        }
    }

    #[test]
    fn early_cancellation_is_an_error() {
        let _guard = serial();
        let mut cfg = base_config(31, 1, 1, 2, 150, 9_000_000);
        cfg.output_dir = TempDir::new().unwrap().path().to_path_buf();
        request_stop_at(1); // before any million boundary
        let err = sieve(&cfg).unwrap_err();
        assert!(err.downcast_ref::<EarlyCancel>().is_some());
    }

    #[test]
    fn threshold_invariants() {
        let _guard = serial();
        let cfg = base_config(31, 1, 1, 100, 150, 1_000_000);
        let (small, medium) = thresholds(&cfg, 60);
        assert!(small >= cfg.sieve_interval());
        assert!(medium >= small);
        assert!(medium <= cfg.max_prime);
    }
}
