//! # Stats — Record-Probability Evaluation of a Sieved Range
//!
//! Reads the unknowns file a sieve produced and computes, per `m`, the
//! probability that the gap around `m*K` is a record, a missing gap, or has
//! merit above the configured floor. Primality is modeled geometrically:
//! each unknown is prime with the post-sieve probability
//! `P = prob_prime * ln(max_prime) * e^gamma`, independent of the others.
//!
//! `prob_record` combines three components:
//! 1. **direct** — both primes inside `[-SL, SL]`: a sum over pairs of
//!    unknowns weighted by the combined geometric density;
//! 2. **extended** — exactly one prime inside: the inside unknown paired
//!    with a per-wheel-residue conditional table over `(SL, 2*SL]`;
//! 3. **extended squared** — both primes outside: one constant per wheel
//!    residue.
//!
//! The record table comes from the external gaps database; gaps it has
//! never seen count as records (and as "missing" inside the missing-gap
//! window).

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use rug::Integer;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{self, GapStatRow, MStatRow, SearchDb};
use crate::unknowns::UnknownsReader;
use crate::{gcd, kvalue, primes, GAMMA};

/// Record list ceiling; gaps beyond it are vanishingly improbable here.
const MAX_GAP: usize = 1_000_000;

/// Missing-gap window from the merged record tables.
const MISSING_GAPS_LOW: u32 = 113_326;
const MISSING_GAPS_HIGH: u32 = 132_928;

/// Tail cutoffs for the geometric tables.
const NTH_PRIME_CUTOFF: f64 = 1e-13;
const COMBINED_CUTOFF: f64 = 2.5e-16;

/// Time one Fermat exponentiation at the size of a candidate; the unit cost
/// behind the "faster to just run PRP" estimates.
pub fn prp_time_estimate(n_log: f64) -> f64 {
    let bits = (n_log / std::f64::consts::LN_2).max(64.0) as u32;
    let n: Integer = (Integer::from(1) << bits) | 1u32;
    let exp = Integer::from(&n - 1u32);
    let start = Instant::now();
    Integer::from(2)
        .pow_mod(&exp, &n)
        .expect("positive exponent");
    start.elapsed().as_secs_f64()
}

/// Geometric tables: `prime_nth[i]` = chance the i'th unknown is the first
/// prime; `great_nth[i]` = chance the first prime lies beyond the i'th.
fn prob_nth_prime(prob_prime: f64) -> (Vec<f32>, Vec<f32>) {
    let mut prime_nth = Vec::new();
    let mut great_nth = Vec::new();
    let mut still = 1.0f64;
    while still > NTH_PRIME_CUTOFF {
        prime_nth.push((still * prob_prime) as f32);
        great_nth.push(still as f32);
        still *= 1.0 - prob_prime;
    }
    (prime_nth, great_nth)
}

/// `combined[i+j]` = chance the two sides' first primes are the i'th and
/// j'th unknowns: `prob^2 * (1-prob)^(i+j)`.
fn prob_combined_gap(prob_prime: f64) -> Vec<f32> {
    let mut combined = Vec::new();
    let mut prob = prob_prime * prob_prime;
    while prob > COMBINED_CUTOFF {
        combined.push(prob as f32);
        prob *= 1.0 - prob_prime;
    }
    combined
}

fn nth_or_zero(table: &[f32], nth: usize) -> f64 {
    table.get(nth).copied().unwrap_or(0.0) as f64
}

/// Per-wheel-residue conditional tables for the extended components.
struct ExtendedProbs {
    wheel: u64,
    /// `record_beyond[w][gap_prev]`: chance the far side lands a record
    /// given one prime at `gap_prev <= SL` and the other beyond `SL`.
    record_beyond: BTreeMap<u64, Vec<f32>>,
    /// Both primes beyond `SL`: one constant per residue.
    record_both_beyond: BTreeMap<u64, f64>,
    /// Chance a side's prime lies beyond `2*SL` given it is beyond `SL`.
    prob_greater_extended: f64,
}

impl ExtendedProbs {
    fn prev_residue(&self, w: u64) -> u64 {
        (self.wheel - w % self.wheel) % self.wheel
    }
}

fn extended_probs(
    config: &Config,
    k: &Integer,
    prob_prime: f64,
    n_log: f64,
    records: &[f32],
    poss_record_gaps: &[u32],
) -> ExtendedProbs {
    let sl = config.sieve_length as usize;
    let ext_size = 2 * sl;
    let min_record = poss_record_gaps.first().copied().unwrap_or(u32::MAX) as usize;

    // Outside the sieved window only coprimality to K filters candidates;
    // condition the prime probability on it.
    let k_primes = primes::generate_primes(u64::from(config.p));
    let mut prob_prime_coprime = prob_prime;
    for &q in &k_primes {
        if config.d % q != 0 {
            prob_prime_coprime /= 1.0 - 1.0 / q as f64;
        }
    }
    let mut wheel = 1u64;
    for q in [2u64, 3, 5, 7] {
        if config.d % q == 0 {
            wheel *= q;
            prob_prime_coprime /= 1.0 - 1.0 / q as f64;
        }
    }
    let (prime_nth_out, great_nth_out) = prob_nth_prime(prob_prime_coprime);

    // Distances from the center with a factor of K can never be prime gaps.
    let mut is_coprime = vec![true; ext_size];
    for &q in &k_primes {
        if config.d % q == 0 {
            continue;
        }
        let mut i = 0usize;
        while i < ext_size {
            is_coprime[i] = false;
            i += q as usize;
        }
    }

    // Residue-specific copies with the wheel primes of D marked off.
    let mut coprime_ms: BTreeMap<u64, Vec<bool>> = BTreeMap::new();
    for w in 0..wheel {
        if gcd(w, wheel) > 1 {
            continue;
        }
        let mut cm = is_coprime.clone();
        for q in [2u64, 3, 5, 7] {
            if config.d % q != 0 {
                continue;
            }
            let first = w * kvalue::mod_u64(k, q) % q;
            let mut i = (q - first) as usize % q as usize;
            if i == 0 {
                i = q as usize;
            }
            while i < ext_size {
                cm[i] = false;
                i += q as usize;
            }
        }
        coprime_ms.insert(w, cm);
    }

    let average_extended: f64 = coprime_ms
        .values()
        .map(|cm| cm[sl..].iter().filter(|&&c| c).count() as f64)
        .sum::<f64>()
        / coprime_ms.len() as f64;
    let prob_greater_extended = nth_or_zero(&great_nth_out, average_extended as usize);

    let mut record_beyond = BTreeMap::new();
    let mut record_both_beyond = BTreeMap::new();
    for (&w, cm) in &coprime_ms {
        let cm_prev = &coprime_ms[&((wheel - w) % wheel)];

        // Count of coprime offsets in (SL, x], and their positions.
        let mut count_beyond = vec![0u32; ext_size];
        let mut extended_coprime = Vec::new();
        let mut count = 0u32;
        for x in sl + 1..ext_size {
            if cm[x] {
                extended_coprime.push(x);
                count += 1;
            }
            count_beyond[x] = count;
        }

        // One prime at gap_prev inside, the other beyond SL.
        let mut table = vec![0f32; sl + 1];
        for (gap_prev, slot) in table.iter_mut().enumerate().skip(1) {
            if !cm_prev[gap_prev] || gap_prev + ext_size < min_record {
                continue;
            }
            let mut prob_record = 0f64;
            for &record_gap in poss_record_gaps {
                let record_gap = record_gap as usize;
                if record_gap <= gap_prev + sl {
                    continue;
                }
                let dist = record_gap - gap_prev;
                if dist >= ext_size {
                    break;
                }
                if !cm[dist] {
                    continue;
                }
                let nth = count_beyond[dist] as usize;
                if nth == 0 {
                    continue;
                }
                if nth > prime_nth_out.len() {
                    break;
                }
                prob_record += f64::from(prime_nth_out[nth - 1]);
            }
            *slot = prob_record as f32;
        }
        record_beyond.insert(w, table);

        // Both primes beyond SL.
        let mut prob_e2 = 0f64;
        let mut coprimes_prev = 0usize;
        for gap_prev in sl + 1..ext_size {
            if !cm_prev[gap_prev] {
                continue;
            }
            coprimes_prev += 1;
            if coprimes_prev > prime_nth_out.len() {
                break;
            }
            let mut prob_far = 0f64;
            for (i, &x) in extended_coprime.iter().enumerate() {
                if i >= prime_nth_out.len() {
                    break;
                }
                let gap = gap_prev + x;
                let is_record = records.get(gap).map_or(true, |&r| f64::from(r) > n_log);
                if is_record {
                    prob_far += f64::from(prime_nth_out[i]);
                }
            }
            prob_e2 += prob_far * f64::from(prime_nth_out[coprimes_prev - 1]);
        }
        record_both_beyond.insert(w, prob_e2);
    }

    ExtendedProbs {
        wheel,
        record_beyond,
        record_both_beyond,
        prob_greater_extended,
    }
}

/// Evaluate the unknowns file for the configured range and persist
/// `range_stats` / `m_stats`.
pub fn evaluate(config: &Config) -> Result<()> {
    let start = Instant::now();
    let sl = config.sieve_length;
    let interval = config.sieve_interval() as usize;

    let rid = config.run_id(config.max_prime);
    if let Ok(sdb) = SearchDb::open(&config.search_db) {
        if sdb.is_range_processed(rid)? {
            info!("range already processed; nothing to do");
            return Ok(());
        }
    }

    let path = config.unknown_path(config.max_prime);
    info!("reading unknowns from '{}'", path.display());
    let mut reader = UnknownsReader::open(&path)?;

    let k = kvalue::init_k(config.p, config.d)?;
    let k_log = kvalue::ln(&k);
    let n_log = k_log + (config.mstart as f64).ln();
    let min_gap_min_merit = (config.min_merit * n_log).ceil() as u32;

    let records = db::load_record_gaps(&config.records_db, MAX_GAP.max(interval))
        .context("loading record gaps")?;

    // Gaps that would be records for numbers of this size. Merit beyond 35
    // is not worth modeling.
    let mut poss_record_gaps: Vec<u32> = Vec::new();
    for gap in (2..records.len()).step_by(2) {
        if gap as f64 / n_log > 35.0 {
            break;
        }
        if f64::from(records[gap]) > n_log {
            poss_record_gaps.push(gap as u32);
        }
    }
    ensure!(
        poss_record_gaps.len() >= 2,
        "records db lists no attainable record gaps for this range"
    );
    info!(
        count = poss_record_gaps.len(),
        first = poss_record_gaps[0],
        last = poss_record_gaps[poss_record_gaps.len() - 1],
        min_record_merit = format_args!("{:.3}", f64::from(poss_record_gaps[0]) / n_log),
        "possible record gaps"
    );
    let min_record_gap = poss_record_gaps[0];

    let prob_prime = 1.0 / n_log - 1.0 / (n_log * n_log);
    let prob_prime_after_sieve = prob_prime * (config.max_prime as f64).ln() * GAMMA.exp();
    let (prime_nth, great_nth) = prob_nth_prime(prob_prime_after_sieve);
    let combined = prob_combined_gap(prob_prime_after_sieve);
    let ext = extended_probs(config, &k, prob_prime, n_log, &records, &poss_record_gaps);

    // Probability mass per gap size, across all m.
    let mut prob_gap_norm = vec![0f64; interval];
    let mut prob_gap_low = vec![0f64; interval];
    let mut prob_gap_high = vec![0f64; interval];

    let mut m_rows: Vec<MStatRow> = Vec::new();
    let mut max_prob_record = 1e-10;

    for mi in 0..config.minc {
        let m = config.mstart + mi;
        if gcd(m, config.d) > 1 {
            continue;
        }
        let row = reader
            .next_row()?
            .with_context(|| format!("unknowns file ends before mi={}", mi))?;
        ensure!(row.mi == mi, "unknowns file lists mi={}, expected {}", row.mi, mi);

        let log_start = k_log + (m as f64).ln();
        let prob_prev_greater = nth_or_zero(&great_nth, row.low.len());
        let prob_next_greater = nth_or_zero(&great_nth, row.high.len());
        // Chance the true gap is visible at all: both sides' primes inside
        // 2*SL of the center.
        let prob_seen = (1.0 - prob_prev_greater * ext.prob_greater_extended)
            * (1.0 - prob_next_greater * ext.prob_greater_extended);

        // Direct component: both primes inside the sieve.
        let mut prob_record = 0f64;
        let mut prob_missing = 0f64;
        let mut prob_merit = 0f64;
        let max_i = row.low.len().min(combined.len());
        for (i, &gap_low) in row.low.iter().take(max_i).enumerate() {
            let max_j = row.high.len().min(combined.len() - i);
            for (j, &gap_high) in row.high.iter().take(max_j).enumerate() {
                let gap = (gap_low + gap_high) as usize;
                let prob_this = f64::from(combined[i + j]);
                prob_gap_norm[gap.min(interval - 1)] += prob_this;
                if gap as u32 >= min_gap_min_merit {
                    prob_merit += prob_this;
                }
                if gap as u32 >= min_record_gap && f64::from(records[gap]) > log_start {
                    prob_record += prob_this;
                    if (MISSING_GAPS_LOW..=MISSING_GAPS_HIGH).contains(&(gap as u32))
                        && records[gap].is_infinite()
                    {
                        prob_missing += prob_this;
                    }
                }
            }
        }

        // Extended component: one side's prime beyond SL.
        let w = m % ext.wheel;
        let beyond_high = &ext.record_beyond[&w];
        let beyond_low = &ext.record_beyond[&ext.prev_residue(w)];
        let min_side_merit = min_gap_min_merit.saturating_sub(sl as u32);

        let mut prob_record_ext = 0f64;
        let mut e_prev = 0f64;
        let mut e_next = 0f64;
        let max_i = row.low.len().max(row.high.len()).min(prime_nth.len());
        for i in 0..max_i {
            let prob_i = f64::from(prime_nth[i]);
            if let Some(&gap_low) = row.low.get(i) {
                prob_record_ext +=
                    prob_i * prob_next_greater * f64::from(beyond_high[gap_low as usize]);
                e_prev += f64::from(gap_low) * prob_i;
                prob_gap_low[gap_low as usize] += prob_i;
                if gap_low >= min_side_merit {
                    prob_merit += prob_i * prob_next_greater;
                }
            }
            if let Some(&gap_high) = row.high.get(i) {
                prob_record_ext +=
                    prob_i * prob_prev_greater * f64::from(beyond_low[gap_high as usize]);
                e_next += f64::from(gap_high) * prob_i;
                prob_gap_high[gap_high as usize] += prob_i;
                if gap_high >= min_side_merit {
                    prob_merit += prob_i * prob_prev_greater;
                }
            }
        }

        // Both primes beyond SL.
        let prob_record_ext2 =
            prob_prev_greater * prob_next_greater * ext.record_both_beyond[&w];

        let prob_record_combined = prob_record + prob_record_ext + prob_record_ext2;
        if config.verbose >= 1 && prob_record_combined > max_prob_record {
            max_prob_record = prob_record_combined;
            info!(
                m,
                unknowns_low = row.low.len(),
                unknowns_high = row.high.len(),
                e_prev = format_args!("{:.0}", e_prev),
                e_next = format_args!("{:.0}", e_next),
                prob_record = format_args!("{:.2e}", prob_record_combined),
                prob_seen = format_args!("{:.7}", prob_seen),
                "new best record probability"
            );
        }

        m_rows.push(MStatRow {
            m,
            prob_record: prob_record_combined,
            prob_missing,
            prob_merit,
            e_gap_next: e_next,
            e_gap_prev: e_prev,
        });
    }
    ensure!(
        reader.next_row()?.is_none(),
        "unknowns file has trailing rows beyond minc"
    );

    let valid_ms = m_rows.len().max(1) as f64;
    let gap_rows: Vec<GapStatRow> = (1..interval)
        .filter(|&g| {
            prob_gap_norm[g] >= 1e-10 || prob_gap_low[g] >= 1e-10 || prob_gap_high[g] >= 1e-10
        })
        .map(|g| GapStatRow {
            gap: g as u32,
            prob_combined: prob_gap_norm[g] / valid_ms,
            prob_low_side: prob_gap_low[g] / valid_ms,
            prob_high_side: prob_gap_high[g] / valid_ms,
        })
        .collect();

    let seconds = start.elapsed().as_secs_f64();
    info!(
        m_rows = m_rows.len(),
        gap_rows = gap_rows.len(),
        secs = format_args!("{:.2}", seconds),
        "stats evaluated"
    );

    match SearchDb::open(&config.search_db) {
        Ok(mut sdb) => {
            if let Err(e) = sdb.store_stats(config, seconds, &gap_rows, &m_rows) {
                warn!("storing stats failed: {e:#}");
            }
        }
        Err(e) => warn!("{e:#}"),
    }

    if config.verbose >= 1 {
        report_top_percent(config, rid, n_log, &m_rows);
    }
    Ok(())
}

/// Sum of record probability captured when only the top N% of m values are
/// tested, against the projected PRP time for those tests.
fn report_top_percent(config: &Config, rid: u64, n_log: f64, m_rows: &[MStatRow]) {
    if m_rows.is_empty() {
        return;
    }
    let prp_time = prp_time_estimate(n_log);
    let prob_prime = 1.0 / n_log - 1.0 / (n_log * n_log);
    let prp_per_m = 1.0 / (prob_prime * (config.max_prime as f64).ln() * GAMMA.exp());
    let time_per_m = 2.0 * prp_time * prp_per_m;
    let sieve_time = SearchDb::open(&config.search_db)
        .and_then(|sdb| sdb.range_time(rid))
        .unwrap_or(0.0);

    let mut sorted: Vec<f64> = m_rows.iter().map(|r| r.prob_record).collect();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    info!(
        prp_per_side = format_args!("{:.1}", prp_per_m),
        secs_per_m = format_args!("{:.2}", time_per_m),
        sieve_secs = format_args!("{:.0}", sieve_time),
        "top-percent projection"
    );
    for mark in [1usize, 5, 10, 20, 30, 50, 100] {
        let count = (sorted.len() * mark / 100).max(1);
        let sum: f64 = sorted[..count].iter().sum();
        info!(
            percent = mark,
            tested = count,
            sum_prob = format_args!("{:.5}", sum),
            hours = format_args!("{:.2}", count as f64 * time_per_m / 3600.0),
            "record probability captured"
        );
    }
}
