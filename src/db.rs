//! # Db — Sqlite Bookkeeping and the Record-Gaps Table
//!
//! Two databases, both plain sqlite files:
//!
//! - the **search db** records one `range` row per sieve run, keyed by a
//!   deterministic hash of the configuration tuple, plus the evaluator's
//!   `range_stats` and `m_stats` output. Re-running a range only refreshes
//!   its timing column.
//! - the **records db** is the external reference table of known prime-gap
//!   records (`gaps(gapsize, merit)`), read-only here.
//!
//! Store failures are non-fatal for the sieve (the unknowns file is already
//! on disk); callers log and continue.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags};

use crate::config::Config;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS range (
    rid           INTEGER PRIMARY KEY,
    P             INTEGER NOT NULL,
    D             INTEGER NOT NULL,
    m_start       INTEGER NOT NULL,
    m_inc         INTEGER NOT NULL,
    sieve_length  INTEGER NOT NULL,
    max_prime     INTEGER NOT NULL,
    min_merit     REAL NOT NULL,
    num_m         INTEGER NOT NULL,
    num_remaining INTEGER,
    time_sieve    REAL NOT NULL DEFAULT 0,
    time_stats    REAL NOT NULL DEFAULT 0,
    updated_at    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS range_stats (
    rid            INTEGER NOT NULL,
    gap            INTEGER NOT NULL,
    prob_combined  REAL NOT NULL,
    prob_low_side  REAL NOT NULL,
    prob_high_side REAL NOT NULL,
    PRIMARY KEY (rid, gap)
);
CREATE TABLE IF NOT EXISTS m_stats (
    rid          INTEGER NOT NULL,
    P            INTEGER NOT NULL,
    D            INTEGER NOT NULL,
    m            INTEGER NOT NULL,
    prob_record  REAL NOT NULL,
    prob_missing REAL NOT NULL,
    prob_merit   REAL NOT NULL,
    e_gap_next   REAL NOT NULL,
    e_gap_prev   REAL NOT NULL,
    PRIMARY KEY (rid, m)
);
";

/// One `range_stats` row: probability mass at a specific gap size.
pub struct GapStatRow {
    pub gap: u32,
    pub prob_combined: f64,
    pub prob_low_side: f64,
    pub prob_high_side: f64,
}

/// One `m_stats` row.
pub struct MStatRow {
    pub m: u64,
    pub prob_record: f64,
    pub prob_missing: f64,
    pub prob_merit: f64,
    pub e_gap_next: f64,
    pub e_gap_prev: f64,
}

pub struct SearchDb {
    conn: Connection,
}

impl SearchDb {
    pub fn open(path: &Path) -> Result<SearchDb> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening search db '{}'", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(60))?;
        conn.execute_batch(SCHEMA)?;
        Ok(SearchDb { conn })
    }

    /// Record a finished (possibly truncated) sieve. On duplicate key only
    /// the timing column is refreshed.
    pub fn insert_range_sieve(
        &self,
        config: &Config,
        max_prime: u64,
        num_m: u64,
        time_sieve: f64,
    ) -> Result<()> {
        let rid = config.run_id(max_prime);
        self.conn
            .execute(
                "INSERT INTO range (rid, P, D, m_start, m_inc, sieve_length, max_prime,
                                    min_merit, num_m, time_sieve, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(rid) DO UPDATE SET
                    time_sieve = excluded.time_sieve,
                    updated_at = excluded.updated_at",
                params![
                    rid as i64,
                    config.p,
                    config.d as i64,
                    config.mstart as i64,
                    config.minc as i64,
                    config.sieve_length as i64,
                    max_prime as i64,
                    config.min_merit,
                    num_m as i64,
                    time_sieve,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )
            .context("range insert")?;
        Ok(())
    }

    /// True when the evaluator already stored stats for this range.
    pub fn is_range_processed(&self, rid: u64) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM range WHERE rid = ?1 AND time_stats > 0",
            [rid as i64],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Combined sieve + stats wall time for a range, 0 when unknown.
    pub fn range_time(&self, rid: u64) -> Result<f64> {
        let time = self
            .conn
            .query_row(
                "SELECT time_sieve + time_stats FROM range WHERE rid = ?1 AND time_sieve > 0",
                [rid as i64],
                |row| row.get(0),
            )
            .unwrap_or(0.0);
        Ok(time)
    }

    /// Store the evaluator's output in one transaction.
    pub fn store_stats(
        &mut self,
        config: &Config,
        time_stats: f64,
        gap_rows: &[GapStatRow],
        m_rows: &[MStatRow],
    ) -> Result<()> {
        let rid = config.run_id(config.max_prime);
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO range (rid, P, D, m_start, m_inc, sieve_length, max_prime,
                                min_merit, num_m, num_remaining, time_stats, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(rid) DO UPDATE SET
                time_stats = excluded.time_stats,
                num_remaining = excluded.num_remaining,
                updated_at = excluded.updated_at",
            params![
                rid as i64,
                config.p,
                config.d as i64,
                config.mstart as i64,
                config.minc as i64,
                config.sieve_length as i64,
                config.max_prime as i64,
                config.min_merit,
                m_rows.len() as i64,
                m_rows.len() as i64,
                time_stats,
                chrono::Utc::now().to_rfc3339(),
            ],
        )
        .context("range upsert")?;

        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO range_stats
                    (rid, gap, prob_combined, prob_low_side, prob_high_side)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in gap_rows {
                stmt.execute(params![
                    rid as i64,
                    row.gap,
                    row.prob_combined,
                    row.prob_low_side,
                    row.prob_high_side,
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO m_stats
                    (rid, P, D, m, prob_record, prob_missing, prob_merit, e_gap_next, e_gap_prev)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for row in m_rows {
                stmt.execute(params![
                    rid as i64,
                    config.p,
                    config.d as i64,
                    row.m as i64,
                    row.prob_record,
                    row.prob_missing,
                    row.prob_merit,
                    row.e_gap_next,
                    row.e_gap_prev,
                ])?;
            }
        }

        tx.commit().context("commit stats")?;
        Ok(())
    }
}

/// Load the record table: `records[gap] = log(start prime)` of the current
/// record holder, infinity when the gap has never been observed. Gaps at or
/// above `size` are ignored.
pub fn load_record_gaps(path: &Path, size: usize) -> Result<Vec<f32>> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("opening records db '{}'", path.display()))?;
    let mut records = vec![f32::INFINITY; size];

    let mut stmt = conn.prepare("SELECT gapsize, merit FROM gaps")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let gap: i64 = row.get(0)?;
        let merit: f64 = row.get(1)?;
        if gap > 0 && (gap as usize) < records.len() && merit > 0.0 {
            // merit = gap / log(start), so this recovers log(start).
            records[gap as usize] = (gap as f64 / merit) as f32;
        }
    }
    Ok(records)
}
