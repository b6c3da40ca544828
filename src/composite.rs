//! # Composite — Packed Bit-Matrix of Eliminated Candidates
//!
//! One bit per kept `(m, i)` pair, one row per valid `m`. A set bit means a
//! known prime factor; bits only ever go 0 -> 1 while sieving, and the whole
//! matrix is read-only during serialization. Bit 0 of every row is the
//! reserved sink for offsets the wheel reindexer dropped, pre-set at
//! allocation.
//!
//! The matrix is the run's single large allocation and is bounded at 7 GiB;
//! the bound is enforced before anything is allocated.

use anyhow::{ensure, Result};

use crate::wheel::Reindex;

/// Hard cap on the matrix footprint.
pub const MAX_MATRIX_BYTES: u64 = 7 * 1024 * 1024 * 1024;

/// One packed bit-row. 8x smaller than `Vec<bool>`, counts survivors with
/// hardware POPCNT.
pub struct BitRow {
    words: Vec<u64>,
    len: usize,
}

impl BitRow {
    /// `len` bits, all clear except bit 0.
    fn new(len: usize) -> Self {
        debug_assert!(len >= 1);
        let mut row = BitRow {
            words: vec![0u64; len.div_ceil(64)],
            len,
        };
        row.set(0);
        row
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark bit `index` composite.
    #[inline]
    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.words[index / 64] |= 1u64 << (index % 64);
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Number of still-unknown candidates (clear bits, excluding the
    /// reserved bit 0 which is always set).
    pub fn count_unknown(&self) -> usize {
        let set: usize = self.words.iter().map(|w| w.count_ones() as usize).sum();
        self.len - set
    }
}

/// The full matrix: rows in `valid_mi` order.
pub struct CompositeMatrix {
    rows: Vec<BitRow>,
}

impl CompositeMatrix {
    /// Allocate per-row storage sized by the wheel residue of each valid m.
    /// Fails before allocating when the estimate crosses [`MAX_MATRIX_BYTES`].
    pub fn allocate(reindex: &Reindex, m_start: u64) -> Result<CompositeMatrix> {
        let mut bits: u64 = 0;
        for &mi in &reindex.valid_mi {
            bits += reindex.row_len(m_start + mi) as u64;
        }
        let bytes = bits / 8;
        ensure!(
            bytes < MAX_MATRIX_BYTES,
            "composite matrix needs {} MiB, over the {} MiB limit; reduce minc or sieve_length",
            bytes / 1024 / 1024,
            MAX_MATRIX_BYTES / 1024 / 1024
        );

        let rows = reindex
            .valid_mi
            .iter()
            .map(|&mi| BitRow::new(reindex.row_len(m_start + mi)))
            .collect();
        Ok(CompositeMatrix { rows })
    }

    #[inline]
    pub fn set(&mut self, row: usize, bit: u32) {
        self.rows[row].set(bit as usize);
    }

    #[inline]
    pub fn row(&self, row: usize) -> &BitRow {
        &self.rows[row]
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn rows_mut(&mut self) -> &mut [BitRow] {
        &mut self.rows
    }

    /// Total unknown candidates across all rows.
    pub fn total_unknown(&self) -> u64 {
        self.rows.iter().map(|r| r.count_unknown() as u64).sum()
    }
}
