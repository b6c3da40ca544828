//! # Primes — Restartable Segmented Prime Stream
//!
//! The sieve core consumes primes two ways, both served here:
//!
//! 1. [`PrimeStream`] — an ordered, unbounded enumeration of primes above a
//!    caller-chosen start, produced segment by segment so the whole range up
//!    to `MAX_PRIME` (10^10..10^11) never has to exist in memory at once.
//!    Restartable from any bound, cheap to hold in scope.
//! 2. [`generate_primes`] — a complete in-memory list up to a limit, used
//!    for the factors of `P#` and anywhere a small bounded list is more
//!    convenient than a stream. It simply drains a stream, so both
//!    producers share one sieve.

/// Numbers per stream segment. One segment's flag array is ~1 MiB, small
/// enough to stay cache-friendly while amortizing base-prime setup.
const SEGMENT_SPAN: u64 = 1 << 20;

/// Generate all primes up to `limit` (inclusive).
pub fn generate_primes(limit: u64) -> Vec<u64> {
    if limit < 2 {
        return Vec::new();
    }
    let mut primes = Vec::with_capacity(primepi_estimate(limit) as usize + 4);
    let mut stream = PrimeStream::new(0);
    loop {
        let p = stream.next_prime();
        if p > limit {
            return primes;
        }
        primes.push(p);
    }
}

/// Rough prime-counting estimate, used to size buffers and pace progress
/// output. Within a few percent of pi(n) for n >= 10^4.
pub fn primepi_estimate(n: u64) -> u64 {
    if n < 10 {
        return 4;
    }
    let nf = n as f64;
    (nf / (nf.ln() - 1.0)) as u64
}

/// Base primes for segment sieving: an odd-only sieve of Eratosthenes over
/// `[3, limit]`, index `i` standing for `2i + 1`. Only ever run up to
/// `sqrt(MAX_PRIME)`, so the half-bitmap stays tiny.
fn base_sieve(limit: u64) -> Vec<u64> {
    if limit < 2 {
        return Vec::new();
    }
    let half = ((limit - 1) / 2) as usize;
    let mut composite = vec![false; half + 1];
    let mut i = 1usize;
    loop {
        let n = 2 * i as u64 + 1;
        if n * n > limit {
            break;
        }
        if !composite[i] {
            // Odd multiples only; evens are not represented at all.
            let mut m = n * n;
            while m <= limit {
                composite[(m / 2) as usize] = true;
                m += 2 * n;
            }
        }
        i += 1;
    }

    let mut primes = vec![2u64];
    primes.extend(
        (1..=half)
            .filter(|&i| !composite[i])
            .map(|i| 2 * i as u64 + 1),
    );
    primes
}

/// Ordered enumeration of primes strictly greater than `start`, without an
/// upper bound; the caller stops consuming once its own limit is passed.
pub struct PrimeStream {
    next_low: u64,
    base_primes: Vec<u64>,
    base_limit: u64,
    buf: Vec<u64>,
    idx: usize,
}

impl PrimeStream {
    /// Stream of primes `> start`. `PrimeStream::new(0)` starts at 2.
    pub fn new(start: u64) -> Self {
        PrimeStream {
            next_low: start + 1,
            base_primes: Vec::new(),
            base_limit: 1,
            buf: Vec::new(),
            idx: 0,
        }
    }

    /// The next prime in increasing order.
    pub fn next_prime(&mut self) -> u64 {
        loop {
            if self.idx < self.buf.len() {
                let p = self.buf[self.idx];
                self.idx += 1;
                return p;
            }
            self.fill_segment();
        }
    }

    fn fill_segment(&mut self) {
        let low = self.next_low;
        let high = low + (SEGMENT_SPAN - 1);
        self.next_low = high + 1;

        // Base primes must cover sqrt(high); regrow with headroom so
        // consecutive segments rarely resieve.
        let need = (high as f64).sqrt() as u64 + 2;
        if need > self.base_limit {
            let grown = need.max(1 << 16);
            self.base_primes = base_sieve(grown);
            self.base_limit = grown;
        }

        let span = (high - low + 1) as usize;
        let mut is_composite = vec![false; span];
        for &p in &self.base_primes {
            if p.saturating_mul(p) > high {
                break;
            }
            let first_multiple = low.div_ceil(p) * p;
            let mut x = first_multiple.max(p * p);
            while x <= high {
                is_composite[(x - low) as usize] = true;
                x += p;
            }
        }

        self.buf.clear();
        self.idx = 0;
        for (i, &c) in is_composite.iter().enumerate() {
            let n = low + i as u64;
            if n >= 2 && !c {
                self.buf.push(n);
            }
        }
    }
}

impl Iterator for PrimeStream {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        Some(self.next_prime())
    }
}
