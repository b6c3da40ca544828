//! # Unknowns — Per-m Surviving-Offset Serialization
//!
//! One line per valid `m`, ascending `mi`:
//!
//! ```text
//! <mi> : -<ul> +<uu> | <low list> | <high list>
//! ```
//!
//! Two encodings of the lists:
//! - **plain**: space-separated signed offsets (`-17 -23 | +11 +13`);
//! - **RLE**: per side, a space then `ul`/`uu` two-byte pairs, each pair
//!   `(a, b)` encoding `delta = (a-48)*128 + (b-48)` as the gap from the
//!   previous offset (starting at 0). Both bytes lie in `[48, 176)`, so the
//!   stream is byte-oriented, not UTF-8.
//!
//! The writer picks the encoding from configuration; the reader auto-detects
//! it from the first data line. I/O errors here are fatal for the run.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};

/// Largest delta one RLE pair can carry.
const RLE_MAX_DELTA: u32 = 128 * 128 - 1;

/// One parsed row: offsets are positive distances from the center, ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLine {
    pub mi: u64,
    pub low: Vec<u32>,
    pub high: Vec<u32>,
}

pub struct UnknownsWriter {
    out: BufWriter<File>,
    rle: bool,
}

impl UnknownsWriter {
    /// Create the output file. Refusing to overwrite an existing file is a
    /// configuration error, checked again here for direct library callers.
    pub fn create(path: &Path, rle: bool) -> Result<UnknownsWriter> {
        ensure!(!path.exists(), "output file '{}' already exists", path.display());
        let file =
            File::create(path).with_context(|| format!("creating '{}'", path.display()))?;
        Ok(UnknownsWriter {
            out: BufWriter::new(file),
            rle,
        })
    }

    pub fn write_row(&mut self, mi: u64, low: &[u32], high: &[u32]) -> Result<()> {
        write!(self.out, "{} : -{} +{} |", mi, low.len(), high.len())?;
        if self.rle {
            self.write_side_rle(low)?;
            self.out.write_all(b" |")?;
            self.write_side_rle(high)?;
        } else {
            for &off in low {
                write!(self.out, " -{}", off)?;
            }
            self.out.write_all(b" |")?;
            for &off in high {
                write!(self.out, " +{}", off)?;
            }
        }
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn write_side_rle(&mut self, side: &[u32]) -> Result<()> {
        self.out.write_all(b" ")?;
        let mut last = 0u32;
        for &off in side {
            let delta = off - last;
            last = off;
            assert!(delta <= RLE_MAX_DELTA, "RLE delta {} out of range", delta);
            self.out
                .write_all(&[48 + (delta / 128) as u8, 48 + (delta % 128) as u8])?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

pub struct UnknownsReader {
    input: BufReader<File>,
    pub rle: bool,
    pending: Option<Vec<u8>>,
}

impl UnknownsReader {
    /// Open and sniff the encoding from the first line.
    pub fn open(path: &Path) -> Result<UnknownsReader> {
        let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
        let mut input = BufReader::new(file);
        let mut first = Vec::new();
        input.read_until(b'\n', &mut first)?;
        let rle = detect_rle(&first);
        Ok(UnknownsReader {
            input,
            rle,
            pending: if first.is_empty() { None } else { Some(first) },
        })
    }

    /// Next row, or `None` at end of file.
    pub fn next_row(&mut self) -> Result<Option<UnknownLine>> {
        let line = match self.pending.take() {
            Some(l) => l,
            None => {
                let mut buf = Vec::new();
                self.input.read_until(b'\n', &mut buf)?;
                if buf.is_empty() {
                    return Ok(None);
                }
                buf
            }
        };
        parse_line(&line, self.rle).map(Some)
    }
}

/// A plain low list opens with `-<digits>`; an RLE low list opens with a
/// pair byte `>= 48`. An empty low side is followed by `|` either way, so
/// fall through to the high side; a fully empty row reads identically in
/// both encodings.
fn detect_rle(line: &[u8]) -> bool {
    let Some(bar) = line.iter().position(|&b| b == b'|') else {
        return false;
    };
    let rest = &line[bar + 1..];
    // Skip the single separator space.
    let rest = rest.strip_prefix(b" ").unwrap_or(rest);
    match rest.first() {
        Some(b'-') => false,
        Some(b'|') => {
            let rest = &rest[1..];
            let rest = rest.strip_prefix(b" ").unwrap_or(rest);
            !matches!(rest.first(), Some(b'+') | Some(b'\n') | None)
        }
        Some(_) => true,
        None => false,
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn skip_spaces(&mut self) {
        while self.bytes.get(self.pos) == Some(&b' ') {
            self.pos += 1;
        }
    }

    fn expect(&mut self, b: u8) -> Result<()> {
        ensure!(
            self.bytes.get(self.pos) == Some(&b),
            "expected '{}' at byte {}",
            b as char,
            self.pos
        );
        self.pos += 1;
        Ok(())
    }

    fn read_u64(&mut self) -> Result<u64> {
        let start = self.pos;
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|b| b.is_ascii_digit())
        {
            self.pos += 1;
        }
        ensure!(self.pos > start, "expected digits at byte {}", start);
        let mut v: u64 = 0;
        for &b in &self.bytes[start..self.pos] {
            v = v * 10 + u64::from(b - b'0');
        }
        Ok(v)
    }

    fn read_byte(&mut self) -> Result<u8> {
        match self.bytes.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                Ok(b)
            }
            None => bail!("truncated RLE line at byte {}", self.pos),
        }
    }
}

/// Parse one serialized row. `rle` selects list decoding.
pub fn parse_line(line: &[u8], rle: bool) -> Result<UnknownLine> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let mut c = Cursor { bytes: line, pos: 0 };

    let mi = c.read_u64()?;
    c.skip_spaces();
    c.expect(b':')?;
    c.skip_spaces();
    c.expect(b'-')?;
    let count_low = c.read_u64()? as usize;
    c.skip_spaces();
    c.expect(b'+')?;
    let count_high = c.read_u64()? as usize;
    c.skip_spaces();
    c.expect(b'|')?;

    let low = parse_side(&mut c, count_low, rle, b'-')?;
    c.skip_spaces();
    c.expect(b'|')?;
    let high = parse_side(&mut c, count_high, rle, b'+')?;

    Ok(UnknownLine { mi, low, high })
}

fn parse_side(c: &mut Cursor, count: usize, rle: bool, sign: u8) -> Result<Vec<u32>> {
    let mut side = Vec::with_capacity(count);
    if rle {
        if count > 0 {
            c.expect(b' ')?;
        } else {
            c.skip_spaces();
        }
        let mut offset = 0u32;
        for _ in 0..count {
            let a = c.read_byte()?;
            let b = c.read_byte()?;
            ensure!(a >= 48 && b >= 48, "RLE pair byte below 48");
            offset += u32::from(a - 48) * 128 + u32::from(b - 48);
            side.push(offset);
        }
    } else {
        for _ in 0..count {
            c.skip_spaces();
            c.expect(sign)?;
            side.push(c.read_u64()? as u32);
        }
    }
    Ok(side)
}
