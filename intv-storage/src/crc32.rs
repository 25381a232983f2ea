//! CRC32 checksums for ROM fingerprinting.
//!
//! Two polynomials are supported. The ZIP polynomial follows the usual
//! convention (seed `0xFFFFFFFF`, final inversion) and is computed with
//! `crc32fast`. Castagnoli seeds with zero and is not inverted; it uses the
//! table below directly.
//!
//! Byte ranges can be excluded from the checksum so that cartridge-specific
//! header bytes do not affect ROM identity. Per-file checksums are memoized
//! by file identity.

use std::collections::HashMap;
use std::hash::Hash;
use std::io::{self, Read};
use std::ops::RangeInclusive;
use std::sync::{Arc, OnceLock};

use log::trace;
use parking_lot::Mutex;

use crate::error::Result;
use crate::location::StorageLocation;
use crate::memo::{FileMemo, MemoSource};

/// Seed for ZIP checksums, and the "no memo" sentinel: a completed ZIP
/// checksum is always inverted, so it never equals the raw seed.
pub const INITIAL_VALUE: u32 = 0xFFFF_FFFF;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Crc32Polynomial {
    #[default]
    Zip,
    Castagnoli,
}

impl Crc32Polynomial {
    /// Reversed (LSB-first) polynomial.
    pub const fn reversed(self) -> u32 {
        match self {
            Self::Zip => 0xEDB8_8320,
            Self::Castagnoli => 0x82F6_3B78,
        }
    }

    pub fn table(self) -> &'static [u32; 256] {
        match self {
            Self::Zip => &ZIP_TABLE,
            Self::Castagnoli => &CASTAGNOLI_TABLE,
        }
    }

    const fn seed(self) -> u32 {
        match self {
            Self::Zip => INITIAL_VALUE,
            Self::Castagnoli => 0,
        }
    }

    const fn final_xor(self) -> u32 {
        match self {
            Self::Zip => INITIAL_VALUE,
            Self::Castagnoli => 0,
        }
    }
}

static ZIP_TABLE: [u32; 256] = make_table(Crc32Polynomial::Zip.reversed());
static CASTAGNOLI_TABLE: [u32; 256] = make_table(Crc32Polynomial::Castagnoli.reversed());

const fn make_table(poly: u32) -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { poly ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

/// One step of the table-driven update.
#[inline]
pub fn update_crc(crc: u32, byte: u8, polynomial: Crc32Polynomial) -> u32 {
    (crc >> 8) ^ polynomial.table()[((crc ^ byte as u32) & 0xFF) as usize]
}

fn is_ignored(position: u64, ignore: &[RangeInclusive<u64>]) -> bool {
    ignore.iter().any(|r| r.contains(&position))
}

enum State {
    Zip(crc32fast::Hasher),
    Table(u32),
}

/// Streaming checksum that tracks the absolute byte position, so excluded
/// ranges apply correctly across chunk boundaries.
pub struct Crc32 {
    polynomial: Crc32Polynomial,
    state: State,
    position: u64,
}

impl Crc32 {
    pub fn new(polynomial: Crc32Polynomial) -> Self {
        let state = match polynomial {
            Crc32Polynomial::Zip => State::Zip(crc32fast::Hasher::new()),
            Crc32Polynomial::Castagnoli => State::Table(polynomial.seed()),
        };
        Self {
            polynomial,
            state,
            position: 0,
        }
    }

    pub fn polynomial(&self) -> Crc32Polynomial {
        self.polynomial
    }

    /// Bytes consumed so far, including excluded ones.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            State::Zip(hasher) => hasher.update(data),
            State::Table(crc) => {
                for &b in data {
                    *crc = update_crc(*crc, b, self.polynomial);
                }
            }
        }
        self.position += data.len() as u64;
    }

    /// Feed `data`, skipping bytes whose absolute position lies in `ignore`.
    pub fn update_excluding(&mut self, data: &[u8], ignore: &[RangeInclusive<u64>]) {
        if ignore.is_empty() {
            self.update(data);
            return;
        }
        let base = self.position;
        let mut run_start = None;
        for i in 0..data.len() {
            if is_ignored(base + i as u64, ignore) {
                if let Some(start) = run_start.take() {
                    self.feed(&data[start..i]);
                }
            } else if run_start.is_none() {
                run_start = Some(i);
            }
        }
        if let Some(start) = run_start {
            self.feed(&data[start..]);
        }
        self.position = base + data.len() as u64;
    }

    fn feed(&mut self, run: &[u8]) {
        let position = self.position;
        self.update(run);
        self.position = position;
    }

    pub fn finish(&self) -> u32 {
        match &self.state {
            State::Zip(hasher) => hasher.clone().finalize(),
            State::Table(crc) => crc ^ self.polynomial.final_xor(),
        }
    }
}

pub fn of_buffer(data: &[u8], polynomial: Crc32Polynomial) -> u32 {
    let mut crc = Crc32::new(polynomial);
    crc.update(data);
    crc.finish()
}

/// Checksum of `data` with the bytes at positions in `ignore` left out.
pub fn of_block(data: &[u8], ignore: &[RangeInclusive<u64>], polynomial: Crc32Polynomial) -> u32 {
    let mut crc = Crc32::new(polynomial);
    crc.update_excluding(data, ignore);
    crc.finish()
}

pub fn of_stream<R: Read>(reader: R, polynomial: Crc32Polynomial) -> io::Result<u32> {
    of_stream_with(reader, &FileCrcOptions::new(polynomial))
}

/// Stream checksum applying first-byte replacement and exclusions.
pub fn of_stream_with<R: Read>(mut reader: R, options: &FileCrcOptions) -> io::Result<u32> {
    let mut crc = Crc32::new(options.polynomial);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut first = true;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if first {
            if let Some(byte) = options.replace_first_byte {
                buf[0] = byte;
            }
            first = false;
        }
        crc.update_excluding(&buf[..n], &options.ignore_ranges);
    }
    Ok(crc.finish())
}

/// Parameters of a per-file checksum. Distinct option sets are memoized
/// separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FileCrcOptions {
    pub polynomial: Crc32Polynomial,
    /// Substitute this byte for the byte at position 0 before hashing.
    pub replace_first_byte: Option<u8>,
    /// Inclusive byte ranges left out of the checksum.
    pub ignore_ranges: Vec<RangeInclusive<u64>>,
}

impl FileCrcOptions {
    pub fn new(polynomial: Crc32Polynomial) -> Self {
        Self {
            polynomial,
            ..Self::default()
        }
    }

    pub fn replace_first_byte(mut self, byte: u8) -> Self {
        self.replace_first_byte = Some(byte);
        self
    }

    pub fn ignore(mut self, range: RangeInclusive<u64>) -> Self {
        self.ignore_ranges.push(range);
        self
    }
}

struct FileCrcSource;

impl MemoSource for FileCrcSource {
    type Value = u32;
    type Aux = FileCrcOptions;

    fn default_memo(&self) -> u32 {
        INITIAL_VALUE
    }

    fn is_valid_memo(&self, value: &u32) -> bool {
        *value != INITIAL_VALUE
    }

    fn compute_memo(&self, location: &StorageLocation, options: &FileCrcOptions) -> Result<u32> {
        trace!("computing crc of {}", location);
        let stream = location.open()?;
        Ok(of_stream_with(stream, options)?)
    }
}

/// Memoized per-file checksums.
#[derive(Default)]
pub struct FileCrcCache {
    memos: Mutex<HashMap<FileCrcOptions, Arc<FileMemo<FileCrcSource>>>>,
}

impl FileCrcCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn memo_for(&self, options: &FileCrcOptions) -> Arc<FileMemo<FileCrcSource>> {
        let mut memos = self.memos.lock();
        Arc::clone(
            memos
                .entry(options.clone())
                .or_insert_with(|| Arc::new(FileMemo::new(FileCrcSource))),
        )
    }

    /// Checksum of the file at `location`, reusing the memo while the file's
    /// size and modification time are unchanged.
    pub fn of_file(&self, location: &StorageLocation, options: &FileCrcOptions) -> Result<u32> {
        let memo = self.memo_for(options);
        memo.value_or_default(location, options)
    }

    pub fn invalidate(&self, location: &StorageLocation) {
        for memo in self.memos.lock().values() {
            memo.remove(location);
        }
    }
}

/// The process-wide checksum cache.
pub fn file_cache() -> &'static FileCrcCache {
    static CACHE: OnceLock<FileCrcCache> = OnceLock::new();
    CACHE.get_or_init(FileCrcCache::new)
}

pub fn of_file(location: &StorageLocation, options: &FileCrcOptions) -> Result<u32> {
    file_cache().of_file(location, options)
}
