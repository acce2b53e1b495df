//! Per-chunk bloom filter and its file codec.
//!
//! Layout (little-endian):
//! - `magic: u16` (`0xdead`)
//! - `version_hash: [u8; 32]`
//! - `bank_count: u32`
//! - per bank: `n_inserted: u32` followed by `BLOOM_WIDTH_IN_BYTES` bit bytes

use super::stats::BloomSummary;
use super::{range_from_path, BlockRange, ChunkStats};
use crate::error::{IndexError, Result};
use alloy_primitives::Address;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

pub const BLOOM_MAGIC: u16 = 0xdead;
pub const BLOOM_WIDTH_IN_BITS: u32 = 1_048_576;
pub const BLOOM_WIDTH_IN_BYTES: usize = (BLOOM_WIDTH_IN_BITS / 8) as usize;
/// A bank is considered full after this many insertions.
pub const MAX_ADDRS_IN_BLOOM: u32 = 50_000;
/// Number of bits set per address.
pub const BLOOM_HASH_COUNT: usize = 5;
pub const BLOOM_HEADER_WIDTH: usize = 2 + 32 + 4;
pub const BLOOM_BANK_WIDTH: usize = 4 + BLOOM_WIDTH_IN_BYTES;

const FORMAT_VERSION: &str = "trueblocks-core@v2.0.0-release";

/// Hash identifying the chunk format version, stored in every header.
pub fn format_version_hash() -> [u8; 32] {
    Sha256::digest(FORMAT_VERSION.as_bytes()).into()
}

/// Bit positions an address occupies in a bank.
fn which_bits(address: &Address) -> [u32; BLOOM_HASH_COUNT] {
    let bytes = address.as_slice();
    let mut bits = [0u32; BLOOM_HASH_COUNT];
    for (k, bit) in bits.iter_mut().enumerate() {
        let word = [
            bytes[4 * k],
            bytes[4 * k + 1],
            bytes[4 * k + 2],
            bytes[4 * k + 3],
        ];
        *bit = u32::from_be_bytes(word) % BLOOM_WIDTH_IN_BITS;
    }
    bits
}

/// One fixed-width sub-filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomBank {
    n_inserted: u32,
    bytes: Vec<u8>,
}

impl Default for BloomBank {
    fn default() -> Self {
        Self {
            n_inserted: 0,
            bytes: vec![0u8; BLOOM_WIDTH_IN_BYTES],
        }
    }
}

impl BloomBank {
    pub fn n_inserted(&self) -> u32 {
        self.n_inserted
    }

    fn is_full(&self) -> bool {
        self.n_inserted >= MAX_ADDRS_IN_BLOOM
    }

    fn set_bit(&mut self, bit: u32) {
        let bit = bit as usize;
        self.bytes[bit / 8] |= 1u8 << (bit % 8);
    }

    fn is_set(&self, bit: u32) -> bool {
        let bit = bit as usize;
        self.bytes[bit / 8] & (1u8 << (bit % 8)) != 0
    }

    fn insert(&mut self, address: &Address) {
        for bit in which_bits(address) {
            self.set_bit(bit);
        }
        self.n_inserted = self.n_inserted.saturating_add(1);
    }

    fn may_contain(&self, address: &Address) -> bool {
        which_bits(address).into_iter().all(|bit| self.is_set(bit))
    }
}

/// Probabilistic address set: no false negatives, bounded false positives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    banks: Vec<BloomBank>,
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl BloomFilter {
    pub fn new() -> Self {
        Self {
            banks: vec![BloomBank::default()],
        }
    }

    pub fn banks(&self) -> &[BloomBank] {
        &self.banks
    }

    pub fn bank_count(&self) -> usize {
        self.banks.len()
    }

    /// Total insertions across banks.
    pub fn inserted(&self) -> u64 {
        self.banks.iter().map(|bank| u64::from(bank.n_inserted)).sum()
    }

    /// Adds an address, opening a new bank once the current one is full.
    pub fn insert(&mut self, address: &Address) {
        if self.banks.last().map_or(true, BloomBank::is_full) {
            self.banks.push(BloomBank::default());
        }
        if let Some(bank) = self.banks.last_mut() {
            bank.insert(address);
        }
    }

    /// `true` means "maybe present": the index chunk must confirm it.
    pub fn may_contain(&self, address: &Address) -> bool {
        self.banks.iter().any(|bank| bank.may_contain(address))
    }

    /// False-positive bound for this filter with every bank at capacity.
    pub fn false_positive_bound(&self) -> f64 {
        let k = BLOOM_HASH_COUNT as f64;
        let n = f64::from(MAX_ADDRS_IN_BLOOM);
        let m = f64::from(BLOOM_WIDTH_IN_BITS);
        let per_bank = (1.0 - (-k * n / m).exp()).powf(k);
        1.0 - (1.0 - per_bank).powi(self.banks.len() as i32)
    }

    pub fn encoded_len(&self) -> usize {
        BLOOM_HEADER_WIDTH + self.banks.len() * BLOOM_BANK_WIDTH
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&BLOOM_MAGIC.to_le_bytes());
        out.extend_from_slice(&format_version_hash());
        out.extend_from_slice(&(self.banks.len() as u32).to_le_bytes());
        for bank in &self.banks {
            out.extend_from_slice(&bank.n_inserted.to_le_bytes());
            out.extend_from_slice(&bank.bytes);
        }
        out
    }

    /// Decodes a bloom file image. `path` is only used for error context.
    pub fn decode(bytes: &[u8], path: &Path) -> Result<Self> {
        let bank_count = read_bloom_header(bytes, path)?;
        let expected = BLOOM_HEADER_WIDTH + bank_count * BLOOM_BANK_WIDTH;
        if bytes.len() != expected {
            return Err(IndexError::decode(
                path,
                format!(
                    "bank width mismatch: {bank_count} banks of {BLOOM_WIDTH_IN_BYTES} bytes \
                     need {expected} bytes, file has {}",
                    bytes.len()
                ),
            ));
        }
        let banks = bytes[BLOOM_HEADER_WIDTH..]
            .chunks_exact(BLOOM_BANK_WIDTH)
            .map(|raw| BloomBank {
                n_inserted: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                bytes: raw[4..].to_vec(),
            })
            .collect();
        Ok(Self { banks })
    }
}

/// Validates magic and version, returning the bank count.
pub(crate) fn read_bloom_header(bytes: &[u8], path: &Path) -> Result<usize> {
    if bytes.len() < BLOOM_HEADER_WIDTH {
        return Err(IndexError::decode(path, "bloom header truncated"));
    }
    let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
    if magic != BLOOM_MAGIC {
        return Err(IndexError::decode(path, format!("bad bloom magic {magic:#06x}")));
    }
    if bytes[2..34] != format_version_hash() {
        return Err(IndexError::decode(path, "unsupported bloom format version"));
    }
    let count = u32::from_le_bytes([bytes[34], bytes[35], bytes[36], bytes[37]]);
    Ok(count as usize)
}

/// A bloom filter loaded from the cache together with what its file says
/// about the chunk.
#[derive(Debug, Clone)]
pub struct ChunkBloom {
    pub range: BlockRange,
    pub file_size: u64,
    pub filter: BloomFilter,
}

impl ChunkBloom {
    pub fn read(path: &Path) -> Result<Self> {
        let range = range_from_path(path)
            .ok_or_else(|| IndexError::decode(path, "file name does not encode a block range"))?;
        let bytes = fs::read(path).map_err(|err| IndexError::io(path, err))?;
        let filter = BloomFilter::decode(&bytes, path)?;
        Ok(Self {
            range,
            file_size: bytes.len() as u64,
            filter,
        })
    }

    pub fn may_contain(&self, address: &Address) -> bool {
        self.filter.may_contain(address)
    }

    /// Stats derived from the already-decoded file.
    pub fn stats(&self) -> ChunkStats {
        ChunkStats {
            start: self.range.first,
            end: self.range.last,
            bloom_size: self.file_size,
            bloom_count: self.filter.bank_count() as u32,
            inserted: self.filter.inserted(),
            ..ChunkStats::default()
        }
    }

    pub fn summary(&self) -> BloomSummary {
        BloomSummary::from(&self.stats())
    }
}
