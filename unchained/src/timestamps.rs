//! Block timestamp table (`ts.bin`) and its single-record repair.
//!
//! The table is a flat array of `{block_number: u32, timestamp: u32}` records,
//! one per block starting at block zero.

use crate::chain::ChainClient;
use crate::chunk::PART_EXTENSION;
use crate::error::{IndexError, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

pub const TIMESTAMP_RECORD_WIDTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampRecord {
    pub block_number: u32,
    pub timestamp: u32,
}

impl TimestampRecord {
    fn decode(bytes: &[u8]) -> Self {
        let mut block = [0u8; 4];
        let mut ts = [0u8; 4];
        block.copy_from_slice(&bytes[..4]);
        ts.copy_from_slice(&bytes[4..TIMESTAMP_RECORD_WIDTH]);
        Self {
            block_number: u32::from_le_bytes(block),
            timestamp: u32::from_le_bytes(ts),
        }
    }

    fn encode(&self) -> [u8; TIMESTAMP_RECORD_WIDTH] {
        let mut out = [0u8; TIMESTAMP_RECORD_WIDTH];
        out[..4].copy_from_slice(&self.block_number.to_le_bytes());
        out[4..].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }
}

#[derive(Debug, Clone)]
pub struct TimestampTable {
    path: PathBuf,
}

impl TimestampTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a fresh table. Test fixtures and bootstrap only.
    pub fn create(path: impl Into<PathBuf>, records: &[TimestampRecord]) -> Result<Self> {
        let table = Self::new(path);
        let bytes: Vec<u8> = records.iter().flat_map(|record| record.encode()).collect();
        table.replace(&bytes)?;
        Ok(table)
    }

    fn read_checked(&self) -> Result<Vec<u8>> {
        let bytes = fs::read(&self.path).map_err(|err| IndexError::io(&self.path, err))?;
        if bytes.len() % TIMESTAMP_RECORD_WIDTH != 0 {
            return Err(IndexError::decode(
                &self.path,
                format!("{} bytes is not a whole number of records", bytes.len()),
            ));
        }
        Ok(bytes)
    }

    /// Number of blocks covered.
    pub fn count(&self) -> Result<u64> {
        Ok((self.read_checked()?.len() / TIMESTAMP_RECORD_WIDTH) as u64)
    }

    pub fn get(&self, block_number: u64) -> Result<Option<TimestampRecord>> {
        let bytes = self.read_checked()?;
        Ok(record_offset(block_number, bytes.len())
            .map(|offset| TimestampRecord::decode(&bytes[offset..offset + TIMESTAMP_RECORD_WIDTH])))
    }

    /// Re-reads one block's timestamp from the chain and rewrites its record.
    /// Block 1 drags block 0 along. Blocks past the end of the table are
    /// ignored; the return value says whether anything was rewritten.
    pub async fn repair<C: ChainClient + ?Sized>(
        &self,
        block_number: u64,
        chain: &C,
    ) -> Result<bool> {
        let mut targets = vec![block_number];
        if block_number == 1 {
            targets.push(0);
        }

        let mut bytes = self.read_checked()?;
        let mut changed = false;
        for block in targets {
            let Some(offset) = record_offset(block, bytes.len()) else {
                continue;
            };
            let timestamp = chain.block_timestamp(block).await?.ok_or_else(|| {
                IndexError::InvariantViolation(format!("chain has no block {block}"))
            })?;
            let record = TimestampRecord {
                block_number: narrow(block)?,
                timestamp: narrow(timestamp)?,
            };
            bytes[offset..offset + TIMESTAMP_RECORD_WIDTH].copy_from_slice(&record.encode());
            info!(block, timestamp, "timestamp reset from chain");
            changed = true;
        }
        if changed {
            self.replace(&bytes)?;
        }
        Ok(changed)
    }

    /// Copy-then-rename so a reader never sees a half-written table.
    fn replace(&self, bytes: &[u8]) -> Result<()> {
        let staging = self.path.with_extension(format!("bin.{PART_EXTENSION}"));
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&staging)?;
            file.write_all(bytes)?;
            file.sync_all()
        };
        if let Err(err) = write() {
            let _ = fs::remove_file(&staging);
            return Err(IndexError::io(&staging, err));
        }
        fs::rename(&staging, &self.path).map_err(|err| IndexError::io(&self.path, err))
    }
}

fn record_offset(block_number: u64, table_len: usize) -> Option<usize> {
    let offset = usize::try_from(block_number).ok()?.checked_mul(TIMESTAMP_RECORD_WIDTH)?;
    (offset + TIMESTAMP_RECORD_WIDTH <= table_len).then_some(offset)
}

fn narrow(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        IndexError::InvariantViolation(format!("{value} does not fit in a timestamp record"))
    })
}
