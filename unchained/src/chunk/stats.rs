//! Chunk statistics derived from file sizes and headers.

use super::bloom::{read_bloom_header, BLOOM_HEADER_WIDTH, BLOOM_WIDTH_IN_BYTES};
use super::index::{parse_index_header, INDEX_HEADER_WIDTH};
use super::{bloom_to_index_path, range_from_path, BlockRange};
use crate::error::{IndexError, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStats {
    pub start: u64,
    pub end: u64,
    pub bloom_size: u64,
    pub index_size: u64,
    pub bloom_count: u32,
    pub inserted: u64,
    pub address_count: u32,
    pub appearance_count: u32,
}

impl ChunkStats {
    /// Reads only the headers of a chunk's bloom and (if present) index file.
    pub fn from_bloom_path(bloom_path: &Path) -> Result<Self> {
        let index_path = bloom_to_index_path(bloom_path)?;
        let range = range_from_path(bloom_path).ok_or_else(|| {
            IndexError::decode(bloom_path, "file name does not encode a block range")
        })?;

        let bloom_size = fs::metadata(bloom_path)
            .map_err(|err| IndexError::io(bloom_path, err))?
            .len();
        let header = read_prefix::<BLOOM_HEADER_WIDTH>(bloom_path)?;
        let bloom_count = read_bloom_header(&header, bloom_path)? as u32;

        let mut stats = Self {
            start: range.first,
            end: range.last,
            bloom_size,
            bloom_count,
            ..Self::default()
        };
        if index_path.exists() {
            stats.index_size = fs::metadata(&index_path)
                .map_err(|err| IndexError::io(&index_path, err))?
                .len();
            let header = read_prefix::<INDEX_HEADER_WIDTH>(&index_path)?;
            let header = parse_index_header(&header, &index_path)?;
            stats.address_count = header.address_count;
            stats.appearance_count = header.appearance_count;
        }
        Ok(stats)
    }

    pub fn blocks(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    /// Appearances per block, or zero when the index is absent.
    pub fn appearances_per_block(&self) -> f64 {
        self.appearance_count as f64 / self.blocks() as f64
    }
}

/// One line of the `blooms` listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BloomSummary {
    pub size: u64,
    pub range: BlockRange,
    /// Number of banks.
    pub count: u32,
    /// Bytes per bank.
    pub width: usize,
    pub n_inserted: u64,
}

impl From<&ChunkStats> for BloomSummary {
    fn from(stats: &ChunkStats) -> Self {
        Self {
            size: stats.bloom_size,
            range: BlockRange::new(stats.start, stats.end),
            count: stats.bloom_count,
            width: BLOOM_WIDTH_IN_BYTES,
            n_inserted: stats.inserted,
        }
    }
}

fn read_prefix<const N: usize>(path: &Path) -> Result<[u8; N]> {
    let mut file = File::open(path).map_err(|err| IndexError::io(path, err))?;
    let mut buf = [0u8; N];
    file.read_exact(&mut buf).map_err(|err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof => IndexError::decode(path, "header truncated"),
        _ => IndexError::io(path, err),
    })?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{BlockRange, CacheLayout, CacheType};
    use crate::test_utils::{temp_dir, write_chunk};
    use alloy_primitives::Address;

    #[test]
    fn stats_from_headers_only() {
        let dir = temp_dir("chunk-stats");
        let layout = CacheLayout::new(&dir);
        let range = BlockRange::new(0, 999);
        write_chunk(
            &layout,
            range,
            &[
                (Address::repeat_byte(1), vec![(10, 0), (11, 2)]),
                (Address::repeat_byte(2), vec![(12, 1)]),
            ],
            true,
        );

        let stats = ChunkStats::from_bloom_path(&layout.bloom_path(&range)).expect("stats");
        assert_eq!((stats.start, stats.end), (0, 999));
        assert_eq!(stats.bloom_count, 1);
        assert_eq!(stats.address_count, 2);
        assert_eq!(stats.appearance_count, 3);
        assert!(stats.index_size > 0);
        assert_eq!(stats.blocks(), 1000);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn stats_without_index_file() {
        let dir = temp_dir("chunk-stats-bloom-only");
        let layout = CacheLayout::new(&dir);
        let range = BlockRange::new(1000, 1999);
        write_chunk(&layout, range, &[(Address::repeat_byte(9), vec![(1500, 0)])], false);

        let stats = ChunkStats::from_bloom_path(&layout.bloom_path(&range)).expect("stats");
        assert_eq!(stats.index_size, 0);
        assert_eq!(stats.appearance_count, 0);
        assert!(stats.bloom_size > 0);

        let err = ChunkStats::from_bloom_path(&layout.chunk_path(&range, CacheType::Index))
            .expect_err("index path is not a bloom path");
        assert!(matches!(err, IndexError::InvariantViolation(_)));

        let _ = fs::remove_dir_all(&dir);
    }
}
