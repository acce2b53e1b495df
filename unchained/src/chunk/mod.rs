//! Chunk addressing, cache layout and the on-disk codecs.

pub mod bloom;
pub mod index;
pub mod stats;

pub use bloom::{BloomBank, BloomFilter, ChunkBloom};
pub use index::{encode_index_chunk, AddressRecord, AppearanceRecord, Appearances, IndexChunk};
pub use stats::{BloomSummary, ChunkStats};

use crate::error::{IndexError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const BLOOMS_DIR_NAME: &str = "blooms";
const INDEX_DIR_NAME: &str = "finalized";
const STAGING_DIR_NAME: &str = "staging";
const MANIFEST_FILE_NAME: &str = "manifest.json";
const TIMESTAMPS_FILE_NAME: &str = "ts.bin";
const BLOOM_EXTENSION: &str = "bloom";
const INDEX_EXTENSION: &str = "bin";
/// Extension used for every in-progress write.
pub const PART_EXTENSION: &str = "part";

/// Inclusive block range covered by one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub first: u64,
    pub last: u64,
}

impl BlockRange {
    pub const fn new(first: u64, last: u64) -> Self {
        Self { first, last }
    }

    pub fn contains(&self, block: u64) -> bool {
        self.first <= block && block <= self.last
    }

    pub fn intersects(&self, other: &BlockRange) -> bool {
        self.first <= other.last && other.first <= self.last
    }

    /// Chunk file stem, e.g. `000001000-000001999`.
    pub fn file_stem(&self) -> String {
        format!("{:09}-{:09}", self.first, self.last)
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_stem())
    }
}

impl FromStr for BlockRange {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self> {
        let (first, last) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| IndexError::ManifestInvalid(format!("malformed range {s:?}")))?;
        let parse = |part: &str| {
            part.parse::<u64>()
                .map_err(|err| IndexError::ManifestInvalid(format!("malformed range {s:?}: {err}")))
        };
        let range = Self::new(parse(first)?, parse(last)?);
        if range.first > range.last {
            return Err(IndexError::ManifestInvalid(format!(
                "range {s:?} ends before it starts"
            )));
        }
        Ok(range)
    }
}

/// The two blob kinds belonging to one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Bloom,
    Index,
}

impl CacheType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bloom => "bloom",
            Self::Index => "index",
        }
    }

    fn dir_name(&self) -> &'static str {
        match self {
            Self::Bloom => BLOOMS_DIR_NAME,
            Self::Index => INDEX_DIR_NAME,
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Self::Bloom => BLOOM_EXTENSION,
            Self::Index => INDEX_EXTENSION,
        }
    }

    /// Classifies a chunk path by its directory and extension.
    pub fn of_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;
        let dir = path.parent()?.file_name()?.to_str()?;
        [Self::Bloom, Self::Index]
            .into_iter()
            .find(|kind| kind.extension() == ext && kind.dir_name() == dir)
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rewrites a chunk path into the sibling path of the other kind.
fn convert_path(path: &Path, to: CacheType) -> Option<PathBuf> {
    CacheType::of_path(path)?;
    let stem = path.file_stem()?;
    let root = path.parent()?.parent()?;
    let mut out = root.join(to.dir_name()).join(stem);
    out.set_extension(to.extension());
    Some(out)
}

pub fn is_bloom_path(path: &Path) -> bool {
    CacheType::of_path(path) == Some(CacheType::Bloom)
}

/// Maps any chunk path to its bloom path.
pub fn to_bloom_path(path: &Path) -> Option<PathBuf> {
    convert_path(path, CacheType::Bloom)
}

/// Maps a bloom path to its index path.
///
/// Only bloom paths are accepted: handing anything else here is a bug in the
/// caller, reported as [`IndexError::InvariantViolation`].
pub fn bloom_to_index_path(path: &Path) -> Result<PathBuf> {
    if !is_bloom_path(path) {
        return Err(IndexError::InvariantViolation(format!(
            "expected a bloom path, got {}",
            path.display()
        )));
    }
    convert_path(path, CacheType::Index).ok_or_else(|| {
        IndexError::InvariantViolation(format!("cannot derive index path from {}", path.display()))
    })
}

/// Parses the block range encoded in a chunk file name.
pub fn range_from_path(path: &Path) -> Option<BlockRange> {
    path.file_stem()?.to_str()?.parse().ok()
}

/// Directory layout of the local index cache for one chain.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, kind: CacheType) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR_NAME)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE_NAME)
    }

    pub fn timestamps_path(&self) -> PathBuf {
        self.root.join(TIMESTAMPS_FILE_NAME)
    }

    pub fn chunk_path(&self, range: &BlockRange, kind: CacheType) -> PathBuf {
        let mut path = self.dir(kind).join(range.file_stem());
        path.set_extension(kind.extension());
        path
    }

    pub fn bloom_path(&self, range: &BlockRange) -> PathBuf {
        self.chunk_path(range, CacheType::Bloom)
    }

    pub fn index_path(&self, range: &BlockRange) -> PathBuf {
        self.chunk_path(range, CacheType::Index)
    }

    /// Unique staging path for an in-progress write of one chunk blob.
    pub fn staging_path(&self, range: &BlockRange, kind: CacheType, seq: u64) -> PathBuf {
        self.staging_dir().join(format!(
            "{}.{}.{}.{seq}.{PART_EXTENSION}",
            range.file_stem(),
            kind.extension(),
            std::process::id()
        ))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.dir(CacheType::Bloom),
            self.dir(CacheType::Index),
            self.staging_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|err| IndexError::io(&dir, err))?;
        }
        Ok(())
    }

    /// Ranges of every committed bloom file, ascending.
    pub fn list_bloom_ranges(&self) -> Result<Vec<BlockRange>> {
        let dir = self.dir(CacheType::Bloom);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ranges: Vec<BlockRange> = fs::read_dir(&dir)
            .map_err(|err| IndexError::io(&dir, err))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| is_bloom_path(path))
            .filter_map(|path| range_from_path(&path))
            .collect();
        ranges.sort();
        Ok(ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_parses_and_formats() {
        let range: BlockRange = "000001000-000001999".parse().expect("range");
        assert_eq!(range, BlockRange::new(1000, 1999));
        assert_eq!(range.to_string(), "000001000-000001999");
        assert_eq!("5-7".parse::<BlockRange>().expect("short"), BlockRange::new(5, 7));
        assert!("9-3".parse::<BlockRange>().is_err());
        assert!("12".parse::<BlockRange>().is_err());
    }

    #[test]
    fn range_intersection() {
        let range = BlockRange::new(1000, 1999);
        assert!(range.contains(1000) && range.contains(1999));
        assert!(!range.contains(2000));
        assert!(range.intersects(&BlockRange::new(1999, 3000)));
        assert!(!range.intersects(&BlockRange::new(2000, 3000)));
    }

    #[test]
    fn paths_convert_between_kinds() {
        let layout = CacheLayout::new("/cache/mainnet");
        let range = BlockRange::new(0, 999);
        let bloom = layout.bloom_path(&range);
        let index = layout.index_path(&range);
        assert_eq!(bloom, PathBuf::from("/cache/mainnet/blooms/000000000-000000999.bloom"));
        assert_eq!(index, PathBuf::from("/cache/mainnet/finalized/000000000-000000999.bin"));
        assert!(is_bloom_path(&bloom));
        assert!(!is_bloom_path(&index));
        assert_eq!(bloom_to_index_path(&bloom).expect("index path"), index);
        assert_eq!(to_bloom_path(&index), Some(bloom.clone()));
        assert_eq!(range_from_path(&index), Some(range));
    }

    #[test]
    fn index_path_is_not_bloom_input() {
        let layout = CacheLayout::new("/cache/mainnet");
        let index = layout.index_path(&BlockRange::new(0, 999));
        let err = bloom_to_index_path(&index).expect_err("index path rejected");
        assert!(matches!(err, IndexError::InvariantViolation(_)));
        let stray = PathBuf::from("/tmp/000000000-000000999.bloom");
        assert!(bloom_to_index_path(&stray).is_err());
    }

    #[test]
    fn staging_paths_live_outside_chunk_dirs() {
        let layout = CacheLayout::new("/cache/mainnet");
        let path = layout.staging_path(&BlockRange::new(0, 999), CacheType::Bloom, 3);
        assert!(path.starts_with(layout.staging_dir()));
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some(PART_EXTENSION));
        assert!(CacheType::of_path(&path).is_none());
    }
}
