//! Ordered iteration over cached chunks.
//!
//! The walker only selects chunks and fixes their order; what happens inside
//! a chunk is up to the [`ChunkVisitor`].

use crate::chunk::{
    bloom_to_index_path, AppearanceRecord, BlockRange, BloomSummary, CacheLayout, ChunkBloom,
    IndexChunk,
};
use crate::error::{IndexError, Result};
use crate::manifest::Manifest;
use alloy_primitives::Address;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, trace, warn};

/// Blocks a walk should cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkTarget {
    All,
    Blocks(BTreeSet<u64>),
}

impl WalkTarget {
    pub fn blocks(blocks: impl IntoIterator<Item = u64>) -> Self {
        Self::Blocks(blocks.into_iter().collect())
    }

    fn selects(&self, range: &BlockRange) -> bool {
        match self {
            Self::All => true,
            Self::Blocks(blocks) => blocks.range(range.first..=range.last).next().is_some(),
        }
    }
}

/// What the walker should do after a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    Stop,
}

/// A chunk handed to a visitor.
#[derive(Debug, Clone, Copy)]
pub struct ChunkVisit<'a> {
    pub range: BlockRange,
    pub bloom_path: &'a Path,
    /// Set on the first chunk of the walk.
    pub first: bool,
}

/// Per-chunk callback. `Ok(Stop)` ends the walk quietly, `Err` aborts it.
pub trait ChunkVisitor {
    fn visit(&mut self, chunk: &ChunkVisit<'_>) -> Result<Visit>;
}

impl<F> ChunkVisitor for F
where
    F: FnMut(&ChunkVisit<'_>) -> Result<Visit>,
{
    fn visit(&mut self, chunk: &ChunkVisit<'_>) -> Result<Visit> {
        self(chunk)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub visited: usize,
    /// Selected chunks whose bloom is not cached yet.
    pub missing_blooms: usize,
    pub stopped_early: bool,
}

/// Walks chunks in ascending block order.
#[derive(Debug, Clone)]
pub struct IndexWalker {
    layout: CacheLayout,
    ranges: Vec<BlockRange>,
}

impl IndexWalker {
    pub fn from_manifest(layout: CacheLayout, manifest: &Manifest) -> Self {
        Self {
            layout,
            ranges: manifest.ranges().collect(),
        }
    }

    /// Uses whatever blooms are committed in the cache.
    pub fn from_cache(layout: CacheLayout) -> Result<Self> {
        let ranges = layout.list_bloom_ranges()?;
        Ok(Self { layout, ranges })
    }

    pub fn ranges(&self) -> &[BlockRange] {
        &self.ranges
    }

    pub fn walk<V: ChunkVisitor + ?Sized>(
        &self,
        target: &WalkTarget,
        visitor: &mut V,
    ) -> Result<WalkSummary> {
        let mut summary = WalkSummary::default();
        for range in self.ranges.iter().filter(|range| target.selects(range)) {
            let bloom_path = self.layout.bloom_path(range);
            if !bloom_path.exists() {
                trace!(range = %range, "bloom not cached, skipping chunk");
                summary.missing_blooms += 1;
                continue;
            }
            let visit = ChunkVisit {
                range: *range,
                bloom_path: &bloom_path,
                first: summary.visited == 0,
            };
            summary.visited += 1;
            match visitor.visit(&visit)? {
                Visit::Continue => {}
                Visit::Stop => {
                    debug!(range = %range, "walk stopped by visitor");
                    summary.stopped_early = true;
                    break;
                }
            }
        }
        Ok(summary)
    }
}

/// Opens the index chunk belonging to a bloom path. `Ok(None)` when the index
/// has not been distributed yet, which is a normal state.
fn open_index_for(bloom_path: &Path) -> Result<Option<IndexChunk>> {
    let index_path = bloom_to_index_path(bloom_path)?;
    if !index_path.exists() {
        return Ok(None);
    }
    IndexChunk::open(&index_path).map(Some)
}

/// Keeps decode failures local to the chunk they occurred in.
fn contain_decode_error(
    range: &BlockRange,
    err: IndexError,
    errors: &mut Vec<IndexError>,
) -> Result<Visit> {
    match err {
        IndexError::ChunkDecode { .. } => {
            warn!(range = %range, error = %err, "chunk scan stopped on decode error");
            errors.push(err);
            Ok(Visit::Continue)
        }
        other => Err(other),
    }
}

/// Reads the bloom of every visited chunk and reports its summary. Index
/// files are never opened.
pub struct BloomSummaryScan<S> {
    sink: S,
    errors: Vec<IndexError>,
}

impl<S> BloomSummaryScan<S>
where
    S: FnMut(&BloomSummary),
{
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[IndexError] {
        &self.errors
    }
}

impl<S> ChunkVisitor for BloomSummaryScan<S>
where
    S: FnMut(&BloomSummary),
{
    fn visit(&mut self, chunk: &ChunkVisit<'_>) -> Result<Visit> {
        match ChunkBloom::read(chunk.bloom_path) {
            Ok(bloom) => {
                (self.sink)(&bloom.summary());
                Ok(Visit::Continue)
            }
            Err(err) => contain_decode_error(&chunk.range, err, &mut self.errors),
        }
    }
}

/// Streams every appearance of every visited chunk, in table order.
pub struct AppearanceScan<S> {
    test_cap: Option<usize>,
    sink: S,
    errors: Vec<IndexError>,
}

impl<S> AppearanceScan<S>
where
    S: FnMut(BlockRange, AppearanceRecord),
{
    pub fn new(sink: S) -> Self {
        Self {
            test_cap: None,
            sink,
            errors: Vec::new(),
        }
    }

    /// Caps records scanned per chunk. Only meant for test mode.
    pub fn with_test_cap(mut self, cap: usize) -> Self {
        self.test_cap = Some(cap);
        self
    }

    /// Decode errors that ended individual chunk scans.
    pub fn errors(&self) -> &[IndexError] {
        &self.errors
    }

    fn scan(&mut self, range: &BlockRange, bloom_path: &Path) -> Result<Visit> {
        let Some(mut chunk) = open_index_for(bloom_path)? else {
            trace!(range = %range, "index not cached yet, bloom only");
            return Ok(Visit::Continue);
        };
        let cap = self.test_cap.unwrap_or(usize::MAX);
        for record in chunk.seek_to_appearances()?.take(cap) {
            (self.sink)(*range, record?);
        }
        Ok(Visit::Continue)
    }
}

impl<S> ChunkVisitor for AppearanceScan<S>
where
    S: FnMut(BlockRange, AppearanceRecord),
{
    fn visit(&mut self, chunk: &ChunkVisit<'_>) -> Result<Visit> {
        match self.scan(&chunk.range, chunk.bloom_path) {
            Ok(visit) => Ok(visit),
            Err(err) => contain_decode_error(&chunk.range, err, &mut self.errors),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressScanStats {
    pub blooms_checked: usize,
    pub bloom_hits: usize,
    /// Bloom said maybe, index said no.
    pub false_positives: usize,
}

/// Finds the appearances of a set of addresses: bloom test first, exact
/// index lookup only on a hit.
pub struct AddressScan<S> {
    addresses: Vec<Address>,
    sink: S,
    stats: AddressScanStats,
    errors: Vec<IndexError>,
}

impl<S> AddressScan<S>
where
    S: FnMut(Address, BlockRange, AppearanceRecord),
{
    pub fn new(addresses: Vec<Address>, sink: S) -> Self {
        Self {
            addresses,
            sink,
            stats: AddressScanStats::default(),
            errors: Vec::new(),
        }
    }

    pub fn stats(&self) -> AddressScanStats {
        self.stats
    }

    pub fn errors(&self) -> &[IndexError] {
        &self.errors
    }

    fn scan(&mut self, range: &BlockRange, bloom_path: &Path) -> Result<Visit> {
        let bloom = ChunkBloom::read(bloom_path)?;
        self.stats.blooms_checked += 1;
        let hits: Vec<Address> = self
            .addresses
            .iter()
            .filter(|address| bloom.may_contain(address))
            .copied()
            .collect();
        drop(bloom);
        if hits.is_empty() {
            return Ok(Visit::Continue);
        }
        self.stats.bloom_hits += hits.len();

        let Some(mut chunk) = open_index_for(bloom_path)? else {
            return Ok(Visit::Continue);
        };
        for address in hits {
            let records = chunk.lookup(&address)?;
            if records.is_empty() {
                self.stats.false_positives += 1;
            }
            for record in records {
                (self.sink)(address, *range, record);
            }
        }
        Ok(Visit::Continue)
    }
}

impl<S> ChunkVisitor for AddressScan<S>
where
    S: FnMut(Address, BlockRange, AppearanceRecord),
{
    fn visit(&mut self, chunk: &ChunkVisit<'_>) -> Result<Visit> {
        match self.scan(&chunk.range, chunk.bloom_path) {
            Ok(visit) => Ok(visit),
            Err(err) => contain_decode_error(&chunk.range, err, &mut self.errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::CacheType;
    use crate::manifest::ChunkRecord;
    use crate::test_utils::{temp_dir, write_chunk};
    use std::fs;
    use std::path::PathBuf;

    fn three_chunk_cache(name: &str) -> (PathBuf, CacheLayout, Manifest) {
        let dir = temp_dir(name);
        let layout = CacheLayout::new(&dir);
        let alice = Address::repeat_byte(0xa1);
        let bob = Address::repeat_byte(0xb0);
        let ranges = [
            BlockRange::new(0, 999),
            BlockRange::new(1000, 1999),
            BlockRange::new(2000, 2999),
        ];
        write_chunk(&layout, ranges[0], &[(alice, vec![(10, 0), (20, 1)])], true);
        write_chunk(
            &layout,
            ranges[1],
            &[(alice, vec![(1500, 3)]), (bob, vec![(1200, 0), (1500, 1)])],
            true,
        );
        write_chunk(&layout, ranges[2], &[(bob, vec![(2500, 4)])], true);
        let chunks = ranges
            .iter()
            .map(|range| ChunkRecord::new(*range, "h", None))
            .collect();
        (dir, layout, Manifest::new("mainnet", chunks))
    }

    #[test]
    fn walk_selects_intersecting_chunks_in_order() {
        let (dir, layout, manifest) = three_chunk_cache("walker-select");
        let walker = IndexWalker::from_manifest(layout.clone(), &manifest);

        let mut seen = Vec::new();
        let mut record = |chunk: &ChunkVisit<'_>| -> Result<Visit> {
            seen.push((chunk.range, chunk.first, chunk.bloom_path.to_path_buf()));
            Ok(Visit::Continue)
        };
        let summary = walker
            .walk(&WalkTarget::blocks([2500, 1500]), &mut record)
            .expect("walk");
        assert_eq!(summary.visited, 2);
        assert_eq!(seen[0].0, BlockRange::new(1000, 1999));
        assert!(seen[0].1 && !seen[1].1);
        assert_eq!(seen[0].2, layout.bloom_path(&BlockRange::new(1000, 1999)));
        assert_eq!(seen[1].0, BlockRange::new(2000, 2999));

        let mut all = Vec::new();
        walker
            .walk(&WalkTarget::All, &mut |chunk: &ChunkVisit<'_>| -> Result<Visit> {
                all.push(chunk.range.first);
                Ok(Visit::Continue)
            })
            .expect("walk all");
        assert_eq!(all, vec![0, 1000, 2000]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn stop_and_error_are_distinct() {
        let (dir, layout, manifest) = three_chunk_cache("walker-stop");
        let walker = IndexWalker::from_manifest(layout, &manifest);

        let mut count = 0;
        let summary = walker
            .walk(&WalkTarget::All, &mut |_: &ChunkVisit<'_>| -> Result<Visit> {
                count += 1;
                Ok(Visit::Stop)
            })
            .expect("stop is not an error");
        assert_eq!(count, 1);
        assert!(summary.stopped_early);

        let err = walker
            .walk(&WalkTarget::All, &mut |chunk: &ChunkVisit<'_>| -> Result<Visit> {
                Err(IndexError::InvariantViolation(format!("boom at {}", chunk.range)))
            })
            .expect_err("error aborts");
        assert!(matches!(err, IndexError::InvariantViolation(_)));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn appearance_scan_streams_records() {
        let (dir, layout, manifest) = three_chunk_cache("walker-appearances");
        let walker = IndexWalker::from_manifest(layout, &manifest);

        let mut found = Vec::new();
        let mut scan = AppearanceScan::new(|range, record| found.push((range.first, record)));
        walker.walk(&WalkTarget::blocks([1500]), &mut scan).expect("walk");
        assert!(scan.errors().is_empty());
        drop(scan);
        let blocks: Vec<u32> = found.iter().map(|(_, record)| record.block_number).collect();
        assert_eq!(blocks.len(), 3);
        assert!(found.iter().all(|(first, _)| *first == 1000));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn appearance_scan_honors_test_cap() {
        let (dir, layout, manifest) = three_chunk_cache("walker-cap");
        let walker = IndexWalker::from_manifest(layout, &manifest);

        let mut count = 0usize;
        let mut scan = AppearanceScan::new(|_, _| count += 1).with_test_cap(1);
        walker.walk(&WalkTarget::All, &mut scan).expect("walk");
        drop(scan);
        assert_eq!(count, 3);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_index_is_not_an_error() {
        let dir = temp_dir("walker-bloom-only");
        let layout = CacheLayout::new(&dir);
        let range = BlockRange::new(0, 999);
        write_chunk(&layout, range, &[(Address::repeat_byte(1), vec![(5, 0)])], false);
        assert!(!layout.chunk_path(&range, CacheType::Index).exists());

        let walker = IndexWalker::from_cache(layout).expect("walker");
        let mut found = 0usize;
        let mut scan = AppearanceScan::new(|_, _| found += 1);
        let summary = walker.walk(&WalkTarget::All, &mut scan).expect("walk");
        assert!(scan.errors().is_empty());
        drop(scan);
        assert_eq!(summary.visited, 1);
        assert!(!summary.stopped_early);
        assert_eq!(found, 0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn decode_error_stops_only_that_chunk() {
        let (dir, layout, manifest) = three_chunk_cache("walker-decode");
        let broken = layout.index_path(&BlockRange::new(1000, 1999));
        let bytes = fs::read(&broken).expect("read");
        fs::write(&broken, &bytes[..bytes.len() - 4]).expect("truncate");

        let walker = IndexWalker::from_manifest(layout, &manifest);
        let mut blocks = Vec::new();
        let mut scan =
            AppearanceScan::new(|_, record: AppearanceRecord| blocks.push(record.block_number));
        walker.walk(&WalkTarget::All, &mut scan).expect("walk continues");
        assert_eq!(scan.errors().len(), 1);
        drop(scan);
        assert_eq!(blocks.first(), Some(&10));
        assert_eq!(blocks.last(), Some(&2500));
        assert_eq!(blocks.len(), 2 + 2 + 1);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn address_scan_uses_bloom_then_index() {
        let (dir, layout, manifest) = three_chunk_cache("walker-address");
        let walker = IndexWalker::from_manifest(layout, &manifest);

        let bob = Address::repeat_byte(0xb0);
        let mut found = Vec::new();
        let mut scan =
            AddressScan::new(vec![bob], |address, _, record| found.push((address, record)));
        walker.walk(&WalkTarget::All, &mut scan).expect("walk");
        let stats = scan.stats();
        drop(scan);
        assert_eq!(stats.blooms_checked, 3);
        assert_eq!(stats.bloom_hits, 2);
        assert_eq!(
            found.iter().map(|(_, record)| record.block_number).collect::<Vec<_>>(),
            vec![1200, 1500, 2500]
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn bloom_summaries_follow_block_selection() {
        let (dir, layout, manifest) = three_chunk_cache("walker-bloom-summary");
        fs::remove_file(layout.index_path(&BlockRange::new(2000, 2999))).expect("drop index");
        let walker = IndexWalker::from_manifest(layout.clone(), &manifest);

        let mut summaries = Vec::new();
        let mut scan = BloomSummaryScan::new(|summary: &BloomSummary| summaries.push(*summary));
        let walked = walker
            .walk(&WalkTarget::blocks([1500, 2999]), &mut scan)
            .expect("walk");
        assert!(scan.errors().is_empty());
        drop(scan);
        assert_eq!(walked.visited, 2);
        let ranges: Vec<BlockRange> = summaries.iter().map(|summary| summary.range).collect();
        assert_eq!(ranges, vec![BlockRange::new(1000, 1999), BlockRange::new(2000, 2999)]);
        assert_eq!(summaries[0].n_inserted, 2);
        assert_eq!(summaries[1].n_inserted, 1);
        assert!(summaries.iter().all(|summary| summary.count == 1));
        assert_eq!(
            summaries[0].size,
            fs::metadata(layout.bloom_path(&ranges[0])).expect("meta").len()
        );

        fs::write(layout.bloom_path(&ranges[0]), b"junk").expect("corrupt");
        let mut seen = 0usize;
        let mut scan = BloomSummaryScan::new(|_: &BloomSummary| seen += 1);
        walker.walk(&WalkTarget::All, &mut scan).expect("decode errors stay local");
        assert_eq!(scan.errors().len(), 1);
        drop(scan);
        assert_eq!(seen, 2);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn index_path_handed_to_scan_is_fatal() {
        let (dir, layout, _) = three_chunk_cache("walker-invariant");
        let range = BlockRange::new(0, 999);
        let index_path = layout.index_path(&range);
        let mut scan = AppearanceScan::new(|_, _| {});
        let err = scan
            .visit(&ChunkVisit {
                range,
                bloom_path: &index_path,
                first: true,
            })
            .expect_err("wrong path kind");
        assert!(matches!(err, IndexError::InvariantViolation(_)));

        let _ = fs::remove_dir_all(&dir);
    }
}
