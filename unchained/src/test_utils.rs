use crate::chunk::{encode_index_chunk, AppearanceRecord, BlockRange, BloomFilter, CacheLayout};
use crate::error::{IndexError, Result};
use crate::hash::content_hash;
use crate::manifest::{ChunkRecord, Manifest};
use crate::sync::RemoteIndex;
use alloy_primitives::Address;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time moves forward")
        .as_nanos();
    let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "unchained-index-{prefix}-test-{now}-{}-{suffix}",
        std::process::id()
    ));
    path
}

/// Appearances per address, as `(block, tx)` pairs.
pub type ChunkEntries = [(Address, Vec<(u32, u32)>)];

/// Encoded bloom and index blobs for one chunk.
pub fn chunk_blobs(entries: &ChunkEntries) -> (Vec<u8>, Vec<u8>) {
    let mut bloom = BloomFilter::new();
    let mut table: BTreeMap<Address, Vec<AppearanceRecord>> = BTreeMap::new();
    for (address, appearances) in entries {
        bloom.insert(address);
        table.entry(*address).or_default().extend(
            appearances
                .iter()
                .map(|(block, tx)| AppearanceRecord::new(*block, *tx)),
        );
    }
    (bloom.encode(), encode_index_chunk(&table))
}

/// Writes a committed chunk into the cache, optionally without its index.
pub fn write_chunk(
    layout: &CacheLayout,
    range: BlockRange,
    entries: &ChunkEntries,
    with_index: bool,
) -> ChunkRecord {
    layout.ensure_dirs().expect("cache dirs");
    let (bloom, index) = chunk_blobs(entries);
    fs::write(layout.bloom_path(&range), &bloom).expect("write bloom");
    let index_hash = if with_index {
        fs::write(layout.index_path(&range), &index).expect("write index");
        Some(content_hash(&index))
    } else {
        None
    };
    ChunkRecord::new(range, content_hash(&bloom), index_hash)
}

/// Publishes a chunk's blobs on the mock remote and returns its manifest entry.
pub fn publish_chunk(
    remote: &mut MockRemote,
    range: BlockRange,
    entries: &ChunkEntries,
) -> ChunkRecord {
    let (bloom, index) = chunk_blobs(entries);
    let bloom_hash = remote.add_blob(bloom.clone());
    let index_hash = remote.add_blob(index.clone());
    let mut record = ChunkRecord::new(range, bloom_hash, Some(index_hash));
    record.bloom_size = bloom.len() as u64;
    record.index_size = index.len() as u64;
    record
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Always,
    Times(u32),
    /// Serves bytes that do not match the hash.
    Corrupt,
    Fatal,
}

/// Scripted in-memory remote.
#[derive(Debug, Default)]
pub struct MockRemote {
    manifest: Option<Manifest>,
    blobs: HashMap<String, Vec<u8>>,
    failures: Mutex<HashMap<String, Failure>>,
    fetches: Mutex<HashMap<String, u32>>,
    delay: Option<Duration>,
    unreachable: bool,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Every blob fetch waits this long first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every blob fetch fails as if the host did not answer.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn add_blob(&mut self, bytes: Vec<u8>) -> String {
        let hash = content_hash(&bytes);
        self.blobs.insert(hash.clone(), bytes);
        hash
    }

    pub fn fail_always(&self, hash: &str) {
        self.failures.lock().insert(hash.to_string(), Failure::Always);
    }

    pub fn fail_times(&self, hash: &str, times: u32) {
        self.failures.lock().insert(hash.to_string(), Failure::Times(times));
    }

    pub fn corrupt(&self, hash: &str) {
        self.failures.lock().insert(hash.to_string(), Failure::Corrupt);
    }

    pub fn fail_fatally(&self, hash: &str) {
        self.failures.lock().insert(hash.to_string(), Failure::Fatal);
    }

    pub fn fetch_count(&self, hash: &str) -> u32 {
        self.fetches.lock().get(hash).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> u32 {
        self.fetches.lock().values().sum()
    }
}

#[async_trait]
impl RemoteIndex for MockRemote {
    async fn fetch_manifest(&self) -> Result<Manifest> {
        self.manifest.clone().ok_or_else(|| {
            IndexError::ManifestUnavailable("mock remote has no manifest".to_string())
        })
    }

    async fn fetch_blob(&self, hash: &str) -> Result<Vec<u8>> {
        *self.fetches.lock().entry(hash.to_string()).or_default() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable {
            return Err(IndexError::RemoteUnreachable {
                url: format!("mock://{hash}"),
                reason: "connection refused".to_string(),
            });
        }

        let failure = {
            let mut failures = self.failures.lock();
            match failures.get_mut(hash) {
                Some(Failure::Times(0)) | None => None,
                Some(Failure::Times(left)) => {
                    *left -= 1;
                    Some(Failure::Times(*left))
                }
                Some(other) => Some(*other),
            }
        };
        let download_failed = || IndexError::DownloadFailed {
            hash: hash.to_string(),
            reason: "scripted failure".to_string(),
        };
        match failure {
            Some(Failure::Always | Failure::Times(_)) => Err(download_failed()),
            Some(Failure::Fatal) => {
                Err(IndexError::InvariantViolation(format!("poisoned blob {hash}")))
            }
            Some(Failure::Corrupt) => {
                let mut bytes = self.blobs.get(hash).cloned().ok_or_else(download_failed)?;
                bytes.push(0);
                Ok(bytes)
            }
            None => self.blobs.get(hash).cloned().ok_or_else(download_failed),
        }
    }
}

