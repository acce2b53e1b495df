//! Manifest model and the local-cache diff that drives sync.

use crate::chunk::{BlockRange, CacheLayout, CacheType};
use crate::error::{IndexError, Result};
use crate::hash::content_hash_file;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::path::Path;
use tracing::debug;

/// One manifest entry: the content hashes of a chunk's two blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    #[serde(serialize_with = "serialize_range", deserialize_with = "deserialize_range")]
    pub range: BlockRange,
    pub bloom_hash: String,
    /// Absent for bloom-only ranges.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_hash"
    )]
    pub index_hash: Option<String>,
    #[serde(default)]
    pub bloom_size: u64,
    #[serde(default)]
    pub index_size: u64,
}

impl ChunkRecord {
    pub fn new(
        range: BlockRange,
        bloom_hash: impl Into<String>,
        index_hash: Option<String>,
    ) -> Self {
        Self {
            range,
            bloom_hash: bloom_hash.into(),
            index_hash,
            bloom_size: 0,
            index_size: 0,
        }
    }

    /// Content hash of the blob of the given kind, if the manifest lists one.
    pub fn hash(&self, kind: CacheType) -> Option<&str> {
        match kind {
            CacheType::Bloom => Some(self.bloom_hash.as_str()).filter(|hash| !hash.is_empty()),
            CacheType::Index => self.index_hash.as_deref(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RangeRepr {
    Text(String),
    Pair([u64; 2]),
    Object { first: u64, last: u64 },
}

fn serialize_range<S: Serializer>(range: &BlockRange, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&range.to_string())
}

fn deserialize_range<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BlockRange, D::Error> {
    let range = match RangeRepr::deserialize(deserializer)? {
        RangeRepr::Text(text) => return text.parse().map_err(serde::de::Error::custom),
        RangeRepr::Pair([first, last]) => BlockRange::new(first, last),
        RangeRepr::Object { first, last } => BlockRange::new(first, last),
    };
    if range.first > range.last {
        return Err(serde::de::Error::custom(format!("range {range} ends before it starts")));
    }
    Ok(range)
}

fn deserialize_optional_hash<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|hash| !hash.is_empty()))
}

/// Ordered directory of chunk ranges and their content hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    pub chain: String,
    #[serde(default)]
    pub specification: String,
    pub chunks: Vec<ChunkRecord>,
}

impl Manifest {
    pub fn new(chain: impl Into<String>, chunks: Vec<ChunkRecord>) -> Self {
        Self {
            version: "trueblocks-core@v2.0.0-release".to_string(),
            chain: chain.into(),
            specification: String::new(),
            chunks,
        }
    }

    /// Ranges must be ascending and pairwise disjoint.
    pub fn validate(&self) -> Result<()> {
        for pair in self.chunks.windows(2) {
            let (prev, next) = (&pair[0].range, &pair[1].range);
            if next.first <= prev.last {
                return Err(IndexError::ManifestInvalid(format!(
                    "chunk {next} is out of order or overlaps {prev}"
                )));
            }
        }
        if let Some(chunk) = self.chunks.iter().find(|chunk| chunk.bloom_hash.is_empty()) {
            return Err(IndexError::ManifestInvalid(format!(
                "chunk {} has no bloom hash",
                chunk.range
            )));
        }
        Ok(())
    }

    /// Parses and validates a manifest document.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)
            .map_err(|err| IndexError::ManifestInvalid(err.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|err| {
            IndexError::ManifestUnavailable(format!("{}: {err}", path.display()))
        })?;
        Self::from_json(&bytes)
    }

    /// Persists the manifest with a write-then-rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|err| IndexError::ManifestInvalid(err.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| IndexError::io(parent, err))?;
        }
        let tmp = path.with_extension("json.part");
        fs::write(&tmp, json).map_err(|err| IndexError::io(&tmp, err))?;
        fs::rename(&tmp, path).map_err(|err| IndexError::io(path, err))?;
        Ok(())
    }

    pub fn ranges(&self) -> impl Iterator<Item = BlockRange> + '_ {
        self.chunks.iter().map(|chunk| chunk.range)
    }

    /// Entries of `kind` whose local file is missing or hashes differently.
    /// Runs entirely against the local cache; no network access.
    pub fn plan_downloads(&self, layout: &CacheLayout, kind: CacheType) -> Result<DownloadPlan> {
        let mut plan = DownloadPlan {
            kind,
            chunks: Vec::new(),
            corrections: 0,
        };
        for chunk in &self.chunks {
            let Some(expected) = chunk.hash(kind) else {
                continue;
            };
            let path = layout.chunk_path(&chunk.range, kind);
            if !path.exists() {
                plan.chunks.push(chunk.clone());
                continue;
            }
            let local = content_hash_file(&path)?;
            if local != expected {
                debug!(range = %chunk.range, kind = %kind, "local chunk is stale");
                plan.corrections += 1;
                plan.chunks.push(chunk.clone());
            }
        }
        Ok(plan)
    }
}

/// Chunks of one kind that still need fetching, in manifest order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPlan {
    pub kind: CacheType,
    pub chunks: Vec<ChunkRecord>,
    /// Entries present locally with a hash that no longer matches.
    pub corrections: usize,
}

impl DownloadPlan {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
