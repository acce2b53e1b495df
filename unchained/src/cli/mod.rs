//! CLI and config handling.

use crate::chunk::CacheLayout;
use crate::sync::{default_pool_size, SyncConfig, DEFAULT_RETRY_PASSES};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_CHAIN: &str = "mainnet";
pub const DEFAULT_GATEWAY_URL: &str = "https://ipfs.unchainedindex.io/ipfs";
pub const DEFAULT_MANIFEST_URL: &str = "https://ipfs.unchainedindex.io/ipfs/manifest.json";
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;
/// Records scanned per chunk when `--test-mode` is set.
pub const DEFAULT_TEST_CAP: usize = 100;

/// Which chunk blobs to sync.
#[derive(ValueEnum, Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncScope {
    /// Bloom filters only.
    Blooms,
    /// Blooms and index chunks.
    All,
}

#[derive(Subcommand, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    /// Fetch the remote manifest and download every missing chunk.
    Init {
        #[arg(long, value_enum, default_value_t = SyncScope::All)]
        scope: SyncScope,
    },
    /// Summarize the bloom filters of the chunks covering the given blocks.
    Blooms {
        /// Block numbers; all cached chunks when empty.
        blocks: Vec<u64>,
    },
    /// Test addresses against the cached blooms and print their appearances.
    Addresses {
        /// Addresses to look up (0x-prefixed hex).
        #[arg(required = true)]
        addresses: Vec<String>,
    },
    /// Dump every appearance stored in the chunks covering the given blocks.
    Appearances {
        /// Block numbers; all cached chunks when empty.
        blocks: Vec<u64>,
    },
    /// Print per-chunk statistics of the local cache.
    List,
    /// Reset single timestamp records from an RPC endpoint.
    RepairTimestamps {
        #[arg(long)]
        rpc_url: String,
        #[arg(required = true)]
        blocks: Vec<u64>,
    },
}

/// Unchained index cache configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "unchained", about = "Local cache of the Unchained Index")]
pub struct IndexConfig {
    /// Base data directory; the cache lives in `{data_dir}/{chain}/unchained`.
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,
    /// Chain name.
    #[arg(long, default_value = DEFAULT_CHAIN)]
    pub chain: String,
    /// Content gateway serving blobs by hash.
    #[arg(long, default_value = DEFAULT_GATEWAY_URL)]
    pub gateway_url: String,
    /// Location of the published manifest.
    #[arg(long, default_value = DEFAULT_MANIFEST_URL)]
    pub manifest_url: String,
    /// Concurrent downloads per pipeline (defaults to min(10, 1.5 x cores)).
    #[arg(long)]
    pub pool_size: Option<usize>,
    /// Extra passes over failed chunks.
    #[arg(long, default_value_t = DEFAULT_RETRY_PASSES)]
    pub retry_passes: u32,
    /// Per-request timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_FETCH_TIMEOUT_SECS)]
    pub fetch_timeout_secs: u64,
    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
    /// Cap records scanned per chunk.
    #[arg(long, default_value_t = false)]
    pub test_mode: bool,
    /// Disable the progress bar.
    #[arg(long, default_value_t = false)]
    pub no_progress: bool,
    #[command(subcommand)]
    pub command: Command,
}

impl IndexConfig {
    /// Parse configuration from CLI args.
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join(&self.chain).join("unchained")
    }

    pub fn layout(&self) -> CacheLayout {
        CacheLayout::new(self.cache_dir())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            pool_size: self.pool_size.unwrap_or_else(default_pool_size).max(1),
            retry_passes: self.retry_passes,
            ..SyncConfig::default()
        }
    }

    pub fn test_cap(&self) -> Option<usize> {
        self.test_mode.then_some(DEFAULT_TEST_CAP)
    }
}
