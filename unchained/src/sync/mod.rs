//! Manifest-driven sync of the local chunk cache.

mod cleanup;
mod fetch;
mod pipeline;
mod progress;
mod retry;

pub use cleanup::{clean_staging, commit_blob};
pub use fetch::{GatewayClient, RemoteIndex};
pub use pipeline::PipelineReport;
pub use progress::{
    spawn_event_consumer, EventKind, PipelineProgress, ProgressAggregator, ProgressEvent,
};
pub use retry::{RetryState, DEFAULT_RETRY_PASSES};

use crate::chunk::{CacheLayout, CacheType};
use crate::error::{IndexError, Result};
use crate::manifest::Manifest;
use pipeline::ChunkPipeline;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

const DEFAULT_EVENT_BUFFER: usize = 256;
const MAX_POOL_SIZE: usize = 10;

/// Download concurrency: `min(10, 3 * cores / 2)`, at least one.
pub fn default_pool_size() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|cores| cores.get())
        .unwrap_or(1);
    (cores * 3 / 2).clamp(1, MAX_POOL_SIZE)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Concurrent downloads per pipeline.
    pub pool_size: usize,
    /// Extra passes over the failure set after the first pass.
    pub retry_passes: u32,
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            retry_passes: DEFAULT_RETRY_PASSES,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// How a sync ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    FullySynced,
    PartiallySynced { failed: usize },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub pipelines: Vec<PipelineReport>,
}

impl SyncReport {
    pub fn outcome(&self) -> SyncOutcome {
        if self.pipelines.iter().any(|report| report.cancelled) {
            return SyncOutcome::Cancelled;
        }
        match self.failed() {
            0 => SyncOutcome::FullySynced,
            failed => SyncOutcome::PartiallySynced { failed },
        }
    }

    pub fn pipeline(&self, kind: CacheType) -> Option<&PipelineReport> {
        self.pipelines.iter().find(|report| report.kind == kind)
    }

    pub fn committed(&self) -> usize {
        self.pipelines.iter().map(|report| report.committed).sum()
    }

    pub fn corrections(&self) -> usize {
        self.pipelines.iter().map(|report| report.corrections).sum()
    }

    pub fn failed(&self) -> usize {
        self.pipelines.iter().map(|report| report.failed.len()).sum()
    }
}

/// Brings the local cache in line with a manifest.
pub struct SyncPipeline {
    layout: CacheLayout,
    remote: Arc<dyn RemoteIndex>,
    config: SyncConfig,
    aggregator: Arc<ProgressAggregator>,
}

impl SyncPipeline {
    pub fn new(layout: CacheLayout, remote: Arc<dyn RemoteIndex>, config: SyncConfig) -> Self {
        Self {
            layout,
            remote,
            config,
            aggregator: Arc::new(ProgressAggregator::new()),
        }
    }

    pub fn with_aggregator(mut self, aggregator: Arc<ProgressAggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn aggregator(&self) -> &Arc<ProgressAggregator> {
        &self.aggregator
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Fetches the remote manifest, persists it and syncs the given kinds.
    pub async fn init(&self, kinds: &[CacheType], cancel: CancellationToken) -> Result<SyncReport> {
        let manifest = self.remote.fetch_manifest().await?;
        manifest.validate()?;
        self.layout.ensure_dirs()?;
        manifest.save(&self.layout.manifest_path())?;
        info!(chain = %manifest.chain, chunks = manifest.chunks.len(), "manifest saved");
        self.sync(&manifest, kinds, cancel).await
    }

    /// Downloads every missing or stale chunk of the requested kinds. The
    /// bloom and index pipelines run concurrently, each under a child token
    /// of `cancel`. An unreachable remote stops both and fails the sync.
    pub async fn sync(
        &self,
        manifest: &Manifest,
        kinds: &[CacheType],
        cancel: CancellationToken,
    ) -> Result<SyncReport> {
        manifest.validate()?;
        self.layout.ensure_dirs()?;

        let mut unique: Vec<CacheType> = Vec::with_capacity(kinds.len());
        for kind in kinds {
            if !unique.contains(kind) {
                unique.push(*kind);
            }
        }
        let kinds = unique;
        let plans = kinds
            .iter()
            .map(|kind| manifest.plan_downloads(&self.layout, *kind))
            .collect::<Result<Vec<_>>>()?;
        clean_staging(&self.layout)?;

        let (events_tx, events_rx) = mpsc::channel(self.config.event_buffer.max(1));
        let consumer = spawn_event_consumer(events_rx, Arc::clone(&self.aggregator));
        let seq = Arc::new(AtomicU64::new(0));
        let abort = cancel.child_token();

        let mut pipelines: JoinSet<Result<PipelineReport>> = JoinSet::new();
        for plan in plans {
            self.aggregator.plan(plan.kind, plan.chunks.len());
            let pipeline = ChunkPipeline {
                kind: plan.kind,
                layout: self.layout.clone(),
                remote: Arc::clone(&self.remote),
                pool_size: self.config.pool_size,
                retry_passes: self.config.retry_passes,
                events: events_tx.clone(),
                seq: Arc::clone(&seq),
                abort: abort.clone(),
            };
            pipelines.spawn(pipeline.run(plan, abort.child_token()));
        }
        drop(events_tx);

        let mut reports = Vec::new();
        let mut first_error = None;
        while let Some(joined) = pipelines.join_next().await {
            let result = joined.map_err(|err| {
                IndexError::InvariantViolation(format!("pipeline task failed: {err}"))
            });
            match result.and_then(|report| report) {
                Ok(report) => reports.push(report),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        consumer.await.map_err(|err| {
            IndexError::InvariantViolation(format!("progress consumer failed: {err}"))
        })?;
        if let Some(err) = first_error {
            return Err(err);
        }

        reports.sort_by_key(|report| kinds.iter().position(|kind| *kind == report.kind));
        let report = SyncReport { pipelines: reports };
        info!(
            committed = report.committed(),
            corrections = report.corrections(),
            failed = report.failed(),
            outcome = ?report.outcome(),
            "sync finished"
        );
        Ok(report)
    }
}
