//! Download pipeline for one chunk kind.

use super::cleanup::commit_blob;
use super::fetch::RemoteIndex;
use super::progress::{EventKind, ProgressEvent};
use super::retry::RetryState;
use crate::chunk::{BlockRange, CacheLayout, CacheType};
use crate::error::{IndexError, Result};
use crate::hash::content_hash;
use crate::manifest::{ChunkRecord, DownloadPlan};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of running one pipeline to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub kind: CacheType,
    pub planned: usize,
    /// Planned chunks that replaced a stale local file.
    pub corrections: usize,
    pub committed: usize,
    /// Chunks not committed when the pipeline stopped: still failing after
    /// the last retry pass, or left over by cancellation.
    pub failed: Vec<ChunkRecord>,
    /// Fetches cut short or never started because the run was cancelled.
    pub skipped: usize,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct PassOutcome {
    committed: Vec<BlockRange>,
    failed: usize,
    skipped: usize,
    fatal: Option<IndexError>,
}

pub(crate) struct ChunkPipeline {
    pub(crate) kind: CacheType,
    pub(crate) layout: CacheLayout,
    pub(crate) remote: Arc<dyn RemoteIndex>,
    pub(crate) pool_size: usize,
    pub(crate) retry_passes: u32,
    pub(crate) events: mpsc::Sender<ProgressEvent>,
    pub(crate) seq: Arc<AtomicU64>,
    /// Sync-wide token, cancelled when the remote turns out to be unreachable.
    pub(crate) abort: CancellationToken,
}

impl ChunkPipeline {
    /// Runs the first pass over `plan` and then the retry passes. A
    /// non-retryable failure cancels `cancel` and is returned once every
    /// in-flight task has settled.
    pub(crate) async fn run(
        self,
        plan: DownloadPlan,
        cancel: CancellationToken,
    ) -> Result<PipelineReport> {
        let mut report = PipelineReport {
            kind: self.kind,
            planned: plan.chunks.len(),
            corrections: plan.corrections,
            committed: 0,
            failed: Vec::new(),
            skipped: 0,
            cancelled: false,
        };
        debug!(
            kind = %self.kind,
            planned = report.planned,
            corrections = report.corrections,
            "pipeline starting"
        );

        let mut retry = RetryState::new(self.retry_passes, plan.chunks.clone());
        let mut outcome = self.run_pass(plan.chunks, &cancel).await;
        loop {
            report.committed += outcome.committed.len();
            report.skipped += outcome.skipped;
            debug!(
                kind = %self.kind,
                committed = outcome.committed.len(),
                failed = outcome.failed,
                skipped = outcome.skipped,
                "pass finished"
            );
            retry.record_pass(&outcome.committed);
            if outcome.fatal.is_some() || cancel.is_cancelled() {
                break;
            }
            let Some(batch) = retry.next_pass() else {
                break;
            };
            self.emit(
                EventKind::Update,
                None,
                format!(
                    "retrying {} {} chunks, {} passes left",
                    batch.len(),
                    self.kind,
                    retry.remaining()
                ),
            )
            .await;
            outcome = self.run_pass(batch, &cancel).await;
        }

        report.cancelled = cancel.is_cancelled();
        report.failed = retry.into_failed();
        report.failed.sort_by_key(|chunk| chunk.range);
        self.emit(
            EventKind::AllDone,
            None,
            format!(
                "{} pipeline done: {} committed, {} failed",
                self.kind,
                report.committed,
                report.failed.len()
            ),
        )
        .await;

        match outcome.fatal {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    async fn run_pass(
        &self,
        chunks: Vec<ChunkRecord>,
        cancel: &CancellationToken,
    ) -> PassOutcome {
        let mut outcome = PassOutcome::default();
        let semaphore = Arc::new(Semaphore::new(self.pool_size.max(1)));
        let mut tasks: JoinSet<(ChunkRecord, Result<PathBuf>)> = JoinSet::new();

        let mut queue = chunks.into_iter();
        for chunk in queue.by_ref() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome.skipped += 1;
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                outcome.skipped += 1;
                break;
            };
            while let Some(joined) = tasks.try_join_next() {
                self.settle(joined, &mut outcome, cancel).await;
            }

            let remote = Arc::clone(&self.remote);
            let layout = self.layout.clone();
            let events = self.events.clone();
            let kind = self.kind;
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let _ = events
                    .send(ProgressEvent::new(kind, EventKind::Start, Some(chunk.range), ""))
                    .await;
                let result =
                    fetch_and_commit(remote.as_ref(), &layout, &chunk, kind, seq, &cancel).await;
                (chunk, result)
            });
        }
        outcome.skipped += queue.len();

        while let Some(joined) = tasks.join_next().await {
            self.settle(joined, &mut outcome, cancel).await;
        }
        outcome
    }

    async fn settle(
        &self,
        joined: std::result::Result<(ChunkRecord, Result<PathBuf>), JoinError>,
        outcome: &mut PassOutcome,
        cancel: &CancellationToken,
    ) {
        match joined {
            Ok((chunk, Ok(path))) => {
                outcome.committed.push(chunk.range);
                self.emit(EventKind::Finished, Some(chunk.range), path.display().to_string())
                    .await;
            }
            Ok((chunk, Err(IndexError::Cancelled))) => {
                outcome.skipped += 1;
                self.emit(EventKind::Cancelled, Some(chunk.range), "cancelled").await;
            }
            Ok((chunk, Err(err))) => {
                self.emit(EventKind::Error, Some(chunk.range), err.to_string()).await;
                if err.is_retryable() {
                    outcome.failed += 1;
                } else {
                    if matches!(err, IndexError::RemoteUnreachable { .. }) {
                        warn!(kind = %self.kind, error = %err, "remote unreachable, aborting sync");
                        self.abort.cancel();
                    } else {
                        warn!(
                            kind = %self.kind,
                            range = %chunk.range,
                            error = %err,
                            "fatal chunk error, cancelling pipeline"
                        );
                    }
                    cancel.cancel();
                    if outcome.fatal.is_none() {
                        outcome.fatal = Some(err);
                    }
                }
            }
            Err(err) => {
                cancel.cancel();
                if outcome.fatal.is_none() {
                    outcome.fatal = Some(IndexError::InvariantViolation(format!(
                        "download task failed: {err}"
                    )));
                }
            }
        }
    }

    async fn emit(&self, kind: EventKind, range: Option<BlockRange>, message: impl Into<String>) {
        let _ = self
            .events
            .send(ProgressEvent::new(self.kind, kind, range, message))
            .await;
    }
}

/// Fetches one blob by content hash, verifies it and commits it into the
/// cache. Cancellation is honored until the blob is verified; after that
/// the commit always runs to completion.
async fn fetch_and_commit(
    remote: &dyn RemoteIndex,
    layout: &CacheLayout,
    chunk: &ChunkRecord,
    kind: CacheType,
    seq: u64,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let expected = chunk.hash(kind).ok_or_else(|| {
        IndexError::InvariantViolation(format!("chunk {} has no {kind} hash", chunk.range))
    })?;
    if cancel.is_cancelled() {
        return Err(IndexError::Cancelled);
    }
    let bytes = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(IndexError::Cancelled),
        fetched = remote.fetch_blob(expected) => fetched?,
    };

    let actual = content_hash(&bytes);
    if actual != expected {
        return Err(IndexError::ChunkHashMismatch {
            range: chunk.range,
            expected: expected.to_string(),
            actual,
        });
    }

    let staging = layout.staging_path(&chunk.range, kind, seq);
    let target = layout.chunk_path(&chunk.range, kind);
    let path = commit_blob(&staging, &target, &bytes).await?;
    debug!(
        kind = %kind,
        range = %chunk.range,
        bytes = bytes.len(),
        "blob verified and renamed into place"
    );
    Ok(path)
}
