//! Progress events emitted by download workers and the aggregator that folds
//! them into per-pipeline counters.

use crate::chunk::{BlockRange, CacheType};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Update,
    Finished,
    Error,
    Cancelled,
    /// Last event of a pipeline, sent once its pool has drained.
    AllDone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub cache: CacheType,
    pub kind: EventKind,
    pub range: Option<BlockRange>,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(
        cache: CacheType,
        kind: EventKind,
        range: Option<BlockRange>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            kind,
            range,
            message: message.into(),
        }
    }
}

/// Counters for one pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineProgress {
    pub planned: u64,
    pub started: u64,
    pub finished: u64,
    pub errors: u64,
    pub cancelled: u64,
    pub all_done: u64,
}

impl PipelineProgress {
    pub fn is_done(&self) -> bool {
        self.all_done > 0
    }

    /// Running count, e.g. `bloom 4/10 started, 3 finished, 1 failed`.
    pub fn running_count(&self, cache: CacheType) -> String {
        format!(
            "{cache} {}/{} started, {} finished, {} failed",
            self.started, self.planned, self.finished, self.errors
        )
    }
}

#[derive(Debug, Default)]
struct AggregatorState {
    pipelines: HashMap<CacheType, PipelineProgress>,
    last_message: Option<String>,
}

impl AggregatorState {
    /// Running counts of every pipeline seen so far, bloom first.
    fn display_line(&self) -> String {
        [CacheType::Bloom, CacheType::Index]
            .into_iter()
            .filter_map(|cache| {
                let counters = self.pipelines.get(&cache)?;
                Some(counters.running_count(cache))
            })
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Holds sync progress for display. One lock guards every counter and the
/// display that reads them; the only writer is the event consumer task.
#[derive(Default)]
pub struct ProgressAggregator {
    state: Mutex<AggregatorState>,
    bar: Option<ProgressBar>,
}

impl fmt::Debug for ProgressAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressAggregator")
            .field("state", &*self.state.lock())
            .field("bar", &self.bar.is_some())
            .finish()
    }
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregator that also drives a terminal progress bar.
    pub fn with_bar() -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr_with_hz(10));
        if let Ok(style) = ProgressStyle::with_template(
            "{bar:40.cyan/blue} {percent:>3}% {pos}/{len} | {elapsed_precise} | {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉░"));
        }
        Self {
            state: Mutex::new(AggregatorState::default()),
            bar: Some(bar),
        }
    }

    /// Announces the size of a pipeline's work before its first event.
    pub fn plan(&self, cache: CacheType, chunks: usize) {
        let mut state = self.state.lock();
        state.pipelines.entry(cache).or_default().planned += chunks as u64;
        if let Some(bar) = &self.bar {
            bar.inc_length(chunks as u64);
        }
    }

    pub fn apply(&self, event: &ProgressEvent) {
        let mut state = self.state.lock();
        let counters = state.pipelines.entry(event.cache).or_default();
        match event.kind {
            EventKind::Start => counters.started += 1,
            EventKind::Update => {}
            EventKind::Finished => counters.finished += 1,
            EventKind::Error => counters.errors += 1,
            EventKind::Cancelled => counters.cancelled += 1,
            EventKind::AllDone => counters.all_done += 1,
        }
        let running = counters.running_count(event.cache);
        if !event.message.is_empty() {
            state.last_message = Some(event.message.clone());
        }

        let cache = event.cache;
        let range = event.range;
        match event.kind {
            EventKind::Start | EventKind::Finished => match &self.bar {
                Some(bar) => {
                    if event.kind == EventKind::Finished {
                        bar.inc(1);
                    }
                    bar.set_message(state.display_line());
                }
                None => info!(cache = %cache, range = ?range, "{running}"),
            },
            EventKind::Error => {
                warn!(cache = %cache, range = ?range, error = %event.message, "{running}");
                if let Some(bar) = &self.bar {
                    bar.set_message(state.display_line());
                }
            }
            EventKind::Update => match &self.bar {
                Some(bar) => bar.set_message(event.message.clone()),
                None => info!(cache = %cache, "{}", event.message),
            },
            EventKind::Cancelled => debug!(cache = %cache, range = ?range, "chunk cancelled"),
            EventKind::AllDone => info!(cache = %cache, "{}", event.message),
        }
    }

    /// Running counts of every pipeline, as shown on the progress bar.
    pub fn display_line(&self) -> String {
        self.state.lock().display_line()
    }

    pub fn snapshot(&self, cache: CacheType) -> PipelineProgress {
        self.state.lock().pipelines.get(&cache).copied().unwrap_or_default()
    }

    pub fn last_message(&self) -> Option<String> {
        self.state.lock().last_message.clone()
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

/// Drains the event channel into the aggregator until every sender is gone.
pub fn spawn_event_consumer(
    mut events: mpsc::Receiver<ProgressEvent>,
    aggregator: Arc<ProgressAggregator>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            aggregator.apply(&event);
        }
    })
}
