//! Bounded-concurrency batch runner with per-item progress tracking.
//!
//! `min(max_concurrency, items.len())` workers pull indices from a shared
//! atomic cursor. Each claimed item runs through the caller's pipeline with a
//! [`ProgressReporter`] bound to its index. Workers never touch progress
//! state: every update travels over one channel to a single collector, which
//! is the only code that mutates the progress table.
//!
//! Pipeline errors and panics are caught at the worker loop boundary and
//! become that item's error outcome. The summary is computed from the
//! captured outcomes after every worker has drained.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{CoordinationError, CoordinationResult};

const UNKNOWN_ERROR: &str = "Unknown error";
const CANCELLED_ERROR: &str = "batch cancelled";

/// A unit of work that can be tracked by id and label.
pub trait BatchItem {
    fn item_id(&self) -> String;

    fn label(&self) -> String {
        self.item_id()
    }
}

impl BatchItem for String {
    fn item_id(&self) -> String {
        self.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress { stage: u32 },
    Completed,
    Error,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Progress of one batch item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemProgress {
    pub item_id: String,
    pub label: String,
    pub status: ItemStatus,
    /// 0..=100, never decreases.
    pub progress: u8,
    pub current_step: Option<String>,
    pub error: Option<String>,
}

impl ItemProgress {
    fn pending(item: &impl BatchItem) -> Self {
        Self {
            item_id: item.item_id(),
            label: item.label(),
            status: ItemStatus::Pending,
            progress: 0,
            current_step: None,
            error: None,
        }
    }

    fn advance(&mut self, stage: u32, progress: u8, step: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ItemStatus::InProgress { stage };
        self.progress = self.progress.max(progress.min(100));
        if step.is_some() {
            self.current_step = step;
        }
    }

    fn finish(&mut self, error: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        match error {
            None => {
                self.status = ItemStatus::Completed;
                self.progress = 100;
            }
            Some(message) => {
                self.status = ItemStatus::Error;
                self.error = Some(message);
            }
        }
    }
}

/// Aggregate counts for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub total_items: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failure messages in completion order.
    pub errors: Vec<String>,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct BatchReport<R> {
    /// One outcome per input item, in input order.
    pub outcomes: Vec<Result<R, String>>,
    pub summary: BatchResult,
    /// Final progress table, in input order.
    pub progress: Vec<ItemProgress>,
}

impl<R> BatchReport<R> {
    /// Successful outcomes with their input index.
    pub fn successes(&self) -> impl Iterator<Item = (usize, &R)> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.as_ref().ok().map(|r| (i, r)))
    }
}

enum BatchEvent {
    Progress {
        index: usize,
        stage: u32,
        progress: u8,
        step: Option<String>,
    },
    Finished {
        index: usize,
        error: Option<String>,
    },
    WorkerExited,
}

/// Handle passed to a pipeline for reporting its own item's progress.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    index: usize,
    tx: mpsc::UnboundedSender<BatchEvent>,
}

impl fmt::Debug for BatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Progress {
                index, progress, ..
            } => write!(f, "Progress({index}, {progress})"),
            Self::Finished { index, error } => write!(f, "Finished({index}, {error:?})"),
            Self::WorkerExited => write!(f, "WorkerExited"),
        }
    }
}

impl ProgressReporter {
    /// Index of the item this reporter is bound to.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Record that the item entered `stage` at `progress` percent.
    ///
    /// Non-blocking. Values above 100 are clamped and regressions are
    /// ignored; updates after the item finished are dropped.
    pub fn report(&self, stage: u32, progress: u8, step: impl Into<String>) {
        self.send(stage, progress, Some(step.into()));
    }

    fn send(&self, stage: u32, progress: u8, step: Option<String>) {
        // The collector outlives every worker; a closed channel only means a
        // reporter leaked past the end of its run.
        let _ = self.tx.send(BatchEvent::Progress {
            index: self.index,
            stage,
            progress,
            step,
        });
    }
}

/// Runs batches with a fixed worker count.
#[derive(Debug)]
pub struct BatchOrchestrator {
    max_concurrency: usize,
    cancel: Option<CancellationToken>,
    snapshots: watch::Sender<Vec<ItemProgress>>,
}

impl BatchOrchestrator {
    pub fn new(max_concurrency: usize) -> CoordinationResult<Self> {
        if max_concurrency == 0 {
            return Err(CoordinationError::Config(
                "batch max_concurrency must be > 0".to_string(),
            ));
        }
        let (snapshots, _) = watch::channel(Vec::new());
        Ok(Self {
            max_concurrency,
            cancel: None,
            snapshots,
        })
    }

    /// Stop claiming new items once `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Live view of the progress table; updated after every event.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ItemProgress>> {
        self.snapshots.subscribe()
    }

    /// Run `pipeline` over every item.
    ///
    /// Always completes with a report, even if every item failed.
    pub async fn run<T, R, E, P, Fut>(&self, items: Vec<T>, pipeline: P) -> BatchReport<R>
    where
        T: BatchItem + Clone,
        P: Fn(T, usize, ProgressReporter) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: fmt::Display,
    {
        let total = items.len();
        let worker_count = self.max_concurrency.min(total);
        let progress: Vec<ItemProgress> = items.iter().map(ItemProgress::pending).collect();
        self.snapshots.send_replace(progress.clone());

        info!(
            items = total,
            workers = worker_count,
            "Starting batch run"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let cursor = AtomicUsize::new(0);
        let items_ref = &items;
        let cursor_ref = &cursor;
        let pipeline_ref = &pipeline;
        let cancel = self.cancel.as_ref();

        let workers = (0..worker_count).map(move |worker_id| {
            let tx = tx.clone();
            async move {
                let mut done: Vec<(usize, Result<R, String>)> = Vec::new();
                loop {
                    if cancel.is_some_and(CancellationToken::is_cancelled) {
                        debug!(worker_id, "Batch cancelled, worker stopping");
                        break;
                    }
                    let index = cursor_ref.fetch_add(1, Ordering::SeqCst);
                    let Some(item) = items_ref.get(index) else {
                        break;
                    };
                    let item_id = item.item_id();
                    debug!(worker_id, index, item = %item_id, "Claimed batch item");

                    let reporter = ProgressReporter {
                        index,
                        tx: tx.clone(),
                    };
                    reporter.send(0, 0, None);

                    let item = item.clone();
                    let caught =
                        AssertUnwindSafe(async { pipeline_ref(item, index, reporter).await })
                            .catch_unwind()
                            .await;
                    let outcome = match caught {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(error_message(e.to_string())),
                        Err(payload) => Err(panic_message(payload)),
                    };
                    if let Err(message) = &outcome {
                        warn!(index, item = %item_id, error = %message, "Batch item failed");
                    }

                    let _ = tx.send(BatchEvent::Finished {
                        index,
                        error: outcome.as_ref().err().cloned(),
                    });
                    done.push((index, outcome));
                }
                let _ = tx.send(BatchEvent::WorkerExited);
                done
            }
        });

        let (finished, (mut progress, mut errors)) = tokio::join!(
            join_all(workers),
            collect_events(rx, progress, worker_count, &self.snapshots)
        );

        let mut slots: Vec<Option<Result<R, String>>> = (0..total).map(|_| None).collect();
        for (index, outcome) in finished.into_iter().flatten() {
            slots[index] = Some(outcome);
        }

        let outcomes: Vec<Result<R, String>> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    progress[index].finish(Some(CANCELLED_ERROR.to_string()));
                    errors.push(CANCELLED_ERROR.to_string());
                    Err(CANCELLED_ERROR.to_string())
                })
            })
            .collect();
        self.snapshots.send_replace(progress.clone());

        let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
        let summary = BatchResult {
            total_items: total,
            succeeded,
            failed: total - succeeded,
            errors,
        };

        info!(
            total = summary.total_items,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Batch run finished"
        );

        BatchReport {
            outcomes,
            summary,
            progress,
        }
    }
}

/// Single writer for the progress table. Returns the final table and the
/// failure messages in the order items finished.
async fn collect_events(
    mut rx: mpsc::UnboundedReceiver<BatchEvent>,
    mut progress: Vec<ItemProgress>,
    workers: usize,
    snapshots: &watch::Sender<Vec<ItemProgress>>,
) -> (Vec<ItemProgress>, Vec<String>) {
    let mut errors = Vec::new();
    let mut exited = 0;

    while exited < workers {
        let Some(event) = rx.recv().await else {
            break;
        };
        match event {
            BatchEvent::WorkerExited => {
                exited += 1;
                continue;
            }
            BatchEvent::Progress {
                index,
                stage,
                progress: percent,
                step,
            } => progress[index].advance(stage, percent, step),
            BatchEvent::Finished { index, error } => {
                if let Some(message) = &error {
                    errors.push(message.clone());
                }
                progress[index].finish(error);
            }
        }
        snapshots.send_replace(progress.clone());
    }
    (progress, errors)
}

fn error_message(message: String) -> String {
    if message.trim().is_empty() {
        UNKNOWN_ERROR.to_string()
    } else {
        message
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_default();
    error_message(message)
}

// ── Side-artifact follow-up ─────────────────────────────────────────────

/// Side artifacts produced by one item, processed together in the follow-up
/// phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactBatch<A> {
    pub owner_id: String,
    pub artifacts: Vec<A>,
}

impl<A> BatchItem for ArtifactBatch<A> {
    fn item_id(&self) -> String {
        self.owner_id.clone()
    }

    fn label(&self) -> String {
        format!("{} ({} artifacts)", self.owner_id, self.artifacts.len())
    }
}

/// Group artifacts by owning item id, keeping first-seen owner order.
pub fn group_by_owner<A, I, F>(artifacts: I, owner: F) -> Vec<ArtifactBatch<A>>
where
    I: IntoIterator<Item = A>,
    F: Fn(&A) -> String,
{
    let mut batches: Vec<ArtifactBatch<A>> = Vec::new();
    for artifact in artifacts {
        let owner_id = owner(&artifact);
        match batches.iter_mut().find(|b| b.owner_id == owner_id) {
            Some(batch) => batch.artifacts.push(artifact),
            None => batches.push(ArtifactBatch {
                owner_id,
                artifacts: vec![artifact],
            }),
        }
    }
    batches
}
