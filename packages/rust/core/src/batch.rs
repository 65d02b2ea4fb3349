//! Bounded-concurrency batch processing with progress and abort.
//!
//! Items run as tasks on a [`JoinSet`], gated by a [`Semaphore`]. A single
//! collector loop drains completions, so progress is reported from one place
//! and `completed` never goes backwards.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use citelens_shared::{CitelensError, Result};

/// Concurrency used when the caller has no preference.
pub const DEFAULT_CONCURRENCY: usize = 3;

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPhase {
    Running,
    Complete,
    Aborted,
}

/// Snapshot of a running batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Items finished, successfully or not.
    pub completed: usize,
    pub total: usize,
    /// Label of the most recently finished item.
    pub current_query: Option<String>,
    pub phase: BatchPhase,
}

/// Progress callback for batch runs.
pub trait BatchProgressReporter: Send + Sync {
    fn on_progress(&self, progress: &BatchProgress);
}

/// No-op reporter for headless/test usage.
pub struct SilentBatchProgress;

impl BatchProgressReporter for SilentBatchProgress {
    fn on_progress(&self, _progress: &BatchProgress) {}
}

// ---------------------------------------------------------------------------
// Abort
// ---------------------------------------------------------------------------

/// Requests that a batch stop. Cloneable; any clone can abort.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by [`run_batch`] to learn about an abort request.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, signal) = abort_pair();
        signal
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once an abort is requested. Pending forever if every handle
    /// was dropped without aborting.
    pub async fn aborted(&mut self) {
        if self.rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Create a connected abort handle and signal.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

// ---------------------------------------------------------------------------
// Worker and outcome
// ---------------------------------------------------------------------------

/// Processes one batch item.
pub trait BatchWorker<I>: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Human-readable label used in progress reports.
    fn label(&self, item: &I) -> String;

    fn process(&self, item: I) -> impl Future<Output = Result<Self::Output>> + Send;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ItemOutcome<T> {
    Completed(T),
    Failed(String),
    /// Still in flight or queued when the batch was aborted.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult<T> {
    pub index: usize,
    pub label: String,
    pub outcome: ItemOutcome<T>,
}

/// Results in original item order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome<T> {
    pub results: Vec<BatchItemResult<T>>,
    pub aborted: bool,
}

impl<T> BatchOutcome<T> {
    /// Successful outputs, in item order.
    pub fn completed(&self) -> impl Iterator<Item = &T> {
        self.results.iter().filter_map(|r| match &r.outcome {
            ItemOutcome::Completed(value) => Some(value),
            _ => None,
        })
    }

    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ItemOutcome::Failed(_)))
            .count()
    }

    pub fn discarded_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ItemOutcome::Discarded))
            .count()
    }
}

// ---------------------------------------------------------------------------
// run_batch
// ---------------------------------------------------------------------------

/// Run `worker` over `items` with at most `concurrency` in flight.
///
/// A failing item is recorded and the batch continues. On abort, in-flight
/// and queued items are cancelled and reported as [`ItemOutcome::Discarded`];
/// finished items keep their results.
#[instrument(skip_all, fields(total = items.len(), concurrency = concurrency))]
pub async fn run_batch<I, W>(
    items: Vec<I>,
    worker: Arc<W>,
    concurrency: usize,
    progress: &dyn BatchProgressReporter,
    mut abort: AbortSignal,
) -> BatchOutcome<W::Output>
where
    I: Send + 'static,
    W: BatchWorker<I>,
{
    let total = items.len();
    let concurrency = concurrency.max(1);
    let labels: Vec<String> = items.iter().map(|item| worker.label(item)).collect();
    let mut slots: Vec<Option<ItemOutcome<W::Output>>> = (0..total).map(|_| None).collect();

    let mut aborted = abort.is_aborted();
    let mut completed = 0usize;
    let mut task_index = HashMap::new();
    let mut set = JoinSet::new();

    info!(total, concurrency, "starting batch");
    progress.on_progress(&BatchProgress {
        completed,
        total,
        current_query: None,
        phase: BatchPhase::Running,
    });

    if !aborted {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        for (index, item) in items.into_iter().enumerate() {
            let worker = Arc::clone(&worker);
            let sem = Arc::clone(&semaphore);
            let handle = set.spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|_| CitelensError::Cancelled("batch semaphore closed".into()))?;
                worker.process(item).await
            });
            task_index.insert(handle.id(), index);
        }
    }

    loop {
        tokio::select! {
            biased;
            _ = abort.aborted(), if !aborted => {
                aborted = true;
                warn!(completed, total, "batch aborted, discarding in-flight items");
                set.abort_all();
            }
            joined = set.join_next_with_id() => {
                let Some(joined) = joined else { break };

                let (id, outcome) = match joined {
                    Ok((id, Ok(value))) => (id, ItemOutcome::Completed(value)),
                    Ok((id, Err(e))) => (id, ItemOutcome::Failed(e.to_string())),
                    Err(e) if e.is_cancelled() => (e.id(), ItemOutcome::Discarded),
                    Err(e) => (e.id(), ItemOutcome::Failed(format!("worker panicked: {e}"))),
                };
                let Some(&index) = task_index.get(&id) else { continue };

                let finished = !matches!(outcome, ItemOutcome::Discarded);
                if let ItemOutcome::Failed(error) = &outcome {
                    warn!(item = %labels[index], %error, "batch item failed");
                }
                slots[index] = Some(outcome);

                if finished {
                    completed += 1;
                    debug!(item = %labels[index], completed, total, "batch item finished");
                    progress.on_progress(&BatchProgress {
                        completed,
                        total,
                        current_query: Some(labels[index].clone()),
                        phase: BatchPhase::Running,
                    });
                }
            }
        }
    }

    let results: Vec<_> = slots
        .into_iter()
        .zip(labels)
        .enumerate()
        .map(|(index, (slot, label))| BatchItemResult {
            index,
            label,
            outcome: slot.unwrap_or(ItemOutcome::Discarded),
        })
        .collect();

    progress.on_progress(&BatchProgress {
        completed,
        total,
        current_query: None,
        phase: if aborted {
            BatchPhase::Aborted
        } else {
            BatchPhase::Complete
        },
    });

    info!(completed, total, aborted, "batch finished");
    BatchOutcome { results, aborted }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Sleeps for the item's value in milliseconds; fails on 0; never
    /// finishes on `u64::MAX`.
    struct SleepWorker {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl SleepWorker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }
    }

    impl BatchWorker<u64> for SleepWorker {
        type Output = u64;

        fn label(&self, item: &u64) -> String {
            format!("item-{item}")
        }

        async fn process(&self, item: u64) -> Result<u64> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if item == u64::MAX {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(Duration::from_millis(item)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if item == 0 {
                return Err(CitelensError::validation("zero is not allowed"));
            }
            Ok(item * 10)
        }
    }

    #[derive(Default)]
    struct Recorder {
        snapshots: StdMutex<Vec<BatchProgress>>,
    }

    impl BatchProgressReporter for Recorder {
        fn on_progress(&self, progress: &BatchProgress) {
            self.snapshots.lock().unwrap().push(progress.clone());
        }
    }

    /// Aborts once `after` items have finished.
    struct AbortAfter {
        after: usize,
        handle: AbortHandle,
    }

    impl BatchProgressReporter for AbortAfter {
        fn on_progress(&self, progress: &BatchProgress) {
            if progress.completed >= self.after {
                self.handle.abort();
            }
        }
    }

    #[tokio::test]
    async fn results_keep_input_order_and_respect_concurrency() {
        let worker = SleepWorker::new();
        let items = vec![30, 5, 20, 1, 10];
        let outcome = run_batch(
            items,
            Arc::clone(&worker),
            2,
            &SilentBatchProgress,
            AbortSignal::never(),
        )
        .await;

        let values: Vec<_> = outcome.completed().copied().collect();
        assert_eq!(values, vec![300, 50, 200, 10, 100]);
        assert!(!outcome.aborted);
        assert!(worker.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(outcome.results[2].label, "item-20");
    }

    #[tokio::test]
    async fn item_failure_does_not_stop_batch() {
        let outcome = run_batch(
            vec![3, 0, 4],
            SleepWorker::new(),
            3,
            &SilentBatchProgress,
            AbortSignal::never(),
        )
        .await;

        assert_eq!(outcome.failed_count(), 1);
        assert!(matches!(&outcome.results[1].outcome, ItemOutcome::Failed(e) if e.contains("zero")));
        assert_eq!(outcome.completed().count(), 2);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_ends_complete() {
        let recorder = Recorder::default();
        run_batch(
            vec![4, 1, 3, 2],
            SleepWorker::new(),
            DEFAULT_CONCURRENCY,
            &recorder,
            AbortSignal::never(),
        )
        .await;

        let snapshots = recorder.snapshots.lock().unwrap();
        assert!(snapshots.windows(2).all(|w| w[0].completed <= w[1].completed));
        assert!(snapshots.iter().all(|s| s.total == 4));
        let last = snapshots.last().unwrap();
        assert_eq!(last.completed, 4);
        assert_eq!(last.phase, BatchPhase::Complete);
        assert!(snapshots[1..5].iter().all(|s| s.current_query.is_some()));
    }

    #[tokio::test]
    async fn abort_keeps_completed_and_discards_in_flight() {
        let (handle, signal) = abort_pair();
        let reporter = AbortAfter { after: 2, handle };

        let outcome = run_batch(
            vec![1, u64::MAX, 2, u64::MAX],
            SleepWorker::new(),
            4,
            &reporter,
            signal,
        )
        .await;

        assert!(outcome.aborted);
        assert_eq!(outcome.completed().copied().collect::<Vec<_>>(), vec![10, 20]);
        assert_eq!(outcome.discarded_count(), 2);
        assert_eq!(outcome.results[1].outcome, ItemOutcome::Discarded);
    }

    #[tokio::test]
    async fn abort_before_start_discards_everything() {
        let (handle, signal) = abort_pair();
        handle.abort();
        let recorder = Recorder::default();

        let outcome = run_batch(vec![1, 2], SleepWorker::new(), 2, &recorder, signal).await;

        assert!(outcome.aborted);
        assert_eq!(outcome.discarded_count(), 2);
        let last = recorder.snapshots.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.phase, BatchPhase::Aborted);
        assert_eq!(last.completed, 0);
    }

    #[tokio::test]
    async fn zero_concurrency_still_makes_progress() {
        let outcome = run_batch(
            vec![1, 1],
            SleepWorker::new(),
            0,
            &SilentBatchProgress,
            AbortSignal::never(),
        )
        .await;
        assert_eq!(outcome.completed().count(), 2);
    }

    #[test]
    fn never_signal_is_not_aborted() {
        assert!(!AbortSignal::never().is_aborted());
    }
}
