//! Process every stored Item concurrently, on a bounded pool, and report on all of them at once.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time;

use futures::stream::{FuturesUnordered, StreamExt};
use item_common::health::HealthHandle;
use item_common::item::{Item, ItemId, ItemStatus};
use item_common::store::ItemStore;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::BatchConfig;
use crate::error::{BatchError, BatchFailure, ItemFailure, ItemFailureCause};
use crate::pool::WorkerPool;

/// Lifecycle of a batch run.
/// CollectingIds: Taking the snapshot of ids the run covers.
/// Dispatched: One task per id was spawned, waiting for all of them.
/// CompletedOk: Every item was processed.
/// CompletedWithFailures: Every item reached a terminal state, at least one failed.
/// Abandoned: The caller stopped waiting. Spawned tasks still run to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    CollectingIds,
    Dispatched,
    CompletedOk,
    CompletedWithFailures,
    Abandoned,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::CollectingIds => "collecting_ids",
            RunState::Dispatched => "dispatched",
            RunState::CompletedOk => "completed_ok",
            RunState::CompletedWithFailures => "completed_with_failures",
            RunState::Abandoned => "abandoned",
        }
    }
}

/// Accounting of one invocation of `process_all`. Shared by the tasks of that run only.
#[derive(Default)]
struct BatchRun {
    processed: Mutex<Vec<Item>>,
    processed_count: AtomicUsize,
    failures: Mutex<Vec<ItemFailure>>,
}

impl BatchRun {
    fn record_success(&self, item: Item) {
        lock(&self.processed).push(item);
        self.processed_count.fetch_add(1, Ordering::SeqCst);
    }

    fn record_failure(&self, id: ItemId, cause: ItemFailureCause) {
        lock(&self.failures).push(ItemFailure { id, cause });
    }

    fn take(&self) -> (Vec<Item>, Vec<ItemFailure>) {
        (
            std::mem::take(&mut *lock(&self.processed)),
            std::mem::take(&mut *lock(&self.failures)),
        )
    }
}

/// Appends never leave the vectors half written, so a poisoned lock is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks every Item in an `ItemStore` as processed.
#[derive(Clone)]
pub struct BatchProcessor {
    /// Where items are read from and written back to.
    store: Arc<dyn ItemStore>,
    /// Bounds how many items are processed at the same time, across all runs.
    pool: WorkerPool,
    /// Pause before processing each item.
    item_delay: time::Duration,
    /// How long `process_all` waits for its tasks before giving up on them.
    run_timeout: Option<time::Duration>,
}

impl BatchProcessor {
    pub fn new(store: Arc<dyn ItemStore>, pool: WorkerPool) -> Self {
        Self {
            store,
            pool,
            item_delay: time::Duration::ZERO,
            run_timeout: None,
        }
    }

    pub fn from_config(store: Arc<dyn ItemStore>, pool: WorkerPool, config: &BatchConfig) -> Self {
        Self {
            item_delay: config.item_delay.0,
            run_timeout: config.run_timeout.map(|timeout| timeout.0),
            ..Self::new(store, pool)
        }
    }

    pub fn item_delay(mut self, delay: time::Duration) -> Self {
        self.item_delay = delay;
        self
    }

    pub fn run_timeout(mut self, timeout: time::Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Process every item currently in the store and return them once all are done.
    ///
    /// The ids are read once, up front: items created after that are left for the next run.
    /// Each id gets its own task, and tasks wait on the shared `WorkerPool` for a slot. A task
    /// that fails records its failure and lets the others carry on.
    ///
    /// Resolves only after every task reached a terminal state:
    /// * `Ok` with one item per id (in completion order) if all succeeded.
    /// * `Err(BatchError::ItemFailures)` with every failure, plus the items that did get
    ///   processed, if any task failed.
    ///
    /// Dropping the returned future, or hitting the run timeout, abandons the run: tasks already
    /// spawned keep going so no save is cut short, but nobody receives their result.
    pub async fn process_all(&self) -> Result<Vec<Item>, BatchError> {
        let start = time::Instant::now();

        debug!(state = RunState::CollectingIds.as_str(), "starting batch run");
        let ids = match self.store.list_ids().await {
            Ok(ids) => ids,
            Err(error) => {
                error!("failed to snapshot item ids: {}", error);
                metrics::counter!("item_batch_runs_total", "outcome" => "snapshot_failed")
                    .increment(1);
                return Err(BatchError::Snapshot(error));
            }
        };
        let total = ids.len();

        let run = Arc::new(BatchRun::default());
        let mut pending: FuturesUnordered<_> = ids
            .into_iter()
            .map(|id| {
                let handle = self.spawn_item_task(id, run.clone());
                async move { (id, handle.await) }
            })
            .collect();
        debug!(
            state = RunState::Dispatched.as_str(),
            items = total,
            "dispatched batch run"
        );

        let join_all = async {
            while let Some((id, joined)) = pending.next().await {
                if let Err(join_error) = joined {
                    let message = panic_message(join_error);
                    error!(item_id = id, "item task did not complete: {}", message);
                    run.record_failure(id, ItemFailureCause::Panicked(message));
                }
            }
        };
        let joined = match self.run_timeout {
            Some(timeout) => tokio::time::timeout(timeout, join_all).await.is_ok(),
            None => {
                join_all.await;
                true
            }
        };

        let elapsed = start.elapsed();
        if !joined {
            let pending = pending.len();
            warn!(
                state = RunState::Abandoned.as_str(),
                pending, "batch run timed out after {:?}", elapsed
            );
            metrics::counter!("item_batch_runs_total", "outcome" => RunState::Abandoned.as_str())
                .increment(1);
            return Err(BatchError::Abandoned { pending, elapsed });
        }

        let processed_count = run.processed_count.load(Ordering::SeqCst);
        let (processed, failures) = run.take();
        debug_assert_eq!(processed.len() + failures.len(), total);
        debug_assert_eq!(processed_count, processed.len());

        metrics::histogram!("item_batch_run_duration_seconds").record(elapsed.as_secs_f64());
        metrics::counter!("item_batch_items_processed").increment(processed_count as u64);
        metrics::counter!("item_batch_items_failed").increment(failures.len() as u64);

        if failures.is_empty() {
            info!(
                state = RunState::CompletedOk.as_str(),
                processed = processed_count,
                "batch run completed in {:?}",
                elapsed
            );
            metrics::counter!("item_batch_runs_total", "outcome" => RunState::CompletedOk.as_str())
                .increment(1);
            Ok(processed)
        } else {
            warn!(
                state = RunState::CompletedWithFailures.as_str(),
                processed = processed_count,
                failed = failures.len(),
                "batch run completed with failures in {:?}",
                elapsed
            );
            metrics::counter!(
                "item_batch_runs_total",
                "outcome" => RunState::CompletedWithFailures.as_str()
            )
            .increment(1);
            Err(BatchError::ItemFailures(BatchFailure {
                processed,
                failures,
            }))
        }
    }

    /// Run `process_all`, reporting `liveness` healthy every `every` until the run resolves.
    /// A run longer than the liveness deadline then does not read as a stalled worker.
    pub async fn process_all_reporting(
        &self,
        liveness: &HealthHandle,
        every: time::Duration,
    ) -> Result<Vec<Item>, BatchError> {
        let run = self.process_all();
        tokio::pin!(run);
        let mut heartbeat = tokio::time::interval(every);

        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = heartbeat.tick() => liveness.report_healthy().await,
            }
        }
    }

    /// Spawn the task processing `id` once it gets a slot in the pool. The task records its own
    /// outcome in `run`, except for panics which the coordinator records when joining.
    fn spawn_item_task(&self, id: ItemId, run: Arc<BatchRun>) -> JoinHandle<()> {
        let store = self.store.clone();
        let pool = self.pool.clone();
        let item_delay = self.item_delay;

        tokio::spawn(async move {
            let Ok(permit) = pool.acquire().await else {
                run.record_failure(id, ItemFailureCause::PoolClosed);
                return;
            };
            pool.report_saturation();

            if !item_delay.is_zero() {
                tokio::time::sleep(item_delay).await;
            }

            match process_item(store.as_ref(), id).await {
                Ok(item) => {
                    debug!(item_id = id, "processed item");
                    run.record_success(item);
                }
                Err(cause) => {
                    warn!(item_id = id, "failed to process item: {}", cause);
                    run.record_failure(id, cause);
                }
            }

            drop(permit);
        })
    }
}

/// Look an item up, mark it processed and write it back.
async fn process_item(store: &dyn ItemStore, id: ItemId) -> Result<Item, ItemFailureCause> {
    let mut item = store
        .find_by_id(id)
        .await?
        .ok_or(ItemFailureCause::NotFound)?;

    item.status = ItemStatus::Processed;

    Ok(store.save(item).await?)
}

fn panic_message(join_error: JoinError) -> String {
    match join_error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|s| (*s).to_owned()))
            .unwrap_or_else(|| "unknown panic payload".to_owned()),
        Err(join_error) => join_error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::num::NonZeroUsize;

    use item_common::health::HealthRegistry;
    use item_common::memory::MemoryItemStore;
    use item_common::store::StoreError;
    use item_common::test_utils::{items, FaultyItemStore};

    use crate::config::PoolSize;

    fn pool(size: usize) -> WorkerPool {
        WorkerPool::new(PoolSize(NonZeroUsize::new(size).unwrap()))
    }

    fn ids_of(items: &[Item]) -> BTreeSet<ItemId> {
        items.iter().map(|item| item.id.unwrap()).collect()
    }

    fn expect_failures(result: Result<Vec<Item>, BatchError>) -> BatchFailure {
        match result {
            Err(BatchError::ItemFailures(failure)) => failure,
            Err(other) => panic!("expected item failures, got: {}", other),
            Ok(items) => panic!("expected item failures, got {} items", items.len()),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_processes_every_item_once() {
        let store = Arc::new(FaultyItemStore::new(items(25)));
        let processor = BatchProcessor::new(store.clone(), pool(4));

        let processed = processor.process_all().await.expect("batch run failed");

        assert_eq!(processed.len(), 25);
        assert_eq!(ids_of(&processed), (1..=25).collect());
        assert!(processed
            .iter()
            .all(|item| item.status == ItemStatus::Processed));

        let mut saves = store.saves();
        saves.sort();
        assert_eq!(saves, (1..=25).collect::<Vec<_>>());

        let stored = store.find_all().await.unwrap();
        assert!(stored.iter().all(|item| item.status == ItemStatus::Processed));
    }

    #[tokio::test]
    async fn test_empty_store_completes_ok() {
        let processor = BatchProcessor::new(Arc::new(MemoryItemStore::new()), pool(2));

        let processed = processor.process_all().await.expect("batch run failed");

        assert!(processed.is_empty());
    }

    #[tokio::test]
    async fn test_missing_items_are_all_reported() {
        let store = Arc::new(FaultyItemStore::new(items(5)).phantom_ids([100, 101, 102]));
        let processor = BatchProcessor::new(store.clone(), pool(3));

        let failure = expect_failures(processor.process_all().await);

        assert_eq!(failure.failures.len(), 3);
        assert_eq!(
            failure.failed_ids().into_iter().collect::<BTreeSet<_>>(),
            BTreeSet::from([100, 101, 102])
        );
        assert!(failure
            .failures
            .iter()
            .all(|f| matches!(f.cause, ItemFailureCause::NotFound)));
        assert_eq!(ids_of(&failure.processed), (1..=5).collect());
        assert_eq!(store.saves().len(), 5);
    }

    #[tokio::test]
    async fn test_missing_item_among_present_ones() {
        let store = Arc::new(
            FaultyItemStore::new(items(3).into_iter().filter(|item| item.id != Some(2)))
                .phantom_ids([2]),
        );
        let processor = BatchProcessor::new(store.clone(), pool(10));

        let failure = expect_failures(processor.process_all().await);

        assert_eq!(failure.failed_ids(), vec![2]);
        assert!(matches!(
            failure.failures[0].cause,
            ItemFailureCause::NotFound
        ));
        // Items 1 and 3 were still processed, and are reported next to the failure.
        assert_eq!(ids_of(&failure.processed), BTreeSet::from([1, 3]));
        for id in [1, 3] {
            let item = store.find_by_id(id).await.unwrap().unwrap();
            assert_eq!(item.status, ItemStatus::Processed);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failing_save_does_not_stop_siblings() {
        let store = Arc::new(FaultyItemStore::new(items(10)).failing_saves([4]));
        let processor = BatchProcessor::new(store.clone(), pool(3));

        let failure = expect_failures(processor.process_all().await);

        assert_eq!(failure.failed_ids(), vec![4]);
        assert!(matches!(
            failure.failures[0].cause,
            ItemFailureCause::Persistence(_)
        ));
        assert_eq!(failure.processed.len(), 9);
        assert!(!ids_of(&failure.processed).contains(&4));
        assert_eq!(
            store.find_by_id(4).await.unwrap().unwrap().status,
            ItemStatus::New
        );
    }

    #[tokio::test]
    async fn test_failing_lookup_does_not_stop_siblings() {
        let store = Arc::new(FaultyItemStore::new(items(3)).failing_lookups([2]));
        let processor = BatchProcessor::new(store.clone(), pool(2));

        let failure = expect_failures(processor.process_all().await);

        assert_eq!(failure.failed_ids(), vec![2]);
        assert!(matches!(
            failure.failures[0].cause,
            ItemFailureCause::Persistence(StoreError::Unavailable(_))
        ));
        assert_eq!(ids_of(&failure.processed), BTreeSet::from([1, 3]));
        assert!(!store.saves().contains(&2));
        for id in [1, 3] {
            let item = store.find_by_id(id).await.unwrap().unwrap();
            assert_eq!(item.status, ItemStatus::Processed);
        }
    }

    #[tokio::test]
    async fn test_panicking_task_is_recorded() {
        let store = Arc::new(FaultyItemStore::new(items(4)).panicking_saves([3]));
        let processor = BatchProcessor::new(store.clone(), pool(2));

        let failure = expect_failures(processor.process_all().await);

        assert_eq!(failure.failed_ids(), vec![3]);
        match &failure.failures[0].cause {
            ItemFailureCause::Panicked(message) => {
                assert!(message.contains("injected panic while saving item 3"))
            }
            other => panic!("expected a panic, got: {}", other),
        }
        assert_eq!(ids_of(&failure.processed), BTreeSet::from([1, 2, 4]));
    }

    #[tokio::test]
    async fn test_snapshot_failure() {
        let store = Arc::new(FaultyItemStore::new(items(3)).fail_listing());
        let processor = BatchProcessor::new(store.clone(), pool(2));

        let result = processor.process_all().await;

        assert!(matches!(result, Err(BatchError::Snapshot(_))));
        assert!(store.saves().is_empty());
    }

    #[tokio::test]
    async fn test_closed_pool_fails_every_item() {
        let pool = pool(2);
        pool.close();
        let store = Arc::new(FaultyItemStore::new(items(3)));
        let processor = BatchProcessor::new(store.clone(), pool);

        let failure = expect_failures(processor.process_all().await);

        assert_eq!(failure.failures.len(), 3);
        assert!(failure
            .failures
            .iter()
            .all(|f| matches!(f.cause, ItemFailureCause::PoolClosed)));
        assert!(failure.processed.is_empty());
        assert!(store.saves().is_empty());
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let processor = BatchProcessor::new(Arc::new(MemoryItemStore::with_items(items(6))), pool(2));

        let first = processor.process_all().await.expect("first run failed");
        let second = processor.process_all().await.expect("second run failed");

        assert_eq!(ids_of(&first), ids_of(&second));
        assert!(second
            .iter()
            .all(|item| item.status == ItemStatus::Processed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_size_does_not_change_outcome() {
        let mut outcomes = Vec::new();

        for size in [1, 10] {
            let store = Arc::new(
                FaultyItemStore::new(items(20))
                    .phantom_ids([50, 51])
                    .failing_saves([7, 13]),
            );
            let processor = BatchProcessor::new(store, pool(size));

            let failure = expect_failures(processor.process_all().await);
            outcomes.push((
                ids_of(&failure.processed),
                failure.failed_ids().into_iter().collect::<BTreeSet<_>>(),
            ));
        }

        assert_eq!(outcomes[0], outcomes[1]);
        assert_eq!(outcomes[0].1, BTreeSet::from([7, 13, 50, 51]));
        assert_eq!(outcomes[0].0.len(), 18);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_bounds_parallelism() {
        let store = Arc::new(
            FaultyItemStore::new(items(12)).save_latency(time::Duration::from_millis(20)),
        );
        let processor = BatchProcessor::new(store.clone(), pool(3));

        let processed = processor.process_all().await.expect("batch run failed");

        assert_eq!(processed.len(), 12);
        assert!(store.peak_in_flight() <= 3);
        assert!(store.peak_in_flight() >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_keep_separate_accounts() {
        let store = Arc::new(
            FaultyItemStore::new(items(15)).save_latency(time::Duration::from_millis(5)),
        );
        let processor = BatchProcessor::new(store.clone(), pool(4));

        let (first, second) = tokio::join!(processor.process_all(), processor.process_all());

        let first = first.expect("first run failed");
        let second = second.expect("second run failed");
        assert_eq!(ids_of(&first), (1..=15).collect());
        assert_eq!(ids_of(&second), (1..=15).collect());
        assert_eq!(first.len(), 15);
        assert_eq!(second.len(), 15);
        assert_eq!(store.saves().len(), 30);
    }

    #[tokio::test]
    async fn test_item_delay_still_completes() {
        let processor = BatchProcessor::new(Arc::new(MemoryItemStore::with_items(items(4))), pool(2))
            .item_delay(time::Duration::from_millis(10));

        let processed = processor.process_all().await.expect("batch run failed");

        assert_eq!(processed.len(), 4);
    }

    #[tokio::test]
    async fn test_timed_out_run_is_abandoned_but_items_finish() {
        let store = Arc::new(
            FaultyItemStore::new(items(4)).save_latency(time::Duration::from_millis(100)),
        );
        let processor = BatchProcessor::new(store.clone(), pool(1))
            .run_timeout(time::Duration::from_millis(30));

        match processor.process_all().await {
            Err(BatchError::Abandoned { pending, .. }) => assert!(pending > 0),
            Err(other) => panic!("expected an abandoned run, got: {}", other),
            Ok(items) => panic!("expected an abandoned run, got {} items", items.len()),
        }

        // Tasks that were already spawned keep running without anyone waiting on them.
        tokio::time::sleep(time::Duration::from_millis(1000)).await;
        assert_eq!(store.saves().len(), 4);
        let stored = store.find_all().await.unwrap();
        assert!(stored.iter().all(|item| item.status == ItemStatus::Processed));
    }

    #[tokio::test]
    async fn test_dropped_run_lets_items_finish() {
        let store = Arc::new(
            FaultyItemStore::new(items(3)).save_latency(time::Duration::from_millis(50)),
        );
        let processor = BatchProcessor::new(store.clone(), pool(1));

        let result =
            tokio::time::timeout(time::Duration::from_millis(10), processor.process_all()).await;
        assert!(result.is_err());

        tokio::time::sleep(time::Duration::from_millis(500)).await;
        let stored = store.find_all().await.unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|item| item.status == ItemStatus::Processed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_long_run_keeps_reporting_liveness() {
        let liveness = HealthRegistry::new("liveness");
        let handle = liveness
            .register("batch-worker", ::time::Duration::milliseconds(100))
            .await;
        let store = Arc::new(
            FaultyItemStore::new(items(3)).save_latency(time::Duration::from_millis(100)),
        );
        let processor = BatchProcessor::new(store, pool(1));

        // A single report goes stale while a 300ms run is pending.
        handle.report_healthy().await;
        processor.process_all().await.expect("batch run failed");
        assert!(!liveness.get_status().healthy);

        let processed = processor
            .process_all_reporting(&handle, time::Duration::from_millis(20))
            .await
            .expect("batch run failed");
        assert_eq!(processed.len(), 3);
        tokio::time::sleep(time::Duration::from_millis(10)).await;
        assert!(liveness.get_status().healthy);
    }

    #[test]
    fn test_batch_failure_lists_every_failure() {
        let failure = BatchFailure {
            processed: items(2),
            failures: vec![
                ItemFailure {
                    id: 3,
                    cause: ItemFailureCause::NotFound,
                },
                ItemFailure {
                    id: 4,
                    cause: ItemFailureCause::PoolClosed,
                },
            ],
        };

        assert_eq!(
            failure.to_string(),
            "2 of 4 items failed; item 3: item not found; item 4: worker pool is closed"
        );
    }
}
