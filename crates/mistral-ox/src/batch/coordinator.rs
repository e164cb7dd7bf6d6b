use std::{collections::HashMap, fmt, pin::pin, sync::Arc, time::Duration};

use bon::Builder;
use futures_util::{StreamExt, stream};
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;

use super::{
    chunk::{Chunk, partition},
    error::BatchError,
    invoker::EndpointInvoker,
    job::{
        BatchJob, BatchResult, ChunkFailure, FailureKind, ItemOutcome, JobId, JobProgress,
        JobState, JobStatus,
    },
    retry::{ChunkOutcome, RetryPolicy, Sleeper, TokioSleeper, run_chunk},
};

/// Per-job dispatch settings.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct BatchOptions {
    /// Items per request
    #[builder(default = 64)]
    pub chunk_size: usize,
    /// Chunk requests in flight at once
    #[builder(default = 4)]
    pub max_concurrency: usize,
    #[builder(default)]
    pub retry: RetryPolicy,
    /// Stop dispatching after the first failed chunk
    #[builder(default)]
    pub fail_fast: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl BatchOptions {
    fn validate(&self) -> Result<(), BatchError> {
        if self.chunk_size == 0 {
            return Err(BatchError::InvalidArgument(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(BatchError::InvalidArgument(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        self.retry.validate().map_err(BatchError::InvalidArgument)
    }
}

type Registry<O> = Arc<RwLock<HashMap<JobId, Arc<BatchJob<O>>>>>;

/// Splits work into chunks, dispatches them with bounded concurrency and
/// retries, and keeps the results of submitted jobs until they are removed.
///
/// Jobs run on the ambient tokio runtime; `submit` must be called from within one.
pub struct BatchCoordinator<V: EndpointInvoker> {
    invoker: Arc<V>,
    sleeper: Arc<dyn Sleeper>,
    jobs: Registry<V::Output>,
}

impl<V: EndpointInvoker> Clone for BatchCoordinator<V> {
    fn clone(&self) -> Self {
        Self {
            invoker: Arc::clone(&self.invoker),
            sleeper: Arc::clone(&self.sleeper),
            jobs: Arc::clone(&self.jobs),
        }
    }
}

impl<V: EndpointInvoker> fmt::Debug for BatchCoordinator<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("invoker", &std::any::type_name::<V>())
            .finish_non_exhaustive()
    }
}

impl<V: EndpointInvoker> BatchCoordinator<V> {
    pub fn new(invoker: V) -> Self {
        Self {
            invoker: Arc::new(invoker),
            sleeper: Arc::new(TokioSleeper),
            jobs: Arc::default(),
        }
    }

    /// Replace the backoff delay implementation.
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: impl Sleeper) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Register a job and start dispatching it in the background.
    pub async fn submit(
        &self,
        items: Vec<V::Item>,
        model: impl Into<String>,
        options: BatchOptions,
    ) -> Result<JobId, BatchError> {
        let model = model.into();
        if items.is_empty() {
            return Err(BatchError::InvalidArgument(
                "items must not be empty".to_string(),
            ));
        }
        if model.trim().is_empty() {
            return Err(BatchError::InvalidArgument(
                "model must not be empty".to_string(),
            ));
        }
        options.validate()?;

        let id = JobId::new();
        let total_items = items.len();
        let chunks = partition(items, options.chunk_size);
        let (progress_tx, progress_rx) = watch::channel(JobProgress {
            status: JobStatus::new(id, model.clone(), total_items, chunks.len()),
            result: None,
        });
        let job = Arc::new(BatchJob {
            id,
            cancel: CancellationToken::new(),
            progress: progress_rx,
        });
        self.jobs.write().await.insert(id, Arc::clone(&job));

        tracing::info!(
            job_id = %id,
            %model,
            items = total_items,
            chunks = chunks.len(),
            chunk_size = options.chunk_size,
            max_concurrency = options.max_concurrency,
            "batch job submitted"
        );

        let driver = Driver {
            id,
            model,
            total_items,
            options,
            invoker: Arc::clone(&self.invoker),
            sleeper: Arc::clone(&self.sleeper),
            cancel: job.cancel.clone(),
            progress: progress_tx,
        };
        tokio::spawn(driver.run(chunks));

        Ok(id)
    }

    pub async fn status(&self, id: JobId) -> Result<JobStatus, BatchError> {
        Ok(self.job(id).await?.status())
    }

    /// Snapshots of every job still registered.
    pub async fn jobs(&self) -> Vec<JobStatus> {
        self.jobs
            .read()
            .await
            .values()
            .map(|job| job.status())
            .collect()
    }

    /// Wait until the job is terminal or `cancel` fires. Cancelling the wait
    /// leaves the job running.
    pub async fn wait_for_completion(
        &self,
        id: JobId,
        cancel: &CancellationToken,
    ) -> Result<Arc<BatchResult<V::Output>>, BatchError> {
        let job = self.job(id).await?;
        if cancel.is_cancelled() {
            return Err(BatchError::Cancelled(id));
        }

        let mut progress = job.progress.clone();
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(BatchError::Cancelled(id)),
            result = finished(&mut progress) => result.ok_or(BatchError::JobAborted(id)),
        }
    }

    /// [`wait_for_completion`](Self::wait_for_completion) with a deadline.
    pub async fn wait_timeout(
        &self,
        id: JobId,
        timeout: Duration,
    ) -> Result<Arc<BatchResult<V::Output>>, BatchError> {
        let cancel = CancellationToken::new();
        tokio::time::timeout(timeout, self.wait_for_completion(id, &cancel))
            .await
            .map_err(|_| BatchError::Cancelled(id))?
    }

    /// Stop a job. In-flight chunk requests are dropped and every unfinished
    /// item fails as cancelled. Terminal jobs are left untouched.
    pub async fn cancel(&self, id: JobId) -> Result<JobStatus, BatchError> {
        let job = self.job(id).await?;
        if job.status().state.is_terminal() {
            return Ok(job.status());
        }

        tracing::info!(job_id = %job.id, "cancelling batch job");
        job.cancel.cancel();
        let mut progress = job.progress.clone();
        finished(&mut progress).await;
        Ok(job.status())
    }

    /// Forget a terminal job and hand back its result.
    pub async fn remove(&self, id: JobId) -> Result<Arc<BatchResult<V::Output>>, BatchError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get(&id).ok_or(BatchError::NotFound(id))?;
        let status = job.status();
        if !status.state.is_terminal() {
            return Err(BatchError::InvalidArgument(format!(
                "job {id} is still {}",
                status.state
            )));
        }
        let result = job.result().ok_or(BatchError::JobAborted(id))?;
        jobs.remove(&id);
        Ok(result)
    }

    async fn job(&self, id: JobId) -> Result<Arc<BatchJob<V::Output>>, BatchError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(BatchError::NotFound(id))
    }
}

/// Resolves once a result is published; `None` if the driver vanished first.
async fn finished<O>(
    progress: &mut watch::Receiver<JobProgress<O>>,
) -> Option<Arc<BatchResult<O>>> {
    progress
        .wait_for(|p| p.result.is_some())
        .await
        .ok()
        .and_then(|p| p.result.clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    Cancelled,
    FailFast,
}

/// Background task of one job. It is the only writer of the job's progress
/// and the only owner of the per-item outcomes.
struct Driver<V: EndpointInvoker> {
    id: JobId,
    model: String,
    total_items: usize,
    options: BatchOptions,
    invoker: Arc<V>,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
    progress: watch::Sender<JobProgress<V::Output>>,
}

impl<V: EndpointInvoker> Driver<V> {
    async fn run(self, chunks: Vec<Chunk<V::Item>>) {
        self.progress
            .send_modify(|p| p.status.state = JobState::Running);

        let mut slots: Vec<Option<ItemOutcome<V::Output>>> =
            std::iter::repeat_with(|| None).take(self.total_items).collect();
        let abort = self.dispatch(chunks, &mut slots).await;

        let (state, reason) = match abort {
            None => (JobState::Completed, "job finished"),
            Some(Abort::Cancelled) => (JobState::Cancelled, "job cancelled"),
            Some(Abort::FailFast) => (JobState::Failed, "job aborted after a chunk failed"),
        };

        let chunk_size = self.options.chunk_size;
        let items = slots
            .into_iter()
            .enumerate()
            .map(|(position, slot)| {
                slot.unwrap_or_else(|| {
                    ItemOutcome::Failure(ChunkFailure {
                        chunk_index: position / chunk_size,
                        kind: FailureKind::Cancelled,
                        message: reason.to_string(),
                        attempts: 0,
                    })
                })
            })
            .collect();
        let result = Arc::new(BatchResult::from_items(items));

        tracing::info!(
            job_id = %self.id,
            %state,
            total = result.summary.total_requests,
            succeeded = result.summary.succeeded,
            failed = result.summary.failed,
            "batch job finished"
        );

        self.progress.send_modify(|p| {
            let status = &mut p.status;
            status.failed_chunks += status.pending_chunks + status.running_chunks;
            status.pending_chunks = 0;
            status.running_chunks = 0;
            status.state = state;
            p.result = Some(result);
        });
    }

    /// Runs chunks with at most `max_concurrency` in flight, recording outcomes
    /// into `slots`. Returning early drops every in-flight dispatch.
    async fn dispatch(
        &self,
        chunks: Vec<Chunk<V::Item>>,
        slots: &mut [Option<ItemOutcome<V::Output>>],
    ) -> Option<Abort> {
        let outcomes = stream::iter(chunks)
            .map(|chunk| async move {
                self.progress.send_modify(|p| {
                    p.status.pending_chunks -= 1;
                    p.status.running_chunks += 1;
                });
                let outcome = run_chunk(
                    self.invoker.as_ref(),
                    self.sleeper.as_ref(),
                    self.id,
                    &self.model,
                    &chunk,
                    &self.options.retry,
                )
                .await;
                (chunk, outcome)
            })
            .buffer_unordered(self.options.max_concurrency);
        let mut outcomes = pin!(outcomes);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Some(Abort::Cancelled),
                next = outcomes.next() => {
                    let Some((chunk, outcome)) = next else {
                        return None;
                    };
                    let failed = self.record(&chunk, outcome, slots);
                    if failed && self.options.fail_fast {
                        return Some(Abort::FailFast);
                    }
                }
            }
        }
    }

    /// Stores one chunk's outcome at its original positions; true on failure.
    fn record(
        &self,
        chunk: &Chunk<V::Item>,
        outcome: ChunkOutcome<V::Output>,
        slots: &mut [Option<ItemOutcome<V::Output>>],
    ) -> bool {
        let positions = chunk.positions();
        let failed = match outcome {
            ChunkOutcome::Success(outputs) => {
                for (slot, output) in slots[positions].iter_mut().zip(outputs) {
                    *slot = Some(ItemOutcome::Success(output));
                }
                false
            }
            ChunkOutcome::Failure(failure) => {
                for slot in &mut slots[positions] {
                    *slot = Some(ItemOutcome::Failure(failure.clone()));
                }
                true
            }
        };

        self.progress.send_modify(|p| {
            p.status.running_chunks -= 1;
            if failed {
                p.status.failed_chunks += 1;
            } else {
                p.status.succeeded_chunks += 1;
            }
        });
        tracing::debug!(job_id = %self.id, chunk = chunk.index, failed, "chunk finished");
        failed
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;

    use super::*;
    use crate::batch::invoker::InvokeError;

    struct NoSleep;

    #[async_trait]
    impl Sleeper for NoSleep {
        async fn sleep(&self, _delay: Duration) {}
    }

    /// Doubles every item. Behaviour is keyed by the first item of a chunk.
    #[derive(Default)]
    struct TestInvoker {
        delays: HashMap<u32, Duration>,
        hang_from: Option<u32>,
        panic_on: Option<u32>,
        errors: Mutex<HashMap<u32, VecDeque<InvokeError>>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        completed: Mutex<Vec<u32>>,
    }

    impl TestInvoker {
        fn fail(self, first_item: u32, errors: impl IntoIterator<Item = InvokeError>) -> Self {
            self.errors
                .lock()
                .expect("lock")
                .insert(first_item, errors.into_iter().collect());
            self
        }
    }

    struct InFlight<'a>(&'a AtomicUsize);

    impl Drop for InFlight<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl EndpointInvoker for TestInvoker {
        type Item = u32;
        type Output = u32;

        async fn invoke(&self, _model: &str, items: &[u32]) -> Result<Vec<u32>, InvokeError> {
            let first = items[0];
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            if self.panic_on == Some(first) {
                panic!("invoker exploded on chunk starting at {first}");
            }
            if self.hang_from.is_some_and(|from| first >= from) {
                std::future::pending::<()>().await;
            }
            if let Some(delay) = self.delays.get(&first) {
                tokio::time::sleep(*delay).await;
            }
            let scripted = self
                .errors
                .lock()
                .expect("lock")
                .get_mut(&first)
                .and_then(VecDeque::pop_front);
            if let Some(err) = scripted {
                return Err(err);
            }
            self.completed.lock().expect("lock").push(first);
            Ok(items.iter().map(|n| n * 2).collect())
        }
    }

    fn coordinator(invoker: TestInvoker) -> (BatchCoordinator<Arc<TestInvoker>>, Arc<TestInvoker>) {
        let invoker = Arc::new(invoker);
        let coordinator = BatchCoordinator::new(Arc::clone(&invoker)).with_sleeper(NoSleep);
        (coordinator, invoker)
    }

    fn options(chunk_size: usize, max_concurrency: usize) -> BatchOptions {
        BatchOptions::builder()
            .chunk_size(chunk_size)
            .max_concurrency(max_concurrency)
            .retry(
                RetryPolicy::builder()
                    .max_attempts(3)
                    .initial_delay(Duration::from_millis(1))
                    .max_delay(Duration::from_millis(4))
                    .build(),
            )
            .build()
    }

    async fn wait(
        coordinator: &BatchCoordinator<Arc<TestInvoker>>,
        id: JobId,
    ) -> Arc<BatchResult<u32>> {
        coordinator
            .wait_timeout(id, Duration::from_secs(10))
            .await
            .expect("job finishes")
    }

    fn outputs(result: &BatchResult<u32>) -> Vec<Option<u32>> {
        result.items.iter().map(|item| item.output().copied()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_concurrency_and_full_summary() {
        let delays = [0, 3, 6, 9]
            .into_iter()
            .map(|first| (first, Duration::from_millis(10)))
            .collect();
        let (coordinator, invoker) = coordinator(TestInvoker {
            delays,
            ..TestInvoker::default()
        });

        let id = coordinator
            .submit((0..10).collect(), "mistral-embed", options(3, 2))
            .await
            .expect("valid job");
        let result = wait(&coordinator, id).await;

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 4);
        assert_eq!(invoker.max_in_flight.load(Ordering::SeqCst), 2);
        assert_eq!(
            result.summary,
            crate::batch::BatchSummary {
                total_requests: 10,
                succeeded: 10,
                failed: 0
            }
        );
        assert_eq!(
            outputs(&result),
            (0..10).map(|n| Some(n * 2)).collect::<Vec<_>>()
        );

        let status = coordinator.status(id).await.expect("known job");
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.total_chunks, 4);
        assert_eq!(status.succeeded_chunks, 4);
        assert_eq!(status.pending_chunks + status.running_chunks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn results_follow_input_order_not_completion_order() {
        let (coordinator, invoker) = coordinator(TestInvoker {
            delays: HashMap::from([(0, Duration::from_millis(50))]),
            ..TestInvoker::default()
        });

        let id = coordinator
            .submit(vec![0, 1, 2, 3], "m", options(2, 2))
            .await
            .expect("valid job");
        let result = wait(&coordinator, id).await;

        assert_eq!(*invoker.completed.lock().expect("lock"), vec![2, 0]);
        assert_eq!(outputs(&result), vec![Some(0), Some(2), Some(4), Some(6)]);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_the_job() {
        let invoker = TestInvoker::default().fail(
            2,
            [InvokeError::transient("503"), InvokeError::transient("503")],
        );
        let (coordinator, invoker) = coordinator(invoker);

        let id = coordinator
            .submit(vec![0, 1, 2, 3], "m", options(2, 1))
            .await
            .expect("valid job");
        let result = wait(&coordinator, id).await;

        assert!(result.is_complete_success());
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failed_chunk_does_not_abort_the_job() {
        let invoker = TestInvoker::default()
            .fail(0, (0..3).map(|_| InvokeError::transient("timeout")))
            .fail(4, [InvokeError::permanent("400")]);
        let (coordinator, _invoker) = coordinator(invoker);

        let id = coordinator
            .submit((0..6).collect(), "m", options(2, 2))
            .await
            .expect("valid job");
        let result = wait(&coordinator, id).await;

        assert_eq!(result.summary.total_requests, 6);
        assert_eq!(result.summary.succeeded, 2);
        assert_eq!(result.summary.failed, 4);
        assert_eq!(outputs(&result)[2..4], [Some(4), Some(6)]);

        let transient = result.items[0].failure().expect("chunk 0 failed");
        assert_eq!(transient.kind, FailureKind::Transient);
        assert_eq!(transient.attempts, 3);
        assert_eq!(result.items[1].failure(), Some(transient));

        let permanent = result.items[5].failure().expect("chunk 2 failed");
        assert_eq!(permanent.kind, FailureKind::Permanent);
        assert_eq!(permanent.attempts, 1);
        assert_eq!(permanent.chunk_index, 2);

        let status = coordinator.status(id).await.expect("known job");
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.failed_chunks, 2);
        assert_eq!(status.succeeded_chunks, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_every_item_of_the_chunk() {
        let invoker = TestInvoker::default()
            .fail(3, (0..2).map(|_| InvokeError::transient("502 bad gateway")));
        let (coordinator, invoker) = coordinator(invoker);
        let options = BatchOptions {
            retry: RetryPolicy::builder()
                .max_attempts(2)
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(2))
                .build(),
            ..options(3, 2)
        };

        let id = coordinator
            .submit((0..9).collect(), "m", options)
            .await
            .expect("valid job");
        let result = wait(&coordinator, id).await;

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.summary.succeeded, 6);
        assert_eq!(result.summary.failed, 3);
        for item in &result.items[3..6] {
            let failure = item.failure().expect("chunk 1 failed");
            assert_eq!(failure.chunk_index, 1);
            assert_eq!(failure.kind, FailureKind::Transient);
            assert_eq!(failure.attempts, 2);
            assert_eq!(failure.message, "502 bad gateway");
        }
        assert!(result.items[..3].iter().all(ItemOutcome::is_success));
        assert!(result.items[6..].iter().all(ItemOutcome::is_success));

        let status = coordinator.status(id).await.expect("known job");
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.failed_chunks, 1);
    }

    #[tokio::test]
    async fn panicking_invoker_still_finishes_the_job() {
        let (coordinator, invoker) = coordinator(TestInvoker {
            panic_on: Some(2),
            ..TestInvoker::default()
        });

        let id = coordinator
            .submit((0..6).collect(), "m", options(2, 2))
            .await
            .expect("valid job");
        let result = wait(&coordinator, id).await;

        assert_eq!(outputs(&result)[..2], [Some(0), Some(2)]);
        assert_eq!(outputs(&result)[4..], [Some(8), Some(10)]);
        let failure = result.items[2].failure().expect("chunk 1 failed");
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert_eq!(failure.attempts, 1);
        assert!(failure.message.contains("invoker exploded"));
        assert_eq!(invoker.in_flight.load(Ordering::SeqCst), 0);

        let status = coordinator.status(id).await.expect("known job");
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.failed_chunks, 1);
        assert_eq!(status.succeeded_chunks, 2);

        let removed = coordinator.remove(id).await.expect("terminal job");
        assert_eq!(removed.summary.failed, 2);
        assert!(coordinator.jobs().await.is_empty());
    }

    #[tokio::test]
    async fn fail_fast_stops_the_job() {
        let invoker = TestInvoker::default().fail(0, [InvokeError::permanent("bad input")]);
        let (coordinator, invoker) = coordinator(invoker);
        let options = BatchOptions {
            fail_fast: true,
            ..options(2, 1)
        };

        let id = coordinator
            .submit((0..6).collect(), "m", options)
            .await
            .expect("valid job");
        let result = wait(&coordinator, id).await;

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.summary.failed, 6);
        assert_eq!(
            result.items[0].failure().map(|f| f.kind),
            Some(FailureKind::Permanent)
        );
        let skipped = result.items[5].failure().expect("never dispatched");
        assert_eq!(skipped.kind, FailureKind::Cancelled);
        assert_eq!(skipped.chunk_index, 2);
        assert_eq!(skipped.attempts, 0);

        let status = coordinator.status(id).await.expect("known job");
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.failed_chunks, 3);
    }

    #[tokio::test]
    async fn cancel_drops_in_flight_chunks() {
        let (coordinator, invoker) = coordinator(TestInvoker {
            hang_from: Some(2),
            ..TestInvoker::default()
        });

        let id = coordinator
            .submit((0..6).collect(), "m", options(2, 2))
            .await
            .expect("valid job");

        tokio::time::timeout(Duration::from_secs(5), async {
            while coordinator.status(id).await.expect("known").succeeded_chunks < 1 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("first chunk completes");

        let status = coordinator.cancel(id).await.expect("known job");
        assert_eq!(status.state, JobState::Cancelled);
        assert_eq!(status.succeeded_chunks, 1);
        assert_eq!(status.failed_chunks, 2);
        assert_eq!(invoker.in_flight.load(Ordering::SeqCst), 0);

        let result = wait(&coordinator, id).await;
        assert_eq!(outputs(&result)[..2], [Some(0), Some(2)]);
        assert!(
            result.items[2..]
                .iter()
                .all(|item| item.failure().map(|f| f.kind) == Some(FailureKind::Cancelled))
        );
        assert_eq!(result.summary.succeeded + result.summary.failed, 6);

        let again = coordinator.cancel(id).await.expect("known job");
        assert_eq!(again.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_wait_leaves_job_running() {
        let (coordinator, _invoker) = coordinator(TestInvoker::default());
        let id = coordinator
            .submit(vec![1, 2, 3], "m", options(1, 1))
            .await
            .expect("valid job");

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            coordinator.wait_for_completion(id, &token).await,
            Err(BatchError::Cancelled(id))
        );

        let result = wait(&coordinator, id).await;
        assert_eq!(outputs(&result), vec![Some(2), Some(4), Some(6)]);
    }

    #[tokio::test]
    async fn wait_timeout_elapses_on_a_stuck_job() {
        let (coordinator, _invoker) = coordinator(TestInvoker {
            hang_from: Some(0),
            ..TestInvoker::default()
        });
        let id = coordinator
            .submit(vec![1], "m", BatchOptions::default())
            .await
            .expect("valid job");

        let waited = coordinator
            .wait_timeout(id, Duration::from_millis(20))
            .await;
        assert_eq!(waited, Err(BatchError::Cancelled(id)));
        assert_eq!(
            coordinator.status(id).await.expect("known").state,
            JobState::Running
        );

        assert!(matches!(
            coordinator.remove(id).await,
            Err(BatchError::InvalidArgument(_))
        ));
        coordinator.cancel(id).await.expect("known job");
        let removed = coordinator.remove(id).await.expect("terminal job");
        assert_eq!(removed.summary.failed, 1);
        assert_eq!(
            coordinator.status(id).await,
            Err(BatchError::NotFound(id))
        );
    }

    #[tokio::test]
    async fn invalid_submissions_are_rejected() {
        let (coordinator, invoker) = coordinator(TestInvoker::default());
        let bad_retry = |policy: RetryPolicy| BatchOptions {
            retry: policy,
            ..BatchOptions::default()
        };

        let cases = [
            (Vec::new(), "m", BatchOptions::default()),
            (vec![1], "", BatchOptions::default()),
            (vec![1], "m", options(0, 1)),
            (vec![1], "m", options(1, 0)),
            (
                vec![1],
                "m",
                bad_retry(RetryPolicy::builder().max_attempts(0).build()),
            ),
            (
                vec![1],
                "m",
                bad_retry(
                    RetryPolicy::builder()
                        .initial_delay(Duration::from_secs(2))
                        .max_delay(Duration::from_secs(1))
                        .build(),
                ),
            ),
        ];

        for (items, model, options) in cases {
            let err = coordinator
                .submit(items, model, options)
                .await
                .expect_err("rejected");
            assert!(matches!(err, BatchError::InvalidArgument(_)), "{err}");
        }
        assert!(coordinator.jobs().await.is_empty());
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_job_ids_are_not_found() {
        let (coordinator, _invoker) = coordinator(TestInvoker::default());
        let id = JobId::new();

        assert_eq!(coordinator.status(id).await, Err(BatchError::NotFound(id)));
        assert_eq!(coordinator.cancel(id).await, Err(BatchError::NotFound(id)));
        assert_eq!(
            coordinator
                .wait_for_completion(id, &CancellationToken::new())
                .await,
            Err(BatchError::NotFound(id))
        );
        assert!(matches!(
            coordinator.remove(id).await,
            Err(BatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn jobs_lists_every_submission() {
        let (coordinator, _invoker) = coordinator(TestInvoker::default());
        let first = coordinator
            .submit(vec![1], "a", BatchOptions::default())
            .await
            .expect("valid job");
        let second = coordinator
            .submit(vec![2, 3], "b", BatchOptions::default())
            .await
            .expect("valid job");
        wait(&coordinator, first).await;
        wait(&coordinator, second).await;

        let mut jobs = coordinator.jobs().await;
        jobs.sort_by_key(|status| status.model.clone());
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, first);
        assert_eq!(jobs[1].total_items, 2);
        assert!(jobs.iter().all(|status| status.state == JobState::Completed));
    }
}
