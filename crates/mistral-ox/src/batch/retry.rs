use std::{any::Any, panic::AssertUnwindSafe, time::Duration};

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use bon::Builder;
use futures_util::FutureExt;

use super::{
    chunk::Chunk,
    invoker::{EndpointInvoker, InvokeError, InvokeErrorKind},
    job::{ChunkFailure, FailureKind, JobId},
};

/// Bounded exponential backoff for transient chunk failures.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct RetryPolicy {
    /// Total attempts per chunk, including the first
    #[builder(default = 3)]
    pub max_attempts: u32,
    #[builder(default = Duration::from_millis(500))]
    pub initial_delay: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.initial_delay > self.max_delay {
            return Err(format!(
                "initial_delay ({:?}) exceeds max_delay ({:?})",
                self.initial_delay, self.max_delay
            ));
        }
        Ok(())
    }

    /// Delays between attempts: `initial_delay * 2^n`, capped at `max_delay`,
    /// `max_attempts - 1` of them.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> + Send + use<> {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .build()
    }
}

/// Delay seam so retry timing can be observed in tests.
#[async_trait]
pub trait Sleeper: Send + Sync + 'static {
    async fn sleep(&self, delay: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Outcome of one chunk after its retry loop.
#[derive(Debug)]
pub(crate) enum ChunkOutcome<O> {
    Success(Vec<O>),
    Failure(ChunkFailure),
}

enum ChunkState<O> {
    Pending,
    Attempting,
    BackoffWait { delay: Duration, cause: InvokeError },
    Succeeded(Vec<O>),
    Failed(ChunkFailure),
}

/// Drives one chunk through
/// `Pending -> Attempting -> (Succeeded | BackoffWait -> Attempting | Failed)`.
pub(crate) async fn run_chunk<V: EndpointInvoker>(
    invoker: &V,
    sleeper: &dyn Sleeper,
    job_id: JobId,
    model: &str,
    chunk: &Chunk<V::Item>,
    policy: &RetryPolicy,
) -> ChunkOutcome<V::Output> {
    let mut delays = policy.backoff();
    let mut attempts = 0u32;
    let mut state = ChunkState::Pending;

    loop {
        state = match state {
            ChunkState::Pending => ChunkState::Attempting,
            ChunkState::Attempting => {
                attempts += 1;
                tracing::debug!(
                    %job_id,
                    chunk = chunk.index,
                    attempt = attempts,
                    items = chunk.len(),
                    "dispatching chunk"
                );
                match invoke_checked(invoker, model, chunk).await {
                    Ok(outputs) => ChunkState::Succeeded(outputs),
                    Err(err) if err.kind == InvokeErrorKind::Transient => match delays.next() {
                        Some(computed) => {
                            // A hint can lengthen the wait, never shorten it.
                            let delay = err.retry_after.map_or(computed, |hint| {
                                hint.max(computed).min(policy.max_delay)
                            });
                            ChunkState::BackoffWait { delay, cause: err }
                        }
                        None => ChunkState::Failed(failure(
                            chunk,
                            FailureKind::Transient,
                            err,
                            attempts,
                        )),
                    },
                    Err(err) => {
                        ChunkState::Failed(failure(chunk, FailureKind::Permanent, err, attempts))
                    }
                }
            }
            ChunkState::BackoffWait { delay, cause } => {
                tracing::warn!(
                    %job_id,
                    chunk = chunk.index,
                    attempt = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %cause,
                    "transient chunk failure, backing off"
                );
                sleeper.sleep(delay).await;
                ChunkState::Attempting
            }
            ChunkState::Succeeded(outputs) => return ChunkOutcome::Success(outputs),
            ChunkState::Failed(failure) => {
                tracing::warn!(%job_id, chunk = chunk.index, %failure, "chunk failed");
                return ChunkOutcome::Failure(failure);
            }
        };
    }
}

async fn invoke_checked<V: EndpointInvoker>(
    invoker: &V,
    model: &str,
    chunk: &Chunk<V::Item>,
) -> Result<Vec<V::Output>, InvokeError> {
    let outputs = AssertUnwindSafe(invoker.invoke(model, &chunk.items))
        .catch_unwind()
        .await
        .map_err(|panic| {
            InvokeError::permanent(format!("invoker panicked: {}", panic_message(&*panic)))
        })??;
    if outputs.len() == chunk.len() {
        Ok(outputs)
    } else {
        Err(InvokeError::permanent(format!(
            "expected {} outputs, endpoint returned {}",
            chunk.len(),
            outputs.len()
        )))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

fn failure<I>(
    chunk: &Chunk<I>,
    kind: FailureKind,
    err: InvokeError,
    attempts: u32,
) -> ChunkFailure {
    ChunkFailure {
        chunk_index: chunk.index,
        kind,
        message: err.message,
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Arc, Mutex,
            atomic::{AtomicU32, Ordering},
        },
    };

    use super::*;

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, delay: Duration) {
            self.delays.lock().expect("lock").push(delay);
        }
    }

    /// Replays scripted results, then succeeds.
    struct ScriptedInvoker {
        script: Mutex<VecDeque<InvokeError>>,
        calls: AtomicU32,
        short_by: usize,
    }

    impl ScriptedInvoker {
        fn new(errors: impl IntoIterator<Item = InvokeError>) -> Self {
            Self {
                script: Mutex::new(errors.into_iter().collect()),
                calls: AtomicU32::new(0),
                short_by: 0,
            }
        }
    }

    #[async_trait]
    impl EndpointInvoker for ScriptedInvoker {
        type Item = u32;
        type Output = u32;

        async fn invoke(&self, _model: &str, items: &[u32]) -> Result<Vec<u32>, InvokeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.script.lock().expect("lock").pop_front() {
                return Err(err);
            }
            Ok(items.iter().skip(self.short_by).map(|n| n * 10).collect())
        }
    }

    fn chunk() -> Chunk<u32> {
        Chunk {
            index: 2,
            offset: 6,
            items: vec![1, 2, 3],
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .initial_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(25))
            .build()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let delays: Vec<_> = policy(4).backoff().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(25)
            ]
        );
        assert_eq!(policy(1).backoff().count(), 0);
    }

    #[test]
    fn validation_rejects_bad_policies() {
        assert!(policy(0).validate().is_err());
        let inverted = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(5))
            .max_delay(Duration::from_secs(1))
            .build();
        assert!(inverted.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let invoker = ScriptedInvoker::new([
            InvokeError::transient("503"),
            InvokeError::transient("503"),
        ]);
        let sleeper = RecordingSleeper::default();

        let outcome = run_chunk(&invoker, &sleeper, JobId::new(), "m", &chunk(), &policy(3)).await;

        match outcome {
            ChunkOutcome::Success(outputs) => assert_eq!(outputs, vec![10, 20, 30]),
            ChunkOutcome::Failure(f) => panic!("unexpected failure: {f}"),
        }
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *sleeper.delays.lock().expect("lock"),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[tokio::test]
    async fn transient_failure_exhausts_attempts() {
        let invoker = ScriptedInvoker::new((0..5).map(|_| InvokeError::transient("timeout")));
        let sleeper = RecordingSleeper::default();

        let outcome = run_chunk(&invoker, &sleeper, JobId::new(), "m", &chunk(), &policy(2)).await;

        let ChunkOutcome::Failure(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::Transient);
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.chunk_index, 2);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sleeper.delays.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_uses_one_attempt() {
        let invoker = ScriptedInvoker::new([InvokeError::permanent("400 bad request")]);
        let sleeper = RecordingSleeper::default();

        let outcome = run_chunk(&invoker, &sleeper, JobId::new(), "m", &chunk(), &policy(5)).await;

        let ChunkOutcome::Failure(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.message, "400 bad request");
        assert!(sleeper.delays.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn retry_after_hint_lengthens_and_is_capped() {
        let invoker = ScriptedInvoker::new([
            InvokeError::transient("429").with_retry_after(Duration::from_millis(15)),
            InvokeError::transient("429").with_retry_after(Duration::from_secs(60)),
        ]);
        let sleeper = Arc::new(RecordingSleeper::default());

        let outcome =
            run_chunk(&invoker, sleeper.as_ref(), JobId::new(), "m", &chunk(), &policy(3)).await;

        assert!(matches!(outcome, ChunkOutcome::Success(_)));
        assert_eq!(
            *sleeper.delays.lock().expect("lock"),
            vec![Duration::from_millis(15), Duration::from_millis(25)]
        );
    }

    #[tokio::test]
    async fn short_retry_after_hint_keeps_the_computed_backoff() {
        let invoker = ScriptedInvoker::new([
            InvokeError::transient("429").with_retry_after(Duration::ZERO),
            InvokeError::transient("429").with_retry_after(Duration::from_millis(5)),
        ]);
        let sleeper = RecordingSleeper::default();

        let outcome = run_chunk(&invoker, &sleeper, JobId::new(), "m", &chunk(), &policy(3)).await;

        assert!(matches!(outcome, ChunkOutcome::Success(_)));
        assert_eq!(
            *sleeper.delays.lock().expect("lock"),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    struct PanickingInvoker;

    #[async_trait]
    impl EndpointInvoker for PanickingInvoker {
        type Item = u32;
        type Output = u32;

        async fn invoke(&self, _model: &str, _items: &[u32]) -> Result<Vec<u32>, InvokeError> {
            panic!("connection pool poisoned")
        }
    }

    #[tokio::test]
    async fn invoker_panic_is_a_permanent_failure() {
        let sleeper = RecordingSleeper::default();

        let outcome =
            run_chunk(&PanickingInvoker, &sleeper, JobId::new(), "m", &chunk(), &policy(3)).await;

        let ChunkOutcome::Failure(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.message, "invoker panicked: connection pool poisoned");
        assert!(sleeper.delays.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn short_output_is_a_permanent_failure() {
        let mut invoker = ScriptedInvoker::new([]);
        invoker.short_by = 1;
        let sleeper = RecordingSleeper::default();

        let outcome = run_chunk(&invoker, &sleeper, JobId::new(), "m", &chunk(), &policy(3)).await;

        let ChunkOutcome::Failure(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::Permanent);
        assert_eq!(failure.attempts, 1);
        assert!(failure.message.contains("expected 3 outputs"));
    }
}
