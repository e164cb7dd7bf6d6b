//! Chunked, retrying dispatch of large work lists against a single endpoint.
//!
//! A [`BatchCoordinator`] splits the submitted items into chunks of
//! `chunk_size`, sends at most `max_concurrency` chunks at a time through an
//! [`EndpointInvoker`], retries transient failures with exponential backoff
//! and assembles a [`BatchResult`] ordered like the input.
//!
//! ```no_run
//! use mistral_ox::{Mistral, batch::{BatchCoordinator, BatchOptions}};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mistral = Mistral::load_from_env()?;
//! let coordinator = BatchCoordinator::new(mistral.embeddings_invoker());
//!
//! let texts: Vec<String> = (0..1000).map(|i| format!("document {i}")).collect();
//! let job = coordinator
//!     .submit(texts, "mistral-embed", BatchOptions::default())
//!     .await?;
//! let result = coordinator
//!     .wait_for_completion(job, &CancellationToken::new())
//!     .await?;
//! println!("{} of {} embedded", result.summary.succeeded, result.summary.total_requests);
//! # Ok(())
//! # }
//! ```

mod chunk;
mod coordinator;
mod error;
mod invoker;
mod job;
mod retry;

pub use coordinator::{BatchCoordinator, BatchOptions};
pub use error::BatchError;
pub use invoker::{
    ClassificationInvoker, EmbeddingsInvoker, EndpointInvoker, InvokeError, InvokeErrorKind,
    ModerationInvoker,
};
pub use job::{
    BatchResult, BatchSummary, ChunkFailure, FailureKind, ItemOutcome, JobId, JobState, JobStatus,
};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
