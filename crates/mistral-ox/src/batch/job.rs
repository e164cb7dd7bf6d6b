use std::{fmt, str::FromStr, sync::Arc};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identifier of a coordinator job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[display("pending")]
    Pending,
    #[display("running")]
    Running,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
    #[display("cancelled")]
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Point-in-time view of a job. Chunk counters always add up to `total_chunks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub model: String,
    pub state: JobState,
    pub total_items: usize,
    pub total_chunks: usize,
    pub pending_chunks: usize,
    pub running_chunks: usize,
    pub succeeded_chunks: usize,
    pub failed_chunks: usize,
}

impl JobStatus {
    pub(crate) fn new(id: JobId, model: String, total_items: usize, total_chunks: usize) -> Self {
        Self {
            id,
            model,
            state: JobState::Pending,
            total_items,
            total_chunks,
            pending_chunks: total_chunks,
            running_chunks: 0,
            succeeded_chunks: 0,
            failed_chunks: 0,
        }
    }

    pub fn finished_chunks(&self) -> usize {
        self.succeeded_chunks + self.failed_chunks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retries exhausted on transient errors
    #[display("transient")]
    Transient,
    /// Rejected without retry
    #[display("permanent")]
    Permanent,
    /// Never finished because the job was cancelled or aborted
    #[display("cancelled")]
    Cancelled,
}

/// Why a chunk failed; shared by every item of that chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

impl fmt::Display for ChunkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk {} {} after {} attempt(s): {}",
            self.chunk_index, self.kind, self.attempts, self.message
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome<O> {
    Success(O),
    Failure(ChunkFailure),
}

impl<O> ItemOutcome<O> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn output(&self) -> Option<&O> {
        match self {
            Self::Success(output) => Some(output),
            Self::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&ChunkFailure> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_requests: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Per-item outcomes of a finished job, indexed by original input position.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult<O> {
    pub items: Vec<ItemOutcome<O>>,
    pub summary: BatchSummary,
}

impl<O> BatchResult<O> {
    pub(crate) fn from_items(items: Vec<ItemOutcome<O>>) -> Self {
        let succeeded = items.iter().filter(|item| item.is_success()).count();
        let summary = BatchSummary {
            total_requests: items.len(),
            succeeded,
            failed: items.len() - succeeded,
        };
        Self { items, summary }
    }

    pub fn is_complete_success(&self) -> bool {
        self.summary.failed == 0
    }

    /// Successful outputs with their original positions.
    pub fn successes(&self) -> impl Iterator<Item = (usize, &O)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.output().map(|output| (i, output)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &ChunkFailure)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.failure().map(|failure| (i, failure)))
    }
}

/// Value published on a job's watch channel.
#[derive(Debug)]
pub(crate) struct JobProgress<O> {
    pub(crate) status: JobStatus,
    pub(crate) result: Option<Arc<BatchResult<O>>>,
}

/// Registry entry. The driver task owns the sending half of `progress`;
/// once it is gone the last published value stays readable.
#[derive(Debug)]
pub(crate) struct BatchJob<O> {
    pub(crate) id: JobId,
    pub(crate) cancel: CancellationToken,
    pub(crate) progress: watch::Receiver<JobProgress<O>>,
}

impl<O> BatchJob<O> {
    pub(crate) fn status(&self) -> JobStatus {
        self.progress.borrow().status.clone()
    }

    pub(crate) fn result(&self) -> Option<Arc<BatchResult<O>>> {
        self.progress.borrow().result.clone()
    }
}
