use thiserror::Error;

use super::job::JobId;

/// Errors returned by coordinator operations.
///
/// Endpoint failures never surface here; they are recorded per item in the
/// job's [`BatchResult`](super::BatchResult).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("batch job {0} not found")]
    NotFound(JobId),

    #[error("waiting for batch job {0} was cancelled")]
    Cancelled(JobId),

    #[error("batch job {0} stopped without producing a result")]
    JobAborted(JobId),
}
