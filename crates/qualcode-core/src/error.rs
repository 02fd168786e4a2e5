//! Error taxonomy for coding and consolidation.

use thiserror::Error;

/// Errors raised while scheduling chunks through an oracle.
///
/// [`InvalidResponse`](CodingError::InvalidResponse),
/// [`NoProgress`](CodingError::NoProgress) and
/// [`Oracle`](CodingError::Oracle) are recovered locally by the
/// [`ChunkScheduler`](crate::scheduler::ChunkScheduler) until its retry
/// budget runs out. Everything else is fatal for the run.
#[derive(Debug, Error)]
pub enum CodingError {
    /// Oracle output was malformed or incomplete.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A chunk reported zero or negative net progress.
    #[error("no progress: chunk of {size} item(s) reported cursor delta {delta}")]
    NoProgress { size: usize, delta: isize },

    /// The oracle transport failed.
    #[error("oracle failure: {0}")]
    Oracle(#[from] anyhow::Error),

    /// A structural precondition was violated before scheduling.
    #[error("configuration error: {0}")]
    Config(String),

    /// Persisting intermediate state failed.
    #[error("checkpoint failed: {0}")]
    Checkpoint(String),

    /// A chunk kept failing past the retry budget.
    #[error("chunk at cursor {cursor} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        cursor: usize,
        attempts: usize,
        #[source]
        source: Box<CodingError>,
    },
}

impl CodingError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        CodingError::InvalidResponse(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CodingError::Config(msg.into())
    }

    /// Whether the scheduler may retry the chunk after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CodingError::InvalidResponse(_) | CodingError::NoProgress { .. } | CodingError::Oracle(_)
        )
    }
}
