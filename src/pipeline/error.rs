use thiserror::Error;

/// Errors surfaced by the queue, job store and split/join coordinator.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] serde_json::Error),

    #[error("Task not registered: {0}")]
    TaskNotFound(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Invalid state for {job}: expected {expected}, got {actual}")]
    InvalidState {
        job: String,
        expected: String,
        actual: String,
    },
}

impl JobError {
    pub(crate) fn invalid_state(
        job: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        JobError::InvalidState {
            job: job.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}
