//! Stage execution results and the stage-level failure taxonomy.

use crate::catalog::Stage;
use thiserror::Error;

/// Why a stage did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("transport timeout after {timeout_ms}ms")]
    TransportTimeout { timeout_ms: u64 },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("node busy")]
    NodeBusy,

    #[error("node rejected request: {0}")]
    NodeRejected(String),

    #[error("controller lists node as failed")]
    ControllerMarkedFailed,

    #[error("change not confirmed: {0}")]
    Unconfirmed(String),

    /// Data from an earlier stage this stage depends on is absent.
    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error("{stage} exhausted {attempts} attempts, last error: {last}")]
    RetryBudgetExhausted {
        stage: Stage,
        attempts: u32,
        last: Box<FailureReason>,
    },

    #[error("persistence write failed: {0}")]
    PersistenceWriteFailure(String),

    /// Administrative force-fail.
    #[error("forced: {0}")]
    Forced(String),

    /// A failure read back from the store after a restart.
    #[error("{0}")]
    Recorded(String),
}

/// Result of one stage execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Stage completed; captured data is stored under the stage's key.
    Success(Option<Vec<u8>>),
    /// Transient problem, retry with backoff.
    Retryable(FailureReason),
    /// Retrying cannot help.
    PermanentFailure(FailureReason),
    /// Node busy or ack pending. Shares the retry budget and backoff track.
    Timeout(FailureReason),
}

impl ExecutionResult {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionResult::Success(_) => "success",
            ExecutionResult::Retryable(_) => "retryable",
            ExecutionResult::PermanentFailure(_) => "permanent_failure",
            ExecutionResult::Timeout(_) => "timeout",
        }
    }
}
