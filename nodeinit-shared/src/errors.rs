//! Crate-wide error type.
//!
//! Stage-level failures (timeouts, malformed responses, rejections) are not
//! errors in this sense: the engine absorbs them through retry and backoff.
//! `NodeinitError` covers API misuse, storage and configuration problems.

use thiserror::Error;

pub type NodeinitResult<T> = Result<T, NodeinitError>;

#[derive(Debug, Error)]
pub enum NodeinitError {
    /// Invariant broken inside the engine.
    #[error("internal error: {0}")]
    Internal(String),

    /// No session or record exists for the requested node.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation is not valid in the node's current mode.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Options or catalog failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    /// The node was excluded while the operation was waiting.
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        let err: NodeinitError = std::io::Error::other("disk gone").into();
        assert!(matches!(err, NodeinitError::Io(_)));
        assert_eq!(err.to_string(), "io error: disk gone");
    }

    #[test]
    fn display_includes_context() {
        let err = NodeinitError::InvalidState("node 5 is Initializing".into());
        assert_eq!(err.to_string(), "invalid state: node 5 is Initializing");
    }
}
