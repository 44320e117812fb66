//! Error types for the grid dispatch runtime.
//!
//! This module provides a centralized error type built with `thiserror`. Transport,
//! configuration, pipeline and task-domain failures all surface through [`GridError`],
//! and the retry layer classifies them by variant.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tonic::Status as TonicStatus;

use crate::grid::types::{StatusCode, TaskId};

/// Primary error type for the runtime, covering all possible error cases.
#[derive(Debug, Error)]
pub enum GridError {
    /// A remote call returned a non-OK status.
    #[error("Remote call failed: {0}")]
    Rpc(#[from] TonicStatus),

    /// Errors from the underlying IO system.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The connection factory could not produce a connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeouts in various operations.
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// Errors from invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The remote side rejected part of a submission.
    #[error("Submission rejected: {0}")]
    Submission(String),

    /// A whole chunk failed; every request of the chunk carries the same cause.
    #[error("Chunk submission failed: {0}")]
    ChunkFailed(Arc<GridError>),

    /// The retry budget was spent without an accepted outcome.
    #[error("Call to {operation} failed the retry policy after {attempts} attempt(s): {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<GridError>,
    },

    /// The result predicate refused a value returned by an operation.
    #[error("Result of {0} was rejected")]
    ResultRejected(String),

    /// A task reached a terminal error state on the grid.
    #[error(transparent)]
    Invocation(#[from] ServiceInvocationError),

    /// The operation was cancelled through its token.
    #[error("Operation cancelled")]
    Cancelled,

    /// The submission pipeline is closed or dropped its request.
    #[error("Submission pipeline is closed")]
    PipelineClosed,

    /// Internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<figment::Error> for GridError {
    fn from(err: figment::Error) -> Self {
        GridError::Configuration(format!("Failed to load configuration: {}", err))
    }
}

impl GridError {
    /// The innermost cause, looking through chunk and retry wrappers.
    pub fn root_cause(&self) -> &GridError {
        match self {
            GridError::ChunkFailed(inner) => inner.root_cause(),
            GridError::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Structured task-domain failure delivered to `on_error` handlers and to
/// blocking callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Task {task_id} ended with {status}: {details}")]
pub struct ServiceInvocationError {
    pub task_id: TaskId,
    pub status: StatusCode,
    pub details: String,
}

impl ServiceInvocationError {
    pub fn new(task_id: TaskId, status: StatusCode, details: impl Into<String>) -> Self {
        Self {
            task_id,
            status,
            details: details.into(),
        }
    }
}

/// Convenience type alias for Results with GridError.
pub type Result<T> = std::result::Result<T, GridError>;

/// Run a fallible future under a deadline, mapping elapsed time to
/// [`GridError::Timeout`].
pub async fn with_timeout<T, F>(
    operation: F,
    timeout_duration: Duration,
    context: &'static str,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout_duration, operation).await {
        Ok(result) => result,
        Err(_) => Err(GridError::Timeout(format!(
            "{}: operation timed out after {:?}",
            context, timeout_duration
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_wrappers() {
        let inner = GridError::Rpc(TonicStatus::unavailable("down"));
        let exhausted = GridError::RetryExhausted {
            operation: "submit_tasks".to_string(),
            attempts: 3,
            source: Box::new(inner),
        };
        let chunk = GridError::ChunkFailed(Arc::new(exhausted));

        match chunk.root_cause() {
            GridError::Rpc(status) => assert_eq!(status.code(), tonic::Code::Unavailable),
            other => panic!("unexpected root cause: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_reports_elapsed() {
        let result: Result<()> = with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_secs(1),
            "status query",
        )
        .await;

        assert!(matches!(result, Err(GridError::Timeout(_))));
    }
}
