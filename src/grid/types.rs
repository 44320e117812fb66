//! Value types exchanged with the remote grid.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::config::TaskOptions;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier assigned by the grid to a submitted task.
    TaskId
);
string_id!(
    /// Identifier of a result slot (payload or output) stored by the grid.
    ResultId
);
string_id!(
    /// Identifier of a session grouping tasks on the grid.
    SessionId
);

/// Lifecycle of a result slot as reported by the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultStatus {
    Unspecified,
    Created,
    Completed,
    Aborted,
    NotFound,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultStatus::Unspecified => "Unspecified",
            ResultStatus::Created => "Created",
            ResultStatus::Completed => "Completed",
            ResultStatus::Aborted => "Aborted",
            ResultStatus::NotFound => "NotFound",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a task as reported by the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Unspecified,
    Creating,
    Submitted,
    Dispatched,
    Processing,
    Processed,
    Completed,
    Error,
    Timeout,
    Cancelling,
    Cancelled,
    Retried,
}

impl TaskStatus {
    pub fn is_cancelled(self) -> bool {
        matches!(self, TaskStatus::Cancelled | TaskStatus::Cancelling)
    }

    pub fn is_final(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Error
                | TaskStatus::Timeout
                | TaskStatus::Cancelled
                | TaskStatus::Retried
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Caller-facing outcome code attached to task-domain failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskTimeout,
    ResultReady,
    ResultNotReady,
    ResultError,
    Unknown,
}

impl From<TaskStatus> for StatusCode {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Submitted
            | TaskStatus::Dispatched
            | TaskStatus::Processing
            | TaskStatus::Creating => StatusCode::ResultNotReady,
            TaskStatus::Timeout => StatusCode::TaskTimeout,
            TaskStatus::Cancelled | TaskStatus::Cancelling => StatusCode::TaskCancelled,
            TaskStatus::Error | TaskStatus::Unspecified => StatusCode::TaskFailed,
            TaskStatus::Completed | TaskStatus::Processed => StatusCode::ResultReady,
            TaskStatus::Retried => StatusCode::Unknown,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One task of a `submit_tasks` call.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    /// Result slot holding the uploaded payload.
    pub payload_id: ResultId,
    /// Result slots the task waits on before it can run.
    pub dependencies: Vec<ResultId>,
    /// Result slot the task writes its output to.
    pub expected_output: ResultId,
    /// Per-task override of the session options.
    pub options: Option<TaskOptions>,
}

/// Assignment returned by the grid for a submitted task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub expected_output: ResultId,
    pub payload_id: ResultId,
}

/// Per-item outcome of a `submit_tasks` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCreation {
    Created(TaskInfo),
    Failed(String),
}

/// Output detail of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Ok,
    Error(String),
}

/// Frame of the chunked upload protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadFrame {
    Init {
        session_id: SessionId,
        result_id: ResultId,
    },
    Data(Bytes),
    Complete,
}

impl UploadFrame {
    /// Split `payload` into an `Init, Data*, Complete` frame sequence with data
    /// frames of at most `chunk_size` bytes.
    pub fn sequence(
        session_id: &SessionId,
        result_id: &ResultId,
        payload: &Bytes,
        chunk_size: usize,
    ) -> Vec<UploadFrame> {
        let chunk_size = chunk_size.max(1);
        let mut frames = Vec::with_capacity(payload.len() / chunk_size + 3);
        frames.push(UploadFrame::Init {
            session_id: session_id.clone(),
            result_id: result_id.clone(),
        });
        let mut offset = 0;
        while offset < payload.len() {
            let end = (offset + chunk_size).min(payload.len());
            frames.push(UploadFrame::Data(payload.slice(offset..end)));
            offset = end;
        }
        frames.push(UploadFrame::Complete);
        frames
    }
}

/// Static limits published by the grid, fetched once per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfiguration {
    pub data_chunk_max_size: usize,
}

/// Counts per task status returned by the long-poll wait.
pub type StatusCounts = HashMap<TaskStatus, usize>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_lookup() {
        assert_eq!(StatusCode::from(TaskStatus::Processing), StatusCode::ResultNotReady);
        assert_eq!(StatusCode::from(TaskStatus::Timeout), StatusCode::TaskTimeout);
        assert_eq!(StatusCode::from(TaskStatus::Cancelling), StatusCode::TaskCancelled);
        assert_eq!(StatusCode::from(TaskStatus::Unspecified), StatusCode::TaskFailed);
        assert_eq!(StatusCode::from(TaskStatus::Processed), StatusCode::ResultReady);
        assert_eq!(StatusCode::from(TaskStatus::Retried), StatusCode::Unknown);
    }

    #[test]
    fn test_upload_frames_cover_payload() {
        let payload = Bytes::from(vec![7u8; 10]);
        let frames =
            UploadFrame::sequence(&"s".into(), &"r".into(), &payload, 4);

        assert_eq!(frames.len(), 5);
        assert!(matches!(frames[0], UploadFrame::Init { .. }));
        assert_eq!(frames.last(), Some(&UploadFrame::Complete));
        let sizes: Vec<usize> = frames
            .iter()
            .filter_map(|f| match f {
                UploadFrame::Data(chunk) => Some(chunk.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_empty_payload_has_no_data_frames() {
        let frames = UploadFrame::sequence(&"s".into(), &"r".into(), &Bytes::new(), 1024);
        assert_eq!(frames.len(), 2);
    }
}
