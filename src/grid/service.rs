//! The remote call contract of the grid.
//!
//! Implementations translate each call into their wire protocol. Errors are
//! reported as [`tonic::Status`] so the retry layer can classify them by code.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use tonic::Status;

use crate::config::TaskOptions;
use crate::grid::types::{
    ResultId, ResultStatus, ServiceConfiguration, SessionId, StatusCounts, TaskCreation,
    TaskDefinition, TaskId, TaskOutput, TaskStatus, UploadFrame,
};
use crate::pool::Connection;

/// Client side of the grid control plane.
///
/// Every call borrows a connection leased from the pool for its duration.
#[async_trait]
pub trait GridService: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a session that groups tasks and results.
    async fn create_session(
        &self,
        conn: &Self::Connection,
        options: &TaskOptions,
        partitions: &[String],
    ) -> Result<SessionId, Status>;

    /// Limits published by the grid.
    async fn service_configuration(
        &self,
        conn: &Self::Connection,
    ) -> Result<ServiceConfiguration, Status>;

    /// Reserve result slots. Returns `name -> id`.
    async fn create_results_metadata(
        &self,
        conn: &Self::Connection,
        session_id: &SessionId,
        names: &[String],
    ) -> Result<HashMap<String, ResultId>, Status>;

    /// Store the whole content of a result slot in one call.
    async fn upload_result_data(
        &self,
        conn: &Self::Connection,
        session_id: &SessionId,
        result_id: &ResultId,
        data: Bytes,
    ) -> Result<(), Status>;

    /// Store a result slot through `Init, Data*, Complete` frames.
    async fn upload_result_stream(
        &self,
        conn: &Self::Connection,
        frames: BoxStream<'static, UploadFrame>,
    ) -> Result<(), Status>;

    /// Create tasks. The reply holds one entry per definition, in order.
    ///
    /// `submission_token` is stable across retries of the same chunk.
    async fn submit_tasks(
        &self,
        conn: &Self::Connection,
        session_id: &SessionId,
        tasks: Vec<TaskDefinition>,
        options: &TaskOptions,
        submission_token: &str,
    ) -> Result<Vec<TaskCreation>, Status>;

    /// Status of result slots. Unknown ids may be absent from the reply.
    async fn get_result_status(
        &self,
        conn: &Self::Connection,
        session_id: &SessionId,
        result_ids: &[ResultId],
    ) -> Result<Vec<(ResultId, ResultStatus)>, Status>;

    async fn download_result_data(
        &self,
        conn: &Self::Connection,
        session_id: &SessionId,
        result_id: &ResultId,
    ) -> Result<Bytes, Status>;

    async fn get_task_status(
        &self,
        conn: &Self::Connection,
        task_ids: &[TaskId],
    ) -> Result<Vec<(TaskId, TaskStatus)>, Status>;

    async fn get_task_output(
        &self,
        conn: &Self::Connection,
        session_id: &SessionId,
        task_id: &TaskId,
    ) -> Result<TaskOutput, Status>;

    /// Long-poll until every filtered task is final, or until the first
    /// cancellation or error when asked to stop there.
    async fn wait_for_completion(
        &self,
        conn: &Self::Connection,
        session_id: &SessionId,
        filter: &[TaskId],
        stop_on_first_cancel: bool,
        stop_on_first_error: bool,
    ) -> Result<StatusCounts, Status>;
}
