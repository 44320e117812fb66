//! Grid client with pooled connections and uniform retry.
//!
//! Every method leases a connection from the pool per attempt and runs under the
//! client's [`RetryExecutor`]. A call failing with `Unavailable`, or outliving
//! the request timeout, marks its connection as failed so the pool discards it.

use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::{debug, instrument, warn};

use crate::config::{timeouts, ClientConfig, TaskOptions};
use crate::error::{with_timeout, GridError, Result};
use crate::grid::service::GridService;
use crate::grid::types::{
    ResultId, ResultStatus, ServiceConfiguration, SessionId, StatusCounts, TaskCreation,
    TaskDefinition, TaskId, TaskInfo, TaskOutput, TaskStatus, UploadFrame,
};
use crate::pool::{Connection, ConnectionFactory, ConnectionPool, PooledConnection};
use crate::retry::{classify_error, RetryExecutor, RetryPolicy};

/// Pass a call outcome through, flagging the connection on transport failure.
fn observe<C: Connection, T>(
    conn: &PooledConnection<C>,
    outcome: std::result::Result<T, Status>,
) -> Result<T> {
    outcome.map_err(|status| {
        if status.code() == Code::Unavailable {
            conn.report_failure();
        }
        GridError::Rpc(status)
    })
}

/// Retry hook for calls the grid may apply twice.
fn warn_duplicate(operation: &'static str) -> impl FnMut(u32, &GridError) {
    move |attempt: u32, error: &GridError| {
        warn!(
            operation,
            attempt,
            error = %error,
            "Retrying a non-idempotent call; the grid may keep a duplicate if the failed attempt was applied"
        );
    }
}

/// Retrying client over a [`GridService`].
pub struct GridClient<S: GridService> {
    service: Arc<S>,
    pool: ConnectionPool<S::Connection>,
    retry: RetryExecutor,
    service_config: OnceCell<ServiceConfiguration>,
    upload_chunk_size: Option<usize>,
    request_timeout: Duration,
}

impl<S: GridService> GridClient<S> {
    pub fn new(
        service: Arc<S>,
        factory: Arc<dyn ConnectionFactory<S::Connection>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            service,
            pool: ConnectionPool::new(factory),
            retry: RetryExecutor::new(policy),
            service_config: OnceCell::new(),
            upload_chunk_size: None,
            request_timeout: timeouts::REQUEST_TIMEOUT,
        }
    }

    /// Deadline applied to each remote call except the completion long-poll.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build a client using the retry and upload settings of `config`.
    pub fn from_config(
        service: Arc<S>,
        factory: Arc<dyn ConnectionFactory<S::Connection>>,
        config: &ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut client = Self::new(service, factory, config.retry_policy())
            .with_request_timeout(config.request_timeout);
        client.upload_chunk_size = config.upload_chunk_size;
        Ok(client)
    }

    /// Await one call under the request deadline. A call that outlives it
    /// leaves its connection marked as failed.
    async fn timed<T, F>(
        &self,
        conn: &PooledConnection<S::Connection>,
        operation: &'static str,
        call: F,
    ) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, Status>>,
    {
        let outcome =
            with_timeout(async { observe(conn, call.await) }, self.request_timeout, operation)
                .await;
        if matches!(outcome, Err(GridError::Timeout(_))) {
            conn.report_failure();
        }
        outcome
    }

    pub fn pool(&self) -> &ConnectionPool<S::Connection> {
        &self.pool
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    #[instrument(skip_all, fields(partitions = partitions.len()))]
    pub async fn create_session(
        &self,
        options: &TaskOptions,
        partitions: &[String],
        cancel: &CancellationToken,
    ) -> Result<SessionId> {
        let session_id = self
            .retry
            .execute("create_session", cancel, |_| async move {
                let conn = self.pool.acquire().await?;
                self.timed(
                    &conn,
                    "create_session",
                    self.service.create_session(&conn, options, partitions),
                )
                .await
            })
            .await?;
        debug!(session = %session_id, "Session created");
        Ok(session_id)
    }

    /// Grid limits, fetched on first use and cached for the client's life.
    pub async fn service_configuration(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ServiceConfiguration> {
        let config = self
            .service_config
            .get_or_try_init(|| async {
                self.retry
                    .execute("service_configuration", cancel, |_| async move {
                        let conn = self.pool.acquire().await?;
                        self.timed(
                            &conn,
                            "service_configuration",
                            self.service.service_configuration(&conn),
                        )
                        .await
                    })
                    .await
            })
            .await?;
        Ok(*config)
    }

    /// Reserve result slots, one per name.
    #[instrument(skip_all, fields(session = %session_id, count = names.len()))]
    pub async fn create_results_metadata(
        &self,
        session_id: &SessionId,
        names: &[String],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, ResultId>> {
        let created = self
            .retry
            .execute("create_results_metadata", cancel, |_| async move {
                let conn = self.pool.acquire().await?;
                self.timed(
                    &conn,
                    "create_results_metadata",
                    self.service.create_results_metadata(&conn, session_id, names),
                )
                .await
            })
            .await?;

        if let Some(missing) = names.iter().find(|name| !created.contains_key(*name)) {
            return Err(GridError::Submission(format!(
                "No result id returned for {}",
                missing
            )));
        }
        Ok(created)
    }

    pub async fn upload_result_data(
        &self,
        session_id: &SessionId,
        result_id: &ResultId,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let data = &data;
        self.retry
            .execute_observed(
                "upload_result_data",
                cancel,
                classify_error,
                |_: &()| true,
                warn_duplicate("upload_result_data"),
                |_| async move {
                    let conn = self.pool.acquire().await?;
                    self.timed(
                        &conn,
                        "upload_result_data",
                        self.service.upload_result_data(&conn, session_id, result_id, data.clone()),
                    )
                    .await
                },
            )
            .await
    }

    /// Upload through `Init, Data*, Complete` frames sized by the grid's limit.
    pub async fn upload_result_stream(
        &self,
        session_id: &SessionId,
        result_id: &ResultId,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let chunk_size = match self.upload_chunk_size {
            Some(size) => size,
            None => self.service_configuration(cancel).await?.data_chunk_max_size,
        };
        let data = &data;
        debug!(result = %result_id, bytes = data.len(), chunk_size, "Streaming payload upload");

        self.retry
            .execute_observed(
                "upload_result_stream",
                cancel,
                classify_error,
                |_: &()| true,
                warn_duplicate("upload_result_stream"),
                |_| async move {
                    let frames = UploadFrame::sequence(session_id, result_id, data, chunk_size);
                    let conn = self.pool.acquire().await?;
                    self.timed(
                        &conn,
                        "upload_result_stream",
                        self.service
                            .upload_result_stream(&conn, futures::stream::iter(frames).boxed()),
                    )
                    .await
                },
            )
            .await
    }

    /// Upload inline, or through the stream when `data` exceeds `threshold`.
    pub async fn upload_payload(
        &self,
        session_id: &SessionId,
        result_id: &ResultId,
        data: Bytes,
        threshold: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if data.len() > threshold {
            self.upload_result_stream(session_id, result_id, data, cancel)
                .await
        } else {
            self.upload_result_data(session_id, result_id, data, cancel)
                .await
        }
    }

    /// Create tasks. Either every definition gets a task or the call fails.
    #[instrument(skip_all, fields(session = %session_id, count = tasks.len(), token = submission_token))]
    pub async fn submit_tasks(
        &self,
        session_id: &SessionId,
        tasks: Vec<TaskDefinition>,
        options: &TaskOptions,
        submission_token: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<TaskInfo>> {
        let expected = tasks.len();
        let tasks = &tasks;
        let replies = self
            .retry
            .execute_observed(
                "submit_tasks",
                cancel,
                classify_error,
                |_: &Vec<TaskCreation>| true,
                warn_duplicate("submit_tasks"),
                |_| async move {
                    let conn = self.pool.acquire().await?;
                    self.timed(
                        &conn,
                        "submit_tasks",
                        self.service.submit_tasks(
                            &conn,
                            session_id,
                            tasks.clone(),
                            options,
                            submission_token,
                        ),
                    )
                    .await
                },
            )
            .await?;

        if replies.len() != expected {
            return Err(GridError::Submission(format!(
                "Expected {} task creations, received {}",
                expected,
                replies.len()
            )));
        }

        let mut infos = Vec::with_capacity(expected);
        let mut failures = Vec::new();
        for reply in replies {
            match reply {
                TaskCreation::Created(info) => infos.push(info),
                TaskCreation::Failed(message) => failures.push(message),
            }
        }
        if !failures.is_empty() {
            return Err(GridError::Submission(failures.join("; ")));
        }
        Ok(infos)
    }

    pub async fn get_result_status(
        &self,
        session_id: &SessionId,
        result_ids: &[ResultId],
        cancel: &CancellationToken,
    ) -> Result<Vec<(ResultId, ResultStatus)>> {
        self.retry
            .execute("get_result_status", cancel, |_| async move {
                let conn = self.pool.acquire().await?;
                self.timed(
                    &conn,
                    "get_result_status",
                    self.service.get_result_status(&conn, session_id, result_ids),
                )
                .await
            })
            .await
    }

    pub async fn download_result_data(
        &self,
        session_id: &SessionId,
        result_id: &ResultId,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        self.retry
            .execute("download_result_data", cancel, |_| async move {
                let conn = self.pool.acquire().await?;
                self.timed(
                    &conn,
                    "download_result_data",
                    self.service.download_result_data(&conn, session_id, result_id),
                )
                .await
            })
            .await
    }

    pub async fn get_task_status(
        &self,
        task_ids: &[TaskId],
        cancel: &CancellationToken,
    ) -> Result<Vec<(TaskId, TaskStatus)>> {
        self.retry
            .execute("get_task_status", cancel, |_| async move {
                let conn = self.pool.acquire().await?;
                self.timed(
                    &conn,
                    "get_task_status",
                    self.service.get_task_status(&conn, task_ids),
                )
                .await
            })
            .await
    }

    pub async fn get_task_output(
        &self,
        session_id: &SessionId,
        task_id: &TaskId,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput> {
        self.retry
            .execute("get_task_output", cancel, |_| async move {
                let conn = self.pool.acquire().await?;
                self.timed(
                    &conn,
                    "get_task_output",
                    self.service.get_task_output(&conn, session_id, task_id),
                )
                .await
            })
            .await
    }

    /// Long-poll until the filtered tasks are final.
    #[instrument(skip_all, fields(session = %session_id, count = filter.len()))]
    pub async fn wait_for_completion(
        &self,
        session_id: &SessionId,
        filter: &[TaskId],
        stop_on_first_cancel: bool,
        stop_on_first_error: bool,
        cancel: &CancellationToken,
    ) -> Result<StatusCounts> {
        self.retry
            .execute("wait_for_completion", cancel, |_| async move {
                let conn = self.pool.acquire().await?;
                observe(
                    &conn,
                    self.service
                        .wait_for_completion(
                            &conn,
                            session_id,
                            filter,
                            stop_on_first_cancel,
                            stop_on_first_error,
                        )
                        .await,
                )
            })
            .await
    }
}
