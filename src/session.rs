//! Session facade tying the client, the submission pipeline and the result
//! collector together.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::client::GridClient;
use crate::config::ClientConfig;
use crate::error::{GridError, Result};
use crate::grid::service::GridService;
use crate::grid::types::{SessionId, StatusCounts, TaskDefinition, TaskId, TaskStatus};
use crate::handler::SharedHandler;
use crate::pool::ConnectionFactory;
use crate::registry::OutstandingTasks;
use crate::results::{resolve_failure, ResultCollector};
use crate::submit::{PendingTask, PipelineSettings, SubmissionPipeline, TaskRequest};

/// A grid session with its background submission and result machinery.
pub struct GridSession<S: GridService> {
    client: Arc<GridClient<S>>,
    session_id: SessionId,
    config: ClientConfig,
    registry: Arc<OutstandingTasks>,
    pipeline: SubmissionPipeline,
    collector: Mutex<Option<JoinHandle<()>>>,
    drain: CancellationToken,
    abort: CancellationToken,
}

impl<S: GridService> GridSession<S> {
    /// Create a remote session and start the pipeline and the collector.
    #[instrument(skip_all, fields(endpoint = %config.endpoint))]
    pub async fn open(
        service: Arc<S>,
        factory: Arc<dyn ConnectionFactory<S::Connection>>,
        config: ClientConfig,
    ) -> Result<Self> {
        let client = Arc::new(GridClient::from_config(service, factory, &config)?);
        let abort = CancellationToken::new();
        let drain = CancellationToken::new();

        let session_id = client
            .create_session(&config.task_options, &config.partitions, &abort)
            .await?;
        let registry = Arc::new(OutstandingTasks::new());

        let pipeline = SubmissionPipeline::new(
            client.clone(),
            session_id.clone(),
            registry.clone(),
            PipelineSettings::from_config(&config),
            abort.clone(),
        );
        let collector = ResultCollector::new(
            client.clone(),
            session_id.clone(),
            registry.clone(),
            config.result_poll_chunk_size,
            drain.clone(),
            abort.clone(),
        )
        .spawn();

        info!(session = %session_id, "Session opened");
        Ok(Self {
            client,
            session_id,
            config,
            registry,
            pipeline,
            collector: Mutex::new(Some(collector)),
            drain,
            abort,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn client(&self) -> &GridClient<S> {
        &self.client
    }

    pub fn registry(&self) -> &OutstandingTasks {
        &self.registry
    }

    /// Tasks submitted and not yet settled.
    pub fn outstanding(&self) -> usize {
        self.registry.len()
    }

    /// Queue a payload; `handler` receives its outcome.
    pub fn submit(&self, payload: impl Into<Bytes>, handler: SharedHandler) -> PendingTask {
        self.pipeline.submit(TaskRequest::new(payload, handler))
    }

    pub fn submit_request(&self, request: TaskRequest) -> PendingTask {
        self.pipeline.submit(request)
    }

    /// Like [`GridSession::submit_request`], but waits while too many requests
    /// are unsettled.
    pub async fn submit_async(&self, request: TaskRequest) -> PendingTask {
        self.pipeline.submit_async(request).await
    }

    /// Submit the queued partial chunk now.
    pub fn flush(&self) {
        self.pipeline.flush();
    }

    /// Run one task and wait for its result, bypassing the pipeline.
    #[instrument(skip_all, fields(session = %self.session_id, bytes = payload.len()))]
    pub async fn execute(&self, payload: Bytes) -> Result<Bytes> {
        let cancel = &self.abort;
        let key = Uuid::new_v4();
        let payload_name = format!("payload-{}", key);
        let output_name = format!("output-{}", key);

        let ids = self
            .client
            .create_results_metadata(
                &self.session_id,
                &[payload_name.clone(), output_name.clone()],
                cancel,
            )
            .await?;
        let (Some(payload_id), Some(output_id)) = (ids.get(&payload_name), ids.get(&output_name))
        else {
            return Err(GridError::Internal(
                "Result metadata reply lost a requested name".to_string(),
            ));
        };

        self.client
            .upload_payload(
                &self.session_id,
                payload_id,
                payload,
                self.config.large_payload_threshold,
                cancel,
            )
            .await?;

        let token = Uuid::new_v4().to_string();
        let task_id = self
            .client
            .submit_tasks(
                &self.session_id,
                vec![TaskDefinition {
                    payload_id: payload_id.clone(),
                    dependencies: Vec::new(),
                    expected_output: output_id.clone(),
                    options: None,
                }],
                &self.config.task_options,
                &token,
                cancel,
            )
            .await?
            .into_iter()
            .next()
            .map(|info| info.task_id)
            .ok_or_else(|| GridError::Submission("No task created".to_string()))?;

        self.wait_for_completion(std::slice::from_ref(&task_id), true, true)
            .await?;
        let status = self
            .client
            .get_task_status(std::slice::from_ref(&task_id), cancel)
            .await?
            .into_iter()
            .find(|(id, _)| *id == task_id)
            .map(|(_, status)| status);

        if status != Some(TaskStatus::Completed) {
            let fallback = match status {
                Some(status) => format!("Task is in status: {:?}", status),
                None => "Task is missing".to_string(),
            };
            let failure =
                resolve_failure(&self.client, &self.session_id, &task_id, fallback, cancel).await;
            return Err(failure.into());
        }

        self.client
            .download_result_data(&self.session_id, output_id, cancel)
            .await
    }

    /// Wait until the filtered tasks are final, returning counts per status.
    pub async fn wait_for_completion(
        &self,
        filter: &[TaskId],
        stop_on_first_cancel: bool,
        stop_on_first_error: bool,
    ) -> Result<StatusCounts> {
        self.client
            .wait_for_completion(
                &self.session_id,
                filter,
                stop_on_first_cancel,
                stop_on_first_error,
                &self.abort,
            )
            .await
    }

    /// Submit every queued request, then wait for all outstanding results.
    pub async fn shutdown(&self) {
        info!(session = %self.session_id, "Shutting down session");
        self.pipeline.shutdown().await;
        self.drain.cancel();
        self.join_collector().await;
    }

    /// Stop immediately. Queued requests fail and outstanding tasks are left
    /// unsettled.
    pub async fn abort(&self) {
        warn!(
            session = %self.session_id,
            outstanding = self.registry.len(),
            "Aborting session"
        );
        self.abort.cancel();
        self.pipeline.shutdown().await;
        self.join_collector().await;
    }

    async fn join_collector(&self) {
        let collector = self.collector.lock().take();
        if let Some(handle) = collector {
            if let Err(e) = handle.await {
                error!("Result collector failed: {}", e);
            }
        }
    }
}

impl<S: GridService> Drop for GridSession<S> {
    fn drop(&mut self) {
        if self.collector.lock().is_some() {
            self.abort.cancel();
        }
    }
}
