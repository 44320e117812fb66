//! Asynchronous task submission.
//!
//! Requests are queued without waiting, grouped into chunks by an
//! [`AdaptiveBatcher`] and submitted by a bounded set of workers. A chunk is
//! atomic for its callers: either every request obtains a task id and is
//! registered as outstanding, or every request fails with the same cause.

use bytes::Bytes;
use futures::TryStreamExt;
use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::batch::{AdaptiveBatcher, BatchReceiver, BatcherConfig};
use crate::client::GridClient;
use crate::config::{buffering, ClientConfig, TaskOptions};
use crate::error::{GridError, Result};
use crate::grid::service::GridService;
use crate::grid::types::{ResultId, SessionId, TaskDefinition, TaskId, TaskInfo};
use crate::handler::SharedHandler;
use crate::registry::OutstandingTasks;
use crate::telemetry::names;

/// One task to run on the grid.
pub struct TaskRequest {
    pub payload: Bytes,
    /// Results that must exist before the task may start.
    pub dependencies: Vec<ResultId>,
    /// Per-task options; the session defaults apply when unset.
    pub options: Option<TaskOptions>,
    pub handler: SharedHandler,
}

impl TaskRequest {
    pub fn new(payload: impl Into<Bytes>, handler: SharedHandler) -> Self {
        Self {
            payload: payload.into(),
            dependencies: Vec::new(),
            options: None,
            handler,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<ResultId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// A queued request with its completion slot.
struct Envelope {
    request: TaskRequest,
    responder: oneshot::Sender<Result<TaskId>>,
    // Held until the chunk settles.
    _permit: Option<OwnedSemaphorePermit>,
}

/// Resolves to the task id once the request's chunk is submitted.
#[must_use = "the task id is only observable through the pending task"]
pub struct PendingTask {
    receiver: oneshot::Receiver<Result<TaskId>>,
}

impl PendingTask {
    fn channel() -> (oneshot::Sender<Result<TaskId>>, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver })
    }
}

impl Future for PendingTask {
    type Output = Result<TaskId>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or_else(|_| Err(GridError::PipelineClosed)))
    }
}

/// Tuning of the submission pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Maximum requests per chunk.
    pub batch_size: usize,
    /// Inactivity delay before a partial chunk is flushed.
    pub time_trigger: Duration,
    /// Chunks submitted concurrently.
    pub workers: usize,
    /// Requests admitted by `submit_async` before their chunk settles.
    pub max_in_flight: usize,
    /// Payloads above this size are uploaded through the chunked stream.
    pub large_payload_threshold: usize,
    /// Session-wide task options sent with every chunk.
    pub task_options: TaskOptions,
}

impl PipelineSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            batch_size: config.max_tasks_per_buffer,
            time_trigger: config.time_trigger_buffer,
            workers: config.max_parallel_channels,
            max_in_flight: config.max_in_flight_requests(),
            large_payload_threshold: config.large_payload_threshold,
            task_options: config.task_options.clone(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// Submits one chunk: metadata, uploads, then a single task creation call.
struct ChunkSubmitter<S: GridService> {
    client: Arc<GridClient<S>>,
    session_id: SessionId,
    registry: Arc<OutstandingTasks>,
    task_options: TaskOptions,
    large_payload_threshold: usize,
    cancel: CancellationToken,
}

impl<S: GridService> ChunkSubmitter<S> {
    #[instrument(skip_all, fields(session = %self.session_id, size = chunk.len()))]
    async fn submit_chunk(&self, chunk: Vec<Envelope>) {
        let size = chunk.len();
        let outcome = match self.create_tasks(&chunk).await {
            Ok(infos) => self.register_all(infos, &chunk),
            Err(cause) => Err(cause),
        };

        match outcome {
            Ok(task_ids) => {
                for (task_id, envelope) in task_ids.into_iter().zip(chunk) {
                    let _ = envelope.responder.send(Ok(task_id));
                }
                counter!(names::TASKS_SUBMITTED).increment(size as u64);
                debug!("Chunk submitted");
            }
            Err(cause) => {
                error!(error = %cause, "Chunk submission failed, rejecting every request");
                counter!(names::CHUNKS_FAILED).increment(1);
                let cause = Arc::new(cause);
                for envelope in chunk {
                    let _ = envelope
                        .responder
                        .send(Err(GridError::ChunkFailed(cause.clone())));
                }
            }
        }
    }

    /// Register every created task, or none of them.
    ///
    /// Task ids repeated within the reply or already outstanding fail the chunk
    /// before anything is registered.
    fn register_all(&self, infos: Vec<TaskInfo>, chunk: &[Envelope]) -> Result<Vec<TaskId>> {
        let mut seen = HashSet::with_capacity(infos.len());
        for info in &infos {
            if !seen.insert(&info.task_id) || self.registry.contains(&info.task_id) {
                return Err(GridError::Submission(format!(
                    "Task id {} was assigned twice",
                    info.task_id
                )));
            }
        }

        let mut registered = Vec::with_capacity(infos.len());
        for (info, envelope) in infos.into_iter().zip(chunk) {
            if !self.registry.register(
                info.task_id.clone(),
                info.expected_output,
                envelope.request.handler.clone(),
            ) {
                // Lost a race with a concurrent chunk holding the same id.
                for task_id in &registered {
                    self.registry.take(task_id);
                }
                return Err(GridError::Submission(format!(
                    "Task id {} was assigned twice",
                    info.task_id
                )));
            }
            registered.push(info.task_id);
        }
        Ok(registered)
    }

    async fn create_tasks(&self, chunk: &[Envelope]) -> Result<Vec<TaskInfo>> {
        let client = &self.client;
        let session_id = &self.session_id;
        let cancel = &self.cancel;

        let keys: Vec<(String, String)> = chunk
            .iter()
            .map(|_| {
                let key = Uuid::new_v4();
                (format!("payload-{}", key), format!("output-{}", key))
            })
            .collect();
        let result_names: Vec<String> = keys
            .iter()
            .flat_map(|(payload, output)| [payload.clone(), output.clone()])
            .collect();
        let ids = client
            .create_results_metadata(session_id, &result_names, cancel)
            .await?;

        let mut slots = Vec::with_capacity(chunk.len());
        for (payload, output) in &keys {
            match (ids.get(payload), ids.get(output)) {
                (Some(payload_id), Some(output_id)) => {
                    slots.push((payload_id.clone(), output_id.clone()))
                }
                _ => {
                    return Err(GridError::Internal(
                        "Result metadata reply lost a requested name".to_string(),
                    ))
                }
            }
        }

        // Each upload carries its own retry loop.
        futures::stream::iter(chunk.iter().zip(&slots).map(Ok::<_, GridError>))
            .try_for_each_concurrent(
                buffering::UPLOAD_CONCURRENCY,
                |(envelope, (payload_id, _))| {
                    client.upload_payload(
                        session_id,
                        payload_id,
                        envelope.request.payload.clone(),
                        self.large_payload_threshold,
                        cancel,
                    )
                },
            )
            .await?;

        let definitions = chunk
            .iter()
            .zip(slots)
            .map(|(envelope, (payload_id, expected_output))| TaskDefinition {
                payload_id,
                dependencies: envelope.request.dependencies.clone(),
                expected_output,
                options: envelope.request.options.clone(),
            })
            .collect();

        let token = Uuid::new_v4().to_string();
        client
            .submit_tasks(session_id, definitions, &self.task_options, &token, cancel)
            .await
    }
}

/// Queue feeding chunks of requests to the grid.
pub struct SubmissionPipeline {
    batcher: AdaptiveBatcher<Envelope>,
    throttle: Arc<Semaphore>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SubmissionPipeline {
    /// Start the batcher and the chunk dispatcher on the current runtime.
    ///
    /// `cancel` aborts in-flight chunk calls; their requests fail with the
    /// cancellation as cause.
    pub fn new<S: GridService>(
        client: Arc<GridClient<S>>,
        session_id: SessionId,
        registry: Arc<OutstandingTasks>,
        settings: PipelineSettings,
        cancel: CancellationToken,
    ) -> Self {
        let workers = settings.workers.max(1);
        let (batcher, batches) = AdaptiveBatcher::new(BatcherConfig {
            batch_size: settings.batch_size,
            timeout: settings.time_trigger,
            output_capacity: workers,
        });
        let submitter = Arc::new(ChunkSubmitter {
            client,
            session_id,
            registry,
            task_options: settings.task_options,
            large_payload_threshold: settings.large_payload_threshold,
            cancel,
        });

        info!(
            batch_size = settings.batch_size,
            workers,
            max_in_flight = settings.max_in_flight,
            "Submission pipeline started"
        );

        Self {
            batcher,
            throttle: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
            dispatcher: Mutex::new(Some(tokio::spawn(dispatch(batches, submitter, workers)))),
        }
    }

    /// Queue a request. Never waits.
    pub fn submit(&self, request: TaskRequest) -> PendingTask {
        self.enqueue(request, None)
    }

    /// Queue a request once fewer than the in-flight limit are unsettled.
    pub async fn submit_async(&self, request: TaskRequest) -> PendingTask {
        match self.throttle.clone().acquire_owned().await {
            Ok(permit) => self.enqueue(request, Some(permit)),
            // Dropping the sender resolves the pending task as closed.
            Err(_) => PendingTask::channel().1,
        }
    }

    fn enqueue(&self, request: TaskRequest, permit: Option<OwnedSemaphorePermit>) -> PendingTask {
        let (responder, pending) = PendingTask::channel();
        let accepted = self.batcher.offer(Envelope {
            request,
            responder,
            _permit: permit,
        });
        if !accepted {
            debug!("Request offered after the pipeline completed");
        }
        pending
    }

    /// Submit the queued partial chunk now.
    pub fn flush(&self) {
        self.batcher.trigger_batch();
    }

    /// Permits left for `submit_async`.
    pub fn available_permits(&self) -> usize {
        self.throttle.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.batcher.is_completed()
    }

    /// Stop accepting requests and wait until every queued chunk has settled.
    pub async fn shutdown(&self) {
        self.batcher.complete();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                error!("Chunk dispatcher failed: {}", e);
            }
        }
    }
}

async fn dispatch<S: GridService>(
    mut batches: BatchReceiver<Envelope>,
    submitter: Arc<ChunkSubmitter<S>>,
    workers: usize,
) {
    let slots = Arc::new(Semaphore::new(workers));
    let mut in_flight = JoinSet::new();

    while let Some(chunk) = batches.recv().await {
        let Ok(slot) = slots.clone().acquire_owned().await else {
            break;
        };
        let submitter = submitter.clone();
        in_flight.spawn(async move {
            submitter.submit_chunk(chunk).await;
            drop(slot);
        });

        // Reap finished workers so the set stays bounded.
        while let Some(Some(joined)) = futures::FutureExt::now_or_never(in_flight.join_next()) {
            if let Err(e) = joined {
                error!("Chunk worker failed: {}", e);
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!("Chunk worker failed: {}", e);
        }
    }
    debug!("Chunk dispatcher stopped");
}
