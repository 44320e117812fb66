//! In-process implementation of the grid contract.
//!
//! [`InMemoryGrid`] keeps sessions, result slots and tasks in memory. Tasks stay
//! `Submitted` until [`InMemoryGrid::complete_pending`] runs them through the
//! configured worker function, unless auto-completion is enabled. Fault hooks let
//! callers inject transport failures into submission, status and download calls.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tonic::Status;
use tracing::debug;

use crate::config::TaskOptions;
use crate::error::Result;
use crate::grid::service::GridService;
use crate::grid::types::{
    ResultId, ResultStatus, ServiceConfiguration, SessionId, StatusCounts, TaskCreation,
    TaskDefinition, TaskId, TaskInfo, TaskOutput, TaskStatus, UploadFrame,
};
use crate::pool::{Connection, ConnectionFactory, ConnectivityState};

/// Function run by simulated workers. `Err` marks the task as failed.
pub type Worker = Arc<dyn Fn(&Bytes) -> std::result::Result<Bytes, String> + Send + Sync>;

/// Connection to the in-memory grid.
pub struct SimConnection {
    id: u64,
    state: AtomicU8,
}

#[async_trait]
impl Connection for SimConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn report_failure(&self) {
        self.state
            .store(ConnectivityState::TransientFailure.to_u8(), Ordering::SeqCst);
    }
}

struct SimResult {
    status: ResultStatus,
    data: Option<Bytes>,
}

struct SimTask {
    status: TaskStatus,
    payload: ResultId,
    output: ResultId,
    error: Option<String>,
}

#[derive(Default)]
struct SimState {
    sessions: HashSet<SessionId>,
    results: HashMap<ResultId, SimResult>,
    tasks: HashMap<TaskId, SimTask>,
    submit_batches: Vec<usize>,
    submission_tokens: Vec<String>,
    status_query_sizes: Vec<usize>,
    reused_task_id: Option<TaskId>,
    next_id: u64,
}

impl SimState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn run_task(&mut self, task_id: &TaskId, worker: &Worker) -> bool {
        let Some(task) = self.tasks.get(task_id) else {
            return false;
        };
        if task.status != TaskStatus::Submitted {
            return false;
        }
        let input = self
            .results
            .get(&task.payload)
            .and_then(|r| r.data.clone())
            .unwrap_or_default();
        let output = task.output.clone();

        let (task_status, error, result) = match worker(&input) {
            Ok(data) => (
                TaskStatus::Completed,
                None,
                SimResult {
                    status: ResultStatus::Completed,
                    data: Some(data),
                },
            ),
            Err(message) => (
                TaskStatus::Error,
                Some(message),
                SimResult {
                    status: ResultStatus::Aborted,
                    data: None,
                },
            ),
        };

        if self.results.contains_key(&output) {
            self.results.insert(output, result);
        }
        if let Some(task) = self.tasks.get_mut(task_id) {
            task.status = task_status;
            task.error = error;
        }
        true
    }
}

/// In-memory grid with controllable completion and fault injection.
pub struct InMemoryGrid {
    state: Mutex<SimState>,
    worker: Mutex<Worker>,
    changed: Notify,
    auto_complete: AtomicBool,
    data_chunk_max_size: AtomicUsize,
    next_connection: AtomicU64,
    submit_faults: AtomicUsize,
    status_faults: AtomicUsize,
    download_faults: AtomicUsize,
    download_stalls: AtomicUsize,
    item_rejections: AtomicUsize,
    download_calls: AtomicUsize,
    stream_uploads: AtomicUsize,
}

impl Default for InMemoryGrid {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGrid {
    /// A grid whose workers echo their payload.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            worker: Mutex::new(Arc::new(|input: &Bytes| Ok::<Bytes, String>(input.clone()))),
            changed: Notify::new(),
            auto_complete: AtomicBool::new(false),
            data_chunk_max_size: AtomicUsize::new(80 * 1024),
            next_connection: AtomicU64::new(0),
            submit_faults: AtomicUsize::new(0),
            status_faults: AtomicUsize::new(0),
            download_faults: AtomicUsize::new(0),
            download_stalls: AtomicUsize::new(0),
            item_rejections: AtomicUsize::new(0),
            download_calls: AtomicUsize::new(0),
            stream_uploads: AtomicUsize::new(0),
        }
    }

    /// Replace the worker function.
    pub fn with_worker<F>(self, worker: F) -> Self
    where
        F: Fn(&Bytes) -> std::result::Result<Bytes, String> + Send + Sync + 'static,
    {
        *self.worker.lock() = Arc::new(worker);
        self
    }

    /// Run tasks as soon as they are submitted.
    pub fn with_auto_complete(self, enabled: bool) -> Self {
        self.auto_complete.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn with_data_chunk_max_size(self, size: usize) -> Self {
        self.data_chunk_max_size.store(size, Ordering::SeqCst);
        self
    }

    /// Fail the next `count` submissions with `Unavailable`.
    pub fn fail_next_submits(&self, count: usize) {
        self.submit_faults.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` status queries with `Unavailable`.
    pub fn fail_next_status_queries(&self, count: usize) {
        self.status_faults.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` downloads with `Unavailable`.
    pub fn fail_next_downloads(&self, count: usize) {
        self.download_faults.store(count, Ordering::SeqCst);
    }

    /// Never answer the next `count` downloads.
    pub fn stall_next_downloads(&self, count: usize) {
        self.download_stalls.store(count, Ordering::SeqCst);
    }

    /// Reject the first item of the next `count` submissions.
    pub fn reject_next_items(&self, count: usize) {
        self.item_rejections.store(count, Ordering::SeqCst);
    }

    /// Hand out `task_id` again for the last item of the next submission.
    pub fn reuse_task_id(&self, task_id: TaskId) {
        self.state.lock().reused_task_id = Some(task_id);
    }

    /// Run every submitted task. Returns how many ran.
    pub fn complete_pending(&self) -> usize {
        let worker = self.worker.lock().clone();
        let mut state = self.state.lock();
        let pending: Vec<TaskId> = state
            .tasks
            .iter()
            .filter(|(_, task)| task.status == TaskStatus::Submitted)
            .map(|(id, _)| id.clone())
            .collect();
        let completed = pending
            .iter()
            .filter(|id| state.run_task(id, &worker))
            .count();
        drop(state);
        self.changed.notify_waiters();
        completed
    }

    /// Cancel a task; its output slot becomes aborted.
    pub fn cancel_task(&self, task_id: &TaskId) {
        let mut state = self.state.lock();
        let output = match state.tasks.get_mut(task_id) {
            Some(task) => {
                task.status = TaskStatus::Cancelled;
                task.output.clone()
            }
            None => return,
        };
        if let Some(result) = state.results.get_mut(&output) {
            result.status = ResultStatus::Aborted;
        }
        drop(state);
        self.changed.notify_waiters();
    }

    /// Forget a result slot so later queries no longer report it.
    pub fn forget_result(&self, result_id: &ResultId) {
        self.state.lock().results.remove(result_id);
    }

    /// Report a result slot as `NotFound` to status queries.
    pub fn lose_result(&self, result_id: &ResultId) {
        if let Some(result) = self.state.lock().results.get_mut(result_id) {
            result.status = ResultStatus::NotFound;
        }
    }

    /// Output slot of a task.
    pub fn output_of(&self, task_id: &TaskId) -> Option<ResultId> {
        self.state
            .lock()
            .tasks
            .get(task_id)
            .map(|task| task.output.clone())
    }

    /// Task count per `submit_tasks` call, in call order.
    pub fn submit_batches(&self) -> Vec<usize> {
        self.state.lock().submit_batches.clone()
    }

    /// Tokens received by `submit_tasks`, one per call attempt.
    pub fn submission_tokens(&self) -> Vec<String> {
        self.state.lock().submission_tokens.clone()
    }

    /// Ids per `get_result_status` call.
    pub fn status_query_sizes(&self) -> Vec<usize> {
        self.state.lock().status_query_sizes.clone()
    }

    pub fn task_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn task_status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.state.lock().tasks.get(task_id).map(|task| task.status)
    }

    pub fn result_data(&self, result_id: &ResultId) -> Option<Bytes> {
        self.state
            .lock()
            .results
            .get(result_id)
            .and_then(|r| r.data.clone())
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn stream_uploads(&self) -> usize {
        self.stream_uploads.load(Ordering::SeqCst)
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_session(&self, session_id: &SessionId) -> std::result::Result<(), Status> {
        if self.state.lock().sessions.contains(session_id) {
            Ok(())
        } else {
            Err(Status::not_found(format!("Unknown session {}", session_id)))
        }
    }

    fn store(&self, result_id: &ResultId, data: Bytes) -> std::result::Result<(), Status> {
        let mut state = self.state.lock();
        match state.results.get_mut(result_id) {
            Some(result) => {
                result.data = Some(data);
                result.status = ResultStatus::Completed;
                Ok(())
            }
            None => Err(Status::not_found(format!("Unknown result {}", result_id))),
        }
    }
}

#[async_trait]
impl ConnectionFactory<SimConnection> for InMemoryGrid {
    async fn connect(&self) -> Result<SimConnection> {
        Ok(SimConnection {
            id: self.next_connection.fetch_add(1, Ordering::SeqCst) + 1,
            state: AtomicU8::new(ConnectivityState::Ready.to_u8()),
        })
    }
}

#[async_trait]
impl GridService for InMemoryGrid {
    type Connection = SimConnection;

    async fn create_session(
        &self,
        _conn: &SimConnection,
        _options: &TaskOptions,
        _partitions: &[String],
    ) -> std::result::Result<SessionId, Status> {
        let mut state = self.state.lock();
        let session_id = SessionId::new(state.next("session"));
        state.sessions.insert(session_id.clone());
        Ok(session_id)
    }

    async fn service_configuration(
        &self,
        _conn: &SimConnection,
    ) -> std::result::Result<ServiceConfiguration, Status> {
        Ok(ServiceConfiguration {
            data_chunk_max_size: self.data_chunk_max_size.load(Ordering::SeqCst),
        })
    }

    async fn create_results_metadata(
        &self,
        _conn: &SimConnection,
        session_id: &SessionId,
        names: &[String],
    ) -> std::result::Result<HashMap<String, ResultId>, Status> {
        self.check_session(session_id)?;
        let mut state = self.state.lock();
        let mut created = HashMap::with_capacity(names.len());
        for name in names {
            let result_id = ResultId::new(state.next("result"));
            state.results.insert(
                result_id.clone(),
                SimResult {
                    status: ResultStatus::Created,
                    data: None,
                },
            );
            created.insert(name.clone(), result_id);
        }
        Ok(created)
    }

    async fn upload_result_data(
        &self,
        _conn: &SimConnection,
        session_id: &SessionId,
        result_id: &ResultId,
        data: Bytes,
    ) -> std::result::Result<(), Status> {
        self.check_session(session_id)?;
        self.store(result_id, data)
    }

    async fn upload_result_stream(
        &self,
        _conn: &SimConnection,
        mut frames: BoxStream<'static, UploadFrame>,
    ) -> std::result::Result<(), Status> {
        let mut target: Option<ResultId> = None;
        let mut buffer = BytesMut::new();

        while let Some(frame) = frames.next().await {
            match frame {
                UploadFrame::Init {
                    session_id,
                    result_id,
                } => {
                    self.check_session(&session_id)?;
                    target = Some(result_id);
                }
                UploadFrame::Data(chunk) => {
                    if target.is_none() {
                        return Err(Status::invalid_argument("Data frame before init"));
                    }
                    if chunk.len() > self.data_chunk_max_size.load(Ordering::SeqCst) {
                        return Err(Status::invalid_argument("Data frame above the chunk limit"));
                    }
                    buffer.extend_from_slice(&chunk);
                }
                UploadFrame::Complete => {
                    let result_id = target
                        .take()
                        .ok_or_else(|| Status::invalid_argument("Complete frame before init"))?;
                    self.stream_uploads.fetch_add(1, Ordering::SeqCst);
                    return self.store(&result_id, buffer.freeze());
                }
            }
        }
        Err(Status::aborted("Upload stream ended without a complete frame"))
    }

    async fn submit_tasks(
        &self,
        _conn: &SimConnection,
        session_id: &SessionId,
        tasks: Vec<TaskDefinition>,
        _options: &TaskOptions,
        submission_token: &str,
    ) -> std::result::Result<Vec<TaskCreation>, Status> {
        self.check_session(session_id)?;
        self.state
            .lock()
            .submission_tokens
            .push(submission_token.to_string());
        if Self::take_fault(&self.submit_faults) {
            return Err(Status::unavailable("Injected submission fault"));
        }
        let reject_first = Self::take_fault(&self.item_rejections);

        let worker = self.worker.lock().clone();
        let auto_complete = self.auto_complete.load(Ordering::SeqCst);
        let mut state = self.state.lock();
        state.submit_batches.push(tasks.len());

        let last = tasks.len().saturating_sub(1);
        let reused = state.reused_task_id.take();
        let mut replies = Vec::with_capacity(tasks.len());
        for (index, definition) in tasks.into_iter().enumerate() {
            if reject_first && index == 0 {
                replies.push(TaskCreation::Failed("Injected item rejection".to_string()));
                continue;
            }
            if !state.results.contains_key(&definition.payload_id) {
                replies.push(TaskCreation::Failed(format!(
                    "Unknown payload {}",
                    definition.payload_id
                )));
                continue;
            }
            let task_id = match (&reused, index == last) {
                (Some(task_id), true) => task_id.clone(),
                _ => TaskId::new(state.next("task")),
            };
            state.tasks.insert(
                task_id.clone(),
                SimTask {
                    status: TaskStatus::Submitted,
                    payload: definition.payload_id.clone(),
                    output: definition.expected_output.clone(),
                    error: None,
                },
            );
            if auto_complete {
                state.run_task(&task_id, &worker);
            }
            replies.push(TaskCreation::Created(TaskInfo {
                task_id,
                expected_output: definition.expected_output,
                payload_id: definition.payload_id,
            }));
        }
        drop(state);
        debug!(tasks = replies.len(), "Simulated submission");
        self.changed.notify_waiters();
        Ok(replies)
    }

    async fn get_result_status(
        &self,
        _conn: &SimConnection,
        session_id: &SessionId,
        result_ids: &[ResultId],
    ) -> std::result::Result<Vec<(ResultId, ResultStatus)>, Status> {
        self.check_session(session_id)?;
        if Self::take_fault(&self.status_faults) {
            return Err(Status::unavailable("Injected status fault"));
        }
        let mut state = self.state.lock();
        state.status_query_sizes.push(result_ids.len());
        Ok(result_ids
            .iter()
            .filter_map(|id| {
                state
                    .results
                    .get(id)
                    .map(|result| (id.clone(), result.status))
            })
            .collect())
    }

    async fn download_result_data(
        &self,
        _conn: &SimConnection,
        session_id: &SessionId,
        result_id: &ResultId,
    ) -> std::result::Result<Bytes, Status> {
        self.check_session(session_id)?;
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_fault(&self.download_faults) {
            return Err(Status::unavailable("Injected download fault"));
        }
        if Self::take_fault(&self.download_stalls) {
            std::future::pending::<()>().await;
        }
        let state = self.state.lock();
        match state.results.get(result_id) {
            Some(SimResult {
                status: ResultStatus::Completed,
                data: Some(data),
            }) => Ok(data.clone()),
            Some(result) => Err(Status::failed_precondition(format!(
                "Result {} is {}",
                result_id, result.status
            ))),
            None => Err(Status::not_found(format!("Unknown result {}", result_id))),
        }
    }

    async fn get_task_status(
        &self,
        _conn: &SimConnection,
        task_ids: &[TaskId],
    ) -> std::result::Result<Vec<(TaskId, TaskStatus)>, Status> {
        let state = self.state.lock();
        Ok(task_ids
            .iter()
            .filter_map(|id| state.tasks.get(id).map(|task| (id.clone(), task.status)))
            .collect())
    }

    async fn get_task_output(
        &self,
        _conn: &SimConnection,
        session_id: &SessionId,
        task_id: &TaskId,
    ) -> std::result::Result<TaskOutput, Status> {
        self.check_session(session_id)?;
        let state = self.state.lock();
        match state.tasks.get(task_id) {
            Some(task) => Ok(match &task.error {
                Some(message) => TaskOutput::Error(message.clone()),
                None => TaskOutput::Ok,
            }),
            None => Err(Status::not_found(format!("Unknown task {}", task_id))),
        }
    }

    async fn wait_for_completion(
        &self,
        _conn: &SimConnection,
        session_id: &SessionId,
        filter: &[TaskId],
        stop_on_first_cancel: bool,
        stop_on_first_error: bool,
    ) -> std::result::Result<StatusCounts, Status> {
        self.check_session(session_id)?;
        loop {
            let changed = self.changed.notified();
            {
                let state = self.state.lock();
                let mut counts = StatusCounts::new();
                let mut all_final = true;
                let mut stop = false;
                for id in filter {
                    let status = state
                        .tasks
                        .get(id)
                        .map(|task| task.status)
                        .unwrap_or(TaskStatus::Unspecified);
                    *counts.entry(status).or_insert(0) += 1;
                    all_final &= status.is_final() || status == TaskStatus::Unspecified;
                    stop |= (stop_on_first_cancel && status.is_cancelled())
                        || (stop_on_first_error && status == TaskStatus::Error);
                }
                if all_final || stop {
                    return Ok(counts);
                }
            }
            changed.await;
        }
    }
}
