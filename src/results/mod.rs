//! Result correlation loop.
//!
//! [`ResultCollector`] polls the grid for the output slots of every outstanding
//! task, downloads ready results and settles each task exactly once through its
//! handler. Polling backs off along a fixed ladder while nothing settles.

use bytes::Bytes;
use metrics::counter;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::GridClient;
use crate::config::polling;
use crate::error::{GridError, ServiceInvocationError};
use crate::grid::service::GridService;
use crate::grid::types::{ResultId, ResultStatus, SessionId, StatusCode, TaskId, TaskOutput};
use crate::registry::OutstandingTasks;
use crate::telemetry::names;

/// Position on the idle wait ladder.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    ladder: &'static [Duration],
    index: usize,
}

impl Default for IdleBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleBackoff {
    pub fn new() -> Self {
        Self::with_ladder(&polling::IDLE_BACKOFF_LADDER)
    }

    /// `ladder` must not be empty.
    pub fn with_ladder(ladder: &'static [Duration]) -> Self {
        Self { ladder, index: 0 }
    }

    /// Record an iteration and return the wait before the next one.
    ///
    /// Progress rewinds to the first rung; an idle iteration climbs one rung,
    /// stopping at the last.
    pub fn record(&mut self, settled: usize) -> Duration {
        if settled > 0 {
            self.index = 0;
        } else {
            self.index = (self.index + 1).min(self.ladder.len().saturating_sub(1));
        }
        self.current()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> Duration {
        self.ladder.get(self.index).copied().unwrap_or_default()
    }
}

/// How a status reply places an outstanding task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending,
    Failed(ResultStatus),
    /// The grid no longer knows the output slot.
    Missing,
}

/// Partition a status reply entry.
pub fn readiness(status: Option<ResultStatus>) -> Readiness {
    match status {
        Some(ResultStatus::Completed) => Readiness::Ready,
        Some(ResultStatus::Created) => Readiness::Pending,
        Some(ResultStatus::NotFound) | None => Readiness::Missing,
        Some(status @ (ResultStatus::Aborted | ResultStatus::Unspecified)) => {
            Readiness::Failed(status)
        }
    }
}

/// Build the error delivered for a task that will not produce a result.
///
/// The code follows the task's status. The detail is the cancellation notice,
/// else the task's own error output, else `fallback`.
pub async fn resolve_failure<S: GridService>(
    client: &GridClient<S>,
    session_id: &SessionId,
    task_id: &TaskId,
    fallback: String,
    cancel: &CancellationToken,
) -> ServiceInvocationError {
    let task_status = match client
        .get_task_status(std::slice::from_ref(task_id), cancel)
        .await
    {
        Ok(statuses) => statuses
            .into_iter()
            .find(|(id, _)| id == task_id)
            .map(|(_, status)| status),
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Could not fetch task status");
            None
        }
    };
    let code = task_status
        .map(StatusCode::from)
        .unwrap_or(StatusCode::ResultError);

    if task_status.is_some_and(|status| status.is_cancelled()) {
        return ServiceInvocationError::new(
            task_id.clone(),
            code,
            format!("Task {} was canceled", task_id),
        );
    }

    let details = match client.get_task_output(session_id, task_id, cancel).await {
        Ok(TaskOutput::Error(details)) if !details.is_empty() => details,
        Ok(_) => fallback,
        Err(e) => {
            debug!(task_id = %task_id, error = %e, "Could not fetch task output");
            fallback
        }
    };
    ServiceInvocationError::new(task_id.clone(), code, details)
}

/// Final outcome of a task.
enum Settlement {
    Response(Bytes),
    Error(ServiceInvocationError),
}

/// Background loop settling outstanding tasks.
pub struct ResultCollector<S: GridService> {
    client: Arc<GridClient<S>>,
    session_id: SessionId,
    registry: Arc<OutstandingTasks>,
    poll_chunk_size: usize,
    drain: CancellationToken,
    abort: CancellationToken,
}

impl<S: GridService> ResultCollector<S> {
    /// `drain` asks the loop to stop once the registry is empty. `abort` stops
    /// it at the next suspension point and cancels its remote calls.
    pub fn new(
        client: Arc<GridClient<S>>,
        session_id: SessionId,
        registry: Arc<OutstandingTasks>,
        poll_chunk_size: usize,
        drain: CancellationToken,
        abort: CancellationToken,
    ) -> Self {
        Self {
            client,
            session_id,
            registry,
            poll_chunk_size: poll_chunk_size.max(1),
            drain,
            abort,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[instrument(skip_all, fields(session = %self.session_id))]
    pub async fn run(self) {
        let mut backoff = IdleBackoff::new();
        let mut drain_logged = false;
        info!("Result collector started");

        while !(self.drain.is_cancelled() && self.registry.is_empty()) {
            if self.abort.is_cancelled() {
                break;
            }

            if self.registry.is_empty() {
                tokio::select! {
                    _ = self.registry.registration() => {}
                    _ = self.drain.cancelled() => {}
                    _ = self.abort.cancelled() => {}
                    _ = tokio::time::sleep(polling::EMPTY_REGISTRY_WAIT) => {}
                }
                continue;
            }

            if self.drain.is_cancelled() && !drain_logged {
                warn!(
                    outstanding = self.registry.len(),
                    "Shutdown requested, waiting for outstanding results"
                );
                drain_logged = true;
            }

            let settled = self.poll_once().await;
            let wait = backoff.record(settled);
            if settled == 0 {
                debug!(?wait, "No results settled");
            }

            tokio::select! {
                biased;
                _ = self.abort.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if self.registry.is_empty() {
            info!("Result collector stopped");
        } else {
            let leftover: Vec<String> = self
                .registry
                .task_ids()
                .iter()
                .map(ToString::to_string)
                .collect();
            warn!(
                count = leftover.len(),
                "Results not processed: [{}]",
                leftover.join(", ")
            );
        }
    }

    /// Run one polling pass over the registry. Returns the number of tasks
    /// settled.
    pub async fn poll_once(&self) -> usize {
        let snapshot = self.registry.snapshot();
        let mut settled = 0;

        for chunk in snapshot.chunks(self.poll_chunk_size) {
            if self.abort.is_cancelled() {
                break;
            }
            let result_ids: Vec<ResultId> = chunk.iter().map(|(_, id)| id.clone()).collect();
            let statuses: HashMap<ResultId, ResultStatus> = match self
                .client
                .get_result_status(&self.session_id, &result_ids, &self.abort)
                .await
            {
                Ok(statuses) => statuses.into_iter().collect(),
                Err(GridError::Cancelled) => break,
                Err(e) => {
                    warn!(error = %e, ids = result_ids.len(), "Result status query failed");
                    continue;
                }
            };

            for (task_id, result_id) in chunk {
                let settlement = match readiness(statuses.get(result_id).copied()) {
                    Readiness::Pending => continue,
                    Readiness::Ready => self.download(task_id, result_id).await,
                    Readiness::Missing => Settlement::Error(ServiceInvocationError::new(
                        task_id.clone(),
                        StatusCode::ResultError,
                        "Task is missing",
                    )),
                    Readiness::Failed(status) => Settlement::Error(
                        resolve_failure(
                            &self.client,
                            &self.session_id,
                            task_id,
                            format!("Result is in status: {}", status),
                            &self.abort,
                        )
                        .await,
                    ),
                };
                if self.abort.is_cancelled() {
                    return settled;
                }
                if self.settle(task_id, settlement) {
                    settled += 1;
                }
            }
        }
        settled
    }

    async fn download(&self, task_id: &TaskId, result_id: &ResultId) -> Settlement {
        match self
            .client
            .download_result_data(&self.session_id, result_id, &self.abort)
            .await
        {
            Ok(data) => Settlement::Response(data),
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Result download failed");
                Settlement::Error(
                    resolve_failure(
                        &self.client,
                        &self.session_id,
                        task_id,
                        format!("Result download failed: {}", e),
                        &self.abort,
                    )
                    .await,
                )
            }
        }
    }

    /// Remove the task and run its handler. Returns `false` when the task was
    /// already settled.
    fn settle(&self, task_id: &TaskId, settlement: Settlement) -> bool {
        let Some(pending) = self.registry.take(task_id) else {
            return false;
        };
        let handler = pending.handler;

        let (outcome, invoked) = match settlement {
            Settlement::Response(data) => (
                "response",
                catch_unwind(AssertUnwindSafe(|| handler.on_response(task_id, data))),
            ),
            Settlement::Error(error) => (
                "error",
                catch_unwind(AssertUnwindSafe(|| handler.on_error(error))),
            ),
        };
        counter!(names::RESULTS_SETTLED, "outcome" => outcome).increment(1);
        debug!(
            task_id = %task_id,
            outcome,
            waited = ?pending.registered_at.elapsed(),
            "Task settled"
        );

        if invoked.is_err() {
            error!(task_id = %task_id, outcome, "Result handler panicked");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskOptions;
    use crate::grid::simulator::InMemoryGrid;
    use crate::grid::types::TaskDefinition;
    use crate::handler::{handler_fn, SharedHandler};
    use crate::retry::RetryPolicy;
    use parking_lot::Mutex;

    #[test]
    fn test_idle_backoff_resets_on_progress() {
        let mut backoff = IdleBackoff::new();
        assert_eq!(backoff.index(), 0);

        backoff.record(0);
        assert_eq!(backoff.index(), 1);
        backoff.record(0);
        assert_eq!(backoff.index(), 2);
        assert_eq!(backoff.record(0), Duration::from_secs(10));

        assert_eq!(backoff.record(1), Duration::from_millis(10));
        assert_eq!(backoff.index(), 0);
    }

    #[test]
    fn test_idle_backoff_caps_at_last_rung() {
        let mut backoff = IdleBackoff::new();
        for _ in 0..20 {
            backoff.record(0);
        }
        assert_eq!(backoff.index(), polling::IDLE_BACKOFF_LADDER.len() - 1);
        assert_eq!(backoff.current(), Duration::from_secs(30));
    }

    #[test]
    fn test_readiness_partition() {
        assert_eq!(readiness(Some(ResultStatus::Completed)), Readiness::Ready);
        assert_eq!(readiness(Some(ResultStatus::Created)), Readiness::Pending);
        assert_eq!(
            readiness(Some(ResultStatus::Aborted)),
            Readiness::Failed(ResultStatus::Aborted)
        );
        assert_eq!(
            readiness(Some(ResultStatus::Unspecified)),
            Readiness::Failed(ResultStatus::Unspecified)
        );
        assert_eq!(readiness(Some(ResultStatus::NotFound)), Readiness::Missing);
        assert_eq!(readiness(None), Readiness::Missing);
    }

    #[derive(Default)]
    struct Outcomes {
        responses: Mutex<Vec<(TaskId, Bytes)>>,
        errors: Mutex<Vec<ServiceInvocationError>>,
    }

    fn recording(outcomes: &Arc<Outcomes>) -> SharedHandler {
        let ok = outcomes.clone();
        let err = outcomes.clone();
        handler_fn(
            move |task_id, data| ok.responses.lock().push((task_id.clone(), data)),
            move |error| err.errors.lock().push(error),
        )
    }

    struct Fixture {
        grid: Arc<InMemoryGrid>,
        client: Arc<GridClient<InMemoryGrid>>,
        session_id: SessionId,
        registry: Arc<OutstandingTasks>,
    }

    impl Fixture {
        async fn new(grid: InMemoryGrid) -> Self {
            let grid = Arc::new(grid);
            let client = Arc::new(GridClient::new(
                grid.clone(),
                grid.clone(),
                RetryPolicy::new(3, Duration::from_millis(300)),
            ));
            let session_id = client
                .create_session(&TaskOptions::default(), &[], &CancellationToken::new())
                .await
                .unwrap();
            Self {
                grid,
                client,
                session_id,
                registry: Arc::new(OutstandingTasks::new()),
            }
        }

        /// Create a task directly and register it.
        async fn task(&self, payload: &'static [u8], handler: SharedHandler) -> TaskId {
            let cancel = CancellationToken::new();
            let ids = self
                .client
                .create_results_metadata(&self.session_id, &["in".into(), "out".into()], &cancel)
                .await
                .unwrap();
            self.client
                .upload_result_data(&self.session_id, &ids["in"], Bytes::from_static(payload), &cancel)
                .await
                .unwrap();
            let info = self
                .client
                .submit_tasks(
                    &self.session_id,
                    vec![TaskDefinition {
                        payload_id: ids["in"].clone(),
                        dependencies: vec![],
                        expected_output: ids["out"].clone(),
                        options: None,
                    }],
                    &TaskOptions::default(),
                    "token",
                    &cancel,
                )
                .await
                .unwrap()
                .remove(0);
            self.registry
                .register(info.task_id.clone(), info.expected_output, handler);
            info.task_id
        }

        fn collector(&self, drain: &CancellationToken, abort: &CancellationToken) -> ResultCollector<InMemoryGrid> {
            ResultCollector::new(
                self.client.clone(),
                self.session_id.clone(),
                self.registry.clone(),
                2,
                drain.clone(),
                abort.clone(),
            )
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_results_are_delivered_once() {
        let f = Fixture::new(InMemoryGrid::new()).await;
        let outcomes = Arc::new(Outcomes::default());
        let a = f.task(b"a", recording(&outcomes)).await;
        let b = f.task(b"b", recording(&outcomes)).await;
        let _pending = f.task(b"c", recording(&outcomes)).await;

        let collector = f.collector(&CancellationToken::new(), &CancellationToken::new());
        assert_eq!(collector.poll_once().await, 0);

        f.grid.complete_pending();
        assert_eq!(collector.poll_once().await, 3);
        assert_eq!(collector.poll_once().await, 0);

        let responses = outcomes.responses.lock();
        assert_eq!(responses.len(), 3);
        assert!(responses.contains(&(a, Bytes::from_static(b"a"))));
        assert!(responses.contains(&(b, Bytes::from_static(b"b"))));
        assert!(f.registry.is_empty());
        assert_eq!(f.grid.status_query_sizes(), vec![2, 1, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failures_carry_reason() {
        let f = Fixture::new(InMemoryGrid::new().with_worker(|_| Err("worker exploded".to_string())))
            .await;
        let outcomes = Arc::new(Outcomes::default());
        let failed = f.task(b"x", recording(&outcomes)).await;
        let cancelled = f.task(b"y", recording(&outcomes)).await;
        let missing = f.task(b"z", recording(&outcomes)).await;

        f.grid.cancel_task(&cancelled);
        f.grid.complete_pending();
        let missing_output = f.grid.output_of(&missing).unwrap();
        f.grid.forget_result(&missing_output);

        let collector = f.collector(&CancellationToken::new(), &CancellationToken::new());
        assert_eq!(collector.poll_once().await, 3);

        let errors = outcomes.errors.lock();
        let by_task: HashMap<_, _> = errors.iter().map(|e| (e.task_id.clone(), e)).collect();
        assert_eq!(by_task[&failed].status, StatusCode::TaskFailed);
        assert_eq!(by_task[&failed].details, "worker exploded");
        assert_eq!(by_task[&cancelled].status, StatusCode::TaskCancelled);
        assert_eq!(
            by_task[&cancelled].details,
            format!("Task {} was canceled", cancelled)
        );
        assert_eq!(by_task[&missing].status, StatusCode::ResultError);
        assert_eq!(by_task[&missing].details, "Task is missing");
        assert!(outcomes.responses.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_download_settles_as_error() {
        let f = Fixture::new(InMemoryGrid::new().with_auto_complete(true)).await;
        let outcomes = Arc::new(Outcomes::default());
        let task_id = f.task(b"a", recording(&outcomes)).await;
        f.grid.fail_next_downloads(3);

        let collector = f.collector(&CancellationToken::new(), &CancellationToken::new());
        assert_eq!(collector.poll_once().await, 1);

        let errors = outcomes.errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].task_id, task_id);
        assert_eq!(errors[0].status, StatusCode::ResultReady);
        assert!(errors[0].details.starts_with("Result download failed"));
        assert_eq!(f.grid.download_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_query_failure_is_not_progress() {
        let f = Fixture::new(InMemoryGrid::new().with_auto_complete(true)).await;
        let outcomes = Arc::new(Outcomes::default());
        f.task(b"a", recording(&outcomes)).await;
        f.grid.fail_next_status_queries(3);

        let collector = f.collector(&CancellationToken::new(), &CancellationToken::new());
        assert_eq!(collector.poll_once().await, 0);
        assert_eq!(f.registry.len(), 1);
        assert_eq!(collector.poll_once().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_does_not_stop_others() {
        let f = Fixture::new(InMemoryGrid::new().with_auto_complete(true)).await;
        let outcomes = Arc::new(Outcomes::default());
        f.task(b"boom", handler_fn(|_, _| panic!("handler bug"), |_| {})).await;
        f.task(b"fine", recording(&outcomes)).await;

        let collector = f.collector(&CancellationToken::new(), &CancellationToken::new());
        assert_eq!(collector.poll_once().await, 2);
        assert_eq!(outcomes.responses.lock().len(), 1);
        assert!(f.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_drains_before_exit() {
        let f = Fixture::new(InMemoryGrid::new()).await;
        let outcomes = Arc::new(Outcomes::default());
        f.task(b"a", recording(&outcomes)).await;

        let drain = CancellationToken::new();
        let abort = CancellationToken::new();
        let handle = f.collector(&drain, &abort).spawn();
        drain.cancel();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!handle.is_finished());

        f.grid.complete_pending();
        tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcomes.responses.lock().len(), 1);
    }

    async fn run_ready_tasks() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_waits_follow_the_idle_ladder() {
        let f = Fixture::new(InMemoryGrid::new()).await;
        let outcomes = Arc::new(Outcomes::default());
        f.task(b"a", recording(&outcomes)).await;
        f.grid.complete_pending();
        f.task(b"b", recording(&outcomes)).await;

        let abort = CancellationToken::new();
        let handle = f.collector(&CancellationToken::new(), &abort).spawn();
        let passes = || f.grid.status_query_sizes().len();

        // Settling `a` schedules the next pass 10ms later.
        run_ready_tasks().await;
        assert_eq!(passes(), 1);
        assert_eq!(outcomes.responses.lock().len(), 1);

        let steps = [
            (Duration::from_millis(500), 2), // idle from here: 1s
            (Duration::from_millis(600), 2),
            (Duration::from_millis(500), 3), // 5s
            (Duration::from_millis(4_400), 3),
            (Duration::from_millis(700), 4), // 10s
            (Duration::from_millis(9_800), 4),
        ];
        for (step, expected) in steps {
            tokio::time::advance(step).await;
            run_ready_tasks().await;
            assert_eq!(passes(), expected, "after advancing {step:?}");
        }

        // Progress rewinds to the shortest wait.
        f.grid.complete_pending();
        f.task(b"c", recording(&outcomes)).await;
        tokio::time::advance(Duration::from_millis(300)).await;
        run_ready_tasks().await;
        assert_eq!(passes(), 5);
        assert_eq!(outcomes.responses.lock().len(), 2);

        tokio::time::advance(Duration::from_millis(50)).await;
        run_ready_tasks().await;
        assert_eq!(passes(), 6);
        tokio::time::advance(Duration::from_millis(500)).await;
        run_ready_tasks().await;
        assert_eq!(passes(), 6);

        abort.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_leaves_tasks_outstanding() {
        let f = Fixture::new(InMemoryGrid::new()).await;
        let outcomes = Arc::new(Outcomes::default());
        f.task(b"a", recording(&outcomes)).await;

        let drain = CancellationToken::new();
        let abort = CancellationToken::new();
        let handle = f.collector(&drain, &abort).spawn();
        tokio::time::sleep(Duration::from_secs(3)).await;

        abort.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(f.registry.len(), 1);
        assert!(outcomes.responses.lock().is_empty());
        assert!(outcomes.errors.lock().is_empty());
    }
}
