//! Demo of the grid dispatch runtime against the in-memory grid.
//!
//! Submits a burst of tasks through a session, lets the simulated workers run
//! them, and shuts down once every result has been delivered.

use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use grid_dispatch::{
    config::ClientConfig,
    grid::InMemoryGrid,
    handler_fn,
    telemetry::{describe_metrics, init_tracing, TracingConfig},
    GridSession,
};

const TASK_COUNT: usize = 1_200;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(&TracingConfig::default())?;
    describe_metrics();

    // Environment overrides apply (e.g. GRID_MAX_TASKS_PER_BUFFER=100)
    let config = ClientConfig::load()?;
    info!(
        batch_size = config.max_tasks_per_buffer,
        workers = config.max_parallel_channels,
        "Loaded configuration"
    );

    let grid = Arc::new(
        InMemoryGrid::new()
            .with_auto_complete(true)
            .with_worker(|input| Ok(Bytes::from(input.iter().rev().copied().collect::<Vec<u8>>()))),
    );
    let session = GridSession::open(grid.clone(), grid.clone(), config).await?;

    let responses = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));

    let mut pending = Vec::with_capacity(TASK_COUNT);
    for i in 0..TASK_COUNT {
        let responses = responses.clone();
        let failures = failures.clone();
        pending.push(session.submit(
            Bytes::from(format!("task-{i}")),
            handler_fn(
                move |_, _| {
                    responses.fetch_add(1, Ordering::Relaxed);
                },
                move |error| {
                    warn!(error = %error, "Task failed");
                    failures.fetch_add(1, Ordering::Relaxed);
                },
            ),
        ));
    }
    session.flush();

    let submitted = futures::future::join_all(pending)
        .await
        .into_iter()
        .filter(Result::is_ok)
        .count();
    info!(submitted, "Submission finished");

    session.shutdown().await;

    info!(
        responses = responses.load(Ordering::Relaxed),
        failures = failures.load(Ordering::Relaxed),
        batches = ?grid.submit_batches(),
        "{}",
        session.client().pool().stats()
    );
    Ok(())
}
