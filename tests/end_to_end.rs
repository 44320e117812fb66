//! End-to-end runs of a session against the in-memory grid.

use bytes::Bytes;
use grid_dispatch::config::ClientConfig;
use grid_dispatch::grid::InMemoryGrid;
use grid_dispatch::submit::TaskRequest;
use grid_dispatch::{handler_fn, GridSession, ResultHandler};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn config(batch_size: usize) -> ClientConfig {
    ClientConfig {
        max_tasks_per_buffer: batch_size,
        time_trigger_buffer: Duration::from_millis(200),
        retry_total_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

/// Counts outcomes and remembers which tasks produced which payload.
#[derive(Default)]
struct Tally {
    responses: AtomicUsize,
    errors: AtomicUsize,
    payloads: Mutex<HashSet<Vec<u8>>>,
}

impl ResultHandler for Tally {
    fn on_response(&self, _task_id: &grid_dispatch::grid::TaskId, payload: Bytes) {
        self.responses.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().insert(payload.to_vec());
    }

    fn on_error(&self, _error: grid_dispatch::ServiceInvocationError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn test_1200_items_in_three_submissions() {
    let grid = Arc::new(InMemoryGrid::new());
    let session = GridSession::open(grid.clone(), grid.clone(), config(500))
        .await
        .unwrap();
    let tally = Arc::new(Tally::default());

    let pending: Vec<_> = (0..1_200)
        .map(|i| session.submit(Bytes::from(format!("item-{i}")), tally.clone()))
        .collect();
    let task_ids = futures::future::try_join_all(pending).await.unwrap();

    assert_eq!(grid.submit_batches(), vec![500, 500, 200]);
    assert_eq!(task_ids.iter().collect::<HashSet<_>>().len(), 1_200);
    assert_eq!(session.outstanding(), 1_200);
    assert!(task_ids.iter().all(|id| session.registry().contains(id)));

    assert_eq!(grid.complete_pending(), 1_200);
    session.shutdown().await;

    assert_eq!(session.outstanding(), 0);
    assert_eq!(tally.responses.load(Ordering::SeqCst), 1_200);
    assert_eq!(tally.errors.load(Ordering::SeqCst), 0);
    let payloads = tally.payloads.lock();
    assert!(payloads.contains(&b"item-0".to_vec()));
    assert!(payloads.contains(&b"item-1199".to_vec()));
}

#[tokio::test(start_paused = true)]
async fn test_status_polls_respect_chunk_size() {
    let grid = Arc::new(InMemoryGrid::new());
    let session = GridSession::open(
        grid.clone(),
        grid.clone(),
        ClientConfig {
            result_poll_chunk_size: 64,
            ..config(100)
        },
    )
    .await
    .unwrap();
    let tally = Arc::new(Tally::default());

    let pending: Vec<_> = (0..300)
        .map(|i| session.submit(Bytes::from(vec![i as u8]), tally.clone()))
        .collect();
    futures::future::try_join_all(pending).await.unwrap();
    grid.complete_pending();
    session.shutdown().await;

    assert_eq!(tally.responses.load(Ordering::SeqCst), 300);
    assert!(grid.status_query_sizes().iter().all(|size| *size <= 64));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_workers_and_throttled_submission() {
    let grid = Arc::new(InMemoryGrid::new().with_auto_complete(true));
    let session = GridSession::open(
        grid.clone(),
        grid.clone(),
        ClientConfig {
            max_parallel_channels: 3,
            max_concurrent_buffers: 2,
            ..config(50)
        },
    )
    .await
    .unwrap();
    let settled = Arc::new(AtomicUsize::new(0));

    let mut pending = Vec::new();
    for i in 0..400u32 {
        let settled = settled.clone();
        let request = TaskRequest::new(
            Bytes::from(i.to_le_bytes().to_vec()),
            handler_fn(
                move |_, _| {
                    settled.fetch_add(1, Ordering::SeqCst);
                },
                |error| panic!("unexpected failure: {error}"),
            ),
        );
        pending.push(session.submit_async(request).await);
    }
    futures::future::try_join_all(pending).await.unwrap();
    session.shutdown().await;

    let batches = grid.submit_batches();
    assert_eq!(batches.iter().sum::<usize>(), 400);
    assert!(batches.iter().all(|size| *size <= 50));
    assert_eq!(settled.load(Ordering::SeqCst), 400);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_with_nothing_submitted_returns() {
    let grid = Arc::new(InMemoryGrid::new());
    let session = GridSession::open(grid.clone(), grid.clone(), config(10))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), session.shutdown())
        .await
        .unwrap();
    assert_eq!(grid.task_count(), 0);
}
