//! Size-or-inactivity batching of a stream of items.
//!
//! [`AdaptiveBatcher`] accepts items without waiting and groups them into batches
//! in arrival order. A batch is emitted when the buffer reaches `batch_size`, when
//! `timeout` passes without a new item, or on [`AdaptiveBatcher::trigger_batch`].
//! The inactivity timer is armed by every accepted item and disarmed by every
//! emission. [`AdaptiveBatcher::complete`] flushes the partial buffer and ends the
//! output stream.

use futures::Stream;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Batching parameters.
#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    /// Maximum items per batch.
    pub batch_size: usize,
    /// Inactivity delay before a partial batch is emitted.
    pub timeout: Duration,
    /// Emitted batches buffered ahead of the consumer.
    pub output_capacity: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            timeout: Duration::from_secs(1),
            output_capacity: 1,
        }
    }
}

enum Command<T> {
    Item(T),
    Trigger,
}

/// Producer side of the batcher.
pub struct AdaptiveBatcher<T> {
    commands: Mutex<Option<mpsc::UnboundedSender<Command<T>>>>,
}

/// Consumer side of the batcher.
pub struct BatchReceiver<T> {
    batches: mpsc::Receiver<Vec<T>>,
}

impl<T: Send + 'static> AdaptiveBatcher<T> {
    /// Create a batcher and spawn its timer task on the current runtime.
    pub fn new(config: BatcherConfig) -> (Self, BatchReceiver<T>) {
        let batch_size = config.batch_size.max(1);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (batch_tx, batch_rx) = mpsc::channel(config.output_capacity.max(1));

        tokio::spawn(run_batcher(command_rx, batch_tx, batch_size, config.timeout));

        (
            Self {
                commands: Mutex::new(Some(command_tx)),
            },
            BatchReceiver { batches: batch_rx },
        )
    }

    /// Enqueue an item. Returns `false` once the batcher is completed.
    pub fn offer(&self, item: T) -> bool {
        let commands = self.commands.lock();
        match commands.as_ref() {
            Some(tx) => tx.send(Command::Item(item)).is_ok(),
            None => false,
        }
    }

    /// Emit the current partial batch now.
    pub fn trigger_batch(&self) {
        if let Some(tx) = self.commands.lock().as_ref() {
            let _ = tx.send(Command::Trigger);
        }
    }

    /// Stop accepting items. Items already accepted are still emitted, then the
    /// output stream ends.
    pub fn complete(&self) {
        if self.commands.lock().take().is_some() {
            debug!("Batcher completed");
        }
    }

    pub fn is_completed(&self) -> bool {
        self.commands.lock().is_none()
    }
}

impl<T: Send + 'static> BatchReceiver<T> {
    /// Next batch, or `None` after completion.
    pub async fn recv(&mut self) -> Option<Vec<T>> {
        self.batches.recv().await
    }

    /// Drive `handler` with every batch, one at a time, on a spawned task.
    pub fn on_batch<F, Fut>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(Vec<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        tokio::spawn(async move {
            while let Some(batch) = self.batches.recv().await {
                handler(batch).await;
            }
        })
    }

    pub fn into_stream(self) -> impl Stream<Item = Vec<T>> {
        futures::stream::unfold(self, |mut receiver| async move {
            receiver.recv().await.map(|batch| (batch, receiver))
        })
    }
}

async fn run_batcher<T>(
    mut commands: mpsc::UnboundedReceiver<Command<T>>,
    batches: mpsc::Sender<Vec<T>>,
    batch_size: usize,
    timeout: Duration,
) {
    let mut buffer: Vec<T> = Vec::with_capacity(batch_size);
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => tokio::select! {
                biased;
                command = commands.recv() => command,
                _ = sleep_until(at) => {
                    deadline = None;
                    debug!(items = buffer.len(), "Inactivity timeout, emitting batch");
                    if !emit(&batches, &mut buffer, batch_size).await {
                        return;
                    }
                    continue;
                }
            },
            None => commands.recv().await,
        };

        match command {
            Some(Command::Item(item)) => {
                buffer.push(item);
                if buffer.len() >= batch_size {
                    deadline = None;
                    if !emit(&batches, &mut buffer, batch_size).await {
                        return;
                    }
                } else {
                    deadline = Some(Instant::now() + timeout);
                }
            }
            Some(Command::Trigger) => {
                deadline = None;
                if !buffer.is_empty() && !emit(&batches, &mut buffer, batch_size).await {
                    return;
                }
            }
            None => {
                if !buffer.is_empty() {
                    emit(&batches, &mut buffer, batch_size).await;
                }
                return;
            }
        }
    }
}

/// Returns `false` when the consumer is gone.
async fn emit<T>(batches: &mpsc::Sender<Vec<T>>, buffer: &mut Vec<T>, batch_size: usize) -> bool {
    let batch = std::mem::replace(buffer, Vec::with_capacity(batch_size));
    if batches.send(batch).await.is_err() {
        debug!("Batch consumer dropped, stopping batcher");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::Arc;

    fn batcher(batch_size: usize, timeout_ms: u64) -> (AdaptiveBatcher<u32>, BatchReceiver<u32>) {
        AdaptiveBatcher::new(BatcherConfig {
            batch_size,
            timeout: Duration::from_millis(timeout_ms),
            output_capacity: 4,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_emits_without_waiting() {
        let (batcher, mut batches) = batcher(5, 200);
        let start = Instant::now();

        for i in 0..5 {
            assert!(batcher.offer(i));
        }

        assert_eq!(batches.recv().await, Some(vec![0, 1, 2, 3, 4]));
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_emits_partial_batch() {
        let (batcher, mut batches) = batcher(5, 200);
        let start = Instant::now();

        batcher.offer(1);
        batcher.offer(2);

        assert_eq!(batches.recv().await, Some(vec![1, 2]));
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_items_join_the_pending_batch() {
        let (batcher, mut batches) = batcher(5, 200);
        let start = Instant::now();

        batcher.offer(1);
        batcher.offer(2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        for i in 3..=5 {
            batcher.offer(i);
        }

        assert_eq!(batches.recv().await, Some(vec![1, 2, 3, 4, 5]));
        assert!(start.elapsed() < Duration::from_millis(200));
        batcher.complete();
        assert_eq!(batches.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_item_restarts_the_timer() {
        let (batcher, mut batches) = batcher(10, 200);

        batcher.offer(1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        batcher.offer(2);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(batches.batches.try_recv().is_err());

        let start = Instant::now();
        assert_eq!(batches.recv().await, Some(vec![1, 2]));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_flushes_partial_buffer() {
        let (batcher, mut batches) = batcher(10, 60_000);

        batcher.trigger_batch();
        batcher.offer(7);
        batcher.offer(8);
        batcher.trigger_batch();

        let start = Instant::now();
        assert_eq!(batches.recv().await, Some(vec![7, 8]));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_flushes_and_rejects_new_items() {
        let (batcher, batches) = batcher(5, 60_000);

        for i in 0..12 {
            batcher.offer(i);
        }
        batcher.complete();
        assert!(!batcher.offer(99));
        assert!(batcher.is_completed());

        let emitted: Vec<Vec<u32>> = batches.into_stream().collect().await;
        assert_eq!(
            emitted,
            vec![vec![0, 1, 2, 3, 4], vec![5, 6, 7, 8, 9], vec![10, 11]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_batch_handler_sees_every_batch() {
        let (batcher, batches) = batcher(3, 100);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let consumer = batches.on_batch(move |batch| {
            let sink = sink.clone();
            async move {
                sink.lock().push(batch.len());
            }
        });

        for i in 0..7 {
            batcher.offer(i);
        }
        batcher.complete();
        consumer.await.unwrap();

        assert_eq!(*seen.lock(), vec![3, 3, 1]);
    }
}
