//! Registry of tasks waiting for their result.
//!
//! The submission pipeline inserts an entry once the grid has assigned a task id.
//! The result collector removes it when it settles the task. Removal through
//! [`OutstandingTasks::take`] is atomic per key, so a task is settled by whoever
//! removed it and by nobody else.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::gauge;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::error;

use crate::grid::types::{ResultId, TaskId};
use crate::handler::SharedHandler;
use crate::telemetry::names;

/// An entry of the registry.
pub struct PendingResult {
    /// Output slot polled for this task.
    pub result_id: ResultId,
    pub handler: SharedHandler,
    pub registered_at: Instant,
}

/// Concurrent map of outstanding task ids to their completion handlers.
#[derive(Default)]
pub struct OutstandingTasks {
    entries: DashMap<TaskId, PendingResult>,
    registered: Notify,
}

impl OutstandingTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. Returns `false` and keeps the existing entry when the id is
    /// already registered.
    pub fn register(&self, task_id: TaskId, result_id: ResultId, handler: SharedHandler) -> bool {
        let inserted = match self.entries.entry(task_id) {
            Entry::Occupied(existing) => {
                error!(task_id = %existing.key(), "Task id assigned twice, keeping first registration");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingResult {
                    result_id,
                    handler,
                    registered_at: Instant::now(),
                });
                true
            }
        };
        if inserted {
            gauge!(names::OUTSTANDING_TASKS).set(self.entries.len() as f64);
            self.registered.notify_waiters();
        }
        inserted
    }

    /// Copy of every `(task, output slot)` pair currently outstanding.
    pub fn snapshot(&self) -> Vec<(TaskId, ResultId)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().result_id.clone()))
            .collect()
    }

    /// Remove a task. Only the caller that gets `Some` may settle it.
    pub fn take(&self, task_id: &TaskId) -> Option<PendingResult> {
        let removed = self.entries.remove(task_id).map(|(_, pending)| pending);
        if removed.is_some() {
            gauge!(names::OUTSTANDING_TASKS).set(self.entries.len() as f64);
        }
        removed
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.entries.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Resolves on the next registration after this call.
    pub async fn registration(&self) {
        self.registered.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use std::sync::Arc;

    fn noop() -> SharedHandler {
        handler_fn(|_, _| {}, |_| {})
    }

    #[test]
    fn test_duplicate_ids_keep_first_entry() {
        let registry = OutstandingTasks::new();
        assert!(registry.register("t1".into(), "r1".into(), noop()));
        assert!(!registry.register("t1".into(), "r2".into(), noop()));

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.snapshot(),
            vec![(TaskId::from("t1"), ResultId::from("r1"))]
        );
    }

    #[test]
    fn test_take_succeeds_once() {
        let registry = OutstandingTasks::new();
        registry.register("t1".into(), "r1".into(), noop());

        assert!(registry.take(&"t1".into()).is_some());
        assert!(registry.take(&"t1".into()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_takers_settle_each_task_once() {
        let registry = Arc::new(OutstandingTasks::new());
        for i in 0..1_000 {
            registry.register(format!("t{i}").into(), format!("r{i}").into(), noop());
        }

        let winners: usize = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..1_000)
                        .filter(|i| registry.take(&format!("t{i}").into()).is_some())
                        .count()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .sum();

        assert_eq!(winners, 1_000);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_registration_wakes_waiters() {
        let registry = Arc::new(OutstandingTasks::new());
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.registration().await })
        };
        tokio::task::yield_now().await;

        registry.register("t1".into(), "r1".into(), noop());
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
