//! Completion callbacks for submitted tasks.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::error::ServiceInvocationError;
use crate::grid::types::TaskId;

/// Receives the single terminal outcome of a task.
///
/// Exactly one of the two methods is called per registered task. Both run on
/// the result collector task; long work should be handed off.
pub trait ResultHandler: Send + Sync {
    fn on_response(&self, task_id: &TaskId, payload: Bytes);

    fn on_error(&self, error: ServiceInvocationError);
}

/// Shared handler reference stored in the outstanding registry.
pub type SharedHandler = Arc<dyn ResultHandler>;

/// Handler built from two closures.
pub struct FnHandler<R, E> {
    on_response: R,
    on_error: E,
}

impl<R, E> fmt::Debug for FnHandler<R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

impl<R, E> ResultHandler for FnHandler<R, E>
where
    R: Fn(&TaskId, Bytes) + Send + Sync,
    E: Fn(ServiceInvocationError) + Send + Sync,
{
    fn on_response(&self, task_id: &TaskId, payload: Bytes) {
        (self.on_response)(task_id, payload)
    }

    fn on_error(&self, error: ServiceInvocationError) {
        (self.on_error)(error)
    }
}

/// Wrap two closures into a [`SharedHandler`].
pub fn handler_fn<R, E>(on_response: R, on_error: E) -> SharedHandler
where
    R: Fn(&TaskId, Bytes) + Send + Sync + 'static,
    E: Fn(ServiceInvocationError) + Send + Sync + 'static,
{
    Arc::new(FnHandler {
        on_response,
        on_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::types::StatusCode;
    use parking_lot::Mutex;

    #[test]
    fn test_closure_handler_routes_outcomes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ok_log = log.clone();
        let err_log = log.clone();
        let handler = handler_fn(
            move |task_id, payload| ok_log.lock().push(format!("{task_id}:{}", payload.len())),
            move |error| err_log.lock().push(format!("{}:{}", error.task_id, error.status)),
        );

        handler.on_response(&"t1".into(), Bytes::from_static(b"abc"));
        handler.on_error(ServiceInvocationError::new(
            "t2".into(),
            StatusCode::TaskFailed,
            "boom",
        ));

        assert_eq!(*log.lock(), vec!["t1:3", "t2:TaskFailed"]);
    }
}
