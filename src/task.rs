use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{store::lock, Error};

/// Handle to a running saga task (the main run or a forked child).
///
/// The handle exposes a completion signal that settles when the task
/// finishes, successfully or not, and a cancel operation. It is cheap to
/// clone; all clones observe the same task.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    name: String,
    cancel: CancellationToken,
    // Latched once the task settles; a token doubles as a one-shot latch
    // that many waiters can await.
    done: CancellationToken,
    result: Mutex<Option<Result<Value, Error>>>,
}

impl TaskHandle {
    pub(crate) fn new(name: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                name: name.into(),
                cancel,
                done: CancellationToken::new(),
                result: Mutex::new(None),
            }),
        }
    }

    /// The name the task was forked under (`"main"` for the main run).
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Request cancellation. The task observes it at its next suspension
    /// point; in-flight effects are abandoned, not retried.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Wait until the task has settled (finished, failed, or was cancelled).
    pub async fn finished(&self) {
        self.inner.done.cancelled().await;
    }

    /// The task's outcome, once settled. Errors are captured here rather
    /// than re-raised anywhere.
    pub fn result(&self) -> Option<Result<Value, Error>> {
        lock(&self.inner.result).clone()
    }

    pub(crate) fn complete(&self, result: Result<Value, Error>) {
        *lock(&self.inner.result) = Some(result);
        self.inner.done.cancel();
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.inner.name)
            .field("finished", &self.is_finished())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn finished_resolves_after_complete() {
        let handle = TaskHandle::new("t", CancellationToken::new());
        assert!(!handle.is_finished());
        assert!(handle.result().is_none());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.finished().await })
        };
        tokio::task::yield_now().await;

        handle.complete(Ok(json!(1)));
        waiter.await.unwrap();
        assert!(handle.is_finished());
        assert_eq!(handle.result(), Some(Ok(json!(1))));
    }

    #[tokio::test]
    async fn errors_are_captured_not_raised() {
        let handle = TaskHandle::new("t", CancellationToken::new());
        handle.complete(Err(Error::Cancelled));
        handle.finished().await;
        assert_eq!(handle.result(), Some(Err(Error::Cancelled)));
    }

    #[test]
    fn cancel_trips_the_token() {
        let token = CancellationToken::new();
        let handle = TaskHandle::new("t", token.clone());
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(handle.is_cancelled());
        assert!(!handle.is_finished());
    }
}
