//! Cancellable, supersedable background tasks.

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::is_cancellation;

/// Completion of a spawned task, awaitable from any number of places.
pub(crate) type TaskDone = Shared<BoxFuture<'static, ()>>;

struct RunningTask {
    token: CancellationToken,
    done: TaskDone,
}

/// Holds the single task owned by a query or mutation instance.
///
/// Starting a task cancels the one before it. The new task waits for its
/// predecessor to run its settle step before it starts, so two tasks of
/// the same owner never touch state at the same time.
#[derive(Default)]
pub(crate) struct TaskSlot {
    current: Mutex<Option<RunningTask>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the running task, if any, and spawn a new one.
    ///
    /// `body` receives the token of the new task and must stop once it is
    /// cancelled.
    pub fn replace<F, Fut>(&self, handle: &Handle, body: F) -> TaskDone
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let mut current = self.current.lock();
        let previous = current.take().map(|task| {
            task.token.cancel();
            task.done
        });

        let task_token = token.clone();
        let join = handle.spawn(async move {
            if let Some(previous) = previous {
                previous.await;
            }
            body(task_token).await;
        });
        // A panicking body is contained in the join error and must not
        // poison the waiters.
        let done: TaskDone = join.map(|_| ()).boxed().shared();

        *current = Some(RunningTask {
            token,
            done: done.clone(),
        });
        done
    }

    /// Cancel the running task. No-op if nothing is running.
    pub fn cancel(&self) {
        if let Some(task) = self.current.lock().as_ref() {
            task.token.cancel();
        }
    }

    /// Completion of the most recently started task.
    pub fn current(&self) -> Option<TaskDone> {
        self.current.lock().as_ref().map(|task| task.done.clone())
    }

    /// Wait until the most recently started task has finished.
    pub async fn settled(&self) {
        let done = self.current();
        if let Some(done) = done {
            done.await;
        }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if let Some(task) = self.current.get_mut().as_ref() {
            task.token.cancel();
        }
    }
}

/// Run `fut` until it completes or `token` is cancelled.
pub(crate) async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        value = fut => Some(value),
    }
}

/// How a fetcher or mutator call ended.
pub(crate) enum Settled<T> {
    Done(T),
    Failed(Arc<anyhow::Error>),
    Cancelled,
}

/// Run a callback future under `token`, classifying its result.
pub(crate) async fn settle<T>(
    token: &CancellationToken,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> Settled<T> {
    match cancellable(token, fut).await {
        None => Settled::Cancelled,
        Some(Ok(value)) => Settled::Done(value),
        Some(Err(e)) if is_cancellation(&e) => Settled::Cancelled,
        Some(Err(e)) => Settled::Failed(Arc::new(e)),
    }
}
