//! Background tasks with first-finished outcome collection.
//!
//! [`TaskQueue`] runs futures as named background tasks and hands their
//! outcomes back in completion order, like `as_completed()` over a set of
//! futures. Each task carries a user tag which is returned alongside the
//! value or failure, so the owner can tell which unit of work finished
//! without keeping its own bookkeeping. Tasks are aborted when the queue is
//! dropped; cancellation during a run stays cooperative (tasks observe
//! their own tokens and return promptly).

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::JoinSet;

/// Outcome of one finished task: its tag plus either the returned value or
/// the task's panic message.
pub struct Finished<G, T> {
    pub tag: G,
    pub result: Result<T, TaskPanic>,
}

/// A background task panicked instead of returning.
#[derive(Debug, thiserror::Error)]
#[error("background task panicked: {0}")]
pub struct TaskPanic(pub String);

/// Runs tagged background tasks, collecting outcomes first-finished.
pub struct TaskQueue<G, T> {
    tasks: JoinSet<Finished<G, T>>,
}

impl<G, T> TaskQueue<G, T>
where
    G: Send + 'static,
    T: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
        }
    }

    /// Number of tasks not yet collected.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Starts `future` as a background task tagged with `tag`.
    ///
    /// A panic inside the task is captured and reported as the task's
    /// outcome rather than unwinding the collector.
    pub fn spawn<F>(&mut self, tag: G, future: F)
    where
        F: std::future::Future<Output = T> + Send + 'static,
    {
        self.tasks.spawn(async move {
            let result = AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .map_err(|payload| TaskPanic(panic_message(payload)));
            Finished { tag, result }
        });
    }

    /// Waits for the next task to finish, in completion order.
    ///
    /// Returns `None` when no tasks are live (never blocks forever on an
    /// empty queue).
    pub async fn next(&mut self) -> Option<Finished<G, T>> {
        loop {
            match self.tasks.join_next().await? {
                Ok(finished) => return Some(finished),
                // aborted during shutdown; nothing to report
                Err(err) if err.is_cancelled() => continue,
                Err(err) => unreachable!("task panics are caught in spawn: {err}"),
            }
        }
    }

    /// Non-blocking variant of [`next`](Self::next): returns `None` when no
    /// task has finished yet (or none are live).
    pub fn try_next(&mut self) -> Option<Finished<G, T>> {
        loop {
            match self.tasks.try_join_next()? {
                Ok(finished) => return Some(finished),
                Err(err) if err.is_cancelled() => continue,
                Err(err) => unreachable!("task panics are caught in spawn: {err}"),
            }
        }
    }

    /// Waits for all live tasks to finish, discarding their outcomes.
    pub async fn join(&mut self) {
        while self.tasks.join_next().await.is_some() {}
    }
}

impl<G, T> Default for TaskQueue<G, T>
where
    G: Send + 'static,
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn outcomes_arrive_in_completion_order() {
        let mut q = TaskQueue::new();
        q.spawn("slow", async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            1
        });
        q.spawn("fast", async { 2 });

        let first = q.next().await.unwrap();
        assert_eq!(first.tag, "fast");
        assert_eq!(first.result.unwrap(), 2);

        let second = q.next().await.unwrap();
        assert_eq!(second.tag, "slow");
        assert_eq!(second.result.unwrap(), 1);

        assert!(q.next().await.is_none());
    }

    #[tokio::test]
    async fn panics_surface_as_failures_with_their_tag() {
        let mut q: TaskQueue<&str, ()> = TaskQueue::new();
        q.spawn("boom", async { panic!("it broke") });

        let finished = q.next().await.unwrap();
        assert_eq!(finished.tag, "boom");
        let err = finished.result.unwrap_err();
        assert!(err.0.contains("it broke"));
    }

    #[tokio::test]
    async fn try_next_returns_none_when_nothing_finished() {
        let mut q: TaskQueue<&str, ()> = TaskQueue::new();
        assert!(q.try_next().is_none());

        q.spawn("pending", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert!(q.try_next().is_none());
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn join_drains_everything() {
        let mut q = TaskQueue::new();
        for i in 0..5 {
            q.spawn(i, async move { i * 2 });
        }
        q.join().await;
        assert!(q.is_empty());
    }
}
