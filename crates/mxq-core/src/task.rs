//! Background tasks with kill and completion-callback semantics.
//!
//! Long-running operations (a queue run, a centring procedure, a motor
//! move) run as spawned tokio tasks behind a [`TaskHandle`]:
//!
//! - `join()` waits for the result, reporting kills and panics as
//!   [`TaskError`]
//! - `kill()` aborts the task at its next suspension point
//! - `link()` runs a completion callback after the task has fully ended,
//!   while keeping the ability to kill the original task
//!
//! Bounded waits go through [`with_timeout`] and [`wait_for`], which turn an
//! expired bound into a [`TimeoutError`].

use crate::error::{TaskError, TimeoutError};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::debug;

/// Kill switch for a spawned task, detached from its result.
#[derive(Debug, Clone)]
pub struct TaskKiller {
    name: String,
    abort: AbortHandle,
}

impl TaskKiller {
    /// Abort the task. Has no effect once it has finished.
    pub fn kill(&self) {
        if !self.abort.is_finished() {
            debug!(task = %self.name, "Killing task");
        }
        self.abort.abort();
    }

    /// True once the task has completed, panicked or been killed.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Handle to a spawned background task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    name: String,
    join: JoinHandle<T>,
    /// Kill switch of the task the caller actually cares about. For a linked
    /// task this is the original task, not the completion callback.
    killer: TaskKiller,
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Spawn `future` on the current runtime.
    pub fn spawn<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let name = name.into();
        let join = tokio::spawn(future);
        let killer = TaskKiller {
            name: name.clone(),
            abort: join.abort_handle(),
        };
        Self { name, join, killer }
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kill switch usable after the handle has been consumed.
    pub fn killer(&self) -> TaskKiller {
        self.killer.clone()
    }

    /// Abort the task.
    pub fn kill(&self) {
        self.killer.kill();
    }

    /// True once the task has ended.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task's result.
    pub async fn join(self) -> Result<T, TaskError> {
        let name = self.name;
        self.join.await.map_err(|e| join_error(&name, e))
    }

    /// Run `on_done` once this task has ended, whatever the outcome.
    ///
    /// The returned handle resolves to the callback's output; killing it
    /// kills the original task, after which the callback still runs and
    /// receives [`TaskError::Killed`].
    pub fn link<F, Fut, U>(self, on_done: F) -> TaskHandle<U>
    where
        F: FnOnce(Result<T, TaskError>) -> Fut + Send + 'static,
        Fut: Future<Output = U> + Send + 'static,
        U: Send + 'static,
    {
        let killer = self.killer.clone();
        let name = format!("{}:done", self.name);
        let task_name = self.name;
        let join = self.join;
        let linked = tokio::spawn(async move {
            let result = join.await.map_err(|e| join_error(&task_name, e));
            on_done(result).await
        });
        TaskHandle {
            name,
            join: linked,
            killer,
        }
    }
}

fn join_error(name: &str, err: JoinError) -> TaskError {
    if err.is_cancelled() {
        TaskError::Killed(name.to_string())
    } else {
        let message = match err.try_into_panic() {
            Ok(payload) => payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string()),
            Err(_) => "unknown failure".to_string(),
        };
        TaskError::Panicked {
            name: name.to_string(),
            message,
        }
    }
}

/// Await `future`, failing with a [`TimeoutError`] after `timeout`.
pub async fn with_timeout<F: Future>(
    what: &str,
    timeout: Duration,
    future: F,
) -> Result<F::Output, TimeoutError> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| TimeoutError::new(what, timeout))
}

/// Wait until the watched value satisfies `predicate`.
///
/// `None` waits without bound. A closed channel ends the wait with the
/// last value seen, which the caller re-checks.
pub async fn wait_for<T, P>(
    rx: &mut watch::Receiver<T>,
    what: &str,
    timeout: Option<Duration>,
    mut predicate: P,
) -> Result<(), TimeoutError>
where
    P: FnMut(&T) -> bool,
{
    let wait = async {
        // A closed channel can no longer change; give up waiting.
        let _ = rx.wait_for(|value| predicate(value)).await;
    };
    match timeout {
        Some(timeout) => with_timeout(what, timeout, wait).await,
        None => {
            wait.await;
            Ok(())
        }
    }
}
