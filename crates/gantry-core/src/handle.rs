//! Result handles and the per-task state machine.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{JoinError, TaskError};
use crate::queue::BoundedQueue;
use crate::task::{HandleOps, Task, TaskId};

/// Observable lifecycle of one submitted task.
///
/// State transitions:
/// - Pending -> Running -> Completed | Failed
/// - Pending -> Cancelled (cancel before start; the body never runs)
/// - Running -> Cancelled (cancel with interrupt; the body keeps running
///   but its eventual result is discarded)
///
/// Exactly one terminal transition happens per task. Cancelling again, or
/// resolving after a cancel race, is a no-op; a second Completed/Failed
/// resolution is a caller bug and is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Admitted, not yet started.
    Pending,

    /// A worker (or the submitter, under CallerRuns) is executing the body.
    Running,

    /// Finished with a value.
    Completed,

    /// Finished with a [`TaskError`].
    Failed,

    /// Cancelled before completion.
    Cancelled,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

struct HandleCore<T> {
    task: Task,
    state: watch::Sender<TaskState>,
    value: Mutex<Option<Result<T, TaskError>>>,
    cancel: CancellationToken,
    /// Present when the task was submitted through a CompletionTracker.
    /// The terminal transition pushes a handle clone onto the pipe and
    /// releases the sender, so a finished handle does not keep the
    /// tracker's channel open.
    completion: Mutex<Option<mpsc::UnboundedSender<TaskHandle<T>>>>,
    /// Queue the entry sits in while Pending, for purge-on-cancel.
    queue: Weak<BoundedQueue>,
}

/// Shared handle to one task's state and eventual result.
///
/// Clones observe the same task. State queries (`state`, `wait`) are
/// repeatable; the value itself crosses once: the first successful `get`
/// takes it and later calls see [`JoinError::Retrieved`].
pub struct TaskHandle<T> {
    core: Arc<HandleCore<T>>,
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.core.task.id())
            .field("state", &*self.core.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    pub(crate) fn new(
        task: Task,
        cancel: CancellationToken,
        queue: Weak<BoundedQueue>,
        completion: Option<mpsc::UnboundedSender<TaskHandle<T>>>,
    ) -> Self {
        let (state, _) = watch::channel(TaskState::Pending);
        Self {
            core: Arc::new(HandleCore {
                task,
                state,
                value: Mutex::new(None),
                cancel,
                completion: Mutex::new(completion),
                queue,
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.core.task.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.core.task.name()
    }

    pub fn task(&self) -> &Task {
        &self.core.task
    }

    pub fn state(&self) -> TaskState {
        *self.core.state.borrow()
    }

    /// Wait until the task reaches a terminal state and return it.
    /// Repeatable: terminal states are sticky.
    pub async fn wait(&self) -> TaskState {
        let mut rx = self.core.state.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            // The sender lives in this handle, so the channel cannot close
            // before we observe a terminal state.
            Err(_) => self.state(),
        }
    }

    /// Wait for the result.
    ///
    /// Completed yields the value, Failed yields the task's error,
    /// Cancelled yields [`JoinError::Cancelled`].
    pub async fn get(&self) -> Result<T, JoinError> {
        let state = self.wait().await;
        self.take_result(state)
    }

    /// [`get`](TaskHandle::get) with an upper bound on the wait.
    /// Timing out does not cancel the task.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<T, JoinError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(state) => self.take_result(state),
            Err(_) => Err(JoinError::Timeout),
        }
    }

    fn take_result(&self, state: TaskState) -> Result<T, JoinError> {
        match state {
            TaskState::Cancelled => Err(JoinError::Cancelled),
            _ => match self.core.value.lock().take() {
                Some(Ok(value)) => Ok(value),
                Some(Err(error)) => Err(JoinError::Failed(error)),
                None => Err(JoinError::Retrieved),
            },
        }
    }

    /// Request cancellation.
    ///
    /// A Pending task cancels immediately: its queue entry is purged and
    /// the body never runs. A Running task is only cancelled when
    /// `interrupt` is true: the state flips to Cancelled and the body's
    /// token fires, while the body itself keeps running until it observes
    /// the token (or finishes; either way its result is discarded).
    ///
    /// Returns true when this call cancelled the task. Repeated calls and
    /// calls after a terminal state are no-ops returning false.
    pub fn cancel(&self, interrupt: bool) -> bool {
        if self.transition(TaskState::Cancelled, |s| s == TaskState::Pending) {
            self.core.cancel.cancel();
            if let Some(queue) = self.core.queue.upgrade() {
                queue.remove(self.id());
            }
            self.notify_completion();
            debug!(task = %self.id(), "cancelled before start");
            return true;
        }
        if !interrupt {
            return false;
        }
        if self.transition(TaskState::Cancelled, |s| s == TaskState::Running) {
            self.core.cancel.cancel();
            self.notify_completion();
            debug!(task = %self.id(), "cancelled while running");
            return true;
        }
        false
    }

    /// Pending -> Running. False means a cancel won the race and the body
    /// must not be invoked.
    pub(crate) fn begin_running(&self) -> bool {
        self.transition(TaskState::Running, |s| s == TaskState::Pending)
    }

    /// Resolve to Completed or Failed.
    ///
    /// The value is published inside the state transition, so a waiter that
    /// observes the terminal state always finds the value in place.
    pub(crate) fn resolve(&self, result: Result<T, TaskError>) {
        let to = if result.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        let mut slot = Some(result);
        let won = self.core.state.send_if_modified(|s| {
            if s.is_terminal() {
                return false;
            }
            *self.core.value.lock() = slot.take();
            *s = to;
            true
        });
        if won {
            self.notify_completion();
            return;
        }
        if self.state() == TaskState::Cancelled {
            // Normal race: the task was cancelled while the body ran.
            debug!(task = %self.id(), "result discarded after cancellation");
        } else {
            warn!(task = %self.id(), "task resolved twice, second result ignored");
        }
    }

    fn transition(&self, to: TaskState, allow: impl FnOnce(TaskState) -> bool) -> bool {
        self.core.state.send_if_modified(|s| {
            if allow(*s) {
                *s = to;
                true
            } else {
                false
            }
        })
    }

    fn notify_completion(&self) {
        if let Some(tx) = self.core.completion.lock().take() {
            // ignore send error: the tracker may already be dropped
            let _ = tx.send(self.clone());
        }
    }
}

impl<T: Send + 'static> HandleOps for TaskHandle<T> {
    fn task(&self) -> &Task {
        &self.core.task
    }

    fn cancel_token(&self) -> CancellationToken {
        self.core.cancel.clone()
    }

    fn begin_running(&self) -> bool {
        TaskHandle::begin_running(self)
    }

    fn fail_panic(&self, message: String) {
        self.resolve(Err(TaskError::Panicked(message)));
    }

    fn resolve_discarded(&self) {
        if self.transition(TaskState::Cancelled, |s| s == TaskState::Pending) {
            self.core.cancel.cancel();
            self.notify_completion();
        }
    }
}
