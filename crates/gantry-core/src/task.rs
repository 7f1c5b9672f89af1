//! Task identity and execution context.

use std::fmt;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// Monotonic task identifier.
///
/// Allocated at submission from a per-pool counter, so ids reflect
/// submission order: a task submitted later always has a larger id.
/// Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Immutable description of one submitted task.
///
/// The executable body is not part of this record: it travels beside it in
/// the queue entry and is consumed exactly once when the run starts. What
/// remains here is safe to clone, log, and hand back from
/// [`Pool::shutdown_now`](crate::pool::Pool::shutdown_now).
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    name: Option<String>,
    submitted_at: DateTime<Utc>,
}

impl Task {
    pub(crate) fn new(id: TaskId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            submitted_at: Utc::now(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Human-readable label for logs, if one was given at submission.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }
}

/// Execution context handed to a task body.
///
/// Cancellation is cooperative: `cancel(true)` on the handle, or an
/// immediate pool shutdown, fires the token. The body decides when (and
/// whether) to observe it; nothing is ever aborted from the outside.
#[derive(Debug, Clone)]
pub struct TaskContext {
    id: TaskId,
    name: Option<String>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(task: &Task, cancel: CancellationToken) -> Self {
        Self {
            id: task.id(),
            name: task.name().map(str::to_owned),
            cancel,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Has cancellation been requested for this run?
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested. Useful inside `select!`.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Type-erased task body. Builds the run future on its first (and only)
/// call; dropping it unrun is how cancel-before-start guarantees the body
/// never executes.
pub(crate) type BoxedRun = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, ()> + Send>;

/// Type-erased view of a result handle.
///
/// The typed side lives in [`TaskHandle`](crate::handle::TaskHandle);
/// workers and the queue only need the transitions that do not touch the
/// result value.
pub(crate) trait HandleOps: Send + Sync {
    fn task(&self) -> &Task;

    fn cancel_token(&self) -> CancellationToken;

    /// Pending -> Running. False means the task was cancelled before start.
    fn begin_running(&self) -> bool;

    /// Terminal Failed with a panic message, from the worker boundary.
    fn fail_panic(&self, message: String);

    /// Terminal Cancelled, used by discard policies and immediate shutdown.
    fn resolve_discarded(&self);
}

/// One queue entry: the erased handle plus the body to run.
pub(crate) struct QueuedTask {
    pub(crate) ops: Box<dyn HandleOps>,
    pub(crate) run: BoxedRun,
}

impl QueuedTask {
    pub(crate) fn id(&self) -> TaskId {
        self.ops.task().id()
    }
}
