//! RejectionPolicy - 飽和時の振る舞い
//!
//! worker が `max_size` に達し、queue にも入らないときだけ呼ばれる。
//! policy は outcome を返すだけで、実際の処理は admission 側が行う。
//! こうすることで user hook が pool の不変条件を壊せない。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::observability::PoolSnapshot;
use crate::task::Task;

/// What the admission path does with a task it cannot place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionOutcome {
    /// Fail the submission with [`RejectedError::Saturated`].
    ///
    /// [`RejectedError::Saturated`]: crate::error::RejectedError::Saturated
    RejectWithError,

    /// Run the task inline on the submitting context.
    RunInline,

    /// Resolve the new task's handle Cancelled and drop its body.
    DropSilently,

    /// Evict the oldest queued task (resolving it Cancelled), then retry
    /// the enqueue once. A failed retry falls back to RejectWithError.
    DropOldestThenRetry,
}

/// Hook consulted on saturation when the policy is [`RejectionPolicy::Custom`].
#[async_trait]
pub trait RejectionHook: Send + Sync {
    /// `task` は置き場のなかった新規タスク、`snapshot` は判断材料。
    async fn on_saturated(&self, task: &Task, snapshot: &PoolSnapshot) -> RejectionOutcome;
}

/// Saturation policy.
///
/// 最初の4つは古典的な bounded pool のセット。Custom だけが
/// user code に判断を委ねる。
#[derive(Clone, Default)]
pub enum RejectionPolicy {
    /// Refuse the submission synchronously. 新規タスクは observable に
    /// ならない（handle も completion 通知も出ない）。
    #[default]
    Abort,

    /// The submitter runs the task itself, as natural backpressure.
    CallerRuns,

    /// Drop the new task silently; its handle resolves Cancelled.
    DiscardNewest,

    /// Sacrifice the oldest queued task to make room for the new one.
    DiscardOldest,

    /// Delegate the decision to a [`RejectionHook`].
    Custom(Arc<dyn RejectionHook>),
}

impl RejectionPolicy {
    /// Resolve the policy to an outcome for one saturated submission.
    pub(crate) async fn decide(&self, task: &Task, snapshot: &PoolSnapshot) -> RejectionOutcome {
        match self {
            RejectionPolicy::Abort => RejectionOutcome::RejectWithError,
            RejectionPolicy::CallerRuns => RejectionOutcome::RunInline,
            RejectionPolicy::DiscardNewest => RejectionOutcome::DropSilently,
            RejectionPolicy::DiscardOldest => RejectionOutcome::DropOldestThenRetry,
            RejectionPolicy::Custom(hook) => hook.on_saturated(task, snapshot).await,
        }
    }
}

impl fmt::Debug for RejectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RejectionPolicy::Abort => "Abort",
            RejectionPolicy::CallerRuns => "CallerRuns",
            RejectionPolicy::DiscardNewest => "DiscardNewest",
            RejectionPolicy::DiscardOldest => "DiscardOldest",
            RejectionPolicy::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}
