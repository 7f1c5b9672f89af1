//! Scheduler - 周期 submit の driver
//!
//! # 設計
//! 周期ごとに pool へ普通の task を submit し直す薄い driver。
//! body の実行は常に pool の worker 側で、driver は時計と状態だけを
//! 持つ。pool が飽和していれば fire も普通に reject される。
//!
//! # 周期の数え方
//! - FixedRate:  次回 = 予定時刻 + period。実行が長引いた分は
//!   詰めて追いつく（fire を欠番にしない）
//! - FixedDelay: 次回 = 完了時刻 + period。常に一定の間隔を空ける
//!
//! # 停止条件
//! cancel / pool shutdown / run の失敗 / period = 0 の one-shot。
//! どの経路でも「走り出した run は最後まで」が守られる。

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::handle::TaskState;
use crate::pool::Pool;
use crate::task::TaskContext;

/// 次回実行時刻の数え方。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    /// 予定時刻基準。遅延しても周期の格子に戻ろうとする。
    FixedRate,
    /// 完了時刻基準。run と run のあいだに必ず period を空ける。
    FixedDelay,
}

/// Schedule の外から見える状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    /// 次の fire を待っている。
    Waiting,
    /// fire した run が走っている。
    Running,
    /// cancel または pool shutdown で止まった。
    Cancelled,
    /// one-shot の完走、または run の失敗で停止した。
    Finished,
}

/// 周期 submit の制御 handle。
///
/// drop しても schedule は止まらない。止めるのは [`cancel`] だけ。
///
/// [`cancel`]: ScheduledHandle::cancel
#[derive(Debug)]
pub struct ScheduledHandle {
    name: Option<String>,
    state: watch::Receiver<ScheduleState>,
    runs_started: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl ScheduledHandle {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> ScheduleState {
        *self.state.borrow()
    }

    /// これまでに走り出した run の数（実行中のものを含む）。
    /// admission に蹴られた fire は数えない。
    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::Relaxed)
    }

    /// 以後の fire を止める。実行中の run は最後まで走る。
    /// 何度呼んでも安全。
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub(crate) fn spawn_schedule<F, Fut>(
    pool: Pool,
    name: Option<String>,
    initial_delay: Duration,
    period: Duration,
    mode: ScheduleMode,
    body: F,
) -> ScheduledHandle
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    let (state_tx, state_rx) = watch::channel(ScheduleState::Waiting);
    let runs_started = Arc::new(AtomicU64::new(0));
    let cancel = CancellationToken::new();

    let driver = Driver {
        pool,
        name: name.clone(),
        period,
        mode,
        body: Arc::new(body),
        state: state_tx,
        runs_started: Arc::clone(&runs_started),
        cancel: cancel.clone(),
    };
    tokio::spawn(driver.run(initial_delay));

    ScheduledHandle {
        name,
        state: state_rx,
        runs_started,
        cancel,
    }
}

struct Driver<F> {
    pool: Pool,
    name: Option<String>,
    period: Duration,
    mode: ScheduleMode,
    body: Arc<F>,
    state: watch::Sender<ScheduleState>,
    runs_started: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl<F, Fut> Driver<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn run(self, initial_delay: Duration) {
        let mut next = Instant::now() + initial_delay;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = self.state.send(ScheduleState::Cancelled);
                    debug!(schedule = self.label(), "schedule cancelled");
                    return;
                }
                _ = self.pool.shutting_down() => {
                    let _ = self.state.send(ScheduleState::Cancelled);
                    debug!(schedule = self.label(), "schedule stopped by pool shutdown");
                    return;
                }
                _ = tokio::time::sleep_until(next) => {}
            }

            let scheduled_for = next;
            let _ = self.state.send(ScheduleState::Running);

            let fire = {
                let body = Arc::clone(&self.body);
                move |ctx: TaskContext| (body)(ctx)
            };
            let handle = match self
                .pool
                .submit_inner::<(), _, _>(self.name.clone(), fire, None)
                .await
            {
                Ok(handle) => handle,
                // shutdown と fire が入れ違った場合は select 側と同じ扱い
                Err(crate::error::RejectedError::ShutDown) => {
                    let _ = self.state.send(ScheduleState::Cancelled);
                    debug!(schedule = self.label(), "schedule stopped by pool shutdown");
                    return;
                }
                Err(error) => {
                    warn!(schedule = self.label(), %error, "fire rejected, schedule halted");
                    let _ = self.state.send(ScheduleState::Finished);
                    return;
                }
            };
            // 数えるのは admission を通った fire だけ
            self.runs_started.fetch_add(1, Ordering::Relaxed);

            // 走り出した run は最後まで見届ける
            let outcome = handle.wait().await;
            if outcome != TaskState::Completed {
                debug!(
                    schedule = self.label(),
                    ?outcome,
                    "run did not complete, schedule halted"
                );
                let _ = self.state.send(ScheduleState::Finished);
                return;
            }

            // period 0 は one-shot
            if self.period.is_zero() {
                let _ = self.state.send(ScheduleState::Finished);
                return;
            }

            next = match self.mode {
                ScheduleMode::FixedRate => scheduled_for + self.period,
                ScheduleMode::FixedDelay => Instant::now() + self.period,
            };
            let _ = self.state.send(ScheduleState::Waiting);
        }
    }

    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }
}
