//! Worker - queue から task を引いて実行するループと、その起動抽象
//!
//! # 設計
//! - worker は長生きの spawned task。queue から 1 件ずつ引いて実行する
//! - task 内の panic は worker 境界で捕まえて、その task の handle だけを
//!   Failed(Panicked) にする。loop 自体は生き残る（隔離）
//! - core を超えた worker は keep_alive のあいだ仕事が無ければ退役する

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{Instrument, debug, debug_span, warn};

use crate::pool::PoolShared;
use crate::queue::Dequeued;
use crate::task::{QueuedTask, TaskContext};

/// Worker の起動方法の抽象化
///
/// 通常は [`TokioWorkerFactory`]。テストで起動失敗を注入したり、
/// 別の spawn 方法に差し替えるための縫い目。
pub trait WorkerFactory: Send + Sync {
    /// Spawn one worker driving `body`. `name` becomes the worker's span
    /// label. Err は起動失敗で、submitter へ
    /// `RejectedError::WorkerSpawn` として返る。
    fn spawn(&self, name: &str, body: BoxFuture<'static, ()>) -> Result<(), String>;
}

/// `tokio::spawn` + tracing span の素直な factory.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioWorkerFactory;

impl WorkerFactory for TokioWorkerFactory {
    fn spawn(&self, name: &str, body: BoxFuture<'static, ()>) -> Result<(), String> {
        let span = debug_span!("worker", name = %name);
        tokio::spawn(body.instrument(span));
        Ok(())
    }
}

/// 1 worker の実行ループ
///
/// `initial` があればまず実行する（admission が worker 起動と同時に
/// task を直接束ねたケース）。その後は queue を引き続ける。
pub(crate) async fn worker_loop(shared: Arc<PoolShared>, initial: Option<QueuedTask>) {
    debug!("worker started");
    if let Some(entry) = initial {
        run_task(&shared, entry).await;
    }

    let exit_reason = loop {
        let next = if shared.worker_may_retire() {
            match tokio::time::timeout(shared.config.keep_alive, shared.queue.dequeue()).await {
                Ok(next) => next,
                Err(_) => {
                    // idle timeout。ただし退役は pool 側の確認が必要
                    // （待っている間に他の worker が先に抜けたかもしれない）
                    if shared.confirm_retirement() {
                        break "idle timeout";
                    }
                    continue;
                }
            }
        } else {
            shared.queue.dequeue().await
        };

        match next {
            Dequeued::Entry(entry) => run_task(&shared, entry).await,
            Dequeued::Closed => {
                shared.deduct_worker();
                break "queue drained";
            }
        }
    };

    debug!(reason = exit_reason, "worker retired");
    shared.try_finish();
}

/// 1 task の実行。panic をここで閉じ込める。
pub(crate) async fn run_task(shared: &PoolShared, entry: QueuedTask) {
    let QueuedTask { ops, run } = entry;
    let id = ops.task().id();

    // cancel が先行していたら body は呼ばない
    if !ops.begin_running() {
        debug!(task = %id, "skipped: cancelled before start");
        return;
    }

    let ctx = TaskContext::new(ops.task(), ops.cancel_token());
    debug!(task = %id, "task started");

    let outcome = AssertUnwindSafe(run(ctx)).catch_unwind().await;
    if let Err(payload) = outcome {
        let message = panic_message(payload);
        warn!(task = %id, panic = %message, "task panicked");
        ops.fail_panic(message);
    }

    shared.record_completed();
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
