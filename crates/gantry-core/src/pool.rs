//! Pool - admission・worker 管理・shutdown の中心
//!
//! # Admission の順序（古典的な bounded pool の契約）
//! 1. worker が core 未満 → task を束ねた worker を直接起動
//! 2. queue に入るなら queue 優先（worker 追加より安い）
//! 3. queue が満杯でも max 未満 → overflow worker を起動
//! 4. それも無理なら RejectionPolicy
//!
//! この判定は単一の lock の下で行う。並行 submit が `max_size` を
//! 突き破れないのは、worker 数の増減がすべてこの lock を通るため。
//!
//! # Lock order
//! core lock → queue lock の順のみ。逆順は存在しない。
//! どちらの lock も await を跨いで保持しない。

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::completion::CompletionTracker;
use crate::config::PoolConfig;
use crate::error::{ConfigError, RejectedError, TaskError};
use crate::handle::TaskHandle;
use crate::lifecycle::{LifecycleSignal, PoolState};
use crate::observability::PoolSnapshot;
use crate::policy::{RejectionOutcome, RejectionPolicy};
use crate::queue::{BoundedQueue, EnqueueRejected};
use crate::scheduler::{self, ScheduleMode, ScheduledHandle};
use crate::task::{BoxedRun, QueuedTask, Task, TaskContext, TaskId};
use crate::worker::{self, WorkerFactory, worker_loop};

/// Admission lock の中身。worker 数はここ以外で変更されない
/// （退役も [`PoolShared::confirm_retirement`] 経由でこの lock を通る）。
pub(crate) struct PoolCore {
    workers: usize,
    largest_workers: usize,
    next_worker_id: u64,
    rejection: RejectionPolicy,
}

/// Pool と worker が共有する状態。
pub(crate) struct PoolShared {
    pub(crate) config: PoolConfig,
    core: Mutex<PoolCore>,
    pub(crate) queue: Arc<BoundedQueue>,
    lifecycle: LifecycleSignal,
    /// shutdown_now で発火する親 token。task ごとの token はこの子。
    kill: CancellationToken,
    next_task_id: AtomicU64,
    completed: AtomicU64,
    factory: Box<dyn WorkerFactory>,
}

impl PoolShared {
    /// この worker は idle timeout で退役してよいか。
    pub(crate) fn worker_may_retire(&self) -> bool {
        if self.config.allow_core_timeout {
            return true;
        }
        self.core.lock().workers > self.config.core_size
    }

    /// idle timeout 後の退役確認。lock の下で数え直す。
    ///
    /// queue に仕事が残っているあいだは退役しない。手渡し直後に
    /// idle timeout が勝って entry が取り残される race をここで拾う。
    pub(crate) fn confirm_retirement(&self) -> bool {
        let mut core = self.core.lock();
        if self.queue.len() > 0 {
            return false;
        }
        let may = self.config.allow_core_timeout || core.workers > self.config.core_size;
        if may && core.workers > 0 {
            core.workers -= 1;
            true
        } else {
            false
        }
    }

    /// queue close を見て抜ける worker の減算。
    pub(crate) fn deduct_worker(&self) {
        let mut core = self.core.lock();
        core.workers = core.workers.saturating_sub(1);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// ShuttingDown かつ worker 0 かつ queue drained なら Stopped へ。
    pub(crate) fn try_finish(&self) {
        if self.lifecycle.state() != PoolState::ShuttingDown {
            return;
        }
        let workers = self.core.lock().workers;
        if workers == 0 && self.queue.is_drained() && self.lifecycle.finish() {
            info!("pool terminated");
        }
    }

    /// Worker を 1 本起動して数える。呼び出し側が core lock を握っている。
    fn spawn_worker(
        self: &Arc<Self>,
        core: &mut PoolCore,
        initial: Option<QueuedTask>,
    ) -> Result<(), String> {
        let name = format!("{}-{}", self.config.worker_name_prefix, core.next_worker_id);
        let shared = Arc::clone(self);
        self.factory
            .spawn(&name, async move { worker_loop(shared, initial).await }.boxed())?;
        core.next_worker_id += 1;
        core.workers += 1;
        if core.workers > core.largest_workers {
            core.largest_workers = core.workers;
        }
        Ok(())
    }
}

/// 内部 verdict。Saturated だけが lock の外で policy 適用に進む。
enum Verdict {
    Admitted,
    Rejected(RejectedError),
    Saturated(QueuedTask, RejectionPolicy),
}

/// Bounded task-execution pool.
///
/// Clone して好きなだけ持ち回れる（すべての clone は同じ pool を指す）。
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Validate the config and construct a pool.
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_factory(
            config,
            Box::new(worker::TokioWorkerFactory),
        ))
    }

    pub(crate) fn with_factory(config: PoolConfig, factory: Box<dyn WorkerFactory>) -> Self {
        let queue = Arc::new(BoundedQueue::new(config.queue_capacity));
        let rejection = config.rejection.clone();
        Self {
            shared: Arc::new(PoolShared {
                config,
                core: Mutex::new(PoolCore {
                    workers: 0,
                    largest_workers: 0,
                    next_worker_id: 0,
                    rejection,
                }),
                queue,
                lifecycle: LifecycleSignal::new(),
                kill: CancellationToken::new(),
                next_task_id: AtomicU64::new(1),
                completed: AtomicU64::new(0),
                factory,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Submit an anonymous task.
    ///
    /// 戻りの `Err` は「この task は一切 observable にならなかった」を
    /// 意味する（handle なし、completion 通知なし、body 未実行）。
    pub async fn submit<T, F, Fut>(&self, body: F) -> Result<TaskHandle<T>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        self.submit_inner(None, body, None).await
    }

    /// Submit with a human-readable name (logs and `Task` metadata).
    pub async fn submit_named<T, F, Fut>(
        &self,
        name: impl Into<String>,
        body: F,
    ) -> Result<TaskHandle<T>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        self.submit_inner(Some(name.into()), body, None).await
    }

    /// 同期クロージャ版の convenience。
    pub async fn submit_fn<T, F>(
        &self,
        name: impl Into<String>,
        f: F,
    ) -> Result<TaskHandle<T>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        self.submit_inner(Some(name.into()), move |_ctx| async move { f() }, None)
            .await
    }

    /// 全 submit 経路の本体。handle を組み立て、admission にかける。
    pub(crate) async fn submit_inner<T, F, Fut>(
        &self,
        name: Option<String>,
        body: F,
        completion: Option<mpsc::UnboundedSender<TaskHandle<T>>>,
    ) -> Result<TaskHandle<T>, RejectedError>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let id = TaskId::new(self.shared.next_task_id.fetch_add(1, Ordering::Relaxed));
        let task = Task::new(id, name);
        let cancel = self.shared.kill.child_token();
        let handle = TaskHandle::new(
            task,
            cancel,
            Arc::downgrade(&self.shared.queue),
            completion,
        );

        // body の完了がそのまま handle の終端遷移になるよう包む
        let run: BoxedRun = {
            let handle = handle.clone();
            Box::new(move |ctx| {
                Box::pin(async move {
                    let result = body(ctx).await;
                    handle.resolve(result);
                })
            })
        };
        let entry = QueuedTask {
            ops: Box::new(handle.clone()),
            run,
        };

        match self.admit(entry) {
            Verdict::Admitted => Ok(handle),
            Verdict::Rejected(error) => Err(error),
            Verdict::Saturated(entry, policy) => self.apply_policy(entry, policy, handle).await,
        }
    }

    /// Admission 判定。全体が core lock の下の同期処理。
    fn admit(&self, entry: QueuedTask) -> Verdict {
        let shared = &self.shared;
        let id = entry.id();
        let mut core = shared.core.lock();

        if !shared.lifecycle.is_running() {
            return Verdict::Rejected(RejectedError::ShutDown);
        }

        // 1) core 未満: task を束ねた worker を直接起動（queue を通さない）
        if core.workers < shared.config.core_size {
            return match shared.spawn_worker(&mut core, Some(entry)) {
                Ok(()) => Verdict::Admitted,
                Err(e) => Verdict::Rejected(RejectedError::WorkerSpawn(e)),
            };
        }

        // 2) queue 優先
        let entry = match shared.queue.try_enqueue(entry) {
            Ok(()) => {
                // 引き取る worker がいなければ 1 本だけ起こす
                // (core_size = 0 の構成や、全員退役した直後)
                if core.workers == 0 {
                    if let Err(e) = shared.spawn_worker(&mut core, None) {
                        shared.queue.remove(id);
                        return Verdict::Rejected(RejectedError::WorkerSpawn(e));
                    }
                }
                return Verdict::Admitted;
            }
            Err(EnqueueRejected::Closed(_)) => {
                return Verdict::Rejected(RejectedError::ShutDown);
            }
            Err(EnqueueRejected::Full(entry)) => entry,
        };

        // 3) max までは overflow worker を起動
        if core.workers < shared.config.max_size {
            return match shared.spawn_worker(&mut core, Some(entry)) {
                Ok(()) => Verdict::Admitted,
                Err(e) => Verdict::Rejected(RejectedError::WorkerSpawn(e)),
            };
        }

        // 4) 飽和。policy は lock を手放してから適用する
        let policy = core.rejection.clone();
        Verdict::Saturated(entry, policy)
    }

    /// 飽和時の policy 適用。
    async fn apply_policy<T: Send + 'static>(
        &self,
        entry: QueuedTask,
        policy: RejectionPolicy,
        handle: TaskHandle<T>,
    ) -> Result<TaskHandle<T>, RejectedError> {
        let snapshot = self.snapshot();
        let outcome = policy.decide(handle.task(), &snapshot).await;

        match outcome {
            RejectionOutcome::RejectWithError => {
                debug!(task = %handle.id(), "rejected: pool saturated");
                Err(RejectedError::Saturated(handle.id()))
            }
            RejectionOutcome::RunInline => {
                // submitter 自身が払うのが CallerRuns の backpressure
                debug!(task = %handle.id(), "saturated: caller runs inline");
                worker::run_task(&self.shared, entry).await;
                Ok(handle)
            }
            RejectionOutcome::DropSilently => {
                entry.ops.resolve_discarded();
                debug!(task = %handle.id(), "saturated: discarded newest");
                Ok(handle)
            }
            RejectionOutcome::DropOldestThenRetry => {
                if let Some(oldest) = self.shared.queue.pop_oldest() {
                    let evicted = oldest.id();
                    oldest.ops.resolve_discarded();
                    debug!(task = %handle.id(), %evicted, "saturated: discarded oldest");
                }
                // 再挑戦は 1 回だけ。それでも飽和なら Abort と同じ扱い
                match self.admit(entry) {
                    Verdict::Admitted => Ok(handle),
                    Verdict::Rejected(error) => Err(error),
                    Verdict::Saturated(_, _) => Err(RejectedError::Saturated(handle.id())),
                }
            }
        }
    }

    /// core_size まで worker を先に起こしておく。起動できた数を返す。
    pub fn prestart_core_workers(&self) -> usize {
        let shared = &self.shared;
        let mut core = shared.core.lock();
        if !shared.lifecycle.is_running() {
            return 0;
        }
        let mut started = 0;
        while core.workers < shared.config.core_size {
            match shared.spawn_worker(&mut core, None) {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!(error = %e, "prestart: worker spawn failed");
                    break;
                }
            }
        }
        started
    }

    /// 飽和時の policy を実行中に差し替える。以降の submit に効く。
    pub fn set_rejection_policy(&self, policy: RejectionPolicy) {
        self.shared.core.lock().rejection = policy;
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let core = self.shared.core.lock();
        PoolSnapshot {
            state: self.shared.lifecycle.state(),
            workers: core.workers,
            queued: self.shared.queue.backlog(),
            completed: self.shared.completed.load(Ordering::Relaxed),
            largest_workers: core.largest_workers,
        }
    }

    /// Completion 順で handle を受け取る tracker を作る。
    pub fn completion_tracker<T: Send + 'static>(&self) -> CompletionTracker<T> {
        CompletionTracker::new(self.clone())
    }

    /// 周期 submit を開始する。`period` 0 は one-shot。
    ///
    /// fire ごとに普通の submit として admission を通る。driver は
    /// worker 枠を消費しない。
    pub fn submit_scheduled<F, Fut>(
        &self,
        initial_delay: Duration,
        period: Duration,
        mode: ScheduleMode,
        body: F,
    ) -> Result<ScheduledHandle, RejectedError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        if !self.shared.lifecycle.is_running() {
            return Err(RejectedError::ShutDown);
        }
        Ok(scheduler::spawn_schedule(
            self.clone(),
            None,
            initial_delay,
            period,
            mode,
            body,
        ))
    }

    /// 名前付きの周期 submit。
    pub fn submit_scheduled_named<F, Fut>(
        &self,
        name: impl Into<String>,
        initial_delay: Duration,
        period: Duration,
        mode: ScheduleMode,
        body: F,
    ) -> Result<ScheduledHandle, RejectedError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        if !self.shared.lifecycle.is_running() {
            return Err(RejectedError::ShutDown);
        }
        Ok(scheduler::spawn_schedule(
            self.clone(),
            Some(name.into()),
            initial_delay,
            period,
            mode,
            body,
        ))
    }

    /// Graceful shutdown: 新規は拒否、admitted 済みは最後まで流れる。
    /// 何度呼んでも安全。
    pub fn shutdown(&self) {
        if self.shared.lifecycle.begin_shutdown() {
            info!("pool shutting down");
        }
        self.shared.queue.close();
        self.shared.try_finish();
    }

    /// 即時 shutdown: queue を空けて未開始 task の metadata を返し、
    /// 実行中の body には協調キャンセルを送る。
    pub fn shutdown_now(&self) -> Vec<Task> {
        if self.shared.lifecycle.begin_shutdown() {
            info!("pool shutting down (now)");
        }
        self.shared.queue.close();

        let drained = self.shared.queue.clear();
        let mut unstarted = Vec::with_capacity(drained.len());
        for entry in drained {
            entry.ops.resolve_discarded();
            unstarted.push(entry.ops.task().clone());
        }

        // 実行中の全 body の token はこの親の子
        self.shared.kill.cancel();
        self.shared.try_finish();
        unstarted
    }

    /// Stopped になるまで待つ。true = 終了、false = timeout。
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.shared.lifecycle.wait_stopped())
            .await
            .is_ok()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.lifecycle.state().is_shutdown()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.lifecycle.state() == PoolState::Stopped
    }

    /// Scheduler driver が shutdown を select で拾うための edge。
    pub(crate) async fn shutting_down(&self) {
        self.shared.lifecycle.wait_shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use tokio::sync::watch;
    use tokio::time::timeout;

    use super::*;
    use crate::error::JoinError;
    use crate::handle::TaskState;

    fn pool(core: usize, max: usize, cap: usize, policy: RejectionPolicy) -> Pool {
        crate::PoolBuilder::new()
            .core_size(core)
            .max_size(max)
            .queue_capacity(cap)
            .rejection(policy)
            .build()
            .unwrap()
    }

    /// 全 blocker を一斉に解放する gate。
    fn gate() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    async fn settle() {
        // spawn された worker が park するまでの猶予
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn submit_runs_and_returns_value() {
        let pool = pool(1, 1, 4, RejectionPolicy::Abort);

        let handle = pool
            .submit_named("answer", |_ctx| async { Ok::<_, TaskError>(42u32) })
            .await
            .unwrap();

        assert_eq!(handle.get().await.unwrap(), 42);
        assert_eq!(handle.state(), TaskState::Completed);
        assert_eq!(handle.name(), Some("answer"));
    }

    #[tokio::test]
    async fn task_failure_stays_on_its_handle() {
        let pool = pool(1, 1, 4, RejectionPolicy::Abort);

        let bad = pool
            .submit::<u32, _, _>(|_ctx| async { Err(TaskError::msg("no good")) })
            .await
            .unwrap();
        let good = pool
            .submit(|_ctx| async { Ok::<_, TaskError>(1u32) })
            .await
            .unwrap();

        assert_eq!(
            bad.get().await,
            Err(JoinError::Failed(TaskError::msg("no good")))
        );
        assert_eq!(good.get().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn queue_is_preferred_over_growth() {
        let pool = pool(1, 3, 4, RejectionPolicy::Abort);
        let (tx, rx) = gate();

        let mut handles = Vec::new();
        for i in 0..4u32 {
            let rx = rx.clone();
            handles.push(
                pool.submit(move |_ctx| {
                    let mut rx = rx;
                    async move {
                        let _ = rx.wait_for(|open| *open).await;
                        Ok::<_, TaskError>(i)
                    }
                })
                .await
                .unwrap(),
            );
        }
        settle().await;

        // core 1 本が埋まったあとは queue に積まれ、worker は増えない
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.workers, 1);
        assert_eq!(snapshot.queued, 3);

        tx.send(true).unwrap();
        for handle in handles {
            timeout(Duration::from_secs(1), handle.get())
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn grows_to_max_once_queue_is_full() {
        let pool = pool(1, 2, 1, RejectionPolicy::Abort);
        let (tx, rx) = gate();

        for _ in 0..3 {
            let rx = rx.clone();
            pool.submit(move |_ctx| {
                let mut rx = rx;
                async move {
                    let _ = rx.wait_for(|open| *open).await;
                    Ok::<_, TaskError>(())
                }
            })
            .await
            .unwrap();
        }
        settle().await;

        // 1 core + queue(1) が埋まり、3 本目で overflow worker が立つ
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.workers, 2);
        assert_eq!(snapshot.queued, 1);
        assert_eq!(snapshot.largest_workers, 2);

        tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn max_size_is_never_exceeded() {
        let pool = pool(2, 2, 0, RejectionPolicy::Abort);
        let (tx, rx) = gate();

        for _ in 0..2 {
            let rx = rx.clone();
            pool.submit(move |_ctx| {
                let mut rx = rx;
                async move {
                    let _ = rx.wait_for(|open| *open).await;
                    Ok::<_, TaskError>(())
                }
            })
            .await
            .unwrap();
        }
        settle().await;

        // 直接手渡し構成: 両 worker が busy なら 3 本目は即 reject
        let refused = pool
            .submit(|_ctx| async { Ok::<_, TaskError>(()) })
            .await;
        assert!(matches!(refused, Err(RejectedError::Saturated(_))));
        assert_eq!(pool.snapshot().workers, 2);

        tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn caller_runs_applies_backpressure_inline() {
        let pool = pool(1, 1, 0, RejectionPolicy::CallerRuns);
        let (tx, rx) = gate();

        let blocker = {
            let rx = rx.clone();
            pool.submit(move |_ctx| {
                let mut rx = rx;
                async move {
                    let _ = rx.wait_for(|open| *open).await;
                    Ok::<_, TaskError>(0u32)
                }
            })
            .await
            .unwrap()
        };
        settle().await;

        // submitter 側で即実行されるので、submit の完了 = task の完了
        let ran_inline = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran_inline);
        let inline = pool
            .submit(move |_ctx| async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, TaskError>(7u32)
            })
            .await
            .unwrap();

        assert!(ran_inline.load(Ordering::SeqCst));
        assert_eq!(inline.state(), TaskState::Completed);
        assert_eq!(inline.get().await.unwrap(), 7);
        assert_eq!(pool.snapshot().workers, 1);

        tx.send(true).unwrap();
        blocker.get().await.unwrap();
    }

    #[tokio::test]
    async fn discard_newest_returns_a_cancelled_handle() {
        let pool = pool(1, 1, 0, RejectionPolicy::DiscardNewest);
        let (tx, rx) = gate();

        let _blocker = {
            let rx = rx.clone();
            pool.submit(move |_ctx| {
                let mut rx = rx;
                async move {
                    let _ = rx.wait_for(|open| *open).await;
                    Ok::<_, TaskError>(())
                }
            })
            .await
            .unwrap()
        };
        settle().await;

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let dropped = pool
            .submit(move |_ctx| async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, TaskError>(())
            })
            .await
            .unwrap();

        assert_eq!(dropped.state(), TaskState::Cancelled);
        assert_eq!(dropped.get().await, Err(JoinError::Cancelled));
        assert!(!ran.load(Ordering::SeqCst));

        tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn discard_oldest_evicts_the_queue_head() {
        let pool = pool(1, 1, 1, RejectionPolicy::DiscardOldest);
        let (tx, rx) = gate();

        let _blocker = {
            let rx = rx.clone();
            pool.submit(move |_ctx| {
                let mut rx = rx;
                async move {
                    let _ = rx.wait_for(|open| *open).await;
                    Ok::<_, TaskError>(0u32)
                }
            })
            .await
            .unwrap()
        };
        settle().await;

        let oldest = pool
            .submit(|_ctx| async { Ok::<_, TaskError>(1u32) })
            .await
            .unwrap();
        let newest = pool
            .submit(|_ctx| async { Ok::<_, TaskError>(2u32) })
            .await
            .unwrap();

        // 先頭が犠牲になり、新しい方が queue に入る
        assert_eq!(oldest.wait().await, TaskState::Cancelled);
        tx.send(true).unwrap();
        assert_eq!(
            timeout(Duration::from_secs(1), newest.get())
                .await
                .unwrap()
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn cancel_before_start_never_runs_the_body() {
        let pool = pool(1, 1, 4, RejectionPolicy::Abort);
        let (tx, rx) = gate();

        let _blocker = {
            let rx = rx.clone();
            pool.submit(move |_ctx| {
                let mut rx = rx;
                async move {
                    let _ = rx.wait_for(|open| *open).await;
                    Ok::<_, TaskError>(())
                }
            })
            .await
            .unwrap()
        };
        settle().await;

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let queued = pool
            .submit(move |_ctx| async move {
                flag.store(true, Ordering::SeqCst);
                Ok::<_, TaskError>(())
            })
            .await
            .unwrap();

        assert_eq!(pool.snapshot().queued, 1);
        assert!(queued.cancel(false));
        // purge されるので queue の枠も即座に戻る
        assert_eq!(pool.snapshot().queued, 0);

        tx.send(true).unwrap();
        settle().await;
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(queued.get().await, Err(JoinError::Cancelled));
    }

    #[tokio::test]
    async fn panic_is_isolated_to_the_failing_task() {
        let pool = pool(1, 1, 4, RejectionPolicy::Abort);

        let exploding = pool
            .submit::<(), _, _>(|_ctx| async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .await
            .unwrap();
        let survivor = pool
            .submit(|_ctx| async { Ok::<_, TaskError>(5u32) })
            .await
            .unwrap();

        match exploding.get().await {
            Err(JoinError::Failed(TaskError::Panicked(message))) => {
                assert_eq!(message, "boom")
            }
            other => panic!("expected panic failure, got {other:?}"),
        }
        // 同じ worker が生き残って次を実行する
        assert_eq!(survivor.get().await.unwrap(), 5);
        assert_eq!(pool.snapshot().workers, 1);
    }

    #[tokio::test]
    async fn spawn_failure_reaches_the_submitter() {
        struct RefuseAll;
        impl WorkerFactory for RefuseAll {
            fn spawn(
                &self,
                _name: &str,
                _body: futures::future::BoxFuture<'static, ()>,
            ) -> Result<(), String> {
                Err("no threads today".to_string())
            }
        }

        let pool = crate::PoolBuilder::new()
            .core_size(1)
            .max_size(1)
            .worker_factory(RefuseAll)
            .build()
            .unwrap();

        let refused = pool
            .submit(|_ctx| async { Ok::<_, TaskError>(()) })
            .await;
        match refused {
            Err(RejectedError::WorkerSpawn(message)) => {
                assert_eq!(message, "no threads today")
            }
            other => panic!("expected spawn failure, got {:?}", other.map(|_| ())),
        }
        assert_eq!(pool.snapshot().workers, 0);
    }

    #[tokio::test]
    async fn keep_alive_retires_overflow_workers() {
        let pool = crate::PoolBuilder::new()
            .core_size(1)
            .max_size(2)
            .queue_capacity(0)
            .keep_alive(Duration::from_millis(50))
            .build()
            .unwrap();
        let (tx, rx) = gate();

        for _ in 0..2 {
            let rx = rx.clone();
            pool.submit(move |_ctx| {
                let mut rx = rx;
                async move {
                    let _ = rx.wait_for(|open| *open).await;
                    Ok::<_, TaskError>(())
                }
            })
            .await
            .unwrap();
        }
        settle().await;
        assert_eq!(pool.snapshot().workers, 2);

        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // overflow の 1 本だけが退役し、core の 1 本は残る
        let snapshot = pool.snapshot();
        assert_eq!(snapshot.workers, 1);
        assert_eq!(snapshot.largest_workers, 2);
        assert_eq!(snapshot.completed, 2);
    }

    #[tokio::test]
    async fn prestart_spawns_exactly_core_size() {
        let pool = pool(3, 4, 4, RejectionPolicy::Abort);

        assert_eq!(pool.prestart_core_workers(), 3);
        assert_eq!(pool.prestart_core_workers(), 0);
        settle().await;
        assert_eq!(pool.snapshot().workers, 3);
    }

    #[tokio::test]
    async fn rendezvous_hands_off_to_a_parked_worker() {
        let pool = pool(1, 1, 0, RejectionPolicy::Abort);
        pool.prestart_core_workers();
        settle().await;

        // worker が park 済みなので直接手渡しで通る
        let handle = pool
            .submit(|_ctx| async { Ok::<_, TaskError>(9u32) })
            .await
            .unwrap();
        assert_eq!(
            timeout(Duration::from_secs(1), handle.get())
                .await
                .unwrap()
                .unwrap(),
            9
        );
        assert_eq!(pool.snapshot().workers, 1);
    }

    #[tokio::test]
    async fn snapshot_does_not_count_handoffs_as_queued() {
        let pool = pool(1, 1, 0, RejectionPolicy::Abort);
        pool.prestart_core_workers();
        settle().await;

        let handle = pool
            .submit(|_ctx| async { Ok::<_, TaskError>(3u32) })
            .await
            .unwrap();
        // 手渡し中の entry は queued に数えない（capacity 0 のまま見える）
        assert_eq!(pool.snapshot().queued, 0);
        assert_eq!(
            timeout(Duration::from_secs(1), handle.get())
                .await
                .unwrap()
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work_and_drains_queued() {
        let pool = pool(1, 1, 4, RejectionPolicy::Abort);
        let (tx, rx) = gate();

        let slow = {
            let rx = rx.clone();
            pool.submit(move |_ctx| {
                let mut rx = rx;
                async move {
                    let _ = rx.wait_for(|open| *open).await;
                    Ok::<_, TaskError>(1u32)
                }
            })
            .await
            .unwrap()
        };
        let queued = pool
            .submit(|_ctx| async { Ok::<_, TaskError>(2u32) })
            .await
            .unwrap();
        settle().await;

        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(matches!(
            pool.submit(|_ctx| async { Ok::<_, TaskError>(3u32) }).await,
            Err(RejectedError::ShutDown)
        ));

        // admitted 済みは最後まで流れる
        tx.send(true).unwrap();
        assert_eq!(slow.get().await.unwrap(), 1);
        assert_eq!(queued.get().await.unwrap(), 2);

        assert!(pool.await_termination(Duration::from_secs(1)).await);
        assert!(pool.is_terminated());
    }

    #[tokio::test]
    async fn shutdown_now_returns_unstarted_tasks() {
        let pool = pool(1, 1, 4, RejectionPolicy::Abort);
        let (_tx, rx) = gate();

        let running = {
            let rx = rx.clone();
            pool.submit_named("running", move |ctx| {
                let mut rx = rx;
                async move {
                    tokio::select! {
                        _ = ctx.cancelled() => Ok::<_, TaskError>(0u32),
                        _ = rx.wait_for(|open| *open) => Ok(1),
                    }
                }
            })
            .await
            .unwrap()
        };
        let queued_a = pool
            .submit_named("queued-a", |_ctx| async { Ok::<_, TaskError>(2u32) })
            .await
            .unwrap();
        let queued_b = pool
            .submit_named("queued-b", |_ctx| async { Ok::<_, TaskError>(3u32) })
            .await
            .unwrap();
        settle().await;

        let unstarted = pool.shutdown_now();
        let names: Vec<_> = unstarted.iter().filter_map(|t| t.name()).collect();
        assert_eq!(names, vec!["queued-a", "queued-b"]);

        assert_eq!(queued_a.wait().await, TaskState::Cancelled);
        assert_eq!(queued_b.wait().await, TaskState::Cancelled);

        // 実行中の body は協調キャンセルを観測して自分で抜ける
        assert_eq!(
            timeout(Duration::from_secs(1), running.get())
                .await
                .unwrap()
                .unwrap(),
            0
        );
        assert!(pool.await_termination(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn repeated_shutdown_converges() {
        let pool = pool(1, 2, 4, RejectionPolicy::Abort);
        pool.submit(|_ctx| async { Ok::<_, TaskError>(()) })
            .await
            .unwrap();

        pool.shutdown();
        pool.shutdown();
        let late = pool.shutdown_now();
        assert!(late.is_empty());

        assert!(pool.await_termination(Duration::from_secs(1)).await);
        assert!(pool.is_terminated());
        assert_eq!(pool.snapshot().state, PoolState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_of_an_idle_pool_terminates_immediately() {
        let pool = pool(2, 4, 4, RejectionPolicy::Abort);
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn every_submission_reaches_exactly_one_terminal_state() {
        let pool = pool(2, 3, 8, RejectionPolicy::Abort);
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..10u32 {
            let counter = Arc::clone(&completed);
            handles.push(
                pool.submit(move |_ctx| async move {
                    if i % 3 == 0 {
                        return Err(TaskError::msg("every third fails"));
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(i)
                })
                .await
                .unwrap(),
            );
        }

        for handle in &handles {
            let state = timeout(Duration::from_secs(1), handle.wait())
                .await
                .unwrap();
            assert!(state.is_terminal());
            // 終端状態は一度きりで固定される
            assert_eq!(handle.state(), state);
        }
        settle().await;
        assert_eq!(completed.load(Ordering::SeqCst), 6);
        assert_eq!(pool.snapshot().completed, 10);
    }

    #[tokio::test]
    async fn swapping_the_policy_affects_later_submissions() {
        let pool = pool(1, 1, 0, RejectionPolicy::Abort);
        let (tx, rx) = gate();

        let _blocker = {
            let rx = rx.clone();
            pool.submit(move |_ctx| {
                let mut rx = rx;
                async move {
                    let _ = rx.wait_for(|open| *open).await;
                    Ok::<_, TaskError>(())
                }
            })
            .await
            .unwrap()
        };
        settle().await;

        assert!(pool
            .submit(|_ctx| async { Ok::<_, TaskError>(()) })
            .await
            .is_err());

        pool.set_rejection_policy(RejectionPolicy::DiscardNewest);
        let discarded = pool
            .submit(|_ctx| async { Ok::<_, TaskError>(()) })
            .await
            .unwrap();
        assert_eq!(discarded.state(), TaskState::Cancelled);

        tx.send(true).unwrap();
    }
}
