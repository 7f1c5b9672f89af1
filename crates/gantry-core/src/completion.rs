//! CompletionTracker - 完了順で handle を受け取る窓口
//!
//! # 設計
//! submit 時に handle へ pipe の sender を持たせ、終端遷移の瞬間に
//! handle 自身が自分を送り込む。受け側は「先に終わったものから」
//! 取り出せる（submit 順ではない）。
//!
//! # Drain の判定
//! sender は「tracker 本体が close するまで」と「未終端の handle が
//! 残っているあいだ」だけ生きる。両方尽きた時点で channel が閉じ、
//! [`CompletionTracker::take`] が `None` を返す。pipe の寿命 =
//! 「まだ届きうる handle の有無」そのもの。

use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::RejectedError;
use crate::handle::TaskHandle;
use crate::pool::Pool;
use crate::task::TaskContext;

/// [`CompletionTracker::poll`] の結果。
#[derive(Debug)]
pub enum PollOutcome<T> {
    /// 期限内にひとつ終端に達した。
    Completed(TaskHandle<T>),
    /// 期限切れ。まだ届く可能性はある。
    TimedOut,
    /// close 済みかつ全 handle 配達済み。もう何も届かない。
    Closed,
}

/// 完了順リトリーバ。ひとつの pool に紐付く。
pub struct CompletionTracker<T> {
    pool: Pool,
    tx: Option<mpsc::UnboundedSender<TaskHandle<T>>>,
    rx: mpsc::UnboundedReceiver<TaskHandle<T>>,
}

impl<T: Send + 'static> CompletionTracker<T> {
    pub(crate) fn new(pool: Pool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            pool,
            tx: Some(tx),
            rx,
        }
    }

    /// Pool へ submit し、終端時に pipe へ流れる handle を返す。
    ///
    /// Admission の扱いは [`Pool::submit`] と同じ。`Err` で返った
    /// submission は pipe にも一切現れない。
    pub async fn submit<F, Fut>(
        &self,
        name: impl Into<String>,
        body: F,
    ) -> Result<TaskHandle<T>, RejectedError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, crate::error::TaskError>> + Send + 'static,
    {
        let Some(tx) = &self.tx else {
            return Err(RejectedError::ShutDown);
        };
        self.pool
            .submit_inner(Some(name.into()), body, Some(tx.clone()))
            .await
    }

    /// 次に終端へ達した handle をひとつ取り出す。
    ///
    /// `None` は「close 済みで、もう届くものがない」ことの保証。
    pub async fn take(&mut self) -> Option<TaskHandle<T>> {
        self.rx.recv().await
    }

    /// 期限付きの取り出し。
    pub async fn poll(&mut self, timeout: Duration) -> PollOutcome<T> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(handle)) => PollOutcome::Completed(handle),
            Ok(None) => PollOutcome::Closed,
            Err(_) => PollOutcome::TimedOut,
        }
    }

    /// 新規 submit を締め切る。既に submit 済みの handle は
    /// 終端に達し次第、引き続き届く。
    pub fn close(&mut self) {
        self.tx = None;
    }
}
