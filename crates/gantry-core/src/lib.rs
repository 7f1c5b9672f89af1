//! gantry-core
//!
//! Core building blocks for the Gantry task-execution engine.
//!
//! # モジュール構成
//! - **pool**: 本体。admission（core → queue → overflow → policy）、
//!   worker 数の管理、shutdown / shutdown_now
//! - **config**: PoolConfig / PoolBuilder（起動時検証つき）
//! - **task**: Task metadata と TaskContext（協調キャンセルの窓口）
//! - **handle**: TaskHandle。結果の受け取り・cancel・終端状態
//! - **policy**: 飽和時の RejectionPolicy（Abort / CallerRuns / Discard系 / Custom）
//! - **completion**: CompletionTracker。完了順での取り出し
//! - **scheduler**: 周期 submit（FixedRate / FixedDelay）
//! - **worker**: WorkerFactory と worker loop（panic 隔離つき）
//! - **lifecycle**: Running → ShuttingDown → Stopped の一方通行
//! - **observability**: PoolSnapshot（serde 対応の観測値）
//!
//! # 不変条件（クレート全体）
//! - worker 数は `max_size` を決して超えない
//! - admitted された task は必ずちょうど一度だけ終端状態に達する
//! - `submit` が `Err` を返した task は一切 observable にならない

pub mod completion;
pub mod config;
pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod observability;
pub mod policy;
pub mod pool;
pub mod scheduler;
pub mod task;
pub mod worker;

// queue は実装詳細。公開 API は handle / pool 経由のみ
mod queue;

pub use completion::{CompletionTracker, PollOutcome};
pub use config::{PoolBuilder, PoolConfig};
pub use error::{ConfigError, JoinError, RejectedError, TaskError};
pub use handle::{TaskHandle, TaskState};
pub use lifecycle::PoolState;
pub use observability::PoolSnapshot;
pub use policy::{RejectionHook, RejectionOutcome, RejectionPolicy};
pub use pool::Pool;
pub use scheduler::{ScheduleMode, ScheduleState, ScheduledHandle};
pub use task::{Task, TaskContext, TaskId};
pub use worker::{TokioWorkerFactory, WorkerFactory};
