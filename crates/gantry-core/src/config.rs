//! PoolConfig / PoolBuilder - プール構成の組み立てと起動時検証
//!
//! # Fail-fast 設計
//! - `build()` 時にサイズの整合性をチェックし、不正な構成は
//!   [`ConfigError`] で即座に返す（動き出してから壊れるより起動時に失敗する）
//! - policy だけは実行中に差し替え可能（`Pool::set_rejection_policy`）

use std::time::Duration;

use crate::error::ConfigError;
use crate::policy::RejectionPolicy;
use crate::pool::Pool;
use crate::worker::{TokioWorkerFactory, WorkerFactory};

/// Static pool configuration.
///
/// # 不変条件
/// - `core_size <= max_size`
/// - `max_size >= 1`
/// - `queue_capacity == 0` は rendezvous（待っている worker への直接手渡し）
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers kept alive even when idle (see `allow_core_timeout`).
    pub core_size: usize,

    /// Hard cap on concurrently live workers.
    pub max_size: usize,

    /// Queue slots between admission and the workers. 0 = direct handoff.
    pub queue_capacity: usize,

    /// Idle time after which a surplus worker retires.
    pub keep_alive: Duration,

    /// When true, core workers retire on idle timeout too.
    pub allow_core_timeout: bool,

    /// Policy applied when workers and queue are both saturated.
    pub rejection: RejectionPolicy,

    /// Worker span names are `{prefix}-{n}`.
    pub worker_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_size: 1,
            max_size: 1,
            queue_capacity: 64,
            keep_alive: Duration::from_secs(30),
            allow_core_timeout: false,
            rejection: RejectionPolicy::default(),
            worker_name_prefix: "gantry-worker".to_string(),
        }
    }
}

impl PoolConfig {
    /// サイズ不変条件のチェック
    ///
    /// `usize` なので負値はそもそも表現できない。残るのは
    /// `max_size >= 1` と `core_size <= max_size` の2つ。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::ZeroMaxSize);
        }
        if self.core_size > self.max_size {
            return Err(ConfigError::CoreExceedsMax {
                core: self.core_size,
                max: self.max_size,
            });
        }
        Ok(())
    }
}

/// PoolBuilder は [`Pool`] を構築
///
/// # 使用例
/// ```ignore
/// let pool = PoolBuilder::new()
///     .core_size(2)
///     .max_size(4)
///     .queue_capacity(8)
///     .rejection(RejectionPolicy::CallerRuns)
///     .build()?;
/// ```
pub struct PoolBuilder {
    config: PoolConfig,
    factory: Option<Box<dyn WorkerFactory>>,
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
            factory: None,
        }
    }

    pub fn core_size(mut self, n: usize) -> Self {
        self.config.core_size = n;
        self
    }

    pub fn max_size(mut self, n: usize) -> Self {
        self.config.max_size = n;
        self
    }

    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.config.queue_capacity = n;
        self
    }

    pub fn keep_alive(mut self, d: Duration) -> Self {
        self.config.keep_alive = d;
        self
    }

    pub fn allow_core_timeout(mut self, allow: bool) -> Self {
        self.config.allow_core_timeout = allow;
        self
    }

    pub fn rejection(mut self, policy: RejectionPolicy) -> Self {
        self.config.rejection = policy;
        self
    }

    pub fn worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.worker_name_prefix = prefix.into();
        self
    }

    /// Worker の起動方法を差し替える（テストで使う）
    pub fn worker_factory(mut self, factory: impl WorkerFactory + 'static) -> Self {
        self.factory = Some(Box::new(factory));
        self
    }

    /// 検証してから Pool を生成
    pub fn build(self) -> Result<Pool, ConfigError> {
        self.config.validate()?;
        let factory = self
            .factory
            .unwrap_or_else(|| Box::new(TokioWorkerFactory));
        Ok(Pool::with_factory(self.config, factory))
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
