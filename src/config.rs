use crate::error::{TxgError, TxgResult};
use crate::state::{TXG_INITIAL, TXG_UNKNOWN};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default time a generation stays open absent a kick.
/// 在没有 kick 的情况下，一个事务组保持打开的默认时间。
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Default delay between retries of a failed sync.
/// 同步失败后重试的默认间隔。
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Default period at which cancellable waits re-check signal and suspension.
/// 可取消的等待重新检查信号和挂起状态的默认周期。
pub const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default number of generations kept in the history ring.
/// 历史环中保留的事务组数量的默认值。
pub const DEFAULT_HISTORY_LEN: usize = 100;

/// Tunables for one txg pipeline.
///
/// Deserializable so the pool layer can embed it in its own config file.
/// Missing fields fall back to the defaults.
///
/// 一个 txg 流水线的可调参数。
/// 可反序列化，以便存储池层将其嵌入到自己的配置文件中。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxgConfig {
    /// How long a generation stays open before it is closed absent a kick.
    pub sync_interval: Duration,
    /// Number of admission counter shards.
    pub worker_shards: usize,
    /// First generation to open. Must be greater than zero.
    pub initial_txg: u64,
    /// Delay between retries when the pool fails to sync a generation.
    pub retry_interval: Duration,
    /// How often signal- and suspend-aware waits re-check their predicates.
    pub wait_poll_interval: Duration,
    /// Generations kept in the history ring; zero disables it.
    pub history_len: usize,
}

impl Default for TxgConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            worker_shards: default_worker_shards(),
            initial_txg: TXG_INITIAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            wait_poll_interval: DEFAULT_WAIT_POLL_INTERVAL,
            history_len: DEFAULT_HISTORY_LEN,
        }
    }
}

impl TxgConfig {
    /// Create a builder starting from the defaults.
    /// 从默认值开始创建一个构建器。
    #[inline]
    pub fn builder() -> TxgConfigBuilder {
        TxgConfigBuilder::new()
    }

    /// Check the configuration for values the pipeline cannot run with.
    /// 检查流水线无法运行的配置值。
    pub fn validate(&self) -> TxgResult<()> {
        if self.initial_txg == TXG_UNKNOWN {
            return Err(TxgError::config("initial_txg must be greater than zero"));
        }
        if self.worker_shards == 0 {
            return Err(TxgError::config("worker_shards must be at least 1"));
        }
        if self.sync_interval.is_zero() {
            return Err(TxgError::config("sync_interval must be non-zero"));
        }
        if self.retry_interval.is_zero() {
            return Err(TxgError::config("retry_interval must be non-zero"));
        }
        if self.wait_poll_interval.is_zero() {
            return Err(TxgError::config("wait_poll_interval must be non-zero"));
        }
        Ok(())
    }
}

fn default_worker_shards() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Builder for [`TxgConfig`].
///
/// # Example
/// ```
/// use std::time::Duration;
/// use txg_pipeline::TxgConfig;
///
/// let config = TxgConfig::builder()
///     .sync_interval(Duration::from_millis(200))
///     .worker_shards(8)
///     .build()
///     .unwrap();
/// assert_eq!(config.worker_shards, 8);
/// ```
///
/// [`TxgConfig`] 的构建器。
#[derive(Debug, Clone)]
pub struct TxgConfigBuilder {
    config: TxgConfig,
}

impl TxgConfigBuilder {
    /// Create a new builder with default settings.
    /// 创建一个带有默认设置的新构建器。
    #[inline]
    pub fn new() -> Self {
        Self {
            config: TxgConfig::default(),
        }
    }

    /// Set how long a generation stays open absent a kick.
    ///
    /// Default: 5 seconds
    #[inline]
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.config.sync_interval = interval;
        self
    }

    /// Set the number of admission counter shards.
    ///
    /// Default: available parallelism
    #[inline]
    pub fn worker_shards(mut self, shards: usize) -> Self {
        self.config.worker_shards = shards;
        self
    }

    /// Set the first generation to open.
    ///
    /// Default: `TXG_INITIAL`
    #[inline]
    pub fn initial_txg(mut self, txg: u64) -> Self {
        self.config.initial_txg = txg;
        self
    }

    /// Set the delay between retries of a failed sync.
    ///
    /// Default: 1 second
    #[inline]
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    /// Set how often cancellable waits re-check their predicates.
    ///
    /// Default: 10 milliseconds
    #[inline]
    pub fn wait_poll_interval(mut self, interval: Duration) -> Self {
        self.config.wait_poll_interval = interval;
        self
    }

    /// Set how many generations the history ring keeps. `0` disables it.
    ///
    /// Default: `100`
    #[inline]
    pub fn history_len(mut self, len: usize) -> Self {
        self.config.history_len = len;
        self
    }

    /// Validate and return the configuration.
    /// 校验并返回配置。
    pub fn build(self) -> TxgResult<TxgConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for TxgConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
