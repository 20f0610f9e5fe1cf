use crate::config::TxgConfig;
use crate::defer::{Extent, ObjsetId};
use crate::driver::{quiesce_worker, sync_worker};
use crate::error::{TxgError, TxgResult};
use crate::handle::TxgHandle;
use crate::history::TxgRecord;
use crate::pool::SyncPool;
use crate::state::{
    TXG_CONCURRENT_STATES, TXG_DEFER_SIZE, TXG_INITIAL, TxShared, current_shard_hint,
};
use crate::sync::Mutex;
use crate::wait::WaitFlags;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// How [`Txg::sync_stop`] ended.
/// [`Txg::sync_stop`] 的结束方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every admitted generation, plus the deferred-free window, is synced.
    /// 所有已准入的事务组（加上推迟释放窗口）都已同步。
    Drained { synced_txg: u64 },
    /// A forced export discarded generations from `from_txg` on.
    /// 强制导出丢弃了从 `from_txg` 开始的事务组。
    Abandoned {
        from_txg: u64,
        dropped_callbacks: usize,
    },
}

#[derive(Default)]
struct Workers {
    quiesce: Option<JoinHandle<()>>,
    sync: Option<JoinHandle<()>>,
    dispatch: Option<JoinHandle<()>>,
}

/// The transaction-group pipeline of one storage pool.
///
/// `Txg` owns the generation state of a single pool: callers are admitted
/// into the open generation with [`hold_open`](Self::hold_open), and a pair
/// of background workers started by [`sync_start`](Self::sync_start) closes,
/// quiesces and syncs generations in order through the pool's
/// [`SyncPool::sync_txg`].
///
/// Several `Txg` instances (one per pool) can coexist.
///
/// **Typical Usage**:
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use txg_pipeline::{SyncError, SyncPool, Txg, TxgConfig, WaitFlags};
///
/// struct NullPool;
///
/// impl SyncPool for NullPool {
///     fn sync_txg(&self, _txg: u64) -> Result<(), SyncError> {
///         Ok(())
///     }
///     fn is_suspended(&self) -> bool {
///         false
///     }
/// }
///
/// let config = TxgConfig::builder()
///     .sync_interval(Duration::from_millis(50))
///     .build()
///     .unwrap();
/// let txg = Txg::new(Arc::new(NullPool), config).unwrap();
/// txg.sync_start().unwrap();
///
/// let handle = txg.hold_open();
/// let generation = handle.txg();
/// handle.release_to_sync();
///
/// txg.wait_synced(generation, WaitFlags::NONE).unwrap();
/// assert!(txg.synced_txg() >= generation);
/// txg.sync_stop(WaitFlags::NONE).unwrap();
/// ```
///
/// 一个存储池的事务组流水线。
///
/// `Txg` 拥有单个存储池的事务组状态：调用者通过 `hold_open` 准入到打开的事务组，
/// 由 `sync_start` 启动的两个后台工作线程按顺序关闭、静默并通过存储池的
/// `SyncPool::sync_txg` 同步事务组。
///
/// 多个 `Txg` 实例（每个存储池一个）可以共存。
pub struct Txg {
    pub(crate) shared: Arc<TxShared>,
    workers: Mutex<Workers>,
}

impl Txg {
    /// Create the pipeline for `pool`. No worker runs until
    /// [`sync_start`](Self::sync_start).
    ///
    /// 为 `pool` 创建流水线。在调用 `sync_start` 之前不会运行任何工作线程。
    pub fn new<P: SyncPool>(pool: Arc<P>, config: TxgConfig) -> TxgResult<Self> {
        config.validate()?;
        let pool: Arc<dyn SyncPool> = pool;
        Ok(Self {
            shared: Arc::new(TxShared::new(pool, config)),
            workers: Mutex::new(Workers::default()),
        })
    }

    /// Create the pipeline with the default configuration.
    /// 使用默认配置创建流水线。
    pub fn with_defaults<P: SyncPool>(pool: Arc<P>) -> TxgResult<Self> {
        Self::new(pool, TxgConfig::default())
    }

    /// The configuration this pipeline was built with.
    #[inline]
    pub fn config(&self) -> &TxgConfig {
        &self.shared.config
    }

    /// Start the quiesce and sync workers and the callback dispatcher.
    ///
    /// 启动静默和同步工作线程以及回调分发线程。
    pub fn sync_start(&self) -> TxgResult<()> {
        let mut workers = self.workers.lock();
        {
            let mut state = self.shared.state.lock();
            if state.threads != 0 || workers.dispatch.is_some() {
                return Err(TxgError::AlreadyRunning);
            }
            if let Some(txg) = state.abandoned_from {
                return Err(TxgError::Abandoned { txg });
            }
            state.exiting = false;
            state.threads = 2;
        }
        self.shared.dispatcher.reset();

        match self.spawn_workers(&mut workers) {
            Ok(()) => {
                info!(open_txg = self.open_txg(), "txg sync workers started");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "failed to start txg sync workers");
                drop(workers);
                self.shutdown_workers();
                Err(err)
            }
        }
    }

    fn spawn_workers(&self, workers: &mut Workers) -> TxgResult<()> {
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("txg_callbacks".into())
            .spawn(move || shared.dispatcher.run())
        {
            Ok(handle) => workers.dispatch = Some(handle),
            Err(err) => {
                self.shared.state.lock().threads = 0;
                return Err(err.into());
            }
        }

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("txg_quiesce".into())
            .spawn(move || quiesce_worker(shared))
        {
            Ok(handle) => workers.quiesce = Some(handle),
            Err(err) => {
                self.shared.state.lock().threads -= 2;
                return Err(err.into());
            }
        }

        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("txg_sync".into())
            .spawn(move || sync_worker(shared))
        {
            Ok(handle) => workers.sync = Some(handle),
            Err(err) => {
                self.shared.state.lock().threads -= 1;
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Stop the workers.
    ///
    /// First waits (honouring `flags`) until every generation admitted so
    /// far, plus the deferred-free window behind it, is synced. With
    /// [`WaitFlags::FORCE_EXPORT`] after [`force_export`](Self::force_export),
    /// the wait is skipped and in-flight generations are abandoned; the
    /// outcome then says so.
    ///
    /// A plain stop never abandons anything: a later generation the pool is
    /// still failing to write is kept quiesced and synced first after the
    /// next [`sync_start`](Self::sync_start).
    ///
    /// Outstanding handles must be released before stopping: a generation
    /// that cannot quiesce cannot be stopped either.
    ///
    /// 停止工作线程。
    ///
    /// 首先（按照 `flags`）等待到目前为止准入的所有事务组以及其后的推迟释放窗口
    /// 都同步完成。在 `force_export` 之后使用 `FORCE_EXPORT` 时跳过等待，
    /// 放弃进行中的事务组；结果会如实报告。
    pub fn sync_stop(&self, flags: WaitFlags) -> TxgResult<StopOutcome> {
        // Workers that abandoned work on their own have already exited, but
        // stopping still has to join them and report the outcome.
        if self.workers.lock().dispatch.is_none() {
            return Err(TxgError::NotRunning);
        }

        let target = self.open_txg() + TXG_DEFER_SIZE;
        match self.wait_synced(target, flags) {
            Ok(()) => {}
            // The workers already gave up; collect what is left below.
            Err(TxgError::Abandoned { .. }) | Err(TxgError::NotRunning) => {}
            Err(err) => return Err(err),
        }

        self.shutdown_workers();

        let mut state = self.shared.state.lock();
        let synced_txg = state.synced_txg;
        if synced_txg >= target && state.abandoned_from.is_none() {
            state.exiting = false;
            info!(synced_txg, "txg sync workers stopped");
            return Ok(StopOutcome::Drained { synced_txg });
        }

        let from_txg = *state.abandoned_from.get_or_insert(synced_txg + 1);
        state.history.abandon_from(from_txg);
        drop(state);

        let dropped_callbacks = self.shared.drop_parked_callbacks();
        if dropped_callbacks > 0 {
            error!(
                from_txg,
                dropped_callbacks, "commit callbacks dropped by forced export"
            );
        }
        warn!(from_txg, "txg sync workers stopped, uncommitted txgs abandoned");
        Ok(StopOutcome::Abandoned {
            from_txg,
            dropped_callbacks,
        })
    }

    /// Signal every worker to exit and join them. The dispatcher finishes
    /// the callbacks already queued before it exits.
    fn shutdown_workers(&self) {
        let mut workers = self.workers.lock();
        {
            let mut state = self.shared.state.lock();
            state.exiting = true;
            self.shared.notify_all();
            while state.threads != 0 {
                state = self.shared.exit_cv.wait(state);
            }
        }

        for handle in [workers.quiesce.take(), workers.sync.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                error!("txg worker panicked");
            }
        }

        self.shared.dispatcher.shutdown();
        if let Some(handle) = workers.dispatch.take() {
            if handle.join().is_err() {
                error!("txg callback dispatcher panicked");
            }
        }
    }

    /// Whether the sync workers are running.
    /// 同步工作线程是否正在运行。
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().threads != 0
    }

    /// Admit the calling thread into the open generation.
    ///
    /// Never performs I/O. The calling thread is mapped to a fixed worker
    /// shard, so concurrent callers on different threads rarely contend.
    ///
    /// 将调用线程准入到打开的事务组。
    /// 从不执行 I/O。调用线程被映射到固定的工作者分片，
    /// 因此不同线程上的并发调用者很少竞争。
    #[inline]
    pub fn hold_open(&self) -> TxgHandle<'_> {
        let cpu = current_shard_hint() % self.shared.cpus.len();
        TxgHandle::hold(&self.shared, cpu)
    }

    /// Admit into the open generation through an explicit worker shard.
    ///
    /// `shard` is reduced modulo the shard count.
    ///
    /// 通过指定的工作者分片准入到打开的事务组。
    #[inline]
    pub fn hold_open_on(&self, shard: usize) -> TxgHandle<'_> {
        TxgHandle::hold(&self.shared, shard % self.shared.cpus.len())
    }

    /// Number of admission shards.
    #[inline]
    pub fn worker_shards(&self) -> usize {
        self.shared.cpus.len()
    }

    /// The generation currently accepting new handles.
    /// 当前接受新句柄的事务组。
    #[inline]
    pub fn open_txg(&self) -> u64 {
        self.shared.open_txg()
    }

    /// The last generation durably committed.
    /// 最后一个被持久提交的事务组。
    pub fn synced_txg(&self) -> u64 {
        self.shared.state.lock().synced_txg
    }

    /// The generation being quiesced, or `0`.
    pub fn quiescing_txg(&self) -> u64 {
        self.shared.state.lock().quiescing_txg
    }

    /// The generation being synced, or `0`.
    pub fn syncing_txg(&self) -> u64 {
        self.shared.state.lock().syncing_txg
    }

    /// Change how long a generation stays open absent a kick.
    /// 修改在没有 kick 的情况下事务组保持打开的时长。
    pub fn set_sync_interval(&self, interval: Duration) {
        self.shared.set_sync_interval(interval);
        self.shared.sync_more_cv.notify_all();
    }

    /// Current sync interval.
    pub fn sync_interval(&self) -> Duration {
        self.shared.sync_interval()
    }

    /// Check that `txg` is a generation callers may legitimately reference
    /// now: not newer than the open one, not older than the last synced, and
    /// within `TXG_CONCURRENT_STATES` of the open one. Generations up to
    /// `TXG_INITIAL` are always accepted.
    ///
    /// 检查 `txg` 是否是调用者此刻可以合法引用的事务组。
    pub fn verify(&self, txg: u64) -> TxgResult<()> {
        if txg <= TXG_INITIAL {
            return Ok(());
        }
        let state = self.shared.state.lock();
        let open = self.shared.open_txg();
        let low = state
            .synced_txg
            .max(open.saturating_sub(TXG_CONCURRENT_STATES as u64));
        if txg > open || txg < low {
            return Err(TxgError::OutOfWindow {
                txg,
                low,
                high: open,
            });
        }
        Ok(())
    }

    /// Record `extent` of `objset` as freed in generation `txg`.
    ///
    /// It becomes allocatable exactly when `txg + TXG_DEFER_SIZE` is synced.
    /// `txg` must be newer than the last synced generation and not newer
    /// than the open one.
    ///
    /// 将 `objset` 的 `extent` 记录为在事务组 `txg` 中释放。
    /// 它恰好在 `txg + TXG_DEFER_SIZE` 同步完成时变为可分配。
    pub fn defer_free(&self, objset: ObjsetId, txg: u64, extent: Extent) -> TxgResult<()> {
        let state = self.shared.state.lock();
        let open = self.shared.open_txg();
        if txg <= state.synced_txg || txg > open {
            return Err(TxgError::OutOfWindow {
                txg,
                low: state.synced_txg + 1,
                high: open,
            });
        }
        // Recorded under the state lock so a concurrent sync cannot pass
        // this generation's window unnoticed.
        self.shared.defer.record(objset, txg, extent);
        Ok(())
    }

    /// Take every extent of `objset` whose defer window has passed.
    /// 取出 `objset` 中所有推迟窗口已过的区段。
    pub fn take_allocatable(&self, objset: ObjsetId) -> Vec<Extent> {
        self.shared.defer.take_allocatable(objset)
    }

    /// Frees of `objset` still inside their defer window, with the
    /// generation that recorded them.
    pub fn pending_frees(&self, objset: ObjsetId) -> Vec<(u64, Extent)> {
        self.shared.defer.pending(objset)
    }

    /// Snapshot of the per-generation history, oldest first.
    /// 每事务组历史的快照，最旧的在前。
    pub fn history(&self) -> Vec<TxgRecord> {
        self.shared.state.lock().history.snapshot()
    }
}

impl Drop for Txg {
    fn drop(&mut self) {
        if self.is_running() {
            warn!(
                open_txg = self.open_txg(),
                "txg pipeline dropped while running, in-flight txgs are not drained"
            );
        }
        self.shutdown_workers();

        let dropped = self.shared.drop_parked_callbacks();
        if dropped > 0 {
            error!(dropped, "commit callbacks dropped at teardown");
        }
        let frees = self.shared.defer.pending_count();
        if frees > 0 {
            warn!(frees, "deferred frees still pending at teardown");
        }
    }
}

impl std::fmt::Debug for Txg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Txg")
            .field("open_txg", &self.shared.open_txg())
            .field("quiescing_txg", &state.quiescing_txg)
            .field("quiesced_txg", &state.quiesced_txg)
            .field("retry_txg", &state.retry_txg)
            .field("syncing_txg", &state.syncing_txg)
            .field("synced_txg", &state.synced_txg)
            .field("running", &(state.threads != 0))
            .finish()
    }
}
