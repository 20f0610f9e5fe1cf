use crate::callback::{CallbackDispatcher, QueuedCallback};
use crate::config::TxgConfig;
use crate::defer::DeferredFrees;
use crate::history::History;
use crate::pool::SyncPool;
use crate::sync::{AtomicU64, Condvar, Mutex, Ordering};
use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of generations that can be active at once: open, quiescing, syncing.
/// 可以同时活跃的事务组数量：打开、静默、同步。
pub const TXG_CONCURRENT_STATES: usize = 3;

/// Size of the generation slot ring; the next power of two above
/// [`TXG_CONCURRENT_STATES`], leaving one idle slot as a guard band.
///
/// 事务组槽环的大小；大于 [`TXG_CONCURRENT_STATES`] 的下一个 2 的幂，
/// 留出一个空闲槽作为保护带。
pub const TXG_SIZE: usize = 4;

/// Mask turning a generation number into a slot index.
/// 将事务组编号转换为槽索引的掩码。
pub const TXG_MASK: u64 = TXG_SIZE as u64 - 1;

/// Default first open generation.
/// 默认的第一个打开的事务组。
pub const TXG_INITIAL: u64 = TXG_SIZE as u64;

/// Reserved "no generation" value.
/// 保留的"无事务组"值。
pub const TXG_UNKNOWN: u64 = 0;

/// Number of generations frees are deferred before they become allocatable.
/// 释放的空间在变为可分配之前被推迟的事务组数量。
pub const TXG_DEFER_SIZE: u64 = 2;

/// Slot index of a generation.
#[inline(always)]
pub const fn txg_index(txg: u64) -> usize {
    (txg & TXG_MASK) as usize
}

/// The generation whose dirty state is clean once `txg` is syncing.
#[inline(always)]
pub const fn txg_clean(txg: u64) -> u64 {
    txg - 1
}

static NEXT_SHARD_HINT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

thread_local! {
    // Assigned round-robin on a thread's first admission.
    static SHARD_HINT: Cell<usize> = Cell::new(
        NEXT_SHARD_HINT.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    );
}

/// Stable per-thread shard hint; reduced modulo the shard count by callers.
#[inline]
pub(crate) fn current_shard_hint() -> usize {
    SHARD_HINT.with(|hint| hint.get())
}

/// Per-worker admission counters.
///
/// Cache-aligned so neighbouring shards never share a line.
///
/// 每个工作者的准入计数器。
/// 缓存对齐，使相邻分片不会共享缓存行。
#[repr(align(64))]
pub(crate) struct TxCpu {
    pub(crate) inner: Mutex<TxCpuInner>,
    /// Signalled when a slot's outstanding count drops to zero.
    /// 当某个槽的未完成计数降为零时发出信号。
    pub(crate) drained: Condvar,
}

pub(crate) struct TxCpuInner {
    /// Outstanding handles per generation slot.
    pub(crate) count: [u64; TXG_SIZE],
    /// Callbacks released to sync, per generation slot.
    pub(crate) callbacks: [Vec<QueuedCallback>; TXG_SIZE],
}

impl TxCpu {
    fn new() -> Self {
        Self {
            inner: Mutex::new(TxCpuInner {
                count: [0; TXG_SIZE],
                callbacks: Default::default(),
            }),
            drained: Condvar::new(),
        }
    }
}

/// Pipeline bookkeeping protected by the state lock.
///
/// `open_txg` lives outside this struct (in [`TxShared`]) because admission
/// reads it under a shard lock only; it is written with every shard lock and
/// this lock held.
///
/// 受状态锁保护的流水线簿记。
pub(crate) struct PipelineState {
    pub(crate) quiescing_txg: u64,
    /// Quiesced and waiting for the sync worker; `0` when none.
    pub(crate) quiesced_txg: u64,
    /// Failing generation a stop handed back; synced first on restart.
    pub(crate) retry_txg: u64,
    pub(crate) syncing_txg: u64,
    pub(crate) synced_txg: u64,
    /// Highest generation someone asked to see closed.
    pub(crate) quiesce_txg_waiting: u64,
    /// Highest generation someone asked to see synced.
    pub(crate) sync_txg_waiting: u64,
    /// Running sync workers (quiesce + sync).
    pub(crate) threads: usize,
    pub(crate) exiting: bool,
    /// The sync worker is retrying a generation the pool failed to write.
    pub(crate) sync_failing: bool,
    pub(crate) force_export: bool,
    pub(crate) resume_requested: bool,
    /// First generation discarded by a forced export.
    pub(crate) abandoned_from: Option<u64>,
    /// Threads parked in `wait_synced`.
    pub(crate) sync_waiters: usize,
    pub(crate) history: History,
}

/// State shared between the [`Txg`](crate::Txg) owner, handles and the
/// background workers.
///
/// 在 [`Txg`](crate::Txg) 所有者、句柄和后台工作线程之间共享的状态。
pub(crate) struct TxShared {
    pub(crate) config: TxgConfig,
    pub(crate) pool: Arc<dyn SyncPool>,
    pub(crate) cpus: Box<[TxCpu]>,
    pub(crate) open_txg: AtomicU64,
    /// Runtime-adjustable sync interval, in nanoseconds.
    pub(crate) sync_interval_ns: AtomicU64,
    /// Global enqueue order of commit callbacks.
    pub(crate) callback_seq: AtomicU64,
    pub(crate) state: Mutex<PipelineState>,
    pub(crate) sync_more_cv: Condvar,
    pub(crate) sync_done_cv: Condvar,
    pub(crate) quiesce_more_cv: Condvar,
    pub(crate) quiesce_done_cv: Condvar,
    pub(crate) exit_cv: Condvar,
    pub(crate) dispatcher: CallbackDispatcher,
    pub(crate) defer: DeferredFrees,
}

impl TxShared {
    pub(crate) fn new(pool: Arc<dyn SyncPool>, config: TxgConfig) -> Self {
        let txg = config.initial_txg;
        let cpus = (0..config.worker_shards).map(|_| TxCpu::new()).collect();
        let mut history = History::new(config.history_len);
        let now = Instant::now();
        history.opened(txg, now);

        Self {
            pool,
            cpus,
            open_txg: AtomicU64::new(txg),
            sync_interval_ns: AtomicU64::new(duration_to_ns(config.sync_interval)),
            callback_seq: AtomicU64::new(0),
            state: Mutex::new(PipelineState {
                quiescing_txg: TXG_UNKNOWN,
                quiesced_txg: TXG_UNKNOWN,
                retry_txg: TXG_UNKNOWN,
                syncing_txg: TXG_UNKNOWN,
                synced_txg: txg - 1,
                quiesce_txg_waiting: TXG_UNKNOWN,
                sync_txg_waiting: TXG_UNKNOWN,
                threads: 0,
                exiting: false,
                sync_failing: false,
                force_export: false,
                resume_requested: false,
                abandoned_from: None,
                sync_waiters: 0,
                history,
            }),
            sync_more_cv: Condvar::new(),
            sync_done_cv: Condvar::new(),
            quiesce_more_cv: Condvar::new(),
            quiesce_done_cv: Condvar::new(),
            exit_cv: Condvar::new(),
            dispatcher: CallbackDispatcher::new(),
            defer: DeferredFrees::new(),
            config,
        }
    }

    #[inline]
    pub(crate) fn open_txg(&self) -> u64 {
        self.open_txg.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn sync_interval(&self) -> Duration {
        Duration::from_nanos(self.sync_interval_ns.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_sync_interval(&self, interval: Duration) {
        self.sync_interval_ns
            .store(duration_to_ns(interval).max(1), Ordering::Relaxed);
    }

    /// Wake every thread waiting on any pipeline condition.
    pub(crate) fn notify_all(&self) {
        self.sync_more_cv.notify_all();
        self.sync_done_cv.notify_all();
        self.quiesce_more_cv.notify_all();
        self.quiesce_done_cv.notify_all();
        self.exit_cv.notify_all();
    }

    /// "Backed up": the sync worker is retrying, or a quiesce was requested
    /// and the open generation has not moved yet.
    #[inline]
    pub(crate) fn stalled_locked(&self, state: &PipelineState) -> bool {
        state.sync_failing || state.quiesce_txg_waiting > self.open_txg()
    }
}

fn duration_to_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
