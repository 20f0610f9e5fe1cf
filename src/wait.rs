use crate::error::{TxgError, TxgResult};
use crate::state::{PipelineState, TxShared};
use crate::sync::MutexGuard;
use crate::txg::Txg;
use std::cell::RefCell;
use std::ops::BitOr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Cancellation behaviour of [`Txg::wait_synced`].
///
/// Flags combine with `|`. The default, [`WaitFlags::NONE`], waits until the
/// generation is synced no matter what.
///
/// [`Txg::wait_synced`] 的取消行为。标志可以用 `|` 组合。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitFlags(u8);

impl WaitFlags {
    pub const NONE: Self = Self(0);
    /// Fail with [`TxgError::Interrupted`] once the calling thread's
    /// [`Interrupt`] is raised.
    pub const SIGNAL: Self = Self(1 << 0);
    /// Fail with [`TxgError::WouldBlock`] instead of waiting on a suspended
    /// or failing pool.
    pub const NOSUSPEND: Self = Self(1 << 1);
    /// Return as soon as a forced export is requested.
    pub const FORCE_EXPORT: Self = Self(1 << 2);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    const fn is_cancellable(self) -> bool {
        self.0 != 0
    }
}

impl BitOr for WaitFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

thread_local! {
    static CURRENT_INTERRUPT: RefCell<Option<Interrupt>> = const { RefCell::new(None) };
}

/// A per-thread interruption flag, the analogue of a pending signal.
///
/// Another thread may hold a clone of a thread's `Interrupt` and raise it;
/// any [`WaitFlags::SIGNAL`] wait that thread is in (or enters) then fails
/// with [`TxgError::Interrupted`]. The flag stays raised until cleared.
///
/// 每线程的中断标志，相当于一个待处理的信号。
///
/// 其他线程可以持有某个线程的 `Interrupt` 克隆并触发它；该线程所处（或将进入）的
/// 任何 `SIGNAL` 等待随后都会以 `Interrupted` 失败。标志会一直保持，直到被清除。
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// The calling thread's interrupt flag.
    /// 调用线程的中断标志。
    pub fn current() -> Self {
        CURRENT_INTERRUPT.with(|slot| slot.borrow_mut().get_or_insert_with(Self::default).clone())
    }

    /// Mark an interruption pending for the owning thread.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Acknowledge a pending interruption.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl TxShared {
    /// Error for a waiter on `txg` if that generation can no longer sync.
    fn abandoned_error(&self, state: &PipelineState, txg: u64) -> Option<TxgError> {
        match state.abandoned_from {
            Some(from) if txg >= from => Some(TxgError::Abandoned { txg }),
            _ => None,
        }
    }

    fn export_requested(&self, state: &PipelineState) -> bool {
        state.force_export || self.pool.is_exporting()
    }

    /// Park on `cv`, polling when the wait has cancellation predicates.
    fn park<'a>(
        &self,
        cv: &crate::sync::Condvar,
        state: MutexGuard<'a, PipelineState>,
        poll: bool,
    ) -> MutexGuard<'a, PipelineState> {
        if poll {
            cv.wait_timeout(state, self.config.wait_poll_interval).0
        } else {
            cv.wait(state)
        }
    }
}

impl Txg {
    /// Block until the open generation is at least `txg` (`0` means the one
    /// after the current open generation).
    ///
    /// With `should_kick`, asks the quiesce worker to close generations now
    /// instead of waiting for the sync interval.
    ///
    /// 阻塞直到打开的事务组至少为 `txg`（`0` 表示当前打开事务组的下一个）。
    /// 如果 `should_kick` 为真，则请求静默线程立即关闭事务组，而不是等待同步间隔。
    pub fn wait_open(&self, txg: u64, should_kick: bool) -> TxgResult<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let txg = if txg == 0 { shared.open_txg() + 1 } else { txg };

        while shared.open_txg() < txg {
            if let Some(err) = shared.abandoned_error(&state, txg) {
                return Err(err);
            }
            if state.threads == 0 {
                return Err(TxgError::NotRunning);
            }
            if should_kick && state.quiesce_txg_waiting < txg {
                state.quiesce_txg_waiting = txg;
                shared.quiesce_more_cv.notify_all();
            }
            state = shared.quiesce_done_cv.wait(state);
        }
        Ok(())
    }

    /// Block until generation `txg` is synced (`0` means the current open
    /// generation).
    ///
    /// `flags` selects which conditions cancel the wait; see [`WaitFlags`].
    /// Without any, the call waits indefinitely, including across pool
    /// stalls. A generation discarded by a forced export fails with
    /// [`TxgError::Abandoned`] unless [`WaitFlags::FORCE_EXPORT`] is given.
    ///
    /// 阻塞直到事务组 `txg` 同步完成（`0` 表示当前打开的事务组）。
    ///
    /// `flags` 选择哪些条件会取消等待。没有任何标志时调用会无限期等待，
    /// 包括在存储池停滞期间。被强制导出丢弃的事务组会以 `Abandoned` 失败，
    /// 除非指定了 `FORCE_EXPORT`。
    pub fn wait_synced(&self, txg: u64, flags: WaitFlags) -> TxgResult<()> {
        let shared = &self.shared;
        let interrupt = flags
            .contains(WaitFlags::SIGNAL)
            .then(Interrupt::current);

        let mut state = shared.state.lock();
        let txg = if txg == 0 { shared.open_txg() } else { txg };

        while state.synced_txg < txg {
            if flags.contains(WaitFlags::FORCE_EXPORT) && shared.export_requested(&state) {
                debug!(txg, "wait_synced released by forced export");
                return Ok(());
            }
            if let Some(err) = shared.abandoned_error(&state, txg) {
                return Err(err);
            }
            if interrupt.as_ref().is_some_and(Interrupt::is_pending) {
                return Err(TxgError::Interrupted);
            }
            if flags.contains(WaitFlags::NOSUSPEND)
                && (state.sync_failing || shared.pool.is_suspended())
            {
                return Err(TxgError::WouldBlock { txg });
            }
            if state.threads == 0 {
                return Err(TxgError::NotRunning);
            }

            if state.sync_txg_waiting < txg {
                state.sync_txg_waiting = txg;
                shared.sync_more_cv.notify_all();
            }
            state.sync_waiters += 1;
            state = shared.park(&shared.sync_done_cv, state, flags.is_cancellable());
            state.sync_waiters -= 1;
        }
        Ok(())
    }

    /// Hurry generation `txg` along: if it is still the open generation and
    /// no quiesce is already pending, close it now instead of at the end of
    /// the sync interval.
    ///
    /// 催促事务组 `txg`：如果它仍是打开的事务组且没有待处理的静默请求，
    /// 则立即关闭它，而不是等到同步间隔结束。
    pub fn kick(&self, txg: u64) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if shared.open_txg() == txg
            && state.quiesce_txg_waiting <= txg
            && state.sync_txg_waiting <= state.synced_txg
            && state.quiesced_txg == 0
        {
            debug!(txg, "txg kicked");
            state.quiesce_txg_waiting = txg + 1;
            shared.quiesce_more_cv.notify_all();
        }
    }

    /// Throttle the caller for up to `delta`, rounded up to `resolution`.
    ///
    /// Returns early once generation `txg - 1` is syncing (the caller's
    /// generation is next in line), when the pipeline is stalled, or when the
    /// workers are not running.
    ///
    /// 将调用者节流最多 `delta`（向上取整到 `resolution`）。
    /// 当事务组 `txg - 1` 正在同步、流水线停滞或工作线程未运行时提前返回。
    pub fn delay(&self, txg: u64, delta: Duration, resolution: Duration) {
        let shared = &self.shared;
        let deadline = Instant::now() + round_up(delta, resolution);
        let previous = txg.saturating_sub(1);

        let mut state = shared.state.lock();
        loop {
            if state.exiting
                || state.threads == 0
                || state.syncing_txg.max(state.synced_txg) >= previous
                || shared.stalled_locked(&state)
            {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            state = shared.quiesce_more_cv.wait_timeout(state, deadline - now).0;
        }
    }

    /// Whether the pipeline is backed up: the sync worker is retrying a
    /// failed generation, or a quiesce was requested and the open generation
    /// has not advanced yet.
    ///
    /// 流水线是否堵塞：同步线程正在重试失败的事务组，或者已请求静默但打开的事务组尚未推进。
    pub fn stalled(&self) -> bool {
        let state = self.shared.state.lock();
        self.shared.stalled_locked(&state)
    }

    /// Whether some thread is parked in [`wait_synced`](Self::wait_synced).
    pub fn sync_waiting(&self) -> bool {
        self.shared.state.lock().sync_waiters > 0
    }

    /// Request that in-flight work be abandoned.
    ///
    /// [`WaitFlags::FORCE_EXPORT`] waits return immediately, and the sync
    /// worker gives up on a generation the pool keeps failing to write.
    ///
    /// 请求放弃进行中的工作。
    pub fn force_export(&self) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if !state.force_export {
            debug!(open_txg = shared.open_txg(), "forced export requested");
        }
        state.force_export = true;
        shared.notify_all();
    }

    /// Wake every waiter so it re-checks its cancellation predicates, e.g.
    /// after the pool became suspended.
    ///
    /// 唤醒所有等待者，使其重新检查取消条件（例如存储池刚被挂起之后）。
    pub fn completion_notify(&self) {
        let _state = self.shared.state.lock();
        self.shared.sync_done_cv.notify_all();
        self.shared.quiesce_done_cv.notify_all();
    }

    /// Retry a stalled generation now instead of after the retry interval.
    /// 立即重试停滞的事务组，而不是等待重试间隔。
    pub fn resume(&self) {
        let mut state = self.shared.state.lock();
        state.resume_requested = true;
        self.shared.sync_more_cv.notify_all();
    }

    /// Block until every commit callback handed to the dispatcher so far has
    /// finished running.
    ///
    /// 阻塞直到目前为止移交给分发线程的所有提交回调都运行完毕。
    pub fn wait_callbacks(&self) {
        self.shared.dispatcher.wait_idle();
    }

    /// Commit callbacks queued to the dispatcher but not yet finished.
    pub fn pending_callbacks(&self) -> u64 {
        self.shared.dispatcher.pending()
    }
}

fn round_up(delta: Duration, resolution: Duration) -> Duration {
    let res = resolution.as_nanos();
    if res == 0 {
        return delta;
    }
    let rounded = delta.as_nanos().div_ceil(res) * res;
    Duration::from_nanos(u64::try_from(rounded).unwrap_or(u64::MAX))
}
