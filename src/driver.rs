//! The generation sync driver.
//!
//! Two workers share the pipeline state lock:
//!
//! - the quiesce worker closes the open generation (OPEN → QUIESCING) and
//!   waits for its outstanding handles to drain, leaving it quiesced;
//! - the sync worker takes the quiesced generation, hands it to the pool
//!   (SYNCING), then publishes it as SYNCED, releases deferred frees and
//!   queues its commit callbacks.
//!
//! Running them separately lets one generation quiesce while the previous one
//! syncs, so open, quiescing and syncing are all live at once and the open
//! generation is never more than `TXG_CONCURRENT_STATES` ahead of the last
//! synced one.
//!
//! 事务组同步驱动器。
//!
//! 两个工作线程共享流水线状态锁：静默线程关闭打开的事务组并等待其未完成句柄排空；
//! 同步线程取走已静默的事务组，交给存储池写出，然后将其发布为已同步、
//! 释放推迟的空闲空间并排队其提交回调。

use crate::callback::{QueuedCallback, into_enqueue_order};
use crate::history::TxgStage;
use crate::state::{PipelineState, TxShared, duration_to_ms, txg_index};
use crate::sync::Ordering;
use std::mem;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

enum SyncOutcome {
    Synced,
    /// Handed back for the next `sync_start` by a plain stop.
    Requeued,
    Abandoned,
}

/// Quiesce worker body.
pub(crate) fn quiesce_worker(shared: Arc<TxShared>) {
    debug!("txg quiesce worker started");
    let mut state = shared.state.lock();
    loop {
        // Wait until someone asks for the open generation to close and the
        // sync worker has taken the previously quiesced one.
        while !state.exiting
            && (shared.open_txg() >= state.quiesce_txg_waiting || state.quiesced_txg != 0)
        {
            state = shared.quiesce_more_cv.wait(state);
        }
        if state.exiting {
            break;
        }

        let txg = shared.open_txg();
        state.quiescing_txg = txg;
        state.history.advance(txg, TxgStage::Quiescing, Instant::now());
        debug!(txg, "txg quiescing");
        drop(state);

        shared.quiesce(txg);

        state = shared.state.lock();
        state.quiescing_txg = 0;
        state.quiesced_txg = txg;
        state.history.advance(txg, TxgStage::Quiesced, Instant::now());
        debug!(txg, "txg quiesced");
        shared.sync_more_cv.notify_all();
        shared.quiesce_done_cv.notify_all();
    }

    state.threads -= 1;
    shared.exit_cv.notify_all();
    shared.sync_done_cv.notify_all();
    shared.quiesce_done_cv.notify_all();
    debug!("txg quiesce worker exiting");
}

/// Sync worker body.
pub(crate) fn sync_worker(shared: Arc<TxShared>) {
    debug!("txg sync worker started");
    let mut start = Instant::now();
    let mut state = shared.state.lock();
    loop {
        // Sleep until the interval elapses, a sync is requested or a
        // generation has already quiesced. A kick shortens this only
        // indirectly: it makes the quiesce worker produce a quiesced txg.
        loop {
            if state.exiting
                || state.retry_txg != 0
                || state.quiesced_txg != 0
                || state.synced_txg < state.sync_txg_waiting
            {
                break;
            }
            let timeout = shared.sync_interval();
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                break;
            }
            state = shared.sync_more_cv.wait_timeout(state, timeout - elapsed).0;
        }

        // Wait for the quiesce worker to hand a generation over, asking it
        // to close the open one if nobody has yet. A generation requeued by
        // the last stop is older than anything quiesced since.
        while !state.exiting && state.retry_txg == 0 && state.quiesced_txg == 0 {
            let want = shared.open_txg() + 1;
            if state.quiesce_txg_waiting < want {
                state.quiesce_txg_waiting = want;
            }
            shared.quiesce_more_cv.notify_all();
            state = shared.quiesce_done_cv.wait(state);
        }
        if state.exiting {
            break;
        }

        let txg = match mem::take(&mut state.retry_txg) {
            0 => mem::take(&mut state.quiesced_txg),
            txg => txg,
        };
        state.syncing_txg = txg;
        state.history.advance(txg, TxgStage::Syncing, Instant::now());
        debug!(txg, "txg syncing");
        shared.quiesce_more_cv.notify_all();
        drop(state);

        start = Instant::now();
        match shared.sync_with_retry(txg) {
            SyncOutcome::Synced => {}
            SyncOutcome::Requeued | SyncOutcome::Abandoned => {
                state = shared.state.lock();
                break;
            }
        }

        // Every handle of `txg` has been released, so its callback slots are
        // complete and nothing else touches them until the slot is reused.
        let batch = shared.collect_callbacks(txg);

        state = shared.state.lock();
        state.synced_txg = txg;
        state.syncing_txg = 0;
        let released = shared.defer.release_through(txg);
        state.history.advance(txg, TxgStage::Synced, Instant::now());
        debug!(
            txg,
            callbacks = batch.len(),
            released_frees = released,
            elapsed_ms = duration_to_ms(start.elapsed()),
            "txg synced"
        );
        shared.dispatcher.enqueue(txg, batch);
        shared.sync_done_cv.notify_all();
    }

    state.threads -= 1;
    shared.exit_cv.notify_all();
    shared.sync_done_cv.notify_all();
    shared.quiesce_done_cv.notify_all();
    debug!("txg sync worker exiting");
}

impl TxShared {
    /// Close generation `txg` to admission and wait for its handles to drain.
    pub(crate) fn quiesce(&self, txg: u64) {
        let t = txg_index(txg);

        {
            // Holding every shard lock guarantees no admission is between
            // reading `open_txg` and incrementing its count.
            let guards: Vec<_> = self.cpus.iter().map(|tc| tc.inner.lock()).collect();
            let mut state = self.state.lock();
            debug_assert_eq!(self.open_txg(), txg);
            self.open_txg.store(txg + 1, Ordering::Release);
            state.history.opened(txg + 1, Instant::now());
            // `wait_open` callers only need the new open generation.
            self.quiesce_done_cv.notify_all();
            drop(state);
            drop(guards);
        }

        for tc in self.cpus.iter() {
            let mut inner = tc.inner.lock();
            while inner.count[t] != 0 {
                inner = tc.drained.wait(inner);
            }
        }
    }

    /// Drain generation `txg`'s callbacks from every shard, in enqueue order.
    pub(crate) fn collect_callbacks(&self, txg: u64) -> Vec<QueuedCallback> {
        let t = txg_index(txg);
        let mut batch = Vec::new();
        for tc in self.cpus.iter() {
            batch.append(&mut tc.inner.lock().callbacks[t]);
        }
        into_enqueue_order(batch)
    }

    /// Drop every callback still parked on a shard. Returns how many.
    pub(crate) fn drop_parked_callbacks(&self) -> usize {
        let mut dropped = 0;
        for tc in self.cpus.iter() {
            let mut inner = tc.inner.lock();
            for slot in inner.callbacks.iter_mut() {
                dropped += slot.len();
                slot.clear();
            }
        }
        dropped
    }

    /// Sync `txg`, retrying while the pool fails, until it succeeds, a
    /// forced export abandons it, or a stop hands it back for the next start.
    fn sync_with_retry(&self, txg: u64) -> SyncOutcome {
        loop {
            let result = self.pool.sync_txg(txg);

            let mut state = self.state.lock();
            let err = match result {
                Ok(()) => {
                    if mem::take(&mut state.sync_failing) {
                        info!(txg, "txg sync recovered");
                    }
                    return SyncOutcome::Synced;
                }
                Err(err) => err,
            };

            if !state.sync_failing {
                warn!(txg, error = %err, "txg sync failed, pipeline stalled");
                state.sync_failing = true;
            } else {
                debug!(txg, error = %err, "txg sync retry failed");
            }
            // Let NOSUSPEND and FORCE_EXPORT waiters re-evaluate.
            self.sync_done_cv.notify_all();

            let deadline = Instant::now() + self.config.retry_interval;
            loop {
                if state.force_export {
                    self.abandon(&mut state, txg);
                    return SyncOutcome::Abandoned;
                }
                if state.exiting {
                    self.requeue(&mut state, txg);
                    return SyncOutcome::Requeued;
                }
                if mem::take(&mut state.resume_requested) {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                state = self.sync_more_cv.wait_timeout(state, deadline - now).0;
            }
        }
    }

    /// Park a failing `txg` as quiesced again so the next start retries it.
    /// Its handles are released and its callbacks stay parked on the shards.
    fn requeue(&self, state: &mut PipelineState, txg: u64) {
        warn!(txg, "txg sync workers stopping, failing txg kept for restart");
        state.retry_txg = txg;
        state.syncing_txg = 0;
        state.sync_failing = false;
        state.history.advance(txg, TxgStage::Quiesced, Instant::now());
        self.sync_done_cv.notify_all();
    }

    fn abandon(&self, state: &mut PipelineState, txg: u64) {
        error!(
            txg,
            open_txg = self.open_txg(),
            "abandoning uncommitted txgs for forced export"
        );
        state.abandoned_from = Some(txg);
        state.syncing_txg = 0;
        state.sync_failing = false;
        state.exiting = true;
        state.history.abandon_from(txg);
        self.notify_all();
    }
}
