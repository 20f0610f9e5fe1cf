use crate::callback::{CommitCallback, CommitStatus, QueuedCallback};
use crate::state::{TxShared, txg_index};
use crate::sync::Ordering;
use std::mem;

/// A caller's admission into one open generation.
///
/// Obtained from [`Txg::hold_open`](crate::Txg::hold_open). While it is
/// alive the generation it was admitted into cannot finish quiescing. It is
/// bound to the worker shard whose counter it incremented, and releasing it
/// decrements that same counter.
///
/// Every handle is released exactly once: through
/// [`release_to_quiesce`](Self::release_to_quiesce),
/// [`release_to_sync`](Self::release_to_sync), or by being dropped (which
/// behaves like `release_to_quiesce`).
///
/// 调用者进入一个打开事务组的准入句柄。
///
/// 通过 [`Txg::hold_open`](crate::Txg::hold_open) 获得。只要它存在，
/// 它所属的事务组就无法完成静默。它绑定到它所递增计数器的工作者分片，
/// 释放时递减同一个计数器。
///
/// 每个句柄恰好被释放一次：通过 `release_to_quiesce`、`release_to_sync`，
/// 或者被 drop（行为等同于 `release_to_quiesce`）。
#[must_use = "dropping a handle releases it immediately"]
pub struct TxgHandle<'t> {
    shared: &'t TxShared,
    cpu: usize,
    txg: u64,
    callbacks: Vec<CommitCallback>,
    released: bool,
}

impl<'t> TxgHandle<'t> {
    /// Admit into the open generation through shard `cpu`.
    pub(crate) fn hold(shared: &'t TxShared, cpu: usize) -> Self {
        let tc = &shared.cpus[cpu];
        let txg = {
            let mut inner = tc.inner.lock();
            // The quiesce worker bumps `open_txg` with every shard lock held,
            // so the value read here cannot close before the count below lands.
            let txg = shared.open_txg();
            inner.count[txg_index(txg)] += 1;
            txg
        };

        TxgHandle {
            shared,
            cpu,
            txg,
            callbacks: Vec::new(),
            released: false,
        }
    }

    /// The generation this handle was admitted into.
    /// 此句柄被准入的事务组。
    #[inline]
    pub fn txg(&self) -> u64 {
        self.txg
    }

    /// The worker shard this handle is bound to.
    /// 此句柄绑定的工作者分片。
    #[inline]
    pub fn shard(&self) -> usize {
        self.cpu
    }

    /// Attach commit callbacks.
    ///
    /// They are handed to the generation's callback queue by
    /// [`release_to_sync`](Self::release_to_sync) and run once the generation
    /// is synced. If the handle is instead released to quiesce (or dropped)
    /// they run immediately with [`CommitStatus::Aborted`].
    ///
    /// 附加提交回调。
    /// 它们由 `release_to_sync` 移交给事务组的回调队列，并在事务组同步完成后运行。
    /// 如果句柄改为以 quiesce 方式释放（或被 drop），它们会立即以
    /// [`CommitStatus::Aborted`] 运行。
    pub fn register_callbacks<I>(&mut self, callbacks: I)
    where
        I: IntoIterator<Item = CommitCallback>,
    {
        self.callbacks.extend(callbacks);
    }

    /// Release the handle without committing its callbacks.
    /// 释放句柄，不提交其回调。
    pub fn release_to_quiesce(mut self) {
        self.release(false);
    }

    /// Release the handle and move its callbacks onto the generation's
    /// commit callback queue.
    ///
    /// 释放句柄，并将其回调移到事务组的提交回调队列。
    pub fn release_to_sync(mut self) {
        self.release(true);
    }

    fn release(&mut self, to_sync: bool) {
        if mem::replace(&mut self.released, true) {
            return;
        }
        let callbacks = mem::take(&mut self.callbacks);
        let tc = &self.shared.cpus[self.cpu];
        let t = txg_index(self.txg);

        let aborted = {
            let mut inner = tc.inner.lock();
            // Callbacks must land before the count drops, or the sync worker
            // could collect the slot without them.
            let aborted = if to_sync {
                for callback in callbacks {
                    let seq = self.shared.callback_seq.fetch_add(1, Ordering::Relaxed);
                    inner.callbacks[t].push(QueuedCallback { seq, callback });
                }
                Vec::new()
            } else {
                callbacks
            };

            debug_assert!(inner.count[t] > 0, "txg handle released twice");
            inner.count[t] -= 1;
            if inner.count[t] == 0 {
                tc.drained.notify_all();
            }
            aborted
        };

        for callback in aborted {
            callback.invoke(CommitStatus::Aborted);
        }
    }
}

impl Drop for TxgHandle<'_> {
    fn drop(&mut self) {
        self.release(false);
    }
}

impl std::fmt::Debug for TxgHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxgHandle")
            .field("txg", &self.txg)
            .field("shard", &self.cpu)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}
