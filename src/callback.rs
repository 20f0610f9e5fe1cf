use crate::sync::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error};

/// How a commit callback's generation ended.
/// 提交回调所属事务组的结束方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// The generation is durably committed.
    /// 事务组已被持久提交。
    Committed,
    /// The handle was released without being handed to a generation.
    /// 句柄在未移交给事务组的情况下被释放。
    Aborted,
}

/// A unit of work that runs once its generation is durably committed.
///
/// 一个在其事务组被持久提交后运行的工作单元。
pub struct CommitCallback(Box<dyn FnOnce(CommitStatus) + Send + 'static>);

impl CommitCallback {
    /// Wrap a closure.
    #[inline]
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(CommitStatus) + Send + 'static,
    {
        Self(Box::new(f))
    }

    #[inline]
    pub(crate) fn invoke(self, status: CommitStatus) {
        (self.0)(status)
    }
}

impl std::fmt::Debug for CommitCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CommitCallback { .. }")
    }
}

/// A callback parked on a worker shard, stamped with its global enqueue order.
pub(crate) struct QueuedCallback {
    pub(crate) seq: u64,
    pub(crate) callback: CommitCallback,
}

struct DispatchQueue {
    batches: VecDeque<(u64, Vec<QueuedCallback>)>,
    /// Callbacks ever handed to the dispatcher.
    queued: u64,
    /// Callbacks that have finished running.
    completed: u64,
    exiting: bool,
}

/// Per-generation commit callback queue, drained by one dispatcher thread.
///
/// Batches are run in the order they were enqueued, which is generation
/// order because only the sync worker enqueues. Callbacks never run while
/// any pipeline lock is held.
///
/// 每个事务组的提交回调队列，由一个分发线程排空。
/// 批次按入队顺序运行，也就是事务组顺序，因为只有同步线程会入队。
/// 回调在持有任何流水线锁时都不会运行。
pub(crate) struct CallbackDispatcher {
    queue: Mutex<DispatchQueue>,
    work_cv: Condvar,
    idle_cv: Condvar,
}

impl CallbackDispatcher {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(DispatchQueue {
                batches: VecDeque::new(),
                queued: 0,
                completed: 0,
                exiting: false,
            }),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
        }
    }

    /// Queue generation `txg`'s callbacks. `batch` must already be in
    /// enqueue order.
    pub(crate) fn enqueue(&self, txg: u64, batch: Vec<QueuedCallback>) {
        if batch.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        queue.queued += batch.len() as u64;
        queue.batches.push_back((txg, batch));
        self.work_cv.notify_one();
    }

    /// Block until every queued callback has finished running.
    pub(crate) fn wait_idle(&self) {
        let mut queue = self.queue.lock();
        while queue.completed < queue.queued {
            queue = self.idle_cv.wait(queue);
        }
    }

    /// Number of callbacks queued but not yet finished.
    pub(crate) fn pending(&self) -> u64 {
        let queue = self.queue.lock();
        queue.queued - queue.completed
    }

    pub(crate) fn reset(&self) {
        self.queue.lock().exiting = false;
    }

    /// Ask the dispatcher to exit once the queue is empty.
    pub(crate) fn shutdown(&self) {
        let mut queue = self.queue.lock();
        queue.exiting = true;
        self.work_cv.notify_all();
    }

    /// Dispatcher thread body.
    pub(crate) fn run(&self) {
        loop {
            let (txg, batch) = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(next) = queue.batches.pop_front() {
                        break next;
                    }
                    if queue.exiting {
                        return;
                    }
                    queue = self.work_cv.wait(queue);
                }
            };

            let n = batch.len() as u64;
            debug!(txg, callbacks = n, "dispatching commit callbacks");
            for queued in batch {
                let seq = queued.seq;
                let callback = queued.callback;
                let result = panic::catch_unwind(AssertUnwindSafe(move || {
                    callback.invoke(CommitStatus::Committed)
                }));
                if result.is_err() {
                    error!(txg, seq, "commit callback panicked");
                }
            }

            let mut queue = self.queue.lock();
            queue.completed += n;
            if queue.completed == queue.queued {
                self.idle_cv.notify_all();
            }
        }
    }
}

/// Sort a generation's callbacks into global enqueue order.
pub(crate) fn into_enqueue_order(mut batch: Vec<QueuedCallback>) -> Vec<QueuedCallback> {
    batch.sort_by_key(|queued| queued.seq);
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queued(seq: u64, f: impl FnOnce(CommitStatus) + Send + 'static) -> QueuedCallback {
        QueuedCallback {
            seq,
            callback: CommitCallback::new(f),
        }
    }

    #[test]
    fn test_batches_run_in_order_and_wait_idle() {
        let dispatcher = Arc::new(CallbackDispatcher::new());
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let worker = {
            let dispatcher = dispatcher.clone();
            std::thread::spawn(move || dispatcher.run())
        };

        for txg in 5..8u64 {
            let batch = (0..3)
                .map(|i| {
                    let log = log.clone();
                    queued(txg * 10 + i, move |status| {
                        assert_eq!(status, CommitStatus::Committed);
                        log.lock().unwrap().push(txg * 10 + i);
                    })
                })
                .collect();
            dispatcher.enqueue(txg, batch);
        }

        dispatcher.wait_idle();
        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(
            *log.lock().unwrap(),
            vec![50, 51, 52, 60, 61, 62, 70, 71, 72]
        );

        dispatcher.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn test_panicking_callback_does_not_stop_dispatcher() {
        let dispatcher = Arc::new(CallbackDispatcher::new());
        let ran = Arc::new(AtomicUsize::new(0));

        let worker = {
            let dispatcher = dispatcher.clone();
            std::thread::spawn(move || dispatcher.run())
        };

        let ran_clone = ran.clone();
        dispatcher.enqueue(
            4,
            vec![
                queued(0, |_| panic!("callback failure")),
                queued(1, move |_| {
                    ran_clone.fetch_add(1, Ordering::SeqCst);
                }),
            ],
        );

        dispatcher.wait_idle();
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        dispatcher.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn test_enqueue_order_sorting() {
        let batch = vec![
            queued(9, |_| {}),
            queued(2, |_| {}),
            queued(5, |_| {}),
        ];
        let seqs: Vec<u64> = into_enqueue_order(batch).iter().map(|q| q.seq).collect();
        assert_eq!(seqs, vec![2, 5, 9]);
    }
}
