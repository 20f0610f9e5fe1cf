/// 测试模块
/// 共享的测试存储池和配置辅助函数

mod admission_tests;
mod pipeline_tests;

use crate::{SyncError, SyncPool, Txg, TxgConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// 可控的测试存储池：记录每次成功同步的事务组，可以模拟同步失败和挂起，
/// 也可以把某个事务组的同步挡在闸门处
#[derive(Default)]
pub(crate) struct TestPool {
    synced: Mutex<Vec<u64>>,
    attempts: AtomicUsize,
    failing: AtomicBool,
    /// 不小于该值的事务组同步失败；0 表示关闭
    fail_from: AtomicU64,
    suspended: AtomicBool,
    exporting: AtomicBool,
    gate: Mutex<Gate>,
    gate_cv: Condvar,
}

#[derive(Default)]
struct Gate {
    held: Option<u64>,
    blocked_on: Option<u64>,
}

impl TestPool {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn synced(&self) -> Vec<u64> {
        self.synced.lock().unwrap().clone()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn set_failing(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_from(&self, txg: u64) {
        self.fail_from.store(txg, Ordering::SeqCst);
    }

    /// 事务组 `txg` 的同步在 `release_sync` 之前一直阻塞
    pub(crate) fn hold_sync(&self, txg: u64) {
        self.gate.lock().unwrap().held = Some(txg);
    }

    pub(crate) fn release_sync(&self) {
        self.gate.lock().unwrap().held = None;
        self.gate_cv.notify_all();
    }

    /// 当前被闸门挡住的事务组
    pub(crate) fn blocked_on(&self) -> Option<u64> {
        self.gate.lock().unwrap().blocked_on
    }

    pub(crate) fn set_suspended(&self, on: bool) {
        self.suspended.store(on, Ordering::SeqCst);
    }

    pub(crate) fn set_exporting(&self, on: bool) {
        self.exporting.store(on, Ordering::SeqCst);
    }
}

impl SyncPool for TestPool {
    fn sync_txg(&self, txg: u64) -> Result<(), SyncError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut gate = self.gate.lock().unwrap();
            while gate.held == Some(txg) {
                gate.blocked_on = Some(txg);
                gate = self.gate_cv.wait(gate).unwrap();
            }
            gate.blocked_on = None;
        }
        let fail_from = self.fail_from.load(Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) || (fail_from != 0 && txg >= fail_from) {
            return Err(SyncError::Suspended);
        }
        self.synced.lock().unwrap().push(txg);
        Ok(())
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    fn is_exporting(&self) -> bool {
        self.exporting.load(Ordering::SeqCst)
    }
}

/// 快速配置：短同步间隔，适合需要流水线自行推进的测试
pub(crate) fn fast_config(initial_txg: u64) -> TxgConfig {
    TxgConfig::builder()
        .initial_txg(initial_txg)
        .worker_shards(4)
        .sync_interval(Duration::from_millis(20))
        .retry_interval(Duration::from_millis(10))
        .wait_poll_interval(Duration::from_millis(5))
        .build()
        .unwrap()
}

/// 慢速配置：同步间隔很长，事务组只在显式请求时推进
pub(crate) fn manual_config(initial_txg: u64) -> TxgConfig {
    TxgConfig::builder()
        .initial_txg(initial_txg)
        .worker_shards(4)
        .sync_interval(Duration::from_secs(60))
        .retry_interval(Duration::from_millis(10))
        .wait_poll_interval(Duration::from_millis(5))
        .build()
        .unwrap()
}

pub(crate) fn new_txg(pool: &Arc<TestPool>, config: TxgConfig) -> Txg {
    Txg::new(Arc::clone(pool), config).unwrap()
}

/// 轮询直到条件成立或超时
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
