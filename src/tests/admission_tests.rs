/// 准入测试模块
/// 测试 hold_open / release 与分片计数器的正确性

use super::{TestPool, fast_config, manual_config, new_txg, wait_until};
use crate::state::txg_index;
use crate::{CommitCallback, CommitStatus, WaitFlags};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// 测试1: 未启动时所有准入都进入初始事务组
#[test]
fn test_hold_joins_initial_txg() {
    let pool = TestPool::new();
    let txg = new_txg(&pool, manual_config(10));

    let a = txg.hold_open();
    let b = txg.hold_open_on(1);
    assert_eq!(a.txg(), 10);
    assert_eq!(b.txg(), 10);
    assert_eq!(txg.open_txg(), 10);
    assert_eq!(txg.synced_txg(), 9);

    a.release_to_quiesce();
    b.release_to_sync();
}

/// 测试2: 显式分片按分片数取模
#[test]
fn test_hold_open_on_wraps_shard() {
    let pool = TestPool::new();
    let txg = new_txg(&pool, manual_config(4));
    assert_eq!(txg.worker_shards(), 4);

    let handle = txg.hold_open_on(6);
    assert_eq!(handle.shard(), 2);
}

/// 测试3: 句柄递增并递减同一个分片上的计数
#[test]
fn test_release_decrements_bound_shard() {
    let pool = TestPool::new();
    let txg = new_txg(&pool, manual_config(4));
    let t = txg_index(4);

    let h0 = txg.hold_open_on(0);
    let h1 = txg.hold_open_on(1);
    let h1b = txg.hold_open_on(1);
    let counts = |shard: usize| txg.shared.cpus[shard].inner.lock().count[t];
    assert_eq!(counts(0), 1);
    assert_eq!(counts(1), 2);

    h1.release_to_sync();
    assert_eq!(counts(1), 1);
    drop(h1b);
    assert_eq!(counts(1), 0);
    assert_eq!(counts(0), 1);
    h0.release_to_quiesce();
    assert_eq!(counts(0), 0);
}

/// 测试4: 三个工作者在事务组 10 中，两个释放后 10 仍不能同步
/// 第三个释放后 10 同步完成，新的准入进入 11
#[test]
fn test_quiesce_waits_for_every_handle() {
    let pool = TestPool::new();
    let txg = new_txg(&pool, manual_config(10));
    txg.sync_start().unwrap();

    let w0 = txg.hold_open_on(0);
    let w1 = txg.hold_open_on(1);
    let w2 = txg.hold_open_on(2);
    assert!([&w0, &w1, &w2].iter().all(|h| h.txg() == 10));

    w0.release_to_sync();
    w1.release_to_sync();

    // 请求关闭事务组 10
    txg.kick(10);
    txg.wait_open(11, false).unwrap();
    assert_eq!(txg.quiescing_txg(), 10);

    // 关闭之后的准入进入 11
    let late = txg.hold_open();
    assert_eq!(late.txg(), 11);
    late.release_to_sync();

    // 第三个工作者仍持有句柄，10 无法同步
    thread::sleep(Duration::from_millis(50));
    assert_eq!(txg.synced_txg(), 9);
    assert!(pool.synced().is_empty());

    w2.release_to_sync();
    txg.wait_synced(10, WaitFlags::NONE).unwrap();
    assert!(txg.synced_txg() >= 10);
    assert_eq!(pool.synced()[0], 10);

    txg.sync_stop(WaitFlags::NONE).unwrap();
}

/// 测试5: 多线程并发准入，打开的事务组永远不超前 TXG_CONCURRENT_STATES
#[test]
fn test_concurrent_admission_backpressure() {
    let pool = TestPool::new();
    let txg = new_txg(&pool, fast_config(4));
    txg.sync_start().unwrap();

    let committed = Arc::new(AtomicUsize::new(0));
    let aborted = Arc::new(AtomicUsize::new(0));
    let threads = 6;
    let per_thread = 200;

    thread::scope(|s| {
        for i in 0..threads {
            let txg = &txg;
            let committed = Arc::clone(&committed);
            let aborted = Arc::clone(&aborted);
            s.spawn(move || {
                for n in 0..per_thread {
                    let mut handle = txg.hold_open();
                    let committed = Arc::clone(&committed);
                    let aborted = Arc::clone(&aborted);
                    handle.register_callbacks([CommitCallback::new(move |status| {
                        match status {
                            CommitStatus::Committed => committed.fetch_add(1, Ordering::SeqCst),
                            CommitStatus::Aborted => aborted.fetch_add(1, Ordering::SeqCst),
                        };
                    })]);
                    if (i + n) % 5 == 0 {
                        handle.release_to_quiesce();
                    } else {
                        handle.release_to_sync();
                    }

                    // 先读 open 后读 synced，差值只可能被低估
                    let open = txg.open_txg();
                    let synced = txg.synced_txg();
                    assert!(open <= synced + crate::TXG_CONCURRENT_STATES as u64);
                }
            });
        }
    });

    txg.sync_stop(WaitFlags::NONE).unwrap();
    txg.wait_callbacks();

    let total = threads * per_thread;
    let committed = committed.load(Ordering::SeqCst);
    let aborted = aborted.load(Ordering::SeqCst);
    assert_eq!(committed + aborted, total);
    assert_eq!(aborted, total / 5);
}

/// 测试6: 同步间隔由运行时调整生效
#[test]
fn test_set_sync_interval_drives_progress() {
    let pool = TestPool::new();
    let txg = new_txg(&pool, manual_config(4));
    txg.sync_start().unwrap();

    thread::sleep(Duration::from_millis(30));
    assert!(pool.synced().is_empty());

    txg.set_sync_interval(Duration::from_millis(10));
    assert_eq!(txg.sync_interval(), Duration::from_millis(10));
    assert!(wait_until(Duration::from_secs(5), || pool.synced().len() >= 3));

    // 同步的事务组必须连续递增
    let synced = pool.synced();
    for pair in synced.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }
    assert_eq!(synced[0], 4);

    txg.sync_stop(WaitFlags::NONE).unwrap();
}
