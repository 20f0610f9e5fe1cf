/// 流水线生命周期测试模块
/// 测试启动/停止、强制导出、推迟释放、窗口校验和历史记录

use super::{TestPool, fast_config, manual_config, new_txg, wait_until};
use crate::{
    CommitCallback, Extent, StopOutcome, TXG_DEFER_SIZE, Txg, TxgConfig, TxgError, TxgStage,
    WaitFlags,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// 测试1: 重复启动返回 AlreadyRunning，未启动时停止返回 NotRunning
#[test]
fn test_start_stop_lifecycle() {
    let pool = TestPool::new();
    let txg = new_txg(&pool, fast_config(4));

    assert!(matches!(
        txg.sync_stop(WaitFlags::NONE),
        Err(TxgError::NotRunning)
    ));

    txg.sync_start().unwrap();
    assert!(txg.is_running());
    assert!(matches!(txg.sync_start(), Err(TxgError::AlreadyRunning)));

    let open = txg.open_txg();
    let outcome = txg.sync_stop(WaitFlags::NONE).unwrap();
    match outcome {
        StopOutcome::Drained { synced_txg } => assert!(synced_txg >= open + TXG_DEFER_SIZE),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!txg.is_running());

    // 停止后可以重新启动，事务组编号继续递增
    txg.sync_start().unwrap();
    let handle = txg.hold_open();
    assert!(handle.txg() > open);
    handle.release_to_sync();
    txg.sync_stop(WaitFlags::NONE).unwrap();
}

/// 测试2: 同步的事务组严格按顺序、连续且只同步一次
#[test]
fn test_synced_in_order_without_gaps() {
    let pool = TestPool::new();
    let txg = new_txg(&pool, fast_config(4));
    txg.sync_start().unwrap();

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..100 {
                    let handle = txg.hold_open();
                    let g = handle.txg();
                    handle.release_to_sync();
                    if g % 3 == 0 {
                        txg.wait_synced(g, WaitFlags::NONE).unwrap();
                    }
                }
            });
        }
    });
    txg.sync_stop(WaitFlags::NONE).unwrap();

    let synced = pool.synced();
    assert_eq!(synced[0], 4);
    for pair in synced.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }
    assert_eq!(*synced.last().unwrap(), txg.synced_txg());
}

/// 测试3: 事务组 5 中推迟的释放在 7 同步完成时恰好变为可分配
#[test]
fn test_deferred_free_window() {
    let pool = TestPool::new();
    let txg = new_txg(&pool, manual_config(5));
    txg.sync_start().unwrap();
    let extent = Extent::new(8192, 4096);

    txg.defer_free(1, 5, extent).unwrap();
    assert_eq!(txg.pending_frees(1), vec![(5, extent)]);
    assert!(txg.pending_frees(2).is_empty());

    txg.wait_synced(5, WaitFlags::NONE).unwrap();
    assert!(txg.take_allocatable(1).is_empty());

    txg.wait_synced(6, WaitFlags::NONE).unwrap();
    assert!(txg.take_allocatable(1).is_empty());
    assert_eq!(txg.pending_frees(1), vec![(5, extent)]);

    txg.wait_synced(7, WaitFlags::NONE).unwrap();
    assert_eq!(txg.take_allocatable(1), vec![extent]);
    assert!(txg.pending_frees(1).is_empty());
    assert!(txg.take_allocatable(1).is_empty());

    txg.sync_stop(WaitFlags::NONE).unwrap();
}

/// 测试4: 窗口之外的推迟释放被拒绝
#[test]
fn test_deferred_free_rejects_out_of_window() {
    let pool = TestPool::new();
    let txg = new_txg(&pool, manual_config(5));

    // 已同步的事务组
    assert!(matches!(
        txg.defer_free(1, 4, Extent::new(0, 512)),
        Err(TxgError::OutOfWindow { txg: 4, .. })
    ));
    // 尚未打开的事务组
    assert!(matches!(
        txg.defer_free(1, 6, Extent::new(0, 512)),
        Err(TxgError::OutOfWindow { txg: 6, low: 5, high: 5 })
    ));
}

/// 测试5: sync_stop 释放所有推迟的空间
#[test]
fn test_stop_releases_all_deferred_frees() {
    let pool = TestPool::new();
    let txg = new_txg(&pool, manual_config(4));
    txg.sync_start().unwrap();

    let open = txg.open_txg();
    txg.defer_free(3, open, Extent::new(0, 1024)).unwrap();
    txg.sync_stop(WaitFlags::NONE).unwrap();

    assert!(txg.pending_frees(3).is_empty());
    assert_eq!(txg.take_allocatable(3), vec![Extent::new(0, 1024)]);
}

/// 测试6: 强制导出放弃卡住的事务组，普通等待者得到 Abandoned
#[test]
fn test_force_export_abandons() {
    let pool = TestPool::new();
    pool.set_failing(true);
    let txg = new_txg(&pool, manual_config(4));
    txg.sync_start().unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let mut handle = txg.hold_open();
    let g = handle.txg();
    let ran_clone = Arc::clone(&ran);
    handle.register_callbacks([CommitCallback::new(move |_| {
        ran_clone.fetch_add(1, Ordering::SeqCst);
    })]);
    handle.release_to_sync();

    thread::scope(|s| {
        let waiter = s.spawn(|| txg.wait_synced(g, WaitFlags::NONE));
        assert!(wait_until(Duration::from_secs(5), || txg.stalled()));

        txg.force_export();
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, TxgError::Abandoned { txg } if txg == g));
    });

    // FORCE_EXPORT 等待立即返回
    txg.wait_synced(g, WaitFlags::FORCE_EXPORT).unwrap();

    let outcome = txg.sync_stop(WaitFlags::FORCE_EXPORT).unwrap();
    assert_eq!(
        outcome,
        StopOutcome::Abandoned {
            from_txg: g,
            dropped_callbacks: 1
        }
    );
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(txg.synced_txg(), g - 1);
    assert!(pool.synced().is_empty());

    // 被放弃的流水线不能再次启动
    assert!(matches!(txg.sync_start(), Err(TxgError::Abandoned { .. })));

    let history = txg.history();
    let record = history.iter().find(|r| r.txg == g).unwrap();
    assert_eq!(record.stage, TxgStage::Abandoned);
}

/// 测试7: 存储池正在导出时 FORCE_EXPORT 等待直接返回
#[test]
fn test_force_export_flag_follows_pool_export() {
    let pool = TestPool::new();
    pool.set_failing(true);
    let txg = new_txg(&pool, manual_config(4));
    txg.sync_start().unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| txg.wait_synced(4, WaitFlags::FORCE_EXPORT));
        thread::sleep(Duration::from_millis(30));
        pool.set_exporting(true);
        txg.completion_notify();
        waiter.join().unwrap().unwrap();
    });

    pool.set_failing(false);
    txg.resume();
    txg.sync_stop(WaitFlags::NONE).unwrap();
}

/// 测试8: verify 只接受当前窗口内的事务组
#[test]
fn test_verify_window() {
    let pool = TestPool::new();
    let txg = new_txg(&pool, manual_config(10));

    // 不超过 TXG_INITIAL 的事务组总是有效
    txg.verify(1).unwrap();
    txg.verify(10).unwrap();
    txg.verify(9).unwrap();
    assert!(matches!(
        txg.verify(11),
        Err(TxgError::OutOfWindow { txg: 11, low: 9, high: 10 })
    ));
    assert!(matches!(
        txg.verify(8),
        Err(TxgError::OutOfWindow { .. })
    ));
}

/// 测试9: 历史记录包含各阶段的耗时
#[test]
fn test_history_tracks_stages() {
    let pool = TestPool::new();
    let txg = new_txg(&pool, manual_config(4));
    txg.sync_start().unwrap();

    let handle = txg.hold_open();
    handle.release_to_sync();
    txg.wait_synced(4, WaitFlags::NONE).unwrap();

    let history = txg.history();
    let record = history.iter().find(|r| r.txg == 4).unwrap();
    assert_eq!(record.stage, TxgStage::Synced);
    assert!(record.open_time.is_some());
    assert!(record.quiesce_time.is_some());
    assert!(record.sync_time.is_some());

    // 下一个事务组处于打开状态
    let next = history.iter().find(|r| r.txg == 5).unwrap();
    assert_eq!(next.stage, TxgStage::Open);

    let json = serde_json::to_string(record).unwrap();
    assert!(json.contains("\"stage\":\"Synced\""));

    txg.sync_stop(WaitFlags::NONE).unwrap();
}

/// 测试10: 多个流水线互不影响
#[test]
fn test_independent_pipelines() {
    let pool_a = TestPool::new();
    let pool_b = TestPool::new();
    let a = new_txg(&pool_a, manual_config(4));
    let b = new_txg(&pool_b, manual_config(100));
    a.sync_start().unwrap();
    b.sync_start().unwrap();

    a.wait_synced(6, WaitFlags::NONE).unwrap();
    assert_eq!(b.synced_txg(), 99);
    assert!(pool_b.synced().is_empty());

    b.wait_synced(100, WaitFlags::NONE).unwrap();
    assert_eq!(pool_b.synced(), vec![100]);

    a.sync_stop(WaitFlags::NONE).unwrap();
    b.sync_stop(WaitFlags::NONE).unwrap();
}

/// 测试11: 无效配置被拒绝
#[test]
fn test_rejects_invalid_config() {
    let pool = TestPool::new();
    let config = TxgConfig {
        worker_shards: 0,
        ..TxgConfig::default()
    };
    assert!(matches!(
        Txg::new(pool, config),
        Err(TxgError::Config { .. })
    ));
}

/// 测试12: 运行中的流水线被 drop 时工作线程退出
#[test]
fn test_drop_running_pipeline() {
    let pool = TestPool::new();
    let txg = new_txg(&pool, fast_config(4));
    txg.sync_start().unwrap();
    let handle = txg.hold_open();
    handle.release_to_sync();
    drop(txg);
    // 如果工作线程没有退出，drop 会一直阻塞
}

/// 测试13: 普通停止时，目标之后仍在重试的事务组不会被放弃，重新启动后继续同步
#[test]
fn test_plain_stop_keeps_failing_txg_for_restart() {
    let pool = TestPool::new();
    pool.hold_sync(6);
    pool.set_fail_from(7);
    let txg = new_txg(&pool, manual_config(4));
    txg.sync_start().unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let outcome = thread::scope(|s| {
        // 停止目标为 4 + TXG_DEFER_SIZE = 6
        let stopper = s.spawn(|| txg.sync_stop(WaitFlags::NONE));
        assert!(wait_until(Duration::from_secs(5), || pool.blocked_on() == Some(6)));

        // 6 同步期间关闭 7，它在 6 完成后立即进入失败重试
        txg.wait_open(8, true).unwrap();
        let mut handle = txg.hold_open();
        assert_eq!(handle.txg(), 8);
        let ran_clone = Arc::clone(&ran);
        handle.register_callbacks([CommitCallback::new(move |_| {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        })]);
        handle.release_to_sync();
        assert!(wait_until(Duration::from_secs(5), || {
            txg.history()
                .iter()
                .any(|r| r.txg == 7 && r.stage == TxgStage::Quiesced)
        }));

        pool.release_sync();
        stopper.join().unwrap()
    });

    assert_eq!(outcome.unwrap(), StopOutcome::Drained { synced_txg: 6 });
    assert!(!txg.is_running());
    assert!(!txg.stalled());
    assert_eq!(txg.synced_txg(), 6);
    let history = txg.history();
    assert!(history.iter().all(|r| r.stage != TxgStage::Abandoned));
    let record = history.iter().find(|r| r.txg == 7).unwrap();
    assert_eq!(record.stage, TxgStage::Quiesced);

    // 重新启动后先重试 7，再同步 8
    txg.sync_start().unwrap();
    pool.set_fail_from(0);
    txg.resume();
    txg.wait_synced(8, WaitFlags::NONE).unwrap();
    assert_eq!(pool.synced(), vec![4, 5, 6, 7, 8]);
    txg.wait_callbacks();
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    txg.sync_stop(WaitFlags::NONE).unwrap();
}
