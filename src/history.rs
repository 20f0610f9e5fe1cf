use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Last stage a generation reached.
/// 事务组到达的最后阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TxgStage {
    Open,
    Quiescing,
    Quiesced,
    Syncing,
    Synced,
    /// Discarded by a forced export.
    Abandoned,
}

/// Timing of one generation through the pipeline.
///
/// 一个事务组通过流水线的耗时记录。
#[derive(Debug, Clone, Serialize)]
pub struct TxgRecord {
    pub txg: u64,
    pub stage: TxgStage,
    /// Time spent accepting new handles.
    pub open_time: Option<Duration>,
    /// Time spent draining outstanding handles.
    pub quiesce_time: Option<Duration>,
    /// Time spent quiesced, waiting for the sync worker.
    pub wait_time: Option<Duration>,
    /// Time spent in the pool's sync operation, retries included.
    pub sync_time: Option<Duration>,
    #[serde(skip)]
    stage_at: Option<Instant>,
}

/// Bounded ring of per-generation records, newest last.
pub(crate) struct History {
    records: VecDeque<TxgRecord>,
    cap: usize,
}

impl History {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(cap.min(1024)),
            cap,
        }
    }

    pub(crate) fn opened(&mut self, txg: u64, now: Instant) {
        if self.cap == 0 {
            return;
        }
        if self.records.len() == self.cap {
            self.records.pop_front();
        }
        self.records.push_back(TxgRecord {
            txg,
            stage: TxgStage::Open,
            open_time: None,
            quiesce_time: None,
            wait_time: None,
            sync_time: None,
            stage_at: Some(now),
        });
    }

    pub(crate) fn advance(&mut self, txg: u64, stage: TxgStage, now: Instant) {
        let Some(record) = self.records.iter_mut().rev().find(|r| r.txg == txg) else {
            return;
        };
        let elapsed = record.stage_at.map(|at| now.saturating_duration_since(at));
        match (record.stage, stage) {
            (TxgStage::Open, TxgStage::Quiescing) => record.open_time = elapsed,
            (TxgStage::Quiescing, TxgStage::Quiesced) => record.quiesce_time = elapsed,
            (TxgStage::Quiesced, TxgStage::Syncing) => record.wait_time = elapsed,
            (TxgStage::Syncing, TxgStage::Synced) => record.sync_time = elapsed,
            _ => {}
        }
        record.stage = stage;
        record.stage_at = Some(now);
    }

    /// Mark every generation from `txg` on that has not synced as abandoned.
    pub(crate) fn abandon_from(&mut self, txg: u64) {
        for record in self.records.iter_mut().filter(|r| r.txg >= txg) {
            if record.stage != TxgStage::Synced {
                record.stage = TxgStage::Abandoned;
                record.stage_at = None;
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<TxgRecord> {
        self.records.iter().cloned().collect()
    }
}
