//! Transaction-group commit pipeline.
//!
//! Every mutation of a storage pool joins the currently *open* transaction
//! group (a "txg", identified by a monotonically increasing generation
//! number). Each group then moves through a fixed sequence of stages:
//!
//! ```text
//! OPEN ──close──▶ QUIESCING ──drained──▶ QUIESCED ──▶ SYNCING ──▶ SYNCED
//! ```
//!
//! At most [`TXG_CONCURRENT_STATES`] generations are active at once (one
//! open, one quiescing, one syncing), so per-generation state lives in rings
//! of [`TXG_SIZE`] slots indexed by `txg & TXG_MASK`.
//!
//! - [`Txg::hold_open`] admits a caller into the open generation through a
//!   per-worker, cache-aligned counter shard, without I/O.
//! - Two background workers close, quiesce and sync generations in order
//!   through the pool's [`SyncPool::sync_txg`].
//! - [`CommitCallback`]s registered on a handle run in enqueue order once
//!   their generation is synced.
//! - [`TxgList`] tracks objects with work pending in specific generations.
//! - Frees recorded with [`Txg::defer_free`] become allocatable
//!   [`TXG_DEFER_SIZE`] generations after the one that recorded them.
//!
//! 事务组提交流水线。
//!
//! 存储池的每次修改都加入当前*打开*的事务组，每个事务组依次经过打开、静默、
//! 同步等固定阶段。同一时刻最多有 [`TXG_CONCURRENT_STATES`] 个事务组处于活跃状态，
//! 因此每事务组状态保存在大小为 [`TXG_SIZE`] 的环形槽中。

mod callback;
mod config;
mod defer;
mod driver;
mod error;
mod handle;
mod history;
mod list;
mod pool;
mod state;
mod sync;
mod txg;
mod wait;

pub use callback::{CommitCallback, CommitStatus};
pub use config::{
    DEFAULT_HISTORY_LEN, DEFAULT_RETRY_INTERVAL, DEFAULT_SYNC_INTERVAL,
    DEFAULT_WAIT_POLL_INTERVAL, TxgConfig, TxgConfigBuilder,
};
pub use defer::{Extent, ObjsetId};
pub use error::{SyncError, TxgError, TxgResult};
pub use handle::TxgHandle;
pub use history::{TxgRecord, TxgStage};
pub use list::{TxgList, TxgNode};
pub use pool::SyncPool;
pub use state::{
    TXG_CONCURRENT_STATES, TXG_DEFER_SIZE, TXG_INITIAL, TXG_MASK, TXG_SIZE, TXG_UNKNOWN,
    txg_clean, txg_index,
};
pub use txg::{StopOutcome, Txg};
pub use wait::{Interrupt, WaitFlags};

#[cfg(test)]
mod tests;
