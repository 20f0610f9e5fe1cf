use crate::error::SyncError;

/// The storage pool the pipeline commits generations to.
///
/// The pipeline decides *when* a generation is written; the pool decides
/// *how*. Implementations must not call back into the owning
/// [`Txg`](crate::Txg) from `is_suspended` or `is_exporting`: both are
/// queried while the pipeline's state lock is held.
///
/// 流水线提交事务组的存储池。
/// 流水线决定*何时*写入一个事务组；存储池决定*如何*写入。
pub trait SyncPool: Send + Sync + 'static {
    /// Write generation `txg` to durable storage. Blocks until done.
    ///
    /// An error leaves the generation in flight; the sync worker marks the
    /// pipeline stalled and retries the same generation.
    ///
    /// 将事务组 `txg` 写入持久存储。阻塞直到完成。
    fn sync_txg(&self, txg: u64) -> Result<(), SyncError>;

    /// Whether the pool is suspended (I/O cannot currently complete).
    /// 存储池是否被挂起（I/O 当前无法完成）。
    fn is_suspended(&self) -> bool;

    /// Whether the pool is being exported.
    /// 存储池是否正在被导出。
    fn is_exporting(&self) -> bool {
        false
    }
}
