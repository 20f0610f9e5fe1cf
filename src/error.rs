//! Error types for the transaction-group pipeline.
//!
//! Admission never fails; only waits, stops and window checks surface errors.
//! A stalled pipeline is a queryable state ([`Txg::stalled`](crate::Txg::stalled)),
//! not an error.

use std::io;
use thiserror::Error;

/// Result type for txg operations.
pub type TxgResult<T> = Result<T, TxgError>;

/// Errors surfaced by waits, lifecycle calls and generation checks.
#[derive(Debug, Error)]
pub enum TxgError {
    /// A `SIGNAL` wait was aborted because the caller's interrupt was raised.
    #[error("wait interrupted by signal")]
    Interrupted,

    /// A `NOSUSPEND` wait was aborted because the pool is suspended.
    #[error("pool suspended while waiting for txg {txg}")]
    WouldBlock { txg: u64 },

    /// The awaited generation was discarded by a forced export.
    #[error("txg {txg} abandoned by forced export")]
    Abandoned { txg: u64 },

    /// The sync workers are not running, so the wait could never finish.
    #[error("txg sync workers are not running")]
    NotRunning,

    /// `sync_start` was called while the workers were already running.
    #[error("txg sync workers are already running")]
    AlreadyRunning,

    /// The generation is outside the window this operation accepts.
    #[error("txg {txg} outside of valid window [{low}, {high}]")]
    OutOfWindow { txg: u64, low: u64, high: u64 },

    /// Invalid configuration.
    #[error("txg configuration error: {reason}")]
    Config { reason: String },

    /// A background worker thread could not be spawned.
    #[error("failed to spawn txg worker: {source}")]
    Spawn {
        #[from]
        source: io::Error,
    },
}

impl TxgError {
    /// Creates a config error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Returns true if the caller may simply retry the same wait later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Interrupted | Self::WouldBlock { .. })
    }
}

/// Failure reported by the pool's blocking sync operation.
///
/// Any variant leaves the generation in flight: the sync worker marks the
/// pipeline stalled and retries it.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The pool is suspended and cannot write.
    #[error("pool is suspended")]
    Suspended,

    /// I/O error during write-out.
    #[error("sync I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Any other failure.
    #[error("sync failed: {reason}")]
    Failed { reason: String },
}

impl SyncError {
    /// Creates a generic failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}
