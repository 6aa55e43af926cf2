//! # Delivery Error Types
//!
//! Stale completions are not errors: they return early without a trace.
//! Everything here is either an invariant violation in the caller or a
//! failure the transport layer has to act on.

use thiserror::Error;
use umbra_core::{CellCoord, SessionId};

/// Errors that can occur in the delivery pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Restart was called on a missing or already resolved cache entry.
    #[error("restart can only be applied to unresolved requests (cell {0})")]
    RestartInvariant(CellCoord),

    /// A compressed batch was resolved twice.
    #[error("compressed batch already resolved")]
    AlreadyResolved,

    /// The compressed batch was cancelled by a restart.
    #[error("compressed batch was cancelled")]
    Cancelled,

    /// Cancellation was attempted after resolution.
    #[error("cannot cancel a resolved compressed batch")]
    CancelAfterResolve,

    /// The world has no content for the requested cell.
    #[error("cannot request unloaded cell {0}")]
    CellNotLoaded(CellCoord),

    /// The world refused to start generating a cell.
    #[error("world refused to generate cell {0}")]
    GenerationRefused(CellCoord),

    /// The transport failed to deliver a payload.
    #[error("transmission of cell {cell} to {session} failed: {reason}")]
    Transmission {
        /// Receiving session.
        session: SessionId,
        /// Cell being sent.
        cell: CellCoord,
        /// Transport-provided reason.
        reason: String,
    },

    /// The worker pool no longer accepts tasks.
    #[error("worker pool is shut down")]
    PoolClosed,

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(String),

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failure reported by a task running on the worker pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("task failed: {0}")]
pub struct TaskFailure(pub String);

/// Result type for delivery operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;
