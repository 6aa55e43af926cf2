//! # Cell Preparation Task
//!
//! Turns one cell snapshot into a compressed payload on a worker thread.

use std::sync::Arc;

use umbra_core::{CellCoord, CellSnapshot, CompressionConfig};

use super::{TaskCompletion, WorkerTask};
use crate::collab::CellTransform;
use crate::error::{DeliveryError, TaskFailure};
use crate::future::CompressedBatchFuture;

/// Off-thread half: snapshot in, compressed frame out.
pub struct CellWorkerTask {
    snapshot: CellSnapshot,
    compression: CompressionConfig,
    transform: Option<Arc<dyn CellTransform>>,
}

impl CellWorkerTask {
    /// Creates a task over an owned snapshot.
    #[must_use]
    pub fn new(
        snapshot: CellSnapshot,
        compression: CompressionConfig,
        transform: Option<Arc<dyn CellTransform>>,
    ) -> Self {
        Self {
            snapshot,
            compression,
            transform,
        }
    }
}

impl WorkerTask for CellWorkerTask {
    fn run(&self) -> Result<Vec<u8>, TaskFailure> {
        let encoded = match &self.transform {
            Some(transform) => {
                let mut copy = self.snapshot.clone();
                transform.apply(&mut copy)?;
                copy.encode()
            }
            None => self.snapshot.encode(),
        };
        Ok(self.compression.compress(&encoded))
    }
}

/// Failure handler supplied by the cache that issued the task.
pub type PreparationFailureHandler = Box<dyn FnOnce(CellCoord, TaskFailure) -> Vec<DeliveryError> + Send>;

/// Control-thread half: resolves the cache's future or reports failure.
pub struct CellRequestCompletion {
    cell: CellCoord,
    future: CompressedBatchFuture,
    on_failure: PreparationFailureHandler,
}

impl CellRequestCompletion {
    /// Binds a future and a failure handler to one cell.
    #[must_use]
    pub fn new(cell: CellCoord, future: CompressedBatchFuture, on_failure: PreparationFailureHandler) -> Self {
        Self {
            cell,
            future,
            on_failure,
        }
    }
}

impl TaskCompletion for CellRequestCompletion {
    fn on_completion(self: Box<Self>, output: Vec<u8>) -> Vec<DeliveryError> {
        match self.future.resolve(Arc::from(output)) {
            Ok(errors) => errors,
            Err(DeliveryError::Cancelled) => {
                // Restarted while this task was running; the replacement owns the callbacks now.
                tracing::debug!("Discarding payload of cancelled request for cell {}", self.cell);
                Vec::new()
            }
            Err(e) => vec![e],
        }
    }

    fn on_failure(self: Box<Self>, failure: TaskFailure) -> Vec<DeliveryError> {
        let this = *self;
        (this.on_failure)(this.cell, failure)
    }
}
