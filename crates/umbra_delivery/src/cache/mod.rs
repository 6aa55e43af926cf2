//! # Cell Cache
//!
//! Compressed payloads for one world under one compression setting, shared
//! by every session looking at that world.
//!
//! ## Protocol
//!
//! ```text
//! request(cell)
//!   ├─ entry exists ──► hit, return the same future (in flight or done)
//!   └─ no entry ──────► miss, insert fresh future, submit worker task
//!                          │
//!                          ├─ task ok ───► future resolves, handlers fire
//!                          └─ task fails ► entry still ours? restart
//!
//! restart(cell)   (pending entries only)
//!   cancel old future → drop entry → request again → move old handlers over
//! ```
//!
//! At most one preparation per cell is in flight, however many sessions ask.
//! Presence in the map is the single source of truth for "in flight or
//! cached".

mod registry;

pub use registry::{CacheKey, CellCacheRegistry};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use umbra_core::{CellCoord, CellKey, CompressionConfig, WorldId};

use crate::collab::{CellListener, CellTransform, ListenerId, WorldProvider};
use crate::error::{DeliveryError, DeliveryResult, TaskFailure};
use crate::future::CompressedBatchFuture;
use crate::worker::{CellRequestCompletion, CellWorkerTask, WorkerPool};

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// Shared per-world payload cache.
pub struct CellCache {
    id: u64,
    me: Weak<CellCache>,
    world: Arc<dyn WorldProvider>,
    compression: CompressionConfig,
    transform: Option<Arc<dyn CellTransform>>,
    pool: Arc<WorkerPool>,
    entries: Mutex<HashMap<CellKey, CompressedBatchFuture>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CellCache {
    /// Creates a cache. `transform`, when set, is applied to every cell
    /// before compression.
    #[must_use]
    pub fn new(
        world: Arc<dyn WorldProvider>,
        compression: CompressionConfig,
        transform: Option<Arc<dyn CellTransform>>,
        pool: Arc<WorkerPool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            world,
            compression,
            transform,
            pool,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Returns a future for the cell's compressed payload, starting a
    /// preparation only if none is in flight or cached.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::CellNotLoaded`] if the world has no content for the
    /// cell, [`DeliveryError::PoolClosed`] if the task cannot be queued.
    pub fn request_compressed(&self, cell: CellCoord) -> DeliveryResult<CompressedBatchFuture> {
        if !self.world.is_cell_loaded(cell) {
            return Err(DeliveryError::CellNotLoaded(cell));
        }
        let listener: Weak<dyn CellListener> = self.me.clone();
        self.world.register_cell_listener(cell, self.listener_id(), listener);

        let key = cell.to_key();
        if let Some(existing) = self.entries.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(existing.clone());
        }

        let snapshot = self
            .world
            .cell_snapshot(cell)
            .ok_or(DeliveryError::CellNotLoaded(cell))?;
        self.misses.fetch_add(1, Ordering::Relaxed);

        let future = CompressedBatchFuture::new();
        self.entries.lock().insert(key, future.clone());

        let task = CellWorkerTask::new(snapshot, self.compression, self.transform.clone());
        let cache = self.me.clone();
        let watched = future.clone();
        let completion = CellRequestCompletion::new(
            cell,
            future.clone(),
            Box::new(move |cell, failure| match cache.upgrade() {
                Some(cache) => cache.handle_failure(cell, &watched, &failure),
                None => Vec::new(),
            }),
        );

        if let Err(e) = self.pool.submit(task, completion) {
            self.entries.lock().remove(&key);
            return Err(e);
        }
        Ok(future)
    }

    fn handle_failure(&self, cell: CellCoord, watched: &CompressedBatchFuture, failure: &TaskFailure) -> Vec<DeliveryError> {
        tracing::error!("Failed preparing cell {} in {}, retrying: {}", cell, self.world.id(), failure);

        let still_ours = self
            .entries
            .lock()
            .get(&cell.to_key())
            .is_some_and(|current| current.ptr_eq(watched));
        if !still_ours {
            return Vec::new();
        }

        match self.restart_pending_request(cell) {
            Ok(errors) => errors,
            Err(e) => vec![e],
        }
    }

    /// Cancels the pending preparation of `cell`, starts a new one, and moves
    /// every handler of the old future onto the new one in order.
    ///
    /// Returns errors from handlers that ran synchronously while being moved.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::RestartInvariant`] if there is no entry or it is
    /// already resolved; the cache is left untouched. If the new request
    /// fails its error is passed through, after every abandon handler of
    /// the old future received it.
    pub fn restart_pending_request(&self, cell: CellCoord) -> DeliveryResult<Vec<DeliveryError>> {
        let key = cell.to_key();
        let existing = {
            let mut entries = self.entries.lock();
            match entries.get(&key) {
                Some(future) if !future.has_result() => future.cancel()?,
                _ => return Err(DeliveryError::RestartInvariant(cell)),
            }
            entries.remove(&key).ok_or(DeliveryError::RestartInvariant(cell))?
        };

        let handlers = existing.take_resolve_callbacks();
        let abandon = existing.take_abandon_callbacks();
        let replacement = match self.request_compressed(cell) {
            Ok(replacement) => replacement,
            Err(e) => {
                tracing::warn!("Could not restart preparation of {}: {}", cell, e);
                for callback in abandon {
                    callback(&e);
                }
                return Err(e);
            }
        };

        for callback in abandon {
            replacement.on_abandon(callback);
        }
        let mut errors = Vec::new();
        for callback in handlers {
            if let Err(e) = replacement.on_resolve(callback) {
                errors.push(e);
            }
        }
        Ok(errors)
    }

    /// Drops a resolved entry or restarts a pending one.
    pub fn invalidate(&self, cell: CellCoord) -> Vec<DeliveryError> {
        let key = cell.to_key();
        let pending = {
            let mut entries = self.entries.lock();
            match entries.get(&key).map(CompressedBatchFuture::has_result) {
                Some(false) => true,
                Some(true) => {
                    entries.remove(&key);
                    false
                }
                None => return Vec::new(),
            }
        };

        if pending {
            match self.restart_pending_request(cell) {
                Ok(errors) => errors,
                Err(e) => vec![e],
            }
        } else {
            self.world.unregister_cell_listener(cell, self.listener_id());
            Vec::new()
        }
    }

    /// Removes the entry without restarting anything.
    pub fn evict(&self, cell: CellCoord) -> Option<CompressedBatchFuture> {
        let removed = self.entries.lock().remove(&cell.to_key());
        if removed.is_some() {
            self.world.unregister_cell_listener(cell, self.listener_id());
        }
        removed
    }

    /// Looks at an entry without counting a hit.
    #[must_use]
    pub fn get(&self, cell: CellCoord) -> Option<CompressedBatchFuture> {
        self.entries.lock().get(&cell.to_key()).cloned()
    }

    /// Number of cached or in-flight entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Requests served from an existing entry.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Requests that started a preparation.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Fraction of requests served from cache.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// World this cache serves.
    #[must_use]
    pub fn world_id(&self) -> WorldId {
        self.world.id()
    }

    /// Compression applied to every payload.
    #[must_use]
    pub fn compression(&self) -> CompressionConfig {
        self.compression
    }

    /// Returns true if payloads pass through a transform.
    #[must_use]
    pub fn is_transformed(&self) -> bool {
        self.transform.is_some()
    }

    fn listener_id(&self) -> ListenerId {
        ListenerId::Cache(self.id)
    }
}

impl CellListener for CellCache {
    fn on_cell_changed(&self, cell: CellCoord) -> Vec<DeliveryError> {
        self.invalidate(cell)
    }

    fn on_cell_unloaded(&self, cell: CellCoord) {
        self.evict(cell);
    }
}
