//! # Collaborator Traits
//!
//! Interfaces to the systems around the pipeline. The pipeline never
//! generates, transforms or frames cells itself; it asks these.
//!
//! ```text
//! pipeline defines:          the host implements:
//! ┌──────────────────┐       ┌──────────────────┐
//! │ trait WorldProv. │  ←─   │ impl for World   │
//! │ trait Transport  │  ←─   │ impl for Network │
//! │ trait Transform  │  ←─   │ impl for Anti-X  │
//! └──────────────────┘       └──────────────────┘
//! ```
//!
//! Every method is called on the control thread except
//! [`CellTransform::apply`], which runs on a worker.

pub mod mock;

use std::collections::HashSet;
use std::sync::Weak;

use umbra_core::{CellCoord, CellSnapshot, SessionId, WorldId};

use crate::error::{DeliveryError, DeliveryResult, TaskFailure};
use crate::future::Payload;

/// Continuation run when the world reports a cell's content ready.
pub type CellReadyCallback = Box<dyn FnOnce() -> DeliveryResult<()> + Send>;

/// Continuation run when the world gives up on a cell.
pub type CellFailureCallback = Box<dyn FnOnce() + Send>;

// ============================================================================
// WORLD - Content Provider
// ============================================================================

/// Who registered a cell listener, so it can be removed again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListenerId {
    /// A session's delivery controller.
    Session(SessionId),
    /// A cell cache.
    Cache(u64),
}

/// Receives change notifications for cells it registered interest in.
pub trait CellListener: Send + Sync {
    /// The cell's content changed; anything derived from it is stale.
    fn on_cell_changed(&self, cell: CellCoord) -> Vec<DeliveryError>;

    /// The cell was unloaded from the world.
    fn on_cell_unloaded(&self, cell: CellCoord);
}

/// A world that owns cell content.
pub trait WorldProvider: Send + Sync {
    /// Identity of this world.
    fn id(&self) -> WorldId;

    /// Returns true if the cell's content is currently in memory.
    fn is_cell_loaded(&self, cell: CellCoord) -> bool;

    /// Takes an immutable copy of the cell's content.
    fn cell_snapshot(&self, cell: CellCoord) -> Option<CellSnapshot>;

    /// Makes sure the cell exists (load or generate), then calls exactly one
    /// of the continuations. May call `on_ready` before returning.
    ///
    /// # Errors
    ///
    /// Returns whatever a synchronously invoked `on_ready` returned.
    fn ensure_cell_ready(
        &self,
        cell: CellCoord,
        on_ready: CellReadyCallback,
        on_failure: CellFailureCallback,
    ) -> DeliveryResult<()>;

    /// Subscribes `listener` to changes of `cell`. Re-registering the same
    /// id replaces the previous entry.
    fn register_cell_listener(&self, cell: CellCoord, id: ListenerId, listener: Weak<dyn CellListener>);

    /// Removes a subscription made with [`WorldProvider::register_cell_listener`].
    fn unregister_cell_listener(&self, cell: CellCoord, id: ListenerId);
}

// ============================================================================
// NETWORK - Transport
// ============================================================================

/// Network side of a session.
pub trait Transport: Send + Sync {
    /// Returns true while the session's connection is open.
    fn is_connected(&self, session: SessionId) -> bool;

    /// Queues a compressed payload for the session.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Transmission`] when the connection cannot take it.
    fn transmit(&self, session: SessionId, cell: CellCoord, payload: &Payload) -> DeliveryResult<()>;

    /// Called after a cell was transmitted, for entity and event bookkeeping.
    fn notify_cell_sent(&self, _session: SessionId, _cell: CellCoord) {}

    /// Called once, when enough cells arrived for the client to spawn.
    fn notify_terrain_ready(&self, _session: SessionId) {}
}

// ============================================================================
// FEATURE - Per-World Obfuscation Switch
// ============================================================================

/// Decides whether a world's cells go through the [`CellTransform`].
pub trait FeatureGate: Send + Sync {
    /// Returns true if cells of `world` should be transformed.
    fn is_enabled_for_world(&self, world: WorldId) -> bool;
}

/// Transforms cell content before compression (ore hiding and the like).
///
/// Runs on worker threads against a private copy of the snapshot.
pub trait CellTransform: Send + Sync {
    /// Rewrites the snapshot in place.
    ///
    /// # Errors
    ///
    /// A [`TaskFailure`] makes the cache restart the preparation.
    fn apply(&self, snapshot: &mut CellSnapshot) -> Result<(), TaskFailure>;
}

/// Feature gate backed by a fixed set of enabled worlds.
#[derive(Clone, Debug, Default)]
pub struct WorldFeatureGate {
    enabled: HashSet<WorldId>,
}

impl WorldFeatureGate {
    /// Enables the feature for the given worlds.
    #[must_use]
    pub fn new(worlds: impl IntoIterator<Item = WorldId>) -> Self {
        Self {
            enabled: worlds.into_iter().collect(),
        }
    }

    /// Gate with the feature off everywhere.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }
}

impl FeatureGate for WorldFeatureGate {
    fn is_enabled_for_world(&self, world: WorldId) -> bool {
        self.enabled.contains(&world)
    }
}
