//! # Mock Collaborators
//!
//! In-memory world, transport and transform for tests, benchmarks and the
//! simulation binary.
//!
//! All mocks release their internal lock before calling back into the
//! pipeline, so a callback may re-enter the mock freely.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use umbra_core::{Block, CellCoord, CellSnapshot, SessionId, WorldId};

use super::{
    CellFailureCallback, CellListener, CellReadyCallback, CellTransform, ListenerId, Transport,
    WorldProvider,
};
use crate::error::{DeliveryError, DeliveryResult, TaskFailure};
use crate::future::Payload;

/// Height of generated mock cells. Small so tests stay fast.
pub const MOCK_CELL_HEIGHT: u16 = 16;

// ============================================================================
// WORLD
// ============================================================================

type PendingReady = (CellReadyCallback, CellFailureCallback);

#[derive(Default)]
struct WorldState {
    cells: HashMap<CellCoord, CellSnapshot>,
    pending: HashMap<CellCoord, Vec<PendingReady>>,
    ready_requests: HashMap<CellCoord, usize>,
    refuse_next: usize,
    listeners: HashMap<CellCoord, Vec<(ListenerId, Weak<dyn CellListener>)>>,
}

/// Mock world with controllable generation.
///
/// In manual mode every [`WorldProvider::ensure_cell_ready`] on a cell that
/// is not loaded parks its continuations until the test calls
/// [`MockWorld::complete_generation`] or [`MockWorld::fail_generation`].
pub struct MockWorld {
    id: WorldId,
    auto_ready: bool,
    state: Mutex<WorldState>,
}

impl MockWorld {
    /// Creates a world that generates cells only when told to.
    #[must_use]
    pub fn new(id: WorldId) -> Self {
        Self {
            id,
            auto_ready: false,
            state: Mutex::new(WorldState::default()),
        }
    }

    /// Creates a world that generates missing cells on request.
    #[must_use]
    pub fn with_auto_ready(id: WorldId) -> Self {
        Self {
            auto_ready: true,
            ..Self::new(id)
        }
    }

    /// Content the mock generates for a cell: stone with one diamond ore.
    #[must_use]
    pub fn generate(cell: CellCoord) -> CellSnapshot {
        let mut snapshot = CellSnapshot::filled(cell, MOCK_CELL_HEIGHT, Block::STONE);
        snapshot.set_block(0, 0, 0, Block::BEDROCK);
        snapshot.set_block(3, 4, 5, Block::DIAMOND_ORE);
        snapshot
    }

    /// Loads generated content without going through generation.
    pub fn load_cell(&self, cell: CellCoord) {
        self.set_cell(Self::generate(cell));
    }

    /// Loads the given content.
    pub fn set_cell(&self, snapshot: CellSnapshot) {
        self.state.lock().cells.insert(snapshot.coord(), snapshot);
    }

    /// Finishes generation of `cell` and runs every parked `on_ready`.
    pub fn complete_generation(&self, cell: CellCoord) -> Vec<DeliveryError> {
        let waiting = {
            let mut state = self.state.lock();
            state.cells.entry(cell).or_insert_with(|| Self::generate(cell));
            state.pending.remove(&cell).unwrap_or_default()
        };

        waiting
            .into_iter()
            .filter_map(|(on_ready, _)| on_ready().err())
            .collect()
    }

    /// Gives up on `cell` and runs every parked `on_failure`.
    pub fn fail_generation(&self, cell: CellCoord) {
        let waiting = self.state.lock().pending.remove(&cell).unwrap_or_default();
        for (_, on_failure) in waiting {
            on_failure();
        }
    }

    /// Makes the next `count` calls to `ensure_cell_ready` return
    /// [`DeliveryError::GenerationRefused`] without parking anything.
    pub fn refuse_requests(&self, count: usize) {
        self.state.lock().refuse_next = count;
    }

    /// Completes every parked generation, in cell order.
    pub fn complete_all(&self) -> Vec<DeliveryError> {
        let mut cells: Vec<CellCoord> = self.state.lock().pending.keys().copied().collect();
        cells.sort_unstable();
        cells
            .into_iter()
            .flat_map(|cell| self.complete_generation(cell))
            .collect()
    }

    /// Cells with parked continuations.
    #[must_use]
    pub fn pending_generations(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// How often `ensure_cell_ready` was called for `cell`.
    #[must_use]
    pub fn ready_requests(&self, cell: CellCoord) -> usize {
        self.state.lock().ready_requests.get(&cell).copied().unwrap_or(0)
    }

    /// How often `ensure_cell_ready` was called in total.
    #[must_use]
    pub fn total_ready_requests(&self) -> usize {
        self.state.lock().ready_requests.values().sum()
    }

    /// Live listeners registered for `cell`.
    #[must_use]
    pub fn listener_count(&self, cell: CellCoord) -> usize {
        self.state
            .lock()
            .listeners
            .get(&cell)
            .map_or(0, |list| list.iter().filter(|(_, l)| l.strong_count() > 0).count())
    }

    /// Edits a loaded cell and tells its listeners.
    pub fn modify_cell(&self, cell: CellCoord, edit: impl FnOnce(&mut CellSnapshot)) -> Vec<DeliveryError> {
        let listeners = {
            let mut state = self.state.lock();
            let Some(snapshot) = state.cells.get_mut(&cell) else {
                return Vec::new();
            };
            edit(snapshot);
            Self::live_listeners(&mut state, cell)
        };

        listeners
            .into_iter()
            .flat_map(|listener| listener.on_cell_changed(cell))
            .collect()
    }

    /// Drops a cell's content and tells its listeners.
    pub fn unload_cell(&self, cell: CellCoord) {
        let listeners = {
            let mut state = self.state.lock();
            state.cells.remove(&cell);
            Self::live_listeners(&mut state, cell)
        };
        for listener in listeners {
            listener.on_cell_unloaded(cell);
        }
    }

    fn live_listeners(state: &mut WorldState, cell: CellCoord) -> Vec<Arc<dyn CellListener>> {
        let Some(list) = state.listeners.get_mut(&cell) else {
            return Vec::new();
        };
        list.retain(|(_, l)| l.strong_count() > 0);
        list.iter().filter_map(|(_, l)| l.upgrade()).collect()
    }
}

impl WorldProvider for MockWorld {
    fn id(&self) -> WorldId {
        self.id
    }

    fn is_cell_loaded(&self, cell: CellCoord) -> bool {
        self.state.lock().cells.contains_key(&cell)
    }

    fn cell_snapshot(&self, cell: CellCoord) -> Option<CellSnapshot> {
        self.state.lock().cells.get(&cell).cloned()
    }

    fn ensure_cell_ready(
        &self,
        cell: CellCoord,
        on_ready: CellReadyCallback,
        on_failure: CellFailureCallback,
    ) -> DeliveryResult<()> {
        let ready_now = {
            let mut state = self.state.lock();
            *state.ready_requests.entry(cell).or_insert(0) += 1;
            if state.refuse_next > 0 {
                state.refuse_next -= 1;
                return Err(DeliveryError::GenerationRefused(cell));
            }
            if self.auto_ready {
                state.cells.entry(cell).or_insert_with(|| Self::generate(cell));
            }
            if state.cells.contains_key(&cell) {
                Some(on_ready)
            } else {
                state.pending.entry(cell).or_default().push((on_ready, on_failure));
                None
            }
        };

        match ready_now {
            Some(on_ready) => on_ready(),
            None => Ok(()),
        }
    }

    fn register_cell_listener(&self, cell: CellCoord, id: ListenerId, listener: Weak<dyn CellListener>) {
        let mut state = self.state.lock();
        let list = state.listeners.entry(cell).or_default();
        list.retain(|(existing, _)| *existing != id);
        list.push((id, listener));
    }

    fn unregister_cell_listener(&self, cell: CellCoord, id: ListenerId) {
        let mut state = self.state.lock();
        if let Some(list) = state.listeners.get_mut(&cell) {
            list.retain(|(existing, _)| *existing != id);
            if list.is_empty() {
                state.listeners.remove(&cell);
            }
        }
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// One recorded transmission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transmission {
    /// Receiving session.
    pub session: SessionId,
    /// Cell sent.
    pub cell: CellCoord,
    /// Payload size in bytes.
    pub bytes: usize,
}

#[derive(Default)]
struct TransportState {
    disconnected: HashSet<SessionId>,
    fail_next: HashSet<(SessionId, CellCoord)>,
    transmissions: Vec<Transmission>,
    sent_notices: Vec<(SessionId, CellCoord)>,
    terrain_ready: Vec<SessionId>,
}

/// Transport that records everything it is asked to send.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<TransportState>,
}

impl MockTransport {
    /// Creates a transport where every session is connected.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a session's connection closed.
    pub fn disconnect(&self, session: SessionId) {
        self.state.lock().disconnected.insert(session);
    }

    /// Makes the next transmission of `cell` to `session` fail.
    pub fn fail_next(&self, session: SessionId, cell: CellCoord) {
        self.state.lock().fail_next.insert((session, cell));
    }

    /// Every successful transmission, in order.
    #[must_use]
    pub fn transmissions(&self) -> Vec<Transmission> {
        self.state.lock().transmissions.clone()
    }

    /// Successful transmissions of `cell` to `session`.
    #[must_use]
    pub fn transmit_count(&self, session: SessionId, cell: CellCoord) -> usize {
        self.state
            .lock()
            .transmissions
            .iter()
            .filter(|t| t.session == session && t.cell == cell)
            .count()
    }

    /// Successful transmissions to `session`.
    #[must_use]
    pub fn session_transmissions(&self, session: SessionId) -> usize {
        self.state
            .lock()
            .transmissions
            .iter()
            .filter(|t| t.session == session)
            .count()
    }

    /// `notify_cell_sent` calls received for `session`.
    #[must_use]
    pub fn sent_notices(&self, session: SessionId) -> usize {
        self.state
            .lock()
            .sent_notices
            .iter()
            .filter(|(s, _)| *s == session)
            .count()
    }

    /// `notify_terrain_ready` calls received for `session`.
    #[must_use]
    pub fn terrain_ready_count(&self, session: SessionId) -> usize {
        self.state
            .lock()
            .terrain_ready
            .iter()
            .filter(|s| **s == session)
            .count()
    }
}

impl Transport for MockTransport {
    fn is_connected(&self, session: SessionId) -> bool {
        !self.state.lock().disconnected.contains(&session)
    }

    fn transmit(&self, session: SessionId, cell: CellCoord, payload: &Payload) -> DeliveryResult<()> {
        let mut state = self.state.lock();
        let reason = if state.disconnected.contains(&session) {
            Some("connection closed")
        } else if state.fail_next.remove(&(session, cell)) {
            Some("send buffer full")
        } else {
            None
        };

        if let Some(reason) = reason {
            return Err(DeliveryError::Transmission {
                session,
                cell,
                reason: reason.to_owned(),
            });
        }

        state.transmissions.push(Transmission {
            session,
            cell,
            bytes: payload.len(),
        });
        Ok(())
    }

    fn notify_cell_sent(&self, session: SessionId, cell: CellCoord) {
        self.state.lock().sent_notices.push((session, cell));
    }

    fn notify_terrain_ready(&self, session: SessionId) {
        self.state.lock().terrain_ready.push(session);
    }
}

// ============================================================================
// TRANSFORM
// ============================================================================

/// Ore-hiding transform that can be told to fail.
#[derive(Debug, Default)]
pub struct MockTransform {
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl MockTransform {
    /// Transform that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transform whose first `failures` calls fail.
    #[must_use]
    pub fn failing(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of times `apply` ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CellTransform for MockTransform {
    fn apply(&self, snapshot: &mut CellSnapshot) -> Result<(), TaskFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TaskFailure(format!("transform rejected cell {}", snapshot.coord())));
        }

        for block in snapshot.blocks_mut() {
            if *block == Block::DIAMOND_ORE {
                *block = Block::STONE;
            }
        }
        Ok(())
    }
}
