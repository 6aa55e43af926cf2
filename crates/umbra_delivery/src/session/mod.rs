//! # Session Delivery
//!
//! Per-session state machine that moves cells from "wanted" to "sent".
//!
//! ```text
//!  queue_cells()         advance_tick()            world ready
//! ─────────────► queued ───────────────► REQUESTED ───────────► REQUESTED
//!                  ▲       (budgeted)    GENERATION              SENDING
//!                  │                                               │
//!                  │ invalidated                 payload resolved  │
//!                  └──────────────────── SENT ◄────────────────────┘
//!                                            transmit()
//! ```
//!
//! A failed generation request sends the cell from REQUESTED GENERATION
//! back to the front of the queue.
//!
//! Every continuation captures the cell, the world it was issued for and a
//! weak handle to the session. When it runs it re-checks liveness, world
//! and exact status; if any no longer match it returns without effect.

mod queue;

pub use queue::LoadQueue;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use umbra_core::{CellCoord, CellKey, CellStatus, CompressionConfig, SessionId, WorldId};

use crate::cache::{CellCache, CellCacheRegistry};
use crate::collab::{CellListener, ListenerId, Transport, WorldProvider};
use crate::error::{DeliveryError, DeliveryResult};
use crate::future::Payload;

/// Continuation run after a cell's payload went out.
pub type SendCompletion = Box<dyn FnOnce() + Send>;

/// Something driven once per scheduling tick.
pub trait TickParticipant {
    /// Does this tick's work.
    fn advance_tick(&self) -> AdmissionReport;
}

/// Outcome of one [`TickParticipant::advance_tick`].
#[derive(Debug, Default)]
pub struct AdmissionReport {
    /// Cells that got a generation request this tick.
    pub admitted: usize,
    /// Errors from continuations the world ran synchronously.
    pub errors: Vec<DeliveryError>,
}

/// Per-session limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum cells in generation at once, and per tick.
    pub chunks_per_tick: usize,
    /// Cells sent before the client is told terrain is ready; the notice
    /// goes out with the next one.
    pub spawn_threshold: usize,
    /// Compression the session's transport expects.
    pub compression: CompressionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunks_per_tick: 4,
            spawn_threshold: 56,
            compression: CompressionConfig::lz4(),
        }
    }
}

struct SessionState {
    world: Arc<dyn WorldProvider>,
    cache: Arc<CellCache>,
    load_queue: LoadQueue,
    active_generation: HashSet<CellCoord>,
    status: HashMap<CellKey, CellStatus>,
    sent_count: usize,
    terrain_ready: bool,
}

impl SessionState {
    fn status(&self, cell: CellCoord) -> Option<CellStatus> {
        self.status.get(&cell.to_key()).copied()
    }

    fn tracked_cells(&self) -> Vec<CellCoord> {
        self.status.keys().copied().map(CellCoord::from_key).collect()
    }

    fn reset(&mut self) {
        self.load_queue.clear();
        self.active_generation.clear();
        self.status.clear();
        self.sent_count = 0;
        self.terrain_ready = false;
    }
}

struct SessionShared {
    id: SessionId,
    me: Weak<SessionShared>,
    connected: AtomicBool,
    transport: Arc<dyn Transport>,
    registry: Arc<CellCacheRegistry>,
    config: SessionConfig,
    state: Mutex<SessionState>,
}

/// Delivery controller for one connected session.
///
/// Created on connect; dropping it disconnects, after which every pending
/// continuation for this session is a no-op.
pub struct SessionDeliveryController {
    shared: Arc<SessionShared>,
}

impl SessionDeliveryController {
    /// Creates the controller for a newly connected session in `world`.
    #[must_use]
    pub fn new(
        id: SessionId,
        world: Arc<dyn WorldProvider>,
        transport: Arc<dyn Transport>,
        registry: Arc<CellCacheRegistry>,
        config: SessionConfig,
    ) -> Self {
        let cache = registry.cache_for(&world, config.compression);
        tracing::info!("{} connected to {}", id, world.id());

        let shared = Arc::new_cyclic(|me| SessionShared {
            id,
            me: me.clone(),
            connected: AtomicBool::new(true),
            transport,
            registry,
            config,
            state: Mutex::new(SessionState {
                world,
                cache,
                load_queue: LoadQueue::new(),
                active_generation: HashSet::new(),
                status: HashMap::new(),
                sent_count: 0,
                terrain_ready: false,
            }),
        });
        Self { shared }
    }

    /// Adds cells to the load queue, ordered by ascending priority. Cells
    /// already tracked or queued are skipped. Returns how many were added.
    pub fn queue_cells(&self, cells: impl IntoIterator<Item = (CellCoord, u32)>) -> usize {
        let mut state = self.shared.state.lock();
        let mut added = 0;
        for (cell, priority) in cells {
            if state.status(cell).is_none() && state.load_queue.insert_sorted(cell, priority) {
                added += 1;
            }
        }
        added
    }

    /// Stops tracking a cell the client no longer needs. Its generation slot
    /// is released at once; late completions for it become no-ops.
    pub fn drop_cell(&self, cell: CellCoord) -> bool {
        self.shared.drop_cell(cell)
    }

    /// Forgets a cell whose content changed and queues it again at the front.
    pub fn on_cell_invalidated(&self, cell: CellCoord) {
        self.shared.on_cell_invalidated(cell);
    }

    /// Fetches the cell's payload and transmits it, then runs `on_completion`.
    /// Only acts while the cell is `RequestedSending`.
    ///
    /// # Errors
    ///
    /// Errors requesting the payload, and transmission errors when the
    /// payload was already available.
    pub fn prepare_and_send(&self, cell: CellCoord, on_completion: SendCompletion) -> DeliveryResult<()> {
        self.shared.prepare_and_send(cell, on_completion)
    }

    /// Moves the session to another world. Everything tracked for the old
    /// world is forgotten.
    pub fn change_world(&self, world: Arc<dyn WorldProvider>) {
        self.shared.change_world(world);
    }

    /// Tears the session down. Idempotent.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Session identity.
    #[must_use]
    #[inline]
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// Current world.
    #[must_use]
    pub fn world_id(&self) -> WorldId {
        self.shared.state.lock().world.id()
    }

    /// The cache payloads are currently drawn from.
    #[must_use]
    pub fn cache(&self) -> Arc<CellCache> {
        Arc::clone(&self.shared.state.lock().cache)
    }

    /// Delivery status of `cell`.
    #[must_use]
    pub fn status(&self, cell: CellCoord) -> CellStatus {
        self.shared.state.lock().status(cell).unwrap_or_default()
    }

    /// Cells waiting in the load queue.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.shared.state.lock().load_queue.len()
    }

    /// Cells currently in generation.
    #[must_use]
    pub fn active_generation_count(&self) -> usize {
        self.shared.state.lock().active_generation.len()
    }

    /// Cells sent since connecting or changing world.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.shared.state.lock().sent_count
    }

    /// Returns true once the terrain-ready notification went out.
    #[must_use]
    pub fn is_terrain_ready(&self) -> bool {
        self.shared.state.lock().terrain_ready
    }

    /// Returns true while the session and its connection are alive.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }
}

impl TickParticipant for SessionDeliveryController {
    fn advance_tick(&self) -> AdmissionReport {
        self.shared.advance_tick()
    }
}

impl Drop for SessionDeliveryController {
    fn drop(&mut self) {
        self.shared.disconnect();
    }
}

impl SessionShared {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.transport.is_connected(self.id)
    }

    fn listener(&self) -> Weak<dyn CellListener> {
        self.me.clone()
    }

    fn advance_tick(&self) -> AdmissionReport {
        let mut report = AdmissionReport::default();
        if !self.is_connected() {
            return report;
        }

        let (world, batch) = {
            let mut state = self.state.lock();
            let limit = self
                .config
                .chunks_per_tick
                .saturating_sub(state.active_generation.len());
            let mut batch = Vec::with_capacity(limit);
            while batch.len() < limit {
                let Some((cell, _)) = state.load_queue.pop_front() else {
                    break;
                };
                if !state.active_generation.insert(cell) {
                    continue;
                }
                state.status.insert(cell.to_key(), CellStatus::RequestedGeneration);
                batch.push(cell);
            }
            (Arc::clone(&state.world), batch)
        };

        let world_id = world.id();
        for cell in batch {
            world.register_cell_listener(cell, ListenerId::Session(self.id), self.listener());

            let on_ready = self.me.clone();
            let on_failure = self.me.clone();
            let result = world.ensure_cell_ready(
                cell,
                Box::new(move || match on_ready.upgrade() {
                    Some(session) => session.on_generation_complete(cell, world_id),
                    None => Ok(()),
                }),
                Box::new(move || {
                    if let Some(session) = on_failure.upgrade() {
                        session.on_generation_failed(cell, world_id);
                    }
                }),
            );

            report.admitted += 1;
            if let Err(e) = result {
                self.on_generation_failed(cell, world_id);
                report.errors.push(e);
            }
        }
        report
    }

    fn on_generation_complete(&self, cell: CellCoord, world_id: WorldId) -> DeliveryResult<()> {
        if !self.is_connected() {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            if state.world.id() != world_id {
                return Ok(());
            }
            // Dropped and re-requested before this completion ran: only the
            // first completion for the current request counts.
            if state.status(cell) != Some(CellStatus::RequestedGeneration) {
                return Ok(());
            }
            state.active_generation.remove(&cell);
            state.status.insert(cell.to_key(), CellStatus::RequestedSending);
        }

        let session = self.me.clone();
        let sent = Box::new(move || {
            if let Some(session) = session.upgrade() {
                session.on_cell_sent(cell);
            }
        });

        match self.prepare_and_send(cell, sent) {
            Err(DeliveryError::CellNotLoaded(_)) => {
                tracing::debug!("{} unloaded before sending, queueing again", cell);
                self.on_cell_invalidated(cell);
                Ok(())
            }
            other => other,
        }
    }

    /// The world gave up on `cell`. The request is forgotten and the cell
    /// goes back to the front of the queue, so a later tick asks again.
    fn on_generation_failed(&self, cell: CellCoord, world_id: WorldId) {
        if !self.is_connected() {
            return;
        }
        let mut state = self.state.lock();
        if state.world.id() != world_id || state.status(cell) != Some(CellStatus::RequestedGeneration) {
            return;
        }
        tracing::debug!("Generation of {} failed for {}, queueing again", cell, self.id);
        state.status.remove(&cell.to_key());
        state.active_generation.remove(&cell);
        state.load_queue.push_front(cell);
    }

    /// A restart of the cell's preparation could not be issued. The waiting
    /// send will never run, so the cell is queued again.
    fn on_preparation_abandoned(&self, cell: CellCoord, world_id: WorldId, error: &DeliveryError) {
        if !self.is_connected() {
            return;
        }
        let mut state = self.state.lock();
        if state.world.id() != world_id || state.status(cell) != Some(CellStatus::RequestedSending) {
            return;
        }
        tracing::debug!("Preparation of {} abandoned ({}), queueing again", cell, error);
        state.status.remove(&cell.to_key());
        state.load_queue.push_front(cell);
    }

    fn prepare_and_send(&self, cell: CellCoord, on_completion: SendCompletion) -> DeliveryResult<()> {
        let (cache, world_id) = {
            let state = self.state.lock();
            (Arc::clone(&state.cache), state.world.id())
        };

        let future = cache.request_compressed(cell)?;
        let session = self.me.clone();
        future.on_abandon(Box::new(move |error| {
            if let Some(session) = session.upgrade() {
                session.on_preparation_abandoned(cell, world_id, error);
            }
        }));

        let session = self.me.clone();
        future.on_resolve(Box::new(move |payload| match session.upgrade() {
            Some(session) => session.deliver(cell, world_id, payload, on_completion),
            None => Ok(()),
        }))
    }

    fn deliver(
        &self,
        cell: CellCoord,
        world_id: WorldId,
        payload: &Payload,
        on_completion: SendCompletion,
    ) -> DeliveryResult<()> {
        if !self.is_connected() {
            return Ok(());
        }
        {
            let state = self.state.lock();
            let status = state.status(cell);
            if state.world.id() != world_id || status.is_none() {
                tracing::debug!("Tried to send no-longer-active cell {} in {}", cell, world_id);
                return Ok(());
            }
            // Reverted to be resent from scratch.
            if status != Some(CellStatus::RequestedSending) {
                return Ok(());
            }
        }

        self.transport.transmit(self.id, cell, payload)?;
        on_completion();
        Ok(())
    }

    fn on_cell_sent(&self, cell: CellCoord) {
        let terrain_ready = {
            let mut state = self.state.lock();
            state.status.insert(cell.to_key(), CellStatus::Sent);
            state.sent_count += 1;
            let reached = !state.terrain_ready && state.sent_count > self.config.spawn_threshold;
            if reached {
                state.terrain_ready = true;
            }
            reached
        };

        self.transport.notify_cell_sent(self.id, cell);
        if terrain_ready {
            tracing::debug!("{} has enough terrain to spawn", self.id);
            self.transport.notify_terrain_ready(self.id);
        }
    }

    fn drop_cell(&self, cell: CellCoord) -> bool {
        let (world, tracked) = {
            let mut state = self.state.lock();
            let tracked = state.status.remove(&cell.to_key()).is_some();
            state.active_generation.remove(&cell);
            let queued = state.load_queue.remove(cell);
            (Arc::clone(&state.world), tracked || queued)
        };
        if tracked {
            world.unregister_cell_listener(cell, ListenerId::Session(self.id));
        }
        tracked
    }

    fn on_cell_invalidated(&self, cell: CellCoord) {
        let mut state = self.state.lock();
        if state.status.remove(&cell.to_key()).is_none() {
            return;
        }
        state.active_generation.remove(&cell);
        state.load_queue.push_front(cell);
    }

    fn change_world(&self, world: Arc<dyn WorldProvider>) {
        let cache = self.registry.cache_for(&world, self.config.compression);
        let (old_world, cells) = {
            let mut state = self.state.lock();
            let cells = state.tracked_cells();
            state.reset();
            let old_world = std::mem::replace(&mut state.world, Arc::clone(&world));
            state.cache = cache;
            (old_world, cells)
        };

        for cell in cells {
            old_world.unregister_cell_listener(cell, ListenerId::Session(self.id));
        }
        tracing::info!("{} moved from {} to {}", self.id, old_world.id(), world.id());
    }

    fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let (world, cells) = {
            let mut state = self.state.lock();
            let cells = state.tracked_cells();
            state.reset();
            (Arc::clone(&state.world), cells)
        };

        for cell in cells {
            world.unregister_cell_listener(cell, ListenerId::Session(self.id));
        }
        tracing::info!("{} disconnected", self.id);
    }
}

impl CellListener for SessionShared {
    fn on_cell_changed(&self, cell: CellCoord) -> Vec<DeliveryError> {
        self.on_cell_invalidated(cell);
        Vec::new()
    }

    fn on_cell_unloaded(&self, cell: CellCoord) {
        tracing::debug!("Detected forced unload of cell {}", cell);
        self.drop_cell(cell);
    }
}
