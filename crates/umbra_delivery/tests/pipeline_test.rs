//! Integration tests for the cell delivery pipeline.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use umbra_core::{Block, CellCoord, CellStatus, CompressionConfig, SessionId, WorldId};
use umbra_delivery::mock::{MockTransform, MockTransport, MockWorld};
use umbra_delivery::{
    CellCache, CellCacheRegistry, CellTransform, DeliveryError, SessionConfig, SessionDeliveryController,
    TickParticipant, WorkerPool, WorldFeatureGate, WorldProvider,
};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    pool: Arc<WorkerPool>,
    registry: Arc<CellCacheRegistry>,
    transport: Arc<MockTransport>,
}

impl Harness {
    fn new(transform: Option<Arc<dyn CellTransform>>, obfuscated: &[u32]) -> Self {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let gate = WorldFeatureGate::new(obfuscated.iter().copied().map(WorldId));
        let registry = Arc::new(CellCacheRegistry::new(Arc::clone(&pool), transform, Box::new(gate)));
        Self {
            pool,
            registry,
            transport: Arc::new(MockTransport::new()),
        }
    }

    fn plain() -> Self {
        Self::new(None, &[])
    }

    fn cache(&self, world: &Arc<MockWorld>) -> Arc<CellCache> {
        let world: Arc<dyn WorldProvider> = world.clone();
        self.registry.cache_for(&world, CompressionConfig::lz4())
    }

    fn session(&self, id: u32, world: &Arc<MockWorld>, chunks_per_tick: usize) -> SessionDeliveryController {
        SessionDeliveryController::new(
            SessionId(id),
            world.clone(),
            self.transport.clone(),
            Arc::clone(&self.registry),
            SessionConfig {
                chunks_per_tick,
                ..SessionConfig::default()
            },
        )
    }
}

#[test]
fn test_concurrent_requests_share_one_preparation() {
    let h = Harness::plain();
    let world = Arc::new(MockWorld::new(WorldId(1)));
    let cell = CellCoord::new(4, -4);
    world.load_cell(cell);

    let a = h.session(1, &world, 4);
    let b = h.session(2, &world, 4);
    assert!(Arc::ptr_eq(&a.cache(), &b.cache()));

    let first = a.cache().request_compressed(cell).unwrap();
    let second = b.cache().request_compressed(cell).unwrap();
    assert!(first.ptr_eq(&second));
    assert_eq!(h.pool.stats().submitted, 1);
}

#[test]
fn test_two_sessions_one_preparation_two_deliveries() {
    let h = Harness::plain();
    let world = Arc::new(MockWorld::new(WorldId(1)));
    let cell = CellCoord::new(0, 0);

    let a = h.session(1, &world, 4);
    let b = h.session(2, &world, 4);
    a.queue_cells([(cell, 0)]);
    b.queue_cells([(cell, 0)]);
    a.advance_tick();
    b.advance_tick();

    assert!(world.complete_generation(cell).is_empty());
    assert!(h.pool.flush(WAIT).errors.is_empty());

    assert_eq!(h.pool.stats().submitted, 1);
    assert_eq!((a.cache().misses(), a.cache().hits()), (1, 1));
    for session in [&a, &b] {
        assert_eq!(session.status(cell), CellStatus::Sent);
        assert_eq!(h.transport.transmit_count(session.id(), cell), 1);
    }
}

#[test]
fn test_admission_respects_budget() {
    let h = Harness::plain();
    let world = Arc::new(MockWorld::new(WorldId(1)));
    let session = h.session(1, &world, 3);

    let queued = session.queue_cells((0..10).map(|x| (CellCoord::new(x, 0), x.unsigned_abs())));
    assert_eq!(queued, 10);

    let report = session.advance_tick();
    assert_eq!(report.admitted, 3);
    assert_eq!(world.total_ready_requests(), 3);
    assert_eq!(session.queued_len(), 7);
    for x in 0..3 {
        assert_eq!(session.status(CellCoord::new(x, 0)), CellStatus::RequestedGeneration);
    }

    // Slots stay taken until generation finishes.
    assert_eq!(session.advance_tick().admitted, 0);
    world.complete_generation(CellCoord::new(0, 0));
    assert_eq!(session.advance_tick().admitted, 1);
    assert_eq!(world.ready_requests(CellCoord::new(3, 0)), 1);
}

#[test]
fn test_tracked_cells_are_not_queued_twice() {
    let h = Harness::plain();
    let world = Arc::new(MockWorld::new(WorldId(1)));
    let session = h.session(1, &world, 4);
    let cell = CellCoord::new(1, 1);

    assert_eq!(session.queue_cells([(cell, 0), (cell, 1)]), 1);
    session.advance_tick();
    assert_eq!(session.queue_cells([(cell, 0)]), 0);
    assert_eq!(session.advance_tick().admitted, 0);
    assert_eq!(world.ready_requests(cell), 1);
}

#[test]
fn test_restart_moves_callbacks_in_order() {
    let h = Harness::plain();
    let world = Arc::new(MockWorld::new(WorldId(1)));
    let cell = CellCoord::new(7, 7);
    world.load_cell(cell);
    let cache = h.cache(&world);

    let log = Arc::new(Mutex::new(Vec::new()));
    let original = cache.request_compressed(cell).unwrap();
    for name in ["A", "B"] {
        let log = Arc::clone(&log);
        original
            .on_resolve(Box::new(move |_| {
                log.lock().push(name);
                Ok(())
            }))
            .unwrap();
    }

    cache.restart_pending_request(cell).unwrap();
    h.pool.flush(WAIT);

    assert_eq!(*log.lock(), vec!["A", "B"]);
    assert!(original.is_cancelled());
    assert!(!original.has_result());
    assert!(cache.get(cell).unwrap().has_result());
}

#[test]
fn test_restart_precondition() {
    let h = Harness::plain();
    let world = Arc::new(MockWorld::new(WorldId(1)));
    let cell = CellCoord::new(0, 3);
    world.load_cell(cell);
    let cache = h.cache(&world);

    assert_eq!(
        cache.restart_pending_request(cell).unwrap_err(),
        DeliveryError::RestartInvariant(cell)
    );

    let future = cache.request_compressed(cell).unwrap();
    h.pool.flush(WAIT);
    assert_eq!(
        cache.restart_pending_request(cell).unwrap_err(),
        DeliveryError::RestartInvariant(cell)
    );
    assert_eq!(cache.len(), 1);
    assert!(cache.get(cell).unwrap().ptr_eq(&future));
}

#[test]
fn test_end_to_end_with_one_failed_preparation() {
    let transform = Arc::new(MockTransform::failing(1));
    let h = Harness::new(Some(transform.clone()), &[1]);
    let world = Arc::new(MockWorld::new(WorldId(1)));
    let session = h.session(1, &world, 2);
    let first = CellCoord::new(0, 0);
    let second = CellCoord::new(0, 1);

    session.queue_cells([(first, 0), (second, 1)]);
    assert_eq!(session.advance_tick().admitted, 2);
    assert_eq!(session.status(first), CellStatus::RequestedGeneration);
    assert_eq!(session.status(second), CellStatus::RequestedGeneration);

    assert!(world.complete_generation(first).is_empty());
    assert_eq!(session.status(first), CellStatus::RequestedSending);
    assert_eq!(session.cache().misses(), 1);

    let drained = h.pool.flush(WAIT);
    assert!(drained.errors.is_empty());

    let stats = h.pool.stats();
    assert_eq!((stats.submitted, stats.failed, stats.completed), (2, 1, 1));
    assert_eq!(transform.calls(), 2);
    assert_eq!(h.transport.transmit_count(SessionId(1), first), 1);
    assert_eq!(session.status(first), CellStatus::Sent);
    assert_eq!(session.status(second), CellStatus::RequestedGeneration);
}

#[test]
fn test_changed_cell_is_sent_again() {
    let h = Harness::plain();
    let world = Arc::new(MockWorld::new(WorldId(1)));
    let session = h.session(1, &world, 4);
    let cell = CellCoord::new(2, 2);
    world.load_cell(cell);

    session.queue_cells([(cell, 0)]);
    session.advance_tick();
    h.pool.flush(WAIT);
    assert_eq!(session.status(cell), CellStatus::Sent);

    assert!(world.modify_cell(cell, |s| s.set_block(1, 1, 1, Block::AIR)).is_empty());
    assert_eq!(session.status(cell), CellStatus::NotTracked);
    assert_eq!(session.queued_len(), 1);
    assert!(session.cache().get(cell).is_none());

    session.advance_tick();
    h.pool.flush(WAIT);
    assert_eq!(session.status(cell), CellStatus::Sent);
    assert_eq!(h.transport.transmit_count(SessionId(1), cell), 2);
    assert_eq!(session.cache().misses(), 2);
}

#[test]
fn test_change_during_preparation_delivers_once() {
    let h = Harness::plain();
    let world = Arc::new(MockWorld::new(WorldId(1)));
    let cell = CellCoord::new(-1, 5);
    world.load_cell(cell);

    let a = h.session(1, &world, 4);
    let b = h.session(2, &world, 4);
    for session in [&a, &b] {
        session.queue_cells([(cell, 0)]);
        session.advance_tick();
        assert_eq!(session.status(cell), CellStatus::RequestedSending);
    }
    let pending = a.cache().get(cell).unwrap();

    assert!(world.modify_cell(cell, |s| s.set_block(0, 2, 0, Block::AIR)).is_empty());
    assert!(pending.is_cancelled());

    h.pool.flush(WAIT);
    assert!(h.transport.transmissions().is_empty());

    for session in [&a, &b] {
        session.advance_tick();
    }
    h.pool.flush(WAIT);

    for session in [&a, &b] {
        assert_eq!(session.status(cell), CellStatus::Sent);
        assert_eq!(h.transport.transmit_count(session.id(), cell), 1);
    }
    assert_eq!(h.pool.stats().submitted, 2);
}

#[test]
fn test_change_world_resets_tracking() {
    let h = Harness::plain();
    let overworld = Arc::new(MockWorld::new(WorldId(1)));
    let nether = Arc::new(MockWorld::with_auto_ready(WorldId(2)));
    let session = h.session(1, &overworld, 4);
    let cell = CellCoord::new(0, 0);

    session.queue_cells([(cell, 0)]);
    session.advance_tick();
    session.change_world(nether.clone());

    assert_eq!(session.world_id(), WorldId(2));
    assert_eq!(session.status(cell), CellStatus::NotTracked);
    assert_eq!(session.active_generation_count(), 0);
    assert_eq!(overworld.listener_count(cell), 0);

    // The old world's completion arrives late and changes nothing.
    overworld.complete_generation(cell);
    h.pool.flush(WAIT);
    assert!(h.transport.transmissions().is_empty());

    session.queue_cells([(cell, 0)]);
    session.advance_tick();
    h.pool.flush(WAIT);
    assert_eq!(session.status(cell), CellStatus::Sent);
    assert_eq!(session.cache().world_id(), WorldId(2));
}

#[test]
fn test_unloaded_cell_is_dropped() {
    let h = Harness::plain();
    let world = Arc::new(MockWorld::new(WorldId(1)));
    let session = h.session(1, &world, 4);
    let cell = CellCoord::new(3, 0);
    world.load_cell(cell);

    session.queue_cells([(cell, 0)]);
    session.advance_tick();
    world.unload_cell(cell);

    assert_eq!(session.status(cell), CellStatus::NotTracked);
    assert!(session.cache().get(cell).is_none());
    h.pool.flush(WAIT);
    assert!(h.transport.transmissions().is_empty());
}

#[test]
fn test_generation_failures_do_not_stall_session() {
    let h = Harness::plain();
    let world = Arc::new(MockWorld::new(WorldId(1)));
    let session = h.session(1, &world, 2);
    let cells: Vec<CellCoord> = (0..4).map(|x| CellCoord::new(x, 0)).collect();
    session.queue_cells(cells.iter().map(|&c| (c, c.x.unsigned_abs())));

    assert_eq!(session.advance_tick().admitted, 2);
    world.fail_generation(cells[0]);
    world.fail_generation(cells[1]);
    assert_eq!(session.active_generation_count(), 0);

    for _ in 0..2 {
        assert_eq!(session.advance_tick().admitted, 2);
        assert!(world.complete_all().is_empty());
        assert!(h.pool.flush(WAIT).errors.is_empty());
    }

    for &cell in &cells {
        assert_eq!(session.status(cell), CellStatus::Sent);
    }
    assert_eq!(world.ready_requests(cells[0]), 2);
    assert_eq!(world.ready_requests(cells[2]), 1);
}

#[test]
fn test_abandoned_restart_requeues_waiting_session() {
    let h = Harness::plain();
    let world = Arc::new(MockWorld::new(WorldId(1)));
    let session = h.session(1, &world, 4);
    let cell = CellCoord::new(5, 5);
    world.load_cell(cell);

    session.queue_cells([(cell, 0)]);
    session.advance_tick();
    assert_eq!(session.status(cell), CellStatus::RequestedSending);

    h.pool.shutdown();
    assert_eq!(
        session.cache().restart_pending_request(cell).unwrap_err(),
        DeliveryError::PoolClosed
    );

    assert_eq!(session.status(cell), CellStatus::NotTracked);
    assert_eq!(session.queued_len(), 1);
    assert!(h.transport.transmissions().is_empty());
}
