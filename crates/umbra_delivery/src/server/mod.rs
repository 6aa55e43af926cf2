//! # Delivery Server
//!
//! Owns the worker pool, the cache registry and every session, and drives
//! them from one control thread.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DELIVERY SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  tick():                                                    │
//! │   1. drop sessions whose connection closed                  │
//! │   2. drain worker completions ──► futures resolve ──► send  │
//! │   3. advance_tick() on every session (budgeted admission)   │
//! │                                                             │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐       │
//! │  │ Sessions     │──│ Cache        │──│ Worker Pool  │       │
//! │  │ (per client) │  │ Registry     │  │ (N threads)  │       │
//! │  └──────────────┘  └──────────────┘  └──────────────┘       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod tick;

pub use tick::{TickLoop, TickStats, MAX_CATCH_UP};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use umbra_core::SessionId;

use crate::cache::CellCacheRegistry;
use crate::collab::{CellTransform, Transport, WorldFeatureGate, WorldProvider};
use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, DeliveryResult};
use crate::session::{SessionDeliveryController, TickParticipant};
use crate::worker::{Drained, WorkerPool};

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Tick number, starting at 1.
    pub tick: u64,
    /// Worker continuations that ran.
    pub completions: usize,
    /// Cells that got a generation request.
    pub admitted: usize,
    /// Errors surfaced by continuations (transmission failures and the like).
    pub failures: Vec<DeliveryError>,
}

/// Totals over a [`DeliveryServer::run_for`] call.
#[derive(Debug)]
pub struct RunSummary {
    /// Ticks executed.
    pub ticks: u64,
    /// Cells admitted over all ticks.
    pub admitted: usize,
    /// Worker continuations that ran.
    pub completions: usize,
    /// Errors over all ticks.
    pub failures: Vec<DeliveryError>,
    /// Tick timing.
    pub stats: TickStats,
}

/// Control-thread owner of the whole pipeline.
pub struct DeliveryServer {
    config: DeliveryConfig,
    transport: Arc<dyn Transport>,
    pool: Arc<WorkerPool>,
    registry: Arc<CellCacheRegistry>,
    sessions: BTreeMap<SessionId, SessionDeliveryController>,
    tick: u64,
}

impl DeliveryServer {
    /// Starts the worker pool and an empty session table.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::InvalidConfig`] for a bad config,
    /// [`DeliveryError::WorkerSpawn`] if the pool cannot start.
    pub fn new(
        config: DeliveryConfig,
        transport: Arc<dyn Transport>,
        transform: Option<Arc<dyn CellTransform>>,
    ) -> DeliveryResult<Self> {
        config.validate()?;
        let pool = Arc::new(WorkerPool::new(config.worker_threads)?);
        let gate = WorldFeatureGate::new(config.obfuscated_world_ids());
        let registry = Arc::new(CellCacheRegistry::new(Arc::clone(&pool), transform, Box::new(gate)));

        tracing::info!(
            "Delivery server ready: {} workers, {} cells/tick, {}Hz",
            config.worker_threads,
            config.chunks_per_tick,
            config.tick_rate
        );

        Ok(Self {
            config,
            transport,
            pool,
            registry,
            sessions: BTreeMap::new(),
            tick: 0,
        })
    }

    /// Registers a session in `world`. An existing session with the same id
    /// is disconnected first.
    pub fn connect(&mut self, id: SessionId, world: Arc<dyn WorldProvider>) -> &SessionDeliveryController {
        let session = SessionDeliveryController::new(
            id,
            world,
            Arc::clone(&self.transport),
            Arc::clone(&self.registry),
            self.config.session_config(),
        );
        if let Some(previous) = self.sessions.insert(id, session) {
            tracing::warn!("{} reconnected, replacing previous session", id);
            previous.disconnect();
        }
        &self.sessions[&id]
    }

    /// Removes a session. Returns false if it was unknown.
    pub fn disconnect(&mut self, id: SessionId) -> bool {
        self.sessions.remove(&id).is_some()
    }

    /// Looks up a session.
    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<&SessionDeliveryController> {
        self.sessions.get(&id)
    }

    /// Connected sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Runs one control tick.
    pub fn tick(&mut self) -> TickReport {
        self.tick += 1;
        self.sessions.retain(|_, session| session.is_connected());

        let drained = self.pool.drain_completions();
        let mut report = TickReport {
            tick: self.tick,
            completions: drained.processed,
            admitted: 0,
            failures: drained.errors,
        };

        for session in self.sessions.values() {
            let admission = session.advance_tick();
            report.admitted += admission.admitted;
            report.failures.extend(admission.errors);
        }

        for failure in &report.failures {
            tracing::warn!("Tick {}: {}", self.tick, failure);
        }
        report
    }

    /// Ticks at the configured rate for `duration`.
    pub fn run_for(&mut self, duration: Duration) -> RunSummary {
        let mut tick_loop = TickLoop::new(self.config.tick_rate);
        let deadline = Instant::now() + duration;
        let mut summary = RunSummary {
            ticks: 0,
            admitted: 0,
            completions: 0,
            failures: Vec::new(),
            stats: *tick_loop.stats(),
        };

        while Instant::now() < deadline {
            for _ in 0..tick_loop.wait() {
                let report = tick_loop.run_tick(|| self.tick());
                summary.ticks += 1;
                summary.admitted += report.admitted;
                summary.completions += report.completions;
                summary.failures.extend(report.failures);
            }
        }

        summary.stats = *tick_loop.stats();
        summary
    }

    /// Blocks until every outstanding preparation finished, running their
    /// continuations.
    pub fn flush(&self, timeout: Duration) -> Drained {
        self.pool.flush(timeout)
    }

    /// Ticks executed so far.
    #[must_use]
    pub const fn tick_count(&self) -> u64 {
        self.tick
    }

    /// The worker pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// The cache registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<CellCacheRegistry> {
        &self.registry
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Disconnects every session and stops the workers.
    pub fn shutdown(&mut self) {
        let sessions = self.sessions.len();
        self.sessions.clear();
        self.pool.shutdown();
        tracing::info!("Delivery server stopped after {} ticks ({} sessions dropped)", self.tick, sessions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::mock::{MockTransport, MockWorld};
    use umbra_core::{CellCoord, CellStatus, WorldId};

    fn server(transport: &Arc<MockTransport>) -> DeliveryServer {
        DeliveryServer::new(DeliveryConfig::default(), transport.clone(), None).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DeliveryConfig {
            worker_threads: 0,
            ..DeliveryConfig::default()
        };
        assert!(matches!(
            DeliveryServer::new(config, Arc::new(MockTransport::new()), None),
            Err(DeliveryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_tick_delivers_across_ticks() {
        let transport = Arc::new(MockTransport::new());
        let mut server = server(&transport);
        let world = Arc::new(MockWorld::with_auto_ready(WorldId(1)));
        let target = CellCoord::new(0, 0);

        server.connect(SessionId(1), world).queue_cells([(target, 0)]);
        let first = server.tick();
        assert_eq!(first.admitted, 1);
        assert_eq!(first.tick, 1);

        server.flush(Duration::from_secs(5));
        assert_eq!(server.session(SessionId(1)).unwrap().status(target), CellStatus::Sent);
        assert_eq!(transport.transmit_count(SessionId(1), target), 1);
    }

    #[test]
    fn test_transmission_failure_is_reported() {
        let transport = Arc::new(MockTransport::new());
        let mut server = server(&transport);
        let world = Arc::new(MockWorld::with_auto_ready(WorldId(1)));
        let target = CellCoord::new(1, 1);
        transport.fail_next(SessionId(1), target);

        server.connect(SessionId(1), world).queue_cells([(target, 0)]);
        server.tick();
        let drained = server.flush(Duration::from_secs(5));

        assert!(matches!(drained.errors.as_slice(), [DeliveryError::Transmission { .. }]));
        assert_eq!(
            server.session(SessionId(1)).unwrap().status(target),
            CellStatus::RequestedSending
        );
    }

    #[test]
    fn test_closed_connections_are_pruned() {
        let transport = Arc::new(MockTransport::new());
        let mut server = server(&transport);
        let world: Arc<dyn WorldProvider> = Arc::new(MockWorld::new(WorldId(1)));

        server.connect(SessionId(1), Arc::clone(&world));
        server.connect(SessionId(2), world);
        transport.disconnect(SessionId(2));
        server.tick();

        assert_eq!(server.session_count(), 1);
        assert!(server.session(SessionId(2)).is_none());
        assert!(server.disconnect(SessionId(1)));
        assert!(!server.disconnect(SessionId(1)));
    }

    #[test]
    fn test_run_for_ticks() {
        let transport = Arc::new(MockTransport::new());
        let mut server = DeliveryServer::new(
            DeliveryConfig {
                tick_rate: 200,
                ..DeliveryConfig::default()
            },
            transport,
            None,
        )
        .unwrap();

        let summary = server.run_for(Duration::from_millis(50));
        assert!(summary.ticks > 0);
        assert_eq!(summary.ticks, server.tick_count());
        assert_eq!(summary.stats.ticks, summary.ticks);
        server.shutdown();
    }
}
