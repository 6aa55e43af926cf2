//! # UMBRA Delivery - Cell Preparation Pipeline
//!
//! Gets every cell a client is owed prepared once, shared between sessions,
//! and sent exactly once per session.
//!
//! ## Architecture
//!
//! - **Sessions**: per-client state machine with a per-tick generation budget
//! - **Cache**: one per (world, compression, obfuscated), deduplicating
//!   preparation across sessions
//! - **Futures**: single-assignment payload handles with ordered callbacks
//! - **Workers**: fixed thread pool; continuations return to the control
//!   thread
//!
//! ## Data Flow
//!
//! ```text
//! SESSION                   CACHE                     WORKER
//!   |                         |                         |
//!   |-- advance_tick -------->| (world: ensure ready)   |
//!   |-- request_compressed -->|                         |
//!   |                         |-- miss: snapshot ------>|
//!   |                         |                         | compress
//!   |                         |<-- drain: resolve ------|
//!   |<-- on_resolve ----------|                         |
//!   | transmit, mark SENT     |                         |
//! ```
//!
//! A failed preparation is restarted transparently: the cache cancels the
//! old future, issues a new one and moves every waiting callback over.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use umbra_core::{CellCoord, CellStatus, SessionId, WorldId};
//! use umbra_delivery::mock::{MockTransport, MockWorld};
//! use umbra_delivery::{DeliveryConfig, DeliveryServer};
//!
//! let transport = Arc::new(MockTransport::new());
//! let mut server = DeliveryServer::new(DeliveryConfig::default(), transport.clone(), None).unwrap();
//! let world = Arc::new(MockWorld::with_auto_ready(WorldId(1)));
//!
//! let cell = CellCoord::new(0, 0);
//! server.connect(SessionId(1), world).queue_cells([(cell, 0)]);
//! server.tick();
//! server.flush(Duration::from_secs(5));
//!
//! assert_eq!(server.session(SessionId(1)).unwrap().status(cell), CellStatus::Sent);
//! assert_eq!(transport.transmit_count(SessionId(1), cell), 1);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod cache;
pub mod collab;
pub mod config;
pub mod error;
pub mod future;
pub mod server;
pub mod session;
pub mod worker;

// Re-exports for convenience
pub use cache::{CacheKey, CellCache, CellCacheRegistry};
pub use collab::{
    mock, CellFailureCallback, CellListener, CellReadyCallback, CellTransform, FeatureGate, ListenerId,
    Transport, WorldFeatureGate, WorldProvider,
};
pub use config::DeliveryConfig;
pub use error::{DeliveryError, DeliveryResult, TaskFailure};
pub use future::{AbandonCallback, CompressedBatchFuture, Payload, ResolveCallback};
pub use server::{DeliveryServer, RunSummary, TickLoop, TickReport, TickStats};
pub use session::{
    AdmissionReport, LoadQueue, SendCompletion, SessionConfig, SessionDeliveryController, TickParticipant,
};
pub use worker::{Drained, PoolStats, TaskCompletion, TaskId, WorkerPool, WorkerTask};
