//! # Delivery Status
//!
//! Identifiers and the per-session cell state machine.
//!
//! ```text
//! NotTracked ──► RequestedGeneration ──► RequestedSending ──► Sent
//!      ▲                  │                      │              │
//!      └──────────────────┴──── dropped / invalidated ──────────┘
//! ```

use std::fmt;

/// Unique identifier for a connected session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Identity of a world. Completions compare the world they were issued for
/// against the session's current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorldId(pub u32);

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "world#{}", self.0)
    }
}

/// Where a cell is in a session's delivery pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellStatus {
    /// Not in the session's view.
    #[default]
    NotTracked = 0,
    /// Waiting for the world to make the content ready.
    RequestedGeneration = 1,
    /// Content ready, waiting for the compressed payload.
    RequestedSending = 2,
    /// Payload transmitted.
    Sent = 3,
}

impl CellStatus {
    /// Returns true once the payload has gone out.
    #[inline]
    #[must_use]
    pub const fn is_sent(self) -> bool {
        matches!(self, Self::Sent)
    }

    /// Returns true while an asynchronous step is outstanding.
    #[inline]
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::RequestedGeneration | Self::RequestedSending)
    }
}
