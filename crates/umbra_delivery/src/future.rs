//! # Compressed Batch Future
//!
//! Single-assignment container for one cell's compressed payload.
//!
//! ## Rules
//!
//! - The payload is set at most once and never changes afterwards
//! - Callbacks fire exactly once each, in registration order
//! - A callback registered after resolution fires immediately, on the
//!   caller's stack
//! - Cancellation is only legal before resolution; a cancelled future keeps
//!   its callbacks so a restart can move them to a replacement
//!
//! Waiters may also leave an abandon handler. It fires only if a restart
//! could not issue a replacement, so the waiter knows its resolve handler
//! will never run. Resolution discards abandon handlers unfired.
//!
//! Callbacks never run while the internal lock is held, so a callback may
//! freely touch the same future or the cache that owns it.

use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{DeliveryError, DeliveryResult};

/// Compressed, ready-to-send cell payload. Shared by every recipient.
pub type Payload = Arc<[u8]>;

/// Handler run when the payload becomes available.
pub type ResolveCallback = Box<dyn FnOnce(&Payload) -> DeliveryResult<()> + Send>;

/// Handler run when the preparation is given up for good.
pub type AbandonCallback = Box<dyn FnOnce(&DeliveryError) + Send>;

struct BatchState {
    result: Option<Payload>,
    callbacks: Vec<ResolveCallback>,
    abandon_callbacks: Vec<AbandonCallback>,
    cancelled: bool,
}

/// Handle to a pending or resolved compressed payload.
///
/// Clones share state; use [`CompressedBatchFuture::ptr_eq`] to test
/// whether two handles refer to the same preparation.
#[derive(Clone)]
pub struct CompressedBatchFuture {
    inner: Arc<Mutex<BatchState>>,
}

impl CompressedBatchFuture {
    /// Creates an unresolved future.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BatchState {
                result: None,
                callbacks: Vec::new(),
                abandon_callbacks: Vec::new(),
                cancelled: false,
            })),
        }
    }

    /// Returns true once a payload has been set.
    #[must_use]
    pub fn has_result(&self) -> bool {
        self.inner.lock().result.is_some()
    }

    /// Returns the payload, if resolved.
    #[must_use]
    pub fn result(&self) -> Option<Payload> {
        self.inner.lock().result.clone()
    }

    /// Returns true if the future was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Number of callbacks waiting for resolution.
    #[must_use]
    pub fn pending_callbacks(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    /// Returns true if both handles share the same state.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registers a resolve handler.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Cancelled`] if the future was cancelled. If the
    /// future is already resolved the handler runs now and its own error
    /// is returned.
    pub fn on_resolve(&self, callback: ResolveCallback) -> DeliveryResult<()> {
        let mut state = self.inner.lock();
        if state.cancelled {
            return Err(DeliveryError::Cancelled);
        }
        let resolved = state.result.clone();
        match resolved {
            Some(payload) => {
                drop(state);
                callback(&payload)
            }
            None => {
                state.callbacks.push(callback);
                Ok(())
            }
        }
    }

    /// Sets the payload and fires every registered handler in order.
    ///
    /// Returns the errors the handlers reported; one failing handler does
    /// not stop the others.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::AlreadyResolved`] on a second resolution and
    /// [`DeliveryError::Cancelled`] on a cancelled future. Neither touches
    /// the stored payload.
    pub fn resolve(&self, payload: Payload) -> DeliveryResult<Vec<DeliveryError>> {
        let callbacks = {
            let mut state = self.inner.lock();
            if state.cancelled {
                return Err(DeliveryError::Cancelled);
            }
            if state.result.is_some() {
                return Err(DeliveryError::AlreadyResolved);
            }
            state.result = Some(Arc::clone(&payload));
            state.abandon_callbacks.clear();
            mem::take(&mut state.callbacks)
        };

        Ok(callbacks
            .into_iter()
            .filter_map(|callback| callback(&payload).err())
            .collect())
    }

    /// Cancels an unresolved future. No registered handler will fire from
    /// this future afterwards. Cancelling twice is allowed.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::CancelAfterResolve`] if a payload is already set.
    pub fn cancel(&self) -> DeliveryResult<()> {
        let mut state = self.inner.lock();
        if state.result.is_some() {
            return Err(DeliveryError::CancelAfterResolve);
        }
        state.cancelled = true;
        Ok(())
    }

    /// Registers an abandon handler. Ignored once the payload is set.
    pub fn on_abandon(&self, callback: AbandonCallback) {
        let mut state = self.inner.lock();
        if state.result.is_none() {
            state.abandon_callbacks.push(callback);
        }
    }

    /// Removes and returns the abandon handlers, in registration order.
    #[must_use]
    pub fn take_abandon_callbacks(&self) -> Vec<AbandonCallback> {
        mem::take(&mut self.inner.lock().abandon_callbacks)
    }

    /// Removes and returns the handlers still waiting, in registration order.
    #[must_use]
    pub fn take_resolve_callbacks(&self) -> Vec<ResolveCallback> {
        mem::take(&mut self.inner.lock().callbacks)
    }
}

impl Default for CompressedBatchFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompressedBatchFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("CompressedBatchFuture")
            .field("resolved", &state.result.is_some())
            .field("callbacks", &state.callbacks.len())
            .field("cancelled", &state.cancelled)
            .finish()
    }
}
