//! Subscription Callbacks
//!
//! Callers observe a subscription through [`AvailabilityCallbacks`]. An
//! `mpsc::UnboundedSender<AvailabilityEvent>` implements the trait, so a
//! channel can be used instead of a custom type.
//!
//! Every invocation goes through a [`DeliveryGate`]. Closing the gate
//! synchronously stops all further invocations, including ones racing from
//! the subscription task on another thread.

use std::cell::Cell;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use tokio::sync::mpsc;

use crate::error::StreamError;
use crate::models::{AvailabilitySnapshot, ConnectionState};

/// Receives availability changes for one subscription
///
/// Callbacks run on the subscription's task and should return quickly.
/// Calling `unsubscribe` from inside a callback is allowed.
pub trait AvailabilityCallbacks: Send + Sync + 'static {
    /// First paint: the initial fetch, or a connection's first frame
    fn on_initial_data(&self, snapshot: &AvailabilitySnapshot);

    /// Live change; replaces the previous snapshot entirely
    fn on_update(&self, snapshot: &AvailabilitySnapshot);

    /// Advisory error; data already shown stays valid
    fn on_error(&self, _error: &StreamError) {}

    /// Connection state transition
    fn on_connection_change(&self, _state: ConnectionState) {}
}

/// Owned form of a callback invocation, for channel delivery
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AvailabilityEvent {
    /// See [`AvailabilityCallbacks::on_initial_data`]
    Initial(AvailabilitySnapshot),
    /// See [`AvailabilityCallbacks::on_update`]
    Update(AvailabilitySnapshot),
    /// See [`AvailabilityCallbacks::on_error`]
    Error(StreamError),
    /// See [`AvailabilityCallbacks::on_connection_change`]
    ConnectionChanged(ConnectionState),
}

impl AvailabilityEvent {
    /// The snapshot carried by `Initial`/`Update`
    #[must_use]
    pub fn snapshot(&self) -> Option<&AvailabilitySnapshot> {
        match self {
            Self::Initial(s) | Self::Update(s) => Some(s),
            _ => None,
        }
    }
}

impl AvailabilityCallbacks for mpsc::UnboundedSender<AvailabilityEvent> {
    fn on_initial_data(&self, snapshot: &AvailabilitySnapshot) {
        let _ = self.send(AvailabilityEvent::Initial(snapshot.clone()));
    }

    fn on_update(&self, snapshot: &AvailabilitySnapshot) {
        let _ = self.send(AvailabilityEvent::Update(snapshot.clone()));
    }

    fn on_error(&self, error: &StreamError) {
        let _ = self.send(AvailabilityEvent::Error(error.clone()));
    }

    fn on_connection_change(&self, state: ConnectionState) {
        let _ = self.send(AvailabilityEvent::ConnectionChanged(state));
    }
}

/// Closable wrapper around a subscription's callbacks
///
/// The lock is re-entrant so a callback may close its own gate.
pub(crate) struct DeliveryGate {
    callbacks: Arc<dyn AvailabilityCallbacks>,
    open: ReentrantMutex<Cell<bool>>,
}

impl DeliveryGate {
    pub(crate) fn new(callbacks: Arc<dyn AvailabilityCallbacks>) -> Self {
        Self {
            callbacks,
            open: ReentrantMutex::new(Cell::new(true)),
        }
    }

    /// Invoke `f` unless the gate is closed
    pub(crate) fn deliver(&self, f: impl FnOnce(&dyn AvailabilityCallbacks)) {
        let open = self.open.lock();
        if open.get() {
            f(self.callbacks.as_ref());
        }
    }

    /// Close; returns after any in-progress delivery on another thread ends
    pub(crate) fn close(&self) {
        self.open.lock().set(false);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.lock().get()
    }

    pub(crate) fn callbacks(&self) -> Arc<dyn AvailabilityCallbacks> {
        Arc::clone(&self.callbacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimeSlot;

    #[test]
    fn test_channel_callbacks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let snapshot = AvailabilitySnapshot::new(vec![TimeSlot::new("19:00", true)]);

        tx.on_initial_data(&snapshot);
        tx.on_connection_change(ConnectionState::Streaming);
        tx.on_error(&StreamError::Closed);

        assert_eq!(rx.try_recv().unwrap(), AvailabilityEvent::Initial(snapshot));
        assert_eq!(
            rx.try_recv().unwrap(),
            AvailabilityEvent::ConnectionChanged(ConnectionState::Streaming)
        );
        assert_eq!(rx.try_recv().unwrap().snapshot(), None);
    }

    #[test]
    fn test_closed_gate_drops_deliveries() {
        let (tx, mut rx) = mpsc::unbounded_channel::<AvailabilityEvent>();
        let gate = DeliveryGate::new(Arc::new(tx));

        gate.deliver(|cb| cb.on_update(&AvailabilitySnapshot::default()));
        gate.close();
        assert!(!gate.is_open());
        gate.deliver(|cb| cb.on_update(&AvailabilitySnapshot::default()));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_gate_can_close_from_inside_callback() {
        let (tx, _rx) = mpsc::unbounded_channel::<AvailabilityEvent>();
        let gate = Arc::new(DeliveryGate::new(Arc::new(tx)));
        let inner = Arc::clone(&gate);

        gate.deliver(move |_| inner.close());
        assert!(!gate.is_open());
    }
}
