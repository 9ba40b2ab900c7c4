//! Publish/subscribe notifications.
//!
//! Every component owns an [`EventBus`] for its own event enum and emits
//! status changes on it. Subscribers (GUI bridges, loggers, tests) each get
//! an independent receiver. Emitting never blocks and never fails: with no
//! subscribers the event is simply dropped.
//!
//! Event enums implement [`Signal`] to expose the signal name GUI layers
//! listen for (`"centringSuccessful"`, `"queue_entry_execute_finished"`, ...).

use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity for event buses.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// An event with a stable signal name.
pub trait Signal {
    /// Name under which the event is published.
    fn signal_name(&self) -> &'static str;
}

/// Broadcast bus for one event type.
#[derive(Debug, Clone)]
pub struct EventBus<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Signal + Send + 'static> EventBus<E> {
    /// Create a bus retaining at most `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn emit(&self, event: E) {
        trace!(signal = event.signal_name(), "Emitting event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Receive all events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone + Signal + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
