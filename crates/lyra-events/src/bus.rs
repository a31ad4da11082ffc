use tokio::sync::broadcast;

use crate::Event;

/// Event bus shared by the loader and the stream orchestrator.
///
/// Components receive a cloned `EventBus` and publish directly. Every
/// subscriber sees every event.
///
/// `publish()` is sync and works from looper threads as well as async tasks.
/// Without subscribers events are dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all subscribers.
    ///
    /// Accepts sub-enum values directly: `bus.publish(TrackEvent::EndOfStream { track_id: 1 })`.
    pub fn publish<E: Into<Event>>(&self, event: E) {
        // Fails only when nobody is subscribed.
        let _ = self.tx.send(event.into());
    }

    /// Subscribe to all future events.
    ///
    /// Slow subscribers receive `RecvError::Lagged(n)` instead of blocking
    /// producers.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
