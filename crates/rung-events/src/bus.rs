#![forbid(unsafe_code)]

use tokio::sync::broadcast;

use crate::Event;

/// Broadcast event bus for the ABR engine.
///
/// The engine publishes decision and telemetry events directly; subscribers
/// receive all events from all subsystems.
///
/// `publish()` is a sync call — works from both async tasks and blocking
/// threads. If there are no subscribers, events are silently dropped.
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
    /// Accepts any type that converts `Into<Event>`, so you can pass
    /// sub-enum values directly: `bus.publish(AbrEvent::LevelSwitched { .. })`.
    ///
    /// This is a sync call (no `.await`).
    pub fn publish<E: Into<Event>>(&self, event: E) {
        let _ = self.tx.send(event.into());
    }

    /// Subscribe to all future events.
    ///
    /// Each subscriber gets an independent receiver. Slow subscribers
    /// receive `RecvError::Lagged(n)` instead of blocking producers.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(32)
    }
}
