//! Event bus collaborator consumed by steps and tasks.

use crate::error::BusError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// An event delivered to subscribed handlers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Event {
    /// What the event is about, e.g. `"vm.powered_on"`.
    pub topic: String,
    /// Free-form attributes.
    #[serde(default)]
    pub payload: HashMap<String, String>,
}

impl Event {
    /// Creates an event with an empty payload.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: HashMap::new(),
        }
    }

    /// Adds an attribute to the payload.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// A function from an event to a result, shared between the bus and its owner.
///
/// The default handler accepts every event and does nothing.
#[derive(Clone)]
pub struct EventHandler(Arc<dyn Fn(&Event) -> Result<(), BusError> + Send + Sync>);

impl EventHandler {
    /// Wraps a closure as a handler.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Event) -> Result<(), BusError> + Send + Sync + 'static,
    {
        Self(Arc::new(handler))
    }

    /// A handler that ignores every event.
    pub fn noop() -> Self {
        Self::new(|_| Ok(()))
    }

    /// Delivers `event` to the handler.
    pub fn handle(&self, event: &Event) -> Result<(), BusError> {
        (self.0)(event)
    }
}

impl Default for EventHandler {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventHandler")
    }
}

/// Publish/subscribe facility a step tree receives asynchronous events from.
///
/// A task owns one bus per run. Steps subscribe a handler when they start
/// running; the task closes the bus once the whole tree has finished, which
/// invalidates every subscription.
pub trait EventBus: Send + Sync + fmt::Debug {
    /// Registers a handler for all subsequently published events.
    fn subscribe(&self, handler: EventHandler);

    /// Delivers `event` to every subscribed handler.
    fn publish(&self, event: Event) -> Result<(), BusError>;

    /// Closes the bus and drops all subscriptions.
    fn close(&self);

    /// Returns `true` once [`EventBus::close`] has been called.
    fn is_closed(&self) -> bool;
}

/// Shared handle to an event bus.
pub type SharedEventBus = Arc<dyn EventBus>;

#[derive(Default)]
struct BusState {
    handlers: Vec<EventHandler>,
    closed: bool,
}

/// In-process bus delivering events synchronously in subscription order.
#[derive(Default)]
pub struct InMemoryEventBus {
    state: Mutex<BusState>,
}

impl fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("InMemoryEventBus")
            .field("handlers", &state.handlers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl InMemoryEventBus {
    /// Creates an open bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an open bus behind a [`SharedEventBus`] handle.
    pub fn shared() -> SharedEventBus {
        Arc::new(Self::new())
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .len()
    }
}

impl EventBus for InMemoryEventBus {
    fn subscribe(&self, handler: EventHandler) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            debug!("dropping subscription to a closed event bus");
            return;
        }
        state.handlers.push(handler);
    }

    fn publish(&self, event: Event) -> Result<(), BusError> {
        let handlers = {
            let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return Err(BusError::Closed);
            }
            state.handlers.clone()
        };

        // Every handler sees the event; the first rejection is reported.
        let mut first_error = None;
        for handler in &handlers {
            if let Err(e) = handler.handle(&event) {
                debug!("handler rejected event '{}': {}", event.topic, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.closed {
            state.closed = true;
            state.handlers.clear();
        }
    }

    fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn counting_handler(count: &Arc<AtomicUsize>) -> EventHandler {
        let count = Arc::clone(count);
        EventHandler::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let bus = InMemoryEventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(counting_handler(&count));
        bus.subscribe(counting_handler(&count));

        assert_ok!(bus.publish(Event::new("vm.created").with("id", "42")));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_first_handler_error_is_reported() {
        let bus = InMemoryEventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventHandler::new(|_| Err(BusError::Handler("first".into()))));
        bus.subscribe(EventHandler::new(|_| Err(BusError::Handler("second".into()))));
        bus.subscribe(counting_handler(&count));

        let error = assert_err!(bus.publish(Event::new("x")));
        assert_eq!(error, BusError::Handler("first".into()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_drops_subscriptions() {
        let bus = InMemoryEventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(counting_handler(&count));

        bus.close();
        bus.close();
        assert!(bus.is_closed());
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(Event::new("late")), Err(BusError::Closed));

        bus.subscribe(counting_handler(&count));
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_noop_handler_accepts_everything() {
        assert_ok!(EventHandler::default().handle(&Event::new("anything")));
    }
}
