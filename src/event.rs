// src/event.rs
//
// Typed event dispatcher with deferred delivery. Background loops call
// `dispatch` from their own threads; queued events are delivered to the
// registered listeners when the embedding application calls `update` on a
// thread of its choosing.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use log::warn;

use crate::decoder::Packet;
use crate::error::SerialError;

/// Events emitted by the serial port core. Each carries the name of the
/// originating port.
#[derive(Debug)]
pub enum SerialEvent {
    /// The port was opened and both background loops are running.
    Opened { port: String },
    /// One decoded packet.
    DataReceived { port: String, packet: Packet },
    /// A recoverable failure inside one of the background loops.
    Exception { port: String, error: SerialError },
    /// The open session ended; emitted exactly once per session.
    Closed { port: String },
}

impl SerialEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SerialEvent::Opened { .. } => EventKind::Opened,
            SerialEvent::DataReceived { .. } => EventKind::DataReceived,
            SerialEvent::Exception { .. } => EventKind::Exception,
            SerialEvent::Closed { .. } => EventKind::Closed,
        }
    }

    pub fn port(&self) -> &str {
        match self {
            SerialEvent::Opened { port }
            | SerialEvent::DataReceived { port, .. }
            | SerialEvent::Exception { port, .. }
            | SerialEvent::Closed { port } => port,
        }
    }
}

/// Variant kind used as the listener registry key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Opened,
    DataReceived,
    Exception,
    Closed,
}

/// Handle returned by `add_listener`, used to remove or query a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&SerialEvent) + Send + Sync>;

#[derive(Default)]
struct Inner {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<(ListenerId, Listener)>>,
    pending: VecDeque<SerialEvent>,
}

/// Listener registry plus a pending-event queue.
///
/// Listeners for one kind run in registration order. A panicking listener is
/// caught and logged; it does not prevent delivery to the remaining
/// listeners.
#[derive(Default)]
pub struct EventDispatcher {
    inner: Mutex<Inner>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        EventDispatcher::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Listeners run outside the lock, so a poisoned mutex can only mean
        // a panic mid-bookkeeping; the data is still coherent.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a listener for one event kind.
    pub fn add_listener<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&SerialEvent) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut inner = self.lock();
        match inner.listeners.get_mut(&kind) {
            Some(entries) => {
                let before = entries.len();
                entries.retain(|(entry_id, _)| *entry_id != id);
                entries.len() != before
            }
            None => false,
        }
    }

    pub fn has_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        let inner = self.lock();
        inner
            .listeners
            .get(&kind)
            .is_some_and(|entries| entries.iter().any(|(entry_id, _)| *entry_id == id))
    }

    /// Queue an event for delivery. Safe to call from any thread.
    pub fn dispatch(&self, event: SerialEvent) {
        self.lock().pending.push_back(event);
    }

    /// Deliver all queued events on the calling thread, in dispatch order.
    pub fn update(&self) {
        loop {
            // Snapshot the listeners and release the lock before invoking
            // them, so listeners may register or remove listeners.
            let (event, targets) = {
                let mut inner = self.lock();
                let Some(event) = inner.pending.pop_front() else {
                    return;
                };
                let targets: Vec<Listener> = inner
                    .listeners
                    .get(&event.kind())
                    .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
                    .unwrap_or_default();
                (event, targets)
            };

            for listener in targets {
                if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                    warn!(
                        "[{}] listener panicked handling {:?} event",
                        event.port(),
                        event.kind()
                    );
                }
            }
        }
    }

    /// Number of events waiting for delivery.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn opened(port: &str) -> SerialEvent {
        SerialEvent::Opened {
            port: port.to_string(),
        }
    }

    #[test]
    fn test_add_remove_has_listener() {
        let dispatcher = EventDispatcher::new();
        let id = dispatcher.add_listener(EventKind::Opened, |_| {});

        assert!(dispatcher.has_listener(EventKind::Opened, id));
        assert!(!dispatcher.has_listener(EventKind::Closed, id));
        assert!(dispatcher.remove_listener(EventKind::Opened, id));
        assert!(!dispatcher.has_listener(EventKind::Opened, id));
        assert!(!dispatcher.remove_listener(EventKind::Opened, id));
    }

    #[test]
    fn test_delivery_is_deferred_until_update() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_in = count.clone();
        dispatcher.add_listener(EventKind::Opened, move |_| {
            count_in.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.dispatch(opened("COM1"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.pending_len(), 1);

        dispatcher.update();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let order = order.clone();
            dispatcher.add_listener(EventKind::Opened, move |_| {
                order.lock().unwrap().push(tag);
            });
        }

        dispatcher.dispatch(opened("COM1"));
        dispatcher.update();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_panicking_listener_does_not_block_later_listeners() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_first = order.clone();
        dispatcher.add_listener(EventKind::Opened, move |_| {
            order_first.lock().unwrap().push("first");
            panic!("listener failure");
        });
        let order_second = order.clone();
        dispatcher.add_listener(EventKind::Opened, move |_| {
            order_second.lock().unwrap().push("second");
        });

        dispatcher.dispatch(opened("COM1"));
        dispatcher.update();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

        // The dispatcher stays usable after a listener panic.
        dispatcher.dispatch(opened("COM1"));
        dispatcher.update();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["first", "second", "first", "second"]
        );
    }

    #[test]
    fn test_events_without_listeners_are_dropped() {
        let dispatcher = EventDispatcher::new();
        dispatcher.dispatch(opened("COM1"));
        dispatcher.update();
        assert_eq!(dispatcher.pending_len(), 0);
    }
}
