//! Interaction-event delivery back to stream producers.
//!
//! A producer that sent `BindEvents` for its URI receives the wall's
//! interaction events for that window over its own connection. An exclusive
//! binding silences all other subscribers for the URI.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc::UnboundedSender;

use super::protocol::InteractionEvent;

/// What a connection's writer task receives: the bound URI plus the event.
pub type EventDelivery = (String, InteractionEvent);

struct Subscriber {
    tx: UnboundedSender<EventDelivery>,
    exclusive: bool,
}

/// URI-keyed registry of event subscribers, shared between connection
/// tasks and the interaction source.
#[derive(Default)]
pub struct EventRegistry {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for `uri`. The sender side of a per-connection
    /// channel is stored; a closed channel is pruned on the next dispatch.
    pub fn bind(&self, uri: &str, tx: UnboundedSender<EventDelivery>, exclusive: bool) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers
            .entry(uri.to_string())
            .or_default()
            .push(Subscriber { tx, exclusive });
        tracing::info!(uri, exclusive, "Event subscriber bound");
    }

    /// Remove every subscriber for `uri` (stream closed).
    pub fn unbind_all(&self, uri: &str) {
        self.subscribers.lock().unwrap().remove(uri);
    }

    /// Deliver one event to the subscribers of `uri`.
    ///
    /// With an exclusive binding present, only the most recent exclusive
    /// subscriber receives events. Closed channels are dropped here.
    pub fn dispatch(&self, uri: &str, event: InteractionEvent) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        let Some(list) = subscribers.get_mut(uri) else {
            return 0;
        };
        list.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        if let Some(exclusive) = list.iter().rev().find(|s| s.exclusive) {
            if exclusive.tx.send((uri.to_string(), event)).is_ok() {
                delivered = 1;
            }
        } else {
            for s in list.iter() {
                if s.tx.send((uri.to_string(), event)).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, uri: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(uri)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::protocol::EventKind;
    use tokio::sync::mpsc;

    fn event() -> InteractionEvent {
        InteractionEvent {
            kind: EventKind::Move,
            x: 0.5,
            y: 0.5,
            dx: 0.01,
            dy: 0.0,
            buttons: 0,
            key: 0,
        }
    }

    #[test]
    fn test_dispatch_broadcasts_without_exclusive() {
        let registry = EventRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.bind("s", tx1, false);
        registry.bind("s", tx2, false);

        assert_eq!(registry.dispatch("s", event()), 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_exclusive_binding_silences_others() {
        let registry = EventRegistry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.bind("s", tx1, false);
        registry.bind("s", tx2, true);

        assert_eq!(registry.dispatch("s", event()), 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let registry = EventRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.bind("s", tx, false);
        drop(rx);
        assert_eq!(registry.dispatch("s", event()), 0);
        assert_eq!(registry.subscriber_count("s"), 0);
    }

    #[test]
    fn test_dispatch_unknown_uri_is_noop() {
        let registry = EventRegistry::new();
        assert_eq!(registry.dispatch("nope", event()), 0);
    }
}
