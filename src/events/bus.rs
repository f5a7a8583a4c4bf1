//! Publish/subscribe bus for lifecycle events.
//!
//! Subscribers are modules, identified by the address of the module object, not by
//! name: subscribing the same module twice is a no-op, two distinct modules sharing a
//! name are two subscribers.
//!
//! Each subscription owns an unbounded mailbox drained by one dedicated delivery thread
//! (`bus-<name>`). `publish` only enqueues, so it never waits on subscriber work and a
//! slow subscriber delays nobody but itself. Events reach a given subscriber in publish
//! order; there is no ordering across subscribers. The number of delivery threads is
//! bounded by the number of subscribers, whatever the publish rate.
//!
//! Modules usually hold a clone of the bus, so a subscribed module and the bus keep each
//! other alive until [`EventBus::unsubscribe`] or [`EventBus::unsubscribe_all`] runs.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::error::{ProtocolError, Result};
use crate::events::Event;
use crate::modules::Module;

type Mailbox = mpsc::UnboundedSender<Arc<Event>>;

struct Subscription {
    name: String,
    mailbox: Mailbox,
}

/// Shared handle to the bus; clones publish to the same subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<usize, Subscription>>>,
}

/// Identity of a module object: the address of its data, metadata stripped.
fn identity(module: &dyn Module) -> usize {
    module as *const dyn Module as *const () as usize
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<usize, Subscription>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe a module. Returns `Ok(false)` if it was already subscribed, and an
    /// error if its delivery thread could not be spawned.
    pub fn subscribe(&self, module: Arc<dyn Module>) -> Result<bool> {
        let key = identity(module.as_ref());
        let mut subscribers = self.lock();
        if subscribers.contains_key(&key) {
            return Ok(false);
        }

        let name = module.name().to_owned();
        let (mailbox, inbox) = mpsc::unbounded_channel();

        let spawned = thread::Builder::new()
            .name(format!("bus-{name}"))
            .spawn(move || deliver(module, inbox));
        if let Err(e) = spawned {
            error!(module = %name, error = %e, "Failed to spawn event delivery thread");
            return Err(ProtocolError::Custom(format!(
                "no event delivery thread for module '{name}': {e}"
            )));
        }

        debug!(module = %name, "Subscribed to event bus");
        subscribers.insert(key, Subscription { name, mailbox });
        Ok(true)
    }

    /// Remove a module. Events already queued for it are still delivered.
    pub fn unsubscribe(&self, module: &dyn Module) -> bool {
        match self.lock().remove(&identity(module)) {
            Some(subscription) => {
                debug!(module = %subscription.name, "Unsubscribed from event bus");
                true
            }
            None => false,
        }
    }

    /// Drop every subscription, letting the delivery threads finish.
    pub fn unsubscribe_all(&self) {
        let removed = std::mem::take(&mut *self.lock());
        if !removed.is_empty() {
            debug!(count = removed.len(), "Cleared event bus subscribers");
        }
    }

    pub fn is_subscribed(&self, module: &dyn Module) -> bool {
        self.lock().contains_key(&identity(module))
    }

    /// Deliver `event` to every subscriber it is addressed to.
    ///
    /// Returns the number of mailboxes the event was queued on.
    pub fn publish(&self, event: Event) -> usize {
        let event = Arc::new(event);
        let subscribers = self.lock();

        let mut queued = 0;
        for subscription in subscribers.values() {
            if !event.is_for(&subscription.name) {
                continue;
            }
            match subscription.mailbox.send(event.clone()) {
                Ok(()) => queued += 1,
                Err(_) => warn!(module = %subscription.name, "Delivery thread gone, event dropped"),
            }
        }

        trace!(kind = %event.kind, source = %event.source, target = %event.target, queued, "Event published");
        queued
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Sorted names of the current subscribers
    pub fn subscriber_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().values().map(|s| s.name.clone()).collect();
        names.sort();
        names
    }
}

fn deliver(module: Arc<dyn Module>, mut inbox: mpsc::UnboundedReceiver<Arc<Event>>) {
    while let Some(event) = inbox.blocking_recv() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| module.on_event(&event)));
        if outcome.is_err() {
            error!(module = %module.name(), kind = %event.kind, "Event handler panicked");
        }
    }
    trace!(module = %module.name(), "Event delivery thread finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::events::types;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    struct Tap {
        name: &'static str,
        seen: Mutex<std_mpsc::Sender<Event>>,
    }

    impl Tap {
        fn new(name: &'static str) -> (Arc<Self>, std_mpsc::Receiver<Event>) {
            let (tx, rx) = std_mpsc::channel();
            (
                Arc::new(Self {
                    name,
                    seen: Mutex::new(tx),
                }),
                rx,
            )
        }
    }

    impl Module for Tap {
        fn name(&self) -> &str {
            self.name
        }

        fn start(&self) -> Result<()> {
            Ok(())
        }

        fn stop(&self) {}

        fn is_running(&self) -> bool {
            true
        }

        fn on_event(&self, event: &Event) {
            let _ = self.seen.lock().unwrap().send(event.clone());
        }
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let bus = EventBus::new();
        let (tap, _rx) = Tap::new("tap");

        assert!(bus.subscribe(tap.clone()).unwrap());
        assert!(!bus.subscribe(tap.clone()).unwrap());
        assert_eq!(bus.subscriber_count(), 1);

        assert!(bus.unsubscribe(tap.as_ref()));
        assert!(!bus.unsubscribe(tap.as_ref()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_targeted_and_broadcast_delivery() {
        let bus = EventBus::new();
        let (alpha, alpha_rx) = Tap::new("alpha");
        let (beta, beta_rx) = Tap::new("beta");
        bus.subscribe(alpha).unwrap();
        bus.subscribe(beta).unwrap();

        assert_eq!(bus.publish(Event::new("test", types::CORE_STATUS).to("beta")), 1);
        assert_eq!(bus.publish(Event::new("test", types::CORE_START)), 2);

        let timeout = Duration::from_secs(5);
        assert_eq!(beta_rx.recv_timeout(timeout).unwrap().kind, types::CORE_STATUS);
        assert_eq!(beta_rx.recv_timeout(timeout).unwrap().kind, types::CORE_START);
        assert_eq!(alpha_rx.recv_timeout(timeout).unwrap().kind, types::CORE_START);
        assert!(alpha_rx.try_recv().is_err());

        bus.unsubscribe_all();
    }

    #[test]
    fn test_publish_without_subscribers() {
        assert_eq!(EventBus::new().publish(Event::new("test", types::CORE_STOP)), 0);
    }
}
