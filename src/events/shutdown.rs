//! Synchronised "stop everything" barrier.
//!
//! ```text
//! caller                      bus                       modules
//!   | subscribe listener  ->   |                           |
//!   | seed: already stopped    |                           |
//!   | core.stop (targeted) ->  | ------------------------> | stop()
//!   |                          | <-- MODULE_STOPPED ------ |
//!   | <- listener records -----|                           |
//!   | wait until all names confirmed                       |
//! ```
//!
//! The listener is subscribed before the running snapshot is taken, so a module that
//! stops on its own in between is still counted. [`ShutdownBarrier::stop_all`] waits
//! without limit: a module that never confirms blocks it forever.
//! [`ShutdownBarrier::stop_all_within`] is the bounded variant.
//!
//! A running module that is not subscribed to the bus can never see `core.stop`. It is
//! left out of the wait and reported as an error once the other modules have stopped.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::{ProtocolError, Result};
use crate::events::{types, Event, EventBus};
use crate::modules::Module;

/// Source name on the stop events the barrier publishes
pub const BARRIER_SOURCE: &str = "shutdown";

const LISTENER_NAME: &str = "StopListener";

#[derive(Default)]
struct StopListener {
    confirmed: Mutex<HashSet<String>>,
    changed: Condvar,
}

impl StopListener {
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.confirmed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn confirm(&self, name: &str) {
        self.lock().insert(name.to_owned());
        self.changed.notify_all();
    }

    fn pending(confirmed: &HashSet<String>, expected: &BTreeSet<String>) -> Vec<String> {
        expected
            .iter()
            .filter(|name| !confirmed.contains(*name))
            .cloned()
            .collect()
    }

    fn wait(&self, expected: &BTreeSet<String>, limit: Option<Duration>) -> Vec<String> {
        let guard = self.lock();
        let still_running =
            |confirmed: &mut HashSet<String>| !Self::pending(confirmed, expected).is_empty();

        let guard = match limit {
            None => self
                .changed
                .wait_while(guard, still_running)
                .unwrap_or_else(PoisonError::into_inner),
            Some(limit) => {
                self.changed
                    .wait_timeout_while(guard, limit, still_running)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
        Self::pending(&guard, expected)
    }
}

impl Module for StopListener {
    fn name(&self) -> &str {
        LISTENER_NAME
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn is_running(&self) -> bool {
        true
    }

    fn on_event(&self, event: &Event) {
        if event.kind == types::MODULE_STOPPED {
            self.confirm(&event.source);
        }
    }
}

/// Stops a set of modules through the bus and waits for their confirmations.
#[derive(Clone)]
pub struct ShutdownBarrier {
    bus: EventBus,
}

impl ShutdownBarrier {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Stop every running module in `modules` and block until all of them are stopped.
    pub fn stop_all(&self, modules: &[Arc<dyn Module>]) -> Result<()> {
        self.run(modules, None).map(|_| ())
    }

    /// Like [`stop_all`](Self::stop_all), but give up after `limit` and report the
    /// modules that did not confirm.
    pub fn stop_all_within(&self, modules: &[Arc<dyn Module>], limit: Duration) -> Result<()> {
        let pending = self.run(modules, Some(limit))?;
        if pending.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Timeout(format!(
                "modules still running after {}ms: {}",
                limit.as_millis(),
                pending.join(", ")
            )))
        }
    }

    fn run(&self, modules: &[Arc<dyn Module>], limit: Option<Duration>) -> Result<Vec<String>> {
        let listener = Arc::new(StopListener::default());
        let handle: Arc<dyn Module> = listener.clone();
        self.bus.subscribe(handle.clone())?;

        let mut expected: BTreeSet<String> =
            modules.iter().map(|m| m.name().to_owned()).collect();

        let mut running = Vec::new();
        let mut unreachable = Vec::new();
        for module in modules {
            if !module.is_running() {
                listener.confirm(module.name());
            } else if self.bus.is_subscribed(module.as_ref()) {
                running.push(module.name().to_owned());
            } else {
                error!(module = %module.name(), "Running module is not subscribed, cannot stop it");
                expected.remove(module.name());
                unreachable.push(module.name().to_owned());
            }
        }

        info!(running = running.len(), total = expected.len(), "Stopping modules");
        for name in &running {
            self.bus
                .publish(Event::new(BARRIER_SOURCE, types::CORE_STOP).to(name.as_str()));
        }

        let pending = listener.wait(&expected, limit);
        self.bus.unsubscribe(handle.as_ref());

        if pending.is_empty() {
            info!("All modules stopped");
        } else {
            warn!(pending = ?pending, "Shutdown barrier gave up waiting");
        }

        if !unreachable.is_empty() {
            return Err(ProtocolError::Custom(format!(
                "modules not subscribed to the event bus: {}",
                unreachable.join(", ")
            )));
        }
        Ok(pending)
    }
}
