//! # Modules
//!
//! Pluggable workers. Every module takes part in the event bus lifecycle; a module that
//! also implements [`PacketHandler`] owns a module id and receives protocol packets.
//!
//! ## Components
//! - **Module**: lifecycle trait driven by `core.start` / `core.stop` events
//! - **ModuleLifecycle**: running flag plus the `MODULE_STOPPED` confirmation
//! - **ModuleRegistry**: explicit registration, router table, start/stop of the set
//! - **CoreModule**, **TelemetryModule**: built-in modules

pub mod core;
pub mod telemetry;

pub use self::core::CoreModule;
pub use self::telemetry::TelemetryModule;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::core::packet::ModuleId;
use crate::error::{ProtocolError, Result};
use crate::events::{types, Event, EventBus, ShutdownBarrier};
use crate::protocol::router::{ModuleRouter, PacketHandler};

/// A unit of work with a start/stop lifecycle, driven through the event bus.
pub trait Module: Send + Sync + 'static {
    /// Unique name, used as the event target
    fn name(&self) -> &str;

    fn start(&self) -> Result<()>;

    /// Stop the module. Once stopped, it must publish `MODULE_STOPPED` with its name as
    /// source, see [`ModuleLifecycle::stop_with`].
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Events other than `core.start` / `core.stop`, only delivered while running.
    fn handle_event(&self, _event: &Event) {}

    /// Entry point for bus deliveries.
    fn on_event(&self, event: &Event) {
        match event.kind.as_str() {
            types::CORE_START => {
                if let Err(e) = self.start() {
                    error!(module = %self.name(), error = %e, "Module failed to start");
                }
            }
            types::CORE_STOP => self.stop(),
            _ if self.is_running() => self.handle_event(event),
            _ => {}
        }
    }
}

/// Running flag shared by the built-in modules.
pub struct ModuleLifecycle {
    name: String,
    running: AtomicBool,
    bus: EventBus,
}

impl ModuleLifecycle {
    pub fn new(name: impl Into<String>, bus: EventBus) -> Self {
        Self {
            name: name.into(),
            running: AtomicBool::new(false),
            bus,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Mark as running. Returns `false` if it already was.
    pub fn start(&self) -> bool {
        let started = !self.running.swap(true, Ordering::AcqRel);
        if started {
            info!(module = %self.name, "Module started");
        }
        started
    }

    /// Mark as stopped, run `cleanup`, then publish `MODULE_STOPPED`.
    ///
    /// Only the call that actually flips the flag runs the cleanup and confirms; stopping
    /// a stopped module does nothing.
    pub fn stop_with(&self, cleanup: impl FnOnce()) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return false;
        }
        cleanup();
        info!(module = %self.name, "Module stopped");
        self.bus
            .publish(Event::new(self.name.as_str(), types::MODULE_STOPPED));
        true
    }

    pub fn stop(&self) -> bool {
        self.stop_with(|| {})
    }
}

/// The set of modules of one process.
pub struct ModuleRegistry {
    bus: EventBus,
    modules: Vec<Arc<dyn Module>>,
    handlers: Vec<Arc<dyn PacketHandler>>,
}

impl ModuleRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            modules: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Register a module that only takes part in the event lifecycle.
    pub fn add_module(&mut self, module: Arc<dyn Module>) -> Result<()> {
        if self.modules.iter().any(|m| m.name() == module.name()) {
            return Err(ProtocolError::ConfigError(format!(
                "Module name '{}' registered twice",
                module.name()
            )));
        }
        debug!(module = %module.name(), "Module registered");
        self.modules.push(module);
        Ok(())
    }

    /// Register a module that also handles protocol packets for its module id.
    pub fn add_protocol_module<M>(&mut self, module: Arc<M>) -> Result<()>
    where
        M: Module + PacketHandler,
    {
        let id = module.module_id();
        if self.handlers.iter().any(|h| h.module_id() == id) {
            return Err(ProtocolError::ConfigError(format!(
                "Module id {id} registered twice"
            )));
        }
        self.add_module(module.clone())?;
        self.handlers.push(module);
        Ok(())
    }

    pub fn modules(&self) -> &[Arc<dyn Module>] {
        &self.modules
    }

    pub fn module_ids(&self) -> Vec<ModuleId> {
        self.handlers.iter().map(|h| h.module_id()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Build the routing table from every packet-handling module.
    pub fn router(&self) -> Result<ModuleRouter> {
        let mut router = ModuleRouter::new();
        for handler in &self.handlers {
            router.register(handler.clone())?;
        }
        Ok(router)
    }

    /// Subscribe every module to the bus and start it.
    ///
    /// Stops at the first module that fails to start; modules started before it keep running.
    pub fn start_all(&self) -> Result<()> {
        for module in &self.modules {
            self.bus.subscribe(module.clone())?;
            module.start().map_err(|e| {
                error!(module = %module.name(), error = %e, "Module failed to start");
                e
            })?;
        }
        info!(count = self.modules.len(), "Modules started");
        Ok(())
    }

    /// Stop every module and wait for all confirmations, without limit.
    pub fn stop_all(&self) -> Result<()> {
        ShutdownBarrier::new(self.bus.clone()).stop_all(&self.modules)
    }

    /// Stop every module, waiting at most `limit` for the confirmations.
    pub fn stop_all_within(&self, limit: Duration) -> Result<()> {
        ShutdownBarrier::new(self.bus.clone()).stop_all_within(&self.modules, limit)
    }

    /// `(name, running)` for every module, in registration order
    pub fn statuses(&self) -> Vec<(String, bool)> {
        self.modules
            .iter()
            .map(|m| (m.name().to_owned(), m.is_running()))
            .collect()
    }

    /// Unsubscribe every registered module from the bus.
    pub fn detach(&self) {
        for module in &self.modules {
            self.bus.unsubscribe(module.as_ref());
        }
    }

    /// Names of registered modules that are currently running
    pub fn running(&self) -> HashSet<String> {
        self.modules
            .iter()
            .filter(|m| m.is_running())
            .map(|m| m.name().to_owned())
            .collect()
    }
}
