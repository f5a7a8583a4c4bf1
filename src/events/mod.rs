//! # Event Bus
//!
//! Coarse-grained lifecycle events, independent of the TCP protocol.
//!
//! ## Components
//! - **Event**: `{source, target, kind, data}` record; an empty target broadcasts
//! - **EventBus**: publish/subscribe over [`Module`](crate::modules::Module) subscribers
//! - **ShutdownBarrier**: "stop everything and wait for every confirmation"

pub mod bus;
pub mod shutdown;

pub use bus::EventBus;
pub use shutdown::ShutdownBarrier;

/// Well-known event kinds
pub mod types {
    /// Start (or restart) the targeted modules
    pub const CORE_START: &str = "core.start";
    /// Stop the targeted modules
    pub const CORE_STOP: &str = "core.stop";
    /// Ask modules to report their status
    pub const CORE_STATUS: &str = "core.status";
    /// Published by a module once it has finished stopping
    pub const MODULE_STOPPED: &str = "MODULE_STOPPED";
}

/// One bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Name of the publisher
    pub source: String,
    /// Receiving module name; empty means every subscriber
    pub target: String,
    /// Event kind, see [`types`]
    pub kind: String,
    pub data: String,
}

impl Event {
    /// Broadcast event with no data.
    pub fn new(source: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: String::new(),
            kind: kind.into(),
            data: String::new(),
        }
    }

    /// Address the event to a single module.
    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target.is_empty()
    }

    /// Whether a subscriber called `name` receives this event.
    pub fn is_for(&self, name: &str) -> bool {
        self.is_broadcast() || self.target == name
    }
}
