use crate::core::command::CommandType;
use crate::core::packet::{ModuleId, Packet};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::channel::ResponseChannel;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Capability of owning a module id and handling its packets.
///
/// A module either implements this trait or it does not; the router never inspects
/// types at runtime.
pub trait PacketHandler: Send + Sync {
    fn module_id(&self) -> ModuleId;

    /// Whether the handler is currently running. Packets for a stopped handler are
    /// answered by the router with `MODULE_UNAVAILABLE`.
    fn is_available(&self) -> bool {
        true
    }

    /// Handle one packet. The handler alone decides whether and what to reply.
    fn on_packet(&self, packet: Packet, channel: &Arc<dyn ResponseChannel>);
}

/// What the router did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered(ModuleId),
    NotFound(ModuleId),
    Unavailable(ModuleId),
}

/// Routes packets to the handler owning `packet.module()`.
///
/// The table is built once at startup and is read-only afterwards, so routing takes no lock.
#[derive(Default)]
pub struct ModuleRouter {
    handlers: HashMap<ModuleId, Arc<dyn PacketHandler>>,
}

impl ModuleRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Two handlers may not claim the same module id.
    pub fn register(&mut self, handler: Arc<dyn PacketHandler>) -> Result<()> {
        let id = handler.module_id();
        if id == ModuleId::ROUTER {
            return Err(ProtocolError::ConfigError(format!(
                "Module id {id} is reserved for the router"
            )));
        }
        if self.handlers.contains_key(&id) {
            return Err(ProtocolError::ConfigError(format!(
                "Module id {id} registered twice"
            )));
        }
        debug!(module_id = %id, "Registered packet handler");
        self.handlers.insert(id, handler);
        Ok(())
    }

    pub fn module_ids(&self) -> Vec<ModuleId> {
        let mut ids: Vec<_> = self.handlers.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Dispatch one packet synchronously on the caller's thread.
    pub fn route(&self, packet: Packet, channel: &Arc<dyn ResponseChannel>) -> RouteOutcome {
        let target = packet.module();

        let Some(handler) = self.handlers.get(&target) else {
            warn!(module_id = %target, command = packet.command(), "No module for packet");
            reply(
                channel,
                CommandType::ErrorGeneric,
                constants::ERR_MODULE_NOT_FOUND,
            );
            return RouteOutcome::NotFound(target);
        };

        if !handler.is_available() {
            debug!(module_id = %target, "Module not running, packet refused");
            reply(
                channel,
                CommandType::ModuleUnavailable,
                constants::ERR_MODULE_UNAVAILABLE,
            );
            return RouteOutcome::Unavailable(target);
        }

        handler.on_packet(packet, channel);
        RouteOutcome::Delivered(target)
    }
}

impl PacketHandler for ModuleRouter {
    fn module_id(&self) -> ModuleId {
        ModuleId::ROUTER
    }

    fn on_packet(&self, packet: Packet, channel: &Arc<dyn ResponseChannel>) {
        self.route(packet, channel);
    }
}

/// Router replies are tagged with the core's id, not the unknown target's.
fn reply(channel: &Arc<dyn ResponseChannel>, command: CommandType, reason: &'static str) {
    let packet = Packet::build(command, ModuleId::CORE, reason.as_bytes());
    if let Err(e) = channel.send_packet(&packet) {
        warn!(channel = %channel.id(), error = %e, "Failed to send router reply");
    }
}
