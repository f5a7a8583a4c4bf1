use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::command::CommandType;
use crate::core::packet::{ModuleId, Packet};
use crate::error::{constants, Result};
use crate::events::{types, Event, EventBus};
use crate::modules::{Module, ModuleLifecycle};
use crate::protocol::channel::ResponseChannel;
use crate::protocol::router::PacketHandler;

/// Liveness handling for the core module id: `PING` and `HEARTBEAT`.
pub struct CoreModule {
    lifecycle: ModuleLifecycle,
}

impl CoreModule {
    pub const NAME: &'static str = "core";

    pub fn new(bus: EventBus) -> Self {
        Self {
            lifecycle: ModuleLifecycle::new(Self::NAME, bus),
        }
    }
}

impl Module for CoreModule {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn start(&self) -> Result<()> {
        self.lifecycle.start();
        Ok(())
    }

    fn stop(&self) {
        self.lifecycle.stop();
    }

    fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    fn handle_event(&self, event: &Event) {
        if event.kind == types::CORE_STATUS {
            info!(module = Self::NAME, running = self.is_running(), "Status requested");
        }
    }
}

impl PacketHandler for CoreModule {
    fn module_id(&self) -> ModuleId {
        ModuleId::CORE
    }

    fn is_available(&self) -> bool {
        self.is_running()
    }

    fn on_packet(&self, packet: Packet, channel: &Arc<dyn ResponseChannel>) {
        let reply = match packet.command_type() {
            Some(CommandType::Ping) => {
                Packet::build(CommandType::Pong, ModuleId::CORE, packet.payload().clone())
            }
            Some(CommandType::Heartbeat) => Packet::empty(CommandType::Ack, ModuleId::CORE),
            _ => {
                debug!(command = packet.command(), "Unsupported core command");
                Packet::build(
                    CommandType::ErrorGeneric,
                    ModuleId::CORE,
                    constants::ERR_UNSUPPORTED_COMMAND.as_bytes(),
                )
            }
        };

        if let Err(e) = channel.send_packet(&reply) {
            warn!(channel = %channel.id(), error = %e, "Failed to send core reply");
        }
    }
}
