//! Telemetry module: persists device readings pushed over the protocol.
//!
//! Devices send `DATA_PUSH` packets to module `0x03` with a JSON payload:
//!
//! ```json
//! {
//!   "device_name": "ESP32",
//!   "event": {
//!     "type": "sensor",
//!     "sensor_type": "temperature",
//!     "sensor_external_id": "SensorTemp01",
//!     "value": 1.5,
//!     "read_timestamp": 1700000000
//!   }
//! }
//! ```
//!
//! Every push is answered, tagged with this module's id, by `ACK` or `ERROR_GENERIC`
//! carrying `{"success": bool, "message": str, "data": null}`.
//!
//! Writes go through a [`ConnectionPool`], so the handler blocks the connection's
//! pipeline thread while every store handle is busy.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::core::command::CommandType;
use crate::core::packet::{ModuleId, Packet};
use crate::error::{constants, ProtocolError, Result};
use crate::events::{types, Event, EventBus};
use crate::modules::{Module, ModuleLifecycle};
use crate::protocol::channel::ResponseChannel;
use crate::protocol::router::PacketHandler;
use crate::utils::pool::ConnectionPool;

/// One sensor value, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub device_name: String,
    pub sensor_type: String,
    pub sensor_external_id: String,
    pub value: f64,
    pub read_timestamp: i64,
}

/// A handle to the reading store. One handle is used by one thread at a time.
pub trait ReadingStore: Send + 'static {
    fn insert_reading(&mut self, reading: &SensorReading) -> Result<()>;
}

/// In-process store; handles opened from clones share the same readings.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    readings: Arc<Mutex<Vec<SensorReading>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn readings(&self) -> Vec<SensorReading> {
        self.readings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ReadingStore for MemoryStore {
    fn insert_reading(&mut self, reading: &SensorReading) -> Result<()> {
        self.readings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reading.clone());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DataPush {
    device_name: String,
    event: DeviceEvent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum DeviceEvent {
    Sensor {
        sensor_type: String,
        sensor_external_id: String,
        value: f64,
        read_timestamp: i64,
    },
    Relay {
        relay_external_id: String,
    },
}

pub struct TelemetryModule<S: ReadingStore> {
    lifecycle: ModuleLifecycle,
    pool: ConnectionPool<S>,
}

impl<S: ReadingStore> TelemetryModule<S> {
    pub const NAME: &'static str = "telemetry";

    pub fn new(bus: EventBus, pool: ConnectionPool<S>) -> Self {
        Self {
            lifecycle: ModuleLifecycle::new(Self::NAME, bus),
            pool,
        }
    }

    /// Validate and persist one `DATA_PUSH` payload. Returns the success message.
    pub fn record(&self, payload: &[u8]) -> Result<&'static str> {
        let push: DataPush = serde_json::from_slice(payload)?;

        match push.event {
            DeviceEvent::Sensor {
                sensor_type,
                sensor_external_id,
                value,
                read_timestamp,
            } => {
                let reading = SensorReading {
                    device_name: push.device_name,
                    sensor_type,
                    sensor_external_id,
                    value,
                    read_timestamp,
                };

                let mut store = self.pool.acquire();
                store.insert_reading(&reading)?;
                debug!(
                    device = %reading.device_name,
                    sensor = %reading.sensor_external_id,
                    value = reading.value,
                    "Sensor reading stored"
                );
                Ok("Sensor reading stored")
            }
            DeviceEvent::Relay { relay_external_id } => {
                debug!(device = %push.device_name, relay = %relay_external_id, "Relay event ignored");
                Err(ProtocolError::Unsupported(
                    "relay events are not implemented".to_string(),
                ))
            }
        }
    }
}

fn reply_body(success: bool, message: &str) -> Vec<u8> {
    json!({ "success": success, "message": message, "data": null })
        .to_string()
        .into_bytes()
}

impl<S: ReadingStore> Module for TelemetryModule<S> {
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
            info!(
                module = Self::NAME,
                pool_size = self.pool.size(),
                pool_available = self.pool.available(),
                "Status requested"
            );
        }
    }
}

impl<S: ReadingStore> PacketHandler for TelemetryModule<S> {
    fn module_id(&self) -> ModuleId {
        ModuleId::TELEMETRY
    }

    fn is_available(&self) -> bool {
        self.is_running()
    }

    fn on_packet(&self, packet: Packet, channel: &Arc<dyn ResponseChannel>) {
        let reply = match packet.command_type() {
            Some(CommandType::DataPush) => match self.record(packet.payload()) {
                Ok(message) => Packet::build(
                    CommandType::Ack,
                    ModuleId::TELEMETRY,
                    reply_body(true, message),
                ),
                Err(e) => {
                    warn!(channel = %channel.id(), error = %e, "Telemetry push rejected");
                    Packet::build(
                        CommandType::ErrorGeneric,
                        ModuleId::TELEMETRY,
                        reply_body(false, &e.to_string()),
                    )
                }
            },
            _ => Packet::build(
                CommandType::ErrorGeneric,
                ModuleId::TELEMETRY,
                reply_body(false, constants::ERR_UNSUPPORTED_COMMAND),
            ),
        };

        if let Err(e) = channel.send_packet(&reply) {
            warn!(channel = %channel.id(), error = %e, "Failed to send telemetry reply");
        }
    }
}
