//! Connection handshake state machine.
//!
//! Every connection starts in [`SessionState::Handshaking`]. The first frame must be a
//! `HELLO` whose payload is the peer's external device id:
//!
//! ```text
//! Device                                   Server
//!   |                                         |
//!   |  -- HELLO { payload: device id } ---->  |
//!   |                                         |
//!   |  <-- ACK (module CORE) ---------------  |   Handshaking -> Ready
//!   |      OR                                 |
//!   |  <-- HANDSHAKE_FAILED { reason } -----  |   Handshaking -> Closing
//! ```
//!
//! Validation order: magic, command, version, declared length, complete payload.
//! Instead of callbacks, [`ConnSession::feed`] returns a [`SessionEvent`] telling the
//! caller what to do with the bytes. Closing the socket after a rejection is the
//! transport's job.
//!
//! No timeout applies while waiting for the HELLO; a silent peer holds its session
//! until the socket closes.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{info, instrument, warn};

use crate::config::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
use crate::core::command::CommandType;
use crate::core::packet::{Header, ModuleId, Packet, HEADER_SIZE};
use crate::error::constants;
use crate::protocol::channel::ResponseChannel;
use crate::transport::session_registry::SessionRegistry;

/// Lifecycle of one connection session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a complete HELLO
    Handshaking,
    /// Handshake done; bytes go to the application parser
    Ready,
    /// Handshake rejected; further bytes are dropped
    Closing,
}

/// Result of feeding bytes to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// HELLO not complete yet
    Pending,
    /// Handshake completed by this call. `leftover` holds bytes received after the HELLO
    /// frame; they belong to the application layer and must be parsed next.
    Established { device_id: String, leftover: Bytes },
    /// Session is ready; the bytes are passed through unchanged.
    Forward(Bytes),
    /// Handshake rejected by this call. The failure reply has been sent.
    Rejected { reason: &'static str },
    /// Session is closing; the bytes were discarded.
    Discarded,
}

pub struct ConnSession {
    state: SessionState,
    buffer: BytesMut,
    device_id: String,
    channel: Arc<dyn ResponseChannel>,
    registry: SessionRegistry,
    max_payload_size: usize,
}

impl ConnSession {
    pub fn new(channel: Arc<dyn ResponseChannel>, registry: SessionRegistry) -> Self {
        Self {
            state: SessionState::Handshaking,
            buffer: BytesMut::with_capacity(HEADER_SIZE),
            device_id: String::new(),
            channel,
            registry,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }

    /// Reject HELLO frames declaring more than `max` payload bytes.
    pub fn with_max_payload(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// External device id; empty until the handshake completes
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn channel(&self) -> &Arc<dyn ResponseChannel> {
        &self.channel
    }

    /// Feed newly received bytes.
    pub fn feed(&mut self, bytes: &[u8]) -> SessionEvent {
        match self.state {
            SessionState::Handshaking => self.handle_handshake(bytes),
            SessionState::Ready => SessionEvent::Forward(Bytes::copy_from_slice(bytes)),
            SessionState::Closing => SessionEvent::Discarded,
        }
    }

    #[instrument(level = "debug", skip(self, bytes), fields(channel = %self.channel.id()))]
    fn handle_handshake(&mut self, bytes: &[u8]) -> SessionEvent {
        self.buffer.extend_from_slice(bytes);

        match Header::starts_with_magic(&self.buffer) {
            None => return SessionEvent::Pending,
            Some(false) => return self.reject(constants::ERR_HANDSHAKE_BAD_MAGIC),
            Some(true) => {}
        }

        let Some(header) = Header::peek(&self.buffer) else {
            return SessionEvent::Pending;
        };

        if header.command != CommandType::Hello.code() {
            return self.reject(constants::ERR_HANDSHAKE_NOT_HELLO);
        }

        if header.version != PROTOCOL_VERSION {
            return self.reject(constants::ERR_HANDSHAKE_BAD_VERSION);
        }

        if header.length as usize > self.max_payload_size {
            return self.reject(constants::ERR_HANDSHAKE_OVERSIZED);
        }

        let frame_len = header.frame_len();
        if self.buffer.len() < frame_len {
            return SessionEvent::Pending;
        }

        let frame = self.buffer.split_to(frame_len);
        let leftover = self.buffer.split().freeze();

        let device_id = match std::str::from_utf8(&frame[HEADER_SIZE..]) {
            Ok("") => return self.reject(constants::ERR_HANDSHAKE_EMPTY_ID),
            Ok(id) => id.to_owned(),
            Err(_) => return self.reject(constants::ERR_HANDSHAKE_BAD_ID),
        };

        self.device_id = device_id.clone();
        self.state = SessionState::Ready;
        self.registry.register(&self.channel, device_id.as_str());

        let ack = Packet::empty(CommandType::Ack, ModuleId::CORE);
        if let Err(e) = self.channel.send_packet(&ack) {
            warn!(error = %e, "Failed to send handshake ACK");
        }

        info!(device_id = %device_id, leftover = leftover.len(), "Handshake complete");
        SessionEvent::Established {
            device_id,
            leftover,
        }
    }

    fn reject(&mut self, reason: &'static str) -> SessionEvent {
        warn!(channel = %self.channel.id(), reason, "Handshake rejected");

        let reply = Packet::build(CommandType::HandshakeFailed, ModuleId::CORE, reason.as_bytes());
        if let Err(e) = self.channel.send_packet(&reply) {
            warn!(error = %e, "Failed to send handshake rejection");
        }

        self.buffer.clear();
        self.registry.unregister(self.channel.id());
        self.state = SessionState::Closing;

        SessionEvent::Rejected { reason }
    }
}

impl Drop for ConnSession {
    fn drop(&mut self) {
        self.registry.unregister(self.channel.id());
    }
}
