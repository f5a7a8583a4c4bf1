//! Incremental frame parser.
//!
//! [`FrameParser::feed`] accepts whatever the socket produced, decodes every complete
//! packet the accumulated bytes contain, hands each to the registered handler, and keeps
//! a trailing partial frame for the next call. The output does not depend on how the
//! stream was chunked.

use std::sync::Arc;

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::core::codec::AetherCodec;
use crate::error::Result;
use crate::protocol::channel::ResponseChannel;
use crate::protocol::router::PacketHandler;

pub struct FrameParser {
    buffer: BytesMut,
    codec: AetherCodec,
    handler: Option<Arc<dyn PacketHandler>>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_codec(AetherCodec::new())
    }

    pub fn with_codec(codec: AetherCodec) -> Self {
        Self {
            buffer: BytesMut::new(),
            codec,
            handler: None,
        }
    }

    /// Handler invoked once per decoded packet, typically the module router.
    pub fn set_handler(&mut self, handler: Arc<dyn PacketHandler>) {
        self.handler = Some(handler);
    }

    /// Append `data` and dispatch every complete packet. Returns how many were decoded.
    ///
    /// Without a handler, decoded packets are dropped. The only error is an oversized
    /// frame, after which the connection should be closed.
    pub fn feed(&mut self, data: &[u8], channel: &Arc<dyn ResponseChannel>) -> Result<usize> {
        self.buffer.extend_from_slice(data);

        let mut decoded = 0;
        while let Some(packet) = self.codec.decode(&mut self.buffer)? {
            decoded += 1;
            match &self.handler {
                Some(handler) => handler.on_packet(packet, channel),
                None => trace!(command = packet.command(), "No handler set, packet dropped"),
            }
        }
        Ok(decoded)
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes discarded so far while resynchronising on the magic
    pub fn resyncs(&self) -> u64 {
        self.codec.resyncs()
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}
