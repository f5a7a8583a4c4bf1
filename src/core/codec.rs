//! # Aether Codec
//!
//! Tokio codec that frames Aether packets over a byte stream.
//!
//! Decoding tolerates partial reads and noise: when the buffer does not start with the
//! protocol magic, exactly one byte is discarded and the search restarts. A corrupted
//! stream therefore loses only the corrupted bytes, never the valid frames behind them.
//! The price is that a false-positive magic inside garbage is taken at face value.
//!
//! A declared payload larger than the configured maximum is the only decode error; it is
//! fatal to the connection because resynchronising would mean trusting an attacker's length.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::packet::{Header, Packet, HEADER_SIZE};
use crate::error::{ProtocolError, Result};

/// Framing codec for [`Packet`]s.
#[derive(Debug, Clone)]
pub struct AetherCodec {
    max_payload_size: usize,
    resyncs: u64,
}

impl AetherCodec {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PAYLOAD_SIZE)
    }

    /// Codec that rejects frames declaring more than `max_payload_size` payload bytes.
    pub fn with_max_payload(max_payload_size: usize) -> Self {
        Self {
            max_payload_size,
            resyncs: 0,
        }
    }

    /// Number of bytes discarded while searching for a magic so far.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

impl Default for AetherCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AetherCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        loop {
            match Header::starts_with_magic(src) {
                None => return Ok(None),
                Some(false) => {
                    src.advance(1);
                    self.resyncs += 1;
                    trace!(remaining = src.len(), "Magic mismatch, dropped one byte");
                    continue;
                }
                Some(true) => {}
            }

            let Some(header) = Header::peek(src) else {
                src.reserve(HEADER_SIZE - src.len());
                return Ok(None);
            };

            let length = header.length as usize;
            if length > self.max_payload_size {
                return Err(ProtocolError::OversizedPacket(length));
            }

            let frame_len = header.frame_len();
            if src.len() < frame_len {
                src.reserve(frame_len - src.len());
                return Ok(None);
            }

            let mut frame = src.split_to(frame_len);
            frame.advance(HEADER_SIZE);
            return Ok(Some(Packet::from_wire(&header, frame.freeze())));
        }
    }
}

impl Encoder<Packet> for AetherCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        item.check_size(self.max_payload_size)?;
        item.encode(dst);
        Ok(())
    }
}
