//! # Packet
//!
//! Structured form of one protocol unit and its wire encoding.
//!
//! ## Wire Format
//! ```text
//! [Magic(2)=0xAA55] [Version(1)] [Type(2)] [Module(2)] [Length(4)] [Payload(N)]
//! ```
//! All multi-byte fields are big-endian. The header is always [`HEADER_SIZE`] bytes.
//!
//! Building and encoding never fail: the magic and version are fixed by the encoder,
//! and `length` is derived from the payload. Validation happens on the decode side
//! (see [`crate::core::codec::AetherCodec`]); senders call [`Packet::check_size`] so a
//! payload the length field cannot describe never reaches a socket.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::config::{MAGIC, PROTOCOL_VERSION};
use crate::core::command::CommandType;
use crate::error::{ProtocolError, Result};

/// Fixed header size: magic(2) + version(1) + type(2) + module(2) + length(4)
pub const HEADER_SIZE: usize = 11;

/// Largest payload the 32-bit length field can describe
pub const MAX_WIRE_PAYLOAD: usize = u32::MAX as usize;

/// Logical owner of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u16);

impl ModuleId {
    /// The core itself. Handshake replies and router errors are tagged with it.
    pub const CORE: ModuleId = ModuleId(0x01);
    /// Built-in test module slot
    pub const TEST: ModuleId = ModuleId(0x02);
    /// Telemetry persistence module
    pub const TELEMETRY: ModuleId = ModuleId(0x03);
    /// Sentinel the router uses when it has to report itself
    pub const ROUTER: ModuleId = ModuleId(0xFF);

    #[inline]
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl From<u16> for ModuleId {
    fn from(value: u16) -> Self {
        ModuleId(value)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// One immutable protocol packet.
///
/// The magic constant is not stored; it is implied by the type and written by the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    version: u8,
    command: u16,
    module: ModuleId,
    payload: Bytes,
}

impl Packet {
    /// Build a packet for a known command.
    pub fn build(command: CommandType, module: ModuleId, payload: impl Into<Bytes>) -> Self {
        Self::build_raw(command.code(), module, payload)
    }

    /// Build a packet without payload.
    pub fn empty(command: CommandType, module: ModuleId) -> Self {
        Self::build(command, module, Bytes::new())
    }

    /// Build a packet with a raw command code, e.g. from a module's reserved range.
    pub fn build_raw(command: u16, module: ModuleId, payload: impl Into<Bytes>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            command,
            module,
            payload: payload.into(),
        }
    }

    /// Reassemble a packet from decoded header fields.
    pub(crate) fn from_wire(header: &Header, payload: Bytes) -> Self {
        Self {
            version: header.version,
            command: header.command,
            module: ModuleId(header.module),
            payload,
        }
    }

    #[inline]
    pub fn magic(&self) -> u16 {
        MAGIC
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Raw command code
    #[inline]
    pub fn command(&self) -> u16 {
        self.command
    }

    /// Known command, or `None` for module-specific and unassigned codes
    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::try_from(self.command).ok()
    }

    #[inline]
    pub fn module(&self) -> ModuleId {
        self.module
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Declared payload length; always equal to `payload().len()`.
    #[inline]
    pub fn length(&self) -> u32 {
        debug_assert!(
            self.payload.len() <= MAX_WIRE_PAYLOAD,
            "payload does not fit the length field"
        );
        self.payload.len() as u32
    }

    /// Fails with [`ProtocolError::OversizedPacket`] if the payload is longer than
    /// `max_payload_size` or than the length field can describe.
    pub fn check_size(&self, max_payload_size: usize) -> Result<()> {
        let len = self.payload.len();
        if len > max_payload_size.min(MAX_WIRE_PAYLOAD) {
            return Err(ProtocolError::OversizedPacket(len));
        }
        Ok(())
    }

    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Total number of bytes this packet occupies on the wire.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Append the wire encoding to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u16(MAGIC);
        dst.put_u8(self.version);
        dst.put_u16(self.command);
        dst.put_u16(self.module.0);
        dst.put_u32(self.length());
        dst.extend_from_slice(&self.payload);
    }

    /// Encode into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Decoded fixed header, without the magic (checked separately).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub command: u16,
    pub module: u16,
    pub length: u32,
}

impl Header {
    /// Whether `src` starts with the protocol magic. `None` until two bytes are available.
    pub fn starts_with_magic(src: &[u8]) -> Option<bool> {
        if src.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([src[0], src[1]]) == MAGIC)
    }

    /// Read the header fields that follow the magic. `None` until [`HEADER_SIZE`] bytes are buffered.
    pub fn peek(src: &[u8]) -> Option<Header> {
        if src.len() < HEADER_SIZE {
            return None;
        }
        let mut cursor = &src[2..HEADER_SIZE];
        Some(Header {
            version: cursor.get_u8(),
            command: cursor.get_u16(),
            module: cursor.get_u16(),
            length: cursor.get_u32(),
        })
    }

    /// Header plus payload size of the frame this header announces.
    #[inline]
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.length as usize
    }
}
