//! # Core Protocol Components
//!
//! Packet structure, command codes and the stream codec.
//!
//! This module is pure: nothing here performs I/O or holds connection state.
//!
//! ## Components
//! - **Packet**: immutable packet, `build` and `encode` (the PacketCodec operations)
//! - **Command**: wire command codes and their ranges
//! - **Codec**: Tokio codec for framing over byte streams, with byte-level resync
//!
//! ## Wire Format
//! ```text
//! [Magic(2)] [Version(1)] [Type(2)] [Module(2)] [Length(4)] [Payload(N)]
//! ```
//!
//! ## Safety Limits
//! - Maximum payload size: 16MB by default (prevents memory exhaustion)
//! - Length validation before buffering the payload

pub mod codec;
pub mod command;
pub mod packet;
