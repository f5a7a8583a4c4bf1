//! # Protocol Layer
//!
//! Everything between raw socket bytes and module handlers.
//!
//! ## Components
//! - **Channel**: the outbound side of a connection as seen by handlers
//! - **Handshake**: per-connection HELLO state machine
//! - **Parser**: incremental frame extraction with magic resynchronisation
//! - **Router**: dispatch of decoded packets to the owning module
//!
//! The transport wires them per connection as
//! `bytes -> ConnSession -> FrameParser -> ModuleRouter -> PacketHandler`.

pub mod channel;
pub mod handshake;
pub mod parser;
pub mod router;

#[cfg(test)]
mod tests;
