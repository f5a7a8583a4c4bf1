//! # Error Types
//!
//! Error handling for the Aether protocol core.
//!
//! This module defines the error variants that can occur while framing, handshaking,
//! routing and serving connections, from low-level I/O errors to routing failures.
//!
//! ## Error Categories
//! - **Framing**: oversized frames (bad magic is resynchronised, never raised)
//! - **Handshake**: rejected HELLO packets, fatal to that connection only
//! - **Routing**: unknown or unavailable modules are reported to the peer, unknown devices to the caller
//! - **Resource**: external store failures, empty pools, opt-in timeouts
//! - **Configuration**: invalid or unreadable configuration
//!
//! ## Example Usage
//! ```rust
//! use aether::error::{ProtocolError, Result};
//! use tracing::error;
//!
//! fn parse_port(raw: &str) -> Result<u16> {
//!     raw.parse::<u16>()
//!         .map_err(|e| ProtocolError::ConfigError(format!("invalid port: {e}")))
//! }
//!
//! if let Err(e) = parse_port("not-a-port") {
//!     error!(error = %e, "Startup failed");
//! }
//! ```

use std::io;
use thiserror::Error;

/// Reason strings shared between log lines and on-the-wire error payloads.
pub mod constants {
    /// Handshake rejections
    pub const ERR_HANDSHAKE_BAD_MAGIC: &str = "Invalid magic";
    pub const ERR_HANDSHAKE_BAD_VERSION: &str = "Unsupported protocol version";
    pub const ERR_HANDSHAKE_NOT_HELLO: &str = "First packet must be HELLO";
    pub const ERR_HANDSHAKE_EMPTY_ID: &str = "Device identifier is empty";
    pub const ERR_HANDSHAKE_BAD_ID: &str = "Device identifier is not valid UTF-8";
    pub const ERR_HANDSHAKE_OVERSIZED: &str = "HELLO payload exceeds maximum size";

    /// Router replies
    pub const ERR_MODULE_NOT_FOUND: &str = "Module not found";
    pub const ERR_MODULE_UNAVAILABLE: &str = "Module is not running";

    /// Resource errors
    pub const ERR_POOL_EMPTY: &str = "Connection pool must hold at least one handle";
    pub const ERR_UNSUPPORTED_COMMAND: &str = "Command is not handled by this module";
}

// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Response channel closed")]
    ChannelClosed,

    #[error("No live session for device '{0}'")]
    DeviceNotConnected(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Pool error: {0}")]
    PoolError(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Control socket path '{0}' exists and is not a socket")]
    NotASocket(String),

    #[error("Control socket '{0}' is in use by a running daemon")]
    SocketInUse(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
