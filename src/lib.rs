//! # Aether
//!
//! Core of a device gateway daemon. Devices connect over TCP, identify themselves with
//! a HELLO handshake, then exchange framed binary packets that are routed to pluggable
//! modules. A separate event bus drives module lifecycles, including a synchronised
//! "stop everything" barrier.
//!
//! ## Layout
//! - [`core`]: packet, command codes, stream codec
//! - [`protocol`]: handshake state machine, incremental parser, module router
//! - [`transport`]: TCP server, session registry, control socket
//! - [`events`]: event bus and shutdown barrier
//! - [`modules`]: module lifecycle, registry, built-in modules
//! - [`utils`]: connection pool, metrics, logging
//! - [`service`]: daemon composition root
//!
//! ## Example
//! ```rust,no_run
//! use aether::config::AetherConfig;
//! use aether::service::Daemon;
//! use tokio::sync::mpsc;
//!
//! # async fn run() -> aether::error::Result<()> {
//! let daemon = Daemon::new(AetherConfig::default())?;
//! let (_stop, shutdown) = mpsc::channel(1);
//! daemon.run(shutdown).await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod modules;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::core::codec::AetherCodec;
pub use crate::core::command::CommandType;
pub use crate::core::packet::{ModuleId, Packet};
pub use crate::error::{ProtocolError, Result};
