//! # Service
//!
//! Process-level wiring of the gateway.

pub mod daemon;

pub use daemon::{forward_signal, Daemon};
