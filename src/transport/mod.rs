//! # Transport Layer
//!
//! Sockets and the per-connection plumbing around the protocol layer.
//!
//! ## Components
//! - **TCP**: device-facing server, response channels and a client connector
//! - **Session Registry**: device id to live channel directory for reverse sends
//! - **Control** (Unix only): line-based control socket for operators

#[cfg(unix)]
pub mod control;
pub mod session_registry;
pub mod tcp;
