//! Response channels: "send bytes back to whoever sent us this packet".
//!
//! Handlers only ever see a [`ResponseChannel`]; the TCP transport provides one per
//! connection and [`MemoryChannel`] records packets in-process.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};

/// Process-unique identity of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl ChannelId {
    /// Allocate the next identifier. Identifiers are never reused within a process.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ChannelId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Outbound side of one connection.
pub trait ResponseChannel: Send + Sync {
    fn id(&self) -> ChannelId;

    /// Queue a packet for the peer. Fails once the channel is closed.
    fn send_packet(&self, packet: &Packet) -> Result<()>;

    /// Ask the transport to close the connection after everything already queued is written.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// In-process channel that records every packet sent through it.
#[derive(Debug)]
pub struct MemoryChannel {
    id: ChannelId,
    sent: Mutex<Vec<Packet>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self {
            id: ChannelId::next(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Copy of every packet sent so far
    pub fn sent(&self) -> Vec<Packet> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain the recorded packets
    pub fn take(&self) -> Vec<Packet> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseChannel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send_packet(&self, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::ChannelClosed);
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(packet.clone());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
