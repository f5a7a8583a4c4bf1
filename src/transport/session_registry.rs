//! # Session Registry
//!
//! Directory of live device sessions, used for server-initiated (reverse) sends.
//!
//! ## Features
//! - **Non-owning**: entries hold a `Weak` reference, the registry never keeps a
//!   connection's channel alive on its own
//! - **Self-cleaning**: reverse lookups evict entries whose channel is gone, so no
//!   background sweep task is needed
//! - **Thread-safe**: one mutex guards the map; lookups return copies, never live references
//!
//! ## Usage
//! ```ignore
//! let registry = SessionRegistry::new();
//! registry.register(&channel, "sensor-01");
//!
//! // Later, from any module:
//! registry.send_to_device("sensor-01", &packet)?;
//! ```
//!
//! Duplicate device ids are allowed; a reverse lookup returns whichever live entry the
//! scan meets first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, trace};

use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::channel::{ChannelId, ResponseChannel};

struct SessionEntry {
    channel: Weak<dyn ResponseChannel>,
    device_id: String,
}

/// Shared handle to the registry; clones refer to the same directory.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<ChannelId, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelId, SessionEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Associate `channel` with `device_id`. Re-registering a channel replaces its device id.
    pub fn register(&self, channel: &Arc<dyn ResponseChannel>, device_id: impl Into<String>) {
        let id = channel.id();
        let device_id = device_id.into();
        debug!(channel = %id, device_id = %device_id, "Session registered");

        self.lock().insert(
            id,
            SessionEntry {
                channel: Arc::downgrade(channel),
                device_id,
            },
        );
    }

    /// Forget a channel. Unknown channels are ignored.
    pub fn unregister(&self, id: ChannelId) {
        if self.lock().remove(&id).is_some() {
            debug!(channel = %id, "Session unregistered");
        }
    }

    /// Device id bound to a channel
    pub fn device_id(&self, id: ChannelId) -> Option<String> {
        self.lock().get(&id).map(|entry| entry.device_id.clone())
    }

    /// Live channel for a device, evicting every expired entry met during the scan.
    pub fn lookup_channel(&self, device_id: &str) -> Option<Arc<dyn ResponseChannel>> {
        let mut sessions = self.lock();
        let mut found = None;

        sessions.retain(|id, entry| match entry.channel.upgrade() {
            None => {
                trace!(channel = %id, "Evicting expired session");
                false
            }
            Some(channel) => {
                if found.is_none() && entry.device_id == device_id {
                    found = Some(channel);
                }
                true
            }
        });

        found
    }

    /// Server-initiated send to a device by its external id.
    pub fn send_to_device(&self, device_id: &str, packet: &Packet) -> Result<()> {
        let channel = self
            .lookup_channel(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotConnected(device_id.to_owned()))?;
        channel.send_packet(packet)
    }

    /// Number of entries, including ones whose channel may already be gone
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
