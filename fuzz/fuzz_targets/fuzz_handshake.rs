#![no_main]

use std::sync::Arc;

use aether::protocol::channel::{MemoryChannel, ResponseChannel};
use aether::protocol::handshake::{ConnSession, SessionEvent, SessionState};
use aether::transport::session_registry::SessionRegistry;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    // First byte picks the chunk size so partial deliveries get covered too
    let chunk = usize::from(data[0]).max(1);
    let channel: Arc<dyn ResponseChannel> = Arc::new(MemoryChannel::new());
    let registry = SessionRegistry::new();
    let mut session = ConnSession::new(channel, registry.clone()).with_max_payload(256);

    for piece in data[1..].chunks(chunk) {
        match session.feed(piece) {
            SessionEvent::Established { device_id, .. } => assert!(!device_id.is_empty()),
            SessionEvent::Rejected { .. } => assert_eq!(session.state(), SessionState::Closing),
            _ => {}
        }
    }

    drop(session);
    assert!(registry.is_empty());
});
