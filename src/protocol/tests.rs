// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::command::CommandType;
use crate::core::packet::{ModuleId, Packet, HEADER_SIZE};
use crate::error::constants;
use crate::protocol::channel::{MemoryChannel, ResponseChannel};
use crate::protocol::handshake::*;
use crate::protocol::parser::FrameParser;
use crate::protocol::router::PacketHandler;
use crate::transport::session_registry::SessionRegistry;

fn session() -> (ConnSession, Arc<MemoryChannel>, SessionRegistry) {
    let memory = Arc::new(MemoryChannel::new());
    let channel: Arc<dyn ResponseChannel> = memory.clone();
    let registry = SessionRegistry::new();
    (ConnSession::new(channel, registry.clone()), memory, registry)
}

fn hello(device_id: &str) -> Bytes {
    Packet::build(CommandType::Hello, ModuleId::CORE, device_id.to_owned()).to_bytes()
}

/// Records every packet it is handed.
#[derive(Default)]
struct Recorder {
    packets: Mutex<Vec<Packet>>,
}

impl PacketHandler for Recorder {
    fn module_id(&self) -> ModuleId {
        ModuleId::TEST
    }

    fn on_packet(&self, packet: Packet, _channel: &Arc<dyn ResponseChannel>) {
        self.packets.lock().unwrap().push(packet);
    }
}

#[test]
fn test_handshake_success_flow() {
    let (mut session, memory, registry) = session();
    assert_eq!(session.state(), SessionState::Handshaking);

    let event = session.feed(&hello("sensor-01"));

    assert_eq!(
        event,
        SessionEvent::Established {
            device_id: "sensor-01".into(),
            leftover: Bytes::new(),
        }
    );
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(session.device_id(), "sensor-01");

    let sent = memory.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command_type(), Some(CommandType::Ack));
    assert_eq!(sent[0].module(), ModuleId::CORE);
    assert!(sent[0].payload().is_empty());

    assert_eq!(
        registry.device_id(session.channel().id()),
        Some("sensor-01".to_string())
    );
}

#[test]
fn test_leftover_bytes_survive_handshake() {
    let (mut session, _memory, _registry) = session();
    let ping = Packet::empty(CommandType::Ping, ModuleId::CORE).to_bytes();

    let mut stream = BytesMut::new();
    stream.extend_from_slice(&hello("relay-2"));
    stream.extend_from_slice(&ping);

    match session.feed(&stream) {
        SessionEvent::Established { leftover, .. } => assert_eq!(leftover, ping),
        other => panic!("Expected Established, got {other:?}"),
    }
}

#[test]
fn test_payload_split_across_feeds() {
    let (mut session, memory, _registry) = session();
    let frame = hello("split-device");

    // Header plus one payload byte, then the rest
    assert_eq!(session.feed(&frame[..HEADER_SIZE + 1]), SessionEvent::Pending);
    assert_eq!(session.state(), SessionState::Handshaking);
    assert!(memory.sent().is_empty());

    let event = session.feed(&frame[HEADER_SIZE + 1..]);
    assert!(matches!(event, SessionEvent::Established { ref device_id, .. } if device_id == "split-device"));
    assert_eq!(session.state(), SessionState::Ready);
}

#[test]
fn test_header_delivered_byte_by_byte() {
    let (mut session, _memory, _registry) = session();
    let frame = hello("slow");

    for byte in &frame[..frame.len() - 1] {
        assert_eq!(session.feed(&[*byte]), SessionEvent::Pending);
    }
    assert!(matches!(
        session.feed(&frame[frame.len() - 1..]),
        SessionEvent::Established { .. }
    ));
}

#[test]
fn test_bad_magic_rejected_once() {
    let (mut session, memory, registry) = session();
    let mut frame = BytesMut::from(&hello("sensor-01")[..]);
    frame[0] = 0xDE;
    frame[1] = 0xAD;

    assert_eq!(
        session.feed(&frame),
        SessionEvent::Rejected {
            reason: constants::ERR_HANDSHAKE_BAD_MAGIC
        }
    );
    assert_eq!(session.state(), SessionState::Closing);
    assert!(registry.is_empty());

    // Nothing else fires once closing, even for a valid HELLO
    assert_eq!(session.feed(&hello("sensor-01")), SessionEvent::Discarded);
    assert_eq!(session.feed(b"garbage"), SessionEvent::Discarded);

    let sent = memory.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command_type(), Some(CommandType::HandshakeFailed));
    assert_eq!(sent[0].payload_str(), Some(constants::ERR_HANDSHAKE_BAD_MAGIC));
}

#[test]
fn test_bad_magic_detected_before_full_header() {
    let (mut session, memory, _registry) = session();

    assert!(matches!(session.feed(&[0x00, 0x01]), SessionEvent::Rejected { .. }));
    assert_eq!(memory.sent().len(), 1);
}

#[test]
fn test_non_hello_first_packet_rejected() {
    let (mut session, memory, _registry) = session();
    let ping = Packet::empty(CommandType::Ping, ModuleId::CORE).to_bytes();

    assert_eq!(
        session.feed(&ping),
        SessionEvent::Rejected {
            reason: constants::ERR_HANDSHAKE_NOT_HELLO
        }
    );
    assert_eq!(session.state(), SessionState::Closing);
    assert_eq!(
        memory.sent()[0].payload_str(),
        Some(constants::ERR_HANDSHAKE_NOT_HELLO)
    );
}

#[test]
fn test_wrong_version_rejected() {
    let (mut session, _memory, _registry) = session();
    let mut frame = BytesMut::from(&hello("old-firmware")[..]);
    frame[2] = 0x07;

    assert_eq!(
        session.feed(&frame),
        SessionEvent::Rejected {
            reason: constants::ERR_HANDSHAKE_BAD_VERSION
        }
    );
}

#[test]
fn test_non_hello_reported_before_wrong_version() {
    let (mut session, memory, _registry) = session();
    let mut frame = BytesMut::from(&Packet::empty(CommandType::Ping, ModuleId::CORE).to_bytes()[..]);
    frame[2] = 0x07;

    assert_eq!(
        session.feed(&frame),
        SessionEvent::Rejected {
            reason: constants::ERR_HANDSHAKE_NOT_HELLO
        }
    );
    assert_eq!(
        memory.sent()[0].payload_str(),
        Some(constants::ERR_HANDSHAKE_NOT_HELLO)
    );
}

#[test]
fn test_oversized_hello_rejected_without_buffering() {
    let memory = Arc::new(MemoryChannel::new());
    let channel: Arc<dyn ResponseChannel> = memory.clone();
    let mut session = ConnSession::new(channel, SessionRegistry::new()).with_max_payload(8);

    let mut header = BytesMut::new();
    header.put_u16(0xAA55);
    header.put_u8(1);
    header.put_u16(CommandType::Hello.code());
    header.put_u16(ModuleId::CORE.value());
    header.put_u32(1024);

    assert_eq!(
        session.feed(&header),
        SessionEvent::Rejected {
            reason: constants::ERR_HANDSHAKE_OVERSIZED
        }
    );
}

#[test]
fn test_empty_device_id_rejected() {
    let (mut session, _memory, registry) = session();

    assert_eq!(
        session.feed(&hello("")),
        SessionEvent::Rejected {
            reason: constants::ERR_HANDSHAKE_EMPTY_ID
        }
    );
    assert!(registry.is_empty());
}

#[test]
fn test_ready_forwards_verbatim() {
    let (mut session, memory, _registry) = session();
    session.feed(&hello("sensor-01"));
    memory.take();

    assert_eq!(
        session.feed(b"\x01\x02\x03"),
        SessionEvent::Forward(Bytes::from_static(b"\x01\x02\x03"))
    );
    assert!(memory.sent().is_empty());
}

#[test]
fn test_drop_unregisters_session() {
    let (mut session, _memory, registry) = session();
    session.feed(&hello("sensor-01"));
    assert_eq!(registry.len(), 1);

    drop(session);
    assert!(registry.is_empty());
}

#[test]
fn test_handshake_then_parser_pipeline() {
    let (mut session, memory, _registry) = session();
    let channel: Arc<dyn ResponseChannel> = memory.clone();
    let recorder = Arc::new(Recorder::default());
    let mut parser = FrameParser::new();
    parser.set_handler(recorder.clone());

    let first = Packet::build(CommandType::DataPush, ModuleId::TEST, &b"a"[..]);
    let second = Packet::build(CommandType::DataPush, ModuleId::TEST, &b"bc"[..]);

    let mut stream = BytesMut::new();
    stream.extend_from_slice(&hello("pipe"));
    stream.extend_from_slice(&first.to_bytes());
    let second_bytes = second.to_bytes();
    stream.extend_from_slice(&second_bytes[..4]);

    let SessionEvent::Established { leftover, .. } = session.feed(&stream) else {
        panic!("handshake should complete");
    };
    assert_eq!(parser.feed(&leftover, &channel).unwrap(), 1);
    assert_eq!(parser.buffered(), 4);

    let SessionEvent::Forward(rest) = session.feed(&second_bytes[4..]) else {
        panic!("ready session should forward");
    };
    assert_eq!(parser.feed(&rest, &channel).unwrap(), 1);

    assert_eq!(*recorder.packets.lock().unwrap(), vec![first, second]);
}

#[test]
fn test_parser_resyncs_past_corrupt_byte() {
    let channel: Arc<dyn ResponseChannel> = Arc::new(MemoryChannel::new());
    let recorder = Arc::new(Recorder::default());
    let mut parser = FrameParser::new();
    parser.set_handler(recorder.clone());

    let packet = Packet::build(CommandType::DataRequest, ModuleId::TEST, &b"payload"[..]);
    let mut stream = vec![0x13];
    stream.extend_from_slice(&packet.to_bytes());

    assert_eq!(parser.feed(&stream, &channel).unwrap(), 1);
    assert_eq!(parser.resyncs(), 1);
    assert_eq!(*recorder.packets.lock().unwrap(), vec![packet]);
}

#[test]
fn test_parser_without_handler_drops_packets() {
    let channel: Arc<dyn ResponseChannel> = Arc::new(MemoryChannel::new());
    let mut parser = FrameParser::new();

    let bytes = Packet::empty(CommandType::Ping, ModuleId::CORE).to_bytes();
    assert_eq!(parser.feed(&bytes, &channel).unwrap(), 1);
    assert_eq!(parser.buffered(), 0);
}

#[test]
fn test_parser_oversized_frame_is_error() {
    use crate::core::codec::AetherCodec;
    use crate::error::ProtocolError;

    let channel: Arc<dyn ResponseChannel> = Arc::new(MemoryChannel::new());
    let mut parser = FrameParser::with_codec(AetherCodec::with_max_payload(4));

    let bytes = Packet::build(CommandType::DataPush, ModuleId::TEST, vec![0u8; 16]).to_bytes();
    assert!(matches!(
        parser.feed(&bytes, &channel),
        Err(ProtocolError::OversizedPacket(16))
    ));
}
