use std::sync::Arc;

use aether::core::codec::AetherCodec;
use aether::core::command::CommandType;
use aether::core::packet::{ModuleId, Packet};
use aether::protocol::channel::{MemoryChannel, ResponseChannel};
use aether::protocol::parser::FrameParser;
use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use tokio_util::codec::{Decoder, Encoder};

#[allow(clippy::unwrap_used)]
fn bench_packet_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_encode_decode");
    let payload_sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &payload_sizes {
        let packet = Packet::build(CommandType::DataPush, ModuleId::TELEMETRY, vec![0u8; size]);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter_batched(
                || packet.clone(),
                |p| {
                    let mut buf = BytesMut::with_capacity(p.encoded_len());
                    let mut codec = AetherCodec::new();
                    codec.encode(p, &mut buf).unwrap();
                    buf
                },
                BatchSize::SmallInput,
            )
        });

        let wire = packet.to_bytes();
        group.bench_function(format!("decode_{size}b"), |b| {
            b.iter_batched(
                || BytesMut::from(&wire[..]),
                |mut buf| {
                    let mut codec = AetherCodec::new();
                    let decoded = codec.decode(&mut buf).unwrap();
                    assert!(decoded.is_some());
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

/// Many small frames delivered in socket-sized chunks, with no handler attached.
#[allow(clippy::unwrap_used)]
fn bench_parser_chunked(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_parser");

    let mut stream = Vec::new();
    for i in 0..1000u32 {
        let packet = Packet::build(CommandType::Ping, ModuleId::CORE, i.to_be_bytes().to_vec());
        stream.extend_from_slice(&packet.to_bytes());
    }
    group.throughput(Throughput::Bytes(stream.len() as u64));

    let channel: Arc<dyn ResponseChannel> = Arc::new(MemoryChannel::new());
    for chunk_size in [1usize, 64, 1024] {
        group.bench_function(format!("1000_pings_{chunk_size}b_chunks"), |b| {
            b.iter(|| {
                let mut parser = FrameParser::new();
                let mut decoded = 0;
                for chunk in stream.chunks(chunk_size) {
                    decoded += parser.feed(chunk, &channel).unwrap();
                }
                assert_eq!(decoded, 1000);
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_packet_encode_decode, bench_parser_chunked);
criterion_main!(benches);
