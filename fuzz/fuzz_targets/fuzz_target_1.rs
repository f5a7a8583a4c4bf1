#![no_main]

use aether::core::codec::AetherCodec;
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Decode until the buffer is exhausted or the codec gives up
    let mut codec = AetherCodec::with_max_payload(64 * 1024);
    let mut buf = BytesMut::from(data);

    while let Ok(Some(packet)) = codec.decode(&mut buf) {
        assert!(packet.payload().len() <= 64 * 1024);
    }
});
