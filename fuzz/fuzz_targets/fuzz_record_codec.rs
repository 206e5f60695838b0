#![no_main]
use libfuzzer_sys::fuzz_target;
use ssock_stream::provider::software::codec;

fuzz_target!(|data: &[u8]| {
    if let Ok(Some(header)) = codec::parse_record_header(data) {
        let _ = header.record_len();
    }
    if let Ok(Some(message)) = codec::parse_handshake(data) {
        let _ = codec::ClientHello::decode(message.body);
        let _ = codec::ServerHello::decode(message.body);
        let _ = codec::ClientFinished::decode(message.body);
    }
});
