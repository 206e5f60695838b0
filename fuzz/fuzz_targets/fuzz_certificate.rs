#![no_main]
use libfuzzer_sys::fuzz_target;
use ssock_stream::Certificate;

fuzz_target!(|data: &[u8]| {
    if let Ok(cert) = Certificate::from_bytes(data) {
        let _ = cert.is_self_signed();
        assert_eq!(Certificate::from_bytes(&cert.to_bytes()).ok(), Some(cert));
    }
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = Certificate::from_pem(text);
    }
});
