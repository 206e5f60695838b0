#![no_main]
use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;
use ssock_stream::provider::software::SoftwareCredential;
use ssock_stream::{CertifiedKey, Identity, Role, SecurityProvider, SoftwareProvider};

fn server() -> &'static (SoftwareProvider, SoftwareCredential) {
    static SERVER: OnceLock<(SoftwareProvider, SoftwareCredential)> = OnceLock::new();
    SERVER.get_or_init(|| {
        let provider = SoftwareProvider::default();
        let identity = Identity::Certified(CertifiedKey::self_signed("fuzz.test", false).unwrap());
        let credential = provider
            .acquire_credentials(Role::Server, Some(&identity), None)
            .unwrap();
        (provider, credential)
    })
}

fuzz_target!(|data: &[u8]| {
    let (provider, credential) = server();
    let mut context = None;
    let _ = provider.advance_handshake(Role::Server, credential, &mut context, data);
});
