use std::io::Read as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::config::MIN_HANDSHAKE_BUFFER_SIZE;
use crate::identity::{CertificateStore, CertifiedKey, Identity};
use crate::provider::software::{SoftwareContext, SoftwareCredential, SoftwareProvider};
use crate::provider::{HandshakeStep, Unwrapped};
use crate::record::DecodeStatus;
use crate::socket::memory::{pair, MemorySocket};
use ssock_types::{SecurityError, SecurityStatus};

const SERVER_NAME: &str = "server.test";

type TestSession = Session<MemorySocket, SoftwareProvider>;

/// Client provider trusting a fresh root, and a leaf issued by that root.
fn trusted_setup() -> (SoftwareProvider, CertifiedKey) {
    let root = CertifiedKey::self_signed("Session Test Root", true).unwrap();
    let leaf = root.issue(SERVER_NAME, false).unwrap();
    let mut store = CertificateStore::new();
    store.add_trusted(root.certificate().clone());
    (SoftwareProvider::new(store), leaf)
}

fn server_config(leaf: CertifiedKey) -> SessionConfig {
    SessionConfig::server(Identity::Certified(leaf))
}

/// Handshake both ends over the given sockets, the server in a thread.
fn establish_over<P>(
    client_sock: MemorySocket,
    server_sock: MemorySocket,
    client_provider: P,
    server_provider: P,
    client_config: SessionConfig,
    server_config: SessionConfig,
) -> (Session<MemorySocket, P>, Session<MemorySocket, P>)
where
    P: SecurityProvider + Send + 'static,
    P::Credential: Send,
    P::Context: Send,
{
    let server = thread::spawn(move || Session::start(server_sock, server_provider, server_config));
    let client = Session::start(client_sock, client_provider, client_config).unwrap();
    let server = server.join().unwrap().unwrap();
    (client, server)
}

fn establish() -> (TestSession, TestSession) {
    let (client_sock, server_sock) = pair();
    let (provider, leaf) = trusted_setup();
    establish_over(
        client_sock,
        server_sock,
        provider,
        SoftwareProvider::default(),
        SessionConfig::client(SERVER_NAME),
        server_config(leaf),
    )
}

fn read_exactly(session: &mut TestSession, len: usize, chunk: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; chunk];
    while out.len() < len {
        let n = session.read(&mut buf).unwrap();
        assert_ne!(n, 0, "stream closed early");
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[test]
fn test_ping_pong_with_small_reads() {
    let (mut client, mut server) = establish();
    assert_eq!(client.status(), SessionStatus::Established);
    assert_eq!(server.status(), SessionStatus::Established);
    assert!(client.is_secure());
    assert_eq!(client.role(), Role::Client);
    assert_eq!(server.role(), Role::Server);

    assert_eq!(client.write(b"PING").unwrap(), 4);
    assert_eq!(read_exactly(&mut server, 4, 3), b"PING");

    server.write_all(b"PONG").unwrap();
    assert_eq!(read_exactly(&mut client, 4, 3), b"PONG");
}

#[test]
fn test_peer_certificate_names_the_server() {
    let (client, server) = establish();
    let sizes = client.record_sizes().unwrap();
    assert_eq!(sizes.header, 5);
    assert_eq!(sizes.trailer, 16);
    assert_eq!(sizes.max_message, 16384);
    assert_eq!(client.peer_certificate().unwrap().subject(), SERVER_NAME);
    // Both ends report the server's certificate.
    assert_eq!(server.peer_certificate().unwrap().subject(), SERVER_NAME);
}

#[test]
fn test_record_split_across_reads_needs_no_extra_socket_reads() {
    let (mut client, mut server) = establish();
    client.write(b"0123456789").unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(server.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"0123");
    assert_eq!(server.buffered_plaintext(), 6);
    let reads = server.socket().unwrap().read_calls();

    let mut buf = [0u8; 16];
    assert_eq!(server.read(&mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"456789");
    assert_eq!(server.socket().unwrap().read_calls(), reads);
}

#[test]
fn test_back_to_back_records_carry_over() {
    let (mut client, mut server) = establish();
    client.write(b"abc").unwrap();
    client.write(b"defg").unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(server.read(&mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"abc");
    assert!(!server.extra_data.is_empty());
    let reads = server.socket().unwrap().read_calls();

    assert_eq!(server.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"defg");
    assert_eq!(server.socket().unwrap().read_calls(), reads);
}

#[test]
fn test_large_write_is_split_into_records() {
    let (mut client, mut server) = establish();
    let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.len();

    let reader = thread::spawn(move || {
        let data = read_exactly(&mut server, expected, 5000);
        (server, data)
    });

    assert_eq!(client.write(&payload).unwrap(), payload.len());
    let (_server, data) = reader.join().unwrap();
    assert_eq!(data, payload);
}

#[test]
fn test_bytes_after_handshake_reach_the_decoder() {
    let (mut raw_client, server_sock) = pair();
    let (provider, leaf) = trusted_setup();
    let server = thread::spawn(move || Session::start(server_sock, SoftwareProvider::default(), server_config(leaf)));

    // Play the client by hand so the final handshake token and the first
    // record arrive in a single write.
    let credential = provider
        .acquire_credentials(Role::Client, None, Some(SERVER_NAME))
        .unwrap();
    let mut context = None;
    let hello = provider
        .advance_handshake(Role::Client, &credential, &mut context, &[])
        .unwrap();
    raw_client.write(&hello.token.unwrap()).unwrap();

    let mut received = Vec::new();
    let finished = loop {
        let mut buf = [0u8; 4096];
        let n = raw_client.read(&mut buf).unwrap();
        received.extend_from_slice(&buf[..n]);
        let step = provider
            .advance_handshake(Role::Client, &credential, &mut context, &received)
            .unwrap();
        if step.status != SecurityStatus::IncompleteMessage {
            break step;
        }
    };
    assert_eq!(finished.status, SecurityStatus::Ok);

    let context = context.as_mut().unwrap();
    let sizes = provider.record_sizes(context).unwrap();
    let mut record = vec![0u8; sizes.record_len(5)];
    record[sizes.header..sizes.header + 5].copy_from_slice(b"early");
    provider.wrap(context, &mut record).unwrap();

    let mut flight = finished.token.unwrap();
    flight.extend_from_slice(&record);
    raw_client.write(&flight).unwrap();

    let mut server = server.join().unwrap().unwrap();
    assert_eq!(server.extra_data.len(), record.len());
    let reads = server.socket().unwrap().read_calls();

    let mut buf = [0u8; 16];
    assert_eq!(server.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"early");
    assert_eq!(server.socket().unwrap().read_calls(), reads);
}

#[test]
fn test_handshake_survives_fragmented_reads() {
    let (mut client_sock, mut server_sock) = pair();
    client_sock.set_read_chunk(7);
    server_sock.set_read_chunk(3);
    let (provider, leaf) = trusted_setup();
    let (mut client, mut server) = establish_over(
        client_sock,
        server_sock,
        provider,
        SoftwareProvider::default(),
        SessionConfig::client(SERVER_NAME),
        server_config(leaf),
    );
    client.write_all(b"fragmented").unwrap();
    assert_eq!(read_exactly(&mut server, 10, 64), b"fragmented");
}

#[test]
fn test_handshake_timeout_fails_session() {
    let (_client_sock, server_sock) = pair();
    let (_, leaf) = trusted_setup();
    let config = SessionConfig::builder()
        .role(Role::Server)
        .identity(Identity::Certified(leaf))
        .handshake_timeout(Duration::from_millis(100))
        .build();
    let mut server = Session::new(server_sock, SoftwareProvider::default(), config);

    let started = Instant::now();
    let err = server.handshake().unwrap_err();
    assert!(matches!(err, SessionError::Timeout), "got {err:?}");
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(server.status(), SessionStatus::Failed);
    assert!(server.context().is_none());
    assert!(server.record_sizes().is_none());
}

#[test]
fn test_handshake_timeout_restarts_for_each_read() {
    let (mut raw_client, server_sock) = pair();
    let (provider, leaf) = trusted_setup();
    let config = SessionConfig::builder()
        .role(Role::Server)
        .identity(Identity::Certified(leaf))
        .handshake_timeout(Duration::from_millis(300))
        .build();
    let server = thread::spawn(move || Session::start(server_sock, SoftwareProvider::default(), config));

    let credential = provider
        .acquire_credentials(Role::Client, None, Some(SERVER_NAME))
        .unwrap();
    let mut context = None;
    let hello = provider
        .advance_handshake(Role::Client, &credential, &mut context, &[])
        .unwrap()
        .token
        .unwrap();

    // Every gap is under the timeout, the whole hello is well over it.
    let started = Instant::now();
    for fragment in hello.chunks(hello.len().div_ceil(3)) {
        thread::sleep(Duration::from_millis(150));
        raw_client.write(fragment).unwrap();
    }
    assert!(started.elapsed() > Duration::from_millis(300));

    let mut received = Vec::new();
    let finished = loop {
        let mut buf = [0u8; 4096];
        let n = raw_client.read(&mut buf).unwrap();
        assert_ne!(n, 0, "server gave up on a slow but live client");
        received.extend_from_slice(&buf[..n]);
        let step = provider
            .advance_handshake(Role::Client, &credential, &mut context, &received)
            .unwrap();
        if step.status != SecurityStatus::IncompleteMessage {
            break step;
        }
    };
    assert_eq!(finished.status, SecurityStatus::Ok);
    raw_client.write(&finished.token.unwrap()).unwrap();

    let server = server.join().unwrap().unwrap();
    assert_eq!(server.status(), SessionStatus::Established);
}

#[test]
fn test_unbounded_handshake_timeout() {
    let (client_sock, server_sock) = pair();
    let (provider, leaf) = trusted_setup();
    let client_config = SessionConfig::builder()
        .server_name(SERVER_NAME)
        .handshake_timeout(Duration::MAX)
        .build();
    let server_config = SessionConfig::builder()
        .role(Role::Server)
        .identity(Identity::Certified(leaf))
        .handshake_timeout(Duration::MAX)
        .build();
    let (mut client, mut server) = establish_over(
        client_sock,
        server_sock,
        provider,
        SoftwareProvider::default(),
        client_config,
        server_config,
    );
    assert_eq!(client.status(), SessionStatus::Established);
    client.write_all(b"ok").unwrap();
    assert_eq!(read_exactly(&mut server, 2, 8), b"ok");
}

#[test]
fn test_short_handshake_write_is_fatal() {
    let (client_sock, server_sock) = pair();
    // The peer's pipe holds less than a ClientHello.
    server_sock.set_capacity(16);
    let mut client = Session::new(client_sock, SoftwareProvider::default(), SessionConfig::client(SERVER_NAME));

    let err = client.handshake().unwrap_err();
    assert!(
        matches!(err, SessionError::PartialWrite { written: 16, expected } if expected > 16),
        "got {err:?}"
    );
    assert_eq!(client.status(), SessionStatus::Failed);
    assert!(client.context().is_none());
    assert!(client.record_sizes().is_none());
    assert_eq!(server_sock.available(), 16);
}

#[test]
fn test_handshake_write_error_is_fatal() {
    let (client_sock, server_sock) = pair();
    drop(server_sock);
    let mut client = Session::new(client_sock, SoftwareProvider::default(), SessionConfig::client(SERVER_NAME));

    assert!(matches!(client.handshake(), Err(SessionError::Disconnected)));
    assert_eq!(client.status(), SessionStatus::Failed);
    assert!(client.context().is_none());
}

#[test]
fn test_peer_disconnect_during_handshake() {
    let (client_sock, server_sock) = pair();
    let (_, leaf) = trusted_setup();
    drop(client_sock);
    let mut server = Session::new(server_sock, SoftwareProvider::default(), server_config(leaf));
    assert!(matches!(server.handshake(), Err(SessionError::Disconnected)));
    assert_eq!(server.status(), SessionStatus::Failed);
}

#[test]
fn test_oversized_handshake_exhausts_buffer() {
    let (mut client_sock, server_sock) = pair();
    let (_, leaf) = trusted_setup();
    let config = SessionConfig::builder()
        .role(Role::Server)
        .identity(Identity::Certified(leaf))
        .handshake_buffer_size(MIN_HANDSHAKE_BUFFER_SIZE)
        .build();

    // A handshake record announcing a body larger than the buffer.
    let mut flood = vec![22, 3, 3, 0x08, 0x00];
    flood.resize(MIN_HANDSHAKE_BUFFER_SIZE + 100, 0);
    client_sock.write(&flood).unwrap();

    let mut server = Session::new(server_sock, SoftwareProvider::default(), config);
    let err = server.handshake().unwrap_err();
    assert!(
        matches!(err, SessionError::HandshakeFailed(SecurityError::BufferTooSmall)),
        "got {err:?}"
    );
    assert_eq!(server.status(), SessionStatus::Failed);
}

#[test]
fn test_server_without_identity_fails_before_io() {
    let (client_sock, server_sock) = pair();
    let config = SessionConfig::builder().role(Role::Server).build();
    let err = Session::start(server_sock, SoftwareProvider::default(), config)
        .err()
        .unwrap();
    assert!(matches!(err, SessionError::CertificateNotFound(_)), "got {err:?}");
    assert_eq!(client_sock.available(), 0);
}

#[test]
fn test_unknown_subject_is_certificate_not_found() {
    let (_client_sock, server_sock) = pair();
    let config = SessionConfig::server(Identity::Subject("nobody".into()));
    let mut server = Session::new(server_sock, SoftwareProvider::default(), config);
    assert!(matches!(server.handshake(), Err(SessionError::CertificateNotFound(_))));
    assert_eq!(server.status(), SessionStatus::Failed);
    assert!(matches!(server.handshake(), Err(SessionError::InvalidState(_))));
}

#[test]
fn test_untrusted_peer_accepted_by_default() {
    let (client_sock, server_sock) = pair();
    let (_, leaf) = trusted_setup();
    let (mut client, mut server) = establish_over(
        client_sock,
        server_sock,
        SoftwareProvider::default(),
        SoftwareProvider::default(),
        SessionConfig::client(SERVER_NAME),
        server_config(leaf),
    );
    assert_eq!(client.status(), SessionStatus::Established);
    assert_eq!(client.peer_certificate().unwrap().subject(), SERVER_NAME);
    client.write_all(b"hi").unwrap();
    assert_eq!(read_exactly(&mut server, 2, 8), b"hi");
}

#[test]
fn test_untrusted_peer_rejected_when_required() {
    let (client_sock, server_sock) = pair();
    let (_, leaf) = trusted_setup();
    let server = thread::spawn(move || Session::start(server_sock, SoftwareProvider::default(), server_config(leaf)));

    let config = SessionConfig::builder()
        .server_name(SERVER_NAME)
        .require_trusted_peer(true)
        .build();
    let mut client = Session::new(client_sock, SoftwareProvider::default(), config);
    let err = client.handshake().unwrap_err();
    assert!(
        matches!(err, SessionError::HandshakeFailed(SecurityError::UntrustedPeer)),
        "got {err:?}"
    );
    assert_eq!(client.status(), SessionStatus::Failed);
    assert!(client.peer_certificate().is_none());
    drop(client);
    let _ = server.join().unwrap();
}

#[test]
fn test_tampered_record_fails_session() {
    let (mut client, mut server) = establish();
    let mut forged = vec![23, 3, 3, 0, 20];
    forged.extend_from_slice(&[0x5A; 20]);
    client.socket_mut().unwrap().write(&forged).unwrap();

    let mut buf = [0u8; 16];
    let err = server.read(&mut buf).unwrap_err();
    assert!(
        matches!(err, SessionError::DecryptFailed(SecurityError::MessageAltered)),
        "got {err:?}"
    );
    assert_eq!(server.status(), SessionStatus::Failed);
    assert!(server.record_sizes().is_none());
    assert!(matches!(server.read(&mut buf), Err(SessionError::InvalidState(_))));
}

#[test]
fn test_close_notify_ends_stream() {
    let (mut client, mut server) = establish();
    client.write_all(b"bye").unwrap();
    client.shutdown().unwrap();
    assert_eq!(client.status(), SessionStatus::Closed);

    assert_eq!(read_exactly(&mut server, 3, 8), b"bye");
    let mut buf = [0u8; 8];
    assert_eq!(server.read(&mut buf).unwrap(), 0);
    assert!(server.peer_closed());
    assert_eq!(server.decrypt(&mut buf).unwrap().status, DecodeStatus::SessionEnded);
}

#[test]
fn test_close_is_idempotent_and_blocks_io() {
    let (mut client, _server) = establish();
    client.close();
    client.close();
    assert_eq!(client.status(), SessionStatus::Closed);
    assert!(client.socket().is_none());
    assert!(client.context().is_none());
    assert!(matches!(client.write(b"x"), Err(SessionError::InvalidState(_))));
    assert!(client.shutdown().is_ok());
}

#[test]
fn test_io_before_handshake_is_invalid_state() {
    let (client_sock, _server_sock) = pair();
    let mut client = Session::new(client_sock, SoftwareProvider::default(), SessionConfig::default());
    assert_eq!(client.status(), SessionStatus::Idle);
    let mut buf = [0u8; 4];
    assert!(matches!(client.read(&mut buf), Err(SessionError::InvalidState(_))));
    assert!(matches!(client.write(b"x"), Err(SessionError::InvalidState(_))));
    assert!(matches!(client.renegotiate(), Err(SessionError::InvalidState(_))));
}

#[test]
fn test_plain_session_passes_bytes_through() {
    let (a, mut b) = pair();
    let mut session = Session::plain(a, SoftwareProvider::default());
    assert!(!session.is_secure());
    assert_eq!(session.status(), SessionStatus::Established);
    assert!(session.record_sizes().is_none());

    session.write_all(b"clear").unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(b.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"clear");

    b.write(b"back").unwrap();
    assert_eq!(session.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"back");
    assert!(matches!(session.renegotiate(), Err(SessionError::InvalidState(_))));
}

#[test]
fn test_io_traits_round_trip() {
    let (mut client, mut server) = establish();
    std::io::Write::write_all(&mut client, b"via std::io").unwrap();
    std::io::Write::flush(&mut client).unwrap();

    let mut buf = [0u8; 11];
    server.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"via std::io");

    client.shutdown().unwrap();
    let mut rest = Vec::new();
    server.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn test_io_write_reports_would_block_kind() {
    let (mut client, server) = establish();
    server.socket().unwrap().set_capacity(8);
    client.write(&[7u8; 100]).unwrap();
    let err = std::io::Write::write(&mut client, b"more").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
}

#[test]
fn test_blocked_write_queues_sealed_record() {
    let (mut client, mut server) = establish();
    server.socket().unwrap().set_capacity(8);

    let payload = [0x42u8; 100];
    assert_eq!(client.write(&payload).unwrap(), 100);
    assert!(!client.pending_ciphertext.is_empty());
    assert!(matches!(client.write(b"later"), Err(SessionError::WouldBlock)));
    assert_eq!(client.status(), SessionStatus::Established);

    let reader = thread::spawn(move || {
        let data = read_exactly(&mut server, 100, 256);
        (server, data)
    });
    loop {
        match client.flush() {
            Ok(()) => break,
            Err(SessionError::WouldBlock) => thread::sleep(Duration::from_millis(1)),
            Err(e) => panic!("flush failed: {e}"),
        }
    }
    let (_server, data) = reader.join().unwrap();
    assert_eq!(data, payload);
    assert!(client.pending_ciphertext.is_empty());
}

#[test]
fn test_client_renegotiation_keeps_buffered_plaintext() {
    let (mut client, mut server) = establish();
    server.write_all(b"0123456789").unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(client.read(&mut buf).unwrap(), 4);
    assert_eq!(client.buffered_plaintext(), 6);

    let server = thread::spawn(move || {
        let data = read_exactly(&mut server, 5, 16);
        (server, data)
    });
    client.renegotiate().unwrap();
    assert_eq!(client.status(), SessionStatus::Established);
    assert_eq!(client.buffered_plaintext(), 6);

    let mut buf = [0u8; 16];
    assert_eq!(client.read(&mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"456789");

    client.write_all(b"after").unwrap();
    let (server, data) = server.join().unwrap();
    assert_eq!(data, b"after");
    assert_eq!(client.context().unwrap().handshakes(), 2);
    assert_eq!(server.context().unwrap().handshakes(), 2);
}

#[test]
fn test_server_requested_renegotiation() {
    let (mut client, mut server) = establish();
    server.renegotiate().unwrap();

    let client = thread::spawn(move || {
        client.socket_mut().unwrap().set_blocking(false);
        let mut buf = [0u8; 16];
        // Runs the new handshake, then finds nothing else to read.
        let outcome = client.read(&mut buf);
        assert!(matches!(outcome, Err(SessionError::WouldBlock)), "got {outcome:?}");
        assert_eq!(client.context().unwrap().handshakes(), 2);
        client.write_all(b"renewed").unwrap();
        client
    });

    assert_eq!(read_exactly(&mut server, 7, 16), b"renewed");
    let client = client.join().unwrap();
    assert_eq!(client.status(), SessionStatus::Established);
    assert_eq!(server.context().unwrap().handshakes(), 2);
}

// ---------------------------------------------------------------------------
// Handle accounting
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Counters {
    credentials: Arc<AtomicUsize>,
    contexts: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

struct Counted<T> {
    inner: T,
    live: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

impl<T> Counted<T> {
    fn new(inner: T, live: &Arc<AtomicUsize>, releases: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            inner,
            live: Arc::clone(live),
            releases: Arc::clone(releases),
        }
    }
}

impl<T> Drop for Counted<T> {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Wraps the software provider and counts live handles.
struct CountingProvider {
    inner: SoftwareProvider,
    counters: Counters,
}

fn not_established() -> SecurityError {
    SecurityError::ContextNotEstablished
}

impl SecurityProvider for CountingProvider {
    type Credential = Counted<SoftwareCredential>;
    type Context = Counted<Option<SoftwareContext>>;

    fn acquire_credentials(
        &self,
        role: Role,
        identity: Option<&Identity>,
        target: Option<&str>,
    ) -> Result<Self::Credential, SessionError> {
        let credential = self.inner.acquire_credentials(role, identity, target)?;
        Ok(Counted::new(credential, &self.counters.credentials, &self.counters.releases))
    }

    fn advance_handshake(
        &self,
        role: Role,
        credential: &Self::Credential,
        context: &mut Option<Self::Context>,
        input: &[u8],
    ) -> Result<HandshakeStep, SecurityError> {
        let context = context
            .get_or_insert_with(|| Counted::new(None, &self.counters.contexts, &self.counters.releases));
        self.inner
            .advance_handshake(role, &credential.inner, &mut context.inner, input)
    }

    fn record_sizes(&self, context: &Self::Context) -> Result<RecordSizes, SecurityError> {
        self.inner
            .record_sizes(context.inner.as_ref().ok_or_else(not_established)?)
    }

    fn wrap(&self, context: &mut Self::Context, record: &mut [u8]) -> Result<(), SecurityError> {
        self.inner
            .wrap(context.inner.as_mut().ok_or_else(not_established)?, record)
    }

    fn unwrap(&self, context: &mut Self::Context, buf: &mut [u8]) -> Result<Unwrapped, SecurityError> {
        self.inner
            .unwrap(context.inner.as_mut().ok_or_else(not_established)?, buf)
    }

    fn peer_certificate(&self, context: &Self::Context) -> Option<Certificate> {
        context
            .inner
            .as_ref()
            .and_then(|ctx| self.inner.peer_certificate(ctx))
    }

    fn local_certificate(&self, credential: &Self::Credential) -> Option<Certificate> {
        self.inner.local_certificate(&credential.inner)
    }

    fn close_notify(&self, context: &mut Self::Context) -> Result<Vec<u8>, SecurityError> {
        self.inner
            .close_notify(context.inner.as_mut().ok_or_else(not_established)?)
    }

    fn renegotiation_request(&self, context: &mut Self::Context) -> Result<Vec<u8>, SecurityError> {
        self.inner
            .renegotiation_request(context.inner.as_mut().ok_or_else(not_established)?)
    }
}

#[test]
fn test_handles_released_exactly_once() {
    let counters = Counters::default();
    let (trusting, leaf) = trusted_setup();
    let (client_sock, server_sock) = pair();
    let (mut client, server) = establish_over(
        client_sock,
        server_sock,
        CountingProvider {
            inner: trusting,
            counters: counters.clone(),
        },
        CountingProvider {
            inner: SoftwareProvider::default(),
            counters: counters.clone(),
        },
        SessionConfig::client(SERVER_NAME),
        server_config(leaf),
    );
    assert_eq!(counters.credentials.load(Ordering::SeqCst), 2);
    assert_eq!(counters.contexts.load(Ordering::SeqCst), 2);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 0);

    client.close();
    client.close();
    assert_eq!(counters.credentials.load(Ordering::SeqCst), 1);
    assert_eq!(counters.contexts.load(Ordering::SeqCst), 1);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 2);

    drop(client);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 2);

    drop(server);
    assert_eq!(counters.credentials.load(Ordering::SeqCst), 0);
    assert_eq!(counters.contexts.load(Ordering::SeqCst), 0);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 4);
}

#[test]
fn test_failed_handshake_releases_context_once() {
    let counters = Counters::default();
    let (client_sock, server_sock) = pair();
    let (_, leaf) = trusted_setup();
    let server = thread::spawn(move || Session::start(server_sock, SoftwareProvider::default(), server_config(leaf)));

    let config = SessionConfig::builder()
        .server_name(SERVER_NAME)
        .require_trusted_peer(true)
        .build();
    let provider = CountingProvider {
        inner: SoftwareProvider::default(),
        counters: counters.clone(),
    };
    let mut client = Session::new(client_sock, provider, config);
    assert!(client.handshake().is_err());
    assert_eq!(counters.contexts.load(Ordering::SeqCst), 0);
    assert_eq!(counters.credentials.load(Ordering::SeqCst), 1);

    drop(client);
    assert_eq!(counters.credentials.load(Ordering::SeqCst), 0);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 2);
    let _ = server.join().unwrap();
}
