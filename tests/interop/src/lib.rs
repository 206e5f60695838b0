//! Integration tests for ssock.
//! TCP loopback sessions across the stream, identity and provider layers.

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::thread;
    use std::time::Duration;

    use ssock_stream::session::Session;
    use ssock_stream::socket::{AddressFamily, TcpListenerSocket, TcpSocket};
    use ssock_stream::{
        CertificateStore, CertifiedKey, Identity, SessionConfig, SoftwareProvider,
    };
    use ssock_types::SessionError;

    type TcpSession = Session<TcpSocket, SoftwareProvider>;

    /// A root CA and a `localhost` server certificate it issued.
    fn make_pki() -> (CertifiedKey, CertifiedKey) {
        let root = CertifiedKey::self_signed("Interop Root", true).unwrap();
        let server = root.issue("localhost", false).unwrap();
        (root, server)
    }

    fn listen() -> (TcpListenerSocket, u16) {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListenerSocket::bind_addr(addr).unwrap();
        let port = listener.local_port().unwrap();
        (listener, port)
    }

    fn accept_session(listener: &TcpListenerSocket, identity: Identity) -> TcpSession {
        let socket = listener.accept().unwrap().unwrap();
        Session::start(socket, SoftwareProvider::default(), SessionConfig::server(identity)).unwrap()
    }

    fn connect_session(port: u16, root: &CertifiedKey) -> TcpSession {
        let mut store = CertificateStore::new();
        store.add_trusted(root.certificate().clone());
        let config = SessionConfig::builder()
            .server_name("localhost")
            .require_trusted_peer(true)
            .build();
        let socket = TcpSocket::connect("127.0.0.1", port, AddressFamily::Ipv4).unwrap();
        Session::start(socket, SoftwareProvider::new(store), config).unwrap()
    }

    fn read_exactly(session: &mut TcpSession, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut buf = vec![0u8; 4096];
        while out.len() < len {
            let n = session.read(&mut buf).unwrap();
            assert!(n > 0, "stream ended after {} of {len} bytes", out.len());
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    // -------------------------------------------------------
    // 1. TCP loopback: CA-issued server, strict client
    // -------------------------------------------------------
    #[test]
    fn test_tcp_loopback_ping_pong() {
        let (root, server_key) = make_pki();
        let (listener, port) = listen();

        let server_handle = thread::spawn(move || {
            let mut conn = accept_session(&listener, Identity::Certified(server_key));
            let mut buf = [0u8; 256];
            let n = conn.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"Hello from client!");
            conn.write_all(b"Hello from server!").unwrap();
            conn.shutdown().unwrap();
        });

        let mut conn = connect_session(port, &root);
        let peer = conn.peer_certificate().unwrap();
        assert_eq!(peer.subject(), "localhost");
        assert!(peer.is_issued_by(root.certificate()));

        conn.write_all(b"Hello from client!").unwrap();
        let mut buf = [0u8; 256];
        let n = conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Hello from server!");

        // Close-notify from the server ends the stream cleanly.
        assert_eq!(conn.read(&mut buf).unwrap(), 0);
        assert_eq!(conn.read(&mut buf).unwrap(), 0);
        conn.shutdown().ok();
        server_handle.join().unwrap();
    }

    // -------------------------------------------------------
    // 2. TCP loopback: 1 MiB upload, small reads
    // -------------------------------------------------------
    #[test]
    fn test_tcp_large_transfer() {
        const LEN: usize = 1 << 20;
        let (root, server_key) = make_pki();
        let (listener, port) = listen();
        let payload: Vec<u8> = (0..LEN).map(|i| (i * 31 % 251) as u8).collect();
        let expected = payload.clone();

        let server_handle = thread::spawn(move || {
            let mut conn = accept_session(&listener, Identity::Certified(server_key));
            let received = read_exactly(&mut conn, LEN);
            assert!(received == expected, "payload corrupted in transit");
            conn.write_all(&(received.len() as u64).to_be_bytes()).unwrap();
            conn.shutdown().unwrap();
        });

        let mut conn = connect_session(port, &root);
        conn.write_all(&payload).unwrap();
        let ack = read_exactly(&mut conn, 8);
        assert_eq!(u64::from_be_bytes(ack.try_into().unwrap()), LEN as u64);
        conn.shutdown().ok();
        server_handle.join().unwrap();
    }

    // -------------------------------------------------------
    // 3. TCP loopback: many messages of mixed size, echoed
    // -------------------------------------------------------
    #[test]
    fn test_tcp_echo_mixed_sizes() {
        let (root, server_key) = make_pki();
        let (listener, port) = listen();
        let sizes = [1usize, 17, 1000, 16 * 1024, 16 * 1024 + 1, 40_000, 3];

        let server_handle = thread::spawn(move || {
            let mut conn = accept_session(&listener, Identity::Certified(server_key));
            let mut buf = vec![0u8; 8192];
            loop {
                match conn.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => conn.write_all(&buf[..n]).unwrap(),
                    Err(e) => panic!("server read failed: {e}"),
                }
            }
        });

        let mut conn = connect_session(port, &root);
        for (i, size) in sizes.iter().enumerate() {
            let message = vec![i as u8 + 1; *size];
            conn.write_all(&message).unwrap();
            assert_eq!(read_exactly(&mut conn, *size), message, "message {i}");
        }
        conn.shutdown().unwrap();
        server_handle.join().unwrap();
    }

    // -------------------------------------------------------
    // 4. Server identity from a sealed container file
    // -------------------------------------------------------
    #[test]
    fn test_tcp_container_identity() {
        use ssock_stream::CredentialContainer;

        let (root, server_key) = make_pki();
        let path = std::env::temp_dir().join(format!("ssock-interop-{}.ssc", std::process::id()));
        let mut container = CredentialContainer::new();
        container.push_identity(&server_key);
        container.push_certificate(root.certificate().clone());
        container.save_with_iterations(&path, "interop", 64).unwrap();

        let (listener, port) = listen();
        let identity = Identity::container(path.clone(), "interop");
        let server_handle = thread::spawn(move || {
            let mut conn = accept_session(&listener, identity);
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            conn.write_all(&buf[..n]).unwrap();
            conn.shutdown().unwrap();
        });

        let mut conn = connect_session(port, &root);
        assert_eq!(
            conn.peer_certificate().unwrap().fingerprint(),
            server_key.certificate().fingerprint()
        );
        conn.write_all(b"sealed").unwrap();
        assert_eq!(read_exactly(&mut conn, 6), b"sealed");
        conn.shutdown().ok();
        server_handle.join().unwrap();
        std::fs::remove_file(&path).ok();
    }

    // -------------------------------------------------------
    // 5. Strict client refuses a server outside its trust store
    // -------------------------------------------------------
    #[test]
    fn test_tcp_untrusted_server_rejected() {
        use ssock_types::SecurityError;

        let (root, _) = make_pki();
        let rogue = CertifiedKey::self_signed("localhost", false).unwrap();
        let (listener, port) = listen();

        let server_handle = thread::spawn(move || {
            let socket = listener.accept().unwrap().unwrap();
            // The client drops the connection once it sees the certificate.
            let result = Session::start(
                socket,
                SoftwareProvider::default(),
                SessionConfig::server(Identity::Certified(rogue)),
            );
            if let Ok(mut conn) = result {
                let mut buf = [0u8; 16];
                let _ = conn.read(&mut buf);
            }
        });

        let mut store = CertificateStore::new();
        store.add_trusted(root.certificate().clone());
        let config = SessionConfig::builder()
            .server_name("localhost")
            .require_trusted_peer(true)
            .build();
        let socket = TcpSocket::connect("127.0.0.1", port, AddressFamily::Ipv4).unwrap();
        let err = Session::start(socket, SoftwareProvider::new(store), config).err().unwrap();
        assert!(matches!(
            err,
            SessionError::HandshakeFailed(SecurityError::UntrustedPeer)
        ));
        server_handle.join().unwrap();
    }

    // -------------------------------------------------------
    // 6. Handshake timeout against a silent server
    // -------------------------------------------------------
    #[test]
    fn test_tcp_handshake_timeout() {
        use std::time::Instant;

        let (root, _) = make_pki();
        let (listener, port) = listen();
        let server_handle = thread::spawn(move || {
            let socket = listener.accept().unwrap().unwrap();
            thread::sleep(Duration::from_millis(800));
            drop(socket);
        });

        let mut store = CertificateStore::new();
        store.add_trusted(root.certificate().clone());
        let config = SessionConfig::builder()
            .server_name("localhost")
            .handshake_timeout(Duration::from_millis(200))
            .build();
        let socket = TcpSocket::connect("127.0.0.1", port, AddressFamily::Ipv4).unwrap();
        let start = Instant::now();
        let err = Session::start(socket, SoftwareProvider::new(store), config).err().unwrap();
        assert!(matches!(err, SessionError::Timeout), "got {err:?}");
        assert!(start.elapsed() < Duration::from_millis(700));
        server_handle.join().unwrap();
    }

    // -------------------------------------------------------
    // 7. Shutdown handle wakes a blocked handshake
    // -------------------------------------------------------
    #[test]
    fn test_tcp_shutdown_handle_unblocks_handshake() {
        use std::time::Instant;

        let (root, _) = make_pki();
        let (listener, port) = listen();
        let server_handle = thread::spawn(move || {
            let socket = listener.accept().unwrap().unwrap();
            thread::sleep(Duration::from_secs(2));
            drop(socket);
        });

        let mut store = CertificateStore::new();
        store.add_trusted(root.certificate().clone());
        let socket = TcpSocket::connect("127.0.0.1", port, AddressFamily::Ipv4).unwrap();
        let handle = socket.shutdown_handle().unwrap();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            handle.shutdown().unwrap();
        });

        let start = Instant::now();
        let result = Session::start(
            socket,
            SoftwareProvider::new(store),
            SessionConfig::client("localhost"),
        );
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(2));
        waker.join().unwrap();
        server_handle.join().unwrap();
    }

    // -------------------------------------------------------
    // 8. Client-initiated renegotiation mid-stream
    // -------------------------------------------------------
    #[test]
    fn test_tcp_client_renegotiation() {
        let (root, server_key) = make_pki();
        let (listener, port) = listen();

        let server_handle = thread::spawn(move || {
            let mut conn = accept_session(&listener, Identity::Certified(server_key));
            let mut buf = [0u8; 64];
            // The second read runs the new handshake before returning data.
            for expected in [&b"before"[..], &b"after"[..]] {
                let n = conn.read(&mut buf).unwrap();
                assert_eq!(&buf[..n], expected);
                conn.write_all(&buf[..n]).unwrap();
            }
            assert_eq!(conn.read(&mut buf).unwrap(), 0);
        });

        let mut conn = connect_session(port, &root);
        conn.write_all(b"before").unwrap();
        assert_eq!(read_exactly(&mut conn, 6), b"before");

        conn.renegotiate().unwrap();
        assert!(conn.record_sizes().is_some());

        conn.write_all(b"after").unwrap();
        assert_eq!(read_exactly(&mut conn, 5), b"after");
        conn.shutdown().unwrap();
        server_handle.join().unwrap();
    }
}
