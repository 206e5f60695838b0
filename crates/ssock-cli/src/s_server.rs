//! Secure-stream echo server command.

use std::path::Path;

use ssock_stream::session::Session;
use ssock_stream::socket::{AddressFamily, TcpListenerSocket, TcpSocket};
use ssock_stream::{CertifiedKey, CredentialContainer, Identity, SessionConfig, SoftwareProvider};
use ssock_types::SessionError;

use crate::s_client::print_session_info;

pub struct ServerOptions<'a> {
    pub port: u16,
    pub family: AddressFamily,
    pub identity: &'a str,
    pub pass: &'a str,
    pub once: bool,
    pub quiet: bool,
}

pub fn run(opts: &ServerOptions<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let identity = CredentialContainer::open(Path::new(opts.identity), opts.pass)
        .map_err(|e| format!("cannot load identity '{}': {e}", opts.identity))?;
    let listener = TcpListenerSocket::bind(opts.port, opts.family)
        .map_err(|e| format!("cannot bind to port {}: {e}", opts.port))?;
    if !opts.quiet {
        eprintln!(
            "Listening on port {} ({}) as '{}'",
            listener.local_port()?,
            opts.family.name(),
            identity.certificate().subject()
        );
        eprintln!("Press Ctrl+C to stop.");
    }
    serve(&listener, &identity, opts.once, opts.quiet)
}

/// Accept connections and echo them back, one at a time.
pub(crate) fn serve(
    listener: &TcpListenerSocket,
    identity: &CertifiedKey,
    once: bool,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let provider = SoftwareProvider::default();
    loop {
        let socket = match listener.accept() {
            Ok(Some(socket)) => socket,
            Ok(None) => continue,
            Err(e) => {
                if once {
                    return Err(e.into());
                }
                eprintln!("Accept error: {e}");
                continue;
            }
        };
        if !quiet {
            eprintln!("Accepted connection from {}", socket.peer_addr());
        }

        let config = SessionConfig::server(Identity::Certified(identity.clone()));
        let result = handle_connection(socket, provider.clone(), config, quiet);
        match &result {
            Ok(()) if !quiet => eprintln!("Connection closed."),
            Ok(()) => {}
            Err(e) => eprintln!("Connection error: {e}"),
        }
        if once {
            return result.map_err(Into::into);
        }
    }
}

fn handle_connection(
    socket: TcpSocket,
    provider: SoftwareProvider,
    config: SessionConfig,
    quiet: bool,
) -> Result<(), SessionError> {
    let mut session = Session::start(socket, provider, config)?;
    if !quiet {
        print_session_info(&session);
    }

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = match session.read(&mut buf) {
            Ok(0) | Err(SessionError::Disconnected) => break,
            Ok(n) => n,
            Err(e) => return Err(e),
        };
        if !quiet {
            eprint!("{}", String::from_utf8_lossy(&buf[..n]));
        }
        session.write_all(&buf[..n])?;
    }
    let _ = session.shutdown();
    Ok(())
}
