//! Secure-stream client command.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::time::Duration;

use ssock_stream::session::Session;
use ssock_stream::socket::{AddressFamily, RawSocket, TcpSocket};
use ssock_stream::{
    CertificateStore, Identity, SecureConnection, SecurityProvider, SessionConfig, SoftwareProvider,
};
use ssock_types::SessionError;

pub const DEFAULT_PORT: u16 = 4433;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUF_LEN: usize = 16 * 1024;

pub struct ClientOptions<'a> {
    pub connect: &'a str,
    pub family: AddressFamily,
    pub ca_file: Option<&'a str>,
    pub identity: Option<&'a str>,
    pub pass: Option<&'a str>,
    pub strict: bool,
    pub message: Option<&'a str>,
    pub quiet: bool,
}

pub fn run(opts: &ClientOptions<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let (host, port) = parse_connect(opts.connect)?;
    if !opts.quiet {
        eprintln!("Connecting to {host}:{port}...");
    }
    let socket = TcpSocket::connect_timeout(&host, port, opts.family, CONNECT_TIMEOUT)
        .map_err(|e| format!("cannot connect to {host}:{port}: {e}"))?;
    if !opts.quiet {
        eprintln!("Connected to {}", socket.peer_addr());
    }

    let mut store = CertificateStore::new();
    match opts.ca_file {
        Some(path) => {
            let count = store
                .add_trusted_file(Path::new(path))
                .map_err(|e| format!("cannot load CA file '{path}': {e}"))?;
            if count == 0 {
                return Err(format!("no certificates found in '{path}'").into());
            }
        }
        None if !opts.strict && !opts.quiet => {
            eprintln!("Warning: no --CAfile given, the server identity is not verified");
        }
        None => {}
    }

    let mut builder = SessionConfig::builder()
        .server_name(&host)
        .require_trusted_peer(opts.strict);
    if let Some(path) = opts.identity {
        builder = builder.identity(Identity::container(path, opts.pass.unwrap_or("")));
    }
    let mut session = Session::start(socket, SoftwareProvider::new(store), builder.build())?;
    if !opts.quiet {
        print_session_info(&session);
    }

    match opts.message {
        Some(message) => {
            let reply = exchange(&mut session, message.as_bytes())?;
            let mut stdout = io::stdout();
            stdout.write_all(&reply)?;
            stdout.write_all(b"\n")?;
        }
        None => interactive(&mut session)?,
    }

    let _ = session.shutdown();
    if !opts.quiet {
        eprintln!("Connection closed.");
    }
    Ok(())
}

/// Send stdin line by line, printing each reply.
fn interactive<S: RawSocket, P: SecurityProvider>(
    session: &mut Session<S, P>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = io::stdout();
    for line in io::stdin().lock().lines() {
        let mut line = line?;
        line.push('\n');
        let reply = exchange(session, line.as_bytes())?;
        if reply.is_empty() {
            break;
        }
        stdout.write_all(&reply)?;
        stdout.flush()?;
    }
    Ok(())
}

/// Write `message` and return the first reply. Empty when the peer closed.
pub(crate) fn exchange<S: RawSocket, P: SecurityProvider>(
    session: &mut Session<S, P>,
    message: &[u8],
) -> Result<Vec<u8>, SessionError> {
    session.write_all(message)?;
    let mut buf = vec![0u8; READ_BUF_LEN];
    let n = session.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
pub(crate) fn parse_connect(connect: &str) -> Result<(String, u16), String> {
    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| format!("invalid port in '{connect}'"))
    };
    if let Some(rest) = connect.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| format!("missing ']' in '{connect}'"))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(format!("unexpected '{tail}' after address")),
        };
        return Ok((host.to_string(), port));
    }
    match connect.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => Ok((connect.to_string(), DEFAULT_PORT)),
        Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
        None => Ok((connect.to_string(), DEFAULT_PORT)),
    }
}

pub(crate) fn print_session_info(conn: &dyn SecureConnection) {
    eprintln!("---");
    if let Some(cert) = conn.peer_certificate() {
        eprintln!("Peer certificate:");
        eprintln!("  Subject:     {}", cert.subject());
        eprintln!("  Issuer:      {}", cert.issuer());
        eprintln!("  Fingerprint: {}", cert.fingerprint());
    }
    if let Some(sizes) = conn.record_sizes() {
        eprintln!(
            "Record layout: header {} / message {} / trailer {}",
            sizes.header, sizes.max_message, sizes.trailer
        );
    }
    eprintln!("---");
}
