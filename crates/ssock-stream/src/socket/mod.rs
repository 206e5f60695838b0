//! Raw byte-stream sockets underneath a session.

pub mod memory;
pub mod tcp;

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

pub use memory::MemorySocket;
pub use tcp::{ShutdownHandle, TcpListenerSocket, TcpSocket};

/// A connected byte stream the session reads ciphertext from and writes
/// ciphertext to.
///
/// Implementations may be blocking or non-blocking; a non-blocking socket
/// reports `io::ErrorKind::WouldBlock`, which the session hands back to the
/// caller unchanged.
pub trait RawSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Wait up to `timeout` for the socket to become readable.
    ///
    /// Returns `Ok(true)` when a read would not block (including end of
    /// stream) and `Ok(false)` when the wait elapsed.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Close the socket. Further reads report end of stream.
    fn close(&mut self) -> io::Result<()>;
}

impl<T: RawSocket + ?Sized> RawSocket for Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        (**self).wait_readable(timeout)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Write as much of `buf` as the socket accepts.
///
/// Stops early only when the socket reports `WouldBlock`; the returned count
/// tells how far it got. A zero-length write is reported as `WriteZero`.
pub fn write_until_blocked<S: RawSocket + ?Sized>(socket: &mut S, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match socket.write(&buf[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(written),
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
}

const FAMILY_NAMES: [(AddressFamily, &str); 2] =
    [(AddressFamily::Ipv4, "ipv4"), (AddressFamily::Ipv6, "ipv6")];

impl AddressFamily {
    pub fn name(self) -> &'static str {
        FAMILY_NAMES
            .iter()
            .find(|(family, _)| *family == self)
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }

    /// Family of a concrete address.
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::Ipv4,
            SocketAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    fn matches_ip(self, ip: &IpAddr) -> bool {
        matches!(
            (self, ip),
            (AddressFamily::Ipv4, IpAddr::V4(_)) | (AddressFamily::Ipv6, IpAddr::V6(_))
        )
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FAMILY_NAMES
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(s))
            .map(|(family, _)| *family)
            .ok_or_else(|| format!("unknown address family '{s}' (expected ipv4 or ipv6)"))
    }
}

fn unresolved(host: &str, family: AddressFamily) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("could not resolve '{host}' to a valid {family} address"),
    )
}

/// Resolve `host` to an address of the requested family.
///
/// Numeric literals are accepted directly; anything else goes through the
/// system resolver and the first address of the right family wins.
pub fn resolve(host: &str, port: u16, family: AddressFamily) -> io::Result<SocketAddr> {
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        return if family.matches_ip(&ip) {
            Ok(SocketAddr::new(ip, port))
        } else {
            Err(unresolved(host, family))
        };
    }
    let candidates = (host, port).to_socket_addrs().map_err(|_| unresolved(host, family))?;
    candidates
        .into_iter()
        .find(|addr| family.matches_ip(&addr.ip()))
        .ok_or_else(|| unresolved(host, family))
}
