//! TCP sockets.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use tracing::debug;

use super::{resolve, AddressFamily, RawSocket};
use crate::Role;

/// Readiness waits shorter than this are rounded up; a zero read timeout
/// means "block forever" to the OS.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Largest count `available()` reports.
pub const PEEK_LIMIT: usize = 0x10000;

/// A connected TCP stream.
pub struct TcpSocket {
    stream: TcpStream,
    peer: SocketAddr,
    role_hint: Role,
    blocking: bool,
    /// Scratch space for `available()`, allocated on first use.
    peek_buf: Vec<u8>,
}

impl fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpSocket")
            .field("peer", &self.peer)
            .field("role_hint", &self.role_hint)
            .field("blocking", &self.blocking)
            .finish_non_exhaustive()
    }
}

impl TcpSocket {
    /// Connect to `host:port` over the given address family.
    pub fn connect(host: &str, port: u16, family: AddressFamily) -> io::Result<Self> {
        let addr = resolve(host, port, family)?;
        debug!(%addr, "connecting");
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream, Role::Client)
    }

    /// Connect with an upper bound on how long the TCP handshake may take.
    pub fn connect_timeout(
        host: &str,
        port: u16,
        family: AddressFamily,
        timeout: Duration,
    ) -> io::Result<Self> {
        let addr = resolve(host, port, family)?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Self::from_stream(stream, Role::Client)
    }

    /// Wrap an already connected stream. `role_hint` records which side
    /// initiated the connection.
    pub fn from_stream(stream: TcpStream, role_hint: Role) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nonblocking(false)?;
        Ok(Self {
            stream,
            peer,
            role_hint,
            blocking: true,
            peek_buf: Vec::new(),
        })
    }

    pub fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        self.stream.set_nonblocking(!blocking)?;
        self.blocking = blocking;
        Ok(())
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.stream.set_nodelay(nodelay)
    }

    /// Number of bytes that can be read without blocking, capped at
    /// [`PEEK_LIMIT`]. A blocking socket is switched to non-blocking only
    /// for the duration of the peek.
    pub fn available(&mut self) -> io::Result<usize> {
        if self.peek_buf.is_empty() {
            self.peek_buf.try_reserve_exact(PEEK_LIMIT).map_err(|_| io::ErrorKind::OutOfMemory)?;
            self.peek_buf.resize(PEEK_LIMIT, 0);
        }
        if self.blocking {
            self.stream.set_nonblocking(true)?;
        }
        let result = self.stream.peek(&mut self.peek_buf);
        if self.blocking {
            self.stream.set_nonblocking(false)?;
        }
        match result {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Shut down both directions of the connection.
    pub fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    /// A handle that can shut the connection down from another thread,
    /// waking any blocked readiness wait.
    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        Ok(ShutdownHandle {
            stream: self.stream.try_clone()?,
        })
    }

    /// Address of the remote end.
    pub fn ip(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn port(&self) -> u16 {
        self.peer.port()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.peer)
    }

    /// `Client` for sockets created by `connect`, `Server` for accepted ones.
    pub fn role_hint(&self) -> Role {
        self.role_hint
    }

    fn restore_mode(&self) -> io::Result<()> {
        self.stream.set_read_timeout(None)?;
        self.stream.set_nonblocking(!self.blocking)
    }
}

impl RawSocket for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        self.stream.set_nonblocking(false)?;
        self.stream.set_read_timeout(Some(timeout.max(MIN_WAIT)))?;
        let mut byte = [0u8; 1];
        let result = self.stream.peek(&mut byte);
        self.restore_mode()?;
        match result {
            // Data or end of stream: the next read returns immediately.
            Ok(_) => Ok(true),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.shutdown()
    }
}

/// Out-of-band shutdown for a [`TcpSocket`] owned by someone else.
#[derive(Debug)]
pub struct ShutdownHandle {
    stream: TcpStream,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// A listening TCP socket.
#[derive(Debug)]
pub struct TcpListenerSocket {
    listener: TcpListener,
    family: AddressFamily,
    blocking: bool,
}

impl TcpListenerSocket {
    /// Listen on the wildcard address of `family`. Port 0 picks a free port.
    pub fn bind(port: u16, family: AddressFamily) -> io::Result<Self> {
        let ip = match family {
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self::bind_addr(SocketAddr::new(ip, port))
    }

    /// Listen on a specific local address.
    pub fn bind_addr(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        debug!(addr = %listener.local_addr()?, "listening");
        Ok(Self {
            listener,
            family: AddressFamily::of(&addr),
            blocking: true,
        })
    }

    /// Accept one connection. Returns `None` when the listener is
    /// non-blocking and nothing is pending.
    pub fn accept(&self) -> io::Result<Option<TcpSocket>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                debug!(%addr, "accepted connection");
                TcpSocket::from_stream(stream, Role::Server).map(Some)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        self.listener.set_nonblocking(!blocking)?;
        self.blocking = blocking;
        Ok(())
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }
}
