//! Secure sessions over a raw socket.

use std::io;

use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use ssock_types::SessionError;

use crate::config::SessionConfig;
use crate::identity::Certificate;
use crate::provider::SecurityProvider;
use crate::socket::RawSocket;
use crate::{RecordSizes, Role, SecureConnection, SessionStatus};

/// A byte stream over an owned socket, optionally secured by a security
/// context negotiated with the peer.
///
/// The session exclusively owns its socket, credential and context. All of
/// them are released exactly once, by [`Session::close`] or on drop.
pub struct Session<S: RawSocket, P: SecurityProvider> {
    pub(crate) socket: Option<S>,
    pub(crate) provider: P,
    pub(crate) config: SessionConfig,
    pub(crate) role: Role,
    pub(crate) secure: bool,
    pub(crate) context: Option<P::Context>,
    pub(crate) credential: Option<P::Credential>,
    /// `Some` exactly while a secured session is established.
    pub(crate) record_sizes: Option<RecordSizes>,
    /// Ciphertext received but not yet decrypted.
    pub(crate) extra_data: Vec<u8>,
    /// Plaintext decrypted but not yet delivered.
    pub(crate) remaining_plaintext: Zeroizing<Vec<u8>>,
    /// Sealed records the socket has not accepted yet.
    pub(crate) pending_ciphertext: Vec<u8>,
    pub(crate) peer_certificate: Option<Certificate>,
    pub(crate) peer_closed: bool,
    pub(crate) status: SessionStatus,
}

impl<S: RawSocket, P: SecurityProvider> Session<S, P> {
    /// Create an idle secure session. Call [`Session::handshake`] to
    /// negotiate the security context.
    pub fn new(socket: S, provider: P, config: SessionConfig) -> Self {
        Self {
            socket: Some(socket),
            provider,
            role: config.role,
            config,
            secure: true,
            context: None,
            credential: None,
            record_sizes: None,
            extra_data: Vec::new(),
            remaining_plaintext: Zeroizing::new(Vec::new()),
            pending_ciphertext: Vec::new(),
            peer_certificate: None,
            peer_closed: false,
            status: SessionStatus::Idle,
        }
    }

    /// Create a session and run the handshake to completion.
    pub fn start(socket: S, provider: P, config: SessionConfig) -> Result<Self, SessionError> {
        let mut session = Self::new(socket, provider, config);
        session.handshake()?;
        Ok(session)
    }

    /// A session that passes bytes through to the socket unprotected.
    pub fn plain(socket: S, provider: P) -> Self {
        let mut session = Self::new(socket, provider, SessionConfig::default());
        session.secure = false;
        session.status = SessionStatus::Established;
        session
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn record_sizes(&self) -> Option<RecordSizes> {
        self.record_sizes
    }

    /// The server's certificate: the peer's on a client, our own on a server.
    pub fn peer_certificate(&self) -> Option<&Certificate> {
        self.peer_certificate.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn context(&self) -> Option<&P::Context> {
        self.context.as_ref()
    }

    /// The underlying socket, until the session is closed.
    pub fn socket(&self) -> Option<&S> {
        self.socket.as_ref()
    }

    pub fn socket_mut(&mut self) -> Option<&mut S> {
        self.socket.as_mut()
    }

    /// Bytes of decrypted data that a `read` can return without touching
    /// the socket.
    pub fn buffered_plaintext(&self) -> usize {
        self.remaining_plaintext.len()
    }

    /// Whether the peer has closed its side with a close-notify.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Read up to `buf.len()` bytes of plaintext. `Ok(0)` means the peer
    /// closed the stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        self.ensure_established()?;
        if !self.secure {
            return Ok(self.raw_socket()?.read(buf)?);
        }
        Ok(self.decrypt(buf)?.delivered)
    }

    /// Write plaintext, returning how many bytes were accepted.
    ///
    /// On a non-blocking socket sealed records the socket could not take
    /// are queued and go out first on the next `write` or `flush`.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, SessionError> {
        self.ensure_established()?;
        if !self.secure {
            return Ok(self.raw_socket()?.write(buf)?);
        }
        self.encrypt_and_send(buf)
    }

    /// Write all of `buf`, then flush.
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<(), SessionError> {
        while !buf.is_empty() {
            match self.write(buf)? {
                0 => return Err(SessionError::Disconnected),
                n => buf = &buf[n..],
            }
        }
        self.flush()
    }

    /// Push queued records to the socket.
    pub fn flush(&mut self) -> Result<(), SessionError> {
        self.ensure_established()?;
        self.flush_pending()
    }

    /// Start a new handshake on the established context.
    ///
    /// A client renegotiates in place. A server only sends the request; the
    /// handshake runs inside a later `read` once the client answers.
    pub fn renegotiate(&mut self) -> Result<(), SessionError> {
        self.ensure_established()?;
        if !self.secure {
            return Err(SessionError::InvalidState("plaintext sessions cannot renegotiate"));
        }
        match self.role {
            Role::Client => self.negotiate(None),
            Role::Server => self.request_renegotiation(),
        }
    }

    /// Notify the peer, then close. The session is closed even when the
    /// notification fails.
    pub fn shutdown(&mut self) -> Result<(), SessionError> {
        if self.status == SessionStatus::Closed {
            return Ok(());
        }
        let result = if self.status == SessionStatus::Established && self.secure {
            self.send_close_notify()
        } else {
            Ok(())
        };
        self.release();
        result
    }

    /// Close the session and release everything it owns. Idempotent.
    pub fn close(&mut self) {
        if self.status == SessionStatus::Closed {
            return;
        }
        if self.status == SessionStatus::Established && self.secure {
            if let Err(e) = self.send_close_notify() {
                debug!(error = %e, "close notify not delivered");
            }
        }
        self.release();
    }

    fn release(&mut self) {
        self.context = None;
        self.credential = None;
        self.record_sizes = None;
        self.peer_certificate = None;
        self.extra_data.zeroize();
        self.remaining_plaintext.zeroize();
        self.pending_ciphertext.zeroize();
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close() {
                debug!(error = %e, "socket close failed");
            }
        }
        self.status = SessionStatus::Closed;
        debug!(role = ?self.role, "session closed");
    }

    /// Mark the session unusable and drop the security context.
    pub(crate) fn fail(&mut self) {
        self.status = SessionStatus::Failed;
        self.record_sizes = None;
        self.context = None;
        self.remaining_plaintext.zeroize();
    }

    pub(crate) fn ensure_established(&self) -> Result<(), SessionError> {
        match self.status {
            SessionStatus::Established => Ok(()),
            SessionStatus::Closed => Err(SessionError::InvalidState("session is closed")),
            SessionStatus::Failed => Err(SessionError::InvalidState("session has failed")),
            SessionStatus::Idle | SessionStatus::Negotiating => {
                Err(SessionError::InvalidState("handshake not complete"))
            }
        }
    }

    pub(crate) fn raw_socket(&mut self) -> Result<&mut S, SessionError> {
        self.socket
            .as_mut()
            .ok_or(SessionError::InvalidState("socket already released"))
    }
}

impl<S: RawSocket, P: SecurityProvider> Drop for Session<S, P> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: RawSocket, P: SecurityProvider> io::Read for Session<S, P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match Session::read(self, buf) {
            Ok(n) => Ok(n),
            Err(SessionError::Disconnected) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl<S: RawSocket, P: SecurityProvider> io::Write for Session<S, P> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(Session::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(Session::flush(self)?)
    }
}

impl<S: RawSocket, P: SecurityProvider> SecureConnection for Session<S, P> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        Session::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, SessionError> {
        Session::write(self, buf)
    }

    fn shutdown(&mut self) -> Result<(), SessionError> {
        Session::shutdown(self)
    }

    fn status(&self) -> SessionStatus {
        self.status
    }

    fn record_sizes(&self) -> Option<RecordSizes> {
        self.record_sizes
    }

    fn peer_certificate(&self) -> Option<&Certificate> {
        self.peer_certificate.as_ref()
    }
}

#[cfg(test)]
mod tests;
