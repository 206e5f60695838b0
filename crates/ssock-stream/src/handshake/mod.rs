//! Handshake engine.
//!
//! Drives a [`SecurityProvider`] through its handshake rounds over the
//! session's socket: bytes received from the peer accumulate in a bounded
//! buffer, every token the provider produces is written out in full, and
//! bytes that arrive past the end of the handshake are kept for the record
//! decoder.

use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use ssock_types::{SecurityError, SecurityStatus, SessionError};

use crate::provider::SecurityProvider;
use crate::session::Session;
use crate::socket::{write_until_blocked, RawSocket};
use crate::{Role, SessionStatus};

/// Longest single readiness wait; longer budgets are served in slices.
const MAX_WAIT_SLICE: Duration = Duration::from_secs(60);

/// Where the engine stands between provider rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Another round is needed. With `pending` set the buffered input is
    /// not enough and more bytes must be read first.
    Negotiating { pending: bool },
    /// The provider finished; input from `extra_start` on belongs to the
    /// record layer.
    Complete {
        status: SecurityStatus,
        extra_start: usize,
    },
}

impl<S: RawSocket, P: SecurityProvider> Session<S, P> {
    /// Acquire credentials and negotiate the security context.
    ///
    /// Identity problems are reported before any byte touches the socket.
    pub fn handshake(&mut self) -> Result<(), SessionError> {
        if self.status != SessionStatus::Idle {
            return Err(SessionError::InvalidState("handshake already performed"));
        }
        let credential = self.provider.acquire_credentials(
            self.role,
            self.config.identity.as_ref(),
            self.config.server_name.as_deref(),
        );
        match credential {
            Ok(credential) => self.credential = Some(credential),
            Err(e) => {
                warn!(role = ?self.role, error = %e, "credential acquisition failed");
                self.fail();
                return Err(e);
            }
        }
        self.negotiate(None)
    }

    /// Run handshake rounds until the provider reports completion.
    ///
    /// `initial_token` seeds the input buffer; the record decoder passes the
    /// handshake record that triggered a renegotiation. On any failure the
    /// session is marked failed and its context dropped.
    pub fn negotiate(&mut self, initial_token: Option<Vec<u8>>) -> Result<(), SessionError> {
        let renegotiation = self.context.is_some();
        if renegotiation {
            if let Err(e) = self.flush_pending() {
                self.fail();
                return Err(e);
            }
        }
        self.status = SessionStatus::Negotiating;
        self.record_sizes = None;
        debug!(role = ?self.role, renegotiation, "handshake started");

        match self.run_handshake(initial_token.unwrap_or_default()) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(role = ?self.role, error = %e, "handshake failed");
                self.fail();
                Err(e)
            }
        }
    }

    fn run_handshake(&mut self, initial: Vec<u8>) -> Result<(), SessionError> {
        let limit = self.config.handshake_buffer_size;
        let timeout = self.config.handshake_timeout;
        let mut input = Vec::new();
        input.try_reserve(limit.max(initial.len()))?;
        input.extend_from_slice(&initial);

        let mut state = HandshakeState::Negotiating { pending: false };
        loop {
            state = match state {
                HandshakeState::Negotiating { pending } => {
                    if pending {
                        self.receive_handshake_bytes(&mut input, limit, timeout)?;
                    }
                    self.handshake_round(&mut input)?
                }
                HandshakeState::Complete {
                    status,
                    extra_start,
                } => return self.complete_handshake(status, &input[extra_start..]),
            };
        }
    }

    /// One provider round over the buffered input.
    fn handshake_round(&mut self, input: &mut Vec<u8>) -> Result<HandshakeState, SessionError> {
        let credential = self
            .credential
            .as_ref()
            .ok_or(SessionError::InvalidState("no credential acquired"))?;
        let step = self
            .provider
            .advance_handshake(self.role, credential, &mut self.context, input)
            .map_err(SessionError::HandshakeFailed)?;
        trace!(status = ?step.status, extra = step.extra, buffered = input.len(), "handshake round");

        if let Some(token) = step.token.as_deref().filter(|t| !t.is_empty()) {
            self.send_token(token)?;
        }
        let consumed = input
            .len()
            .checked_sub(step.extra)
            .ok_or(SessionError::HandshakeFailed(SecurityError::InternalError))?;

        match step.status {
            SecurityStatus::IncompleteMessage => Ok(HandshakeState::Negotiating { pending: true }),
            SecurityStatus::ContinueNeeded => {
                input.drain(..consumed);
                Ok(HandshakeState::Negotiating {
                    pending: input.is_empty(),
                })
            }
            status @ (SecurityStatus::Ok | SecurityStatus::UntrustedPeer) => Ok(HandshakeState::Complete {
                status,
                extra_start: consumed,
            }),
            SecurityStatus::ContextExpired | SecurityStatus::Renegotiate => {
                Err(SessionError::HandshakeFailed(SecurityError::OutOfSequence))
            }
        }
    }

    /// Read more handshake bytes. Each call waits at most `timeout` for the
    /// peer; a timeout too large to represent as a deadline never expires.
    fn receive_handshake_bytes(
        &mut self,
        input: &mut Vec<u8>,
        limit: usize,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        if input.len() >= limit {
            return Err(SessionError::HandshakeFailed(SecurityError::BufferTooSmall));
        }
        let deadline = Instant::now().checked_add(timeout);
        let socket = self.raw_socket()?;
        loop {
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(SessionError::Timeout);
                    }
                    remaining.min(MAX_WAIT_SLICE)
                }
                None => MAX_WAIT_SLICE,
            };
            if !socket.wait_readable(wait)? {
                continue;
            }

            let start = input.len();
            input.resize(limit, 0);
            let result = socket.read(&mut input[start..]);
            match result {
                Ok(0) => {
                    input.truncate(start);
                    return Err(SessionError::Disconnected);
                }
                Ok(n) => {
                    input.truncate(start + n);
                    trace!(bytes = n, buffered = input.len(), "handshake bytes received");
                    return Ok(());
                }
                Err(e) => {
                    input.truncate(start);
                    match e.kind() {
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => {}
                        _ => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Write a handshake token in full.
    fn send_token(&mut self, token: &[u8]) -> Result<(), SessionError> {
        let socket = self.raw_socket()?;
        let written = write_until_blocked(socket, token)?;
        if written < token.len() {
            return Err(SessionError::PartialWrite {
                written,
                expected: token.len(),
            });
        }
        trace!(bytes = written, "handshake token sent");
        Ok(())
    }

    fn complete_handshake(&mut self, status: SecurityStatus, extra: &[u8]) -> Result<(), SessionError> {
        let trusted = status == SecurityStatus::Ok;
        if !trusted {
            if self.config.require_trusted_peer {
                return Err(SessionError::HandshakeFailed(SecurityError::UntrustedPeer));
            }
            warn!(role = ?self.role, "peer identity could not be verified, continuing");
        }

        let context = self
            .context
            .as_ref()
            .ok_or(SessionError::InvalidState("handshake finished without a context"))?;
        let sizes = self
            .provider
            .record_sizes(context)
            .map_err(SessionError::HandshakeFailed)?;
        let certificate = match self.role {
            Role::Client => self.provider.peer_certificate(context),
            Role::Server => self
                .credential
                .as_ref()
                .and_then(|credential| self.provider.local_certificate(credential)),
        };

        if !extra.is_empty() {
            self.extra_data.try_reserve(extra.len())?;
            self.extra_data.extend_from_slice(extra);
        }
        debug!(
            role = ?self.role,
            trusted,
            subject = certificate.as_ref().map(|c| c.subject()),
            carried = extra.len(),
            "handshake complete"
        );
        self.peer_certificate = certificate;
        self.record_sizes = Some(sizes);
        self.status = SessionStatus::Established;
        Ok(())
    }

    /// Ask the client to start a new handshake.
    pub(crate) fn request_renegotiation(&mut self) -> Result<(), SessionError> {
        let result = self.send_renegotiation_request();
        if result.is_err() {
            self.fail();
        }
        result
    }

    fn send_renegotiation_request(&mut self) -> Result<(), SessionError> {
        self.flush_pending()?;
        let context = self
            .context
            .as_mut()
            .ok_or(SessionError::InvalidState("no security context"))?;
        let token = self
            .provider
            .renegotiation_request(context)
            .map_err(SessionError::HandshakeFailed)?;
        self.send_token(&token)?;
        debug!("renegotiation requested");
        Ok(())
    }
}
