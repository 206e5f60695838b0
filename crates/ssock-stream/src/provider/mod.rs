//! Security context providers.
//!
//! A provider owns the cryptographic protocol. The session only moves
//! bytes: it feeds received handshake bytes to [`SecurityProvider::advance_handshake`],
//! writes the tokens it gets back, and hands complete ciphertext buffers to
//! [`SecurityProvider::unwrap`] / [`SecurityProvider::wrap`] for in-place
//! transformation.

pub mod software;

use std::ops::Range;

use ssock_types::{SecurityError, SecurityStatus, SessionError};

use crate::identity::{Certificate, Identity};
use crate::{RecordSizes, Role};

/// Result of one handshake round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeStep {
    pub status: SecurityStatus,
    /// Bytes to send to the peer, if any.
    pub token: Option<Vec<u8>>,
    /// Number of trailing input bytes the provider did not consume.
    pub extra: usize,
}

impl HandshakeStep {
    pub fn incomplete() -> Self {
        Self {
            status: SecurityStatus::IncompleteMessage,
            token: None,
            extra: 0,
        }
    }
}

/// Result of unwrapping a ciphertext buffer in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwrapped {
    pub status: SecurityStatus,
    /// Location of the decrypted payload inside the buffer.
    pub data: Option<Range<usize>>,
    /// Number of trailing buffer bytes that belong to later records.
    pub extra: usize,
}

impl Unwrapped {
    pub fn incomplete() -> Self {
        Self {
            status: SecurityStatus::IncompleteMessage,
            data: None,
            extra: 0,
        }
    }
}

/// The contract between a session and its security provider.
///
/// `Credential` and `Context` are owning handles: dropping them releases
/// whatever the provider allocated for them.
pub trait SecurityProvider {
    type Credential;
    type Context;

    /// Acquire the local credential for `role`.
    ///
    /// Identity resolution failures surface here, before any socket I/O.
    /// `target` is the peer name a client expects to talk to.
    fn acquire_credentials(
        &self,
        role: Role,
        identity: Option<&Identity>,
        target: Option<&str>,
    ) -> Result<Self::Credential, SessionError>;

    /// Advance the handshake with whatever bytes the peer has sent so far.
    ///
    /// `context` starts out `None`; the provider creates it on the first
    /// round that commits to a handshake.
    fn advance_handshake(
        &self,
        role: Role,
        credential: &Self::Credential,
        context: &mut Option<Self::Context>,
        input: &[u8],
    ) -> Result<HandshakeStep, SecurityError>;

    /// Record geometry of an established context.
    fn record_sizes(&self, context: &Self::Context) -> Result<RecordSizes, SecurityError>;

    /// Protect one record in place.
    ///
    /// `record` is `header + payload + trailer` long with the payload
    /// already in position; the provider fills in header and trailer.
    fn wrap(&self, context: &mut Self::Context, record: &mut [u8]) -> Result<(), SecurityError>;

    /// Decrypt the first record in `buf` in place.
    fn unwrap(&self, context: &mut Self::Context, buf: &mut [u8]) -> Result<Unwrapped, SecurityError>;

    /// Certificate presented by the remote end, if it sent one.
    fn peer_certificate(&self, context: &Self::Context) -> Option<Certificate>;

    /// Certificate the local end presents.
    fn local_certificate(&self, credential: &Self::Credential) -> Option<Certificate>;

    /// Token announcing an orderly close of the context.
    fn close_notify(&self, context: &mut Self::Context) -> Result<Vec<u8>, SecurityError>;

    /// Token asking the peer to start a new handshake.
    fn renegotiation_request(&self, context: &mut Self::Context) -> Result<Vec<u8>, SecurityError>;
}
