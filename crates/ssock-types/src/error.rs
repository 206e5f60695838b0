use std::collections::TryReserveError;
use std::io;

/// Non-failure status reported by a security provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityStatus {
    /// The step completed.
    Ok,
    /// The handshake produced a token and expects another round.
    ContinueNeeded,
    /// Not enough input to make progress; read more and retry.
    IncompleteMessage,
    /// The handshake completed but the peer identity could not be verified.
    UntrustedPeer,
    /// The peer closed the security context (close-notify).
    ContextExpired,
    /// The peer asked for a new handshake on the established context.
    Renegotiate,
}

impl SecurityStatus {
    /// Whether this status ends a handshake with an established context.
    pub fn is_complete(self) -> bool {
        matches!(self, SecurityStatus::Ok | SecurityStatus::UntrustedPeer)
    }
}

/// Failure codes reported by a security provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum SecurityError {
    #[error("invalid token")]
    InvalidToken,
    #[error("illegal message")]
    IllegalMessage,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("message out of sequence")]
    OutOfSequence,
    #[error("message altered")]
    MessageAltered,
    #[error("record exceeds the maximum message size")]
    RecordOverflow,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("no credentials available")]
    NoCredentials,
    #[error("peer certificate is malformed")]
    BadCertificate,
    #[error("peer signature verification failed")]
    BadSignature,
    #[error("peer identity could not be verified")]
    UntrustedPeer,
    #[error("security context not established")]
    ContextNotEstablished,
    #[error("fatal alert received: {0}")]
    AlertReceived(u8),
    #[error("internal provider error")]
    InternalError,
}

impl SecurityError {
    /// Numeric status code, stable across releases, for diagnostics.
    pub fn code(&self) -> u32 {
        match self {
            SecurityError::InvalidToken => 0x0001,
            SecurityError::IllegalMessage => 0x0002,
            SecurityError::UnsupportedVersion => 0x0003,
            SecurityError::OutOfSequence => 0x0004,
            SecurityError::MessageAltered => 0x0005,
            SecurityError::RecordOverflow => 0x0006,
            SecurityError::BufferTooSmall => 0x0007,
            SecurityError::NoCredentials => 0x0008,
            SecurityError::BadCertificate => 0x0009,
            SecurityError::BadSignature => 0x000A,
            SecurityError::UntrustedPeer => 0x000B,
            SecurityError::ContextNotEstablished => 0x000C,
            SecurityError::AlertReceived(desc) => 0x0100 | u32::from(*desc),
            SecurityError::InternalError => 0x00FF,
        }
    }
}

/// Errors surfaced by a secure-stream session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("operation would block")]
    WouldBlock,
    #[error("peer disconnected")]
    Disconnected,
    #[error("timed out waiting for the peer")]
    Timeout,
    #[error("handshake failed: {0} (code {code:#06x})", code = .0.code())]
    HandshakeFailed(SecurityError),
    #[error("record decryption failed: {0}")]
    DecryptFailed(SecurityError),
    #[error("record encryption failed: {0}")]
    EncryptFailed(SecurityError),
    #[error("certificate not found: {0}")]
    CertificateNotFound(String),
    #[error("invalid certificate: {0}")]
    CertificateInvalid(String),
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),
    #[error("partial write: {written} of {expected} bytes sent")]
    PartialWrite { written: usize, expected: usize },
    #[error("io error: {0}")]
    Io(io::Error),
}

impl SessionError {
    /// Whether the caller may simply retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::WouldBlock)
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => SessionError::WouldBlock,
            io::ErrorKind::TimedOut => SessionError::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero => SessionError::Disconnected,
            _ => SessionError::Io(e),
        }
    }
}

impl From<TryReserveError> for SessionError {
    fn from(_: TryReserveError) -> Self {
        SessionError::OutOfMemory
    }
}

impl From<SessionError> for io::Error {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Io(inner) => inner,
            SessionError::WouldBlock => io::ErrorKind::WouldBlock.into(),
            SessionError::Timeout => io::Error::new(io::ErrorKind::TimedOut, e),
            SessionError::Disconnected => io::Error::new(io::ErrorKind::ConnectionReset, e),
            SessionError::OutOfMemory => io::Error::new(io::ErrorKind::OutOfMemory, e),
            SessionError::DecryptFailed(_) => io::Error::new(io::ErrorKind::InvalidData, e),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}
