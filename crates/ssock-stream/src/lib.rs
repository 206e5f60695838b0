#![forbid(unsafe_code)]
#![doc = "Secure-stream session layer over raw byte-stream sockets."]

pub mod config;
pub mod handshake;
pub mod identity;
pub mod provider;
pub mod record;
pub mod session;
pub mod socket;

pub use config::SessionConfig;
pub use identity::{Certificate, CertificateStore, CertifiedKey, CredentialContainer, Identity};
pub use provider::software::SoftwareProvider;
pub use provider::SecurityProvider;
pub use session::Session;
pub use socket::RawSocket;
pub use ssock_types::{SecurityError, SecurityStatus, SessionError};

/// The role of a session endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    #[default]
    Client,
    Server,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Idle,
    Negotiating,
    Established,
    Failed,
    Closed,
}

/// Record geometry negotiated for an established security context.
///
/// Every record on the wire is `header` bytes, then at most `max_message`
/// bytes of protected payload, then `trailer` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSizes {
    pub header: usize,
    pub max_message: usize,
    pub trailer: usize,
}

impl RecordSizes {
    /// Total on-the-wire size of a record carrying `payload` bytes.
    pub fn record_len(&self, payload: usize) -> usize {
        self.header + payload + self.trailer
    }

    /// Size of the largest record the peer may send.
    pub fn max_record_len(&self) -> usize {
        self.record_len(self.max_message)
    }
}

/// A synchronous secured byte stream.
pub trait SecureConnection {
    /// Read decrypted data into `buf`; `Ok(0)` means the peer closed the stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError>;
    /// Encrypt and send data from `buf`.
    fn write(&mut self, buf: &[u8]) -> Result<usize, SessionError>;
    /// Notify the peer and close the stream.
    fn shutdown(&mut self) -> Result<(), SessionError>;
    /// Current lifecycle state.
    fn status(&self) -> SessionStatus;
    /// Negotiated record geometry, if established.
    fn record_sizes(&self) -> Option<RecordSizes>;
    /// Certificate identifying the session's server side.
    fn peer_certificate(&self) -> Option<&Certificate>;
}
