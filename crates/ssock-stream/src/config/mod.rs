//! Session configuration.

use std::fmt;
use std::time::Duration;

use crate::identity::Identity;
use crate::Role;

/// How long a handshake waits for the peer before giving up.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Size of the handshake accumulation buffer.
pub const DEFAULT_HANDSHAKE_BUFFER_SIZE: usize = 0x10000;

/// Smallest accepted handshake buffer; anything smaller cannot hold a
/// server hello.
pub const MIN_HANDSHAKE_BUFFER_SIZE: usize = 1024;

/// Configuration for a secure session.
#[derive(Clone)]
pub struct SessionConfig {
    pub role: Role,
    /// Local identity; required for servers, optional for clients.
    pub identity: Option<Identity>,
    /// Name the client expects the server certificate to carry.
    pub server_name: Option<String>,
    pub handshake_timeout: Duration,
    pub handshake_buffer_size: usize,
    /// Fail the handshake when the peer identity cannot be verified,
    /// instead of continuing with a warning.
    pub require_trusted_peer: bool,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("role", &self.role)
            .field("identity", &self.identity)
            .field("server_name", &self.server_name)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("require_trusted_peer", &self.require_trusted_peer)
            .finish_non_exhaustive()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfigBuilder::default().build()
    }
}

impl SessionConfig {
    /// Create a builder for session configuration.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Client configuration that verifies the server name.
    pub fn client(server_name: &str) -> Self {
        Self::builder().server_name(server_name).build()
    }

    /// Server configuration presenting `identity`.
    pub fn server(identity: Identity) -> Self {
        Self::builder().role(Role::Server).identity(identity).build()
    }
}

/// Builder for `SessionConfig`.
#[derive(Debug)]
pub struct SessionConfigBuilder {
    role: Role,
    identity: Option<Identity>,
    server_name: Option<String>,
    handshake_timeout: Duration,
    handshake_buffer_size: usize,
    require_trusted_peer: bool,
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self {
            role: Role::Client,
            identity: None,
            server_name: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            handshake_buffer_size: DEFAULT_HANDSHAKE_BUFFER_SIZE,
            require_trusted_peer: false,
        }
    }
}

impl SessionConfigBuilder {
    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn server_name(mut self, name: &str) -> Self {
        self.server_name = Some(name.to_string());
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Clamped to at least [`MIN_HANDSHAKE_BUFFER_SIZE`].
    pub fn handshake_buffer_size(mut self, size: usize) -> Self {
        self.handshake_buffer_size = size.max(MIN_HANDSHAKE_BUFFER_SIZE);
        self
    }

    pub fn require_trusted_peer(mut self, required: bool) -> Self {
        self.require_trusted_peer = required;
        self
    }

    pub fn build(self) -> SessionConfig {
        SessionConfig {
            role: self.role,
            identity: self.identity,
            server_name: self.server_name,
            handshake_timeout: self.handshake_timeout,
            handshake_buffer_size: self.handshake_buffer_size,
            require_trusted_peer: self.require_trusted_peer,
        }
    }
}
