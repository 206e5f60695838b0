use tracing::{debug, trace};
use zeroize::Zeroize;

use ssock_types::{SecurityError, SessionError};

use crate::provider::SecurityProvider;
use crate::session::Session;
use crate::socket::{write_until_blocked, RawSocket};

impl<S: RawSocket, P: SecurityProvider> Session<S, P> {
    /// Seal `plaintext` into records of at most `max_message` bytes each and
    /// send them, returning how many plaintext bytes were accepted.
    ///
    /// Records already sealed stay sealed: when the socket stops accepting
    /// bytes mid-record, the unsent ciphertext is queued and the whole chunk
    /// counts as accepted. `Err(WouldBlock)` is only returned when an
    /// earlier queue could not be drained, before anything new is sealed.
    pub fn encrypt_and_send(&mut self, plaintext: &[u8]) -> Result<usize, SessionError> {
        let sizes = self
            .record_sizes
            .ok_or(SessionError::InvalidState("session not established"))?;
        if sizes.max_message == 0 {
            self.fail();
            return Err(SessionError::EncryptFailed(SecurityError::BufferTooSmall));
        }
        self.flush_pending()?;

        let mut accepted = 0;
        let mut record = Vec::new();
        for chunk in plaintext.chunks(sizes.max_message) {
            let len = sizes.record_len(chunk.len());
            record.clear();
            if let Err(e) = record.try_reserve(len) {
                self.fail();
                return Err(e.into());
            }
            record.resize(sizes.header, 0);
            record.extend_from_slice(chunk);
            record.resize(len, 0);

            let wrapped = match self.context.as_mut() {
                Some(context) => self.provider.wrap(context, &mut record),
                None => Err(SecurityError::ContextNotEstablished),
            };
            if let Err(e) = wrapped {
                record.zeroize();
                debug!(role = ?self.role, error = %e, "record sealing failed");
                self.fail();
                return Err(SessionError::EncryptFailed(e));
            }
            accepted += chunk.len();

            match self.transmit(&record) {
                Ok(true) => trace!(payload = chunk.len(), record = len, "record sent"),
                Ok(false) => {
                    trace!(accepted, queued = self.pending_ciphertext.len(), "socket full");
                    return Ok(accepted);
                }
                Err(e) => {
                    self.fail();
                    return Err(e);
                }
            }
        }
        Ok(accepted)
    }

    /// Send a sealed record, queueing whatever the socket does not take.
    /// Returns whether the record went out in full.
    fn transmit(&mut self, record: &[u8]) -> Result<bool, SessionError> {
        let socket = self.raw_socket()?;
        let written = write_until_blocked(socket, record)?;
        if written == record.len() {
            return Ok(true);
        }
        let rest = &record[written..];
        self.pending_ciphertext.try_reserve(rest.len())?;
        self.pending_ciphertext.extend_from_slice(rest);
        Ok(false)
    }

    /// Drain queued ciphertext. `Err(WouldBlock)` if some remains.
    pub(crate) fn flush_pending(&mut self) -> Result<(), SessionError> {
        if self.pending_ciphertext.is_empty() {
            return Ok(());
        }
        let Some(socket) = self.socket.as_mut() else {
            return Err(SessionError::InvalidState("socket already released"));
        };
        let written = match write_until_blocked(socket, &self.pending_ciphertext) {
            Ok(written) => written,
            Err(e) => {
                self.fail();
                return Err(e.into());
            }
        };
        self.pending_ciphertext.drain(..written);
        trace!(written, left = self.pending_ciphertext.len(), "queued ciphertext flushed");
        if self.pending_ciphertext.is_empty() {
            Ok(())
        } else {
            Err(SessionError::WouldBlock)
        }
    }

    /// Flush queued records, then send the provider's close-notify token.
    pub(crate) fn send_close_notify(&mut self) -> Result<(), SessionError> {
        self.flush_pending()?;
        let context = self
            .context
            .as_mut()
            .ok_or(SessionError::InvalidState("no security context"))?;
        let token = self
            .provider
            .close_notify(context)
            .map_err(SessionError::EncryptFailed)?;
        let socket = self.raw_socket()?;
        let written = write_until_blocked(socket, &token)?;
        if written < token.len() {
            return Err(SessionError::PartialWrite {
                written,
                expected: token.len(),
            });
        }
        debug!(role = ?self.role, "close notify sent");
        Ok(())
    }
}
