use std::io;

use tracing::{debug, trace};
use zeroize::{Zeroize, Zeroizing};

use ssock_types::{SecurityError, SecurityStatus, SessionError};

use super::Decoded;
use crate::provider::SecurityProvider;
use crate::session::Session;
use crate::socket::RawSocket;

/// Move up to `out.len()` bytes from the front of `buffer` into `out`,
/// wiping the vacated tail.
fn take_front(buffer: &mut Zeroizing<Vec<u8>>, out: &mut [u8]) -> usize {
    let n = out.len().min(buffer.len());
    out[..n].copy_from_slice(&buffer[..n]);
    let len = buffer.len();
    buffer.copy_within(n.., 0);
    buffer[len - n..].zeroize();
    buffer.truncate(len - n);
    n
}

impl<S: RawSocket, P: SecurityProvider> Session<S, P> {
    /// Deliver up to `out.len()` bytes of decrypted application data.
    ///
    /// Plaintext left over from an earlier record is returned first without
    /// touching the socket. Otherwise ciphertext carried over from the last
    /// call is decrypted, reading from the socket only when no complete
    /// record is buffered. A handshake record from the peer runs a
    /// renegotiation before decoding continues.
    pub fn decrypt(&mut self, out: &mut [u8]) -> Result<Decoded, SessionError> {
        if !self.remaining_plaintext.is_empty() {
            let n = take_front(&mut self.remaining_plaintext, out);
            trace!(delivered = n, left = self.remaining_plaintext.len(), "buffered plaintext");
            return Ok(Decoded::data(n));
        }
        if out.is_empty() {
            return Ok(Decoded::data(0));
        }
        if self.peer_closed {
            return Ok(Decoded::ended());
        }
        let sizes = self
            .record_sizes
            .ok_or(SessionError::InvalidState("session not established"))?;

        let mut cipher = std::mem::take(&mut self.extra_data);
        let mut need_read = cipher.is_empty();
        loop {
            if need_read {
                if let Err(e) = self.read_ciphertext(&mut cipher, sizes.max_record_len()) {
                    // Whatever arrived so far stays queued for the next call.
                    self.extra_data = cipher;
                    return Err(e);
                }
            }

            let unwrapped = match self.context.as_mut() {
                Some(context) => self.provider.unwrap(context, &mut cipher),
                None => Err(SecurityError::ContextNotEstablished),
            };
            let unwrapped = match unwrapped {
                Ok(unwrapped) if unwrapped.extra <= cipher.len() => unwrapped,
                Ok(_) => return Err(self.decode_failure(&mut cipher, SecurityError::InternalError)),
                Err(e) => return Err(self.decode_failure(&mut cipher, e)),
            };
            let tail = cipher.len() - unwrapped.extra;

            match unwrapped.status {
                SecurityStatus::IncompleteMessage => need_read = true,
                SecurityStatus::ContextExpired => {
                    self.stash_extra(&cipher[tail..])?;
                    cipher.zeroize();
                    self.peer_closed = true;
                    debug!(role = ?self.role, "peer closed the session");
                    return Ok(Decoded::ended());
                }
                SecurityStatus::Renegotiate => {
                    debug!(role = ?self.role, "peer started a new handshake");
                    let token = cipher.split_off(tail);
                    cipher.zeroize();
                    self.negotiate(Some(token))?;
                    cipher = std::mem::take(&mut self.extra_data);
                    need_read = cipher.is_empty();
                }
                SecurityStatus::Ok | SecurityStatus::UntrustedPeer | SecurityStatus::ContinueNeeded => {
                    let data = unwrapped.data.unwrap_or(0..0);
                    if data.start > data.end || data.end > tail {
                        return Err(self.decode_failure(&mut cipher, SecurityError::InternalError));
                    }
                    self.stash_extra(&cipher[tail..])?;
                    if data.is_empty() {
                        // Empty record: keep going with whatever follows it.
                        cipher.zeroize();
                        cipher = std::mem::take(&mut self.extra_data);
                        need_read = cipher.is_empty();
                        continue;
                    }

                    let plaintext = &cipher[data];
                    let n = plaintext.len().min(out.len());
                    out[..n].copy_from_slice(&plaintext[..n]);
                    let overflow = &plaintext[n..];
                    let saved = self.remaining_plaintext.try_reserve(overflow.len());
                    if saved.is_ok() {
                        self.remaining_plaintext.extend_from_slice(overflow);
                    }
                    cipher.zeroize();
                    saved?;
                    trace!(delivered = n, left = self.remaining_plaintext.len(), "record decrypted");
                    return Ok(Decoded::data(n));
                }
            }
        }
    }

    /// Append one socket read to `cipher`.
    fn read_ciphertext(&mut self, cipher: &mut Vec<u8>, chunk: usize) -> Result<(), SessionError> {
        let socket = self.raw_socket()?;
        let start = cipher.len();
        cipher.try_reserve(chunk)?;
        cipher.resize(start + chunk, 0);
        loop {
            match socket.read(&mut cipher[start..]) {
                Ok(0) => {
                    cipher.truncate(start);
                    return Err(SessionError::Disconnected);
                }
                Ok(n) => {
                    cipher.truncate(start + n);
                    trace!(bytes = n, buffered = cipher.len(), "ciphertext received");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    cipher.truncate(start);
                    return Err(e.into());
                }
            }
        }
    }

    fn stash_extra(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        if !bytes.is_empty() {
            self.extra_data.try_reserve(bytes.len())?;
            self.extra_data.extend_from_slice(bytes);
        }
        Ok(())
    }

    fn decode_failure(&mut self, cipher: &mut Vec<u8>, error: SecurityError) -> SessionError {
        cipher.zeroize();
        debug!(role = ?self.role, %error, "record rejected");
        self.fail();
        SessionError::DecryptFailed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_front_shifts_rest() {
        let mut buffer = Zeroizing::new(b"abcdefghij".to_vec());
        let mut out = [0u8; 4];
        assert_eq!(take_front(&mut buffer, &mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(buffer.as_slice(), b"efghij");

        let mut out = [0u8; 16];
        assert_eq!(take_front(&mut buffer, &mut out), 6);
        assert_eq!(&out[..6], b"efghij");
        assert!(buffer.is_empty());
    }
}
