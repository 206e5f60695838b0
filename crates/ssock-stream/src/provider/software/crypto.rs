//! Key schedule and record protection for the software provider.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use ssock_types::SecurityError;

use super::codec::{MAC_LEN, RECORD_HEADER_LEN, TAG_LEN};

const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;

const LABEL_CLIENT_KEY: &[u8] = b"ssock c2s key";
const LABEL_CLIENT_IV: &[u8] = b"ssock c2s iv";
const LABEL_SERVER_KEY: &[u8] = b"ssock s2c key";
const LABEL_SERVER_IV: &[u8] = b"ssock s2c iv";
const LABEL_CLIENT_FINISHED: &[u8] = b"ssock client finished";
const LABEL_SERVER_FINISHED: &[u8] = b"ssock server finished";

/// Context strings prefixed to signed transcript hashes.
pub const SERVER_SIGNATURE_CONTEXT: &[u8] = b"ssock server signature\0";
pub const CLIENT_SIGNATURE_CONTEXT: &[u8] = b"ssock client signature\0";

pub type TranscriptHash = [u8; 32];

/// SHA-256 over the concatenation of `parts`.
pub fn transcript_hash(parts: &[&[u8]]) -> TranscriptHash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Message signed by an endpoint: a context string followed by the transcript hash.
pub fn signed_content(context: &[u8], transcript: &TranscriptHash) -> Vec<u8> {
    let mut out = Vec::with_capacity(context.len() + transcript.len());
    out.extend_from_slice(context);
    out.extend_from_slice(transcript);
    out
}

/// AEAD key and IV for one direction of traffic.
pub struct TrafficKeys {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl Drop for TrafficKeys {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

/// All secrets derived from one key exchange.
pub struct SessionKeys {
    pub client_write: TrafficKeys,
    pub server_write: TrafficKeys,
    pub client_finished: Zeroizing<[u8; 32]>,
    pub server_finished: Zeroizing<[u8; 32]>,
}

/// Derive the session keys from the X25519 shared secret, salted with the
/// hash of the hello messages.
///
/// ```text
/// prk = HKDF-Extract(salt = transcript, ikm = shared)
/// c2s key/iv, s2c key/iv, client/server finished = HKDF-Expand(prk, label)
/// ```
pub fn derive_session_keys(shared: &[u8; 32], transcript: &TranscriptHash) -> Result<SessionKeys, SecurityError> {
    let hk = Hkdf::<Sha256>::new(Some(&transcript[..]), shared);
    let expand = |label: &[u8], out: &mut [u8]| hk.expand(label, out).map_err(|_| SecurityError::InternalError);

    let mut client_write = TrafficKeys {
        key: [0u8; KEY_LEN],
        iv: [0u8; IV_LEN],
    };
    let mut server_write = TrafficKeys {
        key: [0u8; KEY_LEN],
        iv: [0u8; IV_LEN],
    };
    let mut client_finished = Zeroizing::new([0u8; 32]);
    let mut server_finished = Zeroizing::new([0u8; 32]);

    expand(LABEL_CLIENT_KEY, &mut client_write.key)?;
    expand(LABEL_CLIENT_IV, &mut client_write.iv)?;
    expand(LABEL_SERVER_KEY, &mut server_write.key)?;
    expand(LABEL_SERVER_IV, &mut server_write.iv)?;
    expand(LABEL_CLIENT_FINISHED, &mut client_finished[..])?;
    expand(LABEL_SERVER_FINISHED, &mut server_finished[..])?;

    Ok(SessionKeys {
        client_write,
        server_write,
        client_finished,
        server_finished,
    })
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub fn finished_mac(key: &[u8; 32], parts: &[&[u8]]) -> Result<[u8; MAC_LEN], SecurityError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| SecurityError::InternalError)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time comparison of two finished MACs.
pub fn mac_matches(expected: &[u8; MAC_LEN], received: &[u8; MAC_LEN]) -> bool {
    expected[..].ct_eq(&received[..]).into()
}

/// Build the per-record nonce by XOR-ing the IV with the zero-padded
/// sequence number.
fn build_nonce(iv: &[u8; IV_LEN], seq: u64) -> [u8; IV_LEN] {
    let mut nonce = [0u8; IV_LEN];
    nonce[4..].copy_from_slice(&seq.to_be_bytes());
    for (n, i) in nonce.iter_mut().zip(iv) {
        *n ^= i;
    }
    nonce
}

/// AEAD state for one traffic direction: cipher, IV and sequence number.
pub struct RecordCipher {
    aead: Aes256Gcm,
    iv: [u8; IV_LEN],
    seq: u64,
}

impl Drop for RecordCipher {
    fn drop(&mut self) {
        self.iv.zeroize();
    }
}

impl RecordCipher {
    pub fn new(keys: &TrafficKeys) -> Result<Self, SecurityError> {
        let aead = Aes256Gcm::new_from_slice(&keys.key).map_err(|_| SecurityError::InternalError)?;
        Ok(Self {
            aead,
            iv: keys.iv,
            seq: 0,
        })
    }

    pub fn sequence(&self) -> u64 {
        self.seq
    }

    fn next_nonce(&mut self) -> Result<[u8; IV_LEN], SecurityError> {
        let nonce = build_nonce(&self.iv, self.seq);
        self.seq = self.seq.checked_add(1).ok_or(SecurityError::InternalError)?;
        Ok(nonce)
    }

    /// Encrypt `payload` in place. The header is authenticated as AAD.
    pub fn seal(
        &mut self,
        header: &[u8; RECORD_HEADER_LEN],
        payload: &mut [u8],
    ) -> Result<[u8; TAG_LEN], SecurityError> {
        let nonce = self.next_nonce()?;
        let tag = self
            .aead
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), header, payload)
            .map_err(|_| SecurityError::InternalError)?;
        Ok(tag.into())
    }

    /// Decrypt `payload` in place, checking `tag` and the header.
    ///
    /// The sequence number advances even on failure; a failed record is
    /// fatal to the context anyway.
    pub fn open(&mut self, header: &[u8], payload: &mut [u8], tag: &[u8]) -> Result<(), SecurityError> {
        if tag.len() != TAG_LEN {
            return Err(SecurityError::MessageAltered);
        }
        let nonce = self.next_nonce()?;
        self.aead
            .decrypt_in_place_detached(Nonce::from_slice(&nonce), header, payload, Tag::from_slice(tag))
            .map_err(|_| SecurityError::MessageAltered)
    }
}
