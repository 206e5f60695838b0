//! Passphrase-sealed credential containers.
//!
//! A container file is a JSON envelope:
//!
//! ```json
//! { "version": 1, "iterations": 100000, "salt": "..", "nonce": "..", "sealed": ".." }
//! ```
//!
//! `sealed` is the AES-256-GCM encryption of the certificate list under a
//! key derived with PBKDF2-HMAC-SHA256 from the passphrase. All binary
//! fields are hex encoded.

use std::fs;
use std::io;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use ssock_types::SessionError;

use super::{Certificate, CertifiedKey};

const CONTAINER_VERSION: u32 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const AAD_LABEL: &[u8] = b"ssock credential container";

/// PBKDF2 iteration count used by [`CredentialContainer::seal`].
pub const DEFAULT_ITERATIONS: u32 = 100_000;

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    iterations: u32,
    salt: String,
    nonce: String,
    sealed: String,
}

#[derive(Serialize, Deserialize)]
struct Entry {
    certificate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_key: Option<String>,
}

impl Drop for Entry {
    fn drop(&mut self) {
        if let Some(key) = self.private_key.as_mut() {
            key.zeroize();
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Contents {
    entries: Vec<Entry>,
}

struct ContainerEntry {
    certificate: Certificate,
    seed: Option<Zeroizing<[u8; 32]>>,
}

/// A decrypted set of certificates, some with private keys.
#[derive(Default)]
pub struct CredentialContainer {
    entries: Vec<ContainerEntry>,
}

fn invalid(msg: impl Into<String>) -> SessionError {
    SessionError::CertificateInvalid(msg.into())
}

fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut key[..]);
    key
}

fn aad(iterations: u32) -> Vec<u8> {
    let mut out = AAD_LABEL.to_vec();
    out.extend_from_slice(&CONTAINER_VERSION.to_be_bytes());
    out.extend_from_slice(&iterations.to_be_bytes());
    out
}

impl CredentialContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a certificate together with its private key.
    pub fn push_identity(&mut self, key: &CertifiedKey) {
        self.entries.push(ContainerEntry {
            certificate: key.certificate().clone(),
            seed: Some(key.seed()),
        });
    }

    /// Add a certificate without a key (typically an issuing CA).
    pub fn push_certificate(&mut self, certificate: Certificate) {
        self.entries.push(ContainerEntry {
            certificate,
            seed: None,
        });
    }

    pub fn certificates(&self) -> impl Iterator<Item = &Certificate> {
        self.entries.iter().map(|e| &e.certificate)
    }

    /// The first end-entity certificate that carries a private key.
    pub fn leaf(&self) -> Result<CertifiedKey, SessionError> {
        let entry = self
            .entries
            .iter()
            .find(|e| !e.certificate.is_ca() && e.seed.is_some())
            .ok_or_else(|| {
                SessionError::CertificateNotFound("container holds no end-entity certificate with a key".into())
            })?;
        match entry.seed.as_ref() {
            Some(seed) => CertifiedKey::from_parts(entry.certificate.clone(), seed),
            None => Err(invalid("container entry lost its key")),
        }
    }

    /// The first CA certificate that carries a private key, for issuing.
    pub fn authority(&self) -> Result<CertifiedKey, SessionError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.certificate.is_ca() && e.seed.is_some())
            .ok_or_else(|| SessionError::CertificateNotFound("container holds no CA certificate with a key".into()))?;
        match entry.seed.as_ref() {
            Some(seed) => CertifiedKey::from_parts(entry.certificate.clone(), seed),
            None => Err(invalid("container entry lost its key")),
        }
    }

    pub fn seal(&self, passphrase: &str) -> Result<Vec<u8>, SessionError> {
        self.seal_with_iterations(passphrase, DEFAULT_ITERATIONS)
    }

    pub fn seal_with_iterations(&self, passphrase: &str, iterations: u32) -> Result<Vec<u8>, SessionError> {
        if iterations == 0 {
            return Err(invalid("iteration count must be positive"));
        }
        let contents = Contents {
            entries: self
                .entries
                .iter()
                .map(|e| Entry {
                    certificate: hex::encode(e.certificate.to_bytes()),
                    private_key: e.seed.as_ref().map(|s| hex::encode(&s[..])),
                })
                .collect(),
        };
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&contents).map_err(|e| invalid(format!("encoding container: {e}")))?,
        );

        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let key = derive_key(passphrase, &salt, iterations);
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| invalid("bad container key length"))?;
        let aad = aad(iterations);
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| invalid("sealing container failed"))?;

        let envelope = Envelope {
            version: CONTAINER_VERSION,
            iterations,
            salt: hex::encode(salt),
            nonce: hex::encode(nonce),
            sealed: hex::encode(sealed),
        };
        serde_json::to_vec_pretty(&envelope).map_err(|e| invalid(format!("encoding envelope: {e}")))
    }

    /// Decrypt a sealed container. A wrong passphrase and a corrupted file
    /// are indistinguishable and both report `CertificateInvalid`.
    pub fn unseal(data: &[u8], passphrase: &str) -> Result<Self, SessionError> {
        let envelope: Envelope =
            serde_json::from_slice(data).map_err(|e| invalid(format!("malformed container: {e}")))?;
        if envelope.version != CONTAINER_VERSION {
            return Err(invalid(format!("unsupported container version {}", envelope.version)));
        }
        if envelope.iterations == 0 {
            return Err(invalid("iteration count must be positive"));
        }
        let salt = hex::decode(&envelope.salt).map_err(|_| invalid("malformed salt"))?;
        let nonce = hex::decode(&envelope.nonce).map_err(|_| invalid("malformed nonce"))?;
        let sealed = hex::decode(&envelope.sealed).map_err(|_| invalid("malformed payload"))?;
        if salt.len() != SALT_LEN || nonce.len() != NONCE_LEN {
            return Err(invalid("bad salt or nonce length"));
        }

        let key = derive_key(passphrase, &salt, envelope.iterations);
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| invalid("bad container key length"))?;
        let aad = aad(envelope.iterations);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &sealed,
                        aad: &aad,
                    },
                )
                .map_err(|_| invalid("wrong passphrase or corrupted container"))?,
        );

        let contents: Contents =
            serde_json::from_slice(&plaintext).map_err(|e| invalid(format!("malformed contents: {e}")))?;
        let mut container = Self::new();
        for entry in &contents.entries {
            let der = hex::decode(&entry.certificate).map_err(|_| invalid("malformed certificate entry"))?;
            let certificate = Certificate::from_bytes(&der)?;
            let seed = match entry.private_key.as_deref() {
                None => None,
                Some(text) => {
                    let raw = Zeroizing::new(hex::decode(text).map_err(|_| invalid("malformed key entry"))?);
                    let seed: [u8; 32] = raw[..].try_into().map_err(|_| invalid("bad private key length"))?;
                    Some(Zeroizing::new(seed))
                }
            };
            container.entries.push(ContainerEntry { certificate, seed });
        }
        Ok(container)
    }

    pub fn save(&self, path: &Path, passphrase: &str) -> Result<(), SessionError> {
        self.save_with_iterations(path, passphrase, DEFAULT_ITERATIONS)
    }

    pub fn save_with_iterations(&self, path: &Path, passphrase: &str, iterations: u32) -> Result<(), SessionError> {
        let sealed = self.seal_with_iterations(passphrase, iterations)?;
        fs::write(path, sealed).map_err(SessionError::Io)
    }

    /// Read and decrypt a container file.
    pub fn load(path: &Path, passphrase: &str) -> Result<Self, SessionError> {
        let data = fs::read(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                SessionError::CertificateNotFound(format!("{}: no such container", path.display()))
            }
            _ => SessionError::CertificateNotFound(format!("{}: {e}", path.display())),
        })?;
        Self::unseal(&data, passphrase)
    }

    /// Read a container file and return its end-entity identity.
    pub fn open(path: &Path, passphrase: &str) -> Result<CertifiedKey, SessionError> {
        Self::load(path, passphrase)?.leaf()
    }
}
