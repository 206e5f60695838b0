//! Certificates, signing identities and identity resolution.

pub mod container;
mod pem;
pub mod store;

use std::fmt;
use std::path::PathBuf;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use ssock_types::SessionError;

pub use container::CredentialContainer;
pub use store::CertificateStore;

const CERT_VERSION: u8 = 1;
const FLAG_CA: u8 = 0x01;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
/// Subject and issuer names are length-prefixed with a `u16`.
pub const MAX_NAME_LEN: usize = u16::MAX as usize;

const PEM_LABEL: &str = "SSOCK CERTIFICATE";

/// A signed binding between a subject name and an Ed25519 public key.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    subject: String,
    issuer: String,
    is_ca: bool,
    public_key: [u8; PUBLIC_KEY_LEN],
    signature: [u8; SIGNATURE_LEN],
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("is_ca", &self.is_ca)
            .field("public_key", &hex::encode(&self.public_key[..8]))
            .finish_non_exhaustive()
    }
}

impl Certificate {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public_key
    }

    /// SHA-256 fingerprint of the encoded certificate, hex encoded.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(self.to_bytes()))
    }

    /// Case-insensitive substring match against the subject.
    pub fn subject_contains(&self, pattern: &str) -> bool {
        self.subject
            .to_ascii_lowercase()
            .contains(&pattern.to_ascii_lowercase())
    }

    /// Verify a signature made by this certificate's key.
    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_LEN]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.public_key) else {
            return false;
        };
        key.verify(message, &Signature::from_bytes(signature)).is_ok()
    }

    /// Whether `issuer` is a CA whose key signed this certificate.
    pub fn is_issued_by(&self, issuer: &Certificate) -> bool {
        issuer.is_ca && issuer.subject == self.issuer && issuer.verify(&self.tbs_bytes(), &self.signature)
    }

    pub fn is_self_signed(&self) -> bool {
        self.issuer == self.subject && self.verify(&self.tbs_bytes(), &self.signature)
    }

    /// The signed portion: everything but the signature.
    fn tbs_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.subject.len() + self.issuer.len() + PUBLIC_KEY_LEN);
        out.push(CERT_VERSION);
        out.push(if self.is_ca { FLAG_CA } else { 0 });
        // Construction and decoding both cap names at MAX_NAME_LEN.
        out.extend_from_slice(&(self.subject.len() as u16).to_be_bytes());
        out.extend_from_slice(self.subject.as_bytes());
        out.extend_from_slice(&(self.issuer.len() as u16).to_be_bytes());
        out.extend_from_slice(self.issuer.as_bytes());
        out.extend_from_slice(&self.public_key);
        out
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.tbs_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    /// Decode a certificate. Trailing bytes are rejected.
    pub fn from_bytes(data: &[u8]) -> Result<Self, SessionError> {
        let err = |msg: &str| SessionError::CertificateInvalid(msg.to_string());
        let mut pos = 0;

        if data.len() < 2 {
            return Err(err("truncated header"));
        }
        if data[0] != CERT_VERSION {
            return Err(err("unsupported certificate version"));
        }
        let flags = data[1];
        if flags & !FLAG_CA != 0 {
            return Err(err("unknown certificate flags"));
        }
        pos += 2;

        let subject = read_name(data, &mut pos).ok_or_else(|| err("bad subject"))?;
        let issuer = read_name(data, &mut pos).ok_or_else(|| err("bad issuer"))?;

        if data.len() != pos + PUBLIC_KEY_LEN + SIGNATURE_LEN {
            return Err(err("bad key or signature length"));
        }
        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        public_key.copy_from_slice(&data[pos..pos + PUBLIC_KEY_LEN]);
        pos += PUBLIC_KEY_LEN;
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&data[pos..]);

        Ok(Self {
            subject,
            issuer,
            is_ca: flags & FLAG_CA != 0,
            public_key,
            signature,
        })
    }

    /// PEM text form used for certificate files.
    pub fn to_pem(&self) -> String {
        pem::encode(PEM_LABEL, &self.to_bytes())
    }

    /// Parse every certificate block in `text`, ignoring other labels.
    pub fn from_pem(text: &str) -> Result<Vec<Self>, SessionError> {
        pem::parse(text, PEM_LABEL)?
            .iter()
            .map(|der| Self::from_bytes(der))
            .collect()
    }
}

fn read_name(data: &[u8], pos: &mut usize) -> Option<String> {
    let len_bytes = data.get(*pos..*pos + 2)?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    let raw = data.get(*pos + 2..*pos + 2 + len)?;
    let name = std::str::from_utf8(raw).ok()?.to_string();
    *pos += 2 + len;
    Some(name)
}

fn check_name(name: &str) -> Result<(), SessionError> {
    if name.len() > MAX_NAME_LEN {
        return Err(SessionError::CertificateInvalid(format!(
            "name of {} bytes exceeds the {MAX_NAME_LEN}-byte limit",
            name.len()
        )));
    }
    Ok(())
}

/// A certificate together with its Ed25519 signing key.
#[derive(Clone)]
pub struct CertifiedKey {
    certificate: Certificate,
    signing_key: SigningKey,
}

impl fmt::Debug for CertifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertifiedKey")
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

impl CertifiedKey {
    /// Generate a fresh key and a certificate signed by itself.
    pub fn self_signed(subject: &str, is_ca: bool) -> Result<Self, SessionError> {
        check_name(subject)?;
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut certificate = Certificate {
            subject: subject.to_string(),
            issuer: subject.to_string(),
            is_ca,
            public_key: signing_key.verifying_key().to_bytes(),
            signature: [0u8; SIGNATURE_LEN],
        };
        certificate.signature = signing_key.sign(&certificate.tbs_bytes()).to_bytes();
        Ok(Self {
            certificate,
            signing_key,
        })
    }

    /// Generate a fresh key and a certificate for `subject` signed by this CA.
    pub fn issue(&self, subject: &str, is_ca: bool) -> Result<Self, SessionError> {
        if !self.certificate.is_ca {
            return Err(SessionError::CertificateInvalid(format!(
                "'{}' is not a CA and cannot issue certificates",
                self.certificate.subject
            )));
        }
        check_name(subject)?;
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut certificate = Certificate {
            subject: subject.to_string(),
            issuer: self.certificate.subject.clone(),
            is_ca,
            public_key: signing_key.verifying_key().to_bytes(),
            signature: [0u8; SIGNATURE_LEN],
        };
        certificate.signature = self.signing_key.sign(&certificate.tbs_bytes()).to_bytes();
        Ok(Self {
            certificate,
            signing_key,
        })
    }

    /// Pair a certificate with the private key seed it was issued for.
    pub fn from_parts(certificate: Certificate, seed: &[u8; 32]) -> Result<Self, SessionError> {
        let signing_key = SigningKey::from_bytes(seed);
        if signing_key.verifying_key().to_bytes() != certificate.public_key {
            return Err(SessionError::CertificateInvalid(format!(
                "private key does not match certificate '{}'",
                certificate.subject
            )));
        }
        Ok(Self {
            certificate,
            signing_key,
        })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }

    pub(crate) fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }
}

/// Where a session's local identity comes from.
#[derive(Clone)]
pub enum Identity {
    /// The first end-entity certificate in the store whose subject contains
    /// this string.
    Subject(String),
    /// A passphrase-sealed credential container file.
    Container {
        path: PathBuf,
        passphrase: Zeroizing<String>,
    },
    /// An in-memory certificate and key.
    Certified(CertifiedKey),
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Subject(subject) => f.debug_tuple("Subject").field(subject).finish(),
            Identity::Container { path, .. } => f
                .debug_struct("Container")
                .field("path", path)
                .field("passphrase", &"<redacted>")
                .finish(),
            Identity::Certified(key) => f
                .debug_tuple("Certified")
                .field(&key.certificate().subject())
                .finish(),
        }
    }
}

impl Identity {
    pub fn container(path: impl Into<PathBuf>, passphrase: &str) -> Self {
        Identity::Container {
            path: path.into(),
            passphrase: Zeroizing::new(passphrase.to_string()),
        }
    }

    /// Resolve to a usable end-entity certificate and key.
    ///
    /// CA certificates are never accepted as a local identity.
    pub fn resolve(&self, store: &CertificateStore) -> Result<CertifiedKey, SessionError> {
        match self {
            Identity::Subject(subject) => store.find_identity(subject).ok_or_else(|| {
                SessionError::CertificateNotFound(format!("no certificate matching subject '{subject}'"))
            }),
            Identity::Container { path, passphrase } => CredentialContainer::open(path, passphrase),
            Identity::Certified(key) if key.certificate().is_ca() => Err(SessionError::CertificateInvalid(
                format!("'{}' is a CA certificate", key.certificate().subject()),
            )),
            Identity::Certified(key) => Ok(key.clone()),
        }
    }
}
