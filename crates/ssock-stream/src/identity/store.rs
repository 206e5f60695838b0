//! In-memory trust anchors and local identities.

use std::fs;
use std::path::Path;

use ssock_types::SessionError;

use super::{Certificate, CertifiedKey};

/// Trusted certificates plus the keyed identities a process may present.
#[derive(Debug, Default, Clone)]
pub struct CertificateStore {
    trusted: Vec<Certificate>,
    identities: Vec<CertifiedKey>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust a CA, or pin an end-entity certificate.
    pub fn add_trusted(&mut self, cert: Certificate) {
        if !self.trusted.contains(&cert) {
            self.trusted.push(cert);
        }
    }

    /// Trust every certificate in an armored certificate file.
    pub fn add_trusted_file(&mut self, path: &Path) -> Result<usize, SessionError> {
        let text = fs::read_to_string(path).map_err(|e| {
            SessionError::CertificateNotFound(format!("{}: {e}", path.display()))
        })?;
        let certs = Certificate::from_pem(&text)?;
        let count = certs.len();
        for cert in certs {
            self.add_trusted(cert);
        }
        Ok(count)
    }

    pub fn add_identity(&mut self, key: CertifiedKey) {
        self.identities.push(key);
    }

    pub fn trusted(&self) -> &[Certificate] {
        &self.trusted
    }

    /// First end-entity identity whose subject contains `subject`.
    pub fn find_identity(&self, subject: &str) -> Option<CertifiedKey> {
        self.identities
            .iter()
            .find(|key| !key.certificate().is_ca() && key.certificate().subject_contains(subject))
            .cloned()
    }

    /// Whether `leaf` is pinned or issued by a trusted CA, and names
    /// `server_name` when one is given.
    pub fn is_trusted(&self, leaf: &Certificate, server_name: Option<&str>) -> bool {
        if leaf.is_ca() {
            return false;
        }
        if let Some(name) = server_name {
            if !leaf.subject().eq_ignore_ascii_case(name) {
                return false;
            }
        }
        self.trusted
            .iter()
            .any(|anchor| anchor == leaf || leaf.is_issued_by(anchor))
    }
}
