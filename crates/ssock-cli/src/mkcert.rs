//! Certificate and credential container generation.

use std::fs;
use std::path::Path;

use ssock_stream::{CertifiedKey, CredentialContainer};

pub struct MkcertOptions<'a> {
    pub subject: &'a str,
    pub output: &'a str,
    pub pass: &'a str,
    pub ca: bool,
    pub issuer: Option<&'a str>,
    pub issuer_pass: Option<&'a str>,
    pub cert_out: Option<&'a str>,
    pub iterations: u32,
}

pub fn run(opts: &MkcertOptions<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let mut container = CredentialContainer::new();
    let key = match opts.issuer {
        Some(path) => {
            let issuer = CredentialContainer::load(Path::new(path), opts.issuer_pass.unwrap_or(opts.pass))
                .map_err(|e| format!("cannot open issuer '{path}': {e}"))?
                .authority()?;
            let key = issuer.issue(opts.subject, opts.ca)?;
            container.push_identity(&key);
            container.push_certificate(issuer.certificate().clone());
            key
        }
        None => {
            let key = CertifiedKey::self_signed(opts.subject, opts.ca)?;
            container.push_identity(&key);
            key
        }
    };

    container.save_with_iterations(Path::new(opts.output), opts.pass, opts.iterations)?;
    if let Some(path) = opts.cert_out {
        fs::write(path, key.certificate().to_pem())?;
    }

    let cert = key.certificate();
    eprintln!("Wrote {}", opts.output);
    eprintln!("  Subject:     {}", cert.subject());
    eprintln!("  Issuer:      {}", cert.issuer());
    eprintln!("  CA:          {}", cert.is_ca());
    eprintln!("  Fingerprint: {}", cert.fingerprint());
    Ok(())
}
