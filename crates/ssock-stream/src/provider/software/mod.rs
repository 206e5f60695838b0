//! A self-contained security provider built on RustCrypto and dalek
//! primitives.
//!
//! Handshake (all messages travel in plaintext handshake records):
//!
//! ```text
//! client                                   server
//!   ClientHello(random, x25519 share)  ->
//!                                      <-  ServerHello(random, share, certificate,
//!                                            signature(th1), finished(th1 || sig))
//!   ClientFinished([cert, signature(th2)],
//!                  finished(th2 || core)) ->
//! ```
//!
//! `th1` hashes the ClientHello body and the ServerHello up to the
//! certificate; `th2` extends it with the server's signature and MAC. Keys
//! come from HKDF over the X25519 secret salted with `th1`. The client
//! switches to the new keys once it has sent ClientFinished, the server
//! once it has verified it.

pub mod codec;
pub mod crypto;

use std::fmt;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, trace};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use ssock_types::{SecurityError, SecurityStatus, SessionError};

use self::codec::{
    encode_handshake, encode_record_header, parse_handshake, parse_record_header, ClientAuth,
    ClientFinished, ClientHello, ContentType, HandshakeMessage, HandshakeType, ServerHello,
    ALERT_CLOSE_NOTIFY, ALERT_LEVEL_WARNING, MAC_LEN, MAX_MESSAGE_LEN, RANDOM_LEN,
    RECORD_HEADER_LEN, TAG_LEN,
};
use self::crypto::{
    derive_session_keys, finished_mac, mac_matches, signed_content, transcript_hash, RecordCipher,
    SessionKeys, TranscriptHash, CLIENT_SIGNATURE_CONTEXT, SERVER_SIGNATURE_CONTEXT,
};
use super::{HandshakeStep, SecurityProvider, Unwrapped};
use crate::identity::{Certificate, CertificateStore, CertifiedKey, Identity};
use crate::{RecordSizes, Role};

/// Software implementation of [`SecurityProvider`].
#[derive(Debug, Clone, Default)]
pub struct SoftwareProvider {
    store: Arc<CertificateStore>,
}

impl SoftwareProvider {
    pub fn new(store: CertificateStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// Share one trust store between many providers.
    pub fn with_shared_store(store: Arc<CertificateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }
}

/// Local identity and the peer name a client expects.
pub struct SoftwareCredential {
    identity: Option<CertifiedKey>,
    target: Option<String>,
}

impl fmt::Debug for SoftwareCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareCredential")
            .field("identity", &self.identity.as_ref().map(|k| k.certificate().subject()))
            .field("target", &self.target)
            .finish()
    }
}

enum Pending {
    /// Client sent ClientHello and waits for ServerHello.
    AwaitServerHello {
        secret: EphemeralSecret,
        client_hello: Vec<u8>,
    },
    /// Server sent ServerHello and waits for ClientFinished.
    AwaitClientFinished {
        keys: SessionKeys,
        transcript: TranscriptHash,
    },
}

struct Traffic {
    read: RecordCipher,
    write: RecordCipher,
}

/// Per-connection handshake and record protection state.
pub struct SoftwareContext {
    pending: Option<Pending>,
    traffic: Option<Traffic>,
    peer: Option<Certificate>,
    handshakes: u32,
}

impl fmt::Debug for SoftwareContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareContext")
            .field("established", &self.is_established())
            .field("handshakes", &self.handshakes)
            .field("peer", &self.peer.as_ref().map(Certificate::subject))
            .finish()
    }
}

impl SoftwareContext {
    fn new() -> Self {
        Self {
            pending: None,
            traffic: None,
            peer: None,
            handshakes: 0,
        }
    }

    /// Keys are installed and no handshake is in flight.
    pub fn is_established(&self) -> bool {
        self.pending.is_none() && self.traffic.is_some()
    }

    /// Number of completed handshakes, renegotiations included.
    pub fn handshakes(&self) -> u32 {
        self.handshakes
    }

    fn traffic(&mut self) -> Result<&mut Traffic, SecurityError> {
        self.traffic.as_mut().ok_or(SecurityError::ContextNotEstablished)
    }
}

fn random_bytes() -> [u8; RANDOM_LEN] {
    let mut out = [0u8; RANDOM_LEN];
    OsRng.fill_bytes(&mut out);
    out
}

fn agree(secret: EphemeralSecret, peer_share: [u8; 32]) -> Result<Zeroizing<[u8; 32]>, SecurityError> {
    let shared = secret.diffie_hellman(&PublicKey::from(peer_share));
    // A low-order peer share yields an all-zero secret.
    if shared.as_bytes().iter().all(|b| *b == 0) {
        return Err(SecurityError::IllegalMessage);
    }
    Ok(Zeroizing::new(*shared.as_bytes()))
}

fn peer_leaf(encoded: &[u8]) -> Result<Certificate, SecurityError> {
    let certificate = Certificate::from_bytes(encoded).map_err(|_| SecurityError::BadCertificate)?;
    if certificate.is_ca() {
        return Err(SecurityError::BadCertificate);
    }
    Ok(certificate)
}

/// Seal `payload` into a complete record of `content_type`.
fn seal_record(traffic: &mut Traffic, content_type: ContentType, payload: &[u8]) -> Result<Vec<u8>, SecurityError> {
    if payload.len() > MAX_MESSAGE_LEN {
        return Err(SecurityError::RecordOverflow);
    }
    let header = encode_record_header(content_type, payload.len() + TAG_LEN);
    let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len() + TAG_LEN);
    record.extend_from_slice(&header);
    record.extend_from_slice(payload);
    let tag = traffic.write.seal(&header, &mut record[RECORD_HEADER_LEN..])?;
    record.extend_from_slice(&tag);
    Ok(record)
}

impl SoftwareProvider {
    // -----------------------------------------------------------------------
    // Client
    // -----------------------------------------------------------------------

    fn send_client_hello(&self, ctx: &mut SoftwareContext, extra: usize) -> HandshakeStep {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let hello = ClientHello {
            random: random_bytes(),
            key_share: PublicKey::from(&secret).to_bytes(),
        };
        let body = hello.encode_body();
        let token = encode_handshake(HandshakeType::ClientHello, &body);
        ctx.pending = Some(Pending::AwaitServerHello {
            secret,
            client_hello: body,
        });
        trace!(renegotiation = ctx.traffic.is_some(), "client hello");
        HandshakeStep {
            status: SecurityStatus::ContinueNeeded,
            token: Some(token),
            extra,
        }
    }

    fn advance_client(
        &self,
        credential: &SoftwareCredential,
        context: &mut Option<SoftwareContext>,
        input: &[u8],
    ) -> Result<HandshakeStep, SecurityError> {
        if context.is_none() {
            let ctx = context.insert(SoftwareContext::new());
            return Ok(self.send_client_hello(ctx, input.len()));
        }
        let ctx = context.as_mut().ok_or(SecurityError::InternalError)?;
        if ctx.pending.is_none() && input.is_empty() {
            // Renegotiation initiated locally.
            return Ok(self.send_client_hello(ctx, 0));
        }

        let Some(msg) = parse_handshake(input)? else {
            return Ok(HandshakeStep::incomplete());
        };
        let extra = input.len() - msg.consumed;
        match (ctx.pending.take(), msg.msg_type) {
            (None, HandshakeType::HelloRequest) => {
                debug!("server requested renegotiation");
                Ok(self.send_client_hello(ctx, extra))
            }
            (
                Some(Pending::AwaitServerHello {
                    secret,
                    client_hello,
                }),
                HandshakeType::ServerHello,
            ) => {
                let (status, token) = self.on_server_hello(credential, ctx, secret, &client_hello, &msg)?;
                Ok(HandshakeStep {
                    status,
                    token: Some(token),
                    extra,
                })
            }
            _ => Err(SecurityError::OutOfSequence),
        }
    }

    fn on_server_hello(
        &self,
        credential: &SoftwareCredential,
        ctx: &mut SoftwareContext,
        secret: EphemeralSecret,
        client_hello: &[u8],
        msg: &HandshakeMessage<'_>,
    ) -> Result<(SecurityStatus, Vec<u8>), SecurityError> {
        let hello = ServerHello::decode(msg.body)?;
        let certificate = peer_leaf(&hello.certificate)?;
        let shared = agree(secret, hello.key_share)?;

        let th1 = transcript_hash(&[client_hello, &hello.core()[..]]);
        if !certificate.verify(&signed_content(SERVER_SIGNATURE_CONTEXT, &th1), &hello.signature) {
            return Err(SecurityError::BadSignature);
        }
        let keys = derive_session_keys(&shared, &th1)?;
        let expected = finished_mac(&keys.server_finished, &[&th1, &hello.signature])?;
        if !mac_matches(&expected, &hello.finished) {
            return Err(SecurityError::MessageAltered);
        }
        let th2 = transcript_hash(&[&th1, &hello.signature, &hello.finished]);

        let auth = credential.identity.as_ref().map(|key| ClientAuth {
            certificate: key.certificate().to_bytes(),
            signature: key.sign(&signed_content(CLIENT_SIGNATURE_CONTEXT, &th2)),
        });
        let mut finished = ClientFinished {
            auth,
            finished: [0u8; MAC_LEN],
        };
        finished.finished = finished_mac(&keys.client_finished, &[&th2, &finished.core()])?;
        let token = encode_handshake(HandshakeType::ClientFinished, &finished.encode_body());

        ctx.traffic = Some(Traffic {
            read: RecordCipher::new(&keys.server_write)?,
            write: RecordCipher::new(&keys.client_write)?,
        });
        ctx.handshakes += 1;

        let trusted = self.store.is_trusted(&certificate, credential.target.as_deref());
        debug!(subject = certificate.subject(), trusted, "server authenticated");
        ctx.peer = Some(certificate);
        let status = if trusted {
            SecurityStatus::Ok
        } else {
            SecurityStatus::UntrustedPeer
        };
        Ok((status, token))
    }

    // -----------------------------------------------------------------------
    // Server
    // -----------------------------------------------------------------------

    fn advance_server(
        &self,
        credential: &SoftwareCredential,
        context: &mut Option<SoftwareContext>,
        input: &[u8],
    ) -> Result<HandshakeStep, SecurityError> {
        let Some(msg) = parse_handshake(input)? else {
            return Ok(HandshakeStep::incomplete());
        };
        let extra = input.len() - msg.consumed;
        let pending = context.as_mut().and_then(|ctx| ctx.pending.take());
        match (pending, msg.msg_type) {
            (None, HandshakeType::ClientHello) => {
                let identity = credential.identity.as_ref().ok_or(SecurityError::NoCredentials)?;
                let (pending, token) = self.on_client_hello(identity, &msg)?;
                let ctx = context.get_or_insert_with(SoftwareContext::new);
                ctx.pending = Some(pending);
                Ok(HandshakeStep {
                    status: SecurityStatus::ContinueNeeded,
                    token: Some(token),
                    extra,
                })
            }
            (Some(Pending::AwaitClientFinished { keys, transcript }), HandshakeType::ClientFinished) => {
                let ctx = context.as_mut().ok_or(SecurityError::InternalError)?;
                self.on_client_finished(ctx, &keys, &transcript, &msg)?;
                Ok(HandshakeStep {
                    status: SecurityStatus::Ok,
                    token: None,
                    extra,
                })
            }
            _ => Err(SecurityError::OutOfSequence),
        }
    }

    fn on_client_hello(
        &self,
        identity: &CertifiedKey,
        msg: &HandshakeMessage<'_>,
    ) -> Result<(Pending, Vec<u8>), SecurityError> {
        let client_hello = ClientHello::decode(msg.body)?;
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let mut hello = ServerHello {
            random: random_bytes(),
            key_share: PublicKey::from(&secret).to_bytes(),
            certificate: identity.certificate().to_bytes(),
            signature: [0u8; 64],
            finished: [0u8; MAC_LEN],
        };
        let shared = agree(secret, client_hello.key_share)?;

        let th1 = transcript_hash(&[msg.body, &hello.core()[..]]);
        hello.signature = identity.sign(&signed_content(SERVER_SIGNATURE_CONTEXT, &th1));
        let keys = derive_session_keys(&shared, &th1)?;
        hello.finished = finished_mac(&keys.server_finished, &[&th1, &hello.signature])?;
        let transcript = transcript_hash(&[&th1, &hello.signature, &hello.finished]);

        trace!("server hello");
        let token = encode_handshake(HandshakeType::ServerHello, &hello.encode_body());
        Ok((Pending::AwaitClientFinished { keys, transcript }, token))
    }

    fn on_client_finished(
        &self,
        ctx: &mut SoftwareContext,
        keys: &SessionKeys,
        transcript: &TranscriptHash,
        msg: &HandshakeMessage<'_>,
    ) -> Result<(), SecurityError> {
        let finished = ClientFinished::decode(msg.body)?;
        let expected = finished_mac(&keys.client_finished, &[transcript, &finished.core()])?;
        if !mac_matches(&expected, &finished.finished) {
            return Err(SecurityError::MessageAltered);
        }
        let peer = match &finished.auth {
            None => None,
            Some(auth) => {
                let certificate = peer_leaf(&auth.certificate)?;
                if !certificate.verify(&signed_content(CLIENT_SIGNATURE_CONTEXT, transcript), &auth.signature) {
                    return Err(SecurityError::BadSignature);
                }
                Some(certificate)
            }
        };
        debug!(client = peer.as_ref().map(Certificate::subject), "client finished");

        ctx.traffic = Some(Traffic {
            read: RecordCipher::new(&keys.client_write)?,
            write: RecordCipher::new(&keys.server_write)?,
        });
        ctx.peer = peer;
        ctx.handshakes += 1;
        Ok(())
    }
}

impl SecurityProvider for SoftwareProvider {
    type Credential = SoftwareCredential;
    type Context = SoftwareContext;

    fn acquire_credentials(
        &self,
        role: Role,
        identity: Option<&Identity>,
        target: Option<&str>,
    ) -> Result<SoftwareCredential, SessionError> {
        let identity = match (role, identity) {
            (_, Some(identity)) => Some(identity.resolve(&self.store)?),
            (Role::Server, None) => {
                return Err(SessionError::CertificateNotFound(
                    "a server session requires an identity".into(),
                ))
            }
            (Role::Client, None) => None,
        };
        debug!(
            ?role,
            identity = identity.as_ref().map(|k| k.certificate().subject()),
            "credentials acquired"
        );
        Ok(SoftwareCredential {
            identity,
            target: target.map(str::to_string),
        })
    }

    fn advance_handshake(
        &self,
        role: Role,
        credential: &SoftwareCredential,
        context: &mut Option<SoftwareContext>,
        input: &[u8],
    ) -> Result<HandshakeStep, SecurityError> {
        match role {
            Role::Client => self.advance_client(credential, context, input),
            Role::Server => self.advance_server(credential, context, input),
        }
    }

    fn record_sizes(&self, context: &SoftwareContext) -> Result<RecordSizes, SecurityError> {
        if !context.is_established() {
            return Err(SecurityError::ContextNotEstablished);
        }
        Ok(RecordSizes {
            header: RECORD_HEADER_LEN,
            max_message: MAX_MESSAGE_LEN,
            trailer: TAG_LEN,
        })
    }

    fn wrap(&self, context: &mut SoftwareContext, record: &mut [u8]) -> Result<(), SecurityError> {
        let traffic = context.traffic()?;
        let payload_len = record
            .len()
            .checked_sub(RECORD_HEADER_LEN + TAG_LEN)
            .ok_or(SecurityError::BufferTooSmall)?;
        if payload_len > MAX_MESSAGE_LEN {
            return Err(SecurityError::RecordOverflow);
        }
        let header = encode_record_header(ContentType::ApplicationData, payload_len + TAG_LEN);
        let (head, rest) = record.split_at_mut(RECORD_HEADER_LEN);
        head.copy_from_slice(&header);
        let (payload, trailer) = rest.split_at_mut(payload_len);
        let tag = traffic.write.seal(&header, payload)?;
        trailer.copy_from_slice(&tag);
        Ok(())
    }

    fn unwrap(&self, context: &mut SoftwareContext, buf: &mut [u8]) -> Result<Unwrapped, SecurityError> {
        let Some(header) = parse_record_header(buf)? else {
            return Ok(Unwrapped::incomplete());
        };
        let total = header.record_len();
        if buf.len() < total {
            return Ok(Unwrapped::incomplete());
        }
        if header.content_type == ContentType::Handshake {
            // The new handshake starts at this record.
            return Ok(Unwrapped {
                status: SecurityStatus::Renegotiate,
                data: None,
                extra: buf.len(),
            });
        }
        let extra = buf.len() - total;
        let payload_len = header.length.checked_sub(TAG_LEN).ok_or(SecurityError::MessageAltered)?;

        let traffic = context.traffic()?;
        let (head, rest) = buf.split_at_mut(RECORD_HEADER_LEN);
        let (payload, tail) = rest.split_at_mut(payload_len);
        traffic.read.open(head, payload, &tail[..TAG_LEN])?;

        match header.content_type {
            ContentType::ApplicationData => Ok(Unwrapped {
                status: SecurityStatus::Ok,
                data: Some(RECORD_HEADER_LEN..RECORD_HEADER_LEN + payload_len),
                extra,
            }),
            ContentType::Alert => match *payload {
                [ALERT_LEVEL_WARNING, ALERT_CLOSE_NOTIFY] => Ok(Unwrapped {
                    status: SecurityStatus::ContextExpired,
                    data: None,
                    extra,
                }),
                [_, description] => Err(SecurityError::AlertReceived(description)),
                _ => Err(SecurityError::IllegalMessage),
            },
            ContentType::Handshake => Err(SecurityError::InternalError),
        }
    }

    fn peer_certificate(&self, context: &SoftwareContext) -> Option<Certificate> {
        context.peer.clone()
    }

    fn local_certificate(&self, credential: &SoftwareCredential) -> Option<Certificate> {
        credential.identity.as_ref().map(|key| key.certificate().clone())
    }

    fn close_notify(&self, context: &mut SoftwareContext) -> Result<Vec<u8>, SecurityError> {
        let traffic = context.traffic()?;
        seal_record(traffic, ContentType::Alert, &[ALERT_LEVEL_WARNING, ALERT_CLOSE_NOTIFY])
    }

    fn renegotiation_request(&self, context: &mut SoftwareContext) -> Result<Vec<u8>, SecurityError> {
        if !context.is_established() {
            return Err(SecurityError::ContextNotEstablished);
        }
        Ok(encode_handshake(HandshakeType::HelloRequest, &[]))
    }
}
